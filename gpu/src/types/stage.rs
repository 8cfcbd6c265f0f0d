use bitflags::bitflags;

bitflags! {
    /// Pipeline stages at which a submission waits on its upstream signals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        /// Host-side work with no device submission.
        const HOST = 1 << 11;
        const ALL_COMMANDS = 1 << 12;
    }
}

impl Default for PipelineStages {
    fn default() -> Self {
        Self::empty()
    }
}
