use quire_watchdog::Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("out of memory while rebuilding the page tree ({items} nodes)")]
    OutOfMemory { items: usize },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("invalid page tree: {0}")]
    InvalidStructure(String),
    #[error("invalid suspect pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("invalid repair configuration: {0}")]
    InvalidConfig(String),
}

impl RepairError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
