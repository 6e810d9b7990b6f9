pub type Result<T> = std::result::Result<T, ShmemError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ShmemError {
    #[error("heap access out of bounds: rank {rank}, offset {offset}, len {len}")]
    OutOfBounds { rank: usize, offset: usize, len: usize },
    #[error("heap offset {offset} not aligned to {align}")]
    Misaligned { offset: usize, align: usize },
    #[error("invalid world: {0}")]
    InvalidWorld(String),
    #[error("transfer worker is not running")]
    WorkerDown,
    #[error("ShmemError: {0}")]
    Custom(&'static str),
}
