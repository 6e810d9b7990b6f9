use shmem_lib::ShmemError;

pub type Result<T> = std::result::Result<T, A2aError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum A2aError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("hidden size {0} is not supported")]
    UnsupportedHidden(usize),
    #[error("num_topk {0} outside [1, {max}]", max = crate::config::NUM_MAX_TOPK)]
    TopkOutOfRange(usize),
    #[error("{num_tokens} tokens exceed the per-rank maximum {max_tokens}")]
    TooManyTokens { num_tokens: usize, max_tokens: usize },
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch { what: &'static str, expected: usize, got: usize },
    #[error("dispatch handle does not match this context")]
    HandleMismatch,
    #[error("transfer engine reported failure")]
    Fabric,
    #[error("{0}")]
    Shmem(#[from] ShmemError),
}
