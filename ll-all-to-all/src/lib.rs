mod clean;
mod codec;
mod combine;
mod config;
mod context;
mod dispatch;
mod error;
mod kernel;
mod layout;

pub use codec::{PackedData, PackedRecvX, PackedScales};
pub use config::{
    AllToAllConfig, HEADER_BYTES, NUM_MAX_TOPK, Phases, SCALE_GROUP, SUPPORTED_HIDDEN,
};
pub use context::{
    AllToAllRank, AllToAllWorld, CombineOptions, DispatchHandle, DispatchOptions,
    DispatchOutput,
};
pub use error::{A2aError, Result};
pub use layout::{BufferLayout, Section, rdma_size_hint};
