mod error;
mod heap;
mod spin;
mod team;
mod transfer_engine;
mod worker;

pub use error::{Result, ShmemError};
pub use heap::SymmetricHeap;
pub use spin::{SpinBudget, spin_until};
pub use team::Team;
pub use transfer_engine::TransferEngine;
pub use worker::TransferRequest;
