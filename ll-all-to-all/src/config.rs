use std::{ops::BitOr, sync::OnceLock};

use crate::error::{A2aError, Result};

/// Maximum top-k fanout accepted on the host side.
pub const NUM_MAX_TOPK: usize = 9;

/// Message header size on the wire. The first 4 bytes carry the source
/// token index as a little-endian i32; the remainder is reserved and zero.
pub const HEADER_BYTES: usize = 16;

/// Channels covered by one FP8 scale factor.
pub const SCALE_GROUP: usize = 128;

/// Scale exponents packed into one u32 in UE8M0 mode.
pub const UE8M0_PACK: usize = 4;

/// Hidden sizes the kernels are specialized for.
pub const SUPPORTED_HIDDEN: [usize; 8] = [128, 256, 512, 1024, 2048, 4096, 5120, 7168];

/// Kernel phase selection. Dispatch and combine are manual continuation
/// boundaries: a caller may run `SEND` in one launch and `RECV` in a later
/// one, as long as the buffers are not cleaned in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Phases(u8);

impl Phases {
    pub const SEND: Phases = Phases(1);
    pub const RECV: Phases = Phases(2);
    pub const BOTH: Phases = Phases(3);

    pub fn has_send(self) -> bool {
        self.0 & Self::SEND.0 != 0
    }

    pub fn has_recv(self) -> bool {
        self.0 & Self::RECV.0 != 0
    }
}

impl BitOr for Phases {
    type Output = Phases;

    fn bitor(self, rhs: Phases) -> Phases {
        Phases(self.0 | rhs.0)
    }
}

/// World geometry shared by every rank. All ranks must construct identical
/// configurations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllToAllConfig {
    pub num_ranks: usize,
    pub num_experts: usize,
    pub num_topk: usize,
    pub hidden: usize,
    /// Per-source-rank slot capacity of every receive buffer.
    pub max_tokens_per_rank: usize,
    /// Ranks per node; same-node peers are P2P-mapped.
    pub node_size: usize,
    /// Every rank holds the full token batch and the owner of token `t`
    /// (rank `t % num_ranks`) is the only rank that dispatches it.
    pub pure_ep: bool,
}

impl AllToAllConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_ranks == 0 {
            return Err(A2aError::InvalidConfig("num_ranks must be positive".into()));
        }
        if self.num_experts == 0 || self.num_experts % self.num_ranks != 0 {
            return Err(A2aError::InvalidConfig(format!(
                "num_experts {} must be a positive multiple of num_ranks {}",
                self.num_experts, self.num_ranks
            )));
        }
        if !SUPPORTED_HIDDEN.contains(&self.hidden) {
            return Err(A2aError::UnsupportedHidden(self.hidden));
        }
        if self.num_topk == 0 || self.num_topk > NUM_MAX_TOPK {
            return Err(A2aError::TopkOutOfRange(self.num_topk));
        }
        if self.max_tokens_per_rank == 0 {
            return Err(A2aError::InvalidConfig("max_tokens_per_rank must be positive".into()));
        }
        if self.node_size == 0 || self.num_ranks % self.node_size != 0 {
            return Err(A2aError::InvalidConfig(format!(
                "node_size {} must divide num_ranks {}",
                self.node_size, self.num_ranks
            )));
        }
        Ok(())
    }

    pub fn num_local_experts(&self) -> usize {
        self.num_experts / self.num_ranks
    }

    pub fn expert_owner(&self, expert: usize) -> usize {
        expert / self.num_local_experts()
    }

    pub fn local_expert(&self, expert: usize) -> usize {
        expert % self.num_local_experts()
    }

    /// Tokens per local expert in the packed receive layout.
    pub fn packed_tokens(&self) -> usize {
        self.num_ranks * self.max_tokens_per_rank
    }

    /// Owner of a token in pure-EP mode.
    pub fn token_owner(&self, token_idx: usize) -> usize {
        token_idx % self.num_ranks
    }
}

fn env_flag(name: &'static str, cell: &'static OnceLock<bool>) -> bool {
    *cell.get_or_init(|| {
        std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0" && v != "false")
    })
}

/// Elide the post-send grid sync. Single-node debugging only.
pub fn skip_grid_sync() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    env_flag("DEEPEP_SKIP_GRID_SYNC", &CELL)
}

/// Enable chatty in-kernel diagnostics.
pub fn verbose_debug() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    env_flag("DEEPEP_VERBOSE_DEBUG", &CELL)
}

/// Enable the token-drop detector. The scan is quadratic in the worst
/// case, so it is opt-in.
pub fn check_token_drop() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    env_flag("DEEPEP_CHECK_TOKEN_DROP", &CELL)
}
