//! Host-facing API. A world owns the symmetric heap, the transfer engine
//! and the team; each rank drives its kernels through a per-rank handle,
//! typically from its own thread.

use std::sync::Arc;

use half::bf16;
use shmem_lib::{SymmetricHeap, Team, TransferEngine};

use crate::{
    clean,
    codec::{Bf16Codec, Fp8Codec, PackedRecvX, TokenCodec, Ue8m0Codec},
    combine::{self, CombineArgs},
    config::{AllToAllConfig, Phases},
    dispatch::{self, DispatchArgs},
    error::{A2aError, Result},
    kernel::KernelEnv,
    layout::{BufferLayout, Section},
};

pub struct AllToAllWorld {
    cfg: AllToAllConfig,
    layout: BufferLayout,
    heap: Arc<SymmetricHeap>,
    engine: Arc<TransferEngine>,
    team: Team,
}

impl AllToAllWorld {
    pub fn new(cfg: AllToAllConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let layout = BufferLayout::new(&cfg);
        let heap =
            Arc::new(SymmetricHeap::new(cfg.num_ranks, cfg.node_size, layout.total_bytes)?);
        let engine = Arc::new(TransferEngine::new(heap.clone())?);
        let team = Team::new(cfg.num_ranks);
        Ok(Arc::new(Self { cfg, layout, heap, engine, team }))
    }

    pub fn config(&self) -> &AllToAllConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// The per-rank handle. Exactly one handle per rank; each rank's
    /// kernels run on its own thread.
    pub fn rank_handle(self: &Arc<Self>, rank: usize) -> Result<AllToAllRank> {
        if rank >= self.cfg.num_ranks {
            return Err(A2aError::InvalidConfig(format!(
                "rank {rank} outside world of {}",
                self.cfg.num_ranks
            )));
        }
        Ok(AllToAllRank { world: self.clone(), rank })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions {
    pub use_fp8: bool,
    pub round_scale: bool,
    pub use_ue8m0: bool,
    pub phases: Phases,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { use_fp8: false, round_scale: false, use_ue8m0: false, phases: Phases::BOTH }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CombineOptions {
    pub phases: Phases,
    /// The caller already wrote the expert outputs into the send buffer
    /// obtained from [`AllToAllRank::combine_send_buffer`].
    pub zero_copy: bool,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self { phases: Phases::BOTH, zero_copy: false }
    }
}

/// Communication handle tying a combine to the dispatch that produced it.
pub struct DispatchHandle {
    pub src_info: Vec<i32>,
    pub layout_range: Vec<i64>,
    pub num_max_tokens: usize,
    pub hidden: usize,
    pub num_experts: usize,
}

/// Receive-phase results. Only the first `count[l]` positions of each
/// local expert's row in `x` are valid.
pub struct DispatchOutput {
    pub x: PackedRecvX,
    pub count: Vec<i32>,
    pub handle: DispatchHandle,
}

pub struct AllToAllRank {
    world: Arc<AllToAllWorld>,
    rank: usize,
}

impl AllToAllRank {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn config(&self) -> &AllToAllConfig {
        &self.world.cfg
    }

    fn env(&self) -> KernelEnv<'_> {
        KernelEnv {
            cfg: &self.world.cfg,
            layout: &self.world.layout,
            heap: &self.world.heap,
            engine: &self.world.engine,
            team: &self.world.team,
            rank: self.rank,
        }
    }

    /// Scatter this rank's tokens to their experts' owners. Returns the
    /// packed receive tensors when the receive phase runs, `None` for a
    /// SEND-only launch.
    pub fn dispatch(
        &self,
        x: &[bf16],
        topk_idx: &[i64],
        recv_stats: Option<&mut [i32]>,
        opts: DispatchOptions,
    ) -> Result<Option<DispatchOutput>> {
        let cfg = &self.world.cfg;
        let hidden = cfg.hidden;
        if x.len() % hidden != 0 {
            return Err(A2aError::ShapeMismatch {
                what: "x",
                expected: hidden,
                got: x.len() % hidden,
            });
        }
        let num_tokens = x.len() / hidden;
        if num_tokens > cfg.max_tokens_per_rank {
            return Err(A2aError::TooManyTokens {
                num_tokens,
                max_tokens: cfg.max_tokens_per_rank,
            });
        }
        if topk_idx.len() != num_tokens * cfg.num_topk {
            return Err(A2aError::ShapeMismatch {
                what: "topk_idx",
                expected: num_tokens * cfg.num_topk,
                got: topk_idx.len(),
            });
        }
        if topk_idx.iter().any(|&e| e >= cfg.num_experts as i64) {
            return Err(A2aError::InvalidConfig("topk_idx references nonexistent expert".into()));
        }
        if let Some(stats) = recv_stats.as_deref()
            && stats.len() != cfg.num_local_experts()
        {
            return Err(A2aError::ShapeMismatch {
                what: "recv_stats",
                expected: cfg.num_local_experts(),
                got: stats.len(),
            });
        }
        if opts.use_ue8m0 && !(opts.use_fp8 && opts.round_scale) {
            return Err(A2aError::InvalidConfig(
                "use_ue8m0 requires use_fp8 and round_scale".into(),
            ));
        }

        let args = DispatchArgs { x, topk_idx, num_tokens };
        // Launch-time specialization over (fp8, ue8m0); the hidden size was
        // validated against the supported set at construction.
        match (opts.use_fp8, opts.use_ue8m0) {
            (false, _) => self.run_dispatch(&Bf16Codec { hidden }, &args, recv_stats, opts),
            (true, false) => self.run_dispatch(
                &Fp8Codec { hidden, round_scale: opts.round_scale },
                &args,
                recv_stats,
                opts,
            ),
            (true, true) => {
                self.run_dispatch(&Ue8m0Codec { hidden }, &args, recv_stats, opts)
            }
        }
    }

    fn run_dispatch<C: TokenCodec>(
        &self,
        codec: &C,
        args: &DispatchArgs<'_>,
        recv_stats: Option<&mut [i32]>,
        opts: DispatchOptions,
    ) -> Result<Option<DispatchOutput>> {
        let env = self.env();
        if opts.phases.has_send() {
            // The reduction output window is dead once the previous combine
            // copied it out; clearing it here overlaps with the sends.
            let next_clean = Some(self.world.layout.reduce_dst);
            dispatch::dispatch_send(&env, codec, args, next_clean)?;
        }
        let out = if opts.phases.has_recv() {
            let result = dispatch::dispatch_recv(&env, codec, recv_stats)?;
            Some(DispatchOutput {
                x: result.x,
                count: result.count,
                handle: DispatchHandle {
                    src_info: result.src_info,
                    layout_range: result.layout_range,
                    num_max_tokens: self.world.cfg.max_tokens_per_rank,
                    hidden: self.world.cfg.hidden,
                    num_experts: self.world.cfg.num_experts,
                },
            })
        } else {
            None
        };
        if self.world.engine.failed() {
            return Err(A2aError::Fabric);
        }
        Ok(out)
    }

    /// Gather expert outputs back to their tokens' origin ranks. Returns
    /// the combined tokens when the receive phase runs.
    pub fn combine(
        &self,
        x: Option<&[bf16]>,
        topk_idx: &[i64],
        topk_weights: &[f32],
        handle: &DispatchHandle,
        opts: CombineOptions,
    ) -> Result<Option<Vec<bf16>>> {
        let cfg = &self.world.cfg;
        if handle.hidden != cfg.hidden
            || handle.num_experts != cfg.num_experts
            || handle.num_max_tokens != cfg.max_tokens_per_rank
        {
            return Err(A2aError::HandleMismatch);
        }
        if topk_idx.len() != topk_weights.len() || topk_idx.len() % cfg.num_topk != 0 {
            return Err(A2aError::ShapeMismatch {
                what: "topk",
                expected: topk_weights.len(),
                got: topk_idx.len(),
            });
        }
        let num_tokens = topk_idx.len() / cfg.num_topk;
        if num_tokens > cfg.max_tokens_per_rank {
            return Err(A2aError::TooManyTokens {
                num_tokens,
                max_tokens: cfg.max_tokens_per_rank,
            });
        }
        let expert_x_len =
            cfg.num_local_experts() * cfg.packed_tokens() * cfg.hidden;
        if let Some(x) = x
            && x.len() != expert_x_len
        {
            return Err(A2aError::ShapeMismatch {
                what: "expert_x",
                expected: expert_x_len,
                got: x.len(),
            });
        }
        if opts.phases.has_send() && !opts.zero_copy && x.is_none() {
            return Err(A2aError::InvalidConfig(
                "combine send requires expert outputs unless zero_copy is set".into(),
            ));
        }

        let env = self.env();
        let args = CombineArgs {
            topk_idx,
            topk_weights,
            num_tokens,
            src_info: &handle.src_info,
            layout_range: &handle.layout_range,
        };
        if opts.phases.has_send() {
            combine::combine_send(&env, &args, x, opts.zero_copy)?;
        }
        let out = if opts.phases.has_recv() {
            Some(combine::combine_recv(&env, &args)?)
        } else {
            None
        };
        if self.world.engine.failed() {
            return Err(A2aError::Fabric);
        }
        Ok(out)
    }

    /// Barrier-zero-barrier over the given regions of this rank's symmetric
    /// buffer. Collective: every rank must call with the same arguments.
    /// A call with no regions and `clean_sync_info == false` is a no-op.
    pub fn clean(&self, regions: &[Section], clean_sync_info: bool) -> Result<()> {
        clean::clean(&self.env(), regions, clean_sync_info)
    }

    /// The standard between-iterations clean: slot counters, combine flags,
    /// the reduction workspaces, and the expert sync cells. The
    /// count-handshake words are consumed by the dispatch receive phase and
    /// must never be cleaned here.
    pub fn clean_between_iterations(&self) -> Result<()> {
        let layout = &self.world.layout;
        self.clean(
            &[layout.counter, layout.recv_flag, layout.reduce_src, layout.reduce_dst],
            true,
        )
    }

    /// Raw combine send buffer, `[num_local_experts][packed_tokens][hidden]`
    /// bf16. Fill it and run combine with `zero_copy` to skip the staging
    /// copy.
    pub fn combine_send_buffer(&mut self) -> &mut [bf16] {
        let layout = &self.world.layout;
        let ptr = self
            .world
            .heap
            .fabric_ptr(self.rank, layout.combine_send_payload.offset, layout.combine_send_payload.len)
            .expect("combine staging is always in bounds");
        // SAFETY: 16-aligned section sized in whole bf16 elements; the
        // staging area is written only by this rank, and `&mut self`
        // serializes access with this rank's own kernel launches.
        unsafe {
            std::slice::from_raw_parts_mut(
                ptr.cast::<bf16>(),
                layout.combine_send_payload.len / 2,
            )
        }
    }

    /// This rank's send-side slot counter for an expert. Load-balance
    /// introspection; valid until the next between-iterations clean.
    pub fn dispatch_counter(&self, expert: usize) -> i32 {
        let layout = &self.world.layout;
        self.world
            .heap
            .atomic_i32(self.rank, layout.counter_offset(expert, self.rank))
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Times this rank's experts reached their expected/received balance;
    /// one per combine per expert in a healthy iteration.
    pub fn sync_completions(&self, local_expert: usize) -> i32 {
        let layout = &self.world.layout;
        let expert = self.rank * self.world.cfg.num_local_experts() + local_expert;
        self.world
            .heap
            .atomic_i32(self.rank, layout.sync_completion_offset(expert))
            .load(std::sync::atomic::Ordering::Acquire)
    }
}
