//! Dispatch kernel: scatter every token to the owners of its top-k
//! experts, then hand the receiver a per-pair token count.
//!
//! The send phase encodes each token once into the staging area, reserves
//! a slot per routed expert with the sender-side counter, and writes the
//! message into the owner's receive buffer over P2P or the proxied fabric.
//! After a grid-wide sync the final counter values travel as the signed
//! encoding `-n - 1`, so a receiver can tell "no count yet" (0) from
//! "count arrived with zero tokens" (-1).

use half::bf16;
use smallvec::SmallVec;
use tracing::debug;

use crate::{
    codec::{self, PackedRecvX, TokenCodec},
    config::{self, HEADER_BYTES, NUM_MAX_TOPK},
    error::Result,
    kernel::{KernelEnv, pack_layout_range},
    layout::Section,
};

pub(crate) struct DispatchArgs<'a> {
    pub x: &'a [bf16],
    pub topk_idx: &'a [i64],
    pub num_tokens: usize,
}

/// Tensors produced by the receive phase. `src_info` and `layout_range`
/// become the communication handle consumed by combine.
pub(crate) struct DispatchResult {
    pub x: PackedRecvX,
    pub count: Vec<i32>,
    pub src_info: Vec<i32>,
    pub layout_range: Vec<i64>,
}

pub(crate) fn dispatch_send<C: TokenCodec>(
    env: &KernelEnv<'_>,
    codec: &C,
    args: &DispatchArgs<'_>,
    next_clean: Option<Section>,
) -> Result<()> {
    let cfg = env.cfg;
    let layout = env.layout;
    let transport = env.transport();
    let num_topk = cfg.num_topk;
    let hidden = cfg.hidden;
    let wire_bytes = codec.wire_msg_bytes();

    for token in 0..args.num_tokens {
        let row = &args.x[token * hidden..(token + 1) * hidden];
        let staging =
            env.own_bytes_mut(layout.send_slot_offset(token), wire_bytes)?;
        codec.encode(token as i32, row, staging);

        // In pure-EP mode every rank sees the full batch; only the token's
        // owner performs the sends.
        if cfg.pure_ep && cfg.token_owner(token) != env.rank {
            continue;
        }

        let mut routed: SmallVec<[i64; NUM_MAX_TOPK]> = SmallVec::new();
        for &expert in &args.topk_idx[token * num_topk..(token + 1) * num_topk] {
            if expert < 0 {
                continue;
            }
            assert!(
                (expert as usize) < cfg.num_experts,
                "dispatch: token {token} routed to nonexistent expert {expert} on rank {}",
                env.rank
            );
            if routed.contains(&expert) {
                continue;
            }
            routed.push(expert);

            let expert = expert as usize;
            let slot = env
                .heap
                .atomic_i32(env.rank, layout.counter_offset(expert, env.rank))
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel) as usize;
            assert!(
                slot < cfg.max_tokens_per_rank,
                "dispatch slot overflow: rank {} expert {expert} slot {slot} capacity {}",
                env.rank,
                cfg.max_tokens_per_rank
            );

            let owner = cfg.expert_owner(expert);
            let local_expert = cfg.local_expert(expert);
            transport.put(
                layout.send_slot_offset(token),
                owner,
                layout.recv_slot_offset(local_expert, env.rank, slot),
                wire_bytes,
            )?;
            transport.atomic_add(owner, layout.sync_expected_offset(expert, env.rank), 1)?;
            transport.atomic_add(owner, layout.sync_total_expected_offset(expert), 1)?;
        }
    }

    // Block 0's trailing warp clears the buffer scheduled for the next
    // iteration while the fabric drains.
    if let Some(section) = next_clean {
        env.heap.zero(env.rank, section.offset, section.len)?;
    }

    if config::check_token_drop() {
        token_drop_scan(env, args);
    }

    // No rank may observe a count whose payload has not been posted.
    env.grid_sync_post_send();

    for expert in 0..cfg.num_experts {
        let n = env
            .heap
            .atomic_i32(env.rank, layout.counter_offset(expert, env.rank))
            .load(std::sync::atomic::Ordering::Acquire);
        transport.atomic_add(
            cfg.expert_owner(expert),
            layout.recv_count_offset(cfg.local_expert(expert), env.rank),
            -n - 1,
        )?;
    }

    // Every expected sender has posted its count before any receive begins.
    env.grid_sync();
    Ok(())
}

/// Defensive scan: recompute the per-expert send count from the routing
/// table and compare against the slot counters.
fn token_drop_scan(env: &KernelEnv<'_>, args: &DispatchArgs<'_>) {
    let cfg = env.cfg;
    for expert in 0..cfg.num_experts {
        let mut expect = 0i32;
        for token in 0..args.num_tokens {
            if cfg.pure_ep && cfg.token_owner(token) != env.rank {
                continue;
            }
            let row = &args.topk_idx[token * cfg.num_topk..(token + 1) * cfg.num_topk];
            if row.iter().any(|&e| e == expert as i64) {
                expect += 1;
            }
        }
        let sent = env
            .heap
            .atomic_i32(env.rank, env.layout.counter_offset(expert, env.rank))
            .load(std::sync::atomic::Ordering::Acquire);
        assert!(
            sent == expect,
            "token drop detected on rank {}: expert {expert} sent {sent}, routed {expect}",
            env.rank
        );
    }
}

pub(crate) fn dispatch_recv<C: TokenCodec>(
    env: &KernelEnv<'_>,
    codec: &C,
    mut stats: Option<&mut [i32]>,
) -> Result<DispatchResult> {
    let cfg = env.cfg;
    let layout = env.layout;
    let num_local = cfg.num_local_experts();
    let num_ranks = cfg.num_ranks;
    let packed_tokens = cfg.packed_tokens();

    let mut x = codec.alloc_packed(num_local, packed_tokens);
    let mut src_info = vec![0i32; num_local * packed_tokens];
    let mut layout_range = vec![0i64; num_local * num_ranks];
    let mut cursor = vec![0usize; num_local];

    // One block per (local expert, source rank) pair.
    for block in 0..num_local * num_ranks {
        let local_expert = block / num_ranks;
        let src_rank = block % num_ranks;
        let count_offset = layout.recv_count_offset(local_expert, src_rank);

        let encoded = env.poll_i32(count_offset, |v| v != 0).unwrap_or_else(|| {
            panic!(
                "dispatch receive: rank {} spin budget exhausted waiting for the \
                 count from rank {src_rank} for local expert {local_expert}",
                env.rank
            )
        });
        // Consume the count so the next iteration's atomic-add lands on a
        // zeroed word; this is why the cleaner leaves this buffer alone.
        env.heap
            .atomic_i32(env.rank, count_offset)
            .store(0, std::sync::atomic::Ordering::Release);
        assert!(
            encoded < 0,
            "dispatch receive: corrupted count {encoded} from rank {src_rank} \
             for local expert {local_expert} on rank {}",
            env.rank
        );
        let num = (-encoded - 1) as usize;
        assert!(
            num <= cfg.max_tokens_per_rank,
            "dispatch receive overflow: rank {} got {num} tokens from rank {src_rank} \
             for local expert {local_expert}, capacity {}",
            env.rank,
            cfg.max_tokens_per_rank
        );
        if config::verbose_debug() {
            debug!(
                rank = env.rank,
                local_expert, src_rank, num, "dispatch pair count observed"
            );
        }
        if num == 0 {
            continue;
        }

        let begin = cursor[local_expert];
        cursor[local_expert] += num;
        assert!(
            begin + num <= packed_tokens,
            "packed receive overflow: rank {} local expert {local_expert} needs \
             {} slots, capacity {packed_tokens}",
            env.rank,
            begin + num
        );
        layout_range[local_expert * num_ranks + src_rank] = pack_layout_range(num, begin);

        for i in 0..num {
            let slot = env.own_bytes(
                layout.recv_slot_offset(local_expert, src_rank, i),
                codec.wire_msg_bytes(),
            )?;
            src_info[local_expert * packed_tokens + begin + i] = codec::read_src_index(slot);
            codec.unpack(&slot[HEADER_BYTES..], local_expert, begin + i, &mut x);
        }

        let expert = env.rank * num_local + local_expert;
        env.heap
            .atomic_i32(env.rank, layout.sync_received_offset(expert, src_rank))
            .fetch_add(num as i32, std::sync::atomic::Ordering::AcqRel);
        env.heap
            .atomic_i32(env.rank, layout.sync_total_received_offset(expert))
            .fetch_add(num as i32, std::sync::atomic::Ordering::AcqRel);
        if let Some(stats) = stats.as_deref_mut() {
            stats[local_expert] += num as i32;
        }
    }

    // Fence the receive-side writes for cross-node visibility.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

    let count = cursor.iter().map(|&n| n as i32).collect();
    Ok(DispatchResult { x, count, src_info, layout_range })
}
