//! Combine kernel: return expert outputs to the tokens' origin ranks,
//! weighted by the top-k weights and reduced across contributing experts.
//!
//! The send side walks `layout_range` per (owned expert, origin rank)
//! pair and writes each output into the origin's combine receive buffer,
//! which mirrors the dispatch layout: slot `(local_expert, owner, i)` on
//! the origin corresponds to dispatch slot `(local_expert, origin, i)` on
//! the owner. A single flag increment per pair is the only receive signal.
//!
//! In pure-EP mode the locally accumulated weighted sum is only one term
//! of the global answer; the rest is produced by the world-wide f32 sum
//! reduction over the staged workspace.

use std::sync::atomic::{Ordering, fence};

use half::bf16;
use tracing::error;

use crate::{
    codec,
    config::HEADER_BYTES,
    error::Result,
    kernel::{KernelEnv, unpack_layout_range},
};

pub(crate) struct CombineArgs<'a> {
    pub topk_idx: &'a [i64],
    pub topk_weights: &'a [f32],
    pub num_tokens: usize,
    pub src_info: &'a [i32],
    pub layout_range: &'a [i64],
}

pub(crate) fn combine_send(
    env: &KernelEnv<'_>,
    args: &CombineArgs<'_>,
    x: Option<&[bf16]>,
    zero_copy: bool,
) -> Result<()> {
    let cfg = env.cfg;
    let layout = env.layout;
    let transport = env.transport();
    let num_local = cfg.num_local_experts();
    let num_ranks = cfg.num_ranks;
    let packed_tokens = cfg.packed_tokens();
    let hidden = cfg.hidden;

    // Stage the expert outputs unless the caller already wrote them into
    // the send buffer.
    if !zero_copy {
        let x = x.expect("combine: expert outputs required unless zero_copy is set");
        let staging = env.own_bytes_mut(
            layout.combine_send_payload.offset,
            layout.combine_send_payload.len,
        )?;
        for (chunk, v) in staging.chunks_exact_mut(2).zip(x) {
            chunk.copy_from_slice(&v.to_bits().to_le_bytes());
        }
    }

    for local_expert in 0..num_local {
        let expert = env.rank * num_local + local_expert;
        for origin in 0..num_ranks {
            let (num, begin) =
                unpack_layout_range(args.layout_range[local_expert * num_ranks + origin]);
            if num == 0 {
                continue;
            }
            for i in 0..num {
                let pos = begin + i;
                let src_idx = args.src_info[local_expert * packed_tokens + pos];
                let header =
                    env.own_bytes_mut(layout.combine_header_offset(local_expert, pos), HEADER_BYTES)?;
                codec::write_header(header, src_idx);

                // Header first, then the payload; the trailing flag atomic
                // orders both for the receiver.
                let slot = layout.combine_recv_slot_offset(local_expert, env.rank, i);
                transport.put(
                    layout.combine_header_offset(local_expert, pos),
                    origin,
                    slot,
                    HEADER_BYTES,
                )?;
                transport.put(
                    layout.combine_payload_offset(local_expert, pos),
                    origin,
                    slot + HEADER_BYTES,
                    2 * hidden,
                )?;
            }
            transport.atomic_add(origin, layout.flag_offset(expert), 1)?;
        }
    }
    Ok(())
}

pub(crate) fn combine_recv(
    env: &KernelEnv<'_>,
    args: &CombineArgs<'_>,
) -> Result<Vec<bf16>> {
    let cfg = env.cfg;
    let layout = env.layout;
    let num_local = cfg.num_local_experts();
    let hidden = cfg.hidden;

    // Wait for every expert this rank dispatched tokens to; the flag is
    // posted after that expert's last payload for us.
    for expert in 0..cfg.num_experts {
        let sent = env
            .heap
            .atomic_i32(env.rank, layout.counter_offset(expert, env.rank))
            .load(Ordering::Acquire);
        if sent > 0
            && env.poll_i32(layout.flag_offset(expert), |v| v > 0).is_none()
        {
            panic!(
                "combine receive: rank {} spin budget exhausted waiting for \
                 expert {expert}'s returning tokens",
                env.rank
            );
        }
    }

    // Auxiliary barrier: all dispatch traffic into this rank's experts has
    // drained before their outputs are read back.
    for local_expert in 0..num_local {
        let expert = env.rank * num_local + local_expert;
        let received = layout.sync_total_received_offset(expert);
        let expected = env
            .heap
            .atomic_i32(env.rank, layout.sync_total_expected_offset(expert))
            .load(Ordering::Acquire);
        if env.poll_i32(received, |v| v >= expected).is_none() {
            panic!(
                "combine receive: rank {} spin budget exhausted on expert {expert} \
                 sync info ({expected} expected)",
                env.rank
            );
        }
        env.heap
            .atomic_i32(env.rank, layout.sync_completion_offset(expert))
            .fetch_add(1, Ordering::AcqRel);
    }

    env.grid_sync();
    fence(Ordering::SeqCst);

    // The cached top-k width is re-validated after the sync; a corrupted
    // value falls back to the safe minimum but must not desert the
    // remaining sync points, which would deadlock peers.
    let mut num_topk = cfg.num_topk;
    if num_topk == 0 || num_topk > 32 {
        error!(rank = env.rank, num_topk, "combine: top-k width corrupted, forcing 1");
        num_topk = 1;
    }

    let combined = if cfg.pure_ep {
        reduce_pure_ep(env, args, num_topk)?
    } else {
        reduce_local(env, args, num_topk)?
    };

    // Flag reset by grid-wide consensus: every awaited flag has been
    // observed, so an unconditional store cannot lose an arrival.
    env.grid_sync();
    for expert in 0..cfg.num_experts {
        env.heap
            .atomic_i32(env.rank, layout.flag_offset(expert))
            .store(0, Ordering::Release);
    }
    fence(Ordering::SeqCst);

    Ok(combined)
}

/// Mixed-EP reduction: every contribution for this rank's tokens has
/// arrived in the mirrored combine receive buffer; the weighted sum here
/// is the full answer.
fn reduce_local(
    env: &KernelEnv<'_>,
    args: &CombineArgs<'_>,
    num_topk: usize,
) -> Result<Vec<bf16>> {
    let cfg = env.cfg;
    let layout = env.layout;
    let hidden = cfg.hidden;
    let stride = cfg.num_topk;

    let mut combined = vec![bf16::ZERO; args.num_tokens * hidden];
    let mut acc = vec![0f32; hidden];
    for token in 0..args.num_tokens {
        acc.fill(0.0);
        for k in 0..num_topk.min(stride) {
            let expert = args.topk_idx[token * stride + k];
            if expert < 0 {
                continue;
            }
            let expert = expert as usize;
            let weight = args.topk_weights[token * stride + k];
            let local_expert = cfg.local_expert(expert);
            let owner = cfg.expert_owner(expert);
            let sent = env
                .heap
                .atomic_i32(env.rank, layout.counter_offset(expert, env.rank))
                .load(Ordering::Acquire) as usize;

            // Locate the returned slot by matching the header against the
            // token index.
            let mut found = false;
            for slot in 0..sent {
                let msg = env.own_bytes(
                    layout.combine_recv_slot_offset(local_expert, owner, slot),
                    layout.msg_bytes(),
                )?;
                if codec::read_src_index(msg) != token as i32 {
                    continue;
                }
                for (j, chunk) in msg[HEADER_BYTES..HEADER_BYTES + 2 * hidden]
                    .chunks_exact(2)
                    .enumerate()
                {
                    let v = bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]]));
                    acc[j] += weight * v.to_f32();
                }
                found = true;
                break;
            }
            assert!(
                found,
                "combine: rank {} token {token} has no returned output from expert {expert}",
                env.rank
            );
        }
        for (out, &v) in combined[token * hidden..(token + 1) * hidden].iter_mut().zip(&acc) {
            *out = bf16::from_f32(v);
        }
    }
    Ok(combined)
}

/// Pure-EP reduction: accumulate only the experts local to this rank into
/// the f32 workspace, then sum the workspaces across the world and
/// downconvert. Ranks with nothing to contribute still zero their window
/// and enter the collective; it is world-wide.
fn reduce_pure_ep(
    env: &KernelEnv<'_>,
    args: &CombineArgs<'_>,
    num_topk: usize,
) -> Result<Vec<bf16>> {
    let cfg = env.cfg;
    let layout = env.layout;
    let hidden = cfg.hidden;
    let stride = cfg.num_topk;
    let num_local = cfg.num_local_experts();
    let num_ranks = cfg.num_ranks;
    let packed_tokens = cfg.packed_tokens();
    let num_elems = args.num_tokens * hidden;

    env.heap.zero(env.rank, layout.reduce_src.offset, num_elems * 4)?;
    let workspace = {
        let bytes = env.own_bytes_mut(layout.reduce_src.offset, num_elems * 4)?;
        // SAFETY: the section is 16-aligned and sized in whole f32 words.
        unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<f32>(), num_elems)
        }
    };

    for local_expert in 0..num_local {
        let expert = env.rank * num_local + local_expert;
        for origin in 0..num_ranks {
            let (num, begin) =
                unpack_layout_range(args.layout_range[local_expert * num_ranks + origin]);
            for i in 0..num {
                let pos = begin + i;
                let token = args.src_info[local_expert * packed_tokens + pos] as usize;
                assert!(
                    token < args.num_tokens,
                    "combine: rank {} received source index {token} beyond the batch",
                    env.rank
                );
                let weight = (0..num_topk.min(stride))
                    .find(|&k| args.topk_idx[token * stride + k] == expert as i64)
                    .map(|k| args.topk_weights[token * stride + k])
                    .unwrap_or_else(|| {
                        panic!(
                            "combine: rank {} holds a token {token} that never routed \
                             to expert {expert}",
                            env.rank
                        )
                    });
                let payload = env.own_bytes(
                    layout.combine_payload_offset(local_expert, pos),
                    2 * hidden,
                )?;
                for (j, chunk) in payload.chunks_exact(2).enumerate() {
                    let v = bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]]));
                    workspace[token * hidden + j] += weight * v.to_f32();
                }
            }
        }
    }

    env.team.float_sum_reduce(
        env.heap,
        env.rank,
        layout.reduce_src.offset,
        layout.reduce_dst.offset,
        num_elems,
    )?;

    let reduced = env.own_bytes(layout.reduce_dst.offset, num_elems * 4)?;
    // SAFETY: aligned, sized in whole f32 words, quiescent after the
    // collective's closing barrier.
    let reduced =
        unsafe { std::slice::from_raw_parts(reduced.as_ptr().cast::<f32>(), num_elems) };
    Ok(reduced.iter().map(|&v| bf16::from_f32(v)).collect())
}
