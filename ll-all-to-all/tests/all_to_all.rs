//! Multi-rank protocol tests: one thread per rank over a shared world.

use std::sync::Arc;

use half::bf16;
use ll_all_to_all::{
    AllToAllConfig, AllToAllRank, AllToAllWorld, CombineOptions, DispatchOptions,
    DispatchOutput, Phases,
};

fn config(
    num_ranks: usize,
    num_experts: usize,
    num_topk: usize,
    max_tokens: usize,
    node_size: usize,
    pure_ep: bool,
) -> AllToAllConfig {
    AllToAllConfig {
        num_ranks,
        num_experts,
        num_topk,
        hidden: 128,
        max_tokens_per_rank: max_tokens,
        node_size,
        pure_ep,
    }
}

/// Run one closure per rank, each on its own thread, and collect results
/// in rank order.
fn run_world<T: Send>(
    world: &Arc<AllToAllWorld>,
    body: impl Fn(AllToAllRank) -> T + Sync,
) -> Vec<T> {
    logging_lib::try_init_default();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..world.config().num_ranks)
            .map(|rank| {
                let handle = world.rank_handle(rank).unwrap();
                let body = &body;
                s.spawn(move || body(handle))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

fn token_row(seed: usize, hidden: usize) -> Vec<bf16> {
    (0..hidden)
        .map(|j| bf16::from_f32(((seed * 31 + j) as f32 * 0.17).sin()))
        .collect()
}

fn batch(rows: &[usize], hidden: usize) -> Vec<bf16> {
    rows.iter().flat_map(|&seed| token_row(seed, hidden)).collect()
}

/// Identity experts: every received token is handed back unchanged.
fn identity_expert_outputs(cfg: &AllToAllConfig, out: &DispatchOutput) -> Vec<bf16> {
    let mut x =
        vec![bf16::ZERO; cfg.num_local_experts() * cfg.packed_tokens() * cfg.hidden];
    for l in 0..cfg.num_local_experts() {
        for pos in 0..out.count[l] as usize {
            let deq = out.x.dequant_token(l, pos);
            let base = (l * cfg.packed_tokens() + pos) * cfg.hidden;
            for (j, v) in deq.iter().enumerate() {
                x[base + j] = bf16::from_f32(*v);
            }
        }
    }
    x
}

fn pair_num(out: &DispatchOutput, cfg: &AllToAllConfig, local_expert: usize, src: usize) -> usize {
    (out.handle.layout_range[local_expert * cfg.num_ranks + src] >> 32) as usize
}

#[test]
fn s1_two_rank_scatter_and_identity_combine() {
    let cfg = config(2, 4, 1, 4, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();

    let results = run_world(&world, |handle| {
        let rank = handle.rank();
        // Rank 0 routes its tokens to e2 and e3; rank 1 to e2 and e0.
        let (x, topk) = if rank == 0 {
            (batch(&[0, 1], cfg.hidden), vec![2i64, 3])
        } else {
            (batch(&[2, 3], cfg.hidden), vec![2i64, 0])
        };
        let out = handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();

        let expert_x = identity_expert_outputs(&cfg, &out);
        let weights = vec![1.0f32; 2];
        let combined = handle
            .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
            .unwrap()
            .unwrap();
        (x, out, combined)
    });

    let (x0, out0, combined0) = &results[0];
    let (x1, out1, combined1) = &results[1];

    // Rank 0 owns e0/e1 and sees exactly one token, from rank 1 to e0.
    assert_eq!(out0.count, vec![1, 0]);
    assert_eq!(pair_num(out0, &cfg, 0, 0), 0);
    assert_eq!(pair_num(out0, &cfg, 0, 1), 1);
    // Rank 1 owns e2/e3: e2 gets one token from each rank, e3 one from rank 0.
    assert_eq!(out1.count, vec![2, 1]);
    assert_eq!(pair_num(out1, &cfg, 0, 0), 1);
    assert_eq!(pair_num(out1, &cfg, 0, 1), 1);
    assert_eq!(pair_num(out1, &cfg, 1, 0), 1);
    assert_eq!(pair_num(out1, &cfg, 1, 1), 0);

    // The token rank 0 sent to e2 arrived intact, with its source index.
    let begin = (out1.handle.layout_range[0] & 0xffff_ffff) as usize;
    assert_eq!(out1.handle.src_info[begin], 0);
    let got = out1.x.dequant_token(0, begin);
    for (v, want) in got.iter().zip(token_row(0, cfg.hidden)) {
        assert_eq!(*v, want.to_f32());
    }

    // Unit-weight combine returns every input token unchanged.
    assert_eq!(combined0, x0);
    assert_eq!(combined1, x1);
}

#[test]
fn s2_all_padding_topk_yields_zero_counts_and_zero_output() {
    let cfg = config(2, 4, 2, 4, 1, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();

    let results = run_world(&world, |handle| {
        let x = batch(&[10, 11, 12], cfg.hidden);
        let topk = vec![-1i64; 3 * cfg.num_topk];
        let weights = vec![0.5f32; 3 * cfg.num_topk];
        let out = handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();
        let expert_x = identity_expert_outputs(&cfg, &out);
        let combined = handle
            .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
            .unwrap()
            .unwrap();
        (out, combined)
    });

    for (out, combined) in &results {
        assert!(out.count.iter().all(|&n| n == 0));
        assert!(out.handle.layout_range.iter().all(|&r| r == 0));
        assert!(combined.iter().all(|&v| v == bf16::ZERO));
    }
}

#[test]
fn s3_slot_overflow_is_fatal_on_the_sender() {
    let cfg = config(2, 4, 1, 2, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();

    let panics = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let handle = world.rank_handle(rank).unwrap();
                let cfg = &cfg;
                s.spawn(move || {
                    // Three tokens on rank 0 all route to e0; capacity is 2.
                    let (x, topk) = if rank == 0 {
                        (batch(&[0, 1, 2], cfg.hidden), vec![0i64, 0, 0])
                    } else {
                        (batch(&[3], cfg.hidden), vec![-1i64])
                    };
                    let opts =
                        DispatchOptions { phases: Phases::SEND, ..DispatchOptions::default() };
                    let _ = handle.dispatch(&x, &topk, None, opts);
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    });

    let err = panics[0].as_ref().unwrap_err();
    let msg = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap();
    assert!(msg.contains("dispatch slot overflow"), "unexpected panic: {msg}");
    assert!(panics[1].is_ok());
}

#[test]
fn s4_pure_ep_sends_only_from_the_token_owner() {
    let cfg = config(4, 4, 1, 8, 4, true);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();

    let counters = run_world(&world, |handle| {
        // The full replicated batch: six tokens, all padding except token 5,
        // which routes to expert 2 and is owned by rank 5 % 4 = 1.
        let x = batch(&[0, 1, 2, 3, 4, 5], cfg.hidden);
        let mut topk = vec![-1i64; 6];
        topk[5] = 2;
        handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();
        (0..cfg.num_experts).map(|e| handle.dispatch_counter(e)).collect::<Vec<_>>()
    });

    for (rank, counter) in counters.iter().enumerate() {
        let expect: Vec<i32> =
            (0..4).map(|e| if rank == 1 && e == 2 { 1 } else { 0 }).collect();
        assert_eq!(counter, &expect, "rank {rank}");
    }
}

#[test]
fn s5_transport_mix_does_not_change_the_result() {
    let mut outputs = Vec::new();
    for node_size in [1, 2, 4] {
        let cfg = config(4, 8, 2, 6, node_size, false);
        let world = AllToAllWorld::new(cfg.clone()).unwrap();
        let combined = run_world(&world, |handle| {
            let rank = handle.rank();
            let x = batch(&[rank * 10, rank * 10 + 1, rank * 10 + 2], cfg.hidden);
            let topk: Vec<i64> = (0..3 * 2)
                .map(|i| ((rank + i / 2 + (i % 2) * 3) % cfg.num_experts) as i64)
                .collect();
            let weights = vec![0.5f32; 3 * 2];
            let out = handle
                .dispatch(&x, &topk, None, DispatchOptions::default())
                .unwrap()
                .unwrap();
            let expert_x = identity_expert_outputs(&cfg, &out);
            handle
                .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
                .unwrap()
                .unwrap()
        });
        outputs.push(combined);
    }
    assert_eq!(outputs[0], outputs[1], "node_size 1 vs 2");
    assert_eq!(outputs[0], outputs[2], "node_size 1 vs 4");
}

#[test]
fn s6_phase_split_matches_fused_dispatch() {
    let run = |split: bool| {
        let cfg = config(2, 4, 2, 6, 1, false);
        let world = AllToAllWorld::new(cfg.clone()).unwrap();
        run_world(&world, move |handle| {
            let rank = handle.rank();
            let x = batch(&[rank * 5, rank * 5 + 1], cfg.hidden);
            let topk: Vec<i64> =
                (0..2 * 2).map(|i| ((rank * 2 + i) % cfg.num_experts) as i64).collect();
            if split {
                let send =
                    DispatchOptions { phases: Phases::SEND, ..DispatchOptions::default() };
                assert!(handle.dispatch(&x, &topk, None, send).unwrap().is_none());
                let recv =
                    DispatchOptions { phases: Phases::RECV, ..DispatchOptions::default() };
                handle.dispatch(&[], &[], None, recv).unwrap().unwrap()
            } else {
                handle.dispatch(&x, &topk, None, DispatchOptions::default()).unwrap().unwrap()
            }
        })
    };

    let fused = run(false);
    let split = run(true);
    for (a, b) in fused.iter().zip(&split) {
        assert_eq!(a.count, b.count);
        assert_eq!(a.handle.layout_range, b.handle.layout_range);
        assert_eq!(a.handle.src_info, b.handle.src_info);
        for l in 0..2 {
            for pos in 0..a.count[l] as usize {
                assert_eq!(a.x.dequant_token(l, pos), b.x.dequant_token(l, pos));
            }
        }
    }
}

#[test]
fn pure_ep_reduction_replicates_the_combined_batch() {
    let cfg = config(2, 4, 2, 8, 1, true);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();

    let results = run_world(&world, |handle| {
        // Replicated batch of six tokens, each routed to two experts.
        let x = batch(&[7, 8, 9, 10, 11, 12], cfg.hidden);
        let topk: Vec<i64> =
            (0..6 * 2).map(|i| ((i / 2 + (i % 2) * 2) % cfg.num_experts) as i64).collect();
        let weights = vec![0.5f32; 6 * 2];
        let out = handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();
        let expert_x = identity_expert_outputs(&cfg, &out);
        let combined = handle
            .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
            .unwrap()
            .unwrap();
        (x, combined)
    });

    // Identity experts and weights summing to one: every rank reproduces
    // the full input batch.
    for (rank, (x, combined)) in results.iter().enumerate() {
        assert_eq!(combined, x, "rank {rank}");
    }
    assert_eq!(results[0].1, results[1].1);
}

#[test]
fn zero_weights_combine_to_zero() {
    let cfg = config(2, 4, 2, 4, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();
    let results = run_world(&world, |handle| {
        let rank = handle.rank();
        let x = batch(&[rank, rank + 2], cfg.hidden);
        let topk: Vec<i64> = (0..2 * 2).map(|i| (i % cfg.num_experts) as i64).collect();
        let weights = vec![0.0f32; 2 * 2];
        let out = handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();
        let expert_x = identity_expert_outputs(&cfg, &out);
        handle
            .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
            .unwrap()
            .unwrap()
    });
    for combined in results {
        assert!(combined.iter().all(|&v| v == bf16::ZERO));
    }
}

#[test]
fn per_pair_counts_match_sender_counters() {
    let cfg = config(2, 4, 2, 6, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();
    let results = run_world(&world, |handle| {
        let rank = handle.rank();
        let x = batch(&[rank * 4, rank * 4 + 1, rank * 4 + 2], cfg.hidden);
        let topk: Vec<i64> =
            (0..3 * 2).map(|i| ((rank + i) % cfg.num_experts) as i64).collect();
        let out = handle
            .dispatch(&x, &topk, None, DispatchOptions::default())
            .unwrap()
            .unwrap();
        let counters: Vec<i32> =
            (0..cfg.num_experts).map(|e| handle.dispatch_counter(e)).collect();
        (out, counters)
    });

    for expert in 0..cfg.num_experts {
        let owner = cfg.expert_owner(expert);
        let local = cfg.local_expert(expert);
        for src in 0..cfg.num_ranks {
            let sent = results[src].1[expert] as usize;
            assert!(sent <= cfg.max_tokens_per_rank);
            assert_eq!(
                pair_num(&results[owner].0, &cfg, local, src),
                sent,
                "expert {expert} from rank {src}"
            );
        }
    }
}

#[test]
fn recv_stats_accumulate_across_iterations() {
    let cfg = config(2, 4, 1, 4, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();
    let stats = run_world(&world, |handle| {
        let rank = handle.rank();
        let x = batch(&[rank, rank + 7], cfg.hidden);
        let topk: Vec<i64> = vec![(rank as i64 + 1) % 4, 2];
        let mut stats = vec![0i32; cfg.num_local_experts()];
        let mut first_count = Vec::new();
        for iter in 0..2 {
            let out = handle
                .dispatch(&x, &topk, Some(&mut stats), DispatchOptions::default())
                .unwrap()
                .unwrap();
            if iter == 0 {
                first_count = out.count.clone();
            } else {
                assert_eq!(out.count, first_count);
            }
            // Completion balance is reached exactly once per iteration.
            let expert_x = identity_expert_outputs(&cfg, &out);
            let weights = vec![1.0f32; topk.len()];
            handle
                .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
                .unwrap();
            for l in 0..cfg.num_local_experts() {
                assert_eq!(handle.sync_completions(l), 1);
            }
            handle.clean_between_iterations().unwrap();
        }
        (stats, first_count)
    });

    for (stats, count) in stats {
        let doubled: Vec<i32> = count.iter().map(|&n| 2 * n).collect();
        assert_eq!(stats, doubled);
    }
}

#[test]
fn fp8_dispatch_round_trips_within_quantization_error() {
    let cfg = config(2, 4, 2, 4, 2, false);
    for use_ue8m0 in [false, true] {
        let world = AllToAllWorld::new(cfg.clone()).unwrap();
        let results = run_world(&world, |handle| {
            let rank = handle.rank();
            let x = batch(&[rank * 3, rank * 3 + 1], cfg.hidden);
            let topk: Vec<i64> = (0..2 * 2).map(|i| ((rank + i) % 4) as i64).collect();
            let weights = vec![0.5f32; 2 * 2];
            let opts = DispatchOptions {
                use_fp8: true,
                round_scale: true,
                use_ue8m0,
                ..DispatchOptions::default()
            };
            let out = handle.dispatch(&x, &topk, None, opts).unwrap().unwrap();
            let expert_x = identity_expert_outputs(&cfg, &out);
            let combined = handle
                .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
                .unwrap()
                .unwrap();
            (x, combined)
        });
        for (x, combined) in results {
            for (got, want) in combined.iter().zip(&x) {
                let err = (got.to_f32() - want.to_f32()).abs();
                assert!(err <= want.to_f32().abs() * 0.1 + 0.05, "ue8m0={use_ue8m0} err {err}");
            }
        }
    }
}

#[test]
fn zero_copy_combine_matches_staged_combine() {
    let cfg = config(2, 4, 1, 4, 2, false);
    let run = |zero_copy: bool| {
        let world = AllToAllWorld::new(cfg.clone()).unwrap();
        run_world(&world, |mut handle| {
            let rank = handle.rank();
            let x = batch(&[rank * 2, rank * 2 + 1], cfg.hidden);
            let topk: Vec<i64> = vec![(rank % 4) as i64, 3];
            let weights = vec![1.0f32; 2];
            let out = handle
                .dispatch(&x, &topk, None, DispatchOptions::default())
                .unwrap()
                .unwrap();
            let expert_x = identity_expert_outputs(&cfg, &out);
            let opts = CombineOptions { zero_copy, ..CombineOptions::default() };
            if zero_copy {
                handle.combine_send_buffer().copy_from_slice(&expert_x);
                handle.combine(None, &topk, &weights, &out.handle, opts).unwrap().unwrap()
            } else {
                handle
                    .combine(Some(&expert_x), &topk, &weights, &out.handle, opts)
                    .unwrap()
                    .unwrap()
            }
        })
    };
    assert_eq!(run(false), run(true));
}

#[test]
fn cleaner_is_idempotent_and_tolerates_empty_input() {
    let cfg = config(2, 4, 1, 4, 2, false);
    let world = AllToAllWorld::new(cfg.clone()).unwrap();
    let outputs = run_world(&world, |handle| {
        let rank = handle.rank();
        let x = batch(&[rank], cfg.hidden);
        let topk = vec![((rank + 1) % 4) as i64];
        let weights = vec![1.0f32];

        let mut combined = Vec::new();
        for _ in 0..2 {
            let out = handle
                .dispatch(&x, &topk, None, DispatchOptions::default())
                .unwrap()
                .unwrap();
            let expert_x = identity_expert_outputs(&cfg, &out);
            combined = handle
                .combine(Some(&expert_x), &topk, &weights, &out.handle, CombineOptions::default())
                .unwrap()
                .unwrap();
            // No-op clean (empty input), then the real one, twice over.
            handle.clean(&[], false).unwrap();
            handle.clean_between_iterations().unwrap();
            handle.clean_between_iterations().unwrap();
        }
        (x, combined)
    });
    for (x, combined) in outputs {
        assert_eq!(combined, x);
    }
}
