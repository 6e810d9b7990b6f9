//! Single-process world driver: runs dispatch / identity experts / combine
//! across rank threads and reports the round-trip error.

use std::time::Instant;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use half::bf16;
use ll_all_to_all::{
    AllToAllConfig, AllToAllWorld, CombineOptions, DispatchOptions,
};
use tracing::info;

#[derive(Debug, Parser)]
struct Opts {
    #[clap(long, default_value_t = 4)]
    ranks: usize,
    #[clap(long, default_value_t = 8)]
    experts: usize,
    #[clap(long, default_value_t = 2)]
    topk: usize,
    #[clap(long, default_value_t = 256)]
    hidden: usize,
    #[clap(long, default_value_t = 16)]
    tokens: usize,
    /// Ranks per node; peers within a node use P2P, others the proxy.
    #[clap(long, default_value_t = 2)]
    node_size: usize,
    #[clap(long, default_value_t = 3)]
    iters: usize,
    #[clap(long)]
    fp8: bool,
    #[clap(long)]
    pure_ep: bool,

    #[clap(flatten)]
    logging: logging_lib::LoggingOpts,
}

fn token_value(rank: usize, token: usize, j: usize) -> bf16 {
    bf16::from_f32(((rank * 131 + token * 17 + j) as f32 * 0.23).sin())
}

fn run_rank(world: &std::sync::Arc<AllToAllWorld>, rank: usize, opts: &Opts) -> Result<f32> {
    let cfg = world.config().clone();
    let mut handle = world.rank_handle(rank)?;
    let hidden = cfg.hidden;
    let num_tokens = opts.tokens;

    // In pure-EP mode every rank holds the same replicated batch.
    let data_rank = if cfg.pure_ep { 0 } else { rank };
    let x: Vec<bf16> = (0..num_tokens * hidden)
        .map(|i| token_value(data_rank, i / hidden, i % hidden))
        .collect();
    let topk_idx: Vec<i64> = (0..num_tokens * cfg.num_topk)
        .map(|i| {
            let token = i / cfg.num_topk;
            let k = i % cfg.num_topk;
            (((data_rank * num_tokens + token) + k) % cfg.num_experts) as i64
        })
        .collect();
    let weights = vec![1.0 / cfg.num_topk as f32; num_tokens * cfg.num_topk];

    let mut max_err = 0f32;
    for iter in 0..opts.iters {
        let start = Instant::now();
        let out = handle
            .dispatch(
                &x,
                &topk_idx,
                None,
                DispatchOptions {
                    use_fp8: opts.fp8,
                    ..DispatchOptions::default()
                },
            )
            .context("dispatch failed")?
            .expect("receive phase was requested");

        // Identity experts: hand every received token straight back.
        let expert_x = handle.combine_send_buffer();
        for l in 0..cfg.num_local_experts() {
            for pos in 0..out.count[l] as usize {
                let deq = out.x.dequant_token(l, pos);
                let base = (l * cfg.packed_tokens() + pos) * hidden;
                for (j, v) in deq.iter().enumerate() {
                    expert_x[base + j] = bf16::from_f32(*v);
                }
            }
        }

        let combined = handle
            .combine(
                None,
                &topk_idx,
                &weights,
                &out.handle,
                CombineOptions { zero_copy: true, ..CombineOptions::default() },
            )
            .context("combine failed")?
            .expect("receive phase was requested");

        for (got, want) in combined.iter().zip(&x) {
            max_err = max_err.max((got.to_f32() - want.to_f32()).abs());
        }
        info!(rank, iter, elapsed = ?start.elapsed(), max_err, "iteration done");

        handle.clean_between_iterations().context("clean failed")?;
    }
    Ok(max_err)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logging_lib::init(&opts.logging)?;

    let cfg = AllToAllConfig {
        num_ranks: opts.ranks,
        num_experts: opts.experts,
        num_topk: opts.topk,
        hidden: opts.hidden,
        max_tokens_per_rank: opts.tokens.max(1),
        node_size: opts.node_size,
        pure_ep: opts.pure_ep,
    };
    let world = AllToAllWorld::new(cfg)?;
    info!(bytes = ll_all_to_all::rdma_size_hint(world.config()), "symmetric region sized");

    let errs: Vec<f32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..opts.ranks)
            .map(|rank| {
                let world = world.clone();
                let opts = &opts;
                s.spawn(move || run_rank(&world, rank, opts))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("rank thread panicked")).collect::<Result<_>>()
    })?;

    let tolerance = if opts.fp8 { 0.2 } else { 0.02 };
    for (rank, err) in errs.iter().enumerate() {
        ensure!(*err <= tolerance, "rank {rank} round-trip error {err} above {tolerance}");
    }
    info!("all ranks round-tripped within tolerance");
    Ok(())
}
