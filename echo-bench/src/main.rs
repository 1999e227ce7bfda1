// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Echo State Network Benchmarks
//!
//! Measures, on a synthetic three-class token task:
//! 1. Encoder layouts (reservoir, deep reservoir, linear, embedding only)
//! 2. Closed-form readouts (ridge, nearest centroid)
//! 3. Iterative readouts (logistic + SGD, MLP + Adam)
//! 4. Merging toggles (mean/last pooling vs per-token, uni vs bidirectional)
//!
//! Usage: `echo-bench [--config esn.json] [--sequences N] [--seed S]`
//! Set `RUST_LOG=echo_engine=info` for training logs.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use echo_engine::{
    Adam, Batch, ClosedFormTrainer, CrossEntropyLoss, DeepReadout, DirectionalPooler,
    EchoStateNetwork, EsnConfig, FeaturePipeline, FitOptions, FrozenLinear, LayerMode,
    LogisticRegression, MergingStrategy, NearestCentroid, PoolingStrategy, ReadoutAlgorithm,
    RidgeRegression, Sgd, TokenMatrix,
};

const VOCAB: usize = 64;
const NUM_CLASSES: usize = 3;
const BATCH_SIZE: usize = 16;

/// Synthetic end-to-end benchmarks for the Echo State Network engine.
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(version, about, long_about = None)]
struct Args {
    /// ESN config (JSON); defaults to a classic reservoir over a 64-token vocabulary
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of training sequences; a third as many are held out for testing
    #[arg(long, default_value_t = 600)]
    sequences: usize,

    /// Seed of the synthetic dataset and the iterative readouts
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let Args { config, sequences, seed } = Args::parse();
    let base = match config {
        Some(path) => EsnConfig::from_json_file(&path)
            .with_context(|| format!("loading ESN config from {}", path.display()))?,
        None => EsnConfig::classic(VOCAB, 16, 128),
    };

    println!("=== Echo State Network Benchmarks ===\n");
    println!(
        "Task: {NUM_CLASSES} classes, vocab {}, {sequences} train sequences, seed {seed}\n",
        base.reservoir.vocab_size
    );

    let train = generate_batches(&base, sequences, seed)?;
    let test = generate_batches(&base, sequences / 3, seed + 1)?;

    println!("=== Encoder Layouts (ridge readout, mean pooling) ===\n");
    let layouts = [
        ("configured encoder", base.clone()),
        ("deep reservoir ×2", deep(&base)),
        ("linear projection", linear(&base)),
        ("embedding only", embedding_only(&base)),
    ];
    for (label, config) in layouts {
        let ridge = Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2));
        run(label, config, ridge, None, &train, &test)?;
    }

    println!("\n=== Merging Toggles (ridge readout) ===\n");
    let merges = [
        ("mean pooling, bidirectional", Some(PoolingStrategy::Mean), true),
        ("last-state pooling", Some(PoolingStrategy::Last), false),
        ("max pooling, bidirectional", Some(PoolingStrategy::Max), true),
        ("per-token states", None, false),
        ("per-token states, bidirectional", None, true),
    ];
    for (label, pooling, bidirectional) in merges {
        let config = base.clone().with_pooling(pooling).with_bidirectional(bidirectional);
        let ridge = Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2));
        run(label, config, ridge, None, &train, &test)?;
    }

    println!("\n=== Readouts (configured merging) ===\n");
    let dim = base.feature_dim(0);
    run(
        "nearest centroid",
        base.clone(),
        Box::new(NearestCentroid::new(NUM_CLASSES)),
        None,
        &train,
        &test,
    )?;
    run(
        "nearest centroid, per-token votes",
        base.clone().with_pooling(None),
        Box::new(NearestCentroid::new(NUM_CLASSES)),
        None,
        &train,
        &test,
    )?;
    run(
        "logistic + sgd",
        base.clone(),
        Box::new(LogisticRegression::new(dim, NUM_CLASSES, seed)),
        Some(Iterative::Sgd),
        &train,
        &test,
    )?;
    run(
        "mlp [64] + adam",
        base.clone(),
        Box::new(DeepReadout::new(dim, &[64], NUM_CLASSES, seed)),
        Some(Iterative::Adam),
        &train,
        &test,
    )?;

    println!("\n=== Closed-form export ===\n");
    export_ridge(base, &train, &test)?;

    println!("\n=== All benchmarks complete ===");
    Ok(())
}

// ─── Runs ────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Iterative {
    Sgd,
    Adam,
}

fn run(
    label: &str,
    config: EsnConfig,
    readout: Box<dyn ReadoutAlgorithm>,
    iterative: Option<Iterative>,
    train: &[Batch],
    test: &[Batch],
) -> Result<()> {
    let mut esn = EchoStateNetwork::new(config, readout)
        .with_context(|| format!("building network for '{label}'"))?;
    let mut options = FitOptions::default();
    if let Some(kind) = iterative {
        esn = esn.with_loss(Box::new(CrossEntropyLoss));
        esn = match kind {
            Iterative::Sgd => esn.with_optimizer(Box::new(Sgd::new(0.05).with_momentum(0.9))),
            Iterative::Adam => esn.with_optimizer(Box::new(Adam::new(1e-3))),
        };
        options = FitOptions { epochs: 20, iter_steps: 50 };
    }

    let start = Instant::now();
    let history = esn
        .fit(train, options)
        .with_context(|| format!("training '{label}'"))?;
    let fit_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    let (_, accuracy) = esn.predict(test, false)?;
    let predict_ms = start.elapsed().as_secs_f64() * 1000.0;

    let loss = history
        .as_ref()
        .and_then(|h| h.last())
        .map(|s| format!(", final loss {:.4} @ {}", s.loss, s.iteration))
        .unwrap_or_default();
    println!(
        "  {label:<36} acc {:>5.1}%  fit {fit_ms:>8.1}ms  predict {predict_ms:>7.1}ms  ({} features{loss})",
        accuracy.unwrap_or(0.0),
        esn.feature_dim(0),
    );
    Ok(())
}

/// Train a ridge readout on the network's features, freeze it to JSON and
/// serve it from a fresh network built from the same config.
fn export_ridge(config: EsnConfig, train: &[Batch], test: &[Batch]) -> Result<()> {
    let mut esn = EchoStateNetwork::new(
        config.clone(),
        Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)),
    )?;
    esn.fit(train, FitOptions::default())?;
    let (reference, _) = esn.predict(test, false)?;

    let mut ridge = RidgeRegression::new(NUM_CLASSES, 1e-2);
    let pooler = DirectionalPooler::new(
        MergingStrategy::new(config.pooling, &config.lexicon),
        config.bidirectional,
    );
    ClosedFormTrainer.train(&FeaturePipeline::new(esn.encoder(), &pooler), &mut ridge, train)?;
    let json = ridge.freeze()?.to_json_string()?;

    let frozen = FrozenLinear::from_json_str(&json).context("reloading frozen readout")?;
    let served = EchoStateNetwork::new(config, Box::new(frozen))?;
    let (replayed, accuracy) = served.predict(test, false)?;
    println!(
        "  frozen ridge: {} bytes of JSON, predictions identical: {}, acc {:.1}%",
        json.len(),
        reference == replayed,
        accuracy.unwrap_or(0.0)
    );
    Ok(())
}

fn deep(base: &EsnConfig) -> EsnConfig {
    EsnConfig {
        mode: LayerMode::RecurrentLayer,
        ..base.clone()
    }
    .with_deep(2)
}

fn linear(base: &EsnConfig) -> EsnConfig {
    EsnConfig {
        mode: LayerMode::LinearLayer,
        deep: false,
        ..base.clone()
    }
}

fn embedding_only(base: &EsnConfig) -> EsnConfig {
    EsnConfig {
        mode: LayerMode::NoLayer,
        deep: false,
        ..base.clone()
    }
}

// ─── Data ────────────────────────────────────────

/// Class `c` draws most tokens from its own slice of the vocabulary and the
/// rest uniformly, so single tokens are ambiguous but sequences are not.
///
/// Batches follow the config's wire shape and are padded with its `pad_id`,
/// which never appears as a real token.
fn generate_batches(config: &EsnConfig, n: usize, seed: u64) -> Result<Vec<Batch>> {
    let r = &config.reservoir;
    // Every id except the pad is usable
    let usable = r.vocab_size.saturating_sub(1);
    if usable < NUM_CLASSES {
        bail!(
            "vocabulary of {} leaves {} real tokens, need at least {} for {} classes",
            r.vocab_size,
            usable,
            NUM_CLASSES,
            NUM_CLASSES
        );
    }
    let band = usable / NUM_CLASSES;
    let token = |k: usize| if k >= r.pad_id { k + 1 } else { k };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut batches = Vec::new();
    let mut seqs = Vec::with_capacity(BATCH_SIZE);
    let mut labels = Vec::with_capacity(BATCH_SIZE);

    for i in 0..n {
        let class = rng.gen_range(0..NUM_CLASSES);
        let len = rng.gen_range(4..=20);
        let seq: Vec<usize> = (0..len)
            .map(|_| {
                if rng.gen::<f32>() < 0.7 {
                    token(class * band + rng.gen_range(0..band))
                } else {
                    token(rng.gen_range(0..usable))
                }
            })
            .collect();
        seqs.push(seq);
        labels.push(class as i64);

        if seqs.len() == BATCH_SIZE || i + 1 == n {
            let tokens = TokenMatrix::from_sequences(&seqs, r.pad_id);
            batches.push(Batch::build(
                config.batch_schema,
                tokens,
                Some(labels.drain(..).collect()),
                None,
            ));
            seqs.clear();
        }
    }
    Ok(batches)
}
