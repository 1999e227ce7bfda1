// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! End-to-end pipeline tests for the Echo State Network
//!
//! Every training/merging/direction/schema combination is driven through
//! `EchoStateNetwork` on a synthetic token-classification task:
//! 1. Row/label alignment with pooling disabled
//! 2. Bidirectional merged widths
//! 3. Closed-form training (ridge, nearest centroid), batch-order invariance
//! 4. Iterative training and loss history cadence
//! 5. Inference-only datasets and unsupported readouts
//!
//! Run with: `cargo test -p echo-engine --test esn_pipeline -- --nocapture`

use echo_engine::{
    Adam, AttributedBatch, Batch, BatchSchema, ClosedFormTrainer, CrossEntropyLoss, DeepReadout,
    DirectionalPooler, EchoStateNetwork, EsnConfig, EsnError, FeaturePipeline, FitOptions,
    FrozenLinear, KeyedBatch, LogisticRegression, MergingStrategy, MseLoss, NearestCentroid,
    PoolingStrategy, ReadoutAlgorithm, RidgeRegression, SequenceEncoder, Sgd, TokenMatrix,
};
use echo_engine::encoder::{Embedding, NoLayer, Reservoir};
use echo_engine::state::reversed_within_lengths;
use ndarray::{array, s, Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// ═══════════════════════════════════════════════════════════
// Synthetic dataset
// ═══════════════════════════════════════════════════════════

const VOCAB: usize = 24;
const NUM_CLASSES: usize = 2;

/// Class 0 draws tokens from 1..12, class 1 from 12..24. Lengths 3..=8.
/// Labels alternate so no batch is single-class.
fn sequences(n: usize, seed: u64) -> (Vec<Vec<usize>>, Vec<i64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut seqs = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let label = (i % NUM_CLASSES) as i64;
        let (lo, hi) = if label == 0 { (1, 12) } else { (12, VOCAB) };
        let len = rng.gen_range(3..=8);
        seqs.push((0..len).map(|_| rng.gen_range(lo..hi)).collect());
        labels.push(label);
    }
    (seqs, labels)
}

fn batches(
    n: usize,
    batch_size: usize,
    seed: u64,
    schema: BatchSchema,
    labelled: bool,
) -> Vec<Batch> {
    let (seqs, labels) = sequences(n, seed);
    seqs.chunks(batch_size)
        .zip(labels.chunks(batch_size))
        .map(|(chunk, chunk_labels)| {
            let tokens = TokenMatrix::from_sequences(chunk, 0);
            let labels = labelled.then(|| Array1::from(chunk_labels.to_vec()));
            Batch::build(schema, tokens, labels, None)
        })
        .collect()
}

fn small_config() -> EsnConfig {
    let mut config = EsnConfig::classic(VOCAB, 8, 48);
    config.reservoir.seed = 7;
    config
}

// ═══════════════════════════════════════════════════════════
// Row / label alignment
// ═══════════════════════════════════════════════════════════

#[test]
fn test_lengths_2_3_no_pooling_gives_five_rows() {
    let encoder = NoLayer::new(Embedding::random(VOCAB, 4, 1));
    let pooler = DirectionalPooler::new(MergingStrategy::new(None, &[]), false);
    let pipeline = FeaturePipeline::new(&encoder, &pooler);

    let tokens = TokenMatrix::from_sequences(&[vec![3, 4], vec![5, 6, 7]], 0);
    let batch: Batch = AttributedBatch::new(tokens).with_labels(array![1, 0]).into();
    let prepared = pipeline.prepare(&batch).unwrap();

    assert_eq!(prepared.features.nrows(), 5);
    assert_eq!(prepared.row_labels, Some(array![1, 1, 0, 0, 0]));
    // Rows follow forward time order, sequence by sequence
    assert_eq!(prepared.features.row(2), encoder.embedding.weights.row(5));
}

#[test]
fn test_unpooled_rows_match_total_tokens() {
    for batch in batches(30, 7, 3, BatchSchema::Attributed, true) {
        let encoder = NoLayer::new(Embedding::random(VOCAB, 4, 1));
        let pooler = DirectionalPooler::new(MergingStrategy::new(None, &[]), false);
        let pipeline = FeaturePipeline::new(&encoder, &pooler);
        let prepared = pipeline.prepare(&batch).unwrap();

        let total: usize = prepared.lengths.iter().sum();
        assert_eq!(prepared.features.nrows(), total);

        let labels = prepared.labels.unwrap();
        let row_labels = prepared.row_labels.unwrap();
        let mut offset = 0;
        for (label, &len) in labels.iter().zip(&prepared.lengths) {
            assert!(row_labels.slice(s![offset..offset + len]).iter().all(|l| l == label));
            offset += len;
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Bidirectional merging
// ═══════════════════════════════════════════════════════════

#[test]
fn test_bidirectional_widths() {
    let config = small_config();
    let reservoir = Reservoir::new(Embedding::random(VOCAB, 8, 2), &config.reservoir).unwrap();
    let data = batches(6, 6, 4, BatchSchema::Attributed, true);
    let batch = &data[0];

    let uni = DirectionalPooler::new(MergingStrategy::new(None, &[]), false);
    let bi = DirectionalPooler::new(MergingStrategy::new(None, &[]), true);
    let single = FeaturePipeline::new(&reservoir, &uni).prepare(batch).unwrap();
    let double = FeaturePipeline::new(&reservoir, &bi).prepare(batch).unwrap();
    assert_eq!(double.features.nrows(), single.features.nrows());
    assert_eq!(double.features.ncols(), 2 * single.features.ncols());
    // Forward half is untouched by the merge
    assert_eq!(double.features.slice(s![.., ..48]), single.features);

    let uni = DirectionalPooler::new(MergingStrategy::new(Some(PoolingStrategy::Max), &[]), false);
    let bi = DirectionalPooler::new(MergingStrategy::new(Some(PoolingStrategy::Max), &[]), true);
    let single = FeaturePipeline::new(&reservoir, &uni).prepare(batch).unwrap();
    let double = FeaturePipeline::new(&reservoir, &bi).prepare(batch).unwrap();
    assert_eq!(double.features.dim(), (6, 2 * single.features.ncols()));
}

#[test]
fn test_restored_reverse_matches_forward_backwards() {
    let config = small_config();
    let reservoir = Reservoir::new(Embedding::random(VOCAB, 8, 2), &config.reservoir).unwrap();
    let tokens = TokenMatrix::from_sequences(&[vec![1, 2, 3, 4], vec![5, 6]], 0);
    let (forward, lengths) = reservoir.forward(&tokens).unwrap();
    let restored = reversed_within_lengths(&forward, &lengths).unwrap();

    for (i, &len) in lengths.iter().enumerate() {
        for t in 0..len {
            assert_eq!(
                restored.slice(s![i, t, ..]),
                forward.slice(s![i, len - 1 - t, ..])
            );
        }
    }
    // Padding of the short sequence is untouched
    assert_eq!(restored.slice(s![1, 2.., ..]), forward.slice(s![1, 2.., ..]));
}

// ═══════════════════════════════════════════════════════════
// Closed-form training
// ═══════════════════════════════════════════════════════════

#[test]
fn test_ridge_classic_esn_learns_task() {
    println!("\n{}", "=".repeat(60));
    println!("PIPELINE: ridge readout, mean pooling, unidirectional");
    println!("{}", "=".repeat(60));

    let train = batches(200, 16, 10, BatchSchema::Attributed, true);
    let test = batches(80, 16, 11, BatchSchema::Attributed, true);
    let mut esn =
        EchoStateNetwork::new(small_config(), Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
            .unwrap();

    let history = esn.fit(&train, FitOptions::default()).unwrap();
    assert!(history.is_none(), "closed-form training records no loss");

    let (preds, accuracy) = esn.predict(&test, true).unwrap();
    let accuracy = accuracy.unwrap();
    println!("  Test accuracy: {:.1}%", accuracy);
    assert_eq!(preds.len(), 80);
    assert!(accuracy >= 80.0, "accuracy {:.1}% below 80%", accuracy);
}

#[test]
fn test_ridge_invariant_to_batch_order() {
    let train = batches(96, 8, 20, BatchSchema::Attributed, true);
    let mut shuffled = train.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(99));

    let fit = |data: &Vec<Batch>| {
        let mut ridge = RidgeRegression::new(NUM_CLASSES, 1e-1);
        let encoder =
            Reservoir::new(Embedding::random(VOCAB, 8, 2), &small_config().reservoir).unwrap();
        let pooler =
            DirectionalPooler::new(MergingStrategy::new(Some(PoolingStrategy::Mean), &[]), true);
        let pipeline = FeaturePipeline::new(&encoder, &pooler);
        ClosedFormTrainer
            .train(&pipeline, &mut ridge, data)
            .unwrap();
        ridge
    };

    let a = fit(&train);
    let b = fit(&shuffled);
    let (wa, ba) = a.weights().unwrap();
    let (wb, bb) = b.weights().unwrap();
    for (x, y) in wa.iter().zip(wb.iter()).chain(ba.iter().zip(bb.iter())) {
        assert!((x - y).abs() < 1e-3, "weights differ: {} vs {}", x, y);
    }
}

#[test]
fn test_keyed_and_attributed_schemas_agree() {
    let fit_predict = |schema: BatchSchema| {
        let config = small_config().with_batch_schema(schema);
        let mut esn =
            EchoStateNetwork::new(config, Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
                .unwrap();
        assert_eq!(esn.schema(), schema);
        esn.fit(&batches(60, 10, 30, schema, true), FitOptions::default())
            .unwrap();
        esn.predict(&batches(20, 10, 31, schema, true), false).unwrap()
    };
    let keyed = fit_predict(BatchSchema::Keyed);
    let attributed = fit_predict(BatchSchema::Attributed);
    assert_eq!(keyed.0, attributed.0);
}

#[test]
fn test_wrong_schema_is_an_error() {
    let mut esn = EchoStateNetwork::new(
        small_config().with_batch_schema(BatchSchema::Keyed),
        Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)),
    )
    .unwrap();
    let attributed = batches(10, 5, 1, BatchSchema::Attributed, true);
    let err = esn.fit(&attributed, FitOptions::default()).unwrap_err();
    assert_eq!(
        err,
        EsnError::SchemaMismatch {
            expected: BatchSchema::Keyed,
            found: BatchSchema::Attributed
        }
    );

    let missing: Vec<Batch> = vec![KeyedBatch::new().into()];
    assert!(matches!(
        esn.predict(&missing, false),
        Err(EsnError::MissingField(_))
    ));
}

#[test]
fn test_nearest_centroid_without_pooling_votes() {
    println!("\n{}", "=".repeat(60));
    println!("PIPELINE: nearest centroid, no pooling, bidirectional");
    println!("{}", "=".repeat(60));

    let config = small_config().with_pooling(None).with_bidirectional(true);
    let mut esn = EchoStateNetwork::new(config, Box::new(NearestCentroid::new(NUM_CLASSES))).unwrap();
    esn.fit(&batches(100, 10, 40, BatchSchema::Attributed, true), FitOptions::default())
        .unwrap();
    let (preds, accuracy) = esn
        .predict(&batches(40, 10, 41, BatchSchema::Attributed, true), true)
        .unwrap();
    let accuracy = accuracy.unwrap();
    println!("  Test accuracy: {:.1}%", accuracy);
    assert_eq!(preds.len(), 40);
    assert!(preds.iter().all(|&p| p == 0 || p == 1));
    assert!(accuracy >= 60.0, "accuracy {:.1}% below 60%", accuracy);
}

// ═══════════════════════════════════════════════════════════
// Iterative training
// ═══════════════════════════════════════════════════════════

#[test]
fn test_250_iterations_record_two_losses() {
    let config = small_config();
    let feature_dim = config.state_dim();
    let mut esn = EchoStateNetwork::new(
        config,
        Box::new(LogisticRegression::new(feature_dim, NUM_CLASSES, 5)),
    )
    .unwrap()
    .with_loss(Box::new(CrossEntropyLoss))
    .with_optimizer(Box::new(Sgd::new(0.1).with_momentum(0.9)));

    // 50 batches × 5 epochs = 250 optimizer steps
    let train = batches(100, 2, 50, BatchSchema::Attributed, true);
    assert_eq!(train.len(), 50);
    let history = esn
        .fit(&train, FitOptions { epochs: 5, iter_steps: 100 })
        .unwrap()
        .unwrap();

    let iterations: Vec<usize> = history.samples().iter().map(|s| s.iteration).collect();
    assert_eq!(iterations, vec![100, 200]);
    assert!(history.losses().iter().all(|l| l.is_finite()));
}

#[test]
fn test_bidirectional_iterative_readout_sized_from_config() {
    let config = small_config().with_bidirectional(true);
    let feature_dim = config.feature_dim(0);
    assert_eq!(feature_dim, 2 * config.state_dim());

    let mut esn = EchoStateNetwork::new(
        config,
        Box::new(LogisticRegression::new(feature_dim, NUM_CLASSES, 5)),
    )
    .unwrap()
    .with_loss(Box::new(CrossEntropyLoss))
    .with_optimizer(Box::new(Sgd::new(0.1)));
    assert_eq!(esn.feature_dim(0), feature_dim);

    let history = esn
        .fit(
            &batches(40, 8, 55, BatchSchema::Attributed, true),
            FitOptions { epochs: 2, iter_steps: 5 },
        )
        .unwrap()
        .unwrap();
    assert_eq!(history.samples().len(), 2);
}

#[test]
fn test_deep_readout_with_one_hot_loss() {
    println!("\n{}", "=".repeat(60));
    println!("PIPELINE: deep readout, adam, mse on one-hot targets");
    println!("{}", "=".repeat(60));

    let config = small_config().with_pooling(Some(PoolingStrategy::Last));
    let feature_dim = config.state_dim();
    let mut esn = EchoStateNetwork::new(
        config,
        Box::new(DeepReadout::new(feature_dim, &[16], NUM_CLASSES, 8)),
    )
    .unwrap()
    .with_loss(Box::new(MseLoss))
    .with_optimizer(Box::new(Adam::new(1e-2)));

    let train = batches(120, 12, 60, BatchSchema::Attributed, true);
    let history = esn
        .fit(&train, FitOptions { epochs: 20, iter_steps: 10 })
        .unwrap()
        .unwrap();
    let losses = history.losses();
    println!("  Loss: {:.4} → {:.4}", losses[0], losses[losses.len() - 1]);
    assert_eq!(losses.len(), 20);
    assert!(losses[losses.len() - 1] < losses[0]);
}

#[test]
fn test_iterative_without_optimizer_fails() {
    let config = small_config();
    let feature_dim = config.state_dim();
    let mut esn = EchoStateNetwork::new(
        config,
        Box::new(LogisticRegression::new(feature_dim, NUM_CLASSES, 5)),
    )
    .unwrap()
    .with_loss(Box::new(CrossEntropyLoss));
    let err = esn
        .fit(&batches(4, 2, 1, BatchSchema::Attributed, true), FitOptions::default())
        .unwrap_err();
    assert!(matches!(err, EsnError::MissingOptimizer(_)));
}

// ═══════════════════════════════════════════════════════════
// Inference-only data and readouts
// ═══════════════════════════════════════════════════════════

#[test]
fn test_unlabelled_predict_has_no_accuracy() {
    let mut esn =
        EchoStateNetwork::new(small_config(), Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
            .unwrap();
    esn.fit(&batches(40, 8, 70, BatchSchema::Attributed, true), FitOptions::default())
        .unwrap();

    let unlabelled = batches(25, 8, 71, BatchSchema::Attributed, false);
    let (preds, accuracy) = esn.predict(&unlabelled, true).unwrap();
    assert_eq!(preds.len(), 25);
    assert_eq!(accuracy, None);
}

#[test]
fn test_partially_labelled_accuracy_counts_labelled_only() {
    let mut esn =
        EchoStateNetwork::new(small_config(), Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
            .unwrap();
    esn.fit(&batches(40, 8, 80, BatchSchema::Attributed, true), FitOptions::default())
        .unwrap();

    let mut mixed = batches(16, 8, 81, BatchSchema::Attributed, false);
    mixed.extend(batches(16, 8, 82, BatchSchema::Attributed, true));
    let (preds, accuracy) = esn.predict(&mixed, false).unwrap();
    assert_eq!(preds.len(), 32);

    let (labelled_preds, labelled_accuracy) =
        esn.predict(&mixed[2..], false).unwrap();
    assert_eq!(&preds[16..], labelled_preds.as_slice());
    assert_eq!(accuracy, labelled_accuracy);
}

#[test]
fn test_unsupported_readout_fails_deterministically() {
    let config = small_config();
    let frozen = FrozenLinear::new(
        Array2::zeros((NUM_CLASSES, config.state_dim())),
        Array1::zeros(NUM_CLASSES),
    )
    .unwrap();
    let mut esn = EchoStateNetwork::new(config, Box::new(frozen)).unwrap();
    let train = batches(8, 4, 90, BatchSchema::Attributed, true);
    for _ in 0..2 {
        let err = esn.fit(&train, FitOptions::default()).unwrap_err();
        assert_eq!(err, EsnError::UnsupportedAlgorithm("frozen_linear".into()));
    }
    assert_eq!(esn.readout().name(), "frozen_linear");
}

#[test]
fn test_training_batch_without_labels_fails() {
    let mut esn =
        EchoStateNetwork::new(small_config(), Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
            .unwrap();
    let unlabelled = batches(8, 4, 91, BatchSchema::Attributed, false);
    let err = esn.fit(&unlabelled, FitOptions::default()).unwrap_err();
    assert_eq!(err, EsnError::MissingLabels(0));
}

// ═══════════════════════════════════════════════════════════
// Malformed input and configuration
// ═══════════════════════════════════════════════════════════

#[test]
fn test_attributed_lengths_past_width_is_shape_error() {
    let mut esn =
        EchoStateNetwork::new(small_config(), Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2)))
            .unwrap();
    let text = TokenMatrix {
        ids: array![[1, 2]],
        lengths: vec![3],
    };
    let data: Vec<Batch> = vec![AttributedBatch::new(text).with_labels(array![0]).into()];
    assert!(matches!(
        esn.fit(&data, FitOptions::default()),
        Err(EsnError::ShapeMismatch(_))
    ));
    assert!(matches!(
        esn.predict(&data, false),
        Err(EsnError::ShapeMismatch(_))
    ));
}

#[test]
fn test_deep_flag_needs_recurrent_mode() {
    let config = EsnConfig::linear_baseline(VOCAB, 8, 16).with_deep(2);
    let err =
        EchoStateNetwork::new(config, Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2))).unwrap_err();
    assert!(matches!(err, EsnError::InvalidConfig(_)));
}

#[test]
fn test_non_zero_pad_id_leaves_real_states_unchanged() {
    // Tokens 1..24 are all real; the pad sits past them
    let mut config = EsnConfig::classic(VOCAB + 1, 8, 48).with_pooling(Some(PoolingStrategy::Mean));
    config.reservoir.pad_id = VOCAB;
    let esn =
        EchoStateNetwork::new(config, Box::new(RidgeRegression::new(NUM_CLASSES, 1e-2))).unwrap();

    let short = TokenMatrix::from_sequences(&[vec![3, 4]], VOCAB);
    let padded = TokenMatrix::from_sequences(&[vec![3, 4], vec![5, 6, 7, 8]], VOCAB);
    assert_eq!(padded.ids.row(0).to_vec(), vec![3, 4, VOCAB, VOCAB]);

    let (alone, _) = esn.encoder().forward(&short).unwrap();
    let (batched, _) = esn.encoder().forward(&padded).unwrap();
    assert_eq!(batched.slice(s![0, ..2, ..]), alone.slice(s![0, .., ..]));
    assert!(batched.slice(s![0, 2.., ..]).iter().all(|&x| x == 0.0));
}
