//! Readout training.
//!
//! `TrainingDispatcher` classifies the readout by its `Capability` and routes
//! to one of two trainers:
//! - `ClosedFormTrainer`: collect every merged state → one `fit`
//! - `IterativeTrainer`: per batch, forward → loss → zero_grad → backward → step

use std::borrow::Borrow;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::Batch;
use crate::config::FitOptions;
use crate::error::{EsnError, Result};
use crate::loss::{Loss, TargetKind, Targets};
use crate::optim::Optimizer;
use crate::pipeline::{FeaturePipeline, PreparedBatch};
use crate::readout::{Capability, RawOutputs, ReadoutAlgorithm};
use crate::state::{concat_labels, concat_rows, one_hot, MergedState};

// ─── Loss History ────────────────────────────────────

/// One recorded loss value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSample {
    /// Global optimizer-step count at which the loss was recorded
    pub iteration: usize,
    pub loss: f32,
}

/// Loss samples recorded every `iter_steps` iterative-training steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    samples: Vec<LossSample>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, iteration: usize, loss: f32) {
        self.samples.push(LossSample { iteration, loss });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LossSample] {
        &self.samples
    }

    pub fn losses(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.loss).collect()
    }

    pub fn last(&self) -> Option<&LossSample> {
        self.samples.last()
    }
}

fn training_labels(
    prepared: PreparedBatch,
    batch_index: usize,
) -> Result<(MergedState, Array1<i64>)> {
    match prepared.row_labels {
        Some(labels) => Ok((prepared.features, labels)),
        None => Err(EsnError::MissingLabels(batch_index)),
    }
}

// ─── Closed Form ─────────────────────────────────────

/// Single pass: accumulate all merged states and labels, then fit once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosedFormTrainer;

impl ClosedFormTrainer {
    pub fn train<I>(
        &self,
        pipeline: &FeaturePipeline<'_>,
        readout: &mut dyn ReadoutAlgorithm,
        batches: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Borrow<Batch>,
    {
        info!(readout = readout.name(), "computing closed-form solution");

        let mut states = Vec::new();
        let mut labels = Vec::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let (features, row_labels) = training_labels(pipeline.prepare(batch)?, index)?;
            debug!(batch = index, rows = features.nrows(), "collected states");
            states.push(features);
            labels.push(row_labels);
        }

        let design = concat_rows(&states)?;
        let targets = concat_labels(&labels);
        readout.fit(&design, &targets)?;

        info!(rows = design.nrows(), features = design.ncols(), "training complete");
        Ok(())
    }
}

// ─── Iterative ───────────────────────────────────────

/// Gradient training over `epochs` passes; memory bounded by one batch.
#[derive(Debug, Clone, Copy)]
pub struct IterativeTrainer {
    pub epochs: usize,
    pub iter_steps: usize,
}

impl IterativeTrainer {
    pub fn new(epochs: usize, iter_steps: usize) -> Result<Self> {
        if iter_steps == 0 {
            return Err(EsnError::InvalidConfig("iter_steps must be positive".into()));
        }
        Ok(Self { epochs, iter_steps })
    }

    pub fn train<I>(
        &self,
        pipeline: &FeaturePipeline<'_>,
        readout: &mut dyn ReadoutAlgorithm,
        loss: &dyn Loss,
        optimizer: &mut dyn Optimizer,
        batches: I,
    ) -> Result<LossHistory>
    where
        I: IntoIterator + Clone,
        I::Item: Borrow<Batch>,
    {
        info!(
            readout = readout.name(),
            loss = loss.name(),
            optimizer = optimizer.name(),
            epochs = self.epochs,
            iter_steps = self.iter_steps,
            "starting iterative training"
        );

        let mut history = LossHistory::new();
        let mut iteration = 0usize;
        for epoch in 0..self.epochs {
            let mut seen = 0usize;
            let mut epoch_loss = 0.0f32;
            for (index, batch) in batches.clone().into_iter().enumerate() {
                let (features, labels) = training_labels(pipeline.prepare(batch)?, index)?;
                let value = self.step(readout, loss, optimizer, &features, &labels)?;

                iteration += 1;
                seen += 1;
                epoch_loss += value;
                if iteration % self.iter_steps == 0 {
                    info!(iteration, loss = value, "training loss");
                    history.push(iteration, value);
                }
            }
            if seen == 0 {
                return Err(EsnError::EmptyDataset);
            }
            debug!(
                epoch = epoch + 1,
                batches = seen,
                mean_loss = epoch_loss / seen as f32,
                "epoch complete"
            );
        }

        info!(iterations = iteration, recorded = history.len(), "training complete");
        Ok(history)
    }

    fn step(
        &self,
        readout: &mut dyn ReadoutAlgorithm,
        loss: &dyn Loss,
        optimizer: &mut dyn Optimizer,
        features: &MergedState,
        labels: &Array1<i64>,
    ) -> Result<f32> {
        let outputs = match readout.forward(features)? {
            RawOutputs::Scores(scores) => scores,
            RawOutputs::Classes(_) => {
                return Err(EsnError::UnsupportedAlgorithm(format!(
                    "{} emits class ids and cannot be trained by gradient",
                    readout.name()
                )))
            }
        };

        let (value, grad) = match loss.target_kind() {
            TargetKind::ClassIndices => loss.compute(&outputs, Targets::Classes(labels))?,
            TargetKind::OneHot => {
                let dense = one_hot(labels, readout.output_dim())?;
                loss.compute(&outputs, Targets::OneHot(&dense))?
            }
        };

        let name = readout.name().to_string();
        readout.zero_grad();
        readout.backward(features, &grad)?;
        let params = readout.params_mut().ok_or_else(|| {
            EsnError::UnsupportedAlgorithm(format!("{} exposes no parameters", name))
        })?;
        optimizer.step(params)?;
        Ok(value)
    }
}

// ─── Dispatcher ──────────────────────────────────────

/// Training path chosen from a readout's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPath {
    ClosedForm,
    Iterative,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingDispatcher;

impl TrainingDispatcher {
    pub fn classify(readout: &dyn ReadoutAlgorithm) -> Result<TrainingPath> {
        match readout.capability() {
            Capability::ClosedForm => Ok(TrainingPath::ClosedForm),
            Capability::Iterative => Ok(TrainingPath::Iterative),
            Capability::InferenceOnly => {
                Err(EsnError::UnsupportedAlgorithm(readout.name().to_string()))
            }
        }
    }

    /// Train `readout`; returns the loss history for iterative training.
    pub fn fit<I>(
        &self,
        pipeline: &FeaturePipeline<'_>,
        readout: &mut dyn ReadoutAlgorithm,
        loss: Option<&dyn Loss>,
        optimizer: Option<&mut dyn Optimizer>,
        batches: I,
        options: FitOptions,
    ) -> Result<Option<LossHistory>>
    where
        I: IntoIterator + Clone,
        I::Item: Borrow<Batch>,
    {
        match Self::classify(readout)? {
            TrainingPath::ClosedForm => {
                ClosedFormTrainer.train(pipeline, readout, batches)?;
                Ok(None)
            }
            TrainingPath::Iterative => {
                let loss = loss.ok_or_else(|| EsnError::MissingLoss(readout.name().to_string()))?;
                let optimizer = optimizer
                    .ok_or_else(|| EsnError::MissingOptimizer(readout.name().to_string()))?;
                let trainer = IterativeTrainer::new(options.epochs, options.iter_steps)?;
                trainer
                    .train(pipeline, readout, loss, optimizer, batches)
                    .map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{AttributedBatch, TokenMatrix};
    use crate::encoder::{Embedding, NoLayer};
    use crate::loss::CrossEntropyLoss;
    use crate::optim::Sgd;
    use crate::pooler::DirectionalPooler;
    use crate::pooling::{MergingStrategy, PoolingStrategy};
    use crate::readout::{FrozenLinear, LogisticRegression, NearestCentroid, RidgeRegression};
    use ndarray::{array, Array2};

    /// Tokens 1 and 2 embed to opposite corners; class = token family.
    fn encoder() -> NoLayer {
        NoLayer::new(Embedding::new(array![
            [0.0f32, 0.0],
            [1.0, 0.0],
            [0.0, 1.0]
        ]))
    }

    fn dataset(labelled: bool) -> Vec<Batch> {
        (0..4)
            .map(|i| {
                let tokens = TokenMatrix::from_sequences(&[vec![1, 1], vec![2, 2, 2]], 0);
                let batch = AttributedBatch::new(tokens);
                if labelled || i > 0 {
                    batch.with_labels(array![0, 1]).into()
                } else {
                    batch.into()
                }
            })
            .collect()
    }

    fn mean_pooler() -> DirectionalPooler {
        DirectionalPooler::new(MergingStrategy::new(Some(PoolingStrategy::Mean), &[]), false)
    }

    #[test]
    fn test_loss_history_serializes() {
        let mut history = LossHistory::new();
        history.push(100, 0.5);
        history.push(200, 0.25);
        let json = serde_json::to_string(&history).unwrap();
        let restored: LossHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, history);
        assert_eq!(restored.losses(), vec![0.5, 0.25]);
        assert_eq!(restored.last().map(|s| s.iteration), Some(200));
    }

    #[test]
    fn test_classify_by_capability() {
        assert_eq!(
            TrainingDispatcher::classify(&RidgeRegression::new(2, 1.0)).unwrap(),
            TrainingPath::ClosedForm
        );
        assert_eq!(
            TrainingDispatcher::classify(&LogisticRegression::new(2, 2, 0)).unwrap(),
            TrainingPath::Iterative
        );
        let frozen = FrozenLinear::new(Array2::zeros((2, 2)), Array1::zeros(2)).unwrap();
        assert_eq!(
            TrainingDispatcher::classify(&frozen),
            Err(EsnError::UnsupportedAlgorithm("frozen_linear".into()))
        );
    }

    #[test]
    fn test_closed_form_fits_once_over_all_batches() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let mut nc = NearestCentroid::new(2);
        ClosedFormTrainer
            .train(&pipeline, &mut nc, &dataset(true))
            .unwrap();
        let centroids = nc.centroids().unwrap();
        assert_eq!(centroids.row(0), array![1.0, 0.0]);
        assert_eq!(centroids.row(1), array![0.0, 1.0]);
    }

    #[test]
    fn test_closed_form_rejects_unlabelled_batch() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let err = ClosedFormTrainer
            .train(&pipeline, &mut RidgeRegression::new(2, 1.0), &dataset(false))
            .unwrap_err();
        assert_eq!(err, EsnError::MissingLabels(0));
    }

    #[test]
    fn test_closed_form_empty_dataset() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let empty: Vec<Batch> = Vec::new();
        let err = ClosedFormTrainer
            .train(&pipeline, &mut RidgeRegression::new(2, 1.0), &empty)
            .unwrap_err();
        assert_eq!(err, EsnError::EmptyDataset);
    }

    #[test]
    fn test_iterative_records_every_iter_steps() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let mut readout = LogisticRegression::new(2, 2, 3);
        let mut sgd = Sgd::new(0.5);
        let trainer = IterativeTrainer::new(5, 3).unwrap();
        // 4 batches × 5 epochs = 20 steps → samples at 3, 6, ..., 18
        let history = trainer
            .train(&pipeline, &mut readout, &CrossEntropyLoss, &mut sgd, &dataset(true))
            .unwrap();
        let iterations: Vec<usize> = history.samples().iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![3, 6, 9, 12, 15, 18]);
        assert_eq!(sgd.num_steps(), 20);
        assert!(history.losses()[5] < history.losses()[0]);
    }

    #[test]
    fn test_iterative_rejects_zero_iter_steps() {
        assert!(matches!(
            IterativeTrainer::new(1, 0),
            Err(EsnError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dispatcher_requires_loss_and_optimizer() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let data = dataset(true);
        let mut readout = LogisticRegression::new(2, 2, 3);

        let err = TrainingDispatcher
            .fit(&pipeline, &mut readout, None, None, &data, FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, EsnError::MissingLoss(_)));

        let err = TrainingDispatcher
            .fit(
                &pipeline,
                &mut readout,
                Some(&CrossEntropyLoss),
                None,
                &data,
                FitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EsnError::MissingOptimizer(_)));
    }

    #[test]
    fn test_dispatcher_closed_form_returns_none() {
        let enc = encoder();
        let pooler = mean_pooler();
        let pipeline = FeaturePipeline::new(&enc, &pooler);
        let mut ridge = RidgeRegression::new(2, 0.1);
        let history = TrainingDispatcher
            .fit(&pipeline, &mut ridge, None, None, &dataset(true), FitOptions::default())
            .unwrap();
        assert!(history.is_none());
        assert!(ridge.weights().is_some());
    }
}
