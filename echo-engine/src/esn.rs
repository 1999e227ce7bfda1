// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! EchoStateNetwork: the top-level model container
//!
//! Wraps the encoder, the merging policy and the readout into one model.
//! `fit` trains the readout (closed form or iterative, chosen by the
//! readout's capability), `predict` labels sequences and scores them when
//! labels are present, `warm_up` primes the encoder's initial state.

use std::borrow::Borrow;

use tracing::{info, warn};

use crate::batch::{Batch, BatchSchema};
use crate::config::{Device, EsnConfig, FitOptions};
use crate::encoder::{build_encoder, SequenceEncoder};
use crate::error::Result;
use crate::loss::Loss;
use crate::optim::Optimizer;
use crate::pipeline::FeaturePipeline;
use crate::pooler::DirectionalPooler;
use crate::pooling::MergingStrategy;
use crate::predict::PredictionAggregator;
use crate::readout::ReadoutAlgorithm;
use crate::training::{LossHistory, TrainingDispatcher};

/// The Echo State Network.
///
/// Owns its readout exclusively; training mutates it in place.
pub struct EchoStateNetwork {
    config: EsnConfig,
    encoder: Box<dyn SequenceEncoder>,
    pooler: DirectionalPooler,
    readout: Box<dyn ReadoutAlgorithm>,
    loss: Option<Box<dyn Loss>>,
    optimizer: Option<Box<dyn Optimizer>>,
}

impl EchoStateNetwork {
    /// Build the encoder and merging policy described by `config`.
    ///
    /// GPU requests run on CPU: only CPU kernels ship.
    pub fn new(config: EsnConfig, readout: Box<dyn ReadoutAlgorithm>) -> Result<Self> {
        config.validate()?;
        if let Device::Gpu { device_id } = config.device {
            warn!(device_id, "no accelerator kernels available, running on CPU");
        }

        let encoder = build_encoder(&config)?;
        let merging = MergingStrategy::new(config.pooling, &config.lexicon);
        let pooler = DirectionalPooler::new(merging, config.bidirectional);

        info!(
            mode = ?config.mode,
            encoder = encoder.name(),
            merging = pooler.merging().name(),
            bidirectional = config.bidirectional,
            readout = readout.name(),
            "built echo state network"
        );

        Ok(Self {
            config,
            encoder,
            pooler,
            readout,
            loss: None,
            optimizer: None,
        })
    }

    pub fn with_loss(mut self, loss: Box<dyn Loss>) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Replace the configured encoder; the batch schema follows the new encoder.
    pub fn with_encoder(mut self, encoder: Box<dyn SequenceEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Replace the configured merging strategy, e.g. with a custom reduction.
    pub fn with_merging(mut self, merging: MergingStrategy) -> Self {
        self.pooler = DirectionalPooler::new(merging, self.config.bidirectional);
        self
    }

    /// Train the readout. Returns the loss history for iterative readouts.
    pub fn fit<I>(&mut self, batches: I, options: FitOptions) -> Result<Option<LossHistory>>
    where
        I: IntoIterator + Clone,
        I::Item: Borrow<Batch>,
    {
        let pipeline = FeaturePipeline::new(self.encoder.as_ref(), &self.pooler);
        let optimizer = match self.optimizer.as_mut() {
            Some(opt) => Some(opt.as_mut() as &mut dyn Optimizer),
            None => None,
        };
        TrainingDispatcher.fit(
            &pipeline,
            self.readout.as_mut(),
            self.loss.as_deref(),
            optimizer,
            batches,
            options,
        )
    }

    /// Predict one label per sequence, in batch order.
    ///
    /// Accuracy (percent) is `None` when no batch carried labels.
    pub fn predict<I>(&self, batches: I, verbose: bool) -> Result<(Vec<i64>, Option<f64>)>
    where
        I: IntoIterator,
        I::Item: Borrow<Batch>,
    {
        let pipeline = FeaturePipeline::new(self.encoder.as_ref(), &self.pooler);
        PredictionAggregator::new(self.pooler.is_pooling()).predict(
            &pipeline,
            self.readout.as_ref(),
            batches,
            verbose,
        )
    }

    /// Run `sequence` through the encoder and keep its final state as the
    /// starting state of every later sequence.
    pub fn warm_up(&mut self, sequence: &[usize]) -> Result<()> {
        self.encoder.warm_up(sequence)
    }

    pub fn config(&self) -> &EsnConfig {
        &self.config
    }

    pub fn readout(&self) -> &dyn ReadoutAlgorithm {
        self.readout.as_ref()
    }

    pub fn encoder(&self) -> &dyn SequenceEncoder {
        self.encoder.as_ref()
    }

    pub fn schema(&self) -> BatchSchema {
        self.encoder.schema()
    }

    pub fn is_pooling(&self) -> bool {
        self.pooler.is_pooling()
    }

    /// Width of the merged rows fed to the readout.
    pub fn feature_dim(&self, extra_dim: usize) -> usize {
        self.pooler.output_dim(self.encoder.output_dim(), extra_dim)
    }
}

impl std::fmt::Debug for EchoStateNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoStateNetwork")
            .field("config", &self.config)
            .field("encoder", &self.encoder.name())
            .field("pooler", &self.pooler)
            .field("readout", &self.readout.name())
            .field("loss", &self.loss.as_ref().map(|l| l.name().to_string()))
            .field(
                "optimizer",
                &self.optimizer.as_ref().map(|o| o.name().to_string()),
            )
            .finish()
    }
}
