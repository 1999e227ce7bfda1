//! Per-batch feature extraction shared by training and prediction:
//! normalize → encode (both directions when bidirectional) → merge → align labels.

use std::borrow::Borrow;

use ndarray::Array1;

use crate::batch::{Batch, BatchNormalizer};
use crate::encoder::SequenceEncoder;
use crate::error::Result;
use crate::pooler::{DirectionalPooler, PoolerInput};
use crate::state::{duplicate_labels, MergedState};

/// Merged features of one batch with row-aligned labels.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    /// One row per sequence (pooling) or per real token (no pooling)
    pub features: MergedState,
    /// One label per feature row, when the batch carried labels
    pub row_labels: Option<Array1<i64>>,
    /// One label per sequence, when the batch carried labels
    pub labels: Option<Array1<i64>>,
    pub lengths: Vec<usize>,
}

impl PreparedBatch {
    pub fn num_sequences(&self) -> usize {
        self.lengths.len()
    }
}

pub struct FeaturePipeline<'a> {
    encoder: &'a dyn SequenceEncoder,
    normalizer: BatchNormalizer,
    pooler: &'a DirectionalPooler,
}

impl<'a> FeaturePipeline<'a> {
    /// The normalizer takes its schema from the encoder.
    pub fn new(encoder: &'a dyn SequenceEncoder, pooler: &'a DirectionalPooler) -> Self {
        Self {
            encoder,
            normalizer: BatchNormalizer::new(encoder.schema()),
            pooler,
        }
    }

    pub fn is_pooling(&self) -> bool {
        self.pooler.is_pooling()
    }

    pub fn prepare(&self, batch: impl Borrow<Batch>) -> Result<PreparedBatch> {
        let normalized = self.normalizer.normalize(batch.borrow())?;
        let tokens = &normalized.tokens;

        let (states, lengths) = self.encoder.forward(tokens)?;
        let reversed = if self.pooler.is_bidirectional() {
            Some(self.encoder.reverse_forward(tokens)?.0)
        } else {
            None
        };

        let features = self.pooler.merge(PoolerInput {
            states: &states,
            lengths: &lengths,
            tokens,
            reversed: reversed.as_ref(),
            additional_fts: normalized.additional_fts.as_ref(),
        })?;

        let row_labels = match &normalized.labels {
            Some(labels) if !self.pooler.is_pooling() => Some(duplicate_labels(labels, &lengths)?),
            Some(labels) => Some(labels.clone()),
            None => None,
        };

        Ok(PreparedBatch {
            features,
            row_labels,
            labels: normalized.labels,
            lengths,
        })
    }

    /// Merged width for a batch with `extra_dim` additional features.
    pub fn feature_dim(&self, extra_dim: usize) -> usize {
        self.pooler.output_dim(self.encoder.output_dim(), extra_dim)
    }
}
