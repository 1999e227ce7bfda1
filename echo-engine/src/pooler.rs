//! Combines forward and (optionally) time-reversed states into one merged
//! representation under the configured merging strategy.

use ndarray::Array2;

use crate::batch::TokenMatrix;
use crate::error::{EsnError, Result};
use crate::pooling::MergingStrategy;
use crate::state::{
    concat_features, concat_state_features, reversed_within_lengths, MergedState, StateTensor,
};

/// Per-batch inputs of a merge.
#[derive(Debug, Clone, Copy)]
pub struct PoolerInput<'a> {
    pub states: &'a StateTensor,
    pub lengths: &'a [usize],
    pub tokens: &'a TokenMatrix,
    /// States of the sequences read backwards; required when bidirectional
    pub reversed: Option<&'a StateTensor>,
    pub additional_fts: Option<&'a Array2<f32>>,
}

#[derive(Debug)]
pub struct DirectionalPooler {
    merging: MergingStrategy,
    bidirectional: bool,
}

impl DirectionalPooler {
    pub fn new(merging: MergingStrategy, bidirectional: bool) -> Self {
        Self {
            merging,
            bidirectional,
        }
    }

    pub fn merging(&self) -> &MergingStrategy {
        &self.merging
    }

    pub fn is_pooling(&self) -> bool {
        self.merging.is_pooling()
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Width of the merged rows for `state_dim`-wide encoder states.
    pub fn output_dim(&self, state_dim: usize, extra_dim: usize) -> usize {
        if !self.bidirectional {
            return self.merging.output_dim(state_dim, extra_dim);
        }
        if self.merging.is_pooling() {
            self.merging.output_dim(state_dim, extra_dim) + self.merging.output_dim(state_dim, 0)
        } else {
            self.merging.output_dim(2 * state_dim, extra_dim)
        }
    }

    pub fn merge(&self, input: PoolerInput<'_>) -> Result<MergedState> {
        let PoolerInput {
            states,
            lengths,
            tokens,
            reversed,
            additional_fts,
        } = input;

        if !self.bidirectional {
            return self.merging.reduce(states, lengths, tokens, additional_fts);
        }
        let reversed = reversed.ok_or(EsnError::MissingReversedStates)?;

        if self.merging.is_pooling() {
            let forward = self.merging.reduce(states, lengths, tokens, additional_fts)?;
            let backward = self.merging.reduce(reversed, lengths, tokens, None)?;
            concat_features(&forward, &backward)
        } else {
            // Realign backward rows to forward time before pairing them
            let restored = reversed_within_lengths(reversed, lengths)?;
            let paired = concat_state_features(states, &restored)?;
            self.merging.reduce(&paired, lengths, tokens, None)
        }
    }
}
