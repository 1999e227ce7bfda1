//! Merging strategies: reductions that collapse a sequence's per-token
//! states into one representation.
//!
//! A strategy of `None` means no reduction; the token passthrough keeps one
//! row per real token. Every other strategy yields one row per sequence and
//! appends the batch's additional features, when present, after the pooled
//! features.

use std::collections::HashSet;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::batch::TokenMatrix;
use crate::error::{EsnError, Result};
use crate::state::{flatten_tokens, MergedState, StateTensor};

/// Named built-in reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingStrategy {
    /// Average of the real time steps
    Mean,
    /// State after the first token
    First,
    /// State after the last real token
    Last,
    /// Element-wise maximum over the real time steps
    Max,
    /// Weighted average with weights growing linearly in time
    Weighted,
    /// Weighted average where lexicon tokens count double
    LexiconWeighted,
}

/// Contract of a reduction.
pub trait PoolingReduction: Send + Sync {
    /// Reduce `states` to a merged state.
    ///
    /// `tokens` is passed through for reductions that need token identity.
    fn reduce(
        &self,
        states: &StateTensor,
        lengths: &[usize],
        tokens: &TokenMatrix,
        additional_fts: Option<&Array2<f32>>,
    ) -> Result<MergedState>;

    /// Output width for `state_dim`-wide states and `extra_dim` extra features.
    fn output_dim(&self, state_dim: usize, extra_dim: usize) -> usize;

    fn name(&self) -> &str;
}

// ─── Token passthrough ───────────────────────────────

/// Identity reduction: one row per real token, sequence by sequence.
///
/// Per-sequence extra features have no per-token slot and are not appended.
#[derive(Debug, Clone, Default)]
pub struct TokenPassthrough;

impl PoolingReduction for TokenPassthrough {
    fn reduce(
        &self,
        states: &StateTensor,
        lengths: &[usize],
        _tokens: &TokenMatrix,
        _additional_fts: Option<&Array2<f32>>,
    ) -> Result<MergedState> {
        flatten_tokens(states, lengths)
    }

    fn output_dim(&self, state_dim: usize, _extra_dim: usize) -> usize {
        state_dim
    }

    fn name(&self) -> &str {
        "none"
    }
}

// ─── Sequence pooling ────────────────────────────────

/// Built-in per-sequence reductions.
#[derive(Debug, Clone)]
pub struct SequencePooling {
    strategy: PoolingStrategy,
    lexicon: HashSet<usize>,
}

impl SequencePooling {
    pub fn new(strategy: PoolingStrategy) -> Self {
        Self {
            strategy,
            lexicon: HashSet::new(),
        }
    }

    pub fn with_lexicon(mut self, lexicon: &[usize]) -> Self {
        self.lexicon = lexicon.iter().copied().collect();
        self
    }

    fn pool_sequence(&self, rows: ArrayView2<'_, f32>, tokens: ArrayView1<'_, usize>) -> Array1<f32> {
        let len = rows.nrows();
        if len == 0 {
            return Array1::zeros(rows.ncols());
        }
        match self.strategy {
            PoolingStrategy::Mean => rows.sum_axis(Axis(0)) / len as f32,
            PoolingStrategy::First => rows.row(0).to_owned(),
            PoolingStrategy::Last => rows.row(len - 1).to_owned(),
            PoolingStrategy::Max => rows.fold_axis(Axis(0), f32::NEG_INFINITY, |&m, &x| m.max(x)),
            PoolingStrategy::Weighted => {
                let weights = Array1::from_shape_fn(len, |t| (t + 1) as f32);
                weighted_mean(rows, &weights)
            }
            PoolingStrategy::LexiconWeighted => {
                let weights = tokens.mapv(|tok| if self.lexicon.contains(&tok) { 2.0 } else { 1.0 });
                weighted_mean(rows, &weights)
            }
        }
    }
}

fn weighted_mean(rows: ArrayView2<'_, f32>, weights: &Array1<f32>) -> Array1<f32> {
    let total = weights.sum();
    weights.dot(&rows) / total
}

impl PoolingReduction for SequencePooling {
    fn reduce(
        &self,
        states: &StateTensor,
        lengths: &[usize],
        tokens: &TokenMatrix,
        additional_fts: Option<&Array2<f32>>,
    ) -> Result<MergedState> {
        let (batch, time, dim) = states.dim();
        if lengths.len() != batch || tokens.batch_size() != batch {
            return Err(EsnError::ShapeMismatch(format!(
                "{} lengths and {} token rows for {} sequences",
                lengths.len(),
                tokens.batch_size(),
                batch
            )));
        }
        let extra_dim = additional_fts.map_or(0, |f| f.ncols());
        if let Some(fts) = additional_fts {
            if fts.nrows() != batch {
                return Err(EsnError::ShapeMismatch(format!(
                    "{} additional feature rows for {} sequences",
                    fts.nrows(),
                    batch
                )));
            }
        }

        let mut merged = Array2::zeros((batch, dim + extra_dim));
        for (i, &len) in lengths.iter().enumerate() {
            if len > time || len > tokens.max_len() {
                return Err(EsnError::ShapeMismatch(format!(
                    "length {} exceeds {} time steps",
                    len, time
                )));
            }
            let pooled = self.pool_sequence(
                states.slice(s![i, ..len, ..]),
                tokens.ids.slice(s![i, ..len]),
            );
            merged.slice_mut(s![i, ..dim]).assign(&pooled);
            if let Some(fts) = additional_fts {
                merged.slice_mut(s![i, dim..]).assign(&fts.row(i));
            }
        }
        Ok(merged)
    }

    fn output_dim(&self, state_dim: usize, extra_dim: usize) -> usize {
        state_dim + extra_dim
    }

    fn name(&self) -> &str {
        match self.strategy {
            PoolingStrategy::Mean => "mean",
            PoolingStrategy::First => "first",
            PoolingStrategy::Last => "last",
            PoolingStrategy::Max => "max",
            PoolingStrategy::Weighted => "weighted",
            PoolingStrategy::LexiconWeighted => "lexicon_weighted",
        }
    }
}

// ─── Merging Strategy ────────────────────────────────

/// A resolved merging strategy: whether it pools, and the reduction to call.
pub struct MergingStrategy {
    pools: bool,
    reduction: Box<dyn PoolingReduction>,
}

impl MergingStrategy {
    /// Resolve a strategy tag. `None` resolves to the token passthrough.
    pub fn new(strategy: Option<PoolingStrategy>, lexicon: &[usize]) -> Self {
        match strategy {
            None => Self {
                pools: false,
                reduction: Box::new(TokenPassthrough),
            },
            Some(strategy) => Self {
                pools: true,
                reduction: Box::new(SequencePooling::new(strategy).with_lexicon(lexicon)),
            },
        }
    }

    /// Use a caller-supplied per-sequence reduction.
    pub fn custom(reduction: Box<dyn PoolingReduction>) -> Self {
        Self {
            pools: true,
            reduction,
        }
    }

    /// `false` when every token keeps its own row.
    pub fn is_pooling(&self) -> bool {
        self.pools
    }

    pub fn name(&self) -> &str {
        self.reduction.name()
    }

    pub fn output_dim(&self, state_dim: usize, extra_dim: usize) -> usize {
        self.reduction.output_dim(state_dim, extra_dim)
    }

    pub fn reduce(
        &self,
        states: &StateTensor,
        lengths: &[usize],
        tokens: &TokenMatrix,
        additional_fts: Option<&Array2<f32>>,
    ) -> Result<MergedState> {
        self.reduction.reduce(states, lengths, tokens, additional_fts)
    }
}

impl std::fmt::Debug for MergingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergingStrategy")
            .field("pools", &self.pools)
            .field("reduction", &self.reduction.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    /// Two sequences, lengths [2, 3], 2 features; padding rows hold 99.
    fn fixture() -> (StateTensor, Vec<usize>, TokenMatrix) {
        let mut states = Array3::from_elem((2, 3, 2), 99.0f32);
        states.slice_mut(s![0, ..2, ..]).assign(&array![[1.0, 2.0], [3.0, 4.0]]);
        states
            .slice_mut(s![1, .., ..])
            .assign(&array![[1.0, 0.0], [2.0, 5.0], [3.0, -1.0]]);
        let tokens = TokenMatrix::from_sequences(&[vec![7, 8], vec![7, 9, 9]], 0);
        (states, vec![2, 3], tokens)
    }

    fn pool(strategy: PoolingStrategy) -> MergedState {
        let (states, lengths, tokens) = fixture();
        SequencePooling::new(strategy)
            .with_lexicon(&[7])
            .reduce(&states, &lengths, &tokens, None)
            .unwrap()
    }

    #[test]
    fn test_mean_ignores_padding() {
        assert_eq!(pool(PoolingStrategy::Mean), array![[2.0, 3.0], [2.0, 4.0 / 3.0]]);
    }

    #[test]
    fn test_first_last_max() {
        assert_eq!(pool(PoolingStrategy::First), array![[1.0, 2.0], [1.0, 0.0]]);
        assert_eq!(pool(PoolingStrategy::Last), array![[3.0, 4.0], [3.0, -1.0]]);
        assert_eq!(pool(PoolingStrategy::Max), array![[3.0, 4.0], [3.0, 5.0]]);
    }

    #[test]
    fn test_weighted() {
        let out = pool(PoolingStrategy::Weighted);
        // seq 0: (1·[1,2] + 2·[3,4]) / 3
        assert!((out[[0, 0]] - 7.0 / 3.0).abs() < 1e-6);
        assert!((out[[0, 1]] - 10.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_lexicon_weighted_uses_token_identity() {
        let out = pool(PoolingStrategy::LexiconWeighted);
        // seq 1: token 7 weighs 2, tokens 9 weigh 1 → (2·[1,0] + [2,5] + [3,-1]) / 4
        assert!((out[[1, 0]] - 7.0 / 4.0).abs() < 1e-6);
        assert!((out[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_additional_features_appended() {
        let (states, lengths, tokens) = fixture();
        let fts = array![[10.0f32, 11.0, 12.0], [20.0, 21.0, 22.0]];
        let merging = MergingStrategy::new(Some(PoolingStrategy::Last), &[]);
        let out = merging.reduce(&states, &lengths, &tokens, Some(&fts)).unwrap();
        assert_eq!(out.dim(), (2, 5));
        assert_eq!(out.row(1), array![3.0, -1.0, 20.0, 21.0, 22.0].view());
        assert_eq!(merging.output_dim(2, 3), 5);
    }

    #[test]
    fn test_passthrough_is_per_token() {
        let (states, lengths, tokens) = fixture();
        let merging = MergingStrategy::new(None, &[]);
        assert!(!merging.is_pooling());
        let fts = array![[10.0f32], [20.0]];
        let out = merging.reduce(&states, &lengths, &tokens, Some(&fts)).unwrap();
        assert_eq!(out.dim(), (5, 2));
        assert_eq!(merging.output_dim(2, 1), 2);
    }

    #[test]
    fn test_zero_length_sequence_pools_to_zeros() {
        let states = Array3::from_elem((1, 2, 3), 5.0f32);
        let tokens = TokenMatrix::from_sequences(&[vec![]], 0);
        let tokens = TokenMatrix::new(Array2::zeros((1, 2)), tokens.lengths).unwrap();
        let out = SequencePooling::new(PoolingStrategy::Max)
            .reduce(&states, &[0], &tokens, None)
            .unwrap();
        assert_eq!(out, Array2::<f32>::zeros((1, 3)));
    }

    #[test]
    fn test_length_mismatch_detected() {
        let (states, _, tokens) = fixture();
        let err = SequencePooling::new(PoolingStrategy::Mean)
            .reduce(&states, &[2], &tokens, None)
            .unwrap_err();
        assert!(matches!(err, EsnError::ShapeMismatch(_)));
    }
}
