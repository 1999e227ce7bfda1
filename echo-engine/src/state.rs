//! State containers and the length-aware operations shared by pooling,
//! training and prediction.
//!
//! - `StateTensor`: `batch × time × feature`, produced by an encoder.
//! - `MergedState`: `rows × feature`, one row per sequence (pooled) or one
//!   row per real token (unpooled).
//!
//! Rows past a sequence's true length are padding. None of the helpers here
//! read or write them, except `concat_state_features` which keeps them in
//! place alongside the real rows.

use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView2, Axis};

use crate::error::{EsnError, Result};

pub type StateTensor = Array3<f32>;
pub type MergedState = Array2<f32>;

/// Reverse the first `lengths[i]` time steps of every sequence, in place.
///
/// Padding rows (`t >= lengths[i]`) are left untouched.
pub fn reverse_within_lengths(states: &mut StateTensor, lengths: &[usize]) -> Result<()> {
    check_lengths(states, lengths)?;
    for (i, &len) in lengths.iter().enumerate() {
        if len < 2 {
            continue;
        }
        let reversed = states.slice(s![i, ..len;-1, ..]).to_owned();
        states.slice_mut(s![i, ..len, ..]).assign(&reversed);
    }
    Ok(())
}

/// Copy of `states` with each sequence's real rows time-reversed.
pub fn reversed_within_lengths(states: &StateTensor, lengths: &[usize]) -> Result<StateTensor> {
    let mut restored = states.clone();
    reverse_within_lengths(&mut restored, lengths)?;
    Ok(restored)
}

/// Stack the real rows of every sequence into one `token × feature` matrix,
/// sequence by sequence, in forward time order.
pub fn flatten_tokens(states: &StateTensor, lengths: &[usize]) -> Result<MergedState> {
    check_lengths(states, lengths)?;
    let dim = states.len_of(Axis(2));
    let spans: Vec<ArrayView2<'_, f32>> = lengths
        .iter()
        .enumerate()
        .filter(|&(_, &len)| len > 0)
        .map(|(i, &len)| states.slice(s![i, ..len, ..]))
        .collect();
    if spans.is_empty() {
        return Ok(Array2::zeros((0, dim)));
    }
    Ok(concatenate(Axis(0), &spans)?)
}

/// Concatenate two state tensors along the feature axis.
pub fn concat_state_features(a: &StateTensor, b: &StateTensor) -> Result<StateTensor> {
    if a.len_of(Axis(0)) != b.len_of(Axis(0)) || a.len_of(Axis(1)) != b.len_of(Axis(1)) {
        return Err(EsnError::ShapeMismatch(format!(
            "cannot concatenate states {:?} and {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(concatenate(Axis(2), &[a.view(), b.view()])?)
}

/// Concatenate two merged states along the feature axis.
pub fn concat_features(a: &MergedState, b: &MergedState) -> Result<MergedState> {
    if a.nrows() != b.nrows() {
        return Err(EsnError::ShapeMismatch(format!(
            "cannot concatenate {} rows with {} rows",
            a.nrows(),
            b.nrows()
        )));
    }
    Ok(concatenate(Axis(1), &[a.view(), b.view()])?)
}

/// Stack merged states from several batches along the row axis.
pub fn concat_rows(parts: &[MergedState]) -> Result<MergedState> {
    let Some(first) = parts.first() else {
        return Err(EsnError::EmptyDataset);
    };
    if let Some(bad) = parts.iter().find(|p| p.ncols() != first.ncols()) {
        return Err(EsnError::ShapeMismatch(format!(
            "feature width {} differs from {}",
            bad.ncols(),
            first.ncols()
        )));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Stack label vectors from several batches.
pub fn concat_labels(parts: &[Array1<i64>]) -> Array1<i64> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}

/// Repeat each sequence's label once per real token.
///
/// `labels[i]` appears exactly `lengths[i]` times, consecutively, in sequence order.
pub fn duplicate_labels(labels: &Array1<i64>, lengths: &[usize]) -> Result<Array1<i64>> {
    if labels.len() != lengths.len() {
        return Err(EsnError::ShapeMismatch(format!(
            "{} labels for {} lengths",
            labels.len(),
            lengths.len()
        )));
    }
    Ok(labels
        .iter()
        .zip(lengths)
        .flat_map(|(&label, &len)| std::iter::repeat(label).take(len))
        .collect())
}

/// One-hot encode class ids into `num_classes` columns.
pub fn one_hot(labels: &Array1<i64>, num_classes: usize) -> Result<Array2<f32>> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= num_classes {
            return Err(EsnError::ShapeMismatch(format!(
                "label {} outside 0..{}",
                label, num_classes
            )));
        }
        out[[row, label as usize]] = 1.0;
    }
    Ok(out)
}

fn check_lengths(states: &StateTensor, lengths: &[usize]) -> Result<()> {
    let (batch, time, _) = states.dim();
    if lengths.len() != batch {
        return Err(EsnError::ShapeMismatch(format!(
            "{} lengths for {} sequences",
            lengths.len(),
            batch
        )));
    }
    if let Some(&len) = lengths.iter().find(|&&l| l > time) {
        return Err(EsnError::ShapeMismatch(format!(
            "length {} exceeds {} time steps",
            len, time
        )));
    }
    Ok(())
}
