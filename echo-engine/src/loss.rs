//! Loss functions for iterative readout training.
//!
//! Every loss returns `(loss value, gradient w.r.t. outputs)`, averaged over
//! the batch, so the gradient can be handed straight to `backward`.

use ndarray::{Array1, Array2, Axis, Zip};

use crate::error::{EsnError, Result};

/// Target encoding a loss consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// One integer class id per row
    ClassIndices,
    /// `rows × outputs` one-hot matrix
    OneHot,
}

/// Targets handed to `Loss::compute`.
#[derive(Debug, Clone, Copy)]
pub enum Targets<'a> {
    Classes(&'a Array1<i64>),
    OneHot(&'a Array2<f32>),
}

pub trait Loss: Send + Sync {
    fn name(&self) -> &str;

    fn target_kind(&self) -> TargetKind;

    fn compute(&self, outputs: &Array2<f32>, targets: Targets<'_>) -> Result<(f32, Array2<f32>)>;
}

fn dense_targets<'a>(
    name: &str,
    outputs: &Array2<f32>,
    targets: Targets<'a>,
) -> Result<&'a Array2<f32>> {
    match targets {
        Targets::OneHot(t) if t.dim() == outputs.dim() => Ok(t),
        Targets::OneHot(t) => Err(EsnError::ShapeMismatch(format!(
            "{}: targets {:?} for outputs {:?}",
            name,
            t.dim(),
            outputs.dim()
        ))),
        Targets::Classes(_) => Err(EsnError::ShapeMismatch(format!(
            "{} needs one-hot targets",
            name
        ))),
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `log(1 + e^x)` without overflow.
#[inline]
fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

// ─── Cross Entropy ───────────────────────────────────

/// Softmax cross-entropy over class-index targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn target_kind(&self) -> TargetKind {
        TargetKind::ClassIndices
    }

    fn compute(&self, outputs: &Array2<f32>, targets: Targets<'_>) -> Result<(f32, Array2<f32>)> {
        let Targets::Classes(labels) = targets else {
            return Err(EsnError::ShapeMismatch(
                "cross_entropy needs class-index targets".into(),
            ));
        };
        let (n, k) = outputs.dim();
        if labels.len() != n {
            return Err(EsnError::ShapeMismatch(format!(
                "{} labels for {} output rows",
                labels.len(),
                n
            )));
        }
        if n == 0 {
            return Ok((0.0, Array2::zeros((0, k))));
        }

        let mut grad = Array2::<f32>::zeros((n, k));
        let mut total = 0.0f32;
        for ((logits, mut g), &label) in outputs
            .rows()
            .into_iter()
            .zip(grad.rows_mut())
            .zip(labels.iter())
        {
            if label < 0 || label as usize >= k {
                return Err(EsnError::ShapeMismatch(format!(
                    "label {} outside 0..{}",
                    label, k
                )));
            }
            let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            let exp = logits.mapv(|x| (x - max).exp());
            let sum = exp.sum();
            let probs = exp / sum;
            total -= probs[label as usize].max(1e-12).ln();
            g.assign(&probs);
            g[label as usize] -= 1.0;
        }
        grad /= n as f32;
        Ok((total / n as f32, grad))
    }
}

// ─── Binary Cross Entropy ────────────────────────────

/// Element-wise sigmoid + binary cross-entropy over one-hot targets,
/// averaged over every element.
#[derive(Debug, Clone, Copy, Default)]
pub struct BceWithLogitsLoss;

impl Loss for BceWithLogitsLoss {
    fn name(&self) -> &str {
        "bce_with_logits"
    }

    fn target_kind(&self) -> TargetKind {
        TargetKind::OneHot
    }

    fn compute(&self, outputs: &Array2<f32>, targets: Targets<'_>) -> Result<(f32, Array2<f32>)> {
        let y = dense_targets(self.name(), outputs, targets)?;
        let count = outputs.len().max(1) as f32;
        let mut loss = 0.0f32;
        Zip::from(outputs).and(y).for_each(|&x, &t| {
            loss += softplus(x) - x * t;
        });
        let grad = Zip::from(outputs)
            .and(y)
            .map_collect(|&x, &t| (sigmoid(x) - t) / count);
        Ok((loss / count, grad))
    }
}

// ─── Multi-label Soft Margin ─────────────────────────

/// Per-row mean of sigmoid cross-entropy across classes, then batch mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiLabelSoftMarginLoss;

impl Loss for MultiLabelSoftMarginLoss {
    fn name(&self) -> &str {
        "multilabel_soft_margin"
    }

    fn target_kind(&self) -> TargetKind {
        TargetKind::OneHot
    }

    fn compute(&self, outputs: &Array2<f32>, targets: Targets<'_>) -> Result<(f32, Array2<f32>)> {
        let y = dense_targets(self.name(), outputs, targets)?;
        let (n, k) = outputs.dim();
        if n == 0 || k == 0 {
            return Ok((0.0, Array2::zeros((n, k))));
        }
        // -[t·log σ(x) + (1 - t)·log(1 - σ(x))] = softplus(x) - t·x
        let per_element = Zip::from(outputs)
            .and(y)
            .map_collect(|&x, &t| softplus(x) - t * x);
        let per_row = per_element.sum_axis(Axis(1)) / k as f32;
        let loss = per_row.sum() / n as f32;
        let scale = 1.0 / (n * k) as f32;
        let grad = Zip::from(outputs)
            .and(y)
            .map_collect(|&x, &t| (sigmoid(x) - t) * scale);
        Ok((loss, grad))
    }
}

// ─── Mean Squared Error ──────────────────────────────

/// `mean((outputs - targets)²)` over one-hot targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn name(&self) -> &str {
        "mse"
    }

    fn target_kind(&self) -> TargetKind {
        TargetKind::OneHot
    }

    fn compute(&self, outputs: &Array2<f32>, targets: Targets<'_>) -> Result<(f32, Array2<f32>)> {
        let y = dense_targets(self.name(), outputs, targets)?;
        let diff = outputs - y;
        let count = diff.len().max(1) as f32;
        let loss = diff.mapv(|d| d * d).sum() / count;
        Ok((loss, diff * (2.0 / count)))
    }
}
