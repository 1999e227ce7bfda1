//! Turns raw readout outputs into per-sequence labels and, when ground truth
//! is present, an accuracy score.

use std::borrow::Borrow;

use ndarray::{s, Array1, Array2, Axis};
use tracing::{debug, info};

use crate::batch::Batch;
use crate::error::{EsnError, Result};
use crate::pipeline::FeaturePipeline;
use crate::readout::{RawOutputs, ReadoutAlgorithm};

/// Index of the largest value of each row; ties go to the lowest index.
///
/// NaN never wins. An empty row yields 0.
pub fn argmax_rows(scores: &Array2<f32>) -> Array1<i64> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0usize;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] || (row[best].is_nan() && !v.is_nan()) {
                    best = i;
                }
            }
            best as i64
        })
        .collect()
}

/// Running correct/total count across labelled batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub correct: usize,
    pub total: usize,
}

impl Evaluation {
    pub fn record(&mut self, predictions: &Array1<i64>, labels: &Array1<i64>) -> Result<()> {
        if predictions.len() != labels.len() {
            return Err(EsnError::ShapeMismatch(format!(
                "{} predictions for {} labels",
                predictions.len(),
                labels.len()
            )));
        }
        self.total += labels.len();
        self.correct += predictions
            .iter()
            .zip(labels.iter())
            .filter(|(p, l)| p == l)
            .count();
        Ok(())
    }

    /// `100 · correct / total`, or `None` when no labelled sequence was seen.
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(100.0 * self.correct as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PredictionAggregator {
    pooling: bool,
}

impl PredictionAggregator {
    pub fn new(pooling: bool) -> Self {
        Self { pooling }
    }

    /// One label per sequence from a batch's raw outputs.
    pub fn batch_predictions(
        &self,
        outputs: RawOutputs,
        lengths: &[usize],
        num_classes: usize,
    ) -> Result<Array1<i64>> {
        if self.pooling {
            if outputs.num_rows() != lengths.len() {
                return Err(EsnError::ShapeMismatch(format!(
                    "{} output rows for {} sequences",
                    outputs.num_rows(),
                    lengths.len()
                )));
            }
            return Ok(match outputs {
                RawOutputs::Scores(scores) if scores.ncols() == 1 => {
                    scores.column(0).mapv(|v| v as i64)
                }
                RawOutputs::Scores(scores) => argmax_rows(&scores),
                RawOutputs::Classes(classes) => classes,
            });
        }

        let total: usize = lengths.iter().sum();
        if outputs.num_rows() != total {
            return Err(EsnError::ShapeMismatch(format!(
                "{} output rows for {} tokens",
                outputs.num_rows(),
                total
            )));
        }
        let scores = match outputs {
            RawOutputs::Scores(scores) => scores,
            RawOutputs::Classes(classes) => votes(&classes, num_classes)?,
        };
        Ok(argmax_rows(&span_means(&scores, lengths)))
    }

    /// Predict every batch in order; accuracy over the labelled ones.
    pub fn predict<I>(
        &self,
        pipeline: &FeaturePipeline<'_>,
        readout: &dyn ReadoutAlgorithm,
        batches: I,
        verbose: bool,
    ) -> Result<(Vec<i64>, Option<f64>)>
    where
        I: IntoIterator,
        I::Item: Borrow<Batch>,
    {
        let mut predictions = Vec::new();
        let mut evaluation = Evaluation::default();
        for (index, batch) in batches.into_iter().enumerate() {
            let prepared = pipeline.prepare(batch)?;
            let outputs = readout.forward(&prepared.features)?;
            let batch_preds =
                self.batch_predictions(outputs, &prepared.lengths, readout.output_dim())?;
            if let Some(labels) = &prepared.labels {
                evaluation.record(&batch_preds, labels)?;
            }
            debug!(batch = index, sequences = batch_preds.len(), "predicted batch");
            predictions.extend(batch_preds.iter().copied());
        }

        let accuracy = evaluation.accuracy();
        if verbose {
            if let Some(accuracy) = accuracy {
                info!(accuracy, correct = evaluation.correct, total = evaluation.total, "accuracy");
            }
        }
        Ok((predictions, accuracy))
    }
}

/// Mean of each sequence's consecutive row span; empty spans give zeros.
fn span_means(scores: &Array2<f32>, lengths: &[usize]) -> Array2<f32> {
    let mut means = Array2::zeros((lengths.len(), scores.ncols()));
    let mut offset = 0;
    for (i, &len) in lengths.iter().enumerate() {
        if len > 0 {
            let span = scores.slice(s![offset..offset + len, ..]);
            means.row_mut(i).assign(&(span.sum_axis(Axis(0)) / len as f32));
        }
        offset += len;
    }
    means
}

/// Per-token class ids as one-hot rows.
fn votes(classes: &Array1<i64>, num_classes: usize) -> Result<Array2<f32>> {
    let width = classes
        .iter()
        .map(|&c| c.max(0) as usize + 1)
        .max()
        .unwrap_or(0)
        .max(num_classes);
    let mut out = Array2::zeros((classes.len(), width));
    for (row, &class) in classes.iter().enumerate() {
        if class < 0 {
            return Err(EsnError::ShapeMismatch(format!("negative class id {}", class)));
        }
        out[[row, class as usize]] = 1.0;
    }
    Ok(out)
}
