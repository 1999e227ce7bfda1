//! Batch wire shapes and their normalization.
//!
//! Two wire shapes carry the same information:
//! - **Keyed**: fields looked up by name (`input_ids`, `lengths`, `labels`,
//!   `additional_fts`), the layout produced by dictionary-style loaders.
//! - **Attributed**: a record with named fields (`text`, `label`,
//!   `additional_fts`).
//!
//! The encoder declares which shape it consumes. `BatchNormalizer` is built
//! once with that schema and turns every batch into a `NormalizedBatch`.

use std::collections::HashMap;

use ndarray::{s, Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{EsnError, Result};

pub const INPUT_IDS: &str = "input_ids";
pub const LENGTHS: &str = "lengths";
pub const LABELS: &str = "labels";
pub const ADDITIONAL_FTS: &str = "additional_fts";

/// Which wire shape an encoder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSchema {
    Keyed,
    Attributed,
}

// ─── Token Matrix ────────────────────────────────────

/// Padded token ids plus the true length of every sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMatrix {
    /// `batch × max_len` token ids; positions past a sequence's length hold the pad id.
    pub ids: Array2<usize>,
    /// True (unpadded) length of each sequence.
    pub lengths: Vec<usize>,
}

impl TokenMatrix {
    pub fn new(ids: Array2<usize>, lengths: Vec<usize>) -> Result<Self> {
        if lengths.len() != ids.nrows() {
            return Err(EsnError::ShapeMismatch(format!(
                "{} lengths for {} sequences",
                lengths.len(),
                ids.nrows()
            )));
        }
        if let Some(&too_long) = lengths.iter().find(|&&l| l > ids.ncols()) {
            return Err(EsnError::ShapeMismatch(format!(
                "length {} exceeds padded width {}",
                too_long,
                ids.ncols()
            )));
        }
        Ok(Self { ids, lengths })
    }

    /// Pad ragged sequences to a common width with `pad_id`.
    pub fn from_sequences(sequences: &[Vec<usize>], pad_id: usize) -> Self {
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids = Array2::from_elem((sequences.len(), max_len), pad_id);
        for (i, seq) in sequences.iter().enumerate() {
            for (t, &tok) in seq.iter().enumerate() {
                ids[[i, t]] = tok;
            }
        }
        Self {
            ids,
            lengths: sequences.iter().map(Vec::len).collect(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.ids.nrows()
    }

    pub fn max_len(&self) -> usize {
        self.ids.ncols()
    }

    /// Unpadded tokens of sequence `i`.
    pub fn sequence(&self, i: usize) -> ArrayView1<'_, usize> {
        self.ids.slice(s![i, ..self.lengths[i]])
    }

    /// Total number of real (unpadded) tokens.
    pub fn total_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }
}

// ─── Wire shapes ─────────────────────────────────────

/// A value stored under a name in a keyed batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyedValue {
    Tokens(Array2<usize>),
    Lengths(Vec<usize>),
    Labels(Array1<i64>),
    Features(Array2<f32>),
}

impl KeyedValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Tokens(_) => "tokens",
            Self::Lengths(_) => "lengths",
            Self::Labels(_) => "labels",
            Self::Features(_) => "features",
        }
    }
}

/// Batch whose fields are retrieved by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedBatch {
    fields: HashMap<String, KeyedValue>,
}

impl KeyedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens(tokens: TokenMatrix) -> Self {
        Self::new()
            .with(INPUT_IDS, KeyedValue::Tokens(tokens.ids))
            .with(LENGTHS, KeyedValue::Lengths(tokens.lengths))
    }

    pub fn with(mut self, name: &str, value: KeyedValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_labels(self, labels: Array1<i64>) -> Self {
        self.with(LABELS, KeyedValue::Labels(labels))
    }

    pub fn with_additional_fts(self, fts: Array2<f32>) -> Self {
        self.with(ADDITIONAL_FTS, KeyedValue::Features(fts))
    }

    pub fn insert(&mut self, name: &str, value: KeyedValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&KeyedValue> {
        self.fields.get(name)
    }
}

/// Batch whose fields are named members of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributedBatch {
    pub text: TokenMatrix,
    pub label: Option<Array1<i64>>,
    pub additional_fts: Option<Array2<f32>>,
}

impl AttributedBatch {
    pub fn new(text: TokenMatrix) -> Self {
        Self {
            text,
            label: None,
            additional_fts: None,
        }
    }

    pub fn with_labels(mut self, labels: Array1<i64>) -> Self {
        self.label = Some(labels);
        self
    }

    pub fn with_additional_fts(mut self, fts: Array2<f32>) -> Self {
        self.additional_fts = Some(fts);
        self
    }
}

/// One batch in either wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Keyed(KeyedBatch),
    Attributed(AttributedBatch),
}

impl Batch {
    pub fn schema(&self) -> BatchSchema {
        match self {
            Self::Keyed(_) => BatchSchema::Keyed,
            Self::Attributed(_) => BatchSchema::Attributed,
        }
    }

    /// Build a batch of `schema` shape from its canonical parts.
    pub fn build(
        schema: BatchSchema,
        tokens: TokenMatrix,
        labels: Option<Array1<i64>>,
        additional_fts: Option<Array2<f32>>,
    ) -> Self {
        match schema {
            BatchSchema::Keyed => {
                let mut batch = KeyedBatch::from_tokens(tokens);
                if let Some(labels) = labels {
                    batch.insert(LABELS, KeyedValue::Labels(labels));
                }
                if let Some(fts) = additional_fts {
                    batch.insert(ADDITIONAL_FTS, KeyedValue::Features(fts));
                }
                Self::Keyed(batch)
            }
            BatchSchema::Attributed => Self::Attributed(AttributedBatch {
                text: tokens,
                label: labels,
                additional_fts,
            }),
        }
    }
}

impl From<KeyedBatch> for Batch {
    fn from(batch: KeyedBatch) -> Self {
        Self::Keyed(batch)
    }
}

impl From<AttributedBatch> for Batch {
    fn from(batch: AttributedBatch) -> Self {
        Self::Attributed(batch)
    }
}

// ─── Normalization ───────────────────────────────────

/// Canonical view of a batch: tokens, optional labels, optional extra features.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub tokens: TokenMatrix,
    pub labels: Option<Array1<i64>>,
    pub additional_fts: Option<Array2<f32>>,
}

impl NormalizedBatch {
    pub fn has_labels(&self) -> bool {
        self.labels.is_some()
    }
}

/// Extracts the canonical tuple from batches of a fixed wire shape.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormalizer {
    schema: BatchSchema,
}

impl BatchNormalizer {
    pub fn new(schema: BatchSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> BatchSchema {
        self.schema
    }

    pub fn normalize(&self, batch: &Batch) -> Result<NormalizedBatch> {
        let normalized = match (self.schema, batch) {
            (BatchSchema::Keyed, Batch::Keyed(keyed)) => Self::normalize_keyed(keyed)?,
            (BatchSchema::Attributed, Batch::Attributed(record)) => NormalizedBatch {
                tokens: TokenMatrix::new(record.text.ids.clone(), record.text.lengths.clone())?,
                labels: record.label.clone(),
                additional_fts: record.additional_fts.clone(),
            },
            (expected, other) => {
                return Err(EsnError::SchemaMismatch {
                    expected,
                    found: other.schema(),
                })
            }
        };

        let n = normalized.tokens.batch_size();
        if let Some(labels) = &normalized.labels {
            if labels.len() != n {
                return Err(EsnError::ShapeMismatch(format!(
                    "{} labels for {} sequences",
                    labels.len(),
                    n
                )));
            }
        }
        if let Some(fts) = &normalized.additional_fts {
            if fts.nrows() != n {
                return Err(EsnError::ShapeMismatch(format!(
                    "{} additional feature rows for {} sequences",
                    fts.nrows(),
                    n
                )));
            }
        }
        Ok(normalized)
    }

    fn normalize_keyed(batch: &KeyedBatch) -> Result<NormalizedBatch> {
        let ids = match batch.get(INPUT_IDS) {
            Some(KeyedValue::Tokens(ids)) => ids.clone(),
            Some(other) => return Err(wrong_kind(INPUT_IDS, other)),
            None => return Err(EsnError::MissingField(INPUT_IDS.to_string())),
        };
        let lengths = match batch.get(LENGTHS) {
            Some(KeyedValue::Lengths(lengths)) => lengths.clone(),
            Some(other) => return Err(wrong_kind(LENGTHS, other)),
            None => return Err(EsnError::MissingField(LENGTHS.to_string())),
        };
        let labels = match batch.get(LABELS) {
            Some(KeyedValue::Labels(labels)) => Some(labels.clone()),
            Some(other) => return Err(wrong_kind(LABELS, other)),
            None => None,
        };
        let additional_fts = match batch.get(ADDITIONAL_FTS) {
            Some(KeyedValue::Features(fts)) => Some(fts.clone()),
            Some(other) => return Err(wrong_kind(ADDITIONAL_FTS, other)),
            None => None,
        };

        Ok(NormalizedBatch {
            tokens: TokenMatrix::new(ids, lengths)?,
            labels,
            additional_fts,
        })
    }
}

fn wrong_kind(field: &str, value: &KeyedValue) -> EsnError {
    EsnError::ShapeMismatch(format!("field '{}' holds {}", field, value.kind()))
}
