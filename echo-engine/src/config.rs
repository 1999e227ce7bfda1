//! Runtime configuration for the Echo State Network.
//!
//! Defines the encoder variant (`LayerMode`, `deep`), the reservoir
//! hyper-parameters, the merging policy (`pooling`, `bidirectional`) and the
//! compute device. All types serialize to JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::BatchSchema;
use crate::error::{EsnError, Result};
use crate::pooler::DirectionalPooler;
use crate::pooling::{MergingStrategy, PoolingStrategy};

/// Which encoder variant sits between the embedding and the readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerMode {
    /// Classic ESN: embedding → reservoir → readout
    RecurrentLayer,
    /// Custom baseline: embedding → fixed random projection → readout
    LinearLayer,
    /// Simple baseline: embedding → readout
    NoLayer,
}

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// CPU reference implementation
    Cpu,
    /// Accelerator. No accelerator kernels ship; requests run on CPU.
    Gpu { device_id: usize },
}

/// Distribution used to draw input and reservoir weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Uniform in `[-scaling, scaling]`
    Uniform,
    /// Normal with the configured `mean` and `std`
    Gaussian,
}

/// Cell activation of the reservoir and linear layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Relu,
    Identity,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            Self::Identity => x,
        }
    }
}

/// Hyper-parameters of the embedding and the fixed (untrained) layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    /// Number of rows in the embedding table
    pub vocab_size: usize,
    /// Embedding dimension (reservoir input dimension)
    pub input_dim: usize,
    /// Number of reservoir cells
    pub reservoir_dim: usize,
    /// Target spectral radius of the recurrent matrix
    pub spectral_radius: f32,
    /// Leaking rate in `(0, 1]`: share of the new activation in each update
    pub leaking_rate: f32,
    /// Fraction of recurrent weights forced to zero, in `[0, 1)`
    pub sparsity: f32,
    /// Bound of the uniform input weights
    pub input_scaling: f32,
    /// Bound of the uniform bias
    pub bias_scaling: f32,
    pub distribution: Distribution,
    /// Mean of gaussian weights
    pub mean: f32,
    /// Standard deviation of gaussian weights
    pub std: f32,
    pub activation: Activation,
    /// Token id used for padding
    pub pad_id: usize,
    /// Seed for every random draw of the encoder
    pub seed: u64,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            vocab_size: 1000,
            input_dim: 32,
            reservoir_dim: 256,
            spectral_radius: 0.9,
            leaking_rate: 0.5,
            sparsity: 0.9,
            input_scaling: 1.0,
            bias_scaling: 0.1,
            distribution: Distribution::Uniform,
            mean: 0.0,
            std: 1.0,
            activation: Activation::Tanh,
            pad_id: 0,
            seed: 42,
        }
    }
}

/// Full configuration for the Echo State Network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsnConfig {
    pub mode: LayerMode,
    /// Stack `deep_layers` reservoirs instead of a single one
    pub deep: bool,
    /// Number of stacked reservoirs (used only when `deep`)
    pub deep_layers: usize,
    /// Also run every sequence in reverse and merge both directions
    pub bidirectional: bool,
    /// Merging strategy; `None` keeps one row per token
    pub pooling: Option<PoolingStrategy>,
    /// Token ids favoured by lexicon-weighted pooling
    pub lexicon: Vec<usize>,
    pub device: Device,
    /// Wire shape of the batches the encoder consumes
    #[serde(default = "default_schema")]
    pub batch_schema: BatchSchema,
    pub reservoir: ReservoirConfig,
}

fn default_schema() -> BatchSchema {
    BatchSchema::Attributed
}

impl Default for EsnConfig {
    fn default() -> Self {
        Self::classic(1000, 32, 256)
    }
}

impl EsnConfig {
    /// Classic single-reservoir ESN with mean pooling.
    pub fn classic(vocab_size: usize, input_dim: usize, reservoir_dim: usize) -> Self {
        Self {
            mode: LayerMode::RecurrentLayer,
            deep: false,
            deep_layers: 1,
            bidirectional: false,
            pooling: Some(PoolingStrategy::Mean),
            lexicon: Vec::new(),
            device: Device::Cpu,
            batch_schema: BatchSchema::Attributed,
            reservoir: ReservoirConfig {
                vocab_size,
                input_dim,
                reservoir_dim,
                ..ReservoirConfig::default()
            },
        }
    }

    /// Embedding followed by a fixed random projection.
    pub fn linear_baseline(vocab_size: usize, input_dim: usize, projection_dim: usize) -> Self {
        Self {
            mode: LayerMode::LinearLayer,
            ..Self::classic(vocab_size, input_dim, projection_dim)
        }
    }

    /// Embedding fed straight to the readout.
    pub fn embedding_baseline(vocab_size: usize, input_dim: usize) -> Self {
        Self {
            mode: LayerMode::NoLayer,
            ..Self::classic(vocab_size, input_dim, input_dim)
        }
    }

    pub fn with_pooling(mut self, pooling: Option<PoolingStrategy>) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn with_batch_schema(mut self, schema: BatchSchema) -> Self {
        self.batch_schema = schema;
        self
    }

    pub fn with_deep(mut self, layers: usize) -> Self {
        self.deep = true;
        self.deep_layers = layers;
        self
    }

    /// Width of one direction's per-token states.
    pub fn state_dim(&self) -> usize {
        match self.mode {
            LayerMode::RecurrentLayer if self.deep => {
                self.reservoir.reservoir_dim * self.deep_layers
            }
            LayerMode::RecurrentLayer | LayerMode::LinearLayer => self.reservoir.reservoir_dim,
            LayerMode::NoLayer => self.reservoir.input_dim,
        }
    }

    /// Width of the merged rows fed to the readout, for sizing iterative readouts
    /// before the network exists.
    pub fn feature_dim(&self, extra_dim: usize) -> usize {
        DirectionalPooler::new(
            MergingStrategy::new(self.pooling, &self.lexicon),
            self.bidirectional,
        )
        .output_dim(self.state_dim(), extra_dim)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.reservoir;
        if r.vocab_size == 0 || r.input_dim == 0 || r.reservoir_dim == 0 {
            return Err(EsnError::InvalidConfig(
                "vocab_size, input_dim and reservoir_dim must be positive".into(),
            ));
        }
        if !(r.leaking_rate > 0.0 && r.leaking_rate <= 1.0) {
            return Err(EsnError::InvalidConfig(format!(
                "leaking_rate {} outside (0, 1]",
                r.leaking_rate
            )));
        }
        if !(0.0..1.0).contains(&r.sparsity) {
            return Err(EsnError::InvalidConfig(format!(
                "sparsity {} outside [0, 1)",
                r.sparsity
            )));
        }
        if r.pad_id >= r.vocab_size {
            return Err(EsnError::InvalidConfig(format!(
                "pad_id {} outside vocabulary of {}",
                r.pad_id, r.vocab_size
            )));
        }
        if self.deep && self.mode != LayerMode::RecurrentLayer {
            return Err(EsnError::InvalidConfig(format!(
                "deep encoder needs recurrent_layer mode, got {:?}",
                self.mode
            )));
        }
        if self.deep && self.deep_layers == 0 {
            return Err(EsnError::InvalidConfig(
                "deep encoder needs at least one layer".into(),
            ));
        }
        if self.pooling == Some(PoolingStrategy::LexiconWeighted) && self.lexicon.is_empty() {
            return Err(EsnError::InvalidConfig(
                "lexicon-weighted pooling needs a non-empty lexicon".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Options of a `fit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Passes over the training set (iterative training only)
    pub epochs: usize,
    /// Record the loss every `iter_steps` optimizer steps (iterative training only)
    pub iter_steps: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            iter_steps: 100,
        }
    }
}
