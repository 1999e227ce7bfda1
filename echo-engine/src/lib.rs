// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

pub mod error;
pub mod config;
pub mod batch;
pub mod state;
pub mod encoder;
pub mod pooling;
pub mod pooler;
pub mod readout;
pub mod loss;
pub mod optim;
pub mod pipeline;
pub mod training;
pub mod predict;
pub mod esn;

pub use error::{EsnError, Result};
pub use config::{Activation, Device, Distribution, EsnConfig, FitOptions, LayerMode, ReservoirConfig};
pub use batch::{AttributedBatch, Batch, BatchNormalizer, BatchSchema, KeyedBatch, KeyedValue, NormalizedBatch, TokenMatrix};
pub use state::{MergedState, StateTensor};
pub use encoder::{build_encoder, DeepReservoir, Embedding, LinearLayer, NoLayer, Reservoir, SequenceEncoder};
pub use pooling::{MergingStrategy, PoolingReduction, PoolingStrategy, SequencePooling, TokenPassthrough};
pub use pooler::{DirectionalPooler, PoolerInput};
pub use readout::{Capability, DeepReadout, FrozenLinear, LogisticRegression, NearestCentroid, Param, ParamSet, RawOutputs, ReadoutAlgorithm, RidgeRegression};
pub use loss::{BceWithLogitsLoss, CrossEntropyLoss, Loss, MseLoss, MultiLabelSoftMarginLoss, TargetKind, Targets};
pub use optim::{Adam, Optimizer, Sgd};
pub use pipeline::{FeaturePipeline, PreparedBatch};
pub use training::{ClosedFormTrainer, IterativeTrainer, LossHistory, LossSample, TrainingDispatcher, TrainingPath};
pub use predict::{argmax_rows, Evaluation, PredictionAggregator};
pub use esn::EchoStateNetwork;
