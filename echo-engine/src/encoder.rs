//! Sequence encoders: embedding lookup followed by a fixed (untrained) layer.
//!
//! Four variants implement `SequenceEncoder`:
//! 1. **Reservoir**: leaky-integrated recurrent layer, recurrent matrix
//!    scaled to a target spectral radius
//! 2. **DeepReservoir**: stacked reservoirs, states of every layer concatenated
//! 3. **LinearLayer**: fixed random projection, no recurrence
//! 4. **NoLayer**: embedding passthrough
//!
//! Every encoder returns `batch × time × feature` states plus the true
//! lengths. Padding steps are left at zero.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use rand::distributions::{Distribution as _, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use tracing::debug;

use crate::batch::{BatchSchema, TokenMatrix};
use crate::config::{Activation, Distribution, EsnConfig, LayerMode, ReservoirConfig};
use crate::error::{EsnError, Result};
use crate::state::StateTensor;

/// Contract of the component that turns token ids into per-token states.
pub trait SequenceEncoder: Send + Sync {
    /// Encode a batch in forward time order.
    fn forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)>;

    /// Encode every sequence read backwards.
    ///
    /// Row `t` of sequence `i` holds the state after reading token
    /// `lengths[i] - 1 - t`. Padding stays at the end.
    fn reverse_forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)> {
        self.forward(&reverse_tokens(tokens))
    }

    /// Prime the initial state with `sequence`; later calls start from the primed state.
    fn warm_up(&mut self, sequence: &[usize]) -> Result<()>;

    /// Wire shape of the batches this encoder consumes.
    fn schema(&self) -> BatchSchema;

    /// Width of the per-token states.
    fn output_dim(&self) -> usize;

    fn name(&self) -> &str;
}

/// Copy of `tokens` with each sequence's real tokens reversed.
pub fn reverse_tokens(tokens: &TokenMatrix) -> TokenMatrix {
    let mut reversed = tokens.clone();
    for (i, &len) in tokens.lengths.iter().enumerate() {
        let row = tokens.ids.slice(s![i, ..len;-1]);
        reversed.ids.slice_mut(s![i, ..len]).assign(&row);
    }
    reversed
}

/// Build the encoder selected by `config.mode` and `config.deep`.
pub fn build_encoder(config: &EsnConfig) -> Result<Box<dyn SequenceEncoder>> {
    let r = &config.reservoir;
    let embedding = Embedding::random(r.vocab_size, r.input_dim, r.seed).with_padding(r.pad_id);
    let schema = config.batch_schema;
    let encoder: Box<dyn SequenceEncoder> = match config.mode {
        LayerMode::RecurrentLayer if config.deep => Box::new(
            DeepReservoir::new(embedding, r, config.deep_layers)?.with_schema(schema),
        ),
        LayerMode::RecurrentLayer => Box::new(Reservoir::new(embedding, r)?.with_schema(schema)),
        LayerMode::LinearLayer => Box::new(LinearLayer::new(embedding, r)?.with_schema(schema)),
        LayerMode::NoLayer => Box::new(NoLayer::new(embedding).with_schema(schema)),
    };
    debug!(
        encoder = encoder.name(),
        output_dim = encoder.output_dim(),
        ?schema,
        "built encoder"
    );
    Ok(encoder)
}

// ─── Embedding ───────────────────────────────────────

/// Token id → dense vector lookup table.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// `vocab_size × dim`
    pub weights: Array2<f32>,
}

impl Embedding {
    pub fn new(weights: Array2<f32>) -> Self {
        Self { weights }
    }

    /// Uniform weights in `[-1, 1]`.
    pub fn random(vocab_size: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new_inclusive(-1.0f32, 1.0);
        Self::new(Array2::from_shape_simple_fn((vocab_size, dim), || {
            dist.sample(&mut rng)
        }))
    }

    /// Zero the row of `pad_id` so pad tokens read as a null input.
    pub fn with_padding(mut self, pad_id: usize) -> Self {
        if pad_id < self.vocab_size() {
            self.weights.row_mut(pad_id).fill(0.0);
        }
        self
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn lookup(&self, token: usize) -> Result<ArrayView1<'_, f32>> {
        if token >= self.vocab_size() {
            return Err(EsnError::ShapeMismatch(format!(
                "token id {} outside vocabulary of {}",
                token,
                self.vocab_size()
            )));
        }
        Ok(self.weights.row(token))
    }

    /// Embed a batch: `batch × max_len × dim`, padding steps left at zero.
    pub fn embed(&self, tokens: &TokenMatrix) -> Result<Array3<f32>> {
        let mut out = Array3::zeros((tokens.batch_size(), tokens.max_len(), self.dim()));
        for (i, &len) in tokens.lengths.iter().enumerate() {
            for t in 0..len {
                out.slice_mut(s![i, t, ..])
                    .assign(&self.lookup(tokens.ids[[i, t]])?);
            }
        }
        Ok(out)
    }

    /// Embed one unpadded sequence: `len × dim`.
    pub fn embed_sequence(&self, sequence: &[usize]) -> Result<Array2<f32>> {
        let mut out = Array2::zeros((sequence.len(), self.dim()));
        for (t, &tok) in sequence.iter().enumerate() {
            out.row_mut(t).assign(&self.lookup(tok)?);
        }
        Ok(out)
    }
}

// ─── Weight generation ───────────────────────────────

fn sample_matrix(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    config: &ReservoirConfig,
    scaling: f32,
) -> Result<Array2<f32>> {
    match config.distribution {
        Distribution::Uniform => {
            let bound = scaling.abs();
            let dist = Uniform::new_inclusive(-bound, bound);
            Ok(Array2::from_shape_simple_fn((rows, cols), || dist.sample(rng)))
        }
        Distribution::Gaussian => {
            let dist = Normal::new(config.mean, config.std)
                .map_err(|e| EsnError::InvalidConfig(format!("gaussian weights: {}", e)))?;
            Ok(Array2::from_shape_simple_fn((rows, cols), || dist.sample(rng)))
        }
    }
}

fn sample_bias(rng: &mut StdRng, dim: usize, bias_scaling: f32) -> Array1<f32> {
    let bound = bias_scaling.abs();
    let dist = Uniform::new_inclusive(-bound, bound);
    Array1::from_shape_simple_fn(dim, || dist.sample(rng))
}

/// Estimate the spectral radius of `w` from the growth rate of `‖Wᵏv‖`.
///
/// The geometric mean of per-step growth also converges when the dominant
/// eigenvalues form a complex pair, where plain power iteration oscillates.
pub fn spectral_radius_estimate(w: &Array2<f32>) -> f32 {
    const BURN_IN: usize = 20;
    const STEPS: usize = 200;

    let n = w.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut v = Array1::from_elem(n, 1.0 / (n as f32).sqrt());
    let mut log_growth = 0.0f64;
    for step in 0..(BURN_IN + STEPS) {
        let wv = w.dot(&v);
        let norm = wv.dot(&wv).sqrt();
        if norm < 1e-12 {
            return 0.0;
        }
        if step >= BURN_IN {
            log_growth += (norm as f64).ln();
        }
        v = wv / norm;
    }
    (log_growth / STEPS as f64).exp() as f32
}

// ─── Reservoir ───────────────────────────────────────

/// One leaky-integrated recurrent layer.
///
/// `x_t = (1 - a)·x_{t-1} + a·f(W_in·u_t + W·x_{t-1} + b)`
#[derive(Debug, Clone)]
pub struct ReservoirCell {
    /// `reservoir_dim × input_dim`
    pub w_in: Array2<f32>,
    /// `reservoir_dim × reservoir_dim`
    pub w_res: Array2<f32>,
    pub bias: Array1<f32>,
    pub leaking_rate: f32,
    pub activation: Activation,
    /// State every sequence starts from; moved by warm-up
    pub initial_state: Array1<f32>,
}

impl ReservoirCell {
    pub fn random(input_dim: usize, config: &ReservoirConfig, seed: u64) -> Result<Self> {
        let n = config.reservoir_dim;
        let mut rng = StdRng::seed_from_u64(seed);

        let w_in = sample_matrix(&mut rng, n, input_dim, config, config.input_scaling)?;
        let mut w_res = sample_matrix(&mut rng, n, n, config, 1.0)?;
        if config.sparsity > 0.0 {
            w_res.mapv_inplace(|w| if rng.gen::<f32>() < config.sparsity { 0.0 } else { w });
        }
        let radius = spectral_radius_estimate(&w_res);
        if radius > 1e-8 {
            w_res *= config.spectral_radius / radius;
        }
        let bias = sample_bias(&mut rng, n, config.bias_scaling);

        Ok(Self {
            w_in,
            w_res,
            bias,
            leaking_rate: config.leaking_rate,
            activation: config.activation,
            initial_state: Array1::zeros(n),
        })
    }

    pub fn dim(&self) -> usize {
        self.w_res.nrows()
    }

    #[inline]
    fn step(&self, state: &Array1<f32>, input: ArrayView1<'_, f32>) -> Array1<f32> {
        let pre = self.w_in.dot(&input) + self.w_res.dot(state) + &self.bias;
        let a = self.leaking_rate;
        let act = self.activation;
        let mut next = state * (1.0 - a);
        next.zip_mut_with(&pre, |x, &p| *x += a * act.apply(p));
        next
    }

    /// Run one sequence (`len × input_dim`) from `start`; returns `len × dim`.
    pub fn run_sequence(&self, inputs: &Array2<f32>, start: &Array1<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((inputs.nrows(), self.dim()));
        let mut state = start.clone();
        for (t, input) in inputs.axis_iter(Axis(0)).enumerate() {
            state = self.step(&state, input);
            out.row_mut(t).assign(&state);
        }
        out
    }

    /// Run a padded batch (`batch × time × input_dim`); padding steps stay zero.
    pub fn run(&self, inputs: &Array3<f32>, lengths: &[usize]) -> Array3<f32> {
        let (batch, time, _) = inputs.dim();
        let mut out = Array3::zeros((batch, time, self.dim()));
        for (i, &len) in lengths.iter().enumerate() {
            let mut state = self.initial_state.clone();
            for t in 0..len {
                state = self.step(&state, inputs.slice(s![i, t, ..]));
                out.slice_mut(s![i, t, ..]).assign(&state);
            }
        }
        out
    }
}

/// Classic single-layer reservoir.
#[derive(Debug, Clone)]
pub struct Reservoir {
    pub embedding: Embedding,
    pub cell: ReservoirCell,
    schema: BatchSchema,
}

impl Reservoir {
    pub fn new(embedding: Embedding, config: &ReservoirConfig) -> Result<Self> {
        let cell = ReservoirCell::random(embedding.dim(), config, config.seed.wrapping_add(1))?;
        Ok(Self {
            embedding,
            cell,
            schema: BatchSchema::Attributed,
        })
    }

    pub fn with_schema(mut self, schema: BatchSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl SequenceEncoder for Reservoir {
    fn forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)> {
        let inputs = self.embedding.embed(tokens)?;
        Ok((self.cell.run(&inputs, &tokens.lengths), tokens.lengths.clone()))
    }

    fn warm_up(&mut self, sequence: &[usize]) -> Result<()> {
        if sequence.is_empty() {
            return Ok(());
        }
        let inputs = self.embedding.embed_sequence(sequence)?;
        let states = self.cell.run_sequence(&inputs, &self.cell.initial_state);
        self.cell.initial_state = states.row(states.nrows() - 1).to_owned();
        Ok(())
    }

    fn schema(&self) -> BatchSchema {
        self.schema
    }

    fn output_dim(&self) -> usize {
        self.cell.dim()
    }

    fn name(&self) -> &str {
        "reservoir"
    }
}

// ─── Deep Reservoir ──────────────────────────────────

/// Stacked reservoirs: layer `k` reads the states of layer `k - 1`.
///
/// Output is the concatenation of every layer's states, first layer first.
#[derive(Debug, Clone)]
pub struct DeepReservoir {
    pub embedding: Embedding,
    pub cells: Vec<ReservoirCell>,
    schema: BatchSchema,
}

impl DeepReservoir {
    pub fn new(embedding: Embedding, config: &ReservoirConfig, layers: usize) -> Result<Self> {
        if layers == 0 {
            return Err(EsnError::InvalidConfig(
                "deep encoder needs at least one layer".into(),
            ));
        }
        let mut cells = Vec::with_capacity(layers);
        let mut input_dim = embedding.dim();
        for layer in 0..layers {
            let seed = config.seed.wrapping_add(1 + layer as u64);
            cells.push(ReservoirCell::random(input_dim, config, seed)?);
            input_dim = config.reservoir_dim;
        }
        Ok(Self {
            embedding,
            cells,
            schema: BatchSchema::Attributed,
        })
    }

    pub fn with_schema(mut self, schema: BatchSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl SequenceEncoder for DeepReservoir {
    fn forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)> {
        let mut inputs = self.embedding.embed(tokens)?;
        let mut layer_states = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let states = cell.run(&inputs, &tokens.lengths);
            inputs = states.clone();
            layer_states.push(states);
        }
        let views: Vec<_> = layer_states.iter().map(|s| s.view()).collect();
        let states = ndarray::concatenate(Axis(2), &views)?;
        Ok((states, tokens.lengths.clone()))
    }

    fn warm_up(&mut self, sequence: &[usize]) -> Result<()> {
        if sequence.is_empty() {
            return Ok(());
        }
        let mut inputs = self.embedding.embed_sequence(sequence)?;
        for cell in &mut self.cells {
            let states = cell.run_sequence(&inputs, &cell.initial_state);
            cell.initial_state = states.row(states.nrows() - 1).to_owned();
            inputs = states;
        }
        Ok(())
    }

    fn schema(&self) -> BatchSchema {
        self.schema
    }

    fn output_dim(&self) -> usize {
        self.cells.iter().map(ReservoirCell::dim).sum()
    }

    fn name(&self) -> &str {
        "deep_reservoir"
    }
}

// ─── Linear Layer ────────────────────────────────────

/// Fixed random projection of each embedding: `f(W·u_t + b)`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub embedding: Embedding,
    /// `output_dim × input_dim`
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
    schema: BatchSchema,
}

impl LinearLayer {
    pub fn new(embedding: Embedding, config: &ReservoirConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let weights = sample_matrix(
            &mut rng,
            config.reservoir_dim,
            embedding.dim(),
            config,
            config.input_scaling,
        )?;
        let bias = sample_bias(&mut rng, config.reservoir_dim, config.bias_scaling);
        Ok(Self {
            embedding,
            weights,
            bias,
            activation: config.activation,
            schema: BatchSchema::Attributed,
        })
    }

    pub fn with_schema(mut self, schema: BatchSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl SequenceEncoder for LinearLayer {
    fn forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)> {
        let inputs = self.embedding.embed(tokens)?;
        let (batch, time, _) = inputs.dim();
        let mut out = Array3::zeros((batch, time, self.weights.nrows()));
        for (i, &len) in tokens.lengths.iter().enumerate() {
            for t in 0..len {
                let mut projected = self.weights.dot(&inputs.slice(s![i, t, ..])) + &self.bias;
                projected.mapv_inplace(|x| self.activation.apply(x));
                out.slice_mut(s![i, t, ..]).assign(&projected);
            }
        }
        Ok((out, tokens.lengths.clone()))
    }

    /// No recurrent state to prime.
    fn warm_up(&mut self, _sequence: &[usize]) -> Result<()> {
        Ok(())
    }

    fn schema(&self) -> BatchSchema {
        self.schema
    }

    fn output_dim(&self) -> usize {
        self.weights.nrows()
    }

    fn name(&self) -> &str {
        "linear_layer"
    }
}

// ─── No Layer ────────────────────────────────────────

/// Embeddings fed straight to the readout.
#[derive(Debug, Clone)]
pub struct NoLayer {
    pub embedding: Embedding,
    schema: BatchSchema,
}

impl NoLayer {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            embedding,
            schema: BatchSchema::Attributed,
        }
    }

    pub fn with_schema(mut self, schema: BatchSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl SequenceEncoder for NoLayer {
    fn forward(&self, tokens: &TokenMatrix) -> Result<(StateTensor, Vec<usize>)> {
        Ok((self.embedding.embed(tokens)?, tokens.lengths.clone()))
    }

    fn warm_up(&mut self, _sequence: &[usize]) -> Result<()> {
        Ok(())
    }

    fn schema(&self) -> BatchSchema {
        self.schema
    }

    fn output_dim(&self) -> usize {
        self.embedding.dim()
    }

    fn name(&self) -> &str {
        "no_layer"
    }
}
