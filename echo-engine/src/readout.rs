//! Readout algorithms: the only trainable part of the network.
//!
//! Each readout declares a `Capability` that decides how it is trained:
//! 1. **ClosedForm**: one `fit` over the whole design matrix
//!    (`RidgeRegression`, `NearestCentroid`)
//! 2. **Iterative**: gradient steps through `backward` and an optimizer
//!    (`LogisticRegression`, `DeepReadout`)
//! 3. **InferenceOnly**: pretrained weights, never trained (`FrozenLinear`)

use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::distributions::{Distribution as _, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{EsnError, Result};
use crate::state::one_hot;

/// How a readout is trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    ClosedForm,
    Iterative,
    InferenceOnly,
}

/// Raw readout output for a batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutputs {
    /// `rows × outputs` scores (logits, regression targets, ...)
    Scores(Array2<f32>),
    /// One class id per row
    Classes(Array1<i64>),
}

impl RawOutputs {
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Scores(s) => s.nrows(),
            Self::Classes(c) => c.len(),
        }
    }
}

// ─── Parameters ──────────────────────────────────────

/// A trainable tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Array2<f32>,
    pub grad: Array2<f32>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }
}

/// Named parameters of an iterative readout, in a fixed order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new(params: Vec<Param>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, index: usize) -> &Param {
        &self.params[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Param {
        &mut self.params[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.params.iter_mut()
    }

    pub fn zero_grad(&mut self) {
        for p in &mut self.params {
            p.grad.fill(0.0);
        }
    }
}

// ─── Readout trait ───────────────────────────────────

/// Contract of a trainable (or frozen) readout.
///
/// Training entry points a readout does not support return
/// `EsnError::UnsupportedAlgorithm`.
pub trait ReadoutAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Number of output columns (classes).
    fn output_dim(&self) -> usize;

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs>;

    /// Closed-form fit on the full design matrix.
    fn fit(&mut self, _inputs: &Array2<f32>, _labels: &Array1<i64>) -> Result<()> {
        Err(EsnError::UnsupportedAlgorithm(format!(
            "{} has no closed-form fit",
            self.name()
        )))
    }

    /// Accumulate parameter gradients given `dL/d(outputs)`.
    fn backward(&mut self, _inputs: &Array2<f32>, _grad_outputs: &Array2<f32>) -> Result<()> {
        Err(EsnError::UnsupportedAlgorithm(format!(
            "{} has no gradient",
            self.name()
        )))
    }

    fn params_mut(&mut self) -> Option<&mut ParamSet> {
        None
    }

    fn zero_grad(&mut self) {
        if let Some(params) = self.params_mut() {
            params.zero_grad();
        }
    }
}

fn check_width(name: &str, inputs: &Array2<f32>, expected: usize) -> Result<()> {
    if inputs.ncols() != expected {
        return Err(EsnError::ShapeMismatch(format!(
            "{} expects {} input features, got {}",
            name,
            expected,
            inputs.ncols()
        )));
    }
    Ok(())
}

/// `inputs · Wᵀ + b` for `W: outputs × features`.
fn affine(inputs: &Array2<f32>, weights: &Array2<f32>, bias: &Array1<f32>) -> Array2<f32> {
    inputs.dot(&weights.t()) + bias
}

fn uniform_init(rows: usize, cols: usize, bound: f32, rng: &mut StdRng) -> Array2<f32> {
    let dist = Uniform::new_inclusive(-bound, bound);
    Array2::from_shape_simple_fn((rows, cols), || dist.sample(rng))
}

// ─── Ridge Regression ────────────────────────────────

/// Ridge regression on one-hot targets: closed-form readout training.
///
/// Given state matrix `X` (N × D) and target matrix `Y` (N × K):
///
/// `W = (ZᵀZ + λI)⁻¹ · Zᵀ(Y - Ȳ)` with `Z` the standardized states.
///
/// Solved via Cholesky decomposition in f64. The standardization is folded
/// back into the weights so the readout runs on raw states.
#[derive(Debug, Clone)]
pub struct RidgeRegression {
    /// Regularization strength (λ)
    pub lambda: f32,
    num_classes: usize,
    weights: Option<(Array2<f32>, Array1<f32>)>,
}

impl RidgeRegression {
    pub fn new(num_classes: usize, lambda: f32) -> Self {
        Self {
            lambda,
            num_classes,
            weights: None,
        }
    }

    /// Trained `(weights K × D, bias K)`, if fitted.
    pub fn weights(&self) -> Option<(&Array2<f32>, &Array1<f32>)> {
        self.weights.as_ref().map(|(w, b)| (w, b))
    }

    /// Snapshot the trained weights as an inference-only readout.
    pub fn freeze(&self) -> Result<FrozenLinear> {
        let (w, b) = self
            .weights
            .as_ref()
            .ok_or_else(|| EsnError::NotFitted(self.name().into()))?;
        FrozenLinear::new(w.clone(), b.clone())
    }

    fn solve(&self, states: &Array2<f32>, targets: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
        let x = states.mapv(f64::from);
        let y = targets.mapv(f64::from);
        let (n, d) = x.dim();
        let n_f = n as f64;

        let state_mean = x.sum_axis(Axis(0)) / n_f;
        let target_mean = y.sum_axis(Axis(0)) / n_f;

        let centered = &x - &state_mean;
        let state_std = (centered.mapv(|v| v * v).sum_axis(Axis(0)) / n_f)
            .mapv(|v| v.sqrt().max(1e-10));
        let z = &centered / &state_std;
        let y_centered = &y - &target_mean;

        let mut xtx = z.t().dot(&z);
        for a in 0..d {
            xtx[[a, a]] += self.lambda as f64;
        }
        let xty = z.t().dot(&y_centered);

        // W_eff[k, d] = W_norm[k, d] / σ[d]
        let w_t = cholesky_solve(&xtx, &xty);
        let weights = (&w_t / &state_std.view().insert_axis(Axis(1))).reversed_axes();
        let bias = &target_mean - &weights.dot(&state_mean);

        (weights.mapv(|v| v as f32), bias.mapv(|v| v as f32))
    }
}

/// Solve `A·X = B` via Cholesky decomposition.
///
/// `A` is `d × d` symmetric positive definite, `B` is `d × k`.
fn cholesky_solve(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let d = a.nrows();
    let k = b.ncols();
    let mut l = Array2::<f64>::zeros((d, d));

    for i in 0..d {
        for j in 0..=i {
            let mut sum = 0.0f64;
            for p in 0..j {
                sum += l[[i, p]] * l[[j, p]];
            }
            if i == j {
                let val = a[[i, i]] - sum;
                // Clamp to small positive for numerical stability
                l[[i, j]] = if val > 0.0 { val.sqrt() } else { 1e-10 };
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L · y = B
    let mut y = Array2::<f64>::zeros((d, k));
    for i in 0..d {
        for col in 0..k {
            let mut sum = b[[i, col]];
            for j in 0..i {
                sum -= l[[i, j]] * y[[j, col]];
            }
            y[[i, col]] = sum / l[[i, i]];
        }
    }

    // Back substitution: Lᵀ · x = y
    let mut x = Array2::<f64>::zeros((d, k));
    for i in (0..d).rev() {
        for col in 0..k {
            let mut sum = y[[i, col]];
            for j in (i + 1)..d {
                sum -= l[[j, i]] * x[[j, col]];
            }
            x[[i, col]] = sum / l[[i, i]];
        }
    }

    x
}

impl ReadoutAlgorithm for RidgeRegression {
    fn name(&self) -> &str {
        "ridge_regression"
    }

    fn capability(&self) -> Capability {
        Capability::ClosedForm
    }

    fn output_dim(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs> {
        let (w, b) = self
            .weights
            .as_ref()
            .ok_or_else(|| EsnError::NotFitted(self.name().into()))?;
        check_width(self.name(), inputs, w.ncols())?;
        Ok(RawOutputs::Scores(affine(inputs, w, b)))
    }

    fn fit(&mut self, inputs: &Array2<f32>, labels: &Array1<i64>) -> Result<()> {
        if inputs.nrows() == 0 {
            return Err(EsnError::EmptyDataset);
        }
        if inputs.nrows() != labels.len() {
            return Err(EsnError::ShapeMismatch(format!(
                "{} state rows for {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        let targets = one_hot(labels, self.num_classes)?;
        self.weights = Some(self.solve(inputs, &targets));
        Ok(())
    }
}

// ─── Nearest Centroid ────────────────────────────────

/// Assigns each row to the class with the closest mean state.
///
/// Emits class ids rather than scores. Classes absent from the training set
/// are never predicted.
#[derive(Debug, Clone)]
pub struct NearestCentroid {
    num_classes: usize,
    /// `K × D`; rows of unseen classes are unused
    centroids: Option<Array2<f32>>,
    seen: Vec<bool>,
}

impl NearestCentroid {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            centroids: None,
            seen: vec![false; num_classes],
        }
    }

    pub fn centroids(&self) -> Option<&Array2<f32>> {
        self.centroids.as_ref()
    }
}

impl ReadoutAlgorithm for NearestCentroid {
    fn name(&self) -> &str {
        "nearest_centroid"
    }

    fn capability(&self) -> Capability {
        Capability::ClosedForm
    }

    fn output_dim(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs> {
        let centroids = self
            .centroids
            .as_ref()
            .ok_or_else(|| EsnError::NotFitted(self.name().into()))?;
        check_width(self.name(), inputs, centroids.ncols())?;

        let classes = inputs
            .rows()
            .into_iter()
            .map(|row| {
                let mut best = (0usize, f32::INFINITY);
                for (class, centroid) in centroids.rows().into_iter().enumerate() {
                    if !self.seen[class] {
                        continue;
                    }
                    let dist: f32 = row
                        .iter()
                        .zip(centroid.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    if dist < best.1 {
                        best = (class, dist);
                    }
                }
                best.0 as i64
            })
            .collect();
        Ok(RawOutputs::Classes(classes))
    }

    fn fit(&mut self, inputs: &Array2<f32>, labels: &Array1<i64>) -> Result<()> {
        if inputs.nrows() == 0 {
            return Err(EsnError::EmptyDataset);
        }
        if inputs.nrows() != labels.len() {
            return Err(EsnError::ShapeMismatch(format!(
                "{} state rows for {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        let mut sums = Array2::<f32>::zeros((self.num_classes, inputs.ncols()));
        let mut counts = vec![0usize; self.num_classes];
        for (row, &label) in inputs.rows().into_iter().zip(labels.iter()) {
            if label < 0 || label as usize >= self.num_classes {
                return Err(EsnError::ShapeMismatch(format!(
                    "label {} outside 0..{}",
                    label, self.num_classes
                )));
            }
            let mut sum = sums.row_mut(label as usize);
            sum += &row;
            counts[label as usize] += 1;
        }
        for (class, mut sum) in sums.rows_mut().into_iter().enumerate() {
            if counts[class] > 0 {
                sum /= counts[class] as f32;
            }
        }
        self.seen = counts.iter().map(|&c| c > 0).collect();
        self.centroids = Some(sums);
        Ok(())
    }
}

// ─── Logistic Regression ─────────────────────────────

/// Linear logits `x · Wᵀ + b`, trained by gradient descent.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    input_dim: usize,
    num_classes: usize,
    /// `weight: K × D`, `bias: 1 × K`
    params: ParamSet,
}

impl LogisticRegression {
    pub fn new(input_dim: usize, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (input_dim.max(1) as f32).sqrt();
        Self {
            input_dim,
            num_classes,
            params: ParamSet::new(vec![
                Param::new("weight", uniform_init(num_classes, input_dim, bound, &mut rng)),
                Param::new("bias", Array2::zeros((1, num_classes))),
            ]),
        }
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }
}

impl ReadoutAlgorithm for LogisticRegression {
    fn name(&self) -> &str {
        "logistic_regression"
    }

    fn capability(&self) -> Capability {
        Capability::Iterative
    }

    fn output_dim(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs> {
        check_width(self.name(), inputs, self.input_dim)?;
        let w = &self.params.get(0).value;
        let b = self.params.get(1).value.row(0).to_owned();
        Ok(RawOutputs::Scores(affine(inputs, w, &b)))
    }

    fn backward(&mut self, inputs: &Array2<f32>, grad_outputs: &Array2<f32>) -> Result<()> {
        check_width(self.name(), inputs, self.input_dim)?;
        if grad_outputs.dim() != (inputs.nrows(), self.num_classes) {
            return Err(EsnError::ShapeMismatch(format!(
                "gradient {:?} for {} rows and {} outputs",
                grad_outputs.dim(),
                inputs.nrows(),
                self.num_classes
            )));
        }
        self.params.get_mut(0).grad += &grad_outputs.t().dot(inputs);
        self.params.get_mut(1).grad += &grad_outputs.sum_axis(Axis(0)).insert_axis(Axis(0));
        Ok(())
    }

    fn params_mut(&mut self) -> Option<&mut ParamSet> {
        Some(&mut self.params)
    }
}

// ─── Deep Readout ────────────────────────────────────

/// Multi-layer perceptron with ReLU hidden layers and linear output.
///
/// Parameters are stored as `weight_i` (`out × in`) and `bias_i` (`1 × out`)
/// pairs, layer by layer.
#[derive(Debug, Clone)]
pub struct DeepReadout {
    layer_dims: Vec<usize>,
    params: ParamSet,
}

impl DeepReadout {
    /// `hidden` lists the hidden layer widths between input and output.
    pub fn new(input_dim: usize, hidden: &[usize], num_classes: usize, seed: u64) -> Self {
        let mut layer_dims = Vec::with_capacity(hidden.len() + 2);
        layer_dims.push(input_dim);
        layer_dims.extend_from_slice(hidden);
        layer_dims.push(num_classes);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(2 * (layer_dims.len() - 1));
        for (layer, pair) in layer_dims.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            // He-uniform
            let bound = (6.0 / fan_in.max(1) as f32).sqrt();
            params.push(Param::new(
                format!("weight_{}", layer),
                uniform_init(fan_out, fan_in, bound, &mut rng),
            ));
            params.push(Param::new(
                format!("bias_{}", layer),
                Array2::zeros((1, fan_out)),
            ));
        }
        Self {
            layer_dims,
            params: ParamSet::new(params),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layer_dims.len() - 1
    }

    /// Pre-activations of every layer, plus the layer inputs.
    fn activations(&self, inputs: &Array2<f32>) -> (Vec<Array2<f32>>, Vec<Array2<f32>>) {
        let layers = self.num_layers();
        let mut layer_inputs = Vec::with_capacity(layers);
        let mut pre_activations = Vec::with_capacity(layers);
        let mut current = inputs.clone();
        for layer in 0..layers {
            let w = &self.params.get(2 * layer).value;
            let b = self.params.get(2 * layer + 1).value.row(0).to_owned();
            let z = affine(&current, w, &b);
            layer_inputs.push(current);
            current = if layer + 1 < layers {
                z.mapv(|v| v.max(0.0))
            } else {
                z.clone()
            };
            pre_activations.push(z);
        }
        (layer_inputs, pre_activations)
    }
}

impl ReadoutAlgorithm for DeepReadout {
    fn name(&self) -> &str {
        "deep_readout"
    }

    fn capability(&self) -> Capability {
        Capability::Iterative
    }

    fn output_dim(&self) -> usize {
        self.layer_dims[self.layer_dims.len() - 1]
    }

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs> {
        check_width(self.name(), inputs, self.layer_dims[0])?;
        let (_, mut pre) = self.activations(inputs);
        let logits = pre.pop().unwrap_or_else(|| inputs.clone());
        Ok(RawOutputs::Scores(logits))
    }

    fn backward(&mut self, inputs: &Array2<f32>, grad_outputs: &Array2<f32>) -> Result<()> {
        check_width(self.name(), inputs, self.layer_dims[0])?;
        if grad_outputs.dim() != (inputs.nrows(), self.output_dim()) {
            return Err(EsnError::ShapeMismatch(format!(
                "gradient {:?} for {} rows and {} outputs",
                grad_outputs.dim(),
                inputs.nrows(),
                self.output_dim()
            )));
        }
        let (layer_inputs, pre_activations) = self.activations(inputs);
        let mut delta = grad_outputs.clone();
        for layer in (0..self.num_layers()).rev() {
            self.params.get_mut(2 * layer).grad += &delta.t().dot(&layer_inputs[layer]);
            self.params.get_mut(2 * layer + 1).grad +=
                &delta.sum_axis(Axis(0)).insert_axis(Axis(0));
            if layer > 0 {
                let mut upstream = delta.dot(&self.params.get(2 * layer).value);
                // ReLU gate of the previous layer
                upstream.zip_mut_with(&pre_activations[layer - 1], |g, &z| {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                });
                delta = upstream;
            }
        }
        Ok(())
    }

    fn params_mut(&mut self) -> Option<&mut ParamSet> {
        Some(&mut self.params)
    }
}

// ─── Frozen Linear ───────────────────────────────────

/// Pretrained linear readout. Inference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenLinear {
    /// `K × D`
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl FrozenLinear {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(EsnError::ShapeMismatch(format!(
                "{} weight rows for {} biases",
                weights.nrows(),
                bias.len()
            )));
        }
        Ok(Self { weights, bias })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let frozen: Self = serde_json::from_str(json)?;
        Self::new(frozen.weights, frozen.bias)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ReadoutAlgorithm for FrozenLinear {
    fn name(&self) -> &str {
        "frozen_linear"
    }

    fn capability(&self) -> Capability {
        Capability::InferenceOnly
    }

    fn output_dim(&self) -> usize {
        self.weights.nrows()
    }

    fn forward(&self, inputs: &Array2<f32>) -> Result<RawOutputs> {
        check_width(self.name(), inputs, self.weights.ncols())?;
        Ok(RawOutputs::Scores(affine(inputs, &self.weights, &self.bias)))
    }
}
