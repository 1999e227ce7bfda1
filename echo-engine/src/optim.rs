//! Optimizers for iterative readout training.
//!
//! Per-parameter state (velocities, moments) is keyed by parameter name and
//! created lazily on the first step.

use std::collections::HashMap;

use ndarray::{Array2, Zip};

use crate::error::{EsnError, Result};
use crate::readout::{Param, ParamSet};

pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Apply one update from the accumulated gradients.
    fn step(&mut self, params: &mut ParamSet) -> Result<()>;

    /// Number of steps taken.
    fn num_steps(&self) -> usize;
}

fn state_for<'a>(
    store: &'a mut HashMap<String, Array2<f32>>,
    param: &Param,
) -> Result<&'a mut Array2<f32>> {
    let state = store
        .entry(param.name.clone())
        .or_insert_with(|| Array2::zeros(param.value.raw_dim()));
    if state.dim() != param.value.dim() {
        return Err(EsnError::ShapeMismatch(format!(
            "optimizer state for {} is {:?}, parameter is {:?}",
            param.name,
            state.dim(),
            param.value.dim()
        )));
    }
    Ok(state)
}

// ─── SGD ─────────────────────────────────────────────

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// ```text
/// g = grad + weight_decay · param
/// v = momentum · v + g
/// param = param - lr · v
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocities: HashMap<String, Array2<f32>>,
    steps: usize,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocities: HashMap::new(),
            steps: 0,
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        self.steps += 1;
        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.weight_decay);
        for param in params.iter_mut() {
            let grad = &param.grad + &(&param.value * decay);
            if momentum > 0.0 {
                let v = state_for(&mut self.velocities, param)?;
                Zip::from(&mut *v).and(&grad).for_each(|v, &g| *v = momentum * *v + g);
                param.value.scaled_add(-lr, &*v);
            } else {
                param.value.scaled_add(-lr, &grad);
            }
        }
        Ok(())
    }

    fn num_steps(&self) -> usize {
        self.steps
    }
}

// ─── Adam ────────────────────────────────────────────

/// Adam with bias-corrected first and second moments.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    first_moments: HashMap<String, Array2<f32>>,
    second_moments: HashMap<String, Array2<f32>>,
    t: usize,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
            t: 0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let bias1 = 1.0 - b1.powi(self.t as i32);
        let bias2 = 1.0 - b2.powi(self.t as i32);
        let step_size = self.learning_rate / bias1;
        let decay = self.weight_decay;

        for param in params.iter_mut() {
            let grad = &param.grad + &(&param.value * decay);
            let m = state_for(&mut self.first_moments, param)?;
            Zip::from(&mut *m).and(&grad).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
            let v = state_for(&mut self.second_moments, param)?;
            Zip::from(&mut *v)
                .and(&grad)
                .for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

            let m = &self.first_moments[&param.name];
            let v = &self.second_moments[&param.name];
            Zip::from(&mut param.value)
                .and(m)
                .and(v)
                .for_each(|p, &m, &v| *p -= step_size * m / ((v / bias2).sqrt() + eps));
        }
        Ok(())
    }

    fn num_steps(&self) -> usize {
        self.t
    }
}
