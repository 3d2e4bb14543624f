//! Autoencoder fitting: manual backpropagation + Adam optimizer.
//!
//! The network is trained to reproduce its (normalized) input. Loss is half
//! the mean squared error over all elements plus a small L2 penalty.
//! Mini-batches are drawn from a seeded shuffle each epoch. Training stops
//! at the epoch limit, or once the epoch loss has failed to improve by
//! more than `tolerance` for `n_iter_no_change` consecutive epochs.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::network::{Activation, DenseLayer, FrozenAutoencoder};
use super::ModelError;
use crate::config::TrainingConfig;

/// L2 regularization strength.
const L2_PENALTY: f64 = 1e-4;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Result of a completed fit.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub network: FrozenAutoencoder,
    pub epochs: usize,
    pub final_loss: f64,
    /// True when training stopped on the loss plateau rather than the epoch limit.
    pub converged: bool,
    pub loss_curve: Vec<f64>,
}

/// Per-layer Adam moment estimates.
struct AdamState {
    m_w: Vec<Array2<f64>>,
    v_w: Vec<Array2<f64>>,
    m_b: Vec<Array1<f64>>,
    v_b: Vec<Array1<f64>>,
    steps: u64,
}

impl AdamState {
    fn new(layers: &[DenseLayer]) -> Self {
        Self {
            m_w: layers.iter().map(|l| Array2::zeros(l.weights.raw_dim())).collect(),
            v_w: layers.iter().map(|l| Array2::zeros(l.weights.raw_dim())).collect(),
            m_b: layers.iter().map(|l| Array1::zeros(l.bias.raw_dim())).collect(),
            v_b: layers.iter().map(|l| Array1::zeros(l.bias.raw_dim())).collect(),
            steps: 0,
        }
    }

    fn apply(
        &mut self,
        lr: f64,
        layers: &mut [DenseLayer],
        grads: &[(Array2<f64>, Array1<f64>)],
    ) {
        self.steps += 1;
        let t = self.steps as f64;
        // Bias-corrected step size
        let lr_t = lr * (1.0 - BETA2.powf(t)).sqrt() / (1.0 - BETA1.powf(t));

        for (i, (layer, (gw, gb))) in layers.iter_mut().zip(grads).enumerate() {
            ndarray::Zip::from(&mut layer.weights)
                .and(&mut self.m_w[i])
                .and(&mut self.v_w[i])
                .and(gw)
                .for_each(|w, m, v, &g| {
                    *m = BETA1 * *m + (1.0 - BETA1) * g;
                    *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + ADAM_EPS);
                });
            ndarray::Zip::from(&mut layer.bias)
                .and(&mut self.m_b[i])
                .and(&mut self.v_b[i])
                .and(gb)
                .for_each(|b, m, v, &g| {
                    *m = BETA1 * *m + (1.0 - BETA1) * g;
                    *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                    *b -= lr_t * *m / (v.sqrt() + ADAM_EPS);
                });
        }
    }
}

/// Mini-batch Adam trainer for the reconstruction autoencoder.
#[derive(Debug, Clone)]
pub struct AdamTrainer {
    config: TrainingConfig,
}

impl AdamTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Fit an autoencoder on normalized `[N, D]` rows.
    ///
    /// Checks `cancel` before every mini-batch and returns
    /// [`ModelError::Cancelled`] once it fires.
    pub fn fit(
        &self,
        x: &Array2<f64>,
        cancel: &CancellationToken,
    ) -> Result<TrainingOutcome, ModelError> {
        let n = x.nrows();
        let need = self.config.min_training_windows.max(1);
        if n < need {
            return Err(ModelError::InsufficientTrainingData { have: n, need });
        }

        let mut network =
            FrozenAutoencoder::initialize(x.ncols(), &self.config.hidden_layers, self.config.seed)?;
        let mut adam = AdamState::new(network.layers());
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let batch_size = self.config.batch_size.clamp(1, n);
        let mut order: Vec<usize> = (0..n).collect();

        let mut best_loss = f64::INFINITY;
        let mut no_improvement = 0usize;
        let mut loss_curve = Vec::new();
        let mut converged = false;

        for epoch in 1..=self.config.epochs {
            order.shuffle(&mut rng);
            let mut accumulated = 0.0;
            for chunk in order.chunks(batch_size) {
                if cancel.is_cancelled() {
                    return Err(ModelError::Cancelled);
                }
                let batch = x.select(Axis(0), chunk);
                let (loss, grads) = batch_gradients(network.layers(), &batch);
                accumulated += loss * chunk.len() as f64;
                adam.apply(self.config.learning_rate, network.layers_mut(), &grads);
            }
            let loss = accumulated / n as f64;
            if !loss.is_finite() {
                return Err(ModelError::TrainingDiverged(format!(
                    "loss became {loss} at epoch {epoch}"
                )));
            }
            loss_curve.push(loss);
            debug!(epoch, loss, "Training epoch");

            if loss > best_loss - self.config.tolerance {
                no_improvement += 1;
            } else {
                no_improvement = 0;
            }
            if loss < best_loss {
                best_loss = loss;
            }
            if no_improvement > self.config.n_iter_no_change {
                converged = true;
                break;
            }
        }

        let epochs = loss_curve.len();
        let final_loss = loss_curve.last().copied().unwrap_or(f64::NAN);
        info!(
            rows = n,
            dim = x.ncols(),
            epochs,
            final_loss,
            converged,
            "Autoencoder training finished"
        );

        Ok(TrainingOutcome {
            network,
            epochs,
            final_loss,
            converged,
            loss_curve,
        })
    }
}

/// Forward + backward pass over one batch.
///
/// Returns the batch loss and `(dW, db)` for every layer.
fn batch_gradients(
    layers: &[DenseLayer],
    x: &Array2<f64>,
) -> (f64, Vec<(Array2<f64>, Array1<f64>)>) {
    let n = x.nrows() as f64;

    // activations[0] = input, activations[i+1] = output of layer i
    let mut activations = Vec::with_capacity(layers.len() + 1);
    activations.push(x.clone());
    for layer in layers {
        let next = layer.forward(&activations[activations.len() - 1]);
        activations.push(next);
    }

    let output = &activations[layers.len()];
    let diff = output - x;
    let mse = diff.mapv(|d| d * d).mean().unwrap_or(0.0);
    let l2: f64 = layers.iter().map(|l| l.weights.mapv(|w| w * w).sum()).sum();
    let loss = mse / 2.0 + L2_PENALTY * l2 / (2.0 * n);

    let mut grads = Vec::with_capacity(layers.len());
    let mut delta = diff;
    for i in (0..layers.len()).rev() {
        let layer = &layers[i];
        let input = &activations[i];
        let grad_w = (input.t().dot(&delta) + &layer.weights * L2_PENALTY) / n;
        let grad_b = delta.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(layer.fan_out()));
        grads.push((grad_w, grad_b));

        if i > 0 {
            let mut upstream = delta.dot(&layer.weights.t());
            if layers[i - 1].activation == Activation::Relu {
                ndarray::Zip::from(&mut upstream)
                    .and(input)
                    .for_each(|d, &a| {
                        if a <= 0.0 {
                            *d = 0.0;
                        }
                    });
            }
            delta = upstream;
        }
    }
    grads.reverse();
    (loss, grads)
}
