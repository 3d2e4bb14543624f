//! Dense autoencoder forward pass.
//!
//! Weights are stored `[fan_in, fan_out]` so a layer is `x · W + b`.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::processing::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Identity,
}

impl Activation {
    fn apply(self, z: &mut Array2<f64>) {
        if self == Self::Relu {
            z.mapv_inplace(|v| v.max(0.0));
        }
    }
}

/// One fully-connected layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    pub fn fan_in(&self) -> usize {
        self.weights.nrows()
    }

    pub fn fan_out(&self) -> usize {
        self.weights.ncols()
    }

    /// Pre-activation `x · W + b`.
    pub(crate) fn linear(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }

    pub(crate) fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut z = self.linear(x);
        self.activation.apply(&mut z);
        z
    }
}

/// Immutable autoencoder used for scoring. Output width equals input width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenAutoencoder {
    layers: Vec<DenseLayer>,
}

impl FrozenAutoencoder {
    /// Assemble from layers, checking that shapes chain and the output
    /// reconstructs the input width.
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self, ModelError> {
        let first = layers
            .first()
            .ok_or_else(|| ModelError::InvalidModel("network has no layers".to_string()))?;
        let input_dim = first.fan_in();

        for (i, layer) in layers.iter().enumerate() {
            if layer.bias.len() != layer.fan_out() {
                return Err(ModelError::InvalidModel(format!(
                    "layer {i}: bias has {} entries for {} outputs",
                    layer.bias.len(),
                    layer.fan_out()
                )));
            }
            if let Some(next) = layers.get(i + 1) {
                if next.fan_in() != layer.fan_out() {
                    return Err(ModelError::InvalidModel(format!(
                        "layer {} expects {} inputs, layer {i} produces {}",
                        i + 1,
                        next.fan_in(),
                        layer.fan_out()
                    )));
                }
            }
        }

        let output_dim = layers.last().map_or(0, DenseLayer::fan_out);
        if output_dim != input_dim {
            return Err(ModelError::InvalidModel(format!(
                "output width {output_dim} does not match input width {input_dim}"
            )));
        }
        Ok(Self { layers })
    }

    /// Glorot-uniform initialized network `input → hidden… → input`.
    /// ReLU on every hidden layer, identity on the output layer.
    pub fn initialize(input_dim: usize, hidden: &[usize], seed: u64) -> Result<Self, ModelError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(input_dim);
        sizes.extend_from_slice(hidden);
        sizes.push(input_dim);

        let last = sizes.len() - 2;
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                DenseLayer {
                    weights: Array2::from_shape_fn((fan_in, fan_out), |_| dist.sample(&mut rng)),
                    bias: Array1::from_shape_fn(fan_out, |_| dist.sample(&mut rng)),
                    activation: if i == last { Activation::Identity } else { Activation::Relu },
                }
            })
            .collect();
        Self::new(layers)
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, DenseLayer::fan_in)
    }

    pub fn hidden_sizes(&self) -> Vec<usize> {
        self.layers
            .iter()
            .take(self.layers.len().saturating_sub(1))
            .map(DenseLayer::fan_out)
            .collect()
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [DenseLayer] {
        &mut self.layers
    }

    /// Reconstruct normalized `[B, D]` features.
    pub fn reconstruct(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        if x.ncols() != self.input_dim() {
            return Err(ProcessingError::FeatureDimensionMismatch {
                expected: self.input_dim(),
                actual: x.ncols(),
            }
            .into());
        }
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h);
        }
        Ok(h)
    }

    /// Mean squared reconstruction error of each row.
    pub fn reconstruction_errors(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let recon = self.reconstruct(x)?;
        let sq = (x - &recon).mapv(|d| d * d);
        Ok(sq
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(x.nrows())))
    }
}
