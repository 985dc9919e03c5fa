use super::{RawPrediction, SurvivalModel, TrainingError, TrainingPass};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the pre-activation value.
    fn derivative(self, x: f64) -> f64 {
        match self {
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - x.tanh().powi(2),
        }
    }
}

/// Fully connected layer mapping `inputs × weights + bias`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl DenseLayer {
    fn glorot<R: Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        Self {
            weights: Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(fan_out),
        }
    }

    fn forward(&self, inputs: &Array2<f64>) -> Array2<f64> {
        inputs.dot(&self.weights) + &self.bias
    }
}

#[derive(Debug, Clone)]
struct LayerMoments {
    weights_m: Array2<f64>,
    weights_v: Array2<f64>,
    bias_m: Array1<f64>,
    bias_v: Array1<f64>,
}

/// Adam moments for every layer. Rebuilt whenever the network is compiled.
#[derive(Debug, Clone)]
struct AdamState {
    step: i32,
    moments: Vec<LayerMoments>,
}

impl AdamState {
    fn new(layers: &[DenseLayer]) -> Self {
        Self {
            step: 0,
            moments: layers
                .iter()
                .map(|layer| LayerMoments {
                    weights_m: Array2::zeros(layer.weights.raw_dim()),
                    weights_v: Array2::zeros(layer.weights.raw_dim()),
                    bias_m: Array1::zeros(layer.bias.len()),
                    bias_v: Array1::zeros(layer.bias.len()),
                })
                .collect(),
        }
    }
}

fn all_finite<'a>(mut values: impl Iterator<Item = &'a f64>) -> bool {
    values.all(|v| v.is_finite())
}

struct LayerGradient {
    weights: Array2<f64>,
    bias: Array1<f64>,
}

fn adam_update(
    layers: &mut [DenseLayer],
    state: &mut AdamState,
    gradients: &[LayerGradient],
    learning_rate: f64,
) {
    state.step += 1;
    let correction1 = 1.0 - ADAM_BETA1.powi(state.step);
    let correction2 = 1.0 - ADAM_BETA2.powi(state.step);
    let step_size = |m: f64, v: f64| {
        learning_rate * (m / correction1) / ((v / correction2).sqrt() + ADAM_EPSILON)
    };

    for ((layer, moments), gradient) in layers.iter_mut().zip(&mut state.moments).zip(gradients) {
        moments.weights_m = &moments.weights_m * ADAM_BETA1 + &gradient.weights * (1.0 - ADAM_BETA1);
        moments.weights_v =
            &moments.weights_v * ADAM_BETA2 + gradient.weights.mapv(|g| g * g) * (1.0 - ADAM_BETA2);
        moments.bias_m = &moments.bias_m * ADAM_BETA1 + &gradient.bias * (1.0 - ADAM_BETA1);
        moments.bias_v =
            &moments.bias_v * ADAM_BETA2 + gradient.bias.mapv(|g| g * g) * (1.0 - ADAM_BETA2);

        ndarray::Zip::from(&mut layer.weights)
            .and(&moments.weights_m)
            .and(&moments.weights_v)
            .for_each(|w, &m, &v| *w -= step_size(m, v));
        ndarray::Zip::from(&mut layer.bias)
            .and(&moments.bias_m)
            .and(&moments.bias_v)
            .for_each(|b, &m, &v| *b -= step_size(m, v));
    }
}

/// Neural proportional-hazards network: standardised inputs, hidden layers with a
/// shared activation, and a linear scalar log-risk output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSurvNetwork {
    pub activation: Activation,
    pub learning_rate: f64,
    pub l2: f64,
    pub input_mean: Array1<f64>,
    pub input_scale: Array1<f64>,
    pub layers: Vec<DenseLayer>,
    #[serde(skip)]
    optimizer: Option<AdamState>,
}

impl DeepSurvNetwork {
    pub fn new<R: Rng>(
        features: ArrayView2<'_, f64>,
        hidden_layers: &[usize],
        activation: Activation,
        learning_rate: f64,
        l2: f64,
        rng: &mut R,
    ) -> Self {
        let n_features = features.ncols();
        let input_mean = features
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(n_features));
        let input_scale = if features.nrows() > 1 {
            features
                .std_axis(Axis(0), 0.0)
                .mapv(|s| if s > 1e-12 { s } else { 1.0 })
        } else {
            Array1::ones(n_features)
        };

        let mut widths = vec![n_features];
        widths.extend(hidden_layers.iter().copied().filter(|&w| w > 0));
        widths.push(1);
        let layers = widths
            .windows(2)
            .map(|pair| DenseLayer::glorot(pair[0], pair[1], rng))
            .collect();

        Self {
            activation,
            learning_rate,
            l2,
            input_mean,
            input_scale,
            layers,
            optimizer: None,
        }
    }

    fn standardise(&self, features: ArrayView2<'_, f64>) -> Array2<f64> {
        (&features - &self.input_mean) / &self.input_scale
    }

    /// Returns the input of every layer (standardised features first) and every
    /// layer's pre-activation output. The last pre-activation is the network output.
    fn forward(&self, features: ArrayView2<'_, f64>) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let mut inputs = vec![self.standardise(features)];
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&inputs[idx]);
            if idx + 1 < self.layers.len() {
                inputs.push(z.mapv(|v| self.activation.apply(v)));
            }
            pre_activations.push(z);
        }
        (inputs, pre_activations)
    }

    pub fn output(&self, features: ArrayView2<'_, f64>) -> Array2<f64> {
        let (_, mut pre_activations) = self.forward(features);
        pre_activations
            .pop()
            .unwrap_or_else(|| Array2::zeros((features.nrows(), 1)))
    }

    fn backward(
        &self,
        inputs: &[Array2<f64>],
        pre_activations: &[Array2<f64>],
        output_gradient: Array2<f64>,
    ) -> Vec<LayerGradient> {
        let mut gradients = Vec::with_capacity(self.layers.len());
        let mut delta = output_gradient;
        for idx in (0..self.layers.len()).rev() {
            let layer = &self.layers[idx];
            let weights = inputs[idx].t().dot(&delta) + &layer.weights * self.l2;
            let bias = delta.sum_axis(Axis(0));
            if idx > 0 {
                let mut upstream = delta.dot(&layer.weights.t());
                ndarray::Zip::from(&mut upstream)
                    .and(&pre_activations[idx - 1])
                    .for_each(|d, &z| *d *= self.activation.derivative(z));
                delta = upstream;
            }
            gradients.push(LayerGradient { weights, bias });
        }
        gradients.reverse();
        gradients
    }
}

impl SurvivalModel for DeepSurvNetwork {
    fn n_features(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.weights.nrows())
    }

    fn is_fitted(&self) -> bool {
        !self.layers.is_empty()
            && self.input_mean.len() == self.n_features()
            && self.input_scale.len() == self.n_features()
            && self.layers.last().is_some_and(|layer| layer.weights.ncols() == 1)
            && self
                .layers
                .windows(2)
                .all(|pair| pair[0].weights.ncols() == pair[1].weights.nrows())
            && self
                .layers
                .iter()
                .all(|layer| layer.bias.len() == layer.weights.ncols())
    }

    fn parameters_finite(&self) -> bool {
        all_finite(self.input_mean.iter())
            && all_finite(self.input_scale.iter())
            && self
                .layers
                .iter()
                .all(|layer| all_finite(layer.weights.iter()) && all_finite(layer.bias.iter()))
    }

    fn raw_predict(&self, features: ArrayView2<'_, f64>) -> RawPrediction {
        RawPrediction::Column(self.output(features))
    }

    fn compile(&mut self) {
        self.optimizer = Some(AdamState::new(&self.layers));
    }

    /// One epoch of shuffled mini-batches. Batches without an observed event carry
    /// no partial-likelihood signal and are skipped.
    fn train_pass(&mut self, pass: &mut TrainingPass<'_>) -> Result<(), TrainingError> {
        let mut order: Vec<usize> = (0..pass.cohort.len()).collect();
        order.shuffle(&mut *pass.rng);

        for chunk in order.chunks(pass.schedule.batch_size) {
            let batch = pass.cohort.subset(chunk);
            if batch.n_events() == 0 {
                continue;
            }
            let (inputs, pre_activations) = self.forward(batch.features());
            let Some(output) = pre_activations.last() else {
                return Ok(());
            };
            let risk = output.column(0);
            let output_gradient = pass
                .loss
                .gradient(risk, batch.time(), batch.event())
                .insert_axis(Axis(1));
            let gradients = self.backward(&inputs, &pre_activations, output_gradient);

            let state = self
                .optimizer
                .get_or_insert_with(|| AdamState::new(&self.layers));
            adam_update(&mut self.layers, state, &gradients, self.learning_rate);
        }
        Ok(())
    }
}
