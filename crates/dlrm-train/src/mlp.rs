//! Fully-connected layers with a hand-written backward pass.

use dlrm_distributed::GradientBuffers;
use ndarray::{Array1, Array2, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Nonlinearity applied after a linear layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// `max(0, x)`.
    Relu,
    /// `1 / (1 + exp(-x))`.
    Sigmoid,
}

impl Activation {
    fn apply(self, z: &mut Array2<f32>) {
        match self {
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => z.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
        }
    }

    /// Multiplies `grad` by the derivative, expressed through the activation output `y`.
    fn backward(self, y: &Array2<f32>, grad: &mut Array2<f32>) {
        match self {
            Activation::Relu => grad.zip_mut_with(y, |g, &y| {
                if y <= 0.0 {
                    *g = 0.0;
                }
            }),
            Activation::Sigmoid => grad.zip_mut_with(y, |g, &y| *g *= y * (1.0 - y)),
        }
    }
}

/// Parameters of one layer as stored in a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, derive_new::new)]
pub struct LayerState {
    /// `(out, in)` weight matrix.
    pub weight: Array2<f32>,
    /// Bias of length `out`.
    pub bias: Array1<f32>,
}

/// `y = act(x Wᵀ + b)`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
    activation: Activation,
    cache: Option<(Array2<f32>, Array2<f32>)>,
}

impl Linear {
    /// Draws `W ~ N(0, sqrt(2 / (in + out)))` and `b ~ N(0, sqrt(1 / out))`.
    pub fn init(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self, TrainError> {
        let weight_std = (2.0 / (in_features + out_features) as f32).sqrt();
        let bias_std = (1.0 / out_features as f32).sqrt();
        let weight_dist = normal(weight_std)?;
        let bias_dist = normal(bias_std)?;

        let weight = Array2::from_shape_simple_fn((out_features, in_features), || {
            rng.sample(weight_dist)
        });
        let bias = Array1::from_shape_simple_fn(out_features, || rng.sample(bias_dist));
        Ok(Self::from_state(LayerState::new(weight, bias), activation))
    }

    /// Builds a layer from saved parameters.
    pub fn from_state(state: LayerState, activation: Activation) -> Self {
        let LayerState { weight, bias } = state;
        Self {
            weight_grad: Array2::zeros(weight.raw_dim()),
            bias_grad: Array1::zeros(bias.raw_dim()),
            weight,
            bias,
            activation,
            cache: None,
        }
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `(out, in)` weight matrix.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Bias vector.
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Accumulated weight gradient.
    pub fn weight_grad(&self) -> &Array2<f32> {
        &self.weight_grad
    }

    /// Accumulated bias gradient.
    pub fn bias_grad(&self) -> &Array1<f32> {
        &self.bias_grad
    }

    /// Activation after the affine map.
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Applies the layer and caches what the backward pass needs.
    pub fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let mut output = input.dot(&self.weight.t()) + &self.bias;
        self.activation.apply(&mut output);
        self.cache = Some((input.clone(), output.clone()));
        output
    }

    /// Accumulates the parameter gradients and returns the input gradient.
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, TrainError> {
        let (input, output) = self.cache.take().ok_or(TrainError::MissingForward("linear"))?;

        let mut grad = grad_output.clone();
        self.activation.backward(&output, &mut grad);

        self.weight_grad += &grad.t().dot(&input);
        self.bias_grad += &grad.sum_axis(Axis(0));
        Ok(grad.dot(&self.weight))
    }

    /// Clears the accumulated gradients.
    pub fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }

    /// `p -= lr * grad` for both parameters.
    pub fn sgd_step(&mut self, lr: f32) {
        self.weight.scaled_add(-lr, &self.weight_grad);
        self.bias.scaled_add(-lr, &self.bias_grad);
    }

    /// Copy of the parameters.
    pub fn state(&self) -> LayerState {
        LayerState::new(self.weight.clone(), self.bias.clone())
    }
}

fn normal(std_dev: f32) -> Result<Normal<f32>, TrainError> {
    Normal::new(0.0, std_dev)
        .map_err(|err| TrainError::InvalidConfig(format!("layer initialization: {err}")))
}

/// Parameters of a whole MLP as stored in a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MlpState {
    /// Layer parameters, input layer first.
    pub layers: Vec<LayerState>,
}

/// Stack of [`Linear`] layers.
///
/// Every layer applies ReLU except `sigmoid_layer`, which applies a sigmoid.
#[derive(Clone, Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Creates layers mapping `widths[i]` to `widths[i + 1]`.
    pub fn init(
        widths: &[usize],
        sigmoid_layer: Option<usize>,
        rng: &mut StdRng,
    ) -> Result<Self, TrainError> {
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| Linear::init(pair[0], pair[1], activation_of(i, sigmoid_layer), rng))
            .collect::<Result<_, _>>()?;
        Ok(Self { layers })
    }

    /// Rebuilds an MLP from saved parameters.
    pub fn from_state(state: MlpState, sigmoid_layer: Option<usize>) -> Result<Self, TrainError> {
        for (i, pair) in state.layers.windows(2).enumerate() {
            if pair[0].weight.nrows() != pair[1].weight.ncols() {
                return Err(TrainError::InvalidConfig(format!(
                    "saved layer {} has {} outputs but layer {} takes {} inputs",
                    i,
                    pair[0].weight.nrows(),
                    i + 1,
                    pair[1].weight.ncols()
                )));
            }
        }
        if let Some(i) = state
            .layers
            .iter()
            .position(|l| l.bias.len() != l.weight.nrows())
        {
            return Err(TrainError::InvalidConfig(format!(
                "saved layer {i} has a bias of the wrong length"
            )));
        }

        let layers = state
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| Linear::from_state(layer, activation_of(i, sigmoid_layer)))
            .collect();
        Ok(Self { layers })
    }

    /// The layers, input layer first.
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Layer widths, input first.
    pub fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.layers.iter().map(Linear::in_features).collect();
        widths.extend(self.layers.last().map(Linear::out_features));
        widths
    }

    /// Runs every layer.
    pub fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x);
        }
        x
    }

    /// Backpropagates through every layer and returns the input gradient.
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, TrainError> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad)
    }

    /// Clears every layer's gradients.
    pub fn zero_grad(&mut self) {
        self.layers.iter_mut().for_each(Linear::zero_grad);
    }

    /// Applies one SGD step to every layer.
    pub fn sgd_step(&mut self, lr: f32) {
        self.layers.iter_mut().for_each(|l| l.sgd_step(lr));
    }

    /// Copy of every layer's parameters.
    pub fn state(&self) -> MlpState {
        MlpState {
            layers: self.layers.iter().map(Linear::state).collect(),
        }
    }
}

fn activation_of(layer: usize, sigmoid_layer: Option<usize>) -> Activation {
    if sigmoid_layer == Some(layer) {
        Activation::Sigmoid
    } else {
        Activation::Relu
    }
}

impl GradientBuffers for Mlp {
    fn visit_grads(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f32>)) {
        for layer in self.layers.iter_mut() {
            f(layer.weight_grad.view_mut().into_dyn());
            f(layer.bias_grad.view_mut().into_dyn());
        }
    }
}
