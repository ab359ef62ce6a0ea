use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::activation::relu;
use burn::tensor::module::conv3d;
use burn::tensor::ops::ConvOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONV_BIAS_INIT: f64 = 0.01;
pub const DENSE_BIAS_INIT: f64 = 0.1;

/// Name of one parameterised layer inside a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerName {
    /// Parallel first-layer branch, `conv1_a`, `conv1_b`, ...
    Branch(usize),
    /// Sequential convolution stage, `conv2` ... `convN`
    Conv(usize),
    /// Penultimate dense layer
    Hidden,
    Logits,
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerName::Branch(i) => {
                let suffix = char::from(b'a' + (*i % 26) as u8);
                write!(f, "conv1_{suffix}")
            }
            LayerName::Conv(k) => write!(f, "conv{k}"),
            LayerName::Hidden => write!(f, "fullcn"),
            LayerName::Logits => write!(f, "logits"),
        }
    }
}

/// Structured parameter identifier: the owning scope (a modality or `fusion`) plus the layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub scope: String,
    pub layer: LayerName,
}

impl ParamKey {
    pub fn new(scope: impl Into<String>, layer: LayerName) -> Self {
        Self {
            scope: scope.into(),
            layer,
        }
    }

    pub fn weights(&self) -> String {
        format!("{self}/weights")
    }

    pub fn biases(&self) -> String {
        format!("{self}/biases")
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.layer)
    }
}

/// Flat name and shape of one parameter tensor, as recorded in checkpoint manifests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub key: String,
    pub shape: Vec<usize>,
}

/// Regularization terms gathered during one forward pass.
///
/// Every decayed weight tensor adds `decay * 0.5 * sum(w^2)`. A detached collection records
/// nothing, which is what frozen feature extraction uses.
#[derive(Debug)]
pub struct LossCollection<B: Backend> {
    terms: Vec<(String, Tensor<B, 1>)>,
    recording: bool,
}

impl<B: Backend> Default for LossCollection<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> LossCollection<B> {
    pub fn new() -> Self {
        Self {
            terms: Vec::new(),
            recording: true,
        }
    }

    pub fn detached() -> Self {
        Self {
            terms: Vec::new(),
            recording: false,
        }
    }

    pub fn add(&mut self, name: impl Into<String>, term: Tensor<B, 1>) {
        if self.recording {
            self.terms.push((name.into(), term));
        }
    }

    pub fn weight_decay<const D: usize>(
        &mut self,
        name: String,
        weights: Tensor<B, D>,
        decay: f64,
    ) {
        if !self.recording || decay == 0.0 {
            return;
        }
        let term = (weights.clone() * weights).sum().mul_scalar(decay * 0.5);
        self.add(name, term);
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(name, _)| name.as_str())
    }

    /// Sum of all terms, zero when nothing was recorded.
    pub fn total(&self, device: &B::Device) -> Tensor<B, 1> {
        self.terms
            .iter()
            .map(|(_, term)| term.clone())
            .reduce(|acc, term| acc + term)
            .unwrap_or_else(|| Tensor::zeros([1], device))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Output extent `ceil(in / stride)`, zero padding split with the extra voxel after.
    Same,
    /// No padding.
    Valid,
}

/// `(pad_before, pad_after, output)` for one spatial axis under `Same` padding.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize, usize) {
    let output = input.div_ceil(stride);
    let total = ((output.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    let before = total / 2;
    (before, total - before, output)
}

/// Output extent of one spatial axis, `None` when a `Valid` kernel does not fit.
pub fn conv_output(input: usize, kernel: usize, stride: usize, padding: Padding) -> Option<usize> {
    match padding {
        Padding::Same => Some(same_padding(input, kernel, stride).2),
        Padding::Valid if input >= kernel => Some((input - kernel) / stride + 1),
        Padding::Valid => None,
    }
}

fn pad_same<B: Backend>(x: Tensor<B, 5>, kernel: usize, stride: usize) -> Tensor<B, 5> {
    let [n, c, d, h, w] = x.dims();
    let (d0, d1, _) = same_padding(d, kernel, stride);
    let (h0, h1, _) = same_padding(h, kernel, stride);
    let (w0, w1, _) = same_padding(w, kernel, stride);

    if d0 + d1 + h0 + h1 + w0 + w1 == 0 {
        return x;
    }

    let device = x.device();
    Tensor::zeros([n, c, d + d0 + d1, h + h0 + h1, w + w0 + w1], &device).slice_assign(
        [0..n, 0..c, d0..d0 + d, h0..h0 + h, w0..w0 + w],
        x,
    )
}

#[derive(Debug, Clone)]
pub struct ConvSpec {
    pub key: ParamKey,
    pub kernel: usize,
    pub stride: usize,
    pub padding: Padding,
    pub decay: f64,
}

#[derive(Config, Debug)]
pub struct ConvRelu3dConfig {
    /// `[in_channels, out_channels]`
    pub channels: [usize; 2],
    /// Cubic kernel edge length
    pub kernel: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "Padding::Same")]
    pub padding: Padding,
    #[config(default = 0.0)]
    pub decay: f64,
}

impl ConvRelu3dConfig {
    pub fn init<B: Backend>(&self, key: ParamKey, device: &B::Device) -> ConvRelu3d<B> {
        let [c_in, c_out] = self.channels;
        let k = self.kernel;
        let fan_in = (k * k * k * c_in) as f64;
        let std = 1.0 / (fan_in / 2.0).sqrt();

        ConvRelu3d {
            weight: Param::from_tensor(Tensor::random(
                [c_out, c_in, k, k, k],
                Distribution::Normal(0.0, std),
                device,
            )),
            bias: Param::from_tensor(Tensor::full([c_out], CONV_BIAS_INIT, device)),
            spec: Ignored(ConvSpec {
                key,
                kernel: k,
                stride: self.stride,
                padding: self.padding,
                decay: self.decay,
            }),
        }
    }
}

/// `relu(conv3d(x, W) + b)` over `[N, C, D, H, W]` inputs.
#[derive(Module, Debug)]
pub struct ConvRelu3d<B: Backend> {
    /// `[out_channels, in_channels, k, k, k]`
    pub weight: Param<Tensor<B, 5>>,
    pub bias: Param<Tensor<B, 1>>,
    pub spec: Ignored<ConvSpec>,
}

impl<B: Backend> ConvRelu3d<B> {
    pub fn key(&self) -> &ParamKey {
        &self.spec.key
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 5> {
        let spec = &self.spec.0;
        losses.weight_decay(spec.key.weights(), self.weight.val(), spec.decay);

        let x = match spec.padding {
            Padding::Same => pad_same(x, spec.kernel, spec.stride),
            Padding::Valid => x,
        };
        let options = ConvOptions::new([spec.stride; 3], [0; 3], [1; 3], 1);

        relu(conv3d(x, self.weight.val(), Some(self.bias.val()), options))
    }

    pub fn param_entries(&self) -> Vec<ParamEntry> {
        vec![
            ParamEntry {
                key: self.spec.key.weights(),
                shape: self.weight.dims().to_vec(),
            },
            ParamEntry {
                key: self.spec.key.biases(),
                shape: self.bias.dims().to_vec(),
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct DenseSpec {
    pub key: ParamKey,
    pub decay: f64,
}

#[derive(Config, Debug)]
pub struct DenseConfig {
    pub d_input: usize,
    pub d_output: usize,
    #[config(default = 0.0)]
    pub decay: f64,
}

impl DenseConfig {
    pub fn init<B: Backend>(&self, key: ParamKey, device: &B::Device) -> Dense<B> {
        let std = 1.0 / (self.d_input as f64 / 2.0).sqrt();

        Dense {
            weight: Param::from_tensor(Tensor::random(
                [self.d_input, self.d_output],
                Distribution::Normal(0.0, std),
                device,
            )),
            bias: Param::from_tensor(Tensor::full([self.d_output], DENSE_BIAS_INIT, device)),
            spec: Ignored(DenseSpec {
                key,
                decay: self.decay,
            }),
        }
    }
}

/// `x W + b`, no activation.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    /// `[d_input, d_output]`
    pub weight: Param<Tensor<B, 2>>,
    pub bias: Param<Tensor<B, 1>>,
    pub spec: Ignored<DenseSpec>,
}

impl<B: Backend> Dense<B> {
    pub fn key(&self) -> &ParamKey {
        &self.spec.key
    }

    pub fn d_input(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: Tensor<B, 2>, losses: &mut LossCollection<B>) -> Tensor<B, 2> {
        losses.weight_decay(self.spec.key.weights(), self.weight.val(), self.spec.decay);
        x.matmul(self.weight.val()) + self.bias.val().unsqueeze()
    }

    pub fn param_entries(&self) -> Vec<ParamEntry> {
        vec![
            ParamEntry {
                key: self.spec.key.weights(),
                shape: self.weight.dims().to_vec(),
            },
            ParamEntry {
                key: self.spec.key.biases(),
                shape: self.bias.dims().to_vec(),
            },
        ]
    }
}
