use crate::core::Error;
use crate::core::layers::{
    ConvRelu3d, Dense, DenseConfig, LayerName, LossCollection, ParamEntry, ParamKey, Padding,
    conv_output,
};
use crate::core::tower::{StageConfig, TowerConfig, init_stages};
use burn::module::Ignored;
use burn::nn::{Dropout, DropoutConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const FUSION_SCOPE: &str = "fusion";

/// Tower activation that feeds the fusion head.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FusionLayer {
    /// Concatenated first-layer branches; the head runs its own convolution stages first.
    Conv1,
    /// Last convolution stage (`conv7` of the reference tower).
    #[default]
    Conv7,
}

impl FusionLayer {
    pub fn layer_index(&self, tower: &TowerConfig) -> usize {
        match self {
            FusionLayer::Conv1 => 1,
            FusionLayer::Conv7 => tower.depth(),
        }
    }
}

impl fmt::Display for FusionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionLayer::Conv1 => write!(f, "conv1"),
            FusionLayer::Conv7 => write!(f, "conv7"),
        }
    }
}

impl FromStr for FusionLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conv1" => Ok(FusionLayer::Conv1),
            "conv7" => Ok(FusionLayer::Conv7),
            other => Err(format!("unknown fusion layer '{other}', expected conv1 or conv7")),
        }
    }
}

#[derive(Config, Debug, PartialEq)]
pub struct DenseHeadConfig {
    pub d_input: usize,
    pub hidden: usize,
    pub classes: usize,
    #[config(default = 1.0)]
    pub keep_prob: f64,
    #[config(default = 0.0)]
    pub decay: f64,
}

impl DenseHeadConfig {
    pub fn init<B: Backend>(&self, scope: &str, device: &B::Device) -> DenseHead<B> {
        DenseHead {
            hidden: DenseConfig::new(self.d_input, self.hidden)
                .with_decay(self.decay)
                .init(ParamKey::new(scope, LayerName::Hidden), device),
            dropout: DropoutConfig::new(1.0 - self.keep_prob).init(),
            logits: DenseConfig::new(self.hidden, self.classes)
                .with_decay(self.decay)
                .init(ParamKey::new(scope, LayerName::Logits), device),
        }
    }
}

/// `fullcn` (dense + ReLU + dropout) followed by the linear `logits` projection.
#[derive(Module, Debug)]
pub struct DenseHead<B: Backend> {
    pub hidden: Dense<B>,
    pub dropout: Dropout,
    pub logits: Dense<B>,
}

impl<B: Backend> DenseHead<B> {
    pub fn forward(&self, x: Tensor<B, 2>, losses: &mut LossCollection<B>) -> Tensor<B, 2> {
        let x = relu(self.hidden.forward(x, losses));
        let x = self.dropout.forward(x);
        self.logits.forward(x, losses)
    }

    pub fn param_entries(&self) -> Vec<ParamEntry> {
        let mut entries = self.hidden.param_entries();
        entries.extend(self.logits.param_entries());
        entries
    }
}

#[derive(Config, Debug, PartialEq)]
pub struct FusionHeadConfig {
    pub layer: FusionLayer,
    /// `[M * C, depth, height, width]` of the concatenated features
    pub input: [usize; 4],
    /// Convolution stages run before flattening, named `conv2`, `conv3`, ...
    pub trunk: Vec<StageConfig>,
    /// Input width of the dense layer
    pub fusion_width: usize,
    pub hidden: usize,
    pub classes: usize,
    #[config(default = 1.0)]
    pub keep_prob: f64,
    #[config(default = 0.0)]
    pub decay: f64,
}

impl FusionHeadConfig {
    /// Derives the head from the towers that feed it: `modalities` copies of `tower`, tapped
    /// at `layer` for volumes of extent `spatial`.
    pub fn for_towers(
        layer: FusionLayer,
        tower: &TowerConfig,
        spatial: [usize; 3],
        modalities: usize,
        hidden: usize,
        classes: usize,
    ) -> Result<Self, Error> {
        let [c, d, h, w] = tower.feature_shape(spatial, layer.layer_index(tower))?;
        Self::for_features(layer, [modalities * c, d, h, w], tower, hidden, classes)
    }

    /// Builds the head for fused features of shape `input`. At `conv1` the trunk mirrors the
    /// stages of `tower`.
    pub fn for_features(
        layer: FusionLayer,
        input: [usize; 4],
        tower: &TowerConfig,
        hidden: usize,
        classes: usize,
    ) -> Result<Self, Error> {
        let trunk = match layer {
            FusionLayer::Conv1 => tower.stages.clone(),
            FusionLayer::Conv7 => Vec::new(),
        };

        let mut config = Self::new(layer, input, trunk, 0, hidden, classes);
        config.fusion_width = config.flattened_width()?;
        Ok(config)
    }

    /// Width of the trunk output once flattened.
    pub fn flattened_width(&self) -> Result<usize, Error> {
        let [mut channels, d, h, w] = self.input;
        let mut dims = [d, h, w];

        for stage in &self.trunk {
            for dim in dims.iter_mut() {
                let extent = *dim;
                *dim = conv_output(extent, stage.kernel, stage.stride, Padding::Same).ok_or_else(
                    || Error::shape_mismatch("fusion trunk input", &[stage.kernel], &[extent]),
                )?;
            }
            channels = stage.channels;
        }

        Ok(channels * dims.iter().product::<usize>())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FusionHead<B>, Error> {
        let width = self.flattened_width()?;
        if width != self.fusion_width {
            return Err(Error::shape_mismatch(
                "fusion dense input width",
                &[self.fusion_width],
                &[width],
            ));
        }

        let head = DenseHeadConfig::new(self.fusion_width, self.hidden, self.classes)
            .with_keep_prob(self.keep_prob)
            .with_decay(self.decay);

        Ok(FusionHead {
            trunk: init_stages(FUSION_SCOPE, self.input[0], &self.trunk, self.decay, 2, device),
            head: head.init(FUSION_SCOPE, device),
            input: Ignored(self.input),
        })
    }
}

/// Classifier over channel-concatenated per-modality features.
#[derive(Module, Debug)]
pub struct FusionHead<B: Backend> {
    pub trunk: Vec<ConvRelu3d<B>>,
    pub head: DenseHead<B>,
    pub input: Ignored<[usize; 4]>,
}

impl<B: Backend> FusionHead<B> {
    /// Fails when a batch of fused features does not have the configured shape.
    pub fn check_input(&self, dims: [usize; 5]) -> Result<(), Error> {
        if dims[1..] != self.input.0[..] {
            return Err(Error::shape_mismatch("fused features", &self.input.0, &dims[1..]));
        }
        Ok(())
    }

    pub fn forward(&self, x: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 2> {
        let x = self.trunk.iter().fold(x, |x, stage| stage.forward(x, losses));
        let [n, c, d, h, w] = x.dims();
        self.head.forward(x.reshape([n, c * d * h * w]), losses)
    }

    pub fn param_entries(&self) -> Vec<ParamEntry> {
        let mut entries: Vec<ParamEntry> =
            self.trunk.iter().flat_map(|l| l.param_entries()).collect();
        entries.extend(self.head.param_entries());
        entries
    }
}
