use crate::core::Error;
use crate::core::layers::{
    ConvRelu3d, ConvRelu3dConfig, LayerName, LossCollection, ParamEntry, ParamKey, Padding,
    conv_output,
};
use burn::prelude::*;

#[derive(Config, Debug, PartialEq)]
pub struct StageConfig {
    pub kernel: usize,
    pub channels: usize,
    #[config(default = 2)]
    pub stride: usize,
}

/// Per-modality convolutional tower: parallel first-layer branches whose outputs are
/// concatenated into `conv1`, followed by sequential stages `conv2`, `conv3`, ...
#[derive(Config, Debug, PartialEq)]
pub struct TowerConfig {
    pub in_channels: usize,
    pub branch_kernels: Vec<usize>,
    pub branch_channels: usize,
    #[config(default = 2)]
    pub branch_stride: usize,
    pub stages: Vec<StageConfig>,
    /// L2 coefficient for every convolution weight
    #[config(default = 0.0)]
    pub decay: f64,
}

impl TowerConfig {
    /// Kernels 5, 6, 7 with 10 channels each, then six stride-2 stages up to 512 channels.
    pub fn paper(in_channels: usize) -> Self {
        Self::new(
            in_channels,
            vec![5, 6, 7],
            10,
            vec![
                StageConfig::new(5, 32),
                StageConfig::new(5, 64),
                StageConfig::new(3, 64),
                StageConfig::new(3, 128),
                StageConfig::new(3, 256),
                StageConfig::new(3, 512),
            ],
        )
    }

    pub fn conv1_channels(&self) -> usize {
        self.branch_kernels.len() * self.branch_channels
    }

    /// Index of the last convolution, `conv1` when there are no stages.
    pub fn depth(&self) -> usize {
        self.stages.len() + 1
    }

    fn check_layer(&self, layer: usize) -> Result<(), Error> {
        if layer < 1 || layer > self.depth() {
            return Err(Error::UnknownLayer(format!("conv{layer}")));
        }
        Ok(())
    }

    pub fn out_channels(&self, layer: usize) -> Result<usize, Error> {
        self.check_layer(layer)?;
        Ok(match layer {
            1 => self.conv1_channels(),
            k => self.stages[k - 2].channels,
        })
    }

    /// Activation shape `[channels, depth, height, width]` at `conv<layer>` for one input volume.
    pub fn feature_shape(&self, spatial: [usize; 3], layer: usize) -> Result<[usize; 4], Error> {
        self.check_layer(layer)?;

        let step = |dims: [usize; 3], kernel: usize, stride: usize| -> Result<[usize; 3], Error> {
            let mut out = [0; 3];
            for (o, d) in out.iter_mut().zip(dims) {
                *o = conv_output(d, kernel, stride, Padding::Same).ok_or_else(|| {
                    Error::shape_mismatch("convolution input", &[kernel; 3], &dims)
                })?;
            }
            Ok(out)
        };

        let mut dims = spatial;
        if let Some(&kernel) = self.branch_kernels.first() {
            dims = step(dims, kernel, self.branch_stride)?;
        }
        for stage in self.stages.iter().take(layer - 1) {
            dims = step(dims, stage.kernel, stage.stride)?;
        }

        Ok([self.out_channels(layer)?, dims[0], dims[1], dims[2]])
    }

    /// Parameter names and shapes without allocating any tensor.
    pub fn param_entries(&self, scope: &str) -> Vec<ParamEntry> {
        let entry = |layer: LayerName, shape: Vec<usize>, out: usize| {
            let key = ParamKey::new(scope, layer);
            [
                ParamEntry {
                    key: key.weights(),
                    shape,
                },
                ParamEntry {
                    key: key.biases(),
                    shape: vec![out],
                },
            ]
        };

        let mut entries = Vec::new();
        for (i, &k) in self.branch_kernels.iter().enumerate() {
            entries.extend(entry(
                LayerName::Branch(i),
                vec![self.branch_channels, self.in_channels, k, k, k],
                self.branch_channels,
            ));
        }
        let mut prev = self.conv1_channels();
        for (j, stage) in self.stages.iter().enumerate() {
            let k = stage.kernel;
            entries.extend(entry(
                LayerName::Conv(j + 2),
                vec![stage.channels, prev, k, k, k],
                stage.channels,
            ));
            prev = stage.channels;
        }
        entries
    }

    pub fn init<B: Backend>(&self, scope: &str, device: &B::Device) -> Tower<B> {
        let branches = self
            .branch_kernels
            .iter()
            .enumerate()
            .map(|(i, &kernel)| {
                ConvRelu3dConfig::new([self.in_channels, self.branch_channels], kernel)
                    .with_stride(self.branch_stride)
                    .with_decay(self.decay)
                    .init(ParamKey::new(scope, LayerName::Branch(i)), device)
            })
            .collect();

        Tower {
            branches,
            stages: init_stages(scope, self.conv1_channels(), &self.stages, self.decay, 2, device),
        }
    }
}

/// Sequential `Same`-padded stages named `conv<first>`, `conv<first + 1>`, ...
pub(crate) fn init_stages<B: Backend>(
    scope: &str,
    in_channels: usize,
    stages: &[StageConfig],
    decay: f64,
    first: usize,
    device: &B::Device,
) -> Vec<ConvRelu3d<B>> {
    let mut prev = in_channels;
    stages
        .iter()
        .enumerate()
        .map(|(j, stage)| {
            let layer = ConvRelu3dConfig::new([prev, stage.channels], stage.kernel)
                .with_stride(stage.stride)
                .with_decay(decay)
                .init(ParamKey::new(scope, LayerName::Conv(first + j)), device);
            prev = stage.channels;
            layer
        })
        .collect()
}

#[derive(Module, Debug)]
pub struct Tower<B: Backend> {
    pub branches: Vec<ConvRelu3d<B>>,
    pub stages: Vec<ConvRelu3d<B>>,
}

impl<B: Backend> Tower<B> {
    pub fn depth(&self) -> usize {
        self.stages.len() + 1
    }

    /// Runs the tower up to and including `conv<layer>`.
    pub fn forward_to(
        &self,
        x: Tensor<B, 5>,
        layer: usize,
        losses: &mut LossCollection<B>,
    ) -> Tensor<B, 5> {
        let conv1 = Tensor::cat(
            self.branches
                .iter()
                .map(|branch| branch.forward(x.clone(), losses))
                .collect(),
            1,
        );

        self.stages
            .iter()
            .take(layer.saturating_sub(1))
            .fold(conv1, |x, stage| stage.forward(x, losses))
    }

    pub fn forward(&self, x: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 5> {
        self.forward_to(x, self.depth(), losses)
    }

    /// Every convolution of the tower in order: branches first, then stages.
    pub fn layers(&self) -> impl Iterator<Item = &ConvRelu3d<B>> {
        self.branches.iter().chain(self.stages.iter())
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut ConvRelu3d<B>> {
        self.branches.iter_mut().chain(self.stages.iter_mut())
    }

    pub fn param_entries(&self) -> Vec<ParamEntry> {
        self.layers().flat_map(|l| l.param_entries()).collect()
    }
}
