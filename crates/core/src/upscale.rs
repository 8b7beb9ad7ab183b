//! SRCNN-style super-resolution backend.
//!
//! Nearest-neighbor upsample followed by a three-layer convolutional
//! refinement network, built from a verified safetensors checkpoint with
//! parameters `conv{1,2,3}.weight` and `conv{1,2,3}.bias`.

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module};

use crate::manifest::ModelKind;
use crate::model::LoadedModel;
use crate::pipeline::{ModelPipeline, PipelineError};

/// Upscale factor applied before the refinement network.
pub const DEFAULT_SCALE: usize = 4;

#[derive(Debug)]
pub struct Srcnn {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    scale: usize,
}

impl Srcnn {
    /// Assemble the network from a loaded checkpoint.
    pub fn from_model(model: &LoadedModel) -> Result<Self, PipelineError> {
        Ok(Self {
            conv1: load_conv(model, "conv1")?,
            conv2: load_conv(model, "conv2")?,
            conv3: load_conv(model, "conv3")?,
            scale: DEFAULT_SCALE,
        })
    }

    pub fn scale(&self) -> usize {
        self.scale
    }
}

fn load_conv(model: &LoadedModel, layer: &str) -> Result<Conv2d, PipelineError> {
    let weight = named_tensor(model, &format!("{layer}.weight"))?;
    let bias = named_tensor(model, &format!("{layer}.bias"))?;
    // Same-size convolution: pad by half the kernel.
    let (_, _, k, _) = weight.dims4()?;
    let config = Conv2dConfig {
        padding: k / 2,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), config))
}

fn named_tensor(model: &LoadedModel, name: &str) -> Result<Tensor, PipelineError> {
    model
        .tensor(name)
        .cloned()
        .ok_or_else(|| PipelineError::MissingTensor(name.to_string()))
}

impl ModelPipeline for Srcnn {
    fn kind(&self) -> ModelKind {
        ModelKind::Superres
    }

    fn run(&self, input: &Tensor) -> Result<Tensor, PipelineError> {
        let (_, h, w) = input
            .dims3()
            .map_err(|_| PipelineError::BadInput("expected a (C, H, W) tensor".to_string()))?;

        let x = input.unsqueeze(0)?;
        let x = x.upsample_nearest2d(h * self.scale, w * self.scale)?;
        let x = self.conv1.forward(&x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = self.conv3.forward(&x)?;
        let x = x.clamp(0f32, 1f32)?;
        Ok(x.squeeze(0)?)
    }
}
