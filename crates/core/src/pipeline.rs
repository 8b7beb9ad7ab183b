//! Execution seam between cached weights and model backends.
//!
//! A pipeline turns a loaded model's tensors into something runnable. Only
//! super-resolution has an in-process backend; diffusion and text models
//! are cached and composed here but executed by external runtimes, so
//! requesting a pipeline for them yields a typed error rather than a panic.

use candle_core::Tensor;
use thiserror::Error;

use crate::manifest::ModelKind;
use crate::model::LoadedModel;
use crate::upscale::Srcnn;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no in-process backend for {0} models")]
    NoBackend(ModelKind),
    #[error("model is missing required tensor '{0}'")]
    MissingTensor(String),
    #[error("invalid pipeline input: {0}")]
    BadInput(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// A runnable model. Implementations are CPU-synchronous; callers run them
/// on a blocking thread.
pub trait ModelPipeline: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Run the model on a `(channels, height, width)` f32 image tensor with
    /// values in `[0, 1]`, producing a tensor of the same layout.
    fn run(&self, input: &Tensor) -> Result<Tensor, PipelineError>;
}

impl std::fmt::Debug for dyn ModelPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPipeline")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Build the pipeline for a loaded model, dispatching on its manifest kind.
pub fn build_pipeline(model: &LoadedModel) -> Result<Box<dyn ModelPipeline>, PipelineError> {
    match model.kind {
        ModelKind::Superres => Ok(Box::new(Srcnn::from_model(model)?)),
        kind => Err(PipelineError::NoBackend(kind)),
    }
}
