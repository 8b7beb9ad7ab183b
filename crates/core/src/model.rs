//! In-memory representation of a loaded model.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use thiserror::Error;

use crate::manifest::{ModelKind, ModelManifest};

/// Errors from loading or mutating model weights.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("shape mismatch for parameter '{name}': base {base:?}, delta {delta:?}")]
    ShapeMismatch {
        name: String,
        base: Vec<usize>,
        delta: Vec<usize>,
    },
}

/// A model's named parameters, resident in memory.
///
/// Cloning is cheap: candle tensors are reference-counted handles, and
/// delta application replaces map entries rather than mutating storage, so
/// a clone taken before composition keeps the pristine base weights.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub name: String,
    pub version: u32,
    pub kind: ModelKind,
    tensors: HashMap<String, Tensor>,
    size_bytes: u64,
}

impl LoadedModel {
    /// Load a model's weights from a verified safetensors file.
    pub fn from_safetensors(
        manifest: &ModelManifest,
        path: &Path,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Ok(Self::from_tensors(manifest, tensors))
    }

    /// Build a model directly from named tensors.
    pub fn from_tensors(manifest: &ModelManifest, tensors: HashMap<String, Tensor>) -> Self {
        let size_bytes = tensors
            .values()
            .map(|t| (t.elem_count() * t.dtype().size_in_bytes()) as u64)
            .sum();
        Self {
            name: manifest.name.clone(),
            version: manifest.version,
            kind: manifest.kind,
            tensors,
            size_bytes,
        }
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Resident size of all parameters in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Add `delta * weight` onto every base parameter the delta names.
    ///
    /// Parameters present in the delta but absent from the base are
    /// skipped; a delta tensor whose shape disagrees with its base
    /// counterpart is an error. Returns the number of parameters updated.
    pub fn apply_delta(
        &mut self,
        delta: &HashMap<String, Tensor>,
        weight: f64,
    ) -> Result<usize, ModelError> {
        let mut applied = 0;
        for (name, delta_tensor) in delta {
            let Some(base) = self.tensors.get_mut(name) else {
                continue;
            };
            if base.dims() != delta_tensor.dims() {
                return Err(ModelError::ShapeMismatch {
                    name: name.clone(),
                    base: base.dims().to_vec(),
                    delta: delta_tensor.dims().to_vec(),
                });
            }
            let scaled = (delta_tensor * weight)?;
            *base = (&*base + &scaled)?;
            applied += 1;
        }
        Ok(applied)
    }
}
