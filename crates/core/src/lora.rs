//! In-memory LoRA delta composition.
//!
//! Deltas are downloaded into a temporary file only long enough to run the
//! same checksum verification as base weights, loaded into memory tensors,
//! and added (weighted) onto the base parameters. The combined model is
//! never serialized to disk.

use std::sync::Arc;

use candle_core::Device;
use thiserror::Error;

use crate::fetch::{FetchError, ModelFetcher};
use crate::manifest::ModelManifest;
use crate::model::{LoadedModel, ModelError};

/// Errors from delta composition.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("manifest '{manifest}' declares no delta named '{delta}'")]
    UnknownDelta { manifest: String, delta: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to load delta tensors: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// One requested delta application.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRequest {
    pub name: String,
    pub weight: f64,
}

impl DeltaRequest {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Summary of one applied delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaApplication {
    pub name: String,
    pub tensors_updated: usize,
}

/// Applies manifest-declared deltas onto base model weights.
pub struct LoraComposer {
    fetcher: Arc<ModelFetcher>,
    device: Device,
}

impl LoraComposer {
    pub fn new(fetcher: Arc<ModelFetcher>, device: Device) -> Self {
        Self { fetcher, device }
    }

    /// Apply each requested delta to `base`, in request order.
    ///
    /// Every delta must be declared by `manifest` and hash to its declared
    /// digest. The downloaded file is removed as soon as its tensors are
    /// in memory; the composed weights exist only in `base`.
    pub async fn compose(
        &self,
        manifest: &ModelManifest,
        base: &mut LoadedModel,
        requests: &[DeltaRequest],
    ) -> Result<Vec<DeltaApplication>, ComposeError> {
        let mut applications = Vec::with_capacity(requests.len());
        for request in requests {
            let delta = manifest
                .delta(&request.name)
                .ok_or_else(|| ComposeError::UnknownDelta {
                    manifest: manifest.name.clone(),
                    delta: request.name.clone(),
                })?;

            let temp = self
                .fetcher
                .fetch_verified_temp(&delta.uri, &delta.sha256)
                .await?;
            let tensors = candle_core::safetensors::load(temp.path(), &self.device)?;
            drop(temp);

            let tensors_updated = base.apply_delta(&tensors, request.weight)?;
            tracing::info!(
                model = %base.name,
                delta = %request.name,
                weight = request.weight,
                tensors_updated,
                "delta applied in memory"
            );
            applications.push(DeltaApplication {
                name: request.name.clone(),
                tensors_updated,
            });
        }
        Ok(applications)
    }
}
