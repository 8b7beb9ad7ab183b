use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use super::types::{ModelSummary, ModelsResponse, ValidateResponse};
use super::AppState;
use gameforge_core::fetch::file_sha256;

/// GET /models — every registered manifest, sorted by name.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let mut data = Vec::new();
    for manifest in state.registry.list() {
        let cached = state.cache.contains(&manifest.name).await;
        data.push(ModelSummary {
            name: manifest.name.clone(),
            version: manifest.version,
            kind: manifest.kind.to_string(),
            license: manifest.license.clone(),
            deltas: manifest.deltas.iter().map(|d| d.name.clone()).collect(),
            cached,
        });
    }
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidateParams {
    /// Re-hash the cached weight file against the manifest digest.
    #[serde(default)]
    pub deep: bool,
}

/// POST /models/{name}/validate — confirm a registered manifest still
/// describes a retrievable, verifiable model.
pub async fn validate_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ValidateParams>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let manifest = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("model '{name}' is not registered")))?;

    let cache_file = state.fetcher.cache_path(&manifest.weights_sha256);
    let cached = cache_file.exists();

    let checksum_verified = if params.deep && cached {
        let actual = file_sha256(&cache_file).await?;
        Some(actual == manifest.weights_sha256)
    } else {
        None
    };

    Ok(Json(ValidateResponse {
        model: manifest.name.clone(),
        // Registration already implies the manifest passed validation.
        valid: checksum_verified.unwrap_or(true),
        cached,
        checksum_verified,
    }))
}
