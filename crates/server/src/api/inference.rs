//! Synchronous inference over a registered model.

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use candle_core::Tensor;

use super::codec::{decode_image, encode_png};
use super::error::ApiError;
use super::types::{InferenceRequest, InferenceResponse};
use super::AppState;
use gameforge_core::lora::DeltaRequest;
use gameforge_core::pipeline::{build_pipeline, PipelineError};

/// POST /inference — run one image through a model, optionally with
/// manifest-declared deltas composed in memory first.
pub async fn run_inference(
    State(state): State<AppState>,
    Json(req): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, ApiError> {
    let manifest = state
        .registry
        .get(&req.model)
        .ok_or_else(|| ApiError::NotFound(format!("model '{}' is not registered", req.model)))?;

    let image_bytes = BASE64
        .decode(&req.image)
        .map_err(|e| ApiError::InvalidRequest(format!("image is not valid base64: {e}")))?;
    let input = decode_image(&image_bytes)?;

    let base = state.cache.get_or_load(&manifest).await?;

    // Deltas are applied to a clone; the cached entry stays pristine.
    let model = if req.deltas.is_empty() {
        (*base).clone()
    } else {
        let requests: Vec<DeltaRequest> = req
            .deltas
            .iter()
            .map(|d| DeltaRequest::new(&d.name, d.weight))
            .collect();
        let mut composed = (*base).clone();
        state
            .composer
            .compose(&manifest, &mut composed, &requests)
            .await?;
        composed
    };

    let deltas_applied: Vec<String> = req.deltas.iter().map(|d| d.name.clone()).collect();

    let output: Tensor = tokio::task::spawn_blocking(move || -> Result<Tensor, PipelineError> {
        let pipeline = build_pipeline(&model)?;
        pipeline.run(&input)
    })
    .await??;

    let png = encode_png(&output)?;
    Ok(Json(InferenceResponse {
        model: manifest.name.clone(),
        version: manifest.version,
        deltas_applied,
        image: BASE64.encode(png),
    }))
}
