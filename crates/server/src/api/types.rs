//! Request and response bodies shared across API handlers.

use serde::{Deserialize, Serialize};

/// One model entry in `GET /models`.
#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: u32,
    pub kind: String,
    pub license: String,
    pub deltas: Vec<String>,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelSummary>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub models_registered: usize,
    pub models_resident: usize,
    pub bytes_resident: u64,
}

/// One delta application in an inference request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaSpec {
    pub name: String,
    #[serde(default = "default_delta_weight")]
    pub weight: f64,
}

fn default_delta_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    /// Base64-encoded PNG or JPEG input image. Accepted under either key.
    #[serde(alias = "input")]
    pub image: String,
    #[serde(default)]
    pub deltas: Vec<DeltaSpec>,
}

#[derive(Debug, Serialize)]
pub struct InferenceResponse {
    pub model: String,
    pub version: u32,
    pub deltas_applied: Vec<String>,
    /// Base64-encoded PNG output image.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub model: String,
    pub valid: bool,
    pub cached: bool,
    /// Present only for deep validation of a cached file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_verified: Option<bool>,
}
