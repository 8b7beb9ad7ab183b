pub mod auth;
pub mod codec;
pub mod error;
pub mod health;
pub mod inference;
pub mod models;
pub mod superres;
pub mod types;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use gameforge_core::cache::ModelCache;
use gameforge_core::fetch::ModelFetcher;
use gameforge_core::lora::LoraComposer;
use gameforge_core::registry::ManifestRegistry;

use superres::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ManifestRegistry>,
    pub fetcher: Arc<ModelFetcher>,
    pub cache: Arc<ModelCache>,
    pub composer: Arc<LoraComposer>,
    pub jobs: JobStore,
    pub assets_dir: Option<PathBuf>,
    api_keys: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(
        registry: Arc<ManifestRegistry>,
        fetcher: Arc<ModelFetcher>,
        cache: Arc<ModelCache>,
        composer: Arc<LoraComposer>,
        assets_dir: Option<PathBuf>,
        api_keys: HashSet<String>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            cache,
            composer,
            jobs: superres::new_job_store(),
            assets_dir,
            api_keys: Arc::new(api_keys),
        }
    }
}

/// Configuration for CORS middleware.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Comma-separated allowed origins, or "*" for all.
    pub allowed_origins: String,
    /// Comma-separated allowed methods.
    pub allowed_methods: String,
    /// Comma-separated allowed headers, or "*" for all.
    pub allowed_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: "*".to_string(),
            allowed_methods: "GET,POST,DELETE,OPTIONS".to_string(),
            allowed_headers: "*".to_string(),
        }
    }
}

/// Build a `CorsLayer` from a `CorsConfig`.
///
/// When all three fields use their wildcard defaults, this returns
/// `CorsLayer::very_permissive()`. Otherwise each field is parsed into the
/// corresponding typed values.
pub fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins == "*"
        && config.allowed_headers == "*"
        && config.allowed_methods == "GET,POST,DELETE,OPTIONS"
    {
        return CorsLayer::very_permissive();
    }

    let mut layer = CorsLayer::new();

    if config.allowed_origins == "*" {
        layer = layer.allow_origin(AllowOrigin::any());
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                HeaderValue::from_str(trimmed).ok()
            })
            .collect();
        layer = layer.allow_origin(origins);
    }

    let methods: Vec<Method> = config
        .allowed_methods
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<Method>().ok()
        })
        .collect();
    layer = layer.allow_methods(AllowMethods::list(methods));

    if config.allowed_headers == "*" {
        layer = layer.allow_headers(AllowHeaders::any());
    } else {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                trimmed.parse::<HeaderName>().ok()
            })
            .collect();
        layer = layer.allow_headers(AllowHeaders::list(headers));
    }

    layer
}

pub fn create_router(state: AppState) -> Router {
    create_router_with_cors(state, CorsLayer::very_permissive())
}

/// `/health` stays reachable without a key so load balancers can probe it;
/// everything else sits behind the bearer-token middleware.
pub fn create_router_with_cors(state: AppState, cors: CorsLayer) -> Router {
    let api_keys = state.api_keys.clone();
    let protected = Router::new()
        .route("/models", get(models::list_models))
        .route("/models/{name}/validate", post(models::validate_model))
        .route("/inference", post(inference::run_inference))
        .route("/superres", post(superres::create_job))
        .route(
            "/jobs/{id}",
            get(superres::get_job).delete(superres::cancel_job),
        )
        .route("/output/{id}", get(superres::get_output))
        .layer(axum::middleware::from_fn_with_state(
            api_keys,
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}
