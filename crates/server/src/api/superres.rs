//! Asynchronous super-resolution jobs.
//!
//! Submit an image (uploaded or referenced from the asset directory), poll
//! job status, and fetch the upscaled PNG. Jobs and outputs live in memory
//! for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::codec::{decode_image, encode_png};
use super::error::ApiError;
use super::AppState;
use gameforge_core::manifest::{ModelKind, ModelManifest};
use gameforge_core::pipeline::{build_pipeline, PipelineError};

/// Status of an upscale job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// In-memory upscale job state.
#[derive(Debug, Clone)]
pub struct UpscaleJob {
    pub id: String,
    pub model: String,
    pub status: JobStatus,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    /// Encoded PNG result, present once completed.
    pub output_png: Option<Vec<u8>>,
    /// Set to true to signal cancellation to the processing task.
    pub cancel_requested: bool,
}

/// Shared job store type.
pub type JobStore = Arc<tokio::sync::RwLock<HashMap<String, UpscaleJob>>>;

/// Create a new empty job store.
pub fn new_job_store() -> JobStore {
    Arc::new(tokio::sync::RwLock::new(HashMap::new()))
}

/// Finished jobs (and their output PNGs) retained at most this many; the
/// oldest are dropped so the store does not grow for the process lifetime.
const MAX_TERMINAL_JOBS: usize = 256;

fn prune_terminal_jobs(jobs: &mut HashMap<String, UpscaleJob>) {
    let mut terminal: Vec<(String, u64)> = jobs
        .values()
        .filter(|j| j.status.is_terminal())
        .map(|j| (j.id.clone(), j.completed_at.unwrap_or(j.created_at)))
        .collect();
    if terminal.len() <= MAX_TERMINAL_JOBS {
        return;
    }
    terminal.sort_by_key(|&(_, at)| at);
    let excess = terminal.len() - MAX_TERMINAL_JOBS;
    for (id, _) in terminal.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

/// Job response body.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub status: JobStatus,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResponse {
    fn from_job(job: &UpscaleJob) -> Self {
        Self {
            id: job.id.clone(),
            object: "upscale.job",
            model: job.model.clone(),
            status: job.status,
            created_at: job.created_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Asset names must be bare file names; anything path-like is rejected.
fn validate_asset_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(ApiError::InvalidRequest(format!(
            "invalid asset name '{name}'"
        )));
    }
    Ok(())
}

/// JSON body alternative to the multipart form: reference an image from the
/// configured asset directory by name.
#[derive(Debug, Deserialize)]
pub struct AssetJobRequest {
    pub model: String,
    pub asset: String,
}

struct JobSubmission {
    model: String,
    file: Option<Vec<u8>>,
    asset: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<JobSubmission, ApiError> {
    let mut model: Option<String> = None;
    let mut file: Option<Vec<u8>> = None;
    let mut asset: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("model") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
                model = Some(text);
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
                file = Some(bytes.to_vec());
            }
            Some("asset") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
                asset = Some(text);
            }
            _ => {}
        }
    }

    let model = model
        .ok_or_else(|| ApiError::InvalidRequest("missing 'model' field".to_string()))?;
    Ok(JobSubmission { model, file, asset })
}

/// POST /superres — submit an upscale job.
///
/// Accepts either a multipart form (`model` plus a `file` upload or an
/// `asset` name) or a JSON body `{ "model", "asset" }` referencing the
/// configured asset directory.
pub async fn create_job(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<JobResponse>, ApiError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let JobSubmission { model, file, asset } = if content_type.starts_with("multipart/form-data")
    {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("malformed multipart body: {e}")))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<AssetJobRequest>::from_request(req, &state)
            .await
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        JobSubmission {
            model: body.model,
            file: None,
            asset: Some(body.asset),
        }
    };

    let manifest = state
        .registry
        .get(&model)
        .ok_or_else(|| ApiError::NotFound(format!("model '{model}' is not registered")))?;
    if manifest.kind != ModelKind::Superres {
        return Err(ApiError::InvalidRequest(format!(
            "model '{model}' is a {} model, not superres",
            manifest.kind
        )));
    }

    let image_bytes = match (file, asset) {
        (Some(bytes), _) => bytes,
        (None, Some(name)) => {
            validate_asset_name(&name)?;
            let dir = state.assets_dir.as_ref().ok_or_else(|| {
                ApiError::InvalidRequest("no asset directory is configured".to_string())
            })?;
            tokio::fs::read(dir.join(&name))
                .await
                .map_err(|_| ApiError::NotFound(format!("asset '{name}' not found")))?
        }
        (None, None) => {
            return Err(ApiError::InvalidRequest(
                "provide either a 'file' upload or an 'asset' name".to_string(),
            ))
        }
    };

    let job_id = format!("upscale_{}", uuid::Uuid::new_v4().as_simple());
    let job = UpscaleJob {
        id: job_id.clone(),
        model: manifest.name.clone(),
        status: JobStatus::Queued,
        created_at: unix_now(),
        completed_at: None,
        error: None,
        output_png: None,
        cancel_requested: false,
    };
    let response = JobResponse::from_job(&job);

    {
        let mut jobs = state.jobs.write().await;
        jobs.insert(job_id.clone(), job);
    }

    let task_state = state.clone();
    tokio::spawn(async move {
        process_job(task_state, job_id, manifest, image_bytes).await;
    });

    Ok(Json(response))
}

async fn process_job(
    state: AppState,
    job_id: String,
    manifest: std::sync::Arc<ModelManifest>,
    image_bytes: Vec<u8>,
) {
    if !advance(&state, &job_id, JobStatus::InProgress).await {
        return;
    }

    let result = run_upscale(&state, &manifest, &image_bytes).await;

    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(&job_id) else {
        return;
    };
    if job.cancel_requested {
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(unix_now());
        prune_terminal_jobs(&mut jobs);
        return;
    }
    match result {
        Ok(png) => {
            tracing::info!(job = %job_id, model = %manifest.name, "upscale job completed");
            job.output_png = Some(png);
            job.status = JobStatus::Completed;
        }
        Err(err) => {
            tracing::warn!(job = %job_id, error = %err, "upscale job failed");
            job.error = Some(err);
            job.status = JobStatus::Failed;
        }
    }
    job.completed_at = Some(unix_now());
    prune_terminal_jobs(&mut jobs);
}

/// Move a non-cancelled job to `status`; false if the job is gone or
/// cancellation was requested.
async fn advance(state: &AppState, job_id: &str, status: JobStatus) -> bool {
    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(job_id) else {
        return false;
    };
    if job.cancel_requested {
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(unix_now());
        return false;
    }
    job.status = status;
    true
}

async fn run_upscale(
    state: &AppState,
    manifest: &ModelManifest,
    image_bytes: &[u8],
) -> Result<Vec<u8>, String> {
    let input = decode_image(image_bytes).map_err(|_| "could not decode image".to_string())?;
    let model = state
        .cache
        .get_or_load(manifest)
        .await
        .map_err(|e| e.to_string())?;

    let output = tokio::task::spawn_blocking(move || -> Result<_, PipelineError> {
        let pipeline = build_pipeline(&model)?;
        pipeline.run(&input)
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())?;

    encode_png(&output).map_err(|_| "could not encode output image".to_string())
}

/// GET /jobs/{id} — job status.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let jobs = state.jobs.read().await;
    let job = jobs
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job '{id}' not found")))?;
    Ok(Json(JobResponse::from_job(job)))
}

/// DELETE /jobs/{id} — request cancellation.
///
/// A job that already reached a terminal state is returned unchanged.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let mut jobs = state.jobs.write().await;
    let job = jobs
        .get_mut(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job '{id}' not found")))?;
    if !job.status.is_terminal() {
        job.cancel_requested = true;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(unix_now());
    }
    let response = JobResponse::from_job(job);
    prune_terminal_jobs(&mut jobs);
    Ok(Json(response))
}

/// GET /output/{id} — the upscaled PNG for a completed job.
pub async fn get_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.jobs.read().await;
    let job = jobs
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job '{id}' not found")))?;
    match (&job.status, &job.output_png) {
        (JobStatus::Completed, Some(png)) => Ok((
            [(header::CONTENT_TYPE, "image/png")],
            png.clone(),
        )),
        _ => Err(ApiError::InvalidRequest(format!(
            "job '{id}' has no output (status: {:?})",
            job.status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    fn finished_job(id: &str, completed_at: u64) -> UpscaleJob {
        UpscaleJob {
            id: id.to_string(),
            model: "m".to_string(),
            status: JobStatus::Completed,
            created_at: completed_at,
            completed_at: Some(completed_at),
            error: None,
            output_png: Some(vec![0u8; 16]),
            cancel_requested: false,
        }
    }

    #[test]
    fn oldest_terminal_jobs_are_pruned_beyond_the_cap() {
        let mut jobs = HashMap::new();
        for i in 0..MAX_TERMINAL_JOBS + 10 {
            let id = format!("upscale_{i:04}");
            jobs.insert(id.clone(), finished_job(&id, i as u64));
        }
        let mut live = finished_job("upscale_live", 0);
        live.status = JobStatus::InProgress;
        live.completed_at = None;
        jobs.insert(live.id.clone(), live);

        prune_terminal_jobs(&mut jobs);

        assert_eq!(jobs.len(), MAX_TERMINAL_JOBS + 1);
        assert!(
            !jobs.contains_key("upscale_0000"),
            "oldest finished jobs go first"
        );
        assert!(jobs.contains_key("upscale_0010"));
        assert!(jobs.contains_key("upscale_live"), "live jobs are never pruned");
    }

    #[test]
    fn asset_names_must_be_bare_file_names() {
        assert!(validate_asset_name("scene.png").is_ok());
        assert!(validate_asset_name("../etc/passwd").is_err());
        assert!(validate_asset_name("a/b.png").is_err());
        assert!(validate_asset_name("a\\b.png").is_err());
        assert!(validate_asset_name("").is_err());
    }
}
