//! Checksum-verified weight downloads.
//!
//! Weight files are streamed into a content-addressed on-disk cache and
//! hashed incrementally as bytes arrive. The size limit is a hard streaming
//! byte-counter: a server lying about `Content-Length` still gets cut off
//! mid-download. Nothing ever lands at a final cache path without its
//! SHA-256 digest matching the manifest.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use url::Url;

use thiserror::Error;

/// Errors from downloading or verifying a weight file.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot resolve URI to an HTTPS endpoint: {0}")]
    UnsupportedScheme(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("download from {url} exceeds size limit of {limit} bytes")]
    TooLarge { limit: u64, url: String },
    #[error("checksum mismatch for {url}: manifest declares {expected}, file hashed to {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Directory for verified weight files, content-addressed by digest.
    pub cache_dir: PathBuf,
    /// Hard cap on downloaded bytes per file.
    pub max_bytes: u64,
    /// Per-request timeout covering the full body read.
    pub timeout: Duration,
}

impl FetchConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            // 16 GiB covers current diffusion checkpoints with headroom.
            max_bytes: 16 * 1024 * 1024 * 1024,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Downloads weight files and verifies them against manifest digests.
pub struct ModelFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ModelFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        std::fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Cache path a verified file for `sha256` would occupy.
    pub fn cache_path(&self, sha256: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{sha256}.safetensors"))
    }

    /// Fetch `uri` into the cache, returning the verified local path.
    ///
    /// An existing cache file is re-hashed before reuse; a stale or
    /// corrupted file is deleted and re-downloaded. The download streams
    /// into a temp file in the cache directory and is persisted only after
    /// the digest matches, so no partial file is ever visible at the final
    /// path.
    pub async fn fetch_verified(&self, uri: &str, sha256: &str) -> Result<PathBuf, FetchError> {
        let final_path = self.cache_path(sha256);

        if final_path.exists() {
            let actual = file_sha256(&final_path).await?;
            if actual == sha256 {
                tracing::debug!(path = %final_path.display(), "weights cache hit");
                return Ok(final_path);
            }
            tracing::warn!(
                path = %final_path.display(),
                expected = sha256,
                actual = %actual,
                "stale cache file failed verification, re-downloading"
            );
            std::fs::remove_file(&final_path)?;
        }

        let mut temp = NamedTempFile::new_in(&self.config.cache_dir)?;
        self.download_verified(uri, sha256, &mut temp).await?;
        temp.persist(&final_path).map_err(|e| e.error)?;
        tracing::info!(uri, path = %final_path.display(), "weights downloaded and verified");
        Ok(final_path)
    }

    /// Fetch `uri` into a temporary file outside the cache directory.
    ///
    /// Used for LoRA deltas: the file exists only long enough to verify the
    /// checksum and load the tensors, then vanishes when the handle drops.
    pub async fn fetch_verified_temp(
        &self,
        uri: &str,
        sha256: &str,
    ) -> Result<NamedTempFile, FetchError> {
        let mut temp = NamedTempFile::new()?;
        self.download_verified(uri, sha256, &mut temp).await?;
        Ok(temp)
    }

    async fn download_verified(
        &self,
        uri: &str,
        expected_sha256: &str,
        dest: &mut NamedTempFile,
    ) -> Result<(), FetchError> {
        let url = resolve_url(uri)?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.config.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        // Advisory check: an honest server fails fast before any bytes move.
        if let Some(declared) = response.content_length() {
            if declared > self.config.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.config.max_bytes,
                    url: url.to_string(),
                });
            }
        }

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > self.config.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.config.max_bytes,
                    url: url.to_string(),
                });
            }
            hasher.update(&chunk);
            dest.as_file_mut().write_all(&chunk)?;
        }
        dest.as_file_mut().flush()?;

        let actual = format!("{:x}", hasher.finalize());
        if actual != expected_sha256 {
            return Err(FetchError::ChecksumMismatch {
                url: url.to_string(),
                expected: expected_sha256.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

/// Rewrite object-store URIs to their public HTTPS endpoints.
///
/// Scheme allowlisting happens at manifest validation; this only maps
/// `s3://`, `gs://`, and `azure://` onto the corresponding HTTPS object
/// URLs and passes HTTP(S) through untouched.
pub fn resolve_url(uri: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(uri).map_err(|_| FetchError::UnsupportedScheme(uri.to_string()))?;
    let key = parsed.path().trim_start_matches('/');
    let rewritten = match parsed.scheme() {
        "http" | "https" => return Ok(parsed),
        "s3" => {
            let bucket = parsed
                .host_str()
                .ok_or_else(|| FetchError::UnsupportedScheme(uri.to_string()))?;
            format!("https://{bucket}.s3.amazonaws.com/{key}")
        }
        "gs" => {
            let bucket = parsed
                .host_str()
                .ok_or_else(|| FetchError::UnsupportedScheme(uri.to_string()))?;
            format!("https://storage.googleapis.com/{bucket}/{key}")
        }
        "azure" => {
            let account = parsed
                .host_str()
                .ok_or_else(|| FetchError::UnsupportedScheme(uri.to_string()))?;
            format!("https://{account}.blob.core.windows.net/{key}")
        }
        _ => return Err(FetchError::UnsupportedScheme(uri.to_string())),
    };
    Url::parse(&rewritten).map_err(|_| FetchError::UnsupportedScheme(uri.to_string()))
}

/// SHA-256 of a file on disk, as lowercase hex. Runs on the blocking pool.
pub async fn file_sha256(path: &Path) -> Result<String, FetchError> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> Result<String, std::io::Error> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await??;
    Ok(digest)
}

/// SHA-256 of a byte slice, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
