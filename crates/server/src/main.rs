use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use candle_core::Device;
use clap::{Parser, Subcommand};

use gameforge_core::cache::{CacheConfig, ModelCache};
use gameforge_core::fetch::{FetchConfig, ModelFetcher};
use gameforge_core::lora::LoraComposer;
use gameforge_core::manifest::load_manifest;
use gameforge_core::registry::ManifestRegistry;

use gameforge_server::api::{self, auth, AppState};
use gameforge_server::config::ServerConfig;
use gameforge_server::logging;
use gameforge_server::shutdown::shutdown_signal;

#[derive(Parser)]
#[command(name = "gameforge-server", about = "Secure model manifest and loading service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Directory of model manifest YAML files
        #[arg(long, default_value = "manifests")]
        manifest_dir: String,

        /// Directory for verified weight downloads
        #[arg(long)]
        cache_dir: Option<String>,

        /// Directory of pre-registered image assets for super-resolution
        #[arg(long)]
        assets_dir: Option<String>,

        /// Maximum number of models resident in memory
        #[arg(long, default_value_t = 4)]
        max_models: usize,

        /// Memory budget for resident model weights in GiB
        #[arg(long, default_value_t = 8)]
        max_memory_gb: u64,

        /// Maximum size of a single weight download in MiB
        #[arg(long, default_value_t = 16384)]
        max_download_mb: u64,

        /// Timeout for a single weight download in seconds
        #[arg(long, default_value_t = 600)]
        download_timeout_secs: u64,

        /// Comma-separated list of allowed CORS origins ("*" allows all)
        #[arg(long, default_value = "*")]
        allowed_origins: String,

        /// Comma-separated list of allowed CORS HTTP methods
        #[arg(long, default_value = "GET,POST,DELETE,OPTIONS")]
        allowed_methods: String,

        /// Comma-separated list of allowed CORS headers ("*" allows all)
        #[arg(long, default_value = "*")]
        allowed_headers: String,

        /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Validate manifest files without starting the server
    Validate {
        /// Manifest file or directory of manifests
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config from file first
    let file_config = ServerConfig::load();
    if let Some(path) = ServerConfig::default_path() {
        if path.exists() {
            eprintln!("Loaded config from: {}", path.display());
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            manifest_dir,
            cache_dir,
            assets_dir,
            max_models,
            max_memory_gb,
            max_download_mb,
            download_timeout_secs,
            allowed_origins,
            allowed_methods,
            allowed_headers,
            log_level,
        } => {
            // Merge CLI args with file config (CLI takes precedence)
            let host = if host == "0.0.0.0" {
                file_config.host.unwrap_or(host)
            } else {
                host
            };
            let port = if port == 8080 {
                file_config.port.unwrap_or(port)
            } else {
                port
            };
            let manifest_dir = if manifest_dir == "manifests" {
                file_config.manifest_dir.unwrap_or(manifest_dir)
            } else {
                manifest_dir
            };
            let cache_dir = cache_dir.or(file_config.cache_dir);
            let assets_dir = assets_dir.or(file_config.assets_dir);
            let max_models = if max_models == 4 {
                file_config.max_models.unwrap_or(max_models)
            } else {
                max_models
            };
            let max_memory_gb = if max_memory_gb == 8 {
                file_config.max_memory_gb.unwrap_or(max_memory_gb)
            } else {
                max_memory_gb
            };
            let max_download_mb = if max_download_mb == 16384 {
                file_config.max_download_mb.unwrap_or(max_download_mb)
            } else {
                max_download_mb
            };
            let download_timeout_secs = if download_timeout_secs == 600 {
                file_config
                    .download_timeout_secs
                    .unwrap_or(download_timeout_secs)
            } else {
                download_timeout_secs
            };
            let allowed_origins = if allowed_origins == "*" {
                file_config.allowed_origins.unwrap_or(allowed_origins)
            } else {
                allowed_origins
            };
            let allowed_methods = if allowed_methods == "GET,POST,DELETE,OPTIONS" {
                file_config.allowed_methods.unwrap_or(allowed_methods)
            } else {
                allowed_methods
            };
            let allowed_headers = if allowed_headers == "*" {
                file_config.allowed_headers.unwrap_or(allowed_headers)
            } else {
                allowed_headers
            };
            let log_level = if log_level == "info" {
                file_config.log_level.unwrap_or(log_level)
            } else {
                log_level
            };

            run_server(ServerLaunchConfig {
                host,
                port,
                manifest_dir: PathBuf::from(manifest_dir),
                cache_dir: cache_dir.map(PathBuf::from),
                assets_dir: assets_dir.map(PathBuf::from),
                max_models,
                max_memory_gb,
                max_download_mb,
                download_timeout_secs,
                cors_config: api::CorsConfig {
                    allowed_origins,
                    allowed_methods,
                    allowed_headers,
                },
                log_level,
            })
            .await
        }
        Command::Validate { path } => run_validate(&path),
    }
}

struct ServerLaunchConfig {
    host: String,
    port: u16,
    manifest_dir: PathBuf,
    cache_dir: Option<PathBuf>,
    assets_dir: Option<PathBuf>,
    max_models: usize,
    max_memory_gb: u64,
    max_download_mb: u64,
    download_timeout_secs: u64,
    cors_config: api::CorsConfig,
    log_level: String,
}

async fn run_server(cfg: ServerLaunchConfig) -> anyhow::Result<()> {
    logging::init_with_level(&cfg.log_level);

    let cache_dir = cfg.cache_dir.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gameforge")
            .join("weights")
    });

    let registry = Arc::new(ManifestRegistry::new());
    let loaded = registry.load_dir(&cfg.manifest_dir)?;
    tracing::info!(
        manifests = loaded,
        dir = %cfg.manifest_dir.display(),
        "manifest registry initialized"
    );

    let fetch_config = FetchConfig::new(&cache_dir)
        .with_max_bytes(cfg.max_download_mb * 1024 * 1024)
        .with_timeout(Duration::from_secs(cfg.download_timeout_secs));
    let fetcher = Arc::new(ModelFetcher::new(fetch_config)?);

    let cache_config = CacheConfig {
        max_models: cfg.max_models,
        max_memory_bytes: cfg.max_memory_gb * 1024 * 1024 * 1024,
        device: Device::Cpu,
    };
    let cache = Arc::new(ModelCache::new(fetcher.clone(), cache_config));
    let composer = Arc::new(LoraComposer::new(fetcher.clone(), Device::Cpu));

    let api_keys: HashSet<String> = auth::api_keys_from_env();

    let state = AppState::new(
        registry,
        fetcher,
        cache,
        composer,
        cfg.assets_dir.clone(),
        api_keys,
    );
    let cors = api::build_cors_layer(&cfg.cors_config);
    let app = api::create_router_with_cors(state, cors);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, cache_dir = %cache_dir.display(), "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn run_validate(path: &PathBuf) -> anyhow::Result<()> {
    let paths: Vec<PathBuf> = if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        entries.sort();
        entries
    } else {
        vec![path.clone()]
    };

    if paths.is_empty() {
        anyhow::bail!("no manifest files found under {}", path.display());
    }

    let mut failures = 0;
    for p in &paths {
        match load_manifest(p) {
            Ok(manifest) => {
                println!(
                    "OK   {} (model '{}' v{}, {} delta(s))",
                    p.display(),
                    manifest.name,
                    manifest.version,
                    manifest.deltas.len()
                );
            }
            Err(err) => {
                failures += 1;
                println!("FAIL {}: {}", p.display(), err);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} manifest(s) failed validation", paths.len());
    }
    Ok(())
}
