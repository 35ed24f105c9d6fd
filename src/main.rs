mod api;
mod config;
mod cookies;
mod extractor;
mod formats;
mod jobs;
mod manager;
mod normalizer;
#[cfg(test)]
mod testing;
mod tools;

use std::{collections::HashSet, io::ErrorKind, path::Path, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::{net::TcpListener, time::Duration};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::{ApiError, AppState},
    config::Config,
    cookies::CookieReconciler,
    extractor::Extractor,
    jobs::{MemoryJobStore, SystemClock},
    manager::{JobManager, spawn_reaper},
    normalizer::Normalizer,
    tools::{CommandRunner, ProcessRunner, tool_available},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_worker=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run(Config::from_env()).await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create storage directory {:?}: {error}",
                config.storage_dir
            ))
        })?;

    // Nothing from a previous process is tracked any more; anything old
    // enough to have been reaped goes now.
    sweep_stale_storage(&config.storage_dir, config.job_ttl).await;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let cookies = CookieReconciler::new(config.cookie_dirs.clone());
    let extractor = Extractor::new(
        Arc::clone(&runner),
        config.tools.yt_dlp.clone(),
        config.tools.ffmpeg.clone(),
        config.storage_dir.clone(),
        config.extraction_timeout,
    );
    let normalizer = Normalizer::new(
        Arc::clone(&runner),
        config.tools.ffmpeg.clone(),
        config.tools.ffprobe.clone(),
        config.transcode_timeout,
    );
    let manager = JobManager::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(SystemClock),
        cookies.clone(),
        extractor,
        normalizer,
        config.manager_settings(),
    );

    if !tool_available(runner.as_ref(), &config.tools.yt_dlp, "--version").await {
        warn!(
            "{} is not available; every job will fail until it is installed",
            config.tools.yt_dlp
        );
    }
    if !tool_available(runner.as_ref(), &config.tools.ffmpeg, "-version").await {
        warn!("ffmpeg is not available; merge downloads and normalization are disabled");
    }
    info!(
        "Policy {:?}, {} concurrent download(s), job TTL {}s",
        config.normalize_policy(),
        config.max_concurrent_downloads,
        config.job_ttl.as_secs()
    );

    spawn_reaper(manager.clone(), config.reap_interval);

    let state = AppState {
        manager,
        cookies,
        runner,
        tools: config.tools.clone(),
        formats_timeout: config.formats_timeout,
    };
    let cors = build_cors_layer(&config.cors_origins())?;
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = config.bind_addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Media worker listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected something like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!("CORS allow-list has {} origin(s)", allowed_origins.len());

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|explicit| *explicit != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

/// Removes storage entries whose mtime is older than `older_than`.
async fn sweep_stale_storage(storage_dir: &Path, older_than: Duration) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(storage_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open storage directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not list storage directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale entry {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("Removed {removed} stale storage entr(ies) left by a previous run");
    }
}
