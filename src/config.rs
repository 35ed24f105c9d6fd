use std::path::PathBuf;

use tokio::time::Duration;

use crate::{manager::ManagerSettings, normalizer::NormalizePolicy, tools::ToolPaths};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;
const DEFAULT_MAX_PENDING_JOBS: usize = 32;
const DEFAULT_JOB_TTL_SECONDS: u64 = 60 * 60;
const DEFAULT_REAP_INTERVAL_SECONDS: u64 = 15 * 60;
const DEFAULT_EXTRACTION_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_TRANSCODE_TIMEOUT_SECONDS: u64 = 1_800;
const DEFAULT_FORMATS_TIMEOUT_SECONDS: u64 = 120;
const DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub public_base_url: Option<String>,
    pub storage_dir: PathBuf,
    pub cookie_dirs: Vec<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub max_pending_jobs: usize,
    pub job_ttl: Duration,
    pub reap_interval: Duration,
    pub always_transcode: bool,
    pub tools: ToolPaths,
    pub extraction_timeout: Duration,
    pub transcode_timeout: Duration,
    pub formats_timeout: Duration,
    /// Empty means "use the development defaults".
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));
        let positive = |name: &str| {
            text(name)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
        };
        let seconds = |name: &str, default: u64| Duration::from_secs(positive(name).unwrap_or(default));
        let count = |name: &str, default: usize| {
            positive(name)
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(default)
        };

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            yt_dlp: text("YT_DLP_BIN").unwrap_or(defaults.yt_dlp),
            ffmpeg: text("FFMPEG_BIN").unwrap_or(defaults.ffmpeg),
            ffprobe: text("FFPROBE_BIN").unwrap_or(defaults.ffprobe),
        };

        let cookie_dirs = text("COOKIES_DIRS")
            .map(|value| split_list(&value).into_iter().map(PathBuf::from).collect())
            .unwrap_or_else(|| vec![PathBuf::from("./cookies"), PathBuf::from(".")]);

        Self {
            bind_addr: resolve_bind_addr(text("APP_ADDR"), text("PORT")),
            public_base_url: text("PUBLIC_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            storage_dir: text("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
            cookie_dirs,
            max_concurrent_downloads: count(
                "MAX_CONCURRENT_DOWNLOADS",
                DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            ),
            max_pending_jobs: count("MAX_PENDING_JOBS", DEFAULT_MAX_PENDING_JOBS),
            job_ttl: seconds("JOB_TTL_SECONDS", DEFAULT_JOB_TTL_SECONDS),
            reap_interval: seconds("REAP_INTERVAL_SECONDS", DEFAULT_REAP_INTERVAL_SECONDS),
            always_transcode: text("ALWAYS_TRANSCODE")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(true),
            tools,
            extraction_timeout: seconds(
                "EXTRACTION_TIMEOUT_SECONDS",
                DEFAULT_EXTRACTION_TIMEOUT_SECONDS,
            ),
            transcode_timeout: seconds(
                "TRANSCODE_TIMEOUT_SECONDS",
                DEFAULT_TRANSCODE_TIMEOUT_SECONDS,
            ),
            formats_timeout: seconds("FORMATS_TIMEOUT_SECONDS", DEFAULT_FORMATS_TIMEOUT_SECONDS),
            allowed_origins: text("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        }
    }

    pub fn normalize_policy(&self) -> NormalizePolicy {
        if self.always_transcode {
            NormalizePolicy::Always
        } else {
            NormalizePolicy::ProbeFirst
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            max_concurrent: self.max_concurrent_downloads,
            max_pending: self.max_pending_jobs,
            job_ttl: self.job_ttl,
            default_policy: self.normalize_policy(),
            public_base_url: self.public_base_url.clone(),
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        if self.allowed_origins.is_empty() {
            DEV_ORIGINS.iter().map(ToString::to_string).collect()
        } else {
            self.allowed_origins.clone()
        }
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
