use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

pub const DEFAULT_MODEL_ID: &str = "Tongyi-MAI/Z-Image-Turbo";
pub const DEFAULT_STYLE_ADAPTER_URL: &str = "https://github.com/JonBearHimself/avatar-zimage-worker/releases/download/v2.0/zit_sg_2_000002500.safetensors";
pub const DEFAULT_NETWORK_VOLUME_PATH: &str = "/runpod-volume";
const LOCAL_MODELS_DIR: &str = "/models";
const FALLBACK_ADAPTER_FILE_NAME: &str = "style_adapter.safetensors";

/// Where model weights and the style adapter live on disk.
///
/// A mounted network volume moves both onto persistent storage so cold starts
/// after the first one skip the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub network_volume_mounted: bool,
    pub model_cache_dir: Option<PathBuf>,
    pub style_adapter_path: PathBuf,
}

impl StoragePaths {
    pub fn resolve(network_volume: &Path, adapter_url: &str, adapter_override: Option<PathBuf>) -> Self {
        let file_name = adapter_file_name(adapter_url);
        let network_volume_mounted = network_volume.is_dir();

        let (model_cache_dir, computed_adapter_path) = if network_volume_mounted {
            let cache_dir = network_volume.join("hf_cache");
            let models_dir = network_volume.join("models");
            for dir in [&cache_dir, &models_dir] {
                if let Err(err) = fs::create_dir_all(dir) {
                    warn!("Failed to create {}: {err}", dir.display());
                }
            }
            (Some(cache_dir), models_dir.join(&file_name))
        } else {
            (None, Path::new(LOCAL_MODELS_DIR).join(&file_name))
        };

        StoragePaths {
            network_volume_mounted,
            model_cache_dir,
            style_adapter_path: adapter_override.unwrap_or(computed_adapter_path),
        }
    }
}

fn adapter_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    without_query
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_ADAPTER_FILE_NAME.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub model_id: String,
    pub style_adapter_url: String,
    pub style_adapter_required: bool,
    pub network_volume_path: PathBuf,
    pub storage: StoragePaths,
    pub diffusion_backend_url: String,
    pub diffusion_load_timeout_secs: u64,
    pub diffusion_generate_timeout_secs: u64,
    pub runpod_webhook_get_job: String,
    pub runpod_webhook_post_output: String,
    pub runpod_api_key: String,
    pub runpod_pod_id: String,
    pub job_poll_interval_ms: u64,
    pub gpu_query_timeout_secs: u64,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

impl Config {
    pub fn load() -> Result<Self> {
        let style_adapter_url = env_string("STYLE_ADAPTER_URL", DEFAULT_STYLE_ADAPTER_URL);
        if style_adapter_url.trim().is_empty() {
            return Err(anyhow::anyhow!("STYLE_ADAPTER_URL must not be empty"));
        }

        let network_volume_path = env_path("NETWORK_VOLUME_PATH")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_NETWORK_VOLUME_PATH));
        let storage = StoragePaths::resolve(
            &network_volume_path,
            &style_adapter_url,
            env_path("STYLE_ADAPTER_PATH"),
        );

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info"),
            model_id: env_string("MODEL_ID", DEFAULT_MODEL_ID),
            style_adapter_url,
            style_adapter_required: env_bool("STYLE_ADAPTER_REQUIRED", false),
            network_volume_path,
            storage,
            diffusion_backend_url: env_string("DIFFUSION_BACKEND_URL", "http://127.0.0.1:7860"),
            diffusion_load_timeout_secs: env_u64("DIFFUSION_LOAD_TIMEOUT_SECS", 900),
            diffusion_generate_timeout_secs: env_u64("DIFFUSION_GENERATE_TIMEOUT_SECS", 300),
            runpod_webhook_get_job: env_string("RUNPOD_WEBHOOK_GET_JOB", ""),
            runpod_webhook_post_output: env_string("RUNPOD_WEBHOOK_POST_OUTPUT", ""),
            runpod_api_key: env_string("RUNPOD_AI_API_KEY", ""),
            runpod_pod_id: env_string("RUNPOD_POD_ID", ""),
            job_poll_interval_ms: env_u64("JOB_POLL_INTERVAL_MS", 1000).max(50),
            gpu_query_timeout_secs: env_u64("GPU_QUERY_TIMEOUT_SECS", 5).max(1),
        })
    }
}
