use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::pipeline::PipelineError;
use crate::utils::http::get_download_client;
use crate::utils::text::truncate_for_log;

const ADAPTER_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const ADAPTER_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const ADAPTER_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    AlreadyPresent(PathBuf),
    Downloaded { path: PathBuf, size_mb: u64 },
}

impl AdapterStatus {
    pub fn into_path(self) -> PathBuf {
        match self {
            AdapterStatus::AlreadyPresent(path) => path,
            AdapterStatus::Downloaded { path, .. } => path,
        }
    }
}

/// Size on disk in whole MiB, rounded, or `None` if the file is missing.
pub fn file_size_mb(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some((metadata.len() as f64 / BYTES_PER_MB).round() as u64)
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Workers sharing a network volume may cold-start together, so every
/// download stages into its own `<name>.<pid>-<nonce>.part` next to the target.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}-{:08x}.part",
        std::process::id(),
        rand::random::<u32>()
    ));
    path.with_file_name(name)
}

enum AttemptError {
    Retryable(String),
    Fatal(String),
}

async fn download_once(url: &str, target: &Path) -> Result<(), AttemptError> {
    let client = get_download_client();
    let mut response = client.get(url).send().await.map_err(|err| {
        let detail = format!(
            "request failed: {err} (timeout={}, connect={})",
            err.is_timeout(),
            err.is_connect()
        );
        if should_retry_error(&err) {
            AttemptError::Retryable(detail)
        } else {
            AttemptError::Fatal(detail)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = format!(
            "status {}: {}",
            status,
            truncate_for_log(&body, ADAPTER_DOWNLOAD_ERROR_BODY_LIMIT)
        );
        return Err(if should_retry_status(status) {
            AttemptError::Retryable(detail)
        } else {
            AttemptError::Fatal(detail)
        });
    }

    let mut file = fs::File::create(target)
        .await
        .map_err(|err| AttemptError::Fatal(format!("cannot create {}: {err}", target.display())))?;
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|err| AttemptError::Retryable(format!("body read failed: {err}")))?;
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk)
            .await
            .map_err(|err| AttemptError::Fatal(format!("write failed: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| AttemptError::Fatal(format!("flush failed: {err}")))?;
    Ok(())
}

/// Makes sure the style adapter weights are on disk at `path`, downloading
/// them from `url` only when the file is absent. The download lands in a
/// `.part` file first so a crash never leaves a truncated adapter behind.
pub async fn ensure_style_adapter(url: &str, path: &Path) -> Result<AdapterStatus, PipelineError> {
    if path.is_file() {
        info!("Style adapter already at {}", path.display());
        return Ok(AdapterStatus::AlreadyPresent(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            PipelineError::Download(format!("cannot create {}: {err}", parent.display()))
        })?;
    }

    info!("Downloading style adapter from {url}...");
    let staging = staging_path(path);
    let mut last_error = String::new();
    for attempt in 0..ADAPTER_DOWNLOAD_MAX_ATTEMPTS {
        match download_once(url, &staging).await {
            Ok(()) => {
                if let Err(err) = fs::rename(&staging, path).await {
                    let _ = fs::remove_file(&staging).await;
                    return Err(PipelineError::Download(format!(
                        "cannot move adapter into place: {err}"
                    )));
                }
                let size_mb = file_size_mb(path).unwrap_or(0);
                return Ok(AdapterStatus::Downloaded {
                    path: path.to_path_buf(),
                    size_mb,
                });
            }
            Err(AttemptError::Fatal(detail)) => {
                last_error = detail;
                break;
            }
            Err(AttemptError::Retryable(detail)) => {
                warn!(
                    "Style adapter download attempt {}/{} failed: {}",
                    attempt + 1,
                    ADAPTER_DOWNLOAD_MAX_ATTEMPTS,
                    detail
                );
                last_error = detail;
                if attempt + 1 < ADAPTER_DOWNLOAD_MAX_ATTEMPTS {
                    let delay = Duration::from_millis(ADAPTER_DOWNLOAD_BASE_DELAY_MS << attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let _ = fs::remove_file(&staging).await;
    Err(PipelineError::Download(format!("{url}: {last_error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, CannedResponse};
    use std::sync::atomic::Ordering;

    fn staged_leftovers(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "part"))
            .collect()
    }

    #[tokio::test]
    async fn existing_file_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        std::fs::write(&path, b"weights").unwrap();

        let status = ensure_style_adapter("http://127.0.0.1:1/never-called", &path)
            .await
            .unwrap();
        assert_eq!(status, AdapterStatus::AlreadyPresent(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn downloads_into_missing_directories() {
        let server = serve(vec![CannedResponse::bytes(200, b"lora-bytes")]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("adapter.safetensors");

        let url = format!("{}/adapter.safetensors", server.base_url);
        let status = ensure_style_adapter(&url, &path).await.unwrap();

        assert_eq!(
            status,
            AdapterStatus::Downloaded {
                path: path.clone(),
                size_mb: 0
            }
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"lora-bytes");
        assert!(staged_leftovers(&dir.path().join("models")).is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = serve(vec![
            CannedResponse::bytes(503, b"busy"),
            CannedResponse::bytes(200, b"ok"),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");

        let url = format!("{}/adapter.safetensors", server.base_url);
        ensure_style_adapter(&url, &path).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn not_found_fails_without_retry_or_leftovers() {
        let server = serve(vec![CannedResponse::bytes(404, b"missing")]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");

        let url = format!("{}/adapter.safetensors", server.base_url);
        let err = ensure_style_adapter(&url, &path).await.unwrap_err();

        assert!(matches!(err, PipelineError::Download(ref detail) if detail.contains("404")));
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(staged_leftovers(dir.path()).is_empty());
    }

    #[test]
    fn size_is_rounded_to_whole_megabytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        std::fs::write(&path, vec![0u8; 1024 * 1024 + 600 * 1024]).unwrap();
        assert_eq!(file_size_mb(&path), Some(2));
        assert_eq!(file_size_mb(&dir.path().join("absent")), None);
    }

    #[test]
    fn staging_files_are_unique_per_download() {
        let path = Path::new("/vol/models/adapter.safetensors");
        let first = staging_path(path);
        let second = staging_path(path);
        assert_ne!(first, second);
        assert_eq!(first.parent(), path.parent());
        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("adapter.safetensors.{}-", std::process::id())));
        assert!(name.ends_with(".part"));
    }

    #[tokio::test]
    async fn concurrent_downloads_do_not_share_a_staging_file() {
        let server = serve(vec![CannedResponse::bytes(200, b"lora-bytes")]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("adapter.safetensors");
        let url = format!("{}/adapter.safetensors", server.base_url);

        let (first, second) = tokio::join!(
            ensure_style_adapter(&url, &path),
            ensure_style_adapter(&url, &path)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"lora-bytes");
        assert!(staged_leftovers(&dir.path().join("models")).is_empty());
    }
}
