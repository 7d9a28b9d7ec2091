use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::job::Diagnostics;
use crate::pipeline::adapter::file_size_mb;
use crate::pipeline::DiffusionBackend;
use crate::worker::Worker;

const GPU_QUERY_PROGRAM: &str = "nvidia-smi";
const GPU_QUERY_ARGS: [&str; 2] = [
    "--query-gpu=name,memory.total,memory.used",
    "--format=csv,noheader",
];

/// Runs a hardware query and reports its output. Every failure mode is folded
/// into the returned text so diagnostics never fail as a whole.
pub async fn run_gpu_query(program: &str, args: &[&str], limit: Duration) -> String {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    match timeout(limit, command.output()).await {
        Err(_) => format!("{program} timed out after {} seconds", limit.as_secs()),
        Ok(Err(err)) => err.to_string(),
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(Ok(output)) => {
            debug!(
                "{program} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            format!("{program} failed")
        }
    }
}

pub async fn collect_diagnostics<B: DiffusionBackend>(worker: &Worker<B>) -> Diagnostics {
    let settings = worker.settings();
    let adapter_path = &settings.storage.style_adapter_path;
    let lora_size_mb = file_size_mb(adapter_path);

    let backend_version = worker
        .backend()
        .version()
        .await
        .unwrap_or_else(|err| {
            debug!("Backend version query failed: {err}");
            "unknown".to_string()
        });

    let network_volume = if settings.network_volume_path.is_dir() {
        "MOUNTED"
    } else {
        "NOT MOUNTED"
    };

    Diagnostics {
        lora_exists: lora_size_mb.is_some(),
        lora_size_mb,
        lora_path: adapter_path.display().to_string(),
        pipeline_loaded: worker.is_loaded(),
        network_volume: network_volume.to_string(),
        worker_version: env!("CARGO_PKG_VERSION").to_string(),
        backend_version,
        model_id: settings.model_id.clone(),
        gpu: run_gpu_query(GPU_QUERY_PROGRAM, &GPU_QUERY_ARGS, settings.gpu_query_timeout).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_query_output_is_trimmed() {
        let gpu = run_gpu_query("echo", &["  NVIDIA A40, 46068 MiB, 1 MiB  "], Duration::from_secs(5)).await;
        assert_eq!(gpu, "NVIDIA A40, 46068 MiB, 1 MiB");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_as_failed() {
        let gpu = run_gpu_query("sh", &["-c", "exit 3"], Duration::from_secs(5)).await;
        assert_eq!(gpu, "sh failed");
    }

    #[tokio::test]
    async fn missing_tool_yields_error_text() {
        let gpu = run_gpu_query("definitely-not-a-gpu-tool", &[], Duration::from_secs(5)).await;
        assert!(!gpu.is_empty());
        assert!(!gpu.ends_with(" failed"));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let gpu = run_gpu_query("sleep", &["5"], Duration::from_millis(100)).await;
        assert!(gpu.contains("timed out"));
    }
}
