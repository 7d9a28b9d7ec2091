use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

pub const TIMING_TARGET: &str = "worker.timing";

#[derive(Debug)]
pub struct JobTimer {
    job_id: String,
    kind: String,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl JobTimer {
    pub fn new(job_id: Option<&str>, kind: &str) -> Self {
        JobTimer {
            job_id: job_id.unwrap_or("local").to_string(),
            kind: kind.to_string(),
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            completed: false,
        }
    }

    pub fn log_received(&self) {
        info!(
            target: TIMING_TARGET,
            "event=job_received job_id={} kind={} received_at={}",
            self.job_id,
            self.kind,
            self.started_at.to_rfc3339()
        );
    }

    pub fn mark_status(&mut self, status: &str, detail: Option<String>) {
        self.status = status.to_string();
        self.detail = detail;
    }

    pub fn log_completed(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=job_completed job_id={} kind={} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.job_id,
            self.kind,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        self.log_completed();
    }
}

pub fn start_job_timer(job_id: Option<&str>, kind: &str) -> JobTimer {
    let timer = JobTimer::new(job_id, kind);
    timer.log_received();
    timer
}

pub fn complete_job_timer(timer: &mut JobTimer, status: &str, detail: Option<String>) {
    timer.mark_status(status, detail);
    timer.log_completed();
}

/// Runs a backend call between `pipeline_request`/`pipeline_response` timing
/// events and hands back its result with the elapsed wall-clock seconds.
pub async fn log_pipeline_timing<T, E, F, Fut>(
    backend: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> (Result<T, E>, f64)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=pipeline_request backend={} operation={} started_at={} metadata={}",
        backend,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=pipeline_response backend={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        backend,
        operation,
        Utc::now().to_rfc3339(),
        duration,
        status,
        metadata_text
    );

    (result, duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipeline_timing_returns_result_and_duration() {
        let (result, duration) = log_pipeline_timing("fake", "generate", None, || async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<_, String>(5)
        })
        .await;
        assert_eq!(result, Ok(5));
        assert!(duration >= 0.02);
    }

    #[test]
    fn completed_timer_logs_once() {
        let mut timer = JobTimer::new(None, "generate");
        complete_job_timer(&mut timer, "error", Some("boom".to_string()));
        assert!(timer.completed);
        assert_eq!(timer.status, "error");
        timer.log_completed();
    }
}
