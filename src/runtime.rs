use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::job::{Job, JobOutput};
use crate::pipeline::DiffusionBackend;
use crate::utils::http::get_http_client;
use crate::worker::Worker;

const ID_PLACEHOLDER: &str = "$ID";
pub const DEFAULT_TEST_INPUT_FILE: &str = "test_input.json";

/// Job-queue webhooks handed to the worker by the serverless host.
#[derive(Debug, Clone)]
pub struct JobEndpoints {
    pub get_job_url: String,
    pub post_output_url: String,
    pub api_key: String,
    pub pod_id: String,
    pub poll_interval: Duration,
}

impl JobEndpoints {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.runpod_webhook_get_job.trim().is_empty() {
            return Err(anyhow!(
                "RUNPOD_WEBHOOK_GET_JOB is required to serve jobs (use `test-input` to run locally)"
            ));
        }
        if config.runpod_webhook_post_output.trim().is_empty() {
            return Err(anyhow!("RUNPOD_WEBHOOK_POST_OUTPUT is required to serve jobs"));
        }
        Ok(JobEndpoints {
            get_job_url: config.runpod_webhook_get_job.trim().to_string(),
            post_output_url: config.runpod_webhook_post_output.trim().to_string(),
            api_key: config.runpod_api_key.clone(),
            pod_id: config.runpod_pod_id.clone(),
            poll_interval: Duration::from_millis(config.job_poll_interval_ms),
        })
    }

    fn job_url(&self) -> String {
        self.get_job_url.replace(ID_PLACEHOLDER, &self.pod_id)
    }

    fn output_url(&self, job_id: &str) -> String {
        self.post_output_url.replace(ID_PLACEHOLDER, job_id)
    }
}

/// Takes the next job, or `None` when the queue is idle.
pub async fn fetch_job(endpoints: &JobEndpoints) -> Result<Option<Job>> {
    let response = get_http_client()
        .get(endpoints.job_url())
        .header("Authorization", &endpoints.api_key)
        .send()
        .await
        .context("job request failed")?;

    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("job request returned {status}: {}", body.trim()));
    }

    let body = response.text().await.context("job body unreadable")?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    let job: Job = serde_json::from_str(&body).context("job body is not a job")?;
    if job.id.is_none() {
        return Err(anyhow!("job without an id: {}", body.trim()));
    }
    Ok(Some(job))
}

pub async fn post_output(endpoints: &JobEndpoints, job_id: &str, output: &JobOutput) -> Result<()> {
    let response = get_http_client()
        .post(endpoints.output_url(job_id))
        .header("Authorization", &endpoints.api_key)
        .json(&json!({ "output": output }))
        .send()
        .await
        .with_context(|| format!("posting output for job {job_id} failed"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "posting output for job {job_id} returned {status}: {}",
            body.trim()
        ));
    }
    Ok(())
}

async fn process_job<B: DiffusionBackend>(worker: &Arc<Worker<B>>, endpoints: &JobEndpoints, job: Job) {
    let job_id = job.id.clone().unwrap_or_default();
    info!("Job {job_id} received");
    let output = worker.handle(&job).await;
    info!("Job {job_id} finished: {}", output.status_label());
    if let Err(err) = post_output(endpoints, &job_id, &output).await {
        error!("{err:#}");
    }
}

/// Polls for jobs and handles them one at a time until `shutdown` resolves.
/// A job that has started always runs to completion and gets its output posted.
pub async fn run_job_loop<B, S>(worker: Arc<Worker<B>>, endpoints: JobEndpoints, shutdown: S) -> Result<()>
where
    B: DiffusionBackend,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!("Polling for jobs every {:?}", endpoints.poll_interval);

    loop {
        let next = tokio::select! {
            _ = &mut shutdown => break,
            next = fetch_job(&endpoints) => next,
        };

        match next {
            Ok(Some(job)) => {
                process_job(&worker, &endpoints, job).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => warn!("Job fetch failed: {err:#}"),
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(endpoints.poll_interval) => {}
        }
    }

    info!("Job loop stopped");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    File(PathBuf),
    Inline(String),
}

/// Accepts either a full job (`{"input": {...}}`) or a bare input mapping.
pub fn parse_local_job(raw: &str) -> Result<Job> {
    let value: Value = serde_json::from_str(raw).context("test input is not valid JSON")?;
    let is_envelope = value
        .as_object()
        .map(|map| map.contains_key("input"))
        .unwrap_or(false);
    if is_envelope {
        return serde_json::from_value(value).context("test input is not a job");
    }
    Ok(Job::from_input(value))
}

pub async fn run_local<B: DiffusionBackend>(worker: &Arc<Worker<B>>, input: LocalInput) -> Result<JobOutput> {
    let raw = match input {
        LocalInput::File(path) => fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
        LocalInput::Inline(text) => text,
    };
    let job = parse_local_job(&raw)?;
    Ok(worker.handle(&job).await)
}
