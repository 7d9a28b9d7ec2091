use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::pipeline::{DiffusionBackend, GenerationParams, LoadSpec, PipelineError};
use crate::utils::http::get_http_client;
use crate::utils::text::truncate_for_log;

const ERROR_BODY_LIMIT: usize = 800;

/// Drives an external diffusion inference server over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    base_url: String,
    load_timeout: Duration,
    generate_timeout: Duration,
}

/// Server-side id of a loaded pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePipeline {
    pub pipeline_id: String,
}

#[derive(Debug, Serialize)]
struct SchedulerPayload {
    kind: &'static str,
    shift: f32,
    use_beta_sigmas: bool,
}

#[derive(Debug, Serialize)]
struct StyleAdapterPayload {
    path: String,
    scale: f32,
}

#[derive(Debug, Serialize)]
struct LoadPayload {
    model_id: String,
    cache_dir: Option<String>,
    scheduler: SchedulerPayload,
    style_adapter: Option<StyleAdapterPayload>,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    pipeline_id: String,
}

#[derive(Debug, Serialize)]
struct GeneratePayload<'a> {
    pipeline_id: &'a str,
    prompt: &'a str,
    num_inference_steps: u32,
    guidance_scale: f32,
    width: u32,
    height: u32,
    seed: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    image_base64: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Pulls `error`/`detail`/`message` out of a JSON error body when there is one.
fn summarize_error_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "detail", "message"] {
            if let Some(message) = value.get(key).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    truncate_for_log(body.trim(), ERROR_BODY_LIMIT)
}

impl LoadPayload {
    fn from_spec(spec: &LoadSpec) -> Self {
        LoadPayload {
            model_id: spec.model_id.clone(),
            cache_dir: spec
                .cache_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
            scheduler: SchedulerPayload {
                kind: "flow_match_euler",
                shift: spec.scheduler.shift,
                use_beta_sigmas: spec.scheduler.use_beta_sigmas,
            },
            style_adapter: spec.style_adapter.as_ref().map(|adapter| StyleAdapterPayload {
                path: adapter.path.display().to_string(),
                scale: adapter.scale,
            }),
        }
    }
}

impl RemoteBackend {
    pub fn new(base_url: &str, load_timeout: Duration, generate_timeout: Duration) -> Self {
        RemoteBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            load_timeout,
            generate_timeout,
        }
    }

    async fn post_json<B, R>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
        wrap: fn(String) -> PipelineError,
    ) -> Result<R, PipelineError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = get_http_client()
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                PipelineError::Backend(format!(
                    "{url} unreachable: {err} (timeout={}, connect={})",
                    err.is_timeout(),
                    err.is_connect()
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(target: "pipeline.remote", status = %status, body = %truncate_for_log(&body, 4000));
            return Err(wrap(format!(
                "{path} returned {status}: {}",
                summarize_error_body(&body)
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| wrap(format!("{path} returned an unreadable body: {err}")))
    }
}

/// Decodes whatever image format the server chose.
pub fn decode_image(encoded: &str) -> Result<DynamicImage, PipelineError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| PipelineError::Inference(format!("image is not valid base64: {err}")))?;
    let format_hint = infer::get(&bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or("unknown");
    image::load_from_memory(&bytes).map_err(|err| {
        PipelineError::Inference(format!("cannot decode image ({format_hint}): {err}"))
    })
}

#[async_trait]
impl DiffusionBackend for RemoteBackend {
    type Handle = RemotePipeline;

    fn name(&self) -> &str {
        &self.base_url
    }

    async fn load(&self, spec: &LoadSpec) -> Result<RemotePipeline, PipelineError> {
        let payload = LoadPayload::from_spec(spec);
        let response: LoadResponse = self
            .post_json("/load", &payload, self.load_timeout, PipelineError::Load)
            .await?;
        Ok(RemotePipeline {
            pipeline_id: response.pipeline_id,
        })
    }

    async fn generate(
        &self,
        handle: &RemotePipeline,
        params: &GenerationParams,
    ) -> Result<DynamicImage, PipelineError> {
        let payload = GeneratePayload {
            pipeline_id: &handle.pipeline_id,
            prompt: &params.prompt,
            num_inference_steps: params.steps,
            guidance_scale: params.guidance_scale,
            width: params.width,
            height: params.height,
            seed: params.seed,
        };
        let response: GenerateResponse = self
            .post_json(
                "/generate",
                &payload,
                self.generate_timeout,
                PipelineError::Inference,
            )
            .await?;
        decode_image(&response.image_base64)
    }

    async fn version(&self) -> Result<String, PipelineError> {
        let url = format!("{}/version", self.base_url);
        let response = get_http_client()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|err| PipelineError::Backend(format!("{url} unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::Backend(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let body: VersionResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::Backend(format!("{url} returned bad JSON: {err}")))?;
        Ok(body.version)
    }
}
