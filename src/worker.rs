use std::any::Any;
use std::backtrace::Backtrace;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::config::{Config, StoragePaths};
use crate::diagnostics::collect_diagnostics;
use crate::job::{
    resolve_seed, wants_diagnostics, ErrorResult, GenerationRequest, GenerationResult, Job,
    JobOutput,
};
use crate::pipeline::adapter::AdapterStatus;
use crate::pipeline::{
    ensure_style_adapter, DiffusionBackend, GenerationParams, LoadSpec, PipelineError,
    INFERENCE_STEPS, SCHEDULER_SHIFT, STYLE_ADAPTER_SCALE,
};
use crate::prompt::build_prompt;
use crate::utils::timing::{complete_job_timer, log_pipeline_timing, start_job_timer};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    PipelineLoad(PipelineError),
    #[error("Invalid job input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Generation(PipelineError),
    #[error("PNG encoding failed: {0}")]
    Encode(String),
    #[error("Generation task panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::PipelineLoad(_) => "pipeline_load",
            WorkerError::InvalidInput(_) => "invalid_input",
            WorkerError::Generation(_) => "generation",
            WorkerError::Encode(_) => "encode",
            WorkerError::Panicked(_) => "panic",
        }
    }
}

/// A [`WorkerError`] together with the stack it was raised on.
#[derive(Debug)]
pub struct JobFailure {
    error: WorkerError,
    trace: String,
}

impl From<WorkerError> for JobFailure {
    fn from(error: WorkerError) -> Self {
        JobFailure {
            error,
            trace: Backtrace::force_capture().to_string(),
        }
    }
}

impl JobFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    fn from_join_error(err: JoinError, report: &PanicSlot) -> Self {
        let captured = report.lock().ok().and_then(|mut slot| slot.take());
        if !err.is_panic() {
            return WorkerError::Panicked(err.to_string()).into();
        }
        JobFailure {
            error: WorkerError::Panicked(panic_message(err.into_panic())),
            trace: captured.unwrap_or_else(|| "panic site was not captured".to_string()),
        }
    }

    pub fn into_error_result(self) -> ErrorResult {
        let error = self.error.to_string();
        let mut traceback = error.clone();
        let mut source = std::error::Error::source(&self.error);
        while let Some(cause) = source {
            traceback.push_str(&format!("\n\nCaused by:\n    {cause}"));
            source = cause.source();
        }
        traceback.push_str("\n\nStack backtrace:\n");
        traceback.push_str(&self.trace);
        ErrorResult {
            error,
            traceback,
            error_kind: self.error.kind().to_string(),
        }
    }
}

type PanicSlot = Arc<Mutex<Option<String>>>;

tokio::task_local! {
    static PANIC_SLOT: PanicSlot;
}

static PANIC_HOOK: Once = Once::new();

/// Chains onto the existing hook. Panics inside a generation task also leave
/// their location and stack in that task's [`PANIC_SLOT`].
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_SLOT.try_with(|slot| {
                let location = info
                    .location()
                    .map(|location| location.to_string())
                    .unwrap_or_else(|| "unknown location".to_string());
                let report = format!("panicked at {location}\n{}", Backtrace::force_capture());
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(report);
                }
            });
            previous(info);
        }));
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub model_id: String,
    pub style_adapter_url: String,
    pub style_adapter_required: bool,
    pub network_volume_path: PathBuf,
    pub storage: StoragePaths,
    pub gpu_query_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        WorkerSettings {
            model_id: config.model_id.clone(),
            style_adapter_url: config.style_adapter_url.clone(),
            style_adapter_required: config.style_adapter_required,
            network_volume_path: config.network_volume_path.clone(),
            storage: config.storage.clone(),
            gpu_query_timeout: Duration::from_secs(config.gpu_query_timeout_secs),
        }
    }
}

/// The job handler. Owns the backend and the lazily loaded pipeline handle;
/// the first generation request loads it, concurrent cold starts wait on the
/// same load, and a failed load leaves the worker unloaded so the next
/// request tries again.
pub struct Worker<B: DiffusionBackend> {
    backend: Arc<B>,
    settings: WorkerSettings,
    pipeline: OnceCell<Arc<B::Handle>>,
}

impl<B: DiffusionBackend> Worker<B> {
    pub fn new(backend: B, settings: WorkerSettings) -> Self {
        install_panic_hook();
        Worker {
            backend: Arc::new(backend),
            settings,
            pipeline: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.initialized()
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<B::Handle>, PipelineError> {
        self.pipeline
            .get_or_try_init(|| self.load_pipeline())
            .await
            .cloned()
    }

    async fn resolve_style_adapter(&self) -> Result<Option<PathBuf>, PipelineError> {
        let path = &self.settings.storage.style_adapter_path;
        match ensure_style_adapter(&self.settings.style_adapter_url, path).await {
            Ok(AdapterStatus::Downloaded { path, size_mb }) => {
                info!("  Style adapter downloaded ({size_mb}MB)");
                Ok(Some(path))
            }
            Ok(status) => Ok(Some(status.into_path())),
            Err(err) if self.settings.style_adapter_required => Err(err),
            Err(err) => {
                warn!("{err}. Running without style adapter");
                Ok(None)
            }
        }
    }

    async fn load_pipeline(&self) -> Result<Arc<B::Handle>, PipelineError> {
        let adapter_path = self.resolve_style_adapter().await?;
        let spec = LoadSpec::new(
            &self.settings.model_id,
            self.settings.storage.model_cache_dir.clone(),
            adapter_path,
        );

        info!("Loading {} pipeline via {}...", spec.model_id, self.backend.name());
        let metadata = json!({
            "model_id": spec.model_id,
            "style_adapter": spec.style_adapter.is_some(),
        });
        let (result, elapsed) = log_pipeline_timing(self.backend.name(), "load", Some(metadata), || {
            self.backend.load(&spec)
        })
        .await;
        let handle = result?;

        info!("  Scheduler: FlowMatchEuler, shift={SCHEDULER_SHIFT:.1}, beta sigmas");
        match &spec.style_adapter {
            Some(adapter) => info!(
                "  Style adapter {} fused at strength {STYLE_ADAPTER_SCALE}",
                adapter.path.display()
            ),
            None => warn!(
                "Style adapter not found at {}; pipeline runs without it",
                self.settings.storage.style_adapter_path.display()
            ),
        }
        info!("Pipeline fully loaded in {elapsed:.1}s");
        Ok(Arc::new(handle))
    }

    async fn generate(&self, input: Map<String, Value>) -> Result<GenerationResult, JobFailure> {
        let request = GenerationRequest::from_input(&input)
            .map_err(|err| WorkerError::InvalidInput(err.to_string()))?;
        let pipeline = self
            .ensure_loaded()
            .await
            .map_err(WorkerError::PipelineLoad)?;

        let prompt = build_prompt(
            &request.description,
            request.character.as_deref(),
            request.muscle_size.as_deref(),
        );
        let seed = resolve_seed(request.seed);
        info!("PROMPT: {prompt}");
        info!(
            "PARAMS: char={}, muscle={}, {}x{}, seed={seed}, steps={INFERENCE_STEPS}",
            request.character.as_deref().unwrap_or("-"),
            request.muscle_size.as_deref().unwrap_or("-"),
            request.width,
            request.height
        );

        let params = GenerationParams::new(prompt, request.width, request.height, seed);
        let metadata = json!({
            "width": params.width,
            "height": params.height,
            "seed": seed,
        });
        let (result, gen_time) =
            log_pipeline_timing(self.backend.name(), "generate", Some(metadata), || {
                self.backend.generate(&pipeline, &params)
            })
            .await;
        let image = result.map_err(WorkerError::Generation)?;
        let image_base64 = encode_png_base64(&image)?;

        info!(
            "Generated: {gen_time:.1}s, seed={seed}, char={}",
            request.character.as_deref().unwrap_or("-")
        );

        Ok(GenerationResult {
            image_base64,
            seed,
            prompt: params.prompt,
            gen_time,
        })
    }
}

impl<B: DiffusionBackend> Worker<B> {
    /// Routes one job. Never fails: generation errors and panics come back as
    /// an error payload.
    pub async fn handle(self: &Arc<Self>, job: &Job) -> JobOutput {
        let input = job.input_map();

        if wants_diagnostics(&input) {
            let mut timer = start_job_timer(job.id.as_deref(), "diagnostic");
            let diagnostics = collect_diagnostics(&**self).await;
            complete_job_timer(&mut timer, "success", None);
            return JobOutput::Diagnostics(diagnostics);
        }

        let mut timer = start_job_timer(job.id.as_deref(), "generate");
        let worker = Arc::clone(self);
        let report = PanicSlot::default();
        let task = PANIC_SLOT.scope(report.clone(), async move { worker.generate(input).await });
        let outcome = match tokio::spawn(task).await {
            Ok(result) => result,
            Err(err) => Err(JobFailure::from_join_error(err, &report)),
        };

        match outcome {
            Ok(result) => {
                complete_job_timer(&mut timer, "success", None);
                JobOutput::Generated(result)
            }
            Err(err) => {
                error!("Generation failed ({}): {}", err.kind(), err.error);
                complete_job_timer(&mut timer, "error", Some(err.kind().to_string()));
                JobOutput::Failed(err.into_error_result())
            }
        }
    }
}

pub fn encode_png_base64(image: &DynamicImage) -> Result<String, WorkerError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| WorkerError::Encode(err.to_string()))?;
    Ok(general_purpose::STANDARD.encode(buffer.into_inner()))
}
