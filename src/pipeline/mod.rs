//! The diffusion pipeline the worker drives.
//!
//! Sampling, scheduler math and adapter fusion all happen behind
//! [`DiffusionBackend`]; this crate only decides what to load and what to ask for.

use std::path::PathBuf;

use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

pub mod adapter;
pub mod remote;

pub use adapter::ensure_style_adapter;
pub use remote::RemoteBackend;

/// Tuned together with the style adapter; not request-overridable.
pub const INFERENCE_STEPS: u32 = 8;
pub const GUIDANCE_SCALE: f32 = 1.0;
pub const SCHEDULER_SHIFT: f32 = 7.0;
pub const SCHEDULER_USE_BETA_SIGMAS: bool = true;
pub const STYLE_ADAPTER_SCALE: f32 = 0.8;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Style adapter download failed: {0}")]
    Download(String),
    #[error("Pipeline load failed: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Diffusion backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOverride {
    pub shift: f32,
    pub use_beta_sigmas: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StyleAdapter {
    pub path: PathBuf,
    pub scale: f32,
}

/// Everything the backend needs to bring a pipeline up.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSpec {
    pub model_id: String,
    pub cache_dir: Option<PathBuf>,
    pub scheduler: SchedulerOverride,
    pub style_adapter: Option<StyleAdapter>,
}

impl LoadSpec {
    pub fn new(model_id: &str, cache_dir: Option<PathBuf>, adapter_path: Option<PathBuf>) -> Self {
        LoadSpec {
            model_id: model_id.to_string(),
            cache_dir,
            scheduler: SchedulerOverride {
                shift: SCHEDULER_SHIFT,
                use_beta_sigmas: SCHEDULER_USE_BETA_SIGMAS,
            },
            style_adapter: adapter_path.map(|path| StyleAdapter {
                path,
                scale: STYLE_ADAPTER_SCALE,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
}

impl GenerationParams {
    pub fn new(prompt: String, width: u32, height: u32, seed: i64) -> Self {
        GenerationParams {
            prompt,
            steps: INFERENCE_STEPS,
            guidance_scale: GUIDANCE_SCALE,
            width,
            height,
            seed,
        }
    }
}

#[async_trait]
pub trait DiffusionBackend: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn load(&self, spec: &LoadSpec) -> Result<Self::Handle, PipelineError>;

    async fn generate(
        &self,
        handle: &Self::Handle,
        params: &GenerationParams,
    ) -> Result<DynamicImage, PipelineError>;

    async fn version(&self) -> Result<String, PipelineError>;
}

#[cfg(test)]
pub mod fake {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;

    /// In-memory backend that paints a flat image and records what it was asked.
    #[derive(Default)]
    pub struct FakeBackend {
        pub loads: AtomicUsize,
        pub fail_loads: AtomicBool,
        pub fail_generate: AtomicBool,
        pub panic_generate: AtomicBool,
        pub load_delay_ms: u64,
        pub last_load: Mutex<Option<LoadSpec>>,
        pub last_params: Mutex<Option<GenerationParams>>,
    }

    pub struct FakeHandle;

    #[async_trait]
    impl DiffusionBackend for FakeBackend {
        type Handle = FakeHandle;

        fn name(&self) -> &str {
            "fake"
        }

        async fn load(&self, spec: &LoadSpec) -> Result<FakeHandle, PipelineError> {
            if self.load_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.load_delay_ms)).await;
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(PipelineError::Load("weights unavailable".to_string()));
            }
            *self.last_load.lock().unwrap() = Some(spec.clone());
            Ok(FakeHandle)
        }

        async fn generate(
            &self,
            _handle: &FakeHandle,
            params: &GenerationParams,
        ) -> Result<DynamicImage, PipelineError> {
            *self.last_params.lock().unwrap() = Some(params.clone());
            if self.panic_generate.load(Ordering::SeqCst) {
                panic!("CUDA out of memory");
            }
            if self.fail_generate.load(Ordering::SeqCst) {
                return Err(PipelineError::Inference("sampler diverged".to_string()));
            }
            let shade = (params.seed & 0xff) as u8;
            let image = RgbImage::from_pixel(params.width.min(16), params.height.min(16), Rgb([shade, 64, 128]));
            Ok(DynamicImage::ImageRgb8(image))
        }

        async fn version(&self) -> Result<String, PipelineError> {
            Ok("fake-1.0".to_string())
        }
    }
}
