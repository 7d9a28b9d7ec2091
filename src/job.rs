use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_DESCRIPTION: &str = "standing, looking at viewer, smile";
pub const DEFAULT_WIDTH: u32 = 832;
pub const DEFAULT_HEIGHT: u32 = 1216;
pub const RANDOM_SEED: i64 = -1;

/// Envelope delivered by the serverless host.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

impl Job {
    pub fn from_input(input: Value) -> Self {
        Job {
            id: None,
            input: Some(input),
        }
    }

    /// The input mapping; anything other than an object counts as empty.
    pub fn input_map(&self) -> Map<String, Value> {
        match &self.input {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// Loose truthiness for the `diagnostic` flag.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

pub fn wants_diagnostics(input: &Map<String, Value>) -> bool {
    is_truthy(input.get("diagnostic"))
}

#[derive(Debug, Clone, Deserialize)]
struct RawGenerationRequest {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    character: Option<Value>,
    #[serde(default)]
    muscle_size: Option<Value>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    seed: Option<i64>,
}

/// A generation job with every default applied, except that `seed` may still
/// be [`RANDOM_SEED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub description: String,
    pub character: Option<String>,
    pub muscle_size: Option<String>,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
}

/// Catalog ids are only ever strings; any other value resolves to the default entry.
fn catalog_key(value: Option<Value>) -> Option<String> {
    value.as_ref().and_then(Value::as_str).map(str::to_string)
}

impl GenerationRequest {
    pub fn from_input(input: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let raw: RawGenerationRequest = serde_json::from_value(Value::Object(input.clone()))?;
        Ok(GenerationRequest {
            description: raw
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            character: catalog_key(raw.character),
            muscle_size: catalog_key(raw.muscle_size),
            width: raw.width.unwrap_or(DEFAULT_WIDTH),
            height: raw.height.unwrap_or(DEFAULT_HEIGHT),
            seed: raw.seed.unwrap_or(RANDOM_SEED),
        })
    }
}

/// `-1` draws a fresh 32-bit seed; anything else is used as given.
pub fn resolve_seed(seed: i64) -> i64 {
    if seed == RANDOM_SEED {
        i64::from(rand::random::<u32>())
    } else {
        seed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub image_base64: String,
    pub seed: i64,
    pub prompt: String,
    pub gen_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResult {
    pub error: String,
    pub traceback: String,
    pub error_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostics {
    pub lora_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lora_size_mb: Option<u64>,
    pub lora_path: String,
    pub pipeline_loaded: bool,
    pub network_volume: String,
    pub worker_version: String,
    pub backend_version: String,
    pub model_id: String,
    pub gpu: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JobOutput {
    Generated(GenerationResult),
    Failed(ErrorResult),
    Diagnostics(Diagnostics),
}

impl JobOutput {
    pub fn status_label(&self) -> &'static str {
        match self {
            JobOutput::Generated(_) => "success",
            JobOutput::Failed(_) => "error",
            JobOutput::Diagnostics(_) => "diagnostic",
        }
    }
}
