use crate::utils::error::DetectError;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;

/// Name under which the mandatory model is served (`/detect`, `/classes`).
pub const DEFAULT_MODEL: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind_addr: String,

    /// Models to serve; the first entry is always [`DEFAULT_MODEL`]
    pub models: Vec<ModelSpec>,

    /// Execution device for every session
    pub device: Device,

    /// Threshold used when a request carries no `conf` parameter
    pub default_confidence: f32,

    /// Upper bound on images per request
    pub max_images: usize,

    /// Longer request timeout for local debugging
    pub dev_mode: bool,

    /// ONNX Runtime session settings
    pub onnx_config: OnnxConfig,

    /// HTTP limits
    pub server_config: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Intra-op threads per session
    pub intra_threads: usize,

    /// Graph optimization level, 0 to 3
    pub optimization_level: u8,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            intra_threads: (num_cpus::get() * 3 / 4).max(1),
            optimization_level: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Request timeout in seconds
    pub request_timeout: u64,

    /// Largest accepted image, in bytes
    pub max_image_size: usize,

    /// Largest accepted request body, in bytes
    pub max_request_size: usize,

    /// Concurrent requests admitted per detection endpoint
    pub detect_max_concurrent: usize,

    /// Concurrent requests admitted per metadata endpoint
    pub meta_max_concurrent: usize,

    /// Finished async tasks kept for polling
    pub max_retained_tasks: usize,
}

/// A checkpoint to serve, written on the command line as `NAME=PATH`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            model_path: model_path.into(),
            labels_path: None,
        }
    }

    pub fn with_labels(mut self, labels_path: Option<PathBuf>) -> Self {
        self.labels_path = labels_path;
        self
    }

    /// Label file next to the model unless one was given explicitly.
    pub fn labels_path(&self) -> PathBuf {
        self.labels_path
            .clone()
            .unwrap_or_else(|| self.model_path.with_extension("labels.json"))
    }
}

impl FromStr for ModelSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, path) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=PATH, got '{}'", s))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid model name '{}'", name));
        }
        if path.trim().is_empty() {
            return Err(format!("missing model path for '{}'", name));
        }
        Ok(ModelSpec::new(name, path.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Device {
    Cpu,
    Cuda,
    Auto,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Auto => "auto",
        }
    }
}

impl Config {
    pub fn new(
        bind_addr: String,
        models: Vec<ModelSpec>,
        device: Device,
        default_confidence: f32,
        max_images: usize,
        detect_max_concurrent: usize,
        dev_mode: bool,
    ) -> Result<Self> {
        let onnx_config = OnnxConfig::default();

        let max_image_size = 5_000_000;
        let server_config = ServerConfig {
            request_timeout: if dev_mode { 300 } else { 60 },
            max_image_size,
            // room for multipart framing on top of the images themselves
            max_request_size: max_image_size * max_images.max(1) + 64 * 1024,
            detect_max_concurrent,
            meta_max_concurrent: 1000,
            max_retained_tasks: 1000,
        };

        let config = Self {
            bind_addr,
            models,
            device,
            default_confidence,
            max_images,
            dev_mode,
            onnx_config,
            server_config,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_confidence) {
            return Err(DetectError::Config(format!(
                "default detection confidence {} must be between 0.0 and 1.0",
                self.default_confidence
            )));
        }
        if self.max_images == 0 {
            return Err(DetectError::Config(
                "max images accepted must be at least 1".to_string(),
            ));
        }
        if self.server_config.detect_max_concurrent == 0 {
            return Err(DetectError::Config(
                "max concurrent requests must be at least 1".to_string(),
            ));
        }
        match self.models.first() {
            Some(spec) if spec.name == DEFAULT_MODEL => {}
            _ => {
                return Err(DetectError::Config(format!(
                    "the '{}' model must be configured first",
                    DEFAULT_MODEL
                )))
            }
        }
        for (i, spec) in self.models.iter().enumerate() {
            if self.models[..i].iter().any(|other| other.name == spec.name) {
                return Err(DetectError::Config(format!(
                    "model '{}' configured more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Spec of the model behind `/detect`.
    pub fn default_model(&self) -> &ModelSpec {
        &self.models[0]
    }
}
