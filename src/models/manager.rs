use crate::config::DEFAULT_MODEL;
use crate::models::{Checkpoint, LincDetector, ObjectDetector};
use crate::utils::error::DetectError;
use crate::{Config, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Loaded detectors keyed by endpoint name.
///
/// The `default` model backs `/detect`; every other entry `NAME` backs
/// `/detect_NAME`.
#[derive(Clone)]
pub struct ModelRegistry {
    detectors: BTreeMap<String, Arc<dyn ObjectDetector>>,
}

impl ModelRegistry {
    /// Load every configured checkpoint. Only the default model is mandatory.
    pub fn load(config: &Config) -> Result<Self> {
        tracing::info!("Initializing model registry...");

        let mut registry = Self::empty();
        for spec in &config.models {
            let loaded = Checkpoint::load(spec).and_then(|checkpoint| {
                LincDetector::new(&spec.name, checkpoint, config.device, &config.onnx_config)
            });

            match loaded {
                Ok(detector) => {
                    tracing::info!("Model '{}' loaded successfully", spec.name);
                    registry.insert(Arc::new(detector));
                }
                Err(e) if spec.name == DEFAULT_MODEL => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to load model '{}', endpoint disabled: {}", spec.name, e);
                }
            }
        }

        tracing::info!(
            "Model registry initialized with {} model(s): {:?}",
            registry.len(),
            registry.names().collect::<Vec<_>>()
        );
        Ok(registry)
    }

    pub fn empty() -> Self {
        Self {
            detectors: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, detector: Arc<dyn ObjectDetector>) {
        self.detectors.insert(detector.name().to_string(), detector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ObjectDetector>> {
        self.detectors
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| DetectError::UnknownModel(name.to_string()))
    }

    pub fn default_detector(&self) -> Result<Arc<dyn ObjectDetector>> {
        self.get(DEFAULT_MODEL)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.detectors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Fails when the default model is missing.
    pub fn health_check(&self) -> Result<()> {
        self.default_detector().map(|_| ()).map_err(|_| {
            DetectError::ModelLoad(format!("'{}' model is not loaded", DEFAULT_MODEL))
        })
    }

    pub fn get_stats(&self, config: &Config) -> ModelStats {
        ModelStats {
            models: self
                .detectors
                .values()
                .map(|d| ModelSummary {
                    name: d.name().to_string(),
                    num_labels: d.label_names().len(),
                })
                .collect(),
            device: config.device.as_str().to_string(),
            intra_threads: config.onnx_config.intra_threads,
            optimization_level: config.onnx_config.optimization_level,
        }
    }
}

/// Loaded models and session settings, reported by `/api/info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStats {
    pub models: Vec<ModelSummary>,
    pub device: String,
    pub intra_threads: usize,
    pub optimization_level: u8,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub num_labels: usize,
}
