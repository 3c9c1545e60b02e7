use crate::config::ModelSpec;
use crate::utils::error::DetectError;
use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Trained network plus the ordered label names it was trained on.
///
/// Label `i` of the network output refers to `label_names[i - 1]`; index 0
/// is the background class and never has a name.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model_path: PathBuf,
    pub label_names: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelFile {
    Bare(Vec<String>),
    Wrapped { label_names: Vec<String> },
}

impl Checkpoint {
    pub fn load(spec: &ModelSpec) -> Result<Self> {
        Self::from_paths(&spec.model_path, &spec.labels_path())
    }

    pub fn from_paths(model_path: &Path, labels_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(DetectError::ModelLoad(format!(
                "Detection model not found: {}",
                model_path.display()
            )));
        }

        let raw = std::fs::read_to_string(labels_path).map_err(|e| {
            DetectError::ModelLoad(format!(
                "Cannot read label names from {}: {}",
                labels_path.display(),
                e
            ))
        })?;
        let label_names = Self::parse_labels(&raw)?;

        tracing::info!(
            "Checkpoint {} has {} labels: {:?}",
            model_path.display(),
            label_names.len(),
            label_names
        );

        Ok(Self {
            model_path: model_path.to_path_buf(),
            label_names,
        })
    }

    pub fn parse_labels(raw: &str) -> Result<Vec<String>> {
        let label_names = match serde_json::from_str::<LabelFile>(raw) {
            Ok(LabelFile::Bare(names)) | Ok(LabelFile::Wrapped { label_names: names }) => names,
            Err(e) => {
                return Err(DetectError::ModelLoad(format!(
                    "Label file must be a JSON array of names or {{\"label_names\": [...]}}: {}",
                    e
                )))
            }
        };

        if label_names.is_empty() {
            return Err(DetectError::ModelLoad(
                "Checkpoint has no label names".to_string(),
            ));
        }
        Ok(label_names)
    }

    /// Output classes of the network, background included.
    pub fn num_classes(&self) -> usize {
        self.label_names.len() + 1
    }

    pub fn label_name(&self, class_id: i64) -> Option<&str> {
        label_name(&self.label_names, class_id)
    }

    /// `{"1": "cv-front", "2": "cv-dl", ...}` as served by `/classes`.
    pub fn class_map(&self) -> BTreeMap<i64, String> {
        class_map(&self.label_names)
    }
}

pub fn label_name(label_names: &[String], class_id: i64) -> Option<&str> {
    if class_id < 1 {
        return None;
    }
    label_names.get(class_id as usize - 1).map(String::as_str)
}

pub fn class_map(label_names: &[String]) -> BTreeMap<i64, String> {
    label_names
        .iter()
        .enumerate()
        .map(|(i, name)| (i as i64 + 1, name.clone()))
        .collect()
}
