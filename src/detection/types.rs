use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// A decoded image ready for inference.
#[derive(Debug, Clone)]
pub struct NamedImage {
    pub name: String,
    /// Filesystem source, absent for uploads
    pub path: Option<String>,
    pub image: DynamicImage,
}

impl NamedImage {
    pub fn new(name: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            name: name.into(),
            path: None,
            image,
        }
    }
}

/// A single box reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Score in 0.0..=1.0
    pub conf: f32,

    /// Index into the checkpoint's label list; 0 is background
    #[serde(rename = "class")]
    pub class_id: i64,

    /// `[x1, y1, x2, y2]` in source-image pixels
    #[serde(rename = "ROI")]
    pub roi: [f32; 4],

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Detections for one input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub boxes: Vec<Detection>,

    /// Only set when the image was read from a real filesystem path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub name: String,
}

impl DetectionResult {
    pub fn new(name: impl Into<String>, boxes: Vec<Detection>) -> Self {
        Self {
            boxes,
            path: None,
            name: name.into(),
        }
    }
}
