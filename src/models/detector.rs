use crate::config::{Device, OnnxConfig};
use crate::detection::{Detection, DetectionResult, NamedImage};
use crate::image::ImageLoader;
use crate::models::checkpoint::{self, Checkpoint};
use crate::utils::error::DetectError;
use crate::Result;
use ndarray::{ArrayView2, ArrayViewD, Ix2};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch},
    inputs,
    session::{builder::GraphOptimizationLevel, Session, SessionOutputs},
    value::{DynValue, Tensor},
};
use parking_lot::Mutex;
use std::time::Instant;

/// Anything that turns images into per-image detections.
///
/// Implementations are blocking; async callers go through
/// [`crate::detection::DetectionPipeline`].
pub trait ObjectDetector: Send + Sync {
    /// Registry name, e.g. `default` or `lion`.
    fn name(&self) -> &str;

    /// Ordered label names; class `i` is `label_names()[i - 1]`.
    fn label_names(&self) -> &[String];

    fn detect(&self, images: &[NamedImage], conf_threshold: f32) -> Result<Vec<DetectionResult>>;
}

#[derive(Debug, Clone)]
struct OutputNames {
    boxes: String,
    labels: String,
    scores: String,
}

/// Faster R-CNN exported to ONNX, wrapped for per-image inference.
pub struct LincDetector {
    name: String,
    checkpoint: Checkpoint,
    session: Mutex<Session>,
    input_name: String,
    outputs: OutputNames,
}

impl LincDetector {
    pub fn new(
        name: impl Into<String>,
        checkpoint: Checkpoint,
        device: Device,
        onnx_config: &OnnxConfig,
    ) -> Result<Self> {
        let name = name.into();
        tracing::info!(
            "Loading detection model '{}' from: {} (device={})",
            name,
            checkpoint.model_path.display(),
            device.as_str()
        );

        let session = Session::builder()?
            .with_execution_providers(execution_providers(device))?
            .with_optimization_level(optimization_level(onnx_config.optimization_level))?
            .with_intra_threads(onnx_config.intra_threads)?
            .commit_from_file(&checkpoint.model_path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| DetectError::ModelLoad("Detection model has no inputs".to_string()))?;

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        for (i, output) in output_names.iter().enumerate() {
            tracing::debug!("Detection output[{}]: '{}'", i, output);
        }
        let outputs = resolve_output_names(&output_names)?;

        tracing::info!(
            "Model '{}' ready: input='{}', outputs=({}, {}, {}), classes={}",
            name,
            input_name,
            outputs.boxes,
            outputs.labels,
            outputs.scores,
            checkpoint.num_classes()
        );

        Ok(Self {
            name,
            checkpoint,
            session: Mutex::new(session),
            input_name,
            outputs,
        })
    }

    fn detect_one(&self, image: &NamedImage, conf_threshold: f32) -> Result<DetectionResult> {
        let tensor = Tensor::from_array(ImageLoader::to_tensor(&image.image))?;

        let tic = Instant::now();
        let (boxes, labels, scores) = {
            let mut session = self.session.lock();
            let outputs = session.run(inputs![self.input_name.as_str() => tensor])?;

            let boxes = output(&outputs, &self.outputs.boxes)?
                .try_extract_array::<f32>()?
                .into_owned();
            let labels: Vec<i64> = output(&outputs, &self.outputs.labels)?
                .try_extract_array::<i64>()?
                .iter()
                .copied()
                .collect();
            let scores: Vec<f32> = output(&outputs, &self.outputs.scores)?
                .try_extract_array::<f32>()?
                .iter()
                .copied()
                .collect();
            (boxes, labels, scores)
        };
        tracing::debug!(
            "Ran '{}' through model '{}' in {:.3}s",
            image.name,
            self.name,
            tic.elapsed().as_secs_f32()
        );

        let boxes = as_box_matrix(boxes.view())?;
        let detections = filter_detections(
            boxes,
            &labels,
            &scores,
            conf_threshold,
            &self.checkpoint.label_names,
        )?;

        let mut result = DetectionResult::new(image.name.clone(), detections);
        result.path = image.path.clone();
        Ok(result)
    }
}

impl ObjectDetector for LincDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn label_names(&self) -> &[String] {
        &self.checkpoint.label_names
    }

    fn detect(&self, images: &[NamedImage], conf_threshold: f32) -> Result<Vec<DetectionResult>> {
        images
            .iter()
            .map(|image| self.detect_one(image, conf_threshold))
            .collect()
    }
}

fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
        // CUDA registration failure falls through to CPU
        Device::Auto => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
    }
}

fn optimization_level(level: u8) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

/// torchvision exports name their outputs `boxes`, `labels`, `scores`; other
/// exports are read positionally in that order.
fn resolve_output_names(names: &[String]) -> Result<OutputNames> {
    let by_name = |wanted: &str| names.iter().find(|n| n.as_str() == wanted).cloned();

    if let (Some(boxes), Some(labels), Some(scores)) =
        (by_name("boxes"), by_name("labels"), by_name("scores"))
    {
        return Ok(OutputNames { boxes, labels, scores });
    }

    match names {
        [boxes, labels, scores, ..] => Ok(OutputNames {
            boxes: boxes.clone(),
            labels: labels.clone(),
            scores: scores.clone(),
        }),
        _ => Err(DetectError::ModelLoad(format!(
            "Detection model must expose boxes, labels and scores outputs, found {:?}",
            names
        ))),
    }
}

fn output<'a>(outputs: &'a SessionOutputs<'_>, name: &str) -> Result<&'a DynValue> {
    outputs.get(name).ok_or_else(|| {
        let available: Vec<String> = outputs.keys().map(|s| s.to_string()).collect();
        DetectError::Inference(format!(
            "Output '{}' not found. Available outputs: {:?}",
            name, available
        ))
    })
}

fn as_box_matrix(boxes: ArrayViewD<'_, f32>) -> Result<ArrayView2<'_, f32>> {
    let shape = boxes.shape().to_vec();
    boxes
        .into_dimensionality::<Ix2>()
        .map_err(|_| DetectError::Inference(format!("Unexpected boxes shape: {:?}", shape)))
}

/// Keep detections whose score is strictly above `threshold`, in model order.
pub fn filter_detections(
    boxes: ArrayView2<'_, f32>,
    labels: &[i64],
    scores: &[f32],
    threshold: f32,
    label_names: &[String],
) -> Result<Vec<Detection>> {
    if boxes.ncols() != 4 && boxes.nrows() > 0 {
        return Err(DetectError::Inference(format!(
            "Boxes must have 4 coordinates, got {}",
            boxes.ncols()
        )));
    }
    if boxes.nrows() != scores.len() || labels.len() != scores.len() {
        return Err(DetectError::Inference(format!(
            "Mismatched detector outputs: {} boxes, {} labels, {} scores",
            boxes.nrows(),
            labels.len(),
            scores.len()
        )));
    }

    let detections = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > threshold)
        .map(|(i, &score)| {
            let row = boxes.row(i);
            Detection {
                conf: score,
                class_id: labels[i],
                roi: [row[0], row[1], row[2], row[3]],
                label: checkpoint::label_name(label_names, labels[i]).map(str::to_string),
            }
        })
        .collect();

    Ok(detections)
}
