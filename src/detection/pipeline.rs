use crate::{
    detection::{DetectionResult, NamedImage},
    image::{ImageLoader, ImageUpload},
    models::ObjectDetector,
    utils::error::DetectError,
    Result,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Runs decoded images through a detector and logs the batch timing.
pub struct DetectionPipeline;

impl DetectionPipeline {
    /// Decode uploads and run them through `detector` off the async runtime.
    ///
    /// Results come back in upload order, one per upload.
    pub async fn process_uploads(
        detector: Arc<dyn ObjectDetector>,
        uploads: Vec<ImageUpload>,
        conf_threshold: f32,
        max_image_size: usize,
    ) -> Result<Vec<DetectionResult>> {
        tokio::task::spawn_blocking(move || {
            let images = Self::decode_uploads(uploads, max_image_size)?;
            Self::run(detector.as_ref(), &images, conf_threshold)
        })
        .await
        .map_err(|e| DetectError::Internal(format!("Detection task panicked: {}", e)))?
    }

    pub fn decode_uploads(uploads: Vec<ImageUpload>, max_image_size: usize) -> Result<Vec<NamedImage>> {
        uploads
            .into_iter()
            .map(|upload| {
                let image = ImageLoader::from_bytes(&upload.data, max_image_size)?;
                tracing::debug!(
                    "Decoded '{}' ({}x{}, {} bytes)",
                    upload.name,
                    image.width(),
                    image.height(),
                    upload.data.len()
                );
                Ok(NamedImage::new(upload.name, image))
            })
            .collect()
    }

    /// Detect on image files, recording each source path in the result.
    pub fn process_paths(
        detector: &dyn ObjectDetector,
        paths: &[impl AsRef<Path>],
        conf_threshold: f32,
    ) -> Result<Vec<DetectionResult>> {
        let images = paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                let image = ImageLoader::from_path(path)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                Ok(NamedImage {
                    name,
                    path: Some(path.display().to_string()),
                    image,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::run(detector, &images, conf_threshold)
    }

    fn run(
        detector: &dyn ObjectDetector,
        images: &[NamedImage],
        conf_threshold: f32,
    ) -> Result<Vec<DetectionResult>> {
        let tic = Instant::now();
        let results = detector.detect(images, conf_threshold)?;

        tracing::info!(
            "Detection completed: model={}, images={}, boxes={}, conf={}, time={:.3}s",
            detector.name(),
            images.len(),
            results.iter().map(|r| r.boxes.len()).sum::<usize>(),
            conf_threshold,
            tic.elapsed().as_secs_f32()
        );

        Ok(results)
    }
}
