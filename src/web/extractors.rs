use crate::image::{ImageLoader, ImageUpload};
use crate::utils::error::DetectError;
use crate::Result;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use serde::Deserialize;

/// Query string of the detection endpoints.
///
/// Values are kept as text so malformed numbers produce our own 400 body.
#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
    pub conf: Option<String>,
    /// Older clients send `confidence`
    pub confidence: Option<String>,
}

impl DetectQuery {
    pub fn raw_confidence(&self) -> Option<&str> {
        self.conf.as_deref().or(self.confidence.as_deref())
    }
}

/// Parse an optional confidence override, falling back to `default`.
pub fn resolve_confidence(raw: Option<&str>, default: f32) -> Result<f32> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(default);
    };

    let value: f32 = raw
        .parse()
        .map_err(|_| DetectError::InvalidConfidence(raw.to_string()))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(DetectError::InvalidConfidence(raw.to_string()));
    }
    Ok(value)
}

/// Images and form options read from a multipart body.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub uploads: Vec<ImageUpload>,
    pub conf: Option<String>,
}

impl UploadForm {
    /// Read every part of the body.
    ///
    /// Parts named `conf`/`confidence` without a file name set the threshold;
    /// every other part must be a JPEG or PNG image.
    pub async fn read(
        multipart: &mut Multipart,
        max_images: usize,
        max_image_size: usize,
    ) -> Result<Self> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| read_error("Failed to read multipart field", e))?
        {
            let field_name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);

            if file_name.is_none() && matches!(field_name.as_str(), "conf" | "confidence")
            {
                let value = field
                    .text()
                    .await
                    .map_err(|e| read_error(&format!("Failed to read field '{}'", field_name), e))?;
                form.conf = Some(value);
                continue;
            }

            if form.uploads.len() >= max_images {
                return Err(DetectError::TooManyImages {
                    count: form.uploads.len() + 1,
                    max: max_images,
                });
            }

            let format = ImageLoader::check_upload(
                file_name.as_deref(),
                Some(field_name.as_str()),
                content_type.as_deref(),
            )?;

            let data = field
                .bytes()
                .await
                .map_err(|e| read_error("Failed to read file data", e))?;
            if data.is_empty() {
                return Err(DetectError::InvalidInput(format!(
                    "Empty file in field '{}'",
                    field_name
                )));
            }
            if data.len() > max_image_size {
                return Err(DetectError::FileTooLarge(data.len(), max_image_size));
            }

            let name = file_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| field_name.clone());
            tracing::debug!("Received file '{}' ({:?}): {} bytes", name, format, data.len());

            form.uploads.push(ImageUpload { name, data });
        }

        if form.uploads.is_empty() {
            return Err(DetectError::InvalidInput(
                "No image files provided".to_string(),
            ));
        }

        Ok(form)
    }
}

/// A body cut short by the request size limit is a 413, anything else a 400.
fn read_error(context: &str, e: MultipartError) -> DetectError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        DetectError::PayloadTooLarge(format!("{}: {}", context, e.body_text()))
    } else {
        DetectError::InvalidInput(format!("{}: {}", context, e))
    }
}
