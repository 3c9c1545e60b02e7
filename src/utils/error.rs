use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Detection inference failed: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Detection confidence {0} is invalid. Needs to be between 0.0 and 1.0.")]
    InvalidConfidence(String),

    #[error("Too many images. Maximum number of images that can be processed in one call is {max}.")]
    TooManyImages { count: usize, max: usize },

    #[error("File too large: {0} bytes, max allowed: {1} bytes")]
    FileTooLarge(usize, usize),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Service busy: {0}")]
    Busy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl DetectError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DetectError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DetectError::InvalidConfidence(_) => StatusCode::BAD_REQUEST,
            DetectError::ImageDecode(_) => StatusCode::BAD_REQUEST,
            DetectError::TooManyImages { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DetectError::FileTooLarge(_, _) => StatusCode::PAYLOAD_TOO_LARGE,
            DetectError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DetectError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DetectError::UnknownModel(_) => StatusCode::NOT_FOUND,
            DetectError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            DetectError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DetectError::ModelLoad(_) => "MODEL_LOAD_ERROR",
            DetectError::Inference(_) => "INFERENCE_ERROR",
            DetectError::InvalidInput(_) => "INVALID_INPUT",
            DetectError::InvalidConfidence(_) => "INVALID_CONFIDENCE",
            DetectError::TooManyImages { .. } => "TOO_MANY_IMAGES",
            DetectError::FileTooLarge(_, _) => "FILE_TOO_LARGE",
            DetectError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            DetectError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            DetectError::UnknownModel(_) => "UNKNOWN_MODEL",
            DetectError::TaskNotFound(_) => "TASK_NOT_FOUND",
            DetectError::Busy(_) => "SERVICE_BUSY",
            DetectError::Config(_) => "CONFIG_ERROR",
            DetectError::Io(_) => "IO_ERROR",
            DetectError::Json(_) => "JSON_ERROR",
            DetectError::ImageDecode(_) => "IMAGE_DECODE_ERROR",
            DetectError::Ort(_) => "ORT_ERROR",
            DetectError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<MultipartRejection> for DetectError {
    fn from(rejection: MultipartRejection) -> Self {
        DetectError::InvalidInput(format!("Expected a multipart/form-data body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for DetectError {
    fn from(rejection: QueryRejection) -> Self {
        DetectError::InvalidInput(format!("Malformed query string: {}", rejection.body_text()))
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        });

        if status.is_server_error() {
            tracing::error!("Request failed: {} ({})", self, status);
        } else {
            tracing::warn!("Request rejected: {} ({})", self, status);
        }

        (status, axum::Json(error_response)).into_response()
    }
}
