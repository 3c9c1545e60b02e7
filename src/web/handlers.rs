use crate::{
    config::DEFAULT_MODEL,
    detection::{DetectionPipeline, DetectionResult},
    tasks::TaskRecord,
    utils::error::DetectError,
    web::{
        extractors::{resolve_confidence, DetectQuery, UploadForm},
        state::AppState,
    },
    Result,
};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::QueryRejection,
        Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// `POST /detect`
pub async fn detect_handler(
    state: State<AppState>,
    query: std::result::Result<Query<DetectQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Vec<DetectionResult>>> {
    detect_with_model(state, DEFAULT_MODEL.to_string(), query, multipart).await
}

/// `POST /detect_<model>`
pub async fn detect_with_model(
    State(state): State<AppState>,
    model: String,
    query: std::result::Result<Query<DetectQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Vec<DetectionResult>>> {
    let start_time = Instant::now();
    let request_id = Uuid::new_v4();
    let detector = state.registry.get(&model)?;
    let Query(query) = query?;
    let mut multipart = multipart?;

    let form = UploadForm::read(
        &mut multipart,
        state.config.max_images,
        state.config.server_config.max_image_size,
    )
    .await?;
    let conf = resolve_confidence(
        query.raw_confidence().or(form.conf.as_deref()),
        state.config.default_confidence,
    )?;

    tracing::info!(
        "Processing detect request: request_id={}, model={}, images={}, conf={}",
        request_id,
        model,
        form.uploads.len(),
        conf
    );

    let results = DetectionPipeline::process_uploads(
        detector,
        form.uploads,
        conf,
        state.config.server_config.max_image_size,
    )
    .await
    .map_err(|e| {
        tracing::error!("Error performing detection on the images: {}", e);
        e
    })?;

    tracing::info!(
        "Detect completed: request_id={}, images={}, time={:.3}s",
        request_id,
        results.len(),
        start_time.elapsed().as_secs_f32()
    );

    Ok(Json(results))
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: Uuid,
    pub status: String,
}

/// `POST /detect_async`: validate now, detect in the background.
pub async fn detect_async_handler(
    State(state): State<AppState>,
    query: std::result::Result<Query<DetectQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<TaskAccepted>)> {
    let permit = state.async_gate.try_acquire()?;
    let detector = state.registry.default_detector()?;
    let Query(query) = query?;
    let mut multipart = multipart?;

    let form = UploadForm::read(
        &mut multipart,
        state.config.max_images,
        state.config.server_config.max_image_size,
    )
    .await?;
    let conf = resolve_confidence(
        query.raw_confidence().or(form.conf.as_deref()),
        state.config.default_confidence,
    )?;

    let task = state.tasks.create("/detect_async");
    let task_id = task.task_id;
    tracing::info!("Started task {} with {} image(s)", task_id, form.uploads.len());

    let tasks = state.tasks.clone();
    let max_image_size = state.config.server_config.max_image_size;
    tokio::spawn(async move {
        let _permit = permit;
        tasks.update_status(task_id, "running - batching and inferencing");

        let tic = Instant::now();
        match DetectionPipeline::process_uploads(detector, form.uploads, conf, max_image_size).await {
            Ok(results) => match serde_json::to_value(&results) {
                Ok(value) => {
                    tracing::info!(
                        "Completed task {}: inference duration {:.3}s",
                        task_id,
                        tic.elapsed().as_secs_f32()
                    );
                    tasks.complete(task_id, value);
                }
                Err(e) => {
                    tracing::error!("Failed to serialize results of task {}: {}", task_id, e);
                    tasks.fail(task_id, &format!("Task failed - {}", e));
                }
            },
            Err(e) => {
                let message = format!("Error performing detection on the images: {}", e);
                tracing::error!("Task {}: {}", task_id, message);
                tasks.fail(task_id, &format!("Task failed - {}", message));
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: task.status,
        }),
    ))
}

/// `GET /task/:task_id`
pub async fn task_status_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>> {
    let id = Uuid::parse_str(&task_id).map_err(|_| DetectError::TaskNotFound(task_id.clone()))?;
    state
        .tasks
        .get(id)
        .map(Json)
        .ok_or(DetectError::TaskNotFound(task_id))
}

/// `GET /classes`
pub async fn classes_handler(State(state): State<AppState>) -> Result<Json<BTreeMap<i64, String>>> {
    class_map_of(&state, DEFAULT_MODEL)
}

/// `GET /classes/:model`
pub async fn model_classes_handler(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<BTreeMap<i64, String>>> {
    class_map_of(&state, &model)
}

fn class_map_of(state: &AppState, model: &str) -> Result<Json<BTreeMap<i64, String>>> {
    let detector = state.registry.get(model)?;
    Ok(Json(crate::models::checkpoint::class_map(detector.label_names())))
}

/// `GET /linc_test`
pub async fn linc_test_handler() -> &'static str {
    "Hello World!"
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.registry.health_check()?;
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// `GET /api/info`
pub async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.registry.get_stats(&state.config);
    let endpoints: Vec<String> = state
        .registry
        .names()
        .map(|name| {
            if name == DEFAULT_MODEL {
                "/detect".to_string()
            } else {
                format!("/detect_{}", name)
            }
        })
        .collect();

    Json(json!({
        "service": "LINC detection service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "models": stats,
        "detect_endpoints": endpoints,
        "limits": {
            "max_images": state.config.max_images,
            "max_image_bytes": state.config.server_config.max_image_size,
            "max_concurrent_requests": state.config.server_config.detect_max_concurrent,
            "default_confidence": state.config.default_confidence,
        },
        "tasks_tracked": state.tasks.len(),
    }))
}
