use crate::utils::error::DetectError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Logs method, path, status and latency of every request.
pub async fn request_logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let start_time = Instant::now();

    tracing::debug!("Request started: {} {} - User-Agent: {}", method, uri, user_agent);

    let response = next.run(req).await;

    tracing::info!(
        "Request completed: {} {} - {} - {}ms",
        method,
        uri,
        response.status(),
        start_time.elapsed().as_millis()
    );

    response
}

/// Admission ceiling for one endpoint.
///
/// Never queues: once `max_concurrent` requests hold a permit, further
/// requests are turned away with 503 until one finishes.
#[derive(Clone)]
pub struct ConcurrencyGate {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        Self {
            name: Arc::from(name),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, DetectError> {
        Arc::clone(&self.semaphore).try_acquire_owned().map_err(|_| {
            tracing::warn!(
                "Rejecting request to {}: {} concurrent requests already in flight",
                self.name,
                self.max_concurrent
            );
            DetectError::Busy(format!(
                "{} is handling its maximum of {} concurrent requests, retry later",
                self.name, self.max_concurrent
            ))
        })
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }
}

/// Holds a gate permit for the lifetime of the request.
pub async fn limit_concurrency(
    State(gate): State<ConcurrencyGate>,
    req: Request,
    next: Next,
) -> Response {
    match gate.try_acquire() {
        Ok(_permit) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
