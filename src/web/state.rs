use crate::models::ModelRegistry;
use crate::tasks::TaskManager;
use crate::web::middleware::ConcurrencyGate;
use crate::Config;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ModelRegistry,
    pub tasks: Arc<TaskManager>,
    /// Ceiling for `/detect_async`; permits live as long as the background task
    pub async_gate: ConcurrencyGate,
}

impl AppState {
    pub fn new(config: Config, registry: ModelRegistry) -> Self {
        let tasks = Arc::new(TaskManager::new(config.server_config.max_retained_tasks));
        let async_gate =
            ConcurrencyGate::new("/detect_async", config.server_config.detect_max_concurrent);
        Self {
            config: Arc::new(config),
            registry,
            tasks,
            async_gate,
        }
    }
}
