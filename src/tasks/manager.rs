use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// What `/task/:task_id` reports.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Human readable progress, e.g. `running - batching and inferencing`
    pub status: String,
    pub endpoint: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Finished tasks, oldest first
    finished: VecDeque<TaskId>,
}

/// In-memory tracker for async detection requests.
pub struct TaskManager {
    inner: Mutex<Inner>,
    max_retained: usize,
}

impl TaskManager {
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                finished: VecDeque::new(),
            }),
            max_retained,
        }
    }

    pub fn create(&self, endpoint: &str) -> TaskRecord {
        let record = TaskRecord {
            task_id: Uuid::new_v4(),
            state: TaskState::Created,
            status: "created".to_string(),
            endpoint: endpoint.to_string(),
            timestamp: now(),
            result: None,
        };
        self.inner.lock().tasks.insert(record.task_id, record.clone());
        tracing::debug!("Created task {} for {}", record.task_id, endpoint);
        record
    }

    pub fn update_status(&self, task_id: TaskId, status: &str) {
        self.transition(task_id, TaskState::Running, status.to_string(), None);
    }

    pub fn complete(&self, task_id: TaskId, result: serde_json::Value) {
        self.transition(task_id, TaskState::Completed, "completed".to_string(), Some(result));
    }

    pub fn fail(&self, task_id: TaskId, message: &str) {
        self.transition(task_id, TaskState::Failed, message.to_string(), None);
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.inner.lock().tasks.get(&task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        task_id: TaskId,
        state: TaskState,
        status: String,
        result: Option<serde_json::Value>,
    ) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.tasks.get_mut(&task_id) else {
            tracing::warn!("Ignoring update for unknown task {}", task_id);
            return;
        };
        if record.state.is_finished() {
            tracing::warn!("Ignoring update for finished task {}", task_id);
            return;
        }

        record.state = state;
        record.status = status;
        record.timestamp = now();
        if result.is_some() {
            record.result = result;
        }

        if state.is_finished() {
            inner.finished.push_back(task_id);
            while inner.finished.len() > self.max_retained {
                if let Some(evicted) = inner.finished.pop_front() {
                    inner.tasks.remove(&evicted);
                    tracing::debug!("Evicted finished task {}", evicted);
                }
            }
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
