pub mod manager;

pub use manager::{TaskId, TaskManager, TaskRecord, TaskState};
