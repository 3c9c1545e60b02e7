pub mod checkpoint;
pub mod detector;
pub mod manager;

pub use checkpoint::Checkpoint;
pub use detector::{filter_detections, LincDetector, ObjectDetector};
pub use manager::{ModelRegistry, ModelStats};
