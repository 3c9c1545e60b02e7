pub mod loader;

pub use loader::{ImageLoader, ImageUpload};
