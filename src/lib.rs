pub mod aggregate;
pub mod api;
pub mod cache;
pub mod config;
pub mod downsample;
pub mod edge;
pub mod engine;
pub mod error;
pub mod history;
pub mod models;
pub mod prober;
pub mod store;
pub mod sync;

pub use config::AppConfig;
pub use engine::StatusService;
pub use error::{StoreError, ValidationError};
