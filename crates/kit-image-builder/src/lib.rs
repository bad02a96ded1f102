pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod reconcile;
pub mod workspace;

pub use error::{Error, Result};
