//! Delve Core - shared data structures and trait definitions
//!
//! This crate defines the error taxonomy, configuration, logging, retry utilities and
//! the two collaborator traits (search and completion) used by the whole delve system

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod text;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
