//! Completion service integration
//!
//! `client` adapts siumai chat models to the `CompletionService` trait; `structured`
//! turns completion output into typed values and owns the repair retry.

pub mod client;
pub mod structured;

pub use client::DelveLlmClient;
pub use structured::{complete_structured, complete_with_repair, extract_json};
