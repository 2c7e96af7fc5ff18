//! Core type definitions for the kvtree prefix cache
//!
//! This crate contains the identifiers, error type, configuration and request
//! types shared by the cache and scheduler crates. It has no dependency on
//! either of them so it can sit at the bottom of the workspace graph.

pub mod config;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod requests;
pub mod tokenizer;

// Re-export commonly used types
pub use config::*;
pub use errors::*;
pub use ids::*;
pub use requests::*;
pub use tokenizer::*;

/// Result type used throughout kvtree
pub type Result<T> = std::result::Result<T, KvTreeError>;
