//! # airwave-core
//!
//! Core types, configuration, and error handling for the Airwave playback engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, ErrorCategory, Result, TimeoutStage};
pub use types::*;
