//! Common types and utilities shared across interchange-mem.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration constants and startup knobs
//! - Error types
//! - Identifiers (BufferId)

mod buffer_id;
pub mod config;
pub mod error;

pub use buffer_id::BufferId;
pub use error::{Error, Result};
