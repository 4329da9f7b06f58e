//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the export platform core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the export engines depend on.
//! It establishes the logging conventions, the validated configuration surface,
//! and the event broadcasting mechanism used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
