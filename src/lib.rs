//! Workspace entry crate.
//!
//! Host applications depend on `export-workspace` to pull in the export
//! service façade without wiring the individual crates (`core-runtime`,
//! `core-export`, `core-service`) themselves.

pub use core_service::*;
