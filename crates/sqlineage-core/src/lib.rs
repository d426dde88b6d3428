//! sqlineage core
//!
//! Core domain model shared by the scope builder, the lineage engine and the CLI.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod error;
pub mod schema;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use error::LineageError;
pub use schema::{Schema, TableSchema, InferredType};
pub use config::{Config, ConfigError, DialectConfig, SeverityThreshold, LimitsConfig, OutputConfig};
