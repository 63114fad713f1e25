//! # atlas-common
//!
//! Shared types for the Atlas Command mesh transport: the `Envelope` data
//! model, layered configuration, ids, and the error kinds that cross crate
//! boundaries.
//!
//! ## Crate structure
//!
//! - [`envelope`] — the application-visible message unit
//! - [`config`] — layered TOML configuration
//! - [`error`] — shared error kinds
//! - [`ids`] — envelope id generation and the chunk-header id prefix

pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;

pub use config::AtlasConfig;
pub use envelope::{Envelope, EnvelopeType};
pub use error::ConfigError;
