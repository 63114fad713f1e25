//! # atlas-outbox
//!
//! Durable outbox / spool with exponential-backoff retry (§4.5).
//!
//! ## Crate structure
//!
//! - [`spool`] — the durable JSON-on-disk queue
//! - [`backoff`] — the retry delay schedule

pub mod backoff;
pub mod error;
pub mod spool;

pub use error::{DeliveryFailed, SpoolError};
pub use spool::{Outbox, SpoolRecord};
