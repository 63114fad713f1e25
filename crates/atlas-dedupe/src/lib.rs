//! # atlas-dedupe
//!
//! Gateway-side request dedupe cache (§4.6).

pub mod cache;

pub use cache::{DedupeCache, DedupeOutcome};
