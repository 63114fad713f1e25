//! Error kinds shared across the workspace (§7 Error Handling Design).
//!
//! Per-crate errors (`atlas-transport::TransportError`,
//! `atlas-outbox::SpoolError`, ...) carry the kinds specific to their own
//! domain; `ConfigError` lives here because `AtlasConfig::load` is shared
//! by both binaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
