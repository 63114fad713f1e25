//! Layered configuration (§6 Configuration, SPEC_FULL §4.10).
//!
//! Resolution order: explicit path argument → `$ATLAS_CONFIG` → `$XDG_CONFIG_HOME/atlas/config.toml`
//! → `~/.config/atlas/config.toml` → built-in defaults. Mirrors
//! `summit-core::config::SummitConfig`'s resolution chain and nested
//! `#[serde(default)]` struct shape.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    pub transport: TransportConfig,
    pub outbox: OutboxConfig,
    pub dedupe: DedupeConfig,
    pub radio: RadioConfig,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            transport: TransportConfig::default(),
            outbox: OutboxConfig::default(),
            dedupe: DedupeConfig::default(),
            radio: RadioConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub segment_size: u16,
    pub reliability_method: ReliabilityMethod,
    pub nack_max_per_seq: u8,
    pub nack_interval_secs: f64,
    pub chunk_delay_threshold: Option<u16>,
    pub chunk_delay_seconds: f64,
    pub timeout_secs: u64,
    pub post_response_timeout_secs: u64,
    pub post_response_quiet_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            segment_size: 210,
            reliability_method: ReliabilityMethod::Window,
            nack_max_per_seq: 3,
            nack_interval_secs: 1.0,
            chunk_delay_threshold: None,
            chunk_delay_seconds: 0.0,
            timeout_secs: 90,
            post_response_timeout_secs: 150,
            post_response_quiet_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityMethod {
    Simple,
    Stage,
    Window,
    WindowFec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub retries: u32,
    pub spool_path: PathBuf,
    pub clear_spool: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            retries: 2,
            spool_path: PathBuf::from("atlas-spool.json"),
            clear_spool: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub dedupe_ttl_seconds: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        DedupeConfig {
            dedupe_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub simulate: bool,
    pub radio_port: Option<String>,
    pub node_id: Option<String>,
    pub gateway_node_id: Option<String>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            simulate: false,
            radio_port: None,
            node_id: None,
            gateway_node_id: None,
        }
    }
}

impl AtlasConfig {
    /// Load configuration following the resolution order documented above.
    /// Never fails on a missing file — falls back to defaults at every
    /// step, matching `summit-core`'s "missing config is not fatal" rule.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("ATLAS_CONFIG").map(PathBuf::from))
            .or_else(default_config_path);

        let Some(path) = path else {
            return Ok(AtlasConfig::default());
        };
        if !path.exists() {
            return Ok(AtlasConfig::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("atlas").join("config.toml"));
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("atlas").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AtlasConfig::default();
        assert_eq!(cfg.transport.segment_size, 210);
        assert_eq!(cfg.transport.nack_max_per_seq, 3);
        assert_eq!(cfg.transport.timeout_secs, 90);
        assert_eq!(cfg.transport.post_response_timeout_secs, 150);
        assert_eq!(cfg.outbox.retries, 2);
        assert_eq!(cfg.dedupe.dedupe_ttl_seconds, 3600);
        assert!(!cfg.radio.simulate);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let cfg = AtlasConfig::load(Some(Path::new("/nonexistent/atlas.toml"))).unwrap();
        assert_eq!(cfg.transport.segment_size, 210);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_src = r#"
            [transport]
            segment_size = 180

            [radio]
            simulate = true
        "#;
        let cfg: AtlasConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.transport.segment_size, 180);
        assert_eq!(cfg.transport.nack_max_per_seq, 3);
        assert!(cfg.radio.simulate);
    }
}
