use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("failed to write spool file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spool file {path} is corrupt and was quarantined: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Surfaced locally once a record's retries are exhausted (§7 `DeliveryFailed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailed {
    pub envelope_id: String,
    pub destination: String,
    pub attempts: u32,
}
