use std::time::Duration;

use hive_core::Address;
use thiserror::Error;

/// Errors that can occur in the messaging layer.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("no endpoint listening at {0}")]
    UnknownAddress(Address),

    #[error("connection to {0} closed")]
    ConnectionClosed(Address),

    #[error("address {0} already in use")]
    AddressInUse(Address),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("offloaded encoding failed: {0}")]
    Offload(String),
}

impl CommError {
    /// Failures a caller may retry: the peer might still answer next time.
    pub fn is_transient(&self) -> bool {
        matches!(self, CommError::Timeout(_))
    }
}
