use aya::maps::MapError;
use thiserror::Error;

use crate::engine::Stage;
use crate::model::Protocol;
use crate::store::StoreError;

/// Everything that can stop a rule update. None of these are retried.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefixLength(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("unsupported protocol {0} (expected 6 for TCP or 17 for UDP)")]
    UnsupportedProtocol(u8),

    #[error("failed to open rule map at {path}")]
    StoreOpen {
        path: String,
        #[source]
        source: MapError,
    },

    #[error("lookup of rule {key} failed")]
    StoreLookup {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("update of rule {key} failed")]
    StoreWrite {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("rule {key} changed in the map since it was fetched")]
    Conflict { key: String },

    #[error("{protocol} index table is full ({capacity} ports), cannot add port {port}")]
    IndexTableFull {
        protocol: Protocol,
        port: u16,
        capacity: usize,
    },

    #[error("internal consistency check failed: {0}")]
    InternalConsistency(String),
}

impl UpdateError {
    /// The engine stage this error is raised from.
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidAddress(_)
            | Self::InvalidPort(_)
            | Self::InvalidPrefixLength(_)
            | Self::InvalidProtocol(_) => Stage::Validate,
            Self::StoreOpen { .. } | Self::StoreLookup { .. } => Stage::Fetch,
            Self::UnsupportedProtocol(_)
            | Self::IndexTableFull { .. }
            | Self::InternalConsistency(_) => Stage::Merge,
            Self::StoreWrite { .. } | Self::Conflict { .. } => Stage::Persist,
        }
    }
}
