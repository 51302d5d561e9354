//! Error types for the replication subsystem.

use thiserror::Error;
use volrep_transport::TransportError;

use crate::store::StoreError;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Intent parameters are malformed.
    #[error("validation error: {msg}")]
    Validation {
        /// What is wrong with the parameters.
        msg: String,
    },

    /// No endpoint could be resolved for a volume.
    #[error("no endpoint for volume {volume}: {msg}")]
    EndpointUnresolved {
        /// Volume that could not be placed.
        volume: String,
        /// Resolution failure detail.
        msg: String,
    },

    /// Intent/status store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transport failure outside of a classified operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// Configuration could not be loaded.
    #[error("config error: {msg}")]
    Config {
        /// What went wrong.
        msg: String,
    },

    /// The controller was shut down.
    #[error("controller shut down")]
    Shutdown,
}

/// Replication result alias.
pub type Result<T> = std::result::Result<T, ReplError>;
