//! Error types and result handling for pg-subscription.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_subscription::{Error, Result};
//!
//! fn ensure_slot() -> Result<()> {
//!     Err(Error::Provisioning {
//!         message: "permission denied to create replication slot".to_string(),
//!     })
//! }
//!
//! match ensure_slot() {
//!     Ok(()) => println!("Slot ready"),
//!     Err(Error::Provisioning { message }) => eprintln!("Provisioning failed: {}", message),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The main error type for pg-subscription operations.
///
/// Every failure of a subscription surfaces as one of these variants at the
/// point it occurs in the event sequence. Nothing is retried internally.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or subscription options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error when encoding events.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Publication or replication slot DDL failed.
    #[error("Provisioning error: {message}")]
    Provisioning {
        /// Description of the failed provisioning step
        message: String,
    },

    /// A row could not be converted into the target type.
    #[error("Mapping error on field '{field}': {message}")]
    Mapping {
        /// Name of the field that failed
        field: String,
        /// Description of what went wrong
        message: String,
    },

    /// The replication connection was lost while streaming.
    #[error("Replication stream interrupted: {message}")]
    StreamInterrupted {
        /// Description of the interruption
        message: String,
    },

    /// The exported snapshot is no longer importable.
    #[error("Snapshot '{snapshot}' has expired; the slot must be recreated")]
    SnapshotExpired {
        /// Name of the exported snapshot
        snapshot: String,
    },

    /// Another consumer is attached to the replication slot.
    #[error("Replication slot '{slot}' is in use by another consumer")]
    SlotInUse {
        /// Name of the slot
        slot: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Protocol-level error in the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn provisioning(message: impl Into<String>) -> Self {
        Error::Provisioning {
            message: message.into(),
        }
    }

    pub(crate) fn mapping(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }

    /// Returns true when re-subscribing may succeed.
    ///
    /// Only a lost stream qualifies; the caller decides whether and how to
    /// retry, typically by subscribing again with `CreateStyle::WhenNotExists`.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::StreamInterrupted { .. })
    }

    /// Returns the SQLSTATE of an underlying database error, if any.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Error::Postgres(e) => e.code(),
            _ => None,
        }
    }
}

/// A convenient Result type alias for pg-subscription operations.
///
/// This is equivalent to `std::result::Result<T, pg_subscription::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
