//! Error types for the Lagless engine.

use crate::{CollectionName, DocumentId, SubscriptionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the engine's own bookkeeping and API misuse.
///
/// Method failures travel separately as [`MethodError`], since they are
/// part of the protocol and must be serializable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("document already exists: {collection}/{id}")]
    DocumentAlreadyExists {
        collection: CollectionName,
        id: DocumentId,
    },

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("document awaiting resync: {collection}/{id}")]
    DocumentResyncing {
        collection: CollectionName,
        id: DocumentId,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The terminal error of a method invocation.
///
/// `Simulation` errors never leave the client. `Authorization` and `Domain`
/// errors are produced by the server and travel in `method_error` messages.
/// `Connectivity` is only surfaced when a reconnect policy gives up on an
/// outstanding invocation.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodError {
    #[error("simulation failed: {reason}")]
    Simulation { reason: String },

    #[error("not authorized: {reason}")]
    Authorization { reason: String },

    #[error("{reason} [{error}]")]
    Domain {
        /// Machine-readable error code chosen by the method author
        error: String,
        /// Human-readable explanation
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    #[error("connection lost before the server responded")]
    Connectivity,
}

impl MethodError {
    pub fn simulation(reason: impl Into<String>) -> Self {
        MethodError::Simulation {
            reason: reason.into(),
        }
    }

    pub fn authorization(reason: impl Into<String>) -> Self {
        MethodError::Authorization {
            reason: reason.into(),
        }
    }

    pub fn domain(error: impl Into<String>, reason: impl Into<String>) -> Self {
        MethodError::Domain {
            error: error.into(),
            reason: reason.into(),
            details: None,
        }
    }

    /// Attach structured details to a domain error. Other kinds are
    /// returned unchanged.
    pub fn with_details(self, details: serde_json::Value) -> Self {
        match self {
            MethodError::Domain { error, reason, .. } => MethodError::Domain {
                error,
                reason,
                details: Some(details),
            },
            other => other,
        }
    }

    pub fn not_found(method: &str) -> Self {
        MethodError::domain("method-not-found", format!("method '{method}' not found"))
    }

    /// The domain error code, if this is a domain error.
    pub fn code(&self) -> Option<&str> {
        match self {
            MethodError::Domain { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<Error> for MethodError {
    fn from(err: Error) -> Self {
        match err {
            Error::DocumentAlreadyExists { .. } => MethodError::domain("duplicate-key", err.to_string()),
            Error::DocumentResyncing { .. } => MethodError::simulation(err.to_string()),
            Error::UnknownSubscription(_) => MethodError::domain("internal", err.to_string()),
        }
    }
}
