//! Client-side subscription records.

use crate::{MethodError, SubscriptionId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a subscription as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionStatus {
    /// Sent, initial result set not complete yet
    Pending,
    /// Initial result set complete
    Ready,
    /// Ended by unsubscribe or by the server
    Stopped,
}

/// A client's active instance of a publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub name: String,
    pub params: serde_json::Value,
    pub status: SubscriptionStatus,
    /// Why the server stopped it, if it did so with an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MethodError>,
}

impl SubscriptionRecord {
    /// Create a pending subscription.
    pub fn new(id: impl Into<SubscriptionId>, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params,
            status: SubscriptionStatus::Pending,
            error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == SubscriptionStatus::Ready
    }

    pub fn is_stopped(&self) -> bool {
        self.status == SubscriptionStatus::Stopped
    }

    /// Mark the initial result set complete. Returns false if the record
    /// was not pending.
    pub fn mark_ready(&mut self) -> bool {
        if self.status != SubscriptionStatus::Pending {
            return false;
        }
        self.status = SubscriptionStatus::Ready;
        true
    }

    /// Mark the subscription stopped. Returns false if it already was.
    pub fn stop(&mut self, error: Option<MethodError>) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.status = SubscriptionStatus::Stopped;
        self.error = error;
        true
    }
}
