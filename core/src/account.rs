//! Account model
//!
//! An account is one remote mailbox identity. Connection settings are an
//! opaque blob owned by account setup; the engine only reads them to build a
//! session, and only ever writes back sync status and error state.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Account sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Account is active and syncing
    Active,
    /// The last sync pass failed; `last_error` carries the detail
    SyncError,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "Active"),
            AccountStatus::SyncError => write!(f, "Sync Error"),
        }
    }
}

/// Per-account sync tuning, assigned by the process that owns the account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Seconds between sync passes
    pub interval_secs: u64,
    /// Trailing UID window for the flag/removal reconciliation scan
    pub attribute_scan_window: u32,
    /// UIDs fetched on the very first pass over a container
    pub initial_fetch_count: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            attribute_scan_window: 1000,
            initial_fetch_count: 500,
        }
    }
}

/// One remote mailbox identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account ID
    pub id: Uuid,
    /// Email address
    pub email: String,
    /// Connection settings/credentials, opaque to the engine
    pub connection_settings: serde_json::Value,
    /// Sync tuning for this account
    pub sync_policy: SyncPolicy,
    /// Sync status
    pub status: AccountStatus,
    /// Last sync error, if any
    pub last_error: Option<String>,
    /// Last successful sync pass
    pub last_synced_at: Option<OffsetDateTime>,
    /// Creation time
    pub created_at: OffsetDateTime,
}

impl Account {
    /// Create a new account with opaque connection settings
    pub fn new(email: impl Into<String>, connection_settings: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            connection_settings,
            sync_policy: SyncPolicy::default(),
            status: AccountStatus::Active,
            last_error: None,
            last_synced_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Record a successful sync pass, clearing any previous error
    pub fn mark_synced(&mut self) {
        self.status = AccountStatus::Active;
        self.last_error = None;
        self.last_synced_at = Some(OffsetDateTime::now_utc());
    }

    /// Record a failed sync pass
    pub fn mark_sync_error(&mut self, error: impl Into<String>) {
        self.status = AccountStatus::SyncError;
        self.last_error = Some(error.into());
    }
}
