//! Containers: folders and labels
//!
//! A container is a remote mailbox box. Folders are hierarchical and
//! exclusive (a message lives in exactly one); labels are non-exclusive tags
//! used when the provider's mailbox model is label-based. Both carry the
//! sync high-water mark the mailbox sync algorithm reconciles against.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Whether a container behaves as an exclusive folder or a tag-like label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Hierarchical, exclusive container
    Folder,
    /// Non-exclusive tag
    Label,
}

/// Well-known container roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    /// Provider-wide "all mail" container on label-based providers
    All,
    /// No special role
    None,
}

impl ContainerRole {
    /// Best-effort role detection from the remote container name
    pub fn detect(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        if lowered == "inbox" {
            ContainerRole::Inbox
        } else if lowered.contains("sent") {
            ContainerRole::Sent
        } else if lowered.contains("draft") {
            ContainerRole::Drafts
        } else if lowered.contains("trash") || lowered.contains("deleted") {
            ContainerRole::Trash
        } else if lowered.contains("spam") || lowered.contains("junk") {
            ContainerRole::Spam
        } else if lowered.contains("all mail") || lowered.contains("archive") {
            if lowered.contains("all mail") {
                ContainerRole::All
            } else {
                ContainerRole::Archive
            }
        } else {
            ContainerRole::None
        }
    }
}

/// High-water mark and epoch for one container, plus UIDs that failed
/// processing and should be retried on a later pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSyncState {
    /// Next UID the server will assign, as of the last completed fetch
    pub uidnext: Option<u32>,
    /// UID epoch; a change voids every UID we know for this container
    pub uidvalidity: Option<u32>,
    /// UIDs whose messages failed the processing pipeline
    #[serde(default)]
    pub failed_uids: Vec<u32>,
}

impl ContainerSyncState {
    /// Record a pipeline failure for later retry; keeps the list deduplicated
    pub fn record_failed_uid(&mut self, uid: u32) {
        if !self.failed_uids.contains(&uid) {
            self.failed_uids.push(uid);
        }
    }
}

/// A folder or label on the remote server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Unique container ID
    pub id: Uuid,
    /// Account this container belongs to
    pub account_id: Uuid,
    /// Remote name, e.g. `INBOX` or `Receipts/2024`
    pub name: String,
    /// Detected role
    pub role: ContainerRole,
    /// Folder or label
    pub kind: ContainerKind,
    /// Sync high-water mark
    pub sync_state: ContainerSyncState,
    /// Creation time
    pub created_at: OffsetDateTime,
}

impl Container {
    /// Create a container discovered on the remote server
    pub fn new(account_id: Uuid, name: impl Into<String>, kind: ContainerKind) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            account_id,
            role: ContainerRole::detect(&name),
            name,
            kind,
            sync_state: ContainerSyncState::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Whether messages in this container count as sent by the user
    pub fn is_sent(&self) -> bool {
        self.role == ContainerRole::Sent
    }
}
