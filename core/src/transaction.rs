//! Transaction log records and the account-scoped change channel
//!
//! Every create/update/delete on a tracked model appends one immutable
//! Transaction row in the same unit of work as the change, then announces it
//! on the account's broadcast channel. The row id is the replay cursor.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// What happened to the referenced object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionEvent {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for TransactionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionEvent::Create => write!(f, "create"),
            TransactionEvent::Modify => write!(f, "modify"),
            TransactionEvent::Delete => write!(f, "delete"),
        }
    }
}

/// One immutable, strictly ordered change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Monotonic id; doubles as the replay cursor
    pub id: i64,
    pub account_id: Uuid,
    pub event: TransactionEvent,
    /// `"message"`, `"thread"`, `"folder"`, `"label"`, `"syncbackRequest"`
    pub object_type: String,
    pub object_id: String,
    /// Field names that changed; every field on create, none on delete
    pub changed_fields: Vec<String>,
    pub created_at: OffsetDateTime,
}

/// Lightweight notification published after a transaction commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionNotice {
    pub id: i64,
    pub account_id: Uuid,
}

/// Field names whose values differ between two JSON object snapshots.
/// For a create (`before` = None) this is every field of `after`.
pub fn changed_fields(
    before: Option<&serde_json::Value>,
    after: &serde_json::Value,
) -> Vec<String> {
    let after_map = match after.as_object() {
        Some(map) => map,
        None => return Vec::new(),
    };
    match before.and_then(|b| b.as_object()) {
        None => after_map.keys().cloned().collect(),
        Some(before_map) => after_map
            .iter()
            .filter(|(key, value)| before_map.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect(),
    }
}

/// Account-scoped transaction channel. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct TransactionPublisher {
    sender: broadcast::Sender<TransactionNotice>,
}

impl TransactionPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Announce a committed transaction. Lagging or absent subscribers are
    /// fine; the delta stream re-queries from its cursor anyway.
    pub fn publish(&self, notice: TransactionNotice) {
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionNotice> {
        self.sender.subscribe()
    }
}

impl Default for TransactionPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_fields_on_create_lists_everything() {
        let after = json!({"subject": "Hello", "unread": true});
        let mut fields = changed_fields(None, &after);
        fields.sort();
        assert_eq!(fields, vec!["subject", "unread"]);
    }

    #[test]
    fn test_changed_fields_on_modify_lists_only_diffs() {
        let before = json!({"subject": "Hello", "unread": true, "starred": false});
        let after = json!({"subject": "Hello", "unread": false, "starred": false});
        assert_eq!(changed_fields(Some(&before), &after), vec!["unread"]);
    }

    #[test]
    fn test_identical_snapshots_produce_no_fields() {
        let snapshot = json!({"subject": "Hello"});
        assert!(changed_fields(Some(&snapshot), &snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_publisher_reaches_subscriber() {
        let publisher = TransactionPublisher::default();
        let mut rx = publisher.subscribe();
        let notice = TransactionNotice { id: 7, account_id: Uuid::new_v4() };
        publisher.publish(notice);
        assert_eq!(rx.recv().await.unwrap(), notice);
    }
}
