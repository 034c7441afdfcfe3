//! Thread aggregate
//!
//! A thread is derived state over the messages assigned to it. Counters and
//! date fields are maintained incrementally as each message is merged; the
//! full-rescan path exists only for maintenance/repair and must never run
//! during normal sync.

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::message::{Message, MessageFlags, Participant};

/// Strip reply/forward prefixes, repeatedly and case-insensitively
pub fn clean_subject(subject: &str) -> String {
    let re = Regex::new(r"(?i)^((re|fw|fwd|aw|wg|undeliverable|undelivered):\s*)+").unwrap();
    re.replace(subject.trim(), "").into_owned()
}

/// An aggregate conversation over a set of messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Unique thread ID
    pub id: Uuid,
    /// Account this thread belongs to
    pub account_id: Uuid,
    /// Provider-native conversation id, when one exists
    pub remote_thread_id: Option<String>,
    /// Cleaned subject
    pub subject: String,
    /// Snippet of the newest message
    pub snippet: String,
    /// Number of unread messages currently on the thread
    pub unread_count: u32,
    /// Number of starred messages currently on the thread
    pub starred_count: u32,
    pub first_message_date: Option<OffsetDateTime>,
    pub last_message_date: Option<OffsetDateTime>,
    pub last_message_sent_date: Option<OffsetDateTime>,
    pub last_message_received_date: Option<OffsetDateTime>,
    /// Participants across all messages, deduplicated by address
    pub participants: Vec<Participant>,
    /// Union of the folders of this thread's messages
    pub folder_ids: Vec<Uuid>,
    /// Union of the labels of this thread's messages
    pub label_ids: Vec<Uuid>,
    /// Messages currently assigned to this thread
    pub message_ids: Vec<Uuid>,
    /// Creation time
    pub created_at: OffsetDateTime,
}

impl Thread {
    /// Create an empty thread
    pub fn new(account_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            remote_thread_id: None,
            subject: String::new(),
            snippet: String::new(),
            unread_count: 0,
            starred_count: 0,
            first_message_date: None,
            last_message_date: None,
            last_message_sent_date: None,
            last_message_received_date: None,
            participants: Vec::new(),
            folder_ids: Vec::new(),
            label_ids: Vec::new(),
            message_ids: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Create an empty thread keyed by a provider-native conversation id
    pub fn with_remote_id(account_id: Uuid, remote_thread_id: impl Into<String>) -> Self {
        let mut thread = Self::new(account_id);
        thread.remote_thread_id = Some(remote_thread_id.into());
        thread
    }

    /// Merge one message into the aggregate. `is_sent` classifies the
    /// message by the role of its folder/labels; the caller resolves it.
    pub fn apply_message(&mut self, message: &Message, is_sent: bool) {
        if !self.message_ids.contains(&message.id) {
            self.message_ids.push(message.id);
        }

        // Participants: union by address, first-seen name wins.
        for p in message.participants() {
            if !self.participants.iter().any(|known| known.email == p.email) {
                self.participants.push(p.clone());
            }
        }

        if message.flags.unread {
            self.unread_count += 1;
        }
        if message.flags.starred {
            self.starred_count += 1;
        }

        if self.last_message_date.map_or(true, |d| message.date > d) {
            self.last_message_date = Some(message.date);
            self.snippet = message.snippet.clone();
            self.subject = clean_subject(&message.subject);
        }
        if self.first_message_date.map_or(true, |d| message.date < d) {
            self.first_message_date = Some(message.date);
        }

        if is_sent {
            if self.last_message_sent_date.map_or(true, |d| message.date > d) {
                self.last_message_sent_date = Some(message.date);
            }
        } else if self.last_message_received_date.map_or(true, |d| message.date > d) {
            self.last_message_received_date = Some(message.date);
        }

        if let Some(folder_id) = message.folder_id {
            if !self.folder_ids.contains(&folder_id) {
                self.folder_ids.push(folder_id);
            }
        }
        for label_id in &message.label_ids {
            if !self.label_ids.contains(label_id) {
                self.label_ids.push(*label_id);
            }
        }
    }

    /// Undo one message's contribution to the flag counters, used when a
    /// flag-only change is observed during reconciliation.
    pub fn adjust_counters(&mut self, before: MessageFlags, after: MessageFlags) {
        if before.unread != after.unread {
            if after.unread {
                self.unread_count += 1;
            } else {
                self.unread_count = self.unread_count.saturating_sub(1);
            }
        }
        if before.starred != after.starred {
            if after.starred {
                self.starred_count += 1;
            } else {
                self.starred_count = self.starred_count.saturating_sub(1);
            }
        }
    }

    /// Maintenance-only: rebuild counters, dates and memberships from the
    /// full message set. Never called on the sync hot path.
    pub fn recompute_from_messages<'a, F>(&mut self, messages: &'a [Message], is_sent: F)
    where
        F: Fn(&'a Message) -> bool,
    {
        self.unread_count = 0;
        self.starred_count = 0;
        self.first_message_date = None;
        self.last_message_date = None;
        self.last_message_sent_date = None;
        self.last_message_received_date = None;
        self.participants.clear();
        self.folder_ids.clear();
        self.label_ids.clear();
        self.message_ids.clear();
        for message in messages {
            self.apply_message(message, is_sent(message));
        }
    }
}
