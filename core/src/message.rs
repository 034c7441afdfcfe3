//! Message model and its remote UID binding

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::folder::Container;

/// One participant on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Display name
    pub name: Option<String>,
    /// Email address, lowercased
    pub email: String,
}

impl Participant {
    pub fn new(name: Option<&str>, email: &str) -> Self {
        Self {
            name: name.map(|n| n.to_string()),
            email: email.to_ascii_lowercase(),
        }
    }
}

/// The two flags the engine tracks on every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub unread: bool,
    pub starred: bool,
}

impl MessageFlags {
    /// Derive from raw IMAP system flags
    pub fn from_imap(flags: &[String]) -> Self {
        Self {
            unread: !flags.iter().any(|f| f == "\\Seen"),
            starred: flags.iter().any(|f| f == "\\Flagged"),
        }
    }
}

/// A delivered message, persisted once per content hash per account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: Uuid,
    /// Account this message belongs to
    pub account_id: Uuid,
    /// Content hash, unique per account (dedup across re-fetch)
    pub content_hash: String,
    /// Subject as delivered
    pub subject: String,
    /// Plain-text snippet of the body
    pub snippet: String,
    /// Message body (plain text preferred, HTML as fallback)
    pub body: String,
    /// RFC 2822 Message-ID header
    pub header_message_id: Option<String>,
    /// In-Reply-To header
    pub in_reply_to: Option<String>,
    /// References header, split into individual message ids
    pub references: Vec<String>,
    /// Provider-native conversation id, when the server supplies one
    pub remote_thread_id: Option<String>,
    /// Date header (falls back to fetch time)
    pub date: OffsetDateTime,
    pub from: Vec<Participant>,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub flags: MessageFlags,
    /// Exclusive folder the message currently lives in
    pub folder_id: Option<Uuid>,
    /// Non-exclusive labels attached to the message
    pub label_ids: Vec<Uuid>,
    /// Thread this message was aggregated into
    pub thread_id: Option<Uuid>,
    /// Pipeline version stamp; bumped when the stage list changes shape
    pub processed_version: u32,
    /// Creation time
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Content hash over the canonical identity headers. Two fetches of the
    /// same delivered message always hash identically, which is what makes
    /// re-processing idempotent.
    pub fn hash_for_headers(
        header_message_id: Option<&str>,
        subject: &str,
        from: &[Participant],
        date: OffsetDateTime,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(header_message_id.unwrap_or_default().as_bytes());
        hasher.update(b"-");
        hasher.update(subject.as_bytes());
        hasher.update(b"-");
        for p in from {
            hasher.update(p.email.as_bytes());
        }
        hasher.update(b"-");
        hasher.update(date.unix_timestamp().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// All participants, in header order
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.from
            .iter()
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
    }
}

/// Join entity binding a local message to its remote numeric UID inside one
/// container, with the last-observed flag set. Unique per (container, uid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUid {
    pub container_id: Uuid,
    pub uid: u32,
    pub message_id: Uuid,
    pub flags: MessageFlags,
}

/// A message moving through the processing pipeline. Becomes a [`Message`]
/// only if every stage leaves it with a non-empty body.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub account_id: Uuid,
    /// Container the message was fetched from
    pub container: Container,
    /// Remote UID within that container
    pub uid: u32,
    /// Raw RFC 2822 bytes as fetched
    pub raw: Vec<u8>,
    pub flags: MessageFlags,
    /// Label container ids resolved for label-based providers
    pub label_ids: Vec<Uuid>,
    pub remote_thread_id: Option<String>,

    // Filled in by the parse stage:
    pub subject: String,
    pub snippet: String,
    pub body: String,
    pub header_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub date: OffsetDateTime,
    pub from: Vec<Participant>,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
}

impl MessageDraft {
    /// Start a draft from a raw fetch
    pub fn from_fetch(
        account_id: Uuid,
        container: Container,
        uid: u32,
        raw: Vec<u8>,
        flags: MessageFlags,
    ) -> Self {
        Self {
            account_id,
            container,
            uid,
            raw,
            flags,
            label_ids: Vec::new(),
            remote_thread_id: None,
            subject: String::new(),
            snippet: String::new(),
            body: String::new(),
            header_message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            date: OffsetDateTime::now_utc(),
            from: Vec::new(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
        }
    }

    /// Content hash of the draft's identity headers
    pub fn content_hash(&self) -> String {
        Message::hash_for_headers(
            self.header_message_id.as_deref(),
            &self.subject,
            &self.from,
            self.date,
        )
    }

    /// Finalize into a persistable message. `processed_version` stamps which
    /// pipeline shape produced it.
    pub fn into_message(self, processed_version: u32) -> Message {
        let content_hash = self.content_hash();
        Message {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            content_hash,
            subject: self.subject,
            snippet: self.snippet,
            body: self.body,
            header_message_id: self.header_message_id,
            in_reply_to: self.in_reply_to,
            references: self.references,
            remote_thread_id: self.remote_thread_id,
            date: self.date,
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            flags: self.flags,
            folder_id: Some(self.container.id),
            label_ids: self.label_ids,
            thread_id: None,
            processed_version,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_imap() {
        let seen = vec!["\\Seen".to_string()];
        let flagged = vec!["\\Flagged".to_string()];
        assert!(!MessageFlags::from_imap(&seen).unread);
        assert!(MessageFlags::from_imap(&flagged).unread);
        assert!(MessageFlags::from_imap(&flagged).starred);
    }

    #[test]
    fn test_hash_is_stable_across_refetch() {
        let from = vec![Participant::new(Some("Alice"), "ALICE@example.com")];
        let date = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let a = Message::hash_for_headers(Some("<m1@example.com>"), "Hello", &from, date);
        let b = Message::hash_for_headers(Some("<m1@example.com>"), "Hello", &from, date);
        assert_eq!(a, b);

        let c = Message::hash_for_headers(Some("<m2@example.com>"), "Hello", &from, date);
        assert_ne!(a, c);
    }

    #[test]
    fn test_participant_email_lowercased() {
        let p = Participant::new(None, "Bob@Example.COM");
        assert_eq!(p.email, "bob@example.com");
    }
}
