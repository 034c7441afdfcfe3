//! Thread aggregation, the terminal pipeline stage
//!
//! Resolution order: a provider-native conversation id wins outright;
//! otherwise the cleaned subject is matched against the most recent
//! candidate threads. Aggregation for one account runs single-writer so two
//! messages of the same conversation cannot race a duplicate thread into
//! existence.

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::HeimdallResult;
use crate::message::{Message, MessageDraft};
use crate::storage::Store;
use crate::thread::{clean_subject, Thread};

use super::PIPELINE_VERSION;

const CANDIDATE_LIMIT: usize = 10;

/// Find-or-create threads and merge messages into them
pub struct ThreadAggregator {
    write_lock: Mutex<()>,
}

impl ThreadAggregator {
    pub fn new() -> Self {
        Self { write_lock: Mutex::new(()) }
    }

    /// Persist the draft as a message on the right thread. Re-fetches of a
    /// known content hash update the stored message instead of duplicating.
    pub async fn aggregate(&self, store: &Store, draft: MessageDraft) -> HeimdallResult<Message> {
        let _guard = self.write_lock.lock().await;

        let hash = draft.content_hash();
        if let Some(mut existing) = store.message_by_content_hash(&hash).await? {
            existing.flags = draft.flags;
            existing.folder_id = Some(draft.container.id);
            existing.label_ids = draft.label_ids.clone();
            if existing.thread_id.is_none() {
                // A locally written copy (e.g. just-sent mail) gets threaded
                // on its first real fetch.
                existing.processed_version = PIPELINE_VERSION;
                return self.thread_message(store, existing).await;
            }
            store.save_message(&existing).await?;
            return Ok(existing);
        }

        let message = draft.into_message(PIPELINE_VERSION);
        self.thread_message(store, message).await
    }

    async fn thread_message(&self, store: &Store, mut message: Message) -> HeimdallResult<Message> {
        let mut thread = self.find_or_create_thread(store, &message).await?;
        let is_sent = self.is_sent(store, &message).await?;

        message.thread_id = Some(thread.id);
        thread.apply_message(&message, is_sent);

        // The thread row goes first so the message (and its folder/label
        // memberships on the thread) always reference an existing thread id.
        store.save_thread(&thread).await?;
        store.save_message(&message).await?;
        Ok(message)
    }

    async fn find_or_create_thread(
        &self,
        store: &Store,
        message: &Message,
    ) -> HeimdallResult<Thread> {
        if let Some(remote_id) = &message.remote_thread_id {
            return Ok(match store.thread_by_remote_id(remote_id).await? {
                Some(thread) => thread,
                None => Thread::with_remote_id(message.account_id, remote_id.clone()),
            });
        }

        let subject = clean_subject(&message.subject);
        let candidates = store.recent_threads_by_subject(&subject, CANDIDATE_LIMIT).await?;
        debug!(
            subject = %subject,
            candidates = candidates.len(),
            "resolving thread by subject"
        );
        Ok(match self.pick_matching_thread(candidates) {
            Some(thread) => thread,
            None => Thread::new(message.account_id),
        })
    }

    /// Take the most recent candidate outright. Participant-overlap checks
    /// existed here once and were removed; downstream consumers depend on
    /// this exact behavior, so it stays.
    fn pick_matching_thread(&self, mut candidates: Vec<Thread>) -> Option<Thread> {
        if candidates.is_empty() {
            None
        } else {
            Some(candidates.remove(0))
        }
    }

    async fn is_sent(&self, store: &Store, message: &Message) -> HeimdallResult<bool> {
        if let Some(folder_id) = message.folder_id {
            if let Some(container) = store.container(folder_id).await? {
                if container.is_sent() {
                    return Ok(true);
                }
            }
        }
        for label_id in &message.label_ids {
            if let Some(container) = store.container(*label_id).await? {
                if container.is_sent() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl Default for ThreadAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::{Container, ContainerKind};
    use crate::message::{MessageDraft, MessageFlags, Participant};
    use crate::testkit::test_store;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn draft(
        account_id: Uuid,
        container: &Container,
        subject: &str,
        message_id: &str,
        unix_date: i64,
        flags: MessageFlags,
    ) -> MessageDraft {
        let mut draft = MessageDraft::from_fetch(
            account_id,
            container.clone(),
            unix_date as u32,
            Vec::new(),
            flags,
        );
        draft.subject = subject.to_string();
        draft.body = format!("body of {subject}");
        draft.snippet = draft.body.clone();
        draft.header_message_id = Some(message_id.to_string());
        draft.date = OffsetDateTime::from_unix_timestamp(unix_date).unwrap();
        draft.from = vec![Participant::new(Some("Alice"), "alice@example.com")];
        draft
    }

    async fn seeded() -> (std::sync::Arc<crate::storage::Store>, tempfile::TempDir, Container) {
        let (store, dir) = test_store();
        let inbox = Container::new(store.account_id(), "INBOX", ContainerKind::Folder);
        store.save_container(&inbox).await.unwrap();
        (store, dir, inbox)
    }

    #[tokio::test]
    async fn test_reply_joins_thread_and_subject_stays_clean() {
        let (store, _dir, inbox) = seeded().await;
        let account_id = store.account_id();
        let aggregator = ThreadAggregator::new();

        let first = aggregator
            .aggregate(
                &store,
                draft(account_id, &inbox, "Hello", "<m1@x>", 100, MessageFlags::default()),
            )
            .await
            .unwrap();
        let second = aggregator
            .aggregate(
                &store,
                draft(account_id, &inbox, "Re: Hello", "<m2@x>", 200, MessageFlags::default()),
            )
            .await
            .unwrap();

        assert_eq!(first.thread_id, second.thread_id);
        let thread = store.thread(first.thread_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(thread.subject, "Hello");
        assert_eq!(thread.message_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_thread_id_wins_over_subject() {
        let (store, _dir, inbox) = seeded().await;
        let account_id = store.account_id();
        let aggregator = ThreadAggregator::new();

        let mut a = draft(account_id, &inbox, "Alpha", "<m1@x>", 100, MessageFlags::default());
        a.remote_thread_id = Some("conv-1".to_string());
        let mut b = draft(account_id, &inbox, "Totally different", "<m2@x>", 200, MessageFlags::default());
        b.remote_thread_id = Some("conv-1".to_string());

        let first = aggregator.aggregate(&store, a).await.unwrap();
        let second = aggregator.aggregate(&store, b).await.unwrap();
        assert_eq!(first.thread_id, second.thread_id);

        let thread = store.thread(first.thread_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(thread.remote_thread_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn test_counters_equal_sum_of_member_flags() {
        let (store, _dir, inbox) = seeded().await;
        let account_id = store.account_id();
        let aggregator = ThreadAggregator::new();

        let flags = [
            MessageFlags { unread: true, starred: false },
            MessageFlags { unread: true, starred: true },
            MessageFlags { unread: false, starred: true },
        ];
        let mut thread_id = None;
        for (i, f) in flags.iter().enumerate() {
            let subject = if i == 0 { "Topic" } else { "Re: Topic" };
            let message = aggregator
                .aggregate(
                    &store,
                    draft(account_id, &inbox, subject, &format!("<m{i}@x>"), 100 + i as i64, *f),
                )
                .await
                .unwrap();
            thread_id = message.thread_id;
        }

        let thread = store.thread(thread_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 2);
        assert_eq!(thread.starred_count, 2);
        assert_eq!(
            thread.last_message_date,
            Some(OffsetDateTime::from_unix_timestamp(102).unwrap())
        );
    }

    #[tokio::test]
    async fn test_unrelated_subject_creates_new_thread() {
        let (store, _dir, inbox) = seeded().await;
        let account_id = store.account_id();
        let aggregator = ThreadAggregator::new();

        let first = aggregator
            .aggregate(
                &store,
                draft(account_id, &inbox, "Hello", "<m1@x>", 100, MessageFlags::default()),
            )
            .await
            .unwrap();
        let second = aggregator
            .aggregate(
                &store,
                draft(account_id, &inbox, "Invoice", "<m2@x>", 200, MessageFlags::default()),
            )
            .await
            .unwrap();
        assert_ne!(first.thread_id, second.thread_id);
    }

    #[tokio::test]
    async fn test_refetch_dedups_by_content_hash() {
        let (store, _dir, inbox) = seeded().await;
        let account_id = store.account_id();
        let aggregator = ThreadAggregator::new();

        let original = draft(account_id, &inbox, "Hello", "<m1@x>", 100, MessageFlags::default());
        let refetch = original.clone();

        let first = aggregator.aggregate(&store, original).await.unwrap();
        let second = aggregator.aggregate(&store, refetch).await.unwrap();
        assert_eq!(first.id, second.id);

        let thread = store.thread(first.thread_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(thread.message_ids.len(), 1);
    }
}
