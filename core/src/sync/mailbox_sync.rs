//! The mailbox delta-sync algorithm
//!
//! Brings local MessageUID/Message state for one container up to date with
//! the remote container while fetching as little as possible:
//!
//! 1. open the container and read `(uidnext, uidvalidity)`
//! 2. if the stored uidvalidity no longer matches, drop every UID binding
//!    for the container (messages survive) and forget the high-water mark
//! 3. fetch the unseen range `[stored_uidnext, *]` (or `[1, *]`) through the
//!    pipeline, then persist the new high-water mark
//! 4. reconcile flags and removals over a bounded tail window
//!
//! A pass over an unchanged container performs no store writes at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::account::SyncPolicy;
use crate::connection::{FetchedMessage, Operation, OperationContext, UidSet};
use crate::error::HeimdallResult;
use crate::folder::{Container, ContainerSyncState};
use crate::message::{Message, MessageDraft, MessageFlags, MessageUid};
use crate::pipeline::Pipeline;

/// Sync one container. Runs on the connection queue.
pub struct SyncContainerOperation {
    container_id: uuid::Uuid,
    container_name: String,
    policy: SyncPolicy,
    pipeline: Arc<Pipeline>,
}

impl SyncContainerOperation {
    pub fn new(container: &Container, policy: SyncPolicy, pipeline: Arc<Pipeline>) -> Self {
        Self {
            container_id: container.id,
            container_name: container.name.clone(),
            policy,
            pipeline,
        }
    }

    async fn process_fetched(
        &self,
        ctx: &mut OperationContext<'_>,
        container: &Container,
        fetched: FetchedMessage,
    ) -> HeimdallResult<Option<Message>> {
        let mut draft = MessageDraft::from_fetch(
            ctx.store.account_id(),
            container.clone(),
            fetched.uid,
            fetched.raw,
            fetched.flags,
        );
        draft.remote_thread_id = fetched.remote_thread_id;
        if ctx.session.capabilities().labels {
            for label in &fetched.labels {
                if let Some(label_container) = ctx.store.container_by_name(label).await? {
                    draft.label_ids.push(label_container.id);
                }
            }
        }

        let uid = fetched.uid;
        match self.pipeline.process(ctx.store, draft).await? {
            Some(message) => {
                ctx.store
                    .upsert_message_uid(&MessageUid {
                        container_id: container.id,
                        uid,
                        message_id: message.id,
                        flags: message.flags,
                    })
                    .await?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Step 3: fetch everything at or above the stored high-water mark
    async fn fetch_unseen(
        &self,
        ctx: &mut OperationContext<'_>,
        container: &mut Container,
        current: ContainerSyncState,
    ) -> HeimdallResult<(u32, u32)> {
        let stored_uidnext = container.sync_state.uidnext;
        if stored_uidnext == current.uidnext {
            debug!(container = %container.name, "uidnext unchanged, nothing new to fetch");
            return Ok((0, 0));
        }

        let range = UidSet::RangeFrom(stored_uidnext.unwrap_or(1));
        debug!(container = %container.name, range = %range, "fetching unseen messages");

        let mut processed = 0;
        let mut skipped = 0;
        for fetched in ctx.session.fetch_full(&range).await? {
            let uid = fetched.uid;
            match self.process_fetched(ctx, container, fetched).await? {
                Some(_) => processed += 1,
                None => {
                    container.sync_state.record_failed_uid(uid);
                    skipped += 1;
                }
            }
        }

        // Commit the new high-water mark only now that the fetch finished;
        // an error above leaves the old mark for an idempotent retry.
        container.sync_state.uidnext = current.uidnext;
        container.sync_state.uidvalidity = current.uidvalidity;
        ctx.store.save_container(container).await?;

        Ok((processed, skipped))
    }

    /// Step 4: diff flags and removals over the bounded tail window
    async fn reconcile_window(
        &self,
        ctx: &mut OperationContext<'_>,
        container: &Container,
        uidnext: u32,
    ) -> HeimdallResult<(u32, u32)> {
        let lower = uidnext.saturating_sub(self.policy.attribute_scan_window).max(1);
        let remote: HashMap<u32, MessageFlags> = ctx
            .session
            .fetch_attributes(&UidSet::RangeFrom(lower))
            .await?
            .into_iter()
            .map(|attrs| (attrs.uid, attrs.flags))
            .collect();

        let known = ctx.store.message_uids_for_container(container.id).await?;
        let mut changed: Vec<(MessageUid, MessageFlags)> = Vec::new();
        let mut removed: Vec<u32> = Vec::new();
        let mut unknown_remote = remote.len();
        for binding in known.iter().filter(|b| b.uid >= lower) {
            match remote.get(&binding.uid) {
                None => removed.push(binding.uid),
                Some(flags) => {
                    unknown_remote -= 1;
                    if *flags != binding.flags {
                        changed.push((binding.clone(), *flags));
                    }
                }
            }
        }
        if unknown_remote > 0 {
            // UIDs we have never bound. They will be at or above uidnext on
            // arrival and get picked up by the next unseen-range fetch.
            debug!(container = %container.name, count = unknown_remote, "ignoring unbound remote UIDs");
        }

        if changed.is_empty() && removed.is_empty() {
            return Ok((0, 0));
        }

        for uid in &removed {
            // Only the binding goes away; the message itself survives.
            ctx.store.delete_message_uid(container.id, *uid).await?;
        }
        if !removed.is_empty() {
            info!(container = %container.name, count = removed.len(), "removed vanished UID bindings");
        }

        for (binding, new_flags) in &changed {
            let old_flags = binding.flags;
            let fetched = ctx.session.fetch_full(&UidSet::List(vec![binding.uid])).await?;
            for item in fetched {
                if let Some(message) = self.process_fetched(ctx, container, item).await? {
                    if let Some(thread_id) = message.thread_id {
                        if let Some(mut thread) = ctx.store.thread(thread_id).await? {
                            thread.adjust_counters(old_flags, *new_flags);
                            ctx.store.save_thread(&thread).await?;
                        }
                    }
                }
            }
        }
        if !changed.is_empty() {
            info!(container = %container.name, count = changed.len(), "reprocessed messages with changed flags");
        }

        Ok((changed.len() as u32, removed.len() as u32))
    }
}

#[async_trait]
impl Operation for SyncContainerOperation {
    fn description(&self) -> String {
        format!("SyncContainer ({})", self.container_name)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let mut container = match ctx.store.container(self.container_id).await? {
            Some(container) => container,
            None => {
                warn!(container = %self.container_name, "container vanished before sync");
                return Ok(json!({"skipped": true}));
            }
        };

        let status = ctx.session.open_container(&container.name).await?;
        let current = ContainerSyncState {
            uidnext: Some(status.uidnext),
            uidvalidity: Some(status.uidvalidity),
            failed_uids: container.sync_state.failed_uids.clone(),
        };

        // Step 2: a changed uidvalidity voids every UID we know.
        if let Some(stored) = container.sync_state.uidvalidity {
            if stored != status.uidvalidity {
                info!(
                    container = %container.name,
                    stored_uidvalidity = stored,
                    remote_uidvalidity = status.uidvalidity,
                    "recovering from UID validity invalidation"
                );
                let dropped = ctx.store.delete_message_uids_for_container(container.id).await?;
                debug!(container = %container.name, dropped, "dropped UID bindings");
                container.sync_state.uidnext = None;
                container.sync_state.uidvalidity = None;
            }
        }

        let (processed, skipped) = self.fetch_unseen(ctx, &mut container, current).await?;
        let (flag_changes, removed) =
            self.reconcile_window(ctx, &container, status.uidnext).await?;

        Ok(json!({
            "container": container.name,
            "processed": processed,
            "skipped": skipped,
            "flag_changes": flag_changes,
            "removed": removed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MailConnection;
    use crate::folder::ContainerKind;
    use crate::testkit::{raw_mail, test_store, FakeMailbox, FakeSession};
    use crate::transaction::TransactionEvent;

    async fn run_sync(
        store: &Arc<crate::storage::Store>,
        session: FakeSession,
        container: &Container,
    ) -> serde_json::Value {
        let conn = MailConnection::spawn(Box::new(session), store.clone(), None);
        conn.enqueue(Box::new(SyncContainerOperation::new(
            container,
            SyncPolicy::default(),
            Arc::new(Pipeline::standard()),
        )))
        .await
        .unwrap()
    }

    async fn seeded_inbox(
        store: &Arc<crate::storage::Store>,
    ) -> Container {
        let inbox = Container::new(store.account_id(), "INBOX", ContainerKind::Folder);
        store.save_container(&inbox).await.unwrap();
        inbox
    }

    fn mailbox_with(uids: &[(u32, &str, &str)], uidnext: u32, uidvalidity: u32) -> FakeMailbox {
        let mut mailbox = FakeMailbox::new(uidnext, uidvalidity);
        for (uid, from, subject) in uids {
            mailbox.put(*uid, raw_mail(from, subject, "body text"), MessageFlags::default());
        }
        mailbox
    }

    #[tokio::test]
    async fn test_first_sync_fetches_everything_and_persists_state() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(
                &[(1, "a@x.com", "One"), (2, "b@x.com", "Two")],
                3,
                5,
            ),
        );

        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["processed"], 2);

        let synced = store.container(inbox.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_state.uidnext, Some(3));
        assert_eq!(synced.sync_state.uidvalidity, Some(5));
        assert_eq!(
            store.message_uids_for_container(inbox.id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_unchanged_container_produces_zero_transactions() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "One")], 2, 5),
        );
        run_sync(&store, session, &inbox).await;
        let cursor = store.latest_cursor().await.unwrap();

        // Second pass, remote unchanged: strictly no new transactions.
        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "One")], 2, 5),
        );
        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["processed"], 0);
        assert_eq!(result["flag_changes"], 0);
        assert_eq!(result["removed"], 0);
        assert_eq!(store.latest_cursor().await.unwrap(), cursor);
    }

    #[tokio::test]
    async fn test_incremental_fetch_covers_exactly_the_new_range() {
        let (store, _dir) = test_store();
        let mut inbox = seeded_inbox(&store).await;
        inbox.sync_state.uidnext = Some(100);
        inbox.sync_state.uidvalidity = Some(5);
        store.save_container(&inbox).await.unwrap();

        // Remote advanced to uidnext=105 with five new UIDs 100..=104.
        let new_uids: Vec<(u32, &str, &str)> = vec![
            (100, "a@x.com", "New 100"),
            (101, "a@x.com", "New 101"),
            (102, "a@x.com", "New 102"),
            (103, "a@x.com", "New 103"),
            (104, "a@x.com", "New 104"),
        ];
        let mut session = FakeSession::default();
        session.insert_mailbox("INBOX", mailbox_with(&new_uids, 105, 5));
        let recorder = session.fetch_recorder();

        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["processed"], 5);

        // The full fetch asked for exactly [100, *].
        let full_fetches = recorder.lock().unwrap().clone();
        assert!(full_fetches.contains(&"100:*".to_string()));

        let synced = store.container(inbox.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_state.uidnext, Some(105));
        assert_eq!(synced.sync_state.uidvalidity, Some(5));
    }

    #[tokio::test]
    async fn test_uidvalidity_change_drops_bindings_but_keeps_messages() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "Survivor")], 2, 5),
        );
        run_sync(&store, session, &inbox).await;
        let message_count_before = {
            let bindings = store.message_uids_for_container(inbox.id).await.unwrap();
            assert_eq!(bindings.len(), 1);
            store.message(bindings[0].message_id).await.unwrap().is_some()
        };
        assert!(message_count_before);

        // Same mail, new epoch: the fetch range must become 1:* again.
        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "Survivor")], 2, 6),
        );
        let recorder = session.fetch_recorder();
        run_sync(&store, session, &inbox).await;

        assert!(recorder.lock().unwrap().contains(&"1:*".to_string()));
        let synced = store.container(inbox.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_state.uidvalidity, Some(6));

        // The message survived (deduplicated by content hash) and was
        // re-bound under the new epoch.
        let bindings = store.message_uids_for_container(inbox.id).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert!(store.message(bindings[0].message_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_vanished_uid_removes_binding_not_message() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "Stays"), (2, "b@x.com", "Goes")], 3, 5),
        );
        run_sync(&store, session, &inbox).await;
        let gone_message = store
            .message_uids_for_container(inbox.id)
            .await
            .unwrap()
            .into_iter()
            .find(|b| b.uid == 2)
            .unwrap()
            .message_id;

        // UID 2 disappears remotely; uidnext does not move.
        let mut session = FakeSession::default();
        session.insert_mailbox(
            "INBOX",
            mailbox_with(&[(1, "a@x.com", "Stays")], 3, 5),
        );
        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["removed"], 1);

        let bindings = store.message_uids_for_container(inbox.id).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].uid, 1);
        assert!(store.message(gone_message).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flag_change_updates_message_and_thread_counters() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut mailbox = FakeMailbox::new(2, 5);
        mailbox.put(
            1,
            raw_mail("a@x.com", "Flagged later", "body"),
            MessageFlags { unread: true, starred: false },
        );
        let mut session = FakeSession::default();
        session.insert_mailbox("INBOX", mailbox);
        run_sync(&store, session, &inbox).await;

        let binding = store.message_uids_for_container(inbox.id).await.unwrap()[0].clone();
        let thread_id = store
            .message(binding.message_id)
            .await
            .unwrap()
            .unwrap()
            .thread_id
            .unwrap();
        assert_eq!(store.thread(thread_id).await.unwrap().unwrap().unread_count, 1);

        // Remotely mark read + starred.
        let mut mailbox = FakeMailbox::new(2, 5);
        mailbox.put(
            1,
            raw_mail("a@x.com", "Flagged later", "body"),
            MessageFlags { unread: false, starred: true },
        );
        let mut session = FakeSession::default();
        session.insert_mailbox("INBOX", mailbox);
        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["flag_changes"], 1);

        let message = store.message(binding.message_id).await.unwrap().unwrap();
        assert!(!message.flags.unread);
        assert!(message.flags.starred);

        let thread = store.thread(thread_id).await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 0);
        assert_eq!(thread.starred_count, 1);
    }

    #[tokio::test]
    async fn test_empty_container_persists_initial_state() {
        let (store, _dir) = test_store();
        let inbox = seeded_inbox(&store).await;

        let mut session = FakeSession::default();
        session.insert_mailbox("INBOX", FakeMailbox::new(1, 7));
        let result = run_sync(&store, session, &inbox).await;
        assert_eq!(result["processed"], 0);

        let synced = store.container(inbox.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_state.uidnext, Some(1));
        assert_eq!(synced.sync_state.uidvalidity, Some(7));

        // Only the state change itself was logged.
        let log = store.transactions_after(0, 100).await.unwrap();
        assert!(log
            .iter()
            .all(|t| t.object_type == "folder" || t.event != TransactionEvent::Delete));
    }
}
