//! Syncback task implementations
//!
//! Each task is a connection [`Operation`], so it runs serialized with
//! mailbox sync on the account's single session. Tasks use the container
//! primitives only; provider differences (label-based "delete" is really
//! "move out of All Mail and flag in Trash") branch on capabilities.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::Address;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::connection::{Operation, OperationContext};
use crate::error::{HeimdallError, HeimdallResult};
use crate::folder::{Container, ContainerRole};
use crate::message::{Message, MessageFlags, MessageUid, Participant};
use crate::storage::Store;

use super::{SyncbackKind, SyncbackRequest};

/// Build the runnable task for a request
pub fn build(request: &SyncbackRequest) -> HeimdallResult<Box<dyn Operation>> {
    Ok(match request.kind {
        SyncbackKind::SendMessage => Box::new(SendMessageTask {
            request: request.clone(),
            props: serde_json::from_value(request.props.clone())?,
        }),
        SyncbackKind::MoveMessage => Box::new(MoveMessageTask {
            request: request.clone(),
            props: serde_json::from_value(request.props.clone())?,
        }),
        SyncbackKind::SetLabels => Box::new(SetLabelsTask {
            request: request.clone(),
            props: serde_json::from_value(request.props.clone())?,
        }),
        SyncbackKind::EnsureInSentFolder => Box::new(EnsureInSentFolderTask {
            request: request.clone(),
            props: serde_json::from_value(request.props.clone())?,
        }),
        SyncbackKind::DeleteMessage => Box::new(DeleteMessageTask {
            request: request.clone(),
            props: serde_json::from_value(request.props.clone())?,
        }),
    })
}

/// Resolve a message, the folder it lives in, and its UID binding
async fn locate(
    store: &Store,
    message_id: Uuid,
) -> HeimdallResult<(Message, Container, MessageUid)> {
    let message = store
        .message(message_id)
        .await?
        .ok_or_else(|| HeimdallError::not_found(format!("message {message_id}")))?;
    let folder_id = message
        .folder_id
        .ok_or_else(|| HeimdallError::invalid_state("message has no folder"))?;
    let container = store
        .container(folder_id)
        .await?
        .ok_or_else(|| HeimdallError::not_found(format!("container {folder_id}")))?;
    let binding = store
        .message_uids_for_container(folder_id)
        .await?
        .into_iter()
        .find(|b| b.message_id == message_id)
        .ok_or_else(|| {
            HeimdallError::invalid_state("message has no UID binding; wait for the next sync pass")
        })?;
    Ok((message, container, binding))
}

fn mailbox_for(participant: &Participant) -> HeimdallResult<Mailbox> {
    let address: Address = participant.email.parse()?;
    Ok(Mailbox::new(participant.name.clone(), address))
}

/// Render a stored message back into RFC 2822 bytes
fn message_to_mime(message: &Message) -> HeimdallResult<Vec<u8>> {
    let from = message
        .from
        .first()
        .ok_or_else(|| HeimdallError::invalid_state("message has no sender"))?;
    let mut builder = lettre::Message::builder()
        .from(mailbox_for(from)?)
        .subject(message.subject.clone());
    for recipient in &message.to {
        builder = builder.to(mailbox_for(recipient)?);
    }
    for recipient in &message.cc {
        builder = builder.cc(mailbox_for(recipient)?);
    }
    let rendered = builder.body(message.body.clone())?;
    Ok(rendered.formatted())
}

// Send

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageProps {
    pub message: SendMessagePayload,
}

struct SendMessageTask {
    request: SyncbackRequest,
    props: SendMessageProps,
}

impl SendMessageTask {
    fn render_for_recipient(&self, recipient: &str) -> HeimdallResult<Vec<u8>> {
        let payload = &self.props.message;
        let sender: Address = payload.from.parse()?;
        let rcpt: Address = recipient.parse()?;
        // One delivery per recipient so content can vary per recipient and
        // a bounce attributes to exactly one address.
        let rendered = lettre::Message::builder()
            .from(Mailbox::new(None, sender))
            .to(Mailbox::new(None, rcpt))
            .subject(payload.subject.clone())
            .body(payload.body.clone())?;
        Ok(rendered.formatted())
    }

    fn local_sent_copy(&self, sent_folder: Option<Uuid>, account_id: Uuid) -> Message {
        let payload = &self.props.message;
        let now = OffsetDateTime::now_utc();
        let header_message_id = Some(format!("<{}@heimdall>", Uuid::new_v4()));
        let from = vec![Participant::new(None, &payload.from)];
        let content_hash = Message::hash_for_headers(
            header_message_id.as_deref(),
            &payload.subject,
            &from,
            now,
        );
        Message {
            id: Uuid::new_v4(),
            account_id,
            content_hash,
            subject: payload.subject.clone(),
            snippet: payload.body.chars().take(100).collect(),
            body: payload.body.clone(),
            header_message_id,
            in_reply_to: None,
            references: Vec::new(),
            remote_thread_id: None,
            date: now,
            from,
            to: payload.to.iter().map(|a| Participant::new(None, a)).collect(),
            cc: payload.cc.iter().map(|a| Participant::new(None, a)).collect(),
            bcc: payload.bcc.iter().map(|a| Participant::new(None, a)).collect(),
            flags: MessageFlags { unread: false, starred: false },
            folder_id: sent_folder,
            label_ids: Vec::new(),
            thread_id: None,
            processed_version: 0,
            created_at: now,
        }
    }
}

#[async_trait]
impl Operation for SendMessageTask {
    fn description(&self) -> String {
        format!("SendMessage (request {})", self.request.id)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let transport = ctx
            .transport
            .ok_or_else(|| HeimdallError::syncback_retryable("no message transport configured"))?;

        let recipients: Vec<String> = self
            .props
            .message
            .to
            .iter()
            .chain(self.props.message.cc.iter())
            .chain(self.props.message.bcc.iter())
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Err(HeimdallError::syncback_retryable("send task has no recipients"));
        }

        // The transport is about to see the message; from here on a retry
        // could double-deliver, so the request stops being retryable.
        let mut request = self.request.clone();
        request.mark_not_retryable();
        ctx.store.save_syncback_request(&request).await?;

        let mut failed_recipients = Vec::new();
        for recipient in &recipients {
            let mime = self.render_for_recipient(recipient)?;
            if let Err(err) = transport
                .send_raw(&self.props.message.from, recipient, &mime)
                .await
            {
                warn!(recipient = %recipient, error = %err, "delivery failed for recipient");
                failed_recipients.push(recipient.clone());
            }
        }

        if failed_recipients.len() == recipients.len() {
            return Err(HeimdallError::syncback_fatal(
                "delivery failed for all recipients",
            ));
        }

        // Persist the local copy now; the sync loop re-discovers the real
        // delivered message later and dedups it by content hash.
        let sent_folder = ctx
            .store
            .container_with_role(ContainerRole::Sent)
            .await?
            .map(|c| c.id);
        let local = self.local_sent_copy(sent_folder, ctx.store.account_id());
        ctx.store.save_message(&local).await?;

        Ok(serde_json::json!({
            "message_id": local.id,
            "failed_recipients": failed_recipients,
        }))
    }
}

// Move

#[derive(Debug, Clone, Deserialize)]
pub struct MoveMessageProps {
    pub message_id: Uuid,
    pub target_container_id: Uuid,
}

struct MoveMessageTask {
    request: SyncbackRequest,
    props: MoveMessageProps,
}

#[async_trait]
impl Operation for MoveMessageTask {
    fn description(&self) -> String {
        format!("MoveMessage (request {})", self.request.id)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let (mut message, folder, binding) = locate(ctx.store, self.props.message_id).await?;
        let target = ctx
            .store
            .container(self.props.target_container_id)
            .await?
            .ok_or_else(|| HeimdallError::not_found("target container"))?;

        if target.id == folder.id {
            return Ok(serde_json::json!({"moved": false}));
        }

        ctx.session.open_container(&folder.name).await?;
        ctx.session.move_uid(binding.uid, &target.name).await?;

        // The message gets a fresh UID in the target container; the next
        // sync pass of that container binds it again.
        ctx.store.delete_message_uid(folder.id, binding.uid).await?;
        message.folder_id = Some(target.id);
        ctx.store.save_message(&message).await?;

        Ok(serde_json::json!({"moved": true, "target": target.name}))
    }
}

// Labels

#[derive(Debug, Clone, Deserialize)]
pub struct SetLabelsProps {
    pub message_id: Uuid,
    pub label_ids: Vec<Uuid>,
}

struct SetLabelsTask {
    request: SyncbackRequest,
    props: SetLabelsProps,
}

#[async_trait]
impl Operation for SetLabelsTask {
    fn description(&self) -> String {
        format!("SetLabels (request {})", self.request.id)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        if !ctx.session.capabilities().labels {
            return Err(HeimdallError::invalid_state(
                "account's provider has no per-message labels",
            ));
        }
        let (mut message, folder, binding) = locate(ctx.store, self.props.message_id).await?;

        let mut labels = Vec::new();
        for label_id in &self.props.label_ids {
            let container = ctx
                .store
                .container(*label_id)
                .await?
                .ok_or_else(|| HeimdallError::not_found(format!("label {label_id}")))?;
            labels.push(container.name);
        }

        ctx.session.open_container(&folder.name).await?;
        ctx.session.set_labels(binding.uid, &labels).await?;

        message.label_ids = self.props.label_ids.clone();
        ctx.store.save_message(&message).await?;

        Ok(serde_json::json!({"labels": labels}))
    }
}

// Ensure-in-sent

#[derive(Debug, Clone, Deserialize)]
pub struct EnsureInSentFolderProps {
    pub message_id: Uuid,
}

struct EnsureInSentFolderTask {
    request: SyncbackRequest,
    props: EnsureInSentFolderProps,
}

#[async_trait]
impl Operation for EnsureInSentFolderTask {
    fn description(&self) -> String {
        format!("EnsureInSentFolder (request {})", self.request.id)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let message = ctx
            .store
            .message(self.props.message_id)
            .await?
            .ok_or_else(|| HeimdallError::not_found("message"))?;
        let mime = message_to_mime(&message)?;

        if ctx.session.capabilities().labels {
            // Label-based providers file sent mail as All Mail + sent label.
            let all = ctx
                .store
                .container_with_role(ContainerRole::All)
                .await?
                .ok_or_else(|| HeimdallError::syncback_retryable("no all-mail container"))?;
            ctx.session.append(&all.name, &mime).await?;
            if let Some(header) = &message.header_message_id {
                ctx.session.open_container(&all.name).await?;
                let uids = ctx.session.search_header("Message-ID", header).await?;
                if let Some(uid) = uids.first() {
                    ctx.session.set_labels(*uid, &["\\Sent".to_string()]).await?;
                    ctx.session.add_flags(*uid, &["\\Seen"]).await?;
                }
            }
        } else {
            let sent = ctx
                .store
                .container_with_role(ContainerRole::Sent)
                .await?
                .ok_or_else(|| HeimdallError::syncback_retryable("no sent container"))?;
            ctx.session.append(&sent.name, &mime).await?;
            if let Some(header) = &message.header_message_id {
                ctx.session.open_container(&sent.name).await?;
                let uids = ctx.session.search_header("Message-ID", header).await?;
                if let Some(uid) = uids.first() {
                    ctx.session.add_flags(*uid, &["\\Seen"]).await?;
                }
            }
        }

        Ok(serde_json::json!({"ensured": true}))
    }
}

// Delete

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteMessageProps {
    pub message_id: Uuid,
}

struct DeleteMessageTask {
    request: SyncbackRequest,
    props: DeleteMessageProps,
}

#[async_trait]
impl Operation for DeleteMessageTask {
    fn description(&self) -> String {
        format!("DeleteMessage (request {})", self.request.id)
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let (mut message, folder, binding) = locate(ctx.store, self.props.message_id).await?;
        let trash = ctx
            .store
            .container_with_role(ContainerRole::Trash)
            .await?
            .ok_or_else(|| HeimdallError::syncback_retryable("no trash container"))?;

        if ctx.session.capabilities().labels {
            // On label-based providers "delete" means: take the message out
            // of All Mail into Trash, then flag it deleted there.
            if let Some(header) = &message.header_message_id {
                let all = ctx
                    .store
                    .container_with_role(ContainerRole::All)
                    .await?
                    .unwrap_or_else(|| folder.clone());
                ctx.session.open_container(&all.name).await?;
                for uid in ctx.session.search_header("Message-ID", header).await? {
                    ctx.session.move_uid(uid, &trash.name).await?;
                }
                ctx.session.open_container(&trash.name).await?;
                for uid in ctx.session.search_header("Message-ID", header).await? {
                    ctx.session.add_flags(uid, &["\\Deleted"]).await?;
                }
            }
        } else {
            ctx.session.open_container(&folder.name).await?;
            ctx.session.move_uid(binding.uid, &trash.name).await?;
        }

        ctx.store.delete_message_uid(folder.id, binding.uid).await?;
        message.folder_id = Some(trash.id);
        ctx.store.save_message(&message).await?;

        Ok(serde_json::json!({"deleted": true}))
    }
}
