//! Syncback: write-back requests and the per-account worker
//!
//! A syncback request is a queued intent to mutate remote state. Requests
//! run strictly serially per account, on the same connection queue mailbox
//! sync uses, and every status change is transaction-logged like any other
//! model mutation.

pub mod tasks;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::connection::MailConnection;
use crate::error::HeimdallResult;
use crate::storage::Store;

/// The write-back operations the engine supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncbackKind {
    SendMessage,
    MoveMessage,
    SetLabels,
    EnsureInSentFolder,
    DeleteMessage,
}

impl SyncbackKind {
    /// Whether running this task can change the remote UID of the message
    /// it touches. Two such tasks for the same message must not run in the
    /// same round, or the second would address a stale UID.
    pub fn affects_message_uids(&self) -> bool {
        matches!(self, SyncbackKind::MoveMessage | SyncbackKind::DeleteMessage)
    }
}

impl std::fmt::Display for SyncbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncbackKind::SendMessage => write!(f, "SendMessage"),
            SyncbackKind::MoveMessage => write!(f, "MoveMessage"),
            SyncbackKind::SetLabels => write!(f, "SetLabels"),
            SyncbackKind::EnsureInSentFolder => write!(f, "EnsureInSentFolder"),
            SyncbackKind::DeleteMessage => write!(f, "DeleteMessage"),
        }
    }
}

/// Request lifecycle. RETRYABLE means no remote side effect has been
/// confirmed yet; once a task crosses that line it flips to NOTRETRYABLE
/// and a failure afterwards must never be silently retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncbackStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "INPROGRESS-RETRYABLE")]
    InProgressRetryable,
    #[serde(rename = "INPROGRESS-NOTRETRYABLE")]
    InProgressNotRetryable,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl SyncbackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncbackStatus::Succeeded | SyncbackStatus::Failed)
    }
}

/// Structured failure report on a terminal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncbackError {
    pub message: String,
    /// Whether the caller may resubmit an equivalent request
    pub retryable: bool,
}

/// One queued write-back intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncbackRequest {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: SyncbackKind,
    pub props: serde_json::Value,
    pub status: SyncbackStatus,
    /// Type-specific result payload on success
    pub response: Option<serde_json::Value>,
    pub error: Option<SyncbackError>,
    pub created_at: OffsetDateTime,
}

impl SyncbackRequest {
    pub fn new(account_id: Uuid, kind: SyncbackKind, props: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            props,
            status: SyncbackStatus::New,
            response: None,
            error: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// NEW -> INPROGRESS-RETRYABLE
    pub fn mark_in_progress(&mut self) {
        self.status = SyncbackStatus::InProgressRetryable;
    }

    /// A remote side effect is about to happen (or may have happened)
    pub fn mark_not_retryable(&mut self) {
        self.status = SyncbackStatus::InProgressNotRetryable;
    }

    pub fn succeed(&mut self, response: serde_json::Value) {
        self.status = SyncbackStatus::Succeeded;
        self.response = Some(response);
        self.error = None;
    }

    pub fn fail(&mut self, message: impl Into<String>, retryable: bool) {
        self.status = SyncbackStatus::Failed;
        self.error = Some(SyncbackError { message: message.into(), retryable });
    }

    /// The message this request touches, when its props name one
    pub fn message_id(&self) -> Option<Uuid> {
        self.props
            .get("message_id")
            .and_then(|v| v.as_str())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Submit a new request; its status is retrievable by id afterwards
pub async fn enqueue_request(
    store: &Store,
    kind: SyncbackKind,
    props: serde_json::Value,
) -> HeimdallResult<SyncbackRequest> {
    let request = SyncbackRequest::new(store.account_id(), kind, props);
    store.save_syncback_request(&request).await?;
    Ok(request)
}

/// Drains NEW requests for one account, serially, via the connection queue
pub struct SyncbackWorker {
    store: Arc<Store>,
    connection: MailConnection,
    batch_limit: usize,
}

impl SyncbackWorker {
    pub fn new(store: Arc<Store>, connection: MailConnection, batch_limit: usize) -> Self {
        Self { store, connection, batch_limit }
    }

    /// Run every runnable NEW request once, oldest first. Of several
    /// UID-affecting tasks for the same message, only the first runs this
    /// round; the rest wait for a sync pass to refresh UID state.
    pub async fn run_pending(&self) -> HeimdallResult<usize> {
        let requests = self
            .store
            .syncback_requests_with_status(SyncbackStatus::New, self.batch_limit)
            .await?;
        if requests.is_empty() {
            return Ok(0);
        }

        let mut touched_messages: HashSet<Uuid> = HashSet::new();
        let mut ran = 0;
        for request in requests {
            if request.kind.affects_message_uids() {
                if let Some(message_id) = request.message_id() {
                    if !touched_messages.insert(message_id) {
                        info!(
                            request_id = %request.id,
                            kind = %request.kind,
                            "deferring task; another task already touched this message's UID"
                        );
                        continue;
                    }
                }
            }
            self.run_one(request).await?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Drive one request through its status machine. The outcome is always
    /// reported, even when persisting it afterwards fails.
    pub async fn run_one(&self, mut request: SyncbackRequest) -> HeimdallResult<SyncbackRequest> {
        info!(request_id = %request.id, kind = %request.kind, "running syncback task");

        request.mark_in_progress();
        self.store.save_syncback_request(&request).await?;

        let task = tasks::build(&request)?;
        let outcome = self.connection.enqueue(task).await;

        // The task may have flipped the request to NOTRETRYABLE mid-flight;
        // pick up the persisted state before recording the outcome.
        if let Some(current) = self.store.syncback_request(request.id).await? {
            request = current;
        }

        match outcome {
            Ok(response) => {
                info!(request_id = %request.id, kind = %request.kind, "syncback task succeeded");
                request.succeed(response);
            }
            Err(err) => {
                let retryable = request.status != SyncbackStatus::InProgressNotRetryable
                    && err.is_retryable_syncback();
                warn!(
                    request_id = %request.id,
                    kind = %request.kind,
                    error = %err,
                    retryable,
                    "syncback task failed"
                );
                request.fail(err.to_string(), retryable);
            }
        }

        if let Err(save_err) = self.store.save_syncback_request(&request).await {
            // Never mask the outcome behind a bookkeeping failure.
            error!(
                request_id = %request.id,
                error = %save_err,
                "failed to persist syncback outcome; reporting it anyway"
            );
        }
        Ok(request)
    }
}
