//! One connection per account, one operation at a time
//!
//! The protocol session is not safely reentrant, so it lives inside an actor
//! task that owns it outright. Everything that wants the session, mailbox
//! sync and syncback alike, goes through [`MailConnection::enqueue`] and
//! runs strictly in FIFO order. A failed operation rejects only its own
//! future; a transport-fatal error rejects everything still queued and stops
//! the actor, leaving reconnection to the owner.

pub mod imap;
pub mod session;
pub mod smtp;

pub use imap::ImapSession;
pub use session::{
    Capabilities, ContainerStatus, FetchedMessage, RemoteContainerInfo, RemoteSession,
    SessionEvent, UidAttributes, UidSet,
};
pub use smtp::{MailTransport, SmtpMailTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::error::{HeimdallError, HeimdallResult};
use crate::storage::Store;

/// Dials a fresh session for an account. The seam the sync worker uses to
/// reconnect after a transport-fatal error.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, account: &Account) -> HeimdallResult<Box<dyn RemoteSession>>;
}

/// Production factory: IMAP over TLS with bounded per-call timeouts
pub struct ImapSessionFactory {
    pub timeout: Duration,
}

#[async_trait]
impl SessionFactory for ImapSessionFactory {
    async fn connect(&self, account: &Account) -> HeimdallResult<Box<dyn RemoteSession>> {
        let session = ImapSession::connect(&account.connection_settings, self.timeout).await?;
        Ok(Box::new(session))
    }
}

/// Everything an operation may touch while it holds the session
pub struct OperationContext<'a> {
    pub session: &'a mut dyn RemoteSession,
    pub store: &'a Store,
    pub transport: Option<&'a dyn MailTransport>,
}

/// A unit of work serialized onto the connection
#[async_trait]
pub trait Operation: Send {
    /// Human-readable description for logs
    fn description(&self) -> String;

    /// Run against the live session. The returned JSON is handed back to
    /// whoever enqueued the operation.
    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value>;
}

struct QueuedOperation {
    op: Box<dyn Operation>,
    reply: oneshot::Sender<HeimdallResult<serde_json::Value>>,
}

/// Handle to the per-account connection actor. Clones share the same queue.
#[derive(Clone)]
pub struct MailConnection {
    queue: mpsc::Sender<QueuedOperation>,
    events: broadcast::Sender<SessionEvent>,
}

impl MailConnection {
    /// Spawn the actor that owns `session`. The actor runs until every
    /// handle is dropped or a transport-fatal error ends the session.
    pub fn spawn(
        session: Box<dyn RemoteSession>,
        store: Arc<Store>,
        transport: Option<Arc<dyn MailTransport>>,
    ) -> Self {
        let (queue, rx) = mpsc::channel::<QueuedOperation>(64);
        let (events, _) = broadcast::channel(64);

        let event_tx = events.clone();
        tokio::spawn(run_actor(session, store, transport, rx, event_tx));

        Self { queue, events }
    }

    /// Queue an operation and wait for its result. Operations run one at a
    /// time in submission order.
    pub async fn enqueue(&self, op: Box<dyn Operation>) -> HeimdallResult<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(QueuedOperation { op, reply })
            .await
            .map_err(|_| HeimdallError::SessionClosed)?;
        rx.await.map_err(|_| HeimdallError::SessionClosed)?
    }

    /// Session-level events (new mail, external flag changes)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

async fn run_actor(
    mut session: Box<dyn RemoteSession>,
    store: Arc<Store>,
    transport: Option<Arc<dyn MailTransport>>,
    mut rx: mpsc::Receiver<QueuedOperation>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(mut queued) = rx.recv().await {
        let description = queued.op.description();
        debug!(operation = %description, "running connection operation");

        let result = {
            let mut ctx = OperationContext {
                session: session.as_mut(),
                store: store.as_ref(),
                transport: transport.as_deref(),
            };
            queued.op.run(&mut ctx).await
        };

        for event in session.poll_events() {
            let _ = events.send(event);
        }

        match result {
            Ok(value) => {
                info!(operation = %description, "connection operation finished");
                let _ = queued.reply.send(Ok(value));
            }
            Err(err) if err.is_transport_error() => {
                error!(
                    operation = %description,
                    error = %err,
                    "connection operation failed fatally; rejecting queued operations"
                );
                let _ = queued.reply.send(Err(err));
                rx.close();
                while let Some(pending) = rx.recv().await {
                    let _ = pending.reply.send(Err(HeimdallError::SessionClosed));
                }
                break;
            }
            Err(err) => {
                warn!(operation = %description, error = %err, "connection operation errored");
                let _ = queued.reply.send(Err(err));
            }
        }
    }

    if let Err(err) = session.close().await {
        debug!(error = %err, "session close failed");
    }
}
