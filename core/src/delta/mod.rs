//! Delta stream: resumable, ordered change feed
//!
//! Two producers feed one deduplicating merge: a paged catch-up query for
//! everything past the consumer's cursor, and the live notice channel. The
//! pump only ever moves `last_id` forward and re-queries the log on every
//! notice, so each transaction id is delivered exactly once, in increasing
//! order, even when a notice races the catch-up or the broadcast channel
//! lags. Payloads are inflated to the object's *current* attributes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::DeltaSettings;
use crate::error::HeimdallResult;
use crate::storage::Store;
use crate::transaction::{Transaction, TransactionEvent, TransactionNotice};

/// One inflated transaction, in the wire shape the HTTP layer writes as a
/// JSON line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    /// Transaction id; consumers resume from the last one they saw
    pub cursor: i64,
    pub account_id: Uuid,
    pub event: TransactionEvent,
    pub object: String,
    pub object_id: String,
    pub changed_fields: Vec<String>,
    /// Current attributes of the object; absent on deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

/// What a consumer reads off the stream
#[derive(Debug, Clone)]
pub enum DeltaEvent {
    Transaction(DeltaPayload),
    /// Emitted periodically so idle connections are distinguishable from
    /// dead ones; rendered as a bare newline on the wire
    Heartbeat,
}

/// Builds resumable delta streams over one account's store
pub struct DeltaStreamBuilder {
    store: Arc<Store>,
    settings: DeltaSettings,
}

impl DeltaStreamBuilder {
    pub fn new(store: Arc<Store>, settings: DeltaSettings) -> Self {
        Self { store, settings }
    }

    /// Highest committed transaction id; new consumers use this to decide
    /// whether to catch up at all
    pub async fn latest_cursor(&self) -> HeimdallResult<i64> {
        self.store.latest_cursor().await
    }

    /// Open a stream of everything after `cursor`, merged with live
    /// changes. The stream ends after the configured max lifetime;
    /// consumers reconnect and resume from the last delivered cursor.
    pub fn build(&self, cursor: i64) -> DeltaStream {
        let (tx, rx) = mpsc::channel(64);
        // Subscribe before the catch-up query so nothing can fall between.
        let notices = self.store.publisher().subscribe();
        let task = tokio::spawn(pump(self.store.clone(), self.settings.clone(), cursor, notices, tx));
        DeltaStream { inner: ReceiverStream::new(rx), task }
    }
}

/// A live subscription. Dropping it cancels the pump task, releasing the
/// catch-up query and the channel subscription.
pub struct DeltaStream {
    inner: ReceiverStream<DeltaEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl DeltaStream {
    pub async fn recv(&mut self) -> Option<DeltaEvent> {
        use futures::StreamExt;
        self.inner.next().await
    }
}

impl Stream for DeltaStream {
    type Item = DeltaEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn inflate(store: &Store, transaction: Transaction) -> HeimdallResult<DeltaPayload> {
    let attributes = match transaction.event {
        TransactionEvent::Delete => None,
        _ => {
            store
                .object_snapshot(&transaction.object_type, &transaction.object_id)
                .await?
        }
    };
    Ok(DeltaPayload {
        cursor: transaction.id,
        account_id: transaction.account_id,
        event: transaction.event,
        object: transaction.object_type,
        object_id: transaction.object_id,
        changed_fields: transaction.changed_fields,
        attributes,
    })
}

/// Deliver every transaction past `last_id`, in order, advancing the cursor
async fn deliver_after(
    store: &Store,
    settings: &DeltaSettings,
    last_id: &mut i64,
    tx: &mpsc::Sender<DeltaEvent>,
) -> Result<(), ()> {
    loop {
        let batch = store
            .transactions_after(*last_id, settings.catchup_page_size)
            .await
            .map_err(|err| error!(error = %err, "delta catch-up query failed"))?;
        if batch.is_empty() {
            return Ok(());
        }
        for transaction in batch {
            let payload = inflate(store, transaction)
                .await
                .map_err(|err| error!(error = %err, "delta inflation failed"))?;
            *last_id = payload.cursor;
            if tx.send(DeltaEvent::Transaction(payload)).await.is_err() {
                return Err(());
            }
        }
    }
}

async fn pump(
    store: Arc<Store>,
    settings: DeltaSettings,
    cursor: i64,
    mut notices: broadcast::Receiver<TransactionNotice>,
    tx: mpsc::Sender<DeltaEvent>,
) {
    let mut last_id = cursor;
    let deadline = tokio::time::Instant::now() + settings.max_stream_lifetime();
    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    if deliver_after(&store, &settings, &mut last_id, &tx).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                debug!(last_id, "delta stream reached max lifetime");
                return;
            }
            _ = heartbeat.tick() => {
                if tx.send(DeltaEvent::Heartbeat).await.is_err() {
                    return;
                }
            }
            notice = notices.recv() => {
                match notice {
                    // Anything at or below last_id already went out during
                    // catch-up; the re-query keeps the race window safe.
                    Ok(notice) if notice.id <= last_id => {}
                    Ok(_) => {
                        if deliver_after(&store, &settings, &mut last_id, &tx).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "delta subscriber lagged; re-querying");
                        if deliver_after(&store, &settings, &mut last_id, &tx).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
