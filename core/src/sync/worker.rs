//! Per-account sync worker
//!
//! One worker per account drives the full pass: container discovery, one
//! sync operation per container, then a syncback round. Everything goes
//! through the account's single connection queue, so none of it interleaves
//! with anything else touching the session. Accounts are fully independent
//! of each other.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::account::Account;
use crate::connection::{MailConnection, MailTransport, SessionFactory};
use crate::error::HeimdallResult;
use crate::pipeline::Pipeline;
use crate::storage::{SharedStore, Store};
use crate::syncback::SyncbackWorker;

use super::folder_list::FetchContainerListOperation;
use super::mailbox_sync::SyncContainerOperation;

pub struct SyncWorker {
    account: Account,
    store: Arc<Store>,
    shared: Arc<SharedStore>,
    factory: Arc<dyn SessionFactory>,
    transport: Option<Arc<dyn MailTransport>>,
    pipeline: Arc<Pipeline>,
    connection: Option<MailConnection>,
    syncback_batch_limit: usize,
}

impl SyncWorker {
    pub fn new(
        account: Account,
        store: Arc<Store>,
        shared: Arc<SharedStore>,
        factory: Arc<dyn SessionFactory>,
        transport: Option<Arc<dyn MailTransport>>,
        syncback_batch_limit: usize,
    ) -> Self {
        Self {
            account,
            store,
            shared,
            factory,
            transport,
            pipeline: Arc::new(Pipeline::standard()),
            connection: None,
            syncback_batch_limit,
        }
    }

    /// The live connection, dialing a fresh session when there is none
    async fn connection(&mut self) -> HeimdallResult<MailConnection> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }
        info!(account = %self.account.email, "connecting");
        let session = self.factory.connect(&self.account).await?;
        let connection =
            MailConnection::spawn(session, self.store.clone(), self.transport.clone());
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// One full pass: discovery, per-container sync, syncback round
    pub async fn run_once(&mut self) -> HeimdallResult<()> {
        let connection = self.connection().await?;
        let result = self.sync_pass(&connection).await;
        if let Err(err) = &result {
            if err.is_transport_error() {
                // The actor is gone with the session; reconnect next round
                // and resubmit. Completed containers committed their state,
                // so the retry is incremental.
                self.connection = None;
            }
        }
        result
    }

    async fn sync_pass(&self, connection: &MailConnection) -> HeimdallResult<()> {
        connection.enqueue(Box::new(FetchContainerListOperation)).await?;

        for container in self.store.containers().await? {
            connection
                .enqueue(Box::new(SyncContainerOperation::new(
                    &container,
                    self.account.sync_policy.clone(),
                    self.pipeline.clone(),
                )))
                .await?;
        }

        let syncback = SyncbackWorker::new(
            self.store.clone(),
            connection.clone(),
            self.syncback_batch_limit,
        );
        let ran = syncback.run_pending().await?;
        if ran > 0 {
            debug!(account = %self.account.email, ran, "ran syncback tasks");
        }
        Ok(())
    }

    /// Run forever: a pass per interval, woken early by session events
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.account.sync_policy.interval_secs.max(1));
        loop {
            match self.run_once().await {
                Ok(()) => self.account.mark_synced(),
                Err(err) => {
                    error!(account = %self.account.email, error = %err, "sync pass failed");
                    self.account.mark_sync_error(err.to_string());
                }
            }
            if let Err(err) = self.shared.save_account(&self.account).await {
                error!(account = %self.account.email, error = %err, "failed to record sync status");
            }

            match self.connection.as_ref().map(|c| c.subscribe_events()) {
                Some(mut events) => {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        event = events.recv() => {
                            if let Ok(event) = event {
                                debug!(account = %self.account.email, ?event, "woken by session event");
                            }
                        }
                    }
                }
                None => tokio::time::sleep(interval).await,
            }
        }
    }
}
