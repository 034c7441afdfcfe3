//! Heimdall sync daemon
//!
//! Enumerates accounts from the shared store and runs one sync worker per
//! account until interrupted. Accounts sync fully independently.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use heimdall_core::{
    ImapSessionFactory, MailTransport, SmtpMailTransport, StorageManager, SyncSettings,
    SyncWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => SyncSettings::load(&PathBuf::from(path)).context("loading settings")?,
        None => SyncSettings::default(),
    };
    info!(data_dir = %settings.data_dir.display(), "starting heimdall daemon v{}", heimdall_core::VERSION);

    let storage = StorageManager::open(settings.data_dir.clone()).context("opening storage")?;
    let shared = storage.shared();
    let accounts = shared.accounts().await.context("enumerating accounts")?;
    if accounts.is_empty() {
        info!("no accounts configured; nothing to sync");
        return Ok(());
    }

    let factory = Arc::new(ImapSessionFactory { timeout: settings.operation_timeout() });

    let mut workers = Vec::new();
    for account in accounts {
        let store = storage.store_for_account(account.id).await?;
        let transport: Option<Arc<dyn MailTransport>> =
            match SmtpMailTransport::connect(&account.connection_settings) {
                Ok(transport) => Some(Arc::new(transport)),
                Err(err) => {
                    warn!(account = %account.email, error = %err, "no message transport; send tasks will fail retryable");
                    None
                }
            };

        info!(account = %account.email, "starting sync worker");
        let worker = SyncWorker::new(
            account,
            store,
            shared.clone(),
            factory.clone(),
            transport,
            settings.syncback_batch_limit,
        );
        workers.push(tokio::spawn(worker.run()));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
