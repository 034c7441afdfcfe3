//! Heimdall Mail Core Library
//!
//! This crate contains the mail synchronization engine:
//! - Connection actors with a strictly serialized operation queue per account
//! - The mailbox delta-sync algorithm (UID reconciliation and recovery)
//! - The message processing pipeline and thread aggregation
//! - The transaction log and the resumable delta stream
//! - The syncback task queue for write-back operations

pub mod account;
pub mod config;
pub mod connection;
pub mod delta;
pub mod error;
pub mod folder;
pub mod message;
pub mod pipeline;
pub mod storage;
pub mod sync;
pub mod syncback;
pub mod thread;
pub mod transaction;

#[cfg(test)]
pub mod testkit;

// Re-export commonly used types
pub use account::{Account, AccountStatus, SyncPolicy};
pub use config::{DeltaSettings, SyncSettings};
pub use connection::{
    Capabilities, ImapSessionFactory, MailConnection, MailTransport, Operation, RemoteSession,
    SessionFactory, SmtpMailTransport,
};
pub use delta::{DeltaEvent, DeltaPayload, DeltaStream, DeltaStreamBuilder};
pub use error::{HeimdallError, HeimdallResult};
pub use folder::{Container, ContainerKind, ContainerRole};
pub use message::{Message, MessageFlags, MessageUid, Participant};
pub use pipeline::Pipeline;
pub use storage::{SharedStore, StorageManager, Store};
pub use sync::SyncWorker;
pub use syncback::{
    enqueue_request, SyncbackKind, SyncbackRequest, SyncbackStatus, SyncbackWorker,
};
pub use thread::Thread;
pub use transaction::{Transaction, TransactionEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Heimdall Mail";
