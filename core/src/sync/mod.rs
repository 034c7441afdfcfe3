//! Mailbox synchronization
//!
//! `mailbox_sync` holds the per-container delta-sync algorithm,
//! `folder_list` the container discovery pass, and `worker` the per-account
//! loop that strings them together with the syncback round.

pub mod folder_list;
pub mod mailbox_sync;
pub mod worker;

pub use folder_list::FetchContainerListOperation;
pub use mailbox_sync::SyncContainerOperation;
pub use worker::SyncWorker;
