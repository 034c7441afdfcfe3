//! Per-account store and the shared account registry
//!
//! Every mutator on [`Store`] follows the same discipline: diff the new
//! state against what is on disk, skip the write entirely when nothing
//! changed, and otherwise commit the row together with its Transaction
//! record in one SQLite transaction. The notice goes out on the account
//! channel only after the commit, so consumers can never observe a change
//! without its transaction or vice versa.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::account::Account;
use crate::error::{HeimdallError, HeimdallResult};
use crate::folder::{Container, ContainerKind, ContainerRole};
use crate::message::{Message, MessageUid};
use crate::storage::migrations::{run_migrations, ACCOUNT_MIGRATIONS, SHARED_MIGRATIONS};
use crate::syncback::{SyncbackRequest, SyncbackStatus};
use crate::thread::Thread;
use crate::transaction::{
    changed_fields, Transaction, TransactionEvent, TransactionNotice, TransactionPublisher,
};

/// Object type tags used in the transaction log
pub mod object_types {
    pub const MESSAGE: &str = "message";
    pub const THREAD: &str = "thread";
    pub const FOLDER: &str = "folder";
    pub const LABEL: &str = "label";
    pub const SYNCBACK_REQUEST: &str = "syncbackRequest";
}

/// The isolated store for one account
pub struct Store {
    account_id: Uuid,
    conn: Arc<Mutex<Connection>>,
    publisher: TransactionPublisher,
}

fn open_connection(path: &Path) -> HeimdallResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(conn)
}

impl Store {
    /// Open (and migrate) the store file for one account
    pub fn open(account_id: Uuid, path: &Path) -> HeimdallResult<Self> {
        let conn = open_connection(path)?;
        run_migrations(&conn, ACCOUNT_MIGRATIONS)?;
        Ok(Self {
            account_id,
            conn: Arc::new(Mutex::new(conn)),
            publisher: TransactionPublisher::default(),
        })
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    /// The account-scoped transaction channel
    pub fn publisher(&self) -> &TransactionPublisher {
        &self.publisher
    }

    // Containers

    /// Create or update a container, logging a transaction when it changed
    pub async fn save_container(&self, container: &Container) -> HeimdallResult<()> {
        let object_type = match container.kind {
            ContainerKind::Folder => object_types::FOLDER,
            ContainerKind::Label => object_types::LABEL,
        };
        let after = serde_json::to_value(container)?;
        let object_id = container.id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let before: Option<String> = tx
            .query_row("SELECT data FROM containers WHERE id = ?", [&object_id], |row| row.get(0))
            .optional()?;
        let before = before.map(|raw| serde_json::from_str(&raw)).transpose()?;

        let fields = changed_fields(before.as_ref(), &after);
        if before.is_some() && fields.is_empty() {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO containers (id, name, kind, data, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data",
            params![
                object_id,
                container.name,
                serde_json::to_string(&container.kind)?,
                serde_json::to_string(container)?,
                container.created_at.unix_timestamp(),
            ],
        )?;

        let event = if before.is_some() { TransactionEvent::Modify } else { TransactionEvent::Create };
        let notice = self.log_transaction(&tx, event, object_type, &object_id, &fields)?;
        tx.commit()?;
        self.publisher.publish(notice);
        Ok(())
    }

    /// Delete a container that disappeared from the remote, along with its
    /// UID bindings (which are not transaction-logged).
    pub async fn delete_container(&self, container: &Container) -> HeimdallResult<()> {
        let object_type = match container.kind {
            ContainerKind::Folder => object_types::FOLDER,
            ContainerKind::Label => object_types::LABEL,
        };
        let object_id = container.id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM containers WHERE id = ?", [&object_id])?;
        if removed == 0 {
            return Ok(());
        }
        tx.execute("DELETE FROM message_uids WHERE container_id = ?", [&object_id])?;
        let notice = self.log_transaction(&tx, TransactionEvent::Delete, object_type, &object_id, &[])?;
        tx.commit()?;
        self.publisher.publish(notice);
        Ok(())
    }

    pub async fn container(&self, id: Uuid) -> HeimdallResult<Option<Container>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM containers WHERE id = ?", [id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub async fn container_by_name(&self, name: &str) -> HeimdallResult<Option<Container>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM containers WHERE name = ?", [name], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub async fn containers(&self) -> HeimdallResult<Vec<Container>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM containers ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut containers = Vec::new();
        for raw in rows {
            containers.push(serde_json::from_str(&raw?)?);
        }
        Ok(containers)
    }

    /// First container with the given role, if any
    pub async fn container_with_role(&self, role: ContainerRole) -> HeimdallResult<Option<Container>> {
        Ok(self.containers().await?.into_iter().find(|c| c.role == role))
    }

    // Messages

    /// Create or update a message, logging a transaction when it changed
    pub async fn save_message(&self, message: &Message) -> HeimdallResult<()> {
        let after = serde_json::to_value(message)?;
        let object_id = message.id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let before: Option<String> = tx
            .query_row("SELECT data FROM messages WHERE id = ?", [&object_id], |row| row.get(0))
            .optional()?;
        let before = before.map(|raw| serde_json::from_str(&raw)).transpose()?;

        let fields = changed_fields(before.as_ref(), &after);
        if before.is_some() && fields.is_empty() {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO messages (id, content_hash, thread_id, folder_id, subject, date, data)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               content_hash = excluded.content_hash,
               thread_id = excluded.thread_id,
               folder_id = excluded.folder_id,
               subject = excluded.subject,
               date = excluded.date,
               data = excluded.data",
            params![
                object_id,
                message.content_hash,
                message.thread_id.map(|id| id.to_string()),
                message.folder_id.map(|id| id.to_string()),
                message.subject,
                message.date.unix_timestamp(),
                serde_json::to_string(message)?,
            ],
        )?;

        let event = if before.is_some() { TransactionEvent::Modify } else { TransactionEvent::Create };
        let notice =
            self.log_transaction(&tx, event, object_types::MESSAGE, &object_id, &fields)?;
        tx.commit()?;
        self.publisher.publish(notice);
        Ok(())
    }

    pub async fn message(&self, id: Uuid) -> HeimdallResult<Option<Message>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM messages WHERE id = ?", [id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Dedup lookup: one content hash per account
    pub async fn message_by_content_hash(&self, hash: &str) -> HeimdallResult<Option<Message>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM messages WHERE content_hash = ?", [hash], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Maintenance/repair path only
    pub async fn messages_for_thread(&self, thread_id: Uuid) -> HeimdallResult<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT data FROM messages WHERE thread_id = ? ORDER BY date")?;
        let rows = stmt.query_map([thread_id.to_string()], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for raw in rows {
            messages.push(serde_json::from_str(&raw?)?);
        }
        Ok(messages)
    }

    // MessageUID bindings (internal bookkeeping, not transaction-logged)

    pub async fn upsert_message_uid(&self, binding: &MessageUid) -> HeimdallResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO message_uids (container_id, uid, message_id, unread, starred)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(container_id, uid) DO UPDATE SET
               message_id = excluded.message_id,
               unread = excluded.unread,
               starred = excluded.starred",
            params![
                binding.container_id.to_string(),
                binding.uid,
                binding.message_id.to_string(),
                binding.flags.unread,
                binding.flags.starred,
            ],
        )?;
        Ok(())
    }

    pub async fn message_uids_for_container(
        &self,
        container_id: Uuid,
    ) -> HeimdallResult<Vec<MessageUid>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT container_id, uid, message_id, unread, starred
             FROM message_uids WHERE container_id = ? ORDER BY uid",
        )?;
        let rows = stmt.query_map([container_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        let mut bindings = Vec::new();
        for row in rows {
            let (container, uid, message, unread, starred) = row?;
            bindings.push(MessageUid {
                container_id: parse_uuid(&container)?,
                uid,
                message_id: parse_uuid(&message)?,
                flags: crate::message::MessageFlags { unread, starred },
            });
        }
        Ok(bindings)
    }

    pub async fn delete_message_uid(&self, container_id: Uuid, uid: u32) -> HeimdallResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM message_uids WHERE container_id = ? AND uid = ?",
            params![container_id.to_string(), uid],
        )?;
        Ok(())
    }

    /// UID-validity recovery: drop every binding for the container. The
    /// messages themselves survive and may be re-bound.
    pub async fn delete_message_uids_for_container(
        &self,
        container_id: Uuid,
    ) -> HeimdallResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM message_uids WHERE container_id = ?",
            [container_id.to_string()],
        )?;
        Ok(removed)
    }

    // Threads

    /// Create or update a thread, logging a transaction when it changed
    pub async fn save_thread(&self, thread: &Thread) -> HeimdallResult<()> {
        let after = serde_json::to_value(thread)?;
        let object_id = thread.id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let before: Option<String> = tx
            .query_row("SELECT data FROM threads WHERE id = ?", [&object_id], |row| row.get(0))
            .optional()?;
        let before = before.map(|raw| serde_json::from_str(&raw)).transpose()?;

        let fields = changed_fields(before.as_ref(), &after);
        if before.is_some() && fields.is_empty() {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO threads (id, remote_thread_id, subject, last_message_date, created_at, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               remote_thread_id = excluded.remote_thread_id,
               subject = excluded.subject,
               last_message_date = excluded.last_message_date,
               data = excluded.data",
            params![
                object_id,
                thread.remote_thread_id,
                thread.subject,
                thread.last_message_date.map(|d| d.unix_timestamp()),
                thread.created_at.unix_timestamp(),
                serde_json::to_string(thread)?,
            ],
        )?;

        let event = if before.is_some() { TransactionEvent::Modify } else { TransactionEvent::Create };
        let notice = self.log_transaction(&tx, event, object_types::THREAD, &object_id, &fields)?;
        tx.commit()?;
        self.publisher.publish(notice);
        Ok(())
    }

    pub async fn thread(&self, id: Uuid) -> HeimdallResult<Option<Thread>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM threads WHERE id = ?", [id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub async fn thread_by_remote_id(&self, remote_thread_id: &str) -> HeimdallResult<Option<Thread>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM threads WHERE remote_thread_id = ?",
                [remote_thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Candidate threads for subject matching, newest first
    pub async fn recent_threads_by_subject(
        &self,
        subject: &str,
        limit: usize,
    ) -> HeimdallResult<Vec<Thread>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT data FROM threads WHERE subject = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![subject, limit], |row| row.get::<_, String>(0))?;
        let mut threads = Vec::new();
        for raw in rows {
            threads.push(serde_json::from_str(&raw?)?);
        }
        Ok(threads)
    }

    // Transaction log

    fn log_transaction(
        &self,
        tx: &rusqlite::Transaction<'_>,
        event: TransactionEvent,
        object_type: &str,
        object_id: &str,
        fields: &[String],
    ) -> HeimdallResult<TransactionNotice> {
        tx.execute(
            "INSERT INTO transactions (event, object_type, object_id, changed_fields, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                event.to_string(),
                object_type,
                object_id,
                serde_json::to_string(fields)?,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        )?;
        Ok(TransactionNotice { id: tx.last_insert_rowid(), account_id: self.account_id })
    }

    /// Ordered catch-up page: transactions with id greater than the cursor
    pub async fn transactions_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> HeimdallResult<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, event, object_type, object_id, changed_fields, created_at
             FROM transactions WHERE id > ? ORDER BY id LIMIT ?",
        )?;
        let rows = stmt.query_map(params![cursor, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut transactions = Vec::new();
        for row in rows {
            let (id, event, object_type, object_id, fields, created_at) = row?;
            let event = match event.as_str() {
                "create" => TransactionEvent::Create,
                "modify" => TransactionEvent::Modify,
                "delete" => TransactionEvent::Delete,
                other => {
                    return Err(HeimdallError::invalid_state(format!(
                        "unknown transaction event: {other}"
                    )))
                }
            };
            transactions.push(Transaction {
                id,
                account_id: self.account_id,
                event,
                object_type,
                object_id,
                changed_fields: serde_json::from_str(&fields)?,
                created_at: OffsetDateTime::from_unix_timestamp(created_at)
                    .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            });
        }
        Ok(transactions)
    }

    /// Highest committed transaction id, 0 when the log is empty
    pub async fn latest_cursor(&self) -> HeimdallResult<i64> {
        let conn = self.conn.lock().await;
        let cursor: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM transactions", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(cursor.unwrap_or(0))
    }

    /// Current attributes of a logged object, for delta inflation
    pub async fn object_snapshot(
        &self,
        object_type: &str,
        object_id: &str,
    ) -> HeimdallResult<Option<serde_json::Value>> {
        let table = match object_type {
            object_types::MESSAGE => "messages",
            object_types::THREAD => "threads",
            object_types::FOLDER | object_types::LABEL => "containers",
            object_types::SYNCBACK_REQUEST => "syncback_requests",
            other => {
                return Err(HeimdallError::invalid_state(format!(
                    "unknown object type: {other}"
                )))
            }
        };
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {table} WHERE id = ?"),
                [object_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    // Syncback requests

    /// Create or update a syncback request, logging a transaction
    pub async fn save_syncback_request(&self, request: &SyncbackRequest) -> HeimdallResult<()> {
        let after = serde_json::to_value(request)?;
        let object_id = request.id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let before: Option<String> = tx
            .query_row("SELECT data FROM syncback_requests WHERE id = ?", [&object_id], |row| {
                row.get(0)
            })
            .optional()?;
        let before = before.map(|raw| serde_json::from_str(&raw)).transpose()?;

        let fields = changed_fields(before.as_ref(), &after);
        if before.is_some() && fields.is_empty() {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO syncback_requests (id, kind, status, created_at, data)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
            params![
                object_id,
                request.kind.to_string(),
                serde_json::to_string(&request.status)?,
                request.created_at.unix_timestamp(),
                serde_json::to_string(request)?,
            ],
        )?;

        let event = if before.is_some() { TransactionEvent::Modify } else { TransactionEvent::Create };
        let notice = self.log_transaction(
            &tx,
            event,
            object_types::SYNCBACK_REQUEST,
            &object_id,
            &fields,
        )?;
        tx.commit()?;
        self.publisher.publish(notice);
        Ok(())
    }

    pub async fn syncback_request(&self, id: Uuid) -> HeimdallResult<Option<SyncbackRequest>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM syncback_requests WHERE id = ?", [id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Requests in one status, oldest first
    pub async fn syncback_requests_with_status(
        &self,
        status: SyncbackStatus,
        limit: usize,
    ) -> HeimdallResult<Vec<SyncbackRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT data FROM syncback_requests WHERE status = ?
             ORDER BY created_at, rowid LIMIT ?",
        )?;
        let rows = stmt.query_map(params![serde_json::to_string(&status)?, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut requests = Vec::new();
        for raw in rows {
            requests.push(serde_json::from_str(&raw?)?);
        }
        Ok(requests)
    }
}

fn parse_uuid(raw: &str) -> HeimdallResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| HeimdallError::invalid_state(format!("bad uuid: {raw}")))
}

/// The shared store: the account registry
pub struct SharedStore {
    conn: Arc<Mutex<Connection>>,
}

impl SharedStore {
    pub fn open(path: &Path) -> HeimdallResult<Self> {
        let conn = open_connection(path)?;
        run_migrations(&conn, SHARED_MIGRATIONS)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn save_account(&self, account: &Account) -> HeimdallResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, email, data, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET email = excluded.email, data = excluded.data",
            params![
                account.id.to_string(),
                account.email,
                serde_json::to_string(account)?,
                account.created_at.unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub async fn account(&self, id: Uuid) -> HeimdallResult<Option<Account>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM accounts WHERE id = ?", [id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub async fn accounts(&self) -> HeimdallResult<Vec<Account>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM accounts ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut accounts = Vec::new();
        for raw in rows {
            accounts.push(serde_json::from_str(&raw?)?);
        }
        Ok(accounts)
    }
}
