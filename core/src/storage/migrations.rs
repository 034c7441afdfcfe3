//! Schema migrations
//!
//! Migrations are applied once each, tracked by name in a `migrations`
//! table. The shared store and the per-account stores have separate sets.

use rusqlite::Connection;
use tracing::info;

use crate::error::HeimdallResult;

/// One named schema step
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Schema for the shared store (accounts)
pub const SHARED_MIGRATIONS: &[Migration] = &[Migration {
    name: "create-accounts",
    sql: "CREATE TABLE accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL
          )",
}];

/// Schema for each per-account store
pub const ACCOUNT_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "create-containers",
        sql: "CREATE TABLE containers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
              )",
    },
    Migration {
        name: "create-messages",
        sql: "CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL UNIQUE,
                thread_id TEXT,
                folder_id TEXT,
                subject TEXT NOT NULL,
                date INTEGER NOT NULL,
                data TEXT NOT NULL
              )",
    },
    Migration {
        name: "create-message-uids",
        sql: "CREATE TABLE message_uids (
                container_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                unread INTEGER NOT NULL,
                starred INTEGER NOT NULL,
                PRIMARY KEY (container_id, uid)
              )",
    },
    Migration {
        name: "create-threads",
        sql: "CREATE TABLE threads (
                id TEXT PRIMARY KEY,
                remote_thread_id TEXT,
                subject TEXT NOT NULL,
                last_message_date INTEGER,
                created_at INTEGER NOT NULL,
                data TEXT NOT NULL
              )",
    },
    Migration {
        name: "index-threads-subject",
        sql: "CREATE INDEX idx_threads_subject ON threads (subject)",
    },
    Migration {
        name: "index-threads-remote-id",
        sql: "CREATE INDEX idx_threads_remote_id ON threads (remote_thread_id)",
    },
    Migration {
        name: "create-transactions",
        sql: "CREATE TABLE transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                created_at INTEGER NOT NULL
              )",
    },
    Migration {
        name: "create-syncback-requests",
        sql: "CREATE TABLE syncback_requests (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                data TEXT NOT NULL
              )",
    },
];

/// Apply every migration that has not run yet, in order
pub fn run_migrations(conn: &Connection, migrations: &[Migration]) -> HeimdallResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            name TEXT PRIMARY KEY,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    for migration in migrations {
        let applied: i64 = conn.query_row(
            "SELECT COUNT(*) FROM migrations WHERE name = ?",
            [migration.name],
            |row| row.get(0),
        )?;
        if applied == 0 {
            info!(migration = migration.name, "applying migration");
            conn.execute_batch(migration.sql)?;
            conn.execute("INSERT INTO migrations (name) VALUES (?)", [migration.name])?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, ACCOUNT_MIGRATIONS).unwrap();
        run_migrations(&conn, ACCOUNT_MIGRATIONS).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'transactions'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
