// SPDX-License-Identifier: MIT
//! SQLite secondary index (spec.md §3.5, §4.4). A queryable projection,
//! fully rebuildable from disk; never the source of truth. All writes run
//! through a single pool (SQLite's own WAL serializes them); readers are
//! non-blocking.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;
use crate::maildir::MaildirStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageStatus {
    New,
    Cur,
    Failed,
    Delivered,
}

impl MessageStatus {
    fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Cur => "cur",
            MessageStatus::Failed => "failed",
            MessageStatus::Delivered => "delivered",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "cur" => MessageStatus::Cur,
            "failed" => MessageStatus::Failed,
            "delivered" => MessageStatus::Delivered,
            _ => MessageStatus::New,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub endpoint_hash: String,
    pub status: MessageStatus,
    pub created_at: String,
    pub ttl: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    pub subject: Option<String>,
    pub status: Option<MessageStatus>,
    pub sender: Option<String>,
    pub endpoint_hash: Option<String>,
    /// Opaque cursor: the last-seen `id`. Results are strictly older
    /// (monotonically decreasing on `id`, since ids are ULIDs).
    pub cursor: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub items: Vec<IndexEntry>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct RelayMetrics {
    pub total_messages: i64,
    pub by_status: HashMap<String, i64>,
    pub by_subject: Vec<(String, i64)>,
}

pub struct RelayIndex {
    pool: SqlitePool,
}

impl RelayIndex {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("index.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(|e| crate::error::RelayError::Other(anyhow::anyhow!(e)))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        // sqlx executes only a single statement per `query()` call; split the
        // migration file on `;`, matching `storage::Storage::migrate`.
        for stmt in include_str!("../migrations/001_relay_index.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await?;
            }
        }

        Ok(Self { pool })
    }

    pub async fn insert_message(&self, entry: &IndexEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages (id, subject, sender, endpoint_hash, status, created_at, ttl)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.subject)
        .bind(&entry.sender)
        .bind(&entry.endpoint_hash)
        .bind(entry.status.as_str())
        .bind(&entry.created_at)
        .bind(entry.ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<IndexEntry>> {
        let row = sqlx::query(
            "SELECT id, subject, sender, endpoint_hash, status, created_at, ttl FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_entry))
    }

    pub async fn query_messages(&self, filter: &MessageFilter) -> Result<MessagePage> {
        let limit = if filter.limit <= 0 { 50 } else { filter.limit };
        // Fetch one extra row to know whether there's a next page.
        let mut sql = String::from(
            "SELECT id, subject, sender, endpoint_hash, status, created_at, ttl FROM messages WHERE 1=1",
        );
        if filter.subject.is_some() {
            sql.push_str(" AND subject = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.sender.is_some() {
            sql.push_str(" AND sender = ?");
        }
        if filter.endpoint_hash.is_some() {
            sql.push_str(" AND endpoint_hash = ?");
        }
        if filter.cursor.is_some() {
            sql.push_str(" AND id < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(ref s) = filter.subject {
            query = query.bind(s);
        }
        if let Some(ref s) = filter.status {
            query = query.bind(s.as_str());
        }
        if let Some(ref s) = filter.sender {
            query = query.bind(s);
        }
        if let Some(ref s) = filter.endpoint_hash {
            query = query.bind(s);
        }
        if let Some(ref c) = filter.cursor {
            query = query.bind(c);
        }
        query = query.bind(limit + 1);

        let rows = query.fetch_all(&self.pool).await?;
        let mut items: Vec<IndexEntry> = rows.into_iter().map(row_to_entry).collect();
        let next_cursor = if items.len() > limit as usize {
            items.truncate(limit as usize);
            items.last().map(|e| e.id.clone())
        } else {
            None
        };

        Ok(MessagePage { items, next_cursor })
    }

    /// Count messages from `from` with `created_at >= since_iso` — the
    /// sliding-window check used by the rate limiter (spec.md §4.8).
    pub async fn count_sender_in_window(&self, from: &str, since_iso: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE sender = ? AND created_at >= ?",
        )
        .bind(from)
        .bind(since_iso)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_metrics(&self) -> Result<RelayMetrics> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;

        let status_rows = sqlx::query("SELECT status, COUNT(*) as c FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut by_status = HashMap::new();
        for row in status_rows {
            let status: String = row.get("status");
            let count: i64 = row.get("c");
            by_status.insert(status, count);
        }

        let subject_rows = sqlx::query(
            "SELECT subject, COUNT(*) as c FROM messages GROUP BY subject ORDER BY c DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_subject = subject_rows
            .into_iter()
            .map(|row| {
                let subject: String = row.get("subject");
                let count: i64 = row.get("c");
                (subject, count)
            })
            .collect();

        Ok(RelayMetrics {
            total_messages: total.0,
            by_status,
            by_subject,
        })
    }

    /// Drop all rows then re-scan `new/`, `cur/`, `failed/` for every known
    /// endpoint hash, restoring `status` from the containing directory
    /// (spec.md §4.4). Returns the number of rows restored.
    pub async fn rebuild(
        &self,
        maildir: &MaildirStore,
        endpoints: &[(String, String)],
    ) -> Result<u64> {
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;

        let mut count = 0u64;
        for (subject, hash) in endpoints {
            for (dir, status) in [
                ("new", MessageStatus::New),
                ("cur", MessageStatus::Cur),
                ("failed", MessageStatus::Failed),
            ] {
                let names = match dir {
                    "new" => maildir.list_new(hash).await?,
                    "cur" => maildir.list_cur(hash).await?,
                    _ => maildir.list_failed(hash).await?,
                };
                for name in names {
                    if let Ok(envelope) = maildir.read_envelope(hash, dir, &name).await {
                        let entry = IndexEntry {
                            id: envelope.id,
                            subject: subject.clone(),
                            sender: envelope.from,
                            endpoint_hash: hash.clone(),
                            status: status.clone(),
                            created_at: envelope.created_at,
                            ttl: envelope.budget.ttl,
                        };
                        self.insert_message(&entry).await?;
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Checkpoint the WAL and close the connection pool (spec.md §4.16).
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> IndexEntry {
    IndexEntry {
        id: row.get("id"),
        subject: row.get("subject"),
        sender: row.get("sender"),
        endpoint_hash: row.get("endpoint_hash"),
        status: MessageStatus::from_str(row.get::<String, _>("status").as_str()),
        created_at: row.get("created_at"),
        ttl: row.get("ttl"),
    }
}
