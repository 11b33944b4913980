// SPDX-License-Identifier: MIT
//! Dead-letter queue (spec.md §3.5, §4.12). Unlike the teacher's
//! `events::dead_letter`, disk is the source of truth: a reject writes the
//! envelope into the endpoint's `failed/` with a reason sidecar, and the
//! index row is a queryable mirror of that write.

use serde::Serialize;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::index::{IndexEntry, MessageStatus, RelayIndex};
use crate::maildir::MaildirStore;

/// Reserved pseudo-hash for envelopes dead-lettered before any endpoint
/// could be attributed (zero matching endpoints/adapters/subscribers).
pub const UNROUTED_HASH: &str = "unrouted";

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub endpoint_hash: String,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Default)]
pub struct DeadLetterFilter {
    pub endpoint_hash: Option<String>,
    pub cursor: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterPage {
    pub items: Vec<DeadLetterEntry>,
    pub next_cursor: Option<String>,
}

pub struct DeadLetterQueue<'a> {
    maildir: &'a MaildirStore,
    index: &'a RelayIndex,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(maildir: &'a MaildirStore, index: &'a RelayIndex) -> Self {
        Self { maildir, index }
    }

    /// Write envelope to `failed/` with a reason sidecar; insert an index
    /// row with status `failed`. `endpoint_hash` is `UNROUTED_HASH` when no
    /// endpoint could be attributed.
    pub async fn reject(&self, endpoint_hash: &str, envelope: &Envelope, reason: &str) -> Result<()> {
        self.maildir.ensure_maildir(endpoint_hash).await?;
        let name = self.maildir.deliver(endpoint_hash, envelope).await?;
        self.maildir.mark_failed(endpoint_hash, &name, reason).await?;

        self.index
            .insert_message(&IndexEntry {
                id: envelope.id.clone(),
                subject: envelope.subject.clone(),
                sender: envelope.from.clone(),
                endpoint_hash: endpoint_hash.to_string(),
                status: MessageStatus::Failed,
                created_at: envelope.created_at.clone(),
                ttl: envelope.budget.ttl,
            })
            .await?;
        self.index.update_status(&envelope.id, MessageStatus::Failed).await?;
        Ok(())
    }

    /// Paginated read from disk (`failed/` plus reason sidecars), newest
    /// first by filename ordering.
    pub async fn list_dead(
        &self,
        endpoint_hash: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        let hash = endpoint_hash.unwrap_or(UNROUTED_HASH);
        let mut names = self.maildir.list_failed(hash).await?;
        names.sort_unstable();
        names.reverse();
        names.truncate(limit.max(1));

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let envelope = self.maildir.read_envelope(hash, "failed", &name).await?;
            let reason = self
                .maildir
                .read_reason(hash, &name)
                .await
                .unwrap_or_else(|| "unknown".to_string());
            out.push(DeadLetterEntry {
                id: envelope.id,
                subject: envelope.subject,
                sender: envelope.from,
                endpoint_hash: hash.to_string(),
                reason,
                created_at: envelope.created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Budget, Envelope};
    use tempfile::TempDir;

    fn envelope() -> Envelope {
        Envelope::new(
            "relay.agent.backend".into(),
            "relay.sender".into(),
            None,
            serde_json::json!({}),
            Budget::new(8, 60_000, 10),
        )
    }

    #[tokio::test]
    async fn reject_writes_failed_with_reason_and_index_row() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        let envelope = envelope();
        dlq.reject("abc123", &envelope, "ttl_expired").await.unwrap();

        let entries = dlq.list_dead(Some("abc123"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "ttl_expired");

        let row = index.get_message(&envelope.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn unrouted_rejects_use_reserved_hash() {
        let dir = TempDir::new().unwrap();
        let maildir = MaildirStore::new(dir.path());
        let index = RelayIndex::open(dir.path()).await.unwrap();
        let dlq = DeadLetterQueue::new(&maildir, &index);

        dlq.reject(UNROUTED_HASH, &envelope(), "no matching endpoint")
            .await
            .unwrap();

        let entries = dlq.list_dead(None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].endpoint_hash, UNROUTED_HASH);
    }
}
