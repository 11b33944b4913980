// SPDX-License-Identifier: MIT
//! Per-endpoint on-disk queue: `tmp/`, `new/`, `cur/`, `failed/` with atomic
//! writes (spec.md §3.4, §4.3). Presence in `new/` is the sole authoritative
//! "undelivered" signal; the SQLite index is a convenience projection.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::Result;

pub struct MaildirStore {
    root: PathBuf,
}

impl MaildirStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("mailboxes"),
        }
    }

    fn base(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Create the four subdirectories idempotently.
    pub async fn ensure_maildir(&self, hash: &str) -> Result<()> {
        let base = self.base(hash);
        for sub in ["tmp", "new", "cur", "failed"] {
            tokio::fs::create_dir_all(base.join(sub)).await?;
        }
        Ok(())
    }

    /// Write envelope bytes to `tmp/<name>`, fsync, then rename to
    /// `new/<name>`. A failure at any step leaves no file in `new/`.
    pub async fn deliver(&self, hash: &str, envelope: &Envelope) -> Result<String> {
        let name = envelope.file_name();
        let base = self.base(hash);
        let tmp_path = base.join("tmp").join(&name);
        let new_path = base.join("new").join(&name);

        let bytes = serde_json::to_vec_pretty(envelope)
            .map_err(|e| crate::error::RelayError::Other(anyhow::anyhow!(e)))?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &new_path).await?;
        Ok(name)
    }

    /// Rename `new/<name>` to `cur/<name>`.
    pub async fn mark_processed(&self, hash: &str, name: &str) -> Result<()> {
        let base = self.base(hash);
        tokio::fs::rename(base.join("new").join(name), base.join("cur").join(name)).await?;
        Ok(())
    }

    /// Rename `new/<name>` (or `tmp/<name>`) to `failed/<name>` and write a
    /// sibling `<name>.reason` file.
    pub async fn mark_failed(&self, hash: &str, name: &str, reason: &str) -> Result<()> {
        let base = self.base(hash);
        let failed_path = base.join("failed").join(name);

        let from_new = base.join("new").join(name);
        let from_tmp = base.join("tmp").join(name);
        if from_new.exists() {
            tokio::fs::rename(&from_new, &failed_path).await?;
        } else if from_tmp.exists() {
            tokio::fs::rename(&from_tmp, &failed_path).await?;
        } else {
            warn!(hash, name, "mark_failed: source file missing in new/ and tmp/");
        }

        let reason_path = base.join("failed").join(format!("{name}.reason"));
        tokio::fs::write(&reason_path, reason).await?;
        Ok(())
    }

    pub async fn read_envelope(&self, hash: &str, dir: &str, name: &str) -> Result<Envelope> {
        let path = self.base(hash).join(dir).join(name);
        let content = tokio::fs::read_to_string(&path).await?;
        let envelope: Envelope = serde_json::from_str(&content)
            .map_err(|e| crate::error::RelayError::Other(anyhow::anyhow!(e)))?;
        Ok(envelope)
    }

    pub async fn list_new(&self, hash: &str) -> Result<Vec<String>> {
        self.list_dir(hash, "new").await
    }

    pub async fn list_failed(&self, hash: &str) -> Result<Vec<String>> {
        let mut names = self.list_dir(hash, "failed").await?;
        names.retain(|n| !n.ends_with(".reason"));
        Ok(names)
    }

    pub async fn list_cur(&self, hash: &str) -> Result<Vec<String>> {
        self.list_dir(hash, "cur").await
    }

    async fn list_dir(&self, hash: &str, sub: &str) -> Result<Vec<String>> {
        let dir = self.base(hash).join(sub);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    /// Used by the backpressure probe: count of files awaiting delivery.
    pub async fn count_new(&self, hash: &str) -> Result<usize> {
        Ok(self.list_new(hash).await?.len())
    }

    /// Read a reason sidecar for a dead-lettered envelope, if present.
    pub async fn read_reason(&self, hash: &str, name: &str) -> Option<String> {
        let path = self.base(hash).join("failed").join(format!("{name}.reason"));
        tokio::fs::read_to_string(&path).await.ok()
    }
}
