// SPDX-License-Identifier: MIT
//! Persistent map of subject -> endpoint record (spec.md §3.3, §4.2).
//!
//! Loaded once at start, mutated in memory, rewritten to disk atomically
//! (tmp-write-then-rename) on every mutation — the same idiom as the
//! teacher's inbox file writer (`mailbox::handlers::write_inbox_file`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointInfo {
    pub subject: String,
    pub hash: String,
    pub maildir_path: String,
    pub registered_at: String,
}

#[derive(Default, Serialize, Deserialize)]
struct EndpointsFile {
    endpoints: Vec<EndpointInfo>,
}

/// Deterministic 12-hex-char derivation of a subject, used as the on-disk
/// mailbox directory name.
pub fn hash_subject(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{:02x}", b));
    }
    s.truncate(chars);
    s
}

pub struct EndpointRegistry {
    path: PathBuf,
    data_dir: PathBuf,
    entries: RwLock<HashMap<String, EndpointInfo>>,
}

impl EndpointRegistry {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("endpoints.json");
        let entries = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let parsed: EndpointsFile = serde_json::from_str(&content)
                .map_err(|e| RelayError::Other(anyhow::anyhow!(e)))?;
            parsed
                .endpoints
                .into_iter()
                .map(|e| (e.subject.clone(), e))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            data_dir: data_dir.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Register `subject`, creating its `EndpointInfo` and persisting the
    /// whole registry to disk. Fails with `DuplicateEndpoint` if already
    /// present.
    pub async fn register(&self, subject: &str) -> Result<EndpointInfo> {
        {
            let entries = self.entries.read().unwrap();
            if entries.contains_key(subject) {
                return Err(RelayError::DuplicateEndpoint {
                    subject: subject.to_string(),
                });
            }
        }

        let hash = hash_subject(subject);
        let maildir_path = self
            .data_dir
            .join("mailboxes")
            .join(&hash)
            .to_string_lossy()
            .to_string();
        let info = EndpointInfo {
            subject: subject.to_string(),
            hash,
            maildir_path,
            registered_at: chrono::Utc::now().to_rfc3339(),
        };

        {
            let mut entries = self.entries.write().unwrap();
            entries.insert(subject.to_string(), info.clone());
        }
        self.persist().await?;
        info!(subject, hash = %info.hash, "endpoint registered");
        Ok(info)
    }

    /// Idempotent. Returns whether an entry was actually removed. Files on
    /// disk are never deleted (durability across restarts, spec.md §3.3).
    pub async fn unregister(&self, subject: &str) -> Result<bool> {
        let removed = {
            let mut entries = self.entries.write().unwrap();
            entries.remove(subject).is_some()
        };
        if removed {
            self.persist().await?;
            info!(subject, "endpoint unregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, subject: &str) -> Option<EndpointInfo> {
        self.entries.read().unwrap().get(subject).cloned()
    }

    /// Stable snapshot of every registered endpoint.
    pub fn list(&self) -> Vec<EndpointInfo> {
        let mut v: Vec<EndpointInfo> = self.entries.read().unwrap().values().cloned().collect();
        v.sort_by(|a, b| a.subject.cmp(&b.subject));
        v
    }

    /// All endpoints whose subject matches `concrete`, per spec.md §4.1.
    /// Registered subjects are always concrete (enforced by the `Relay`
    /// facade's `register_endpoint`, spec.md §3.1), so in practice this
    /// is an exact match — `subject::matches` is reused rather than a
    /// plain `==` since a concrete pattern against a concrete subject
    /// degrades to exactly that.
    pub fn matching(&self, concrete: &str) -> Vec<EndpointInfo> {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| crate::subject::matches(&e.subject, concrete))
            .cloned()
            .collect()
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = EndpointsFile {
            endpoints: self.list(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| RelayError::Other(anyhow::anyhow!(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
