// SPDX-License-Identifier: MIT
//! Priority-ranked allow/deny rules, hot-reloaded from `access-rules.json`
//! (spec.md §3.6, §4.5). The watcher mechanism mirrors the teacher's
//! `config::ConfigWatcher`: a debounced `notify` watch over the parent
//! directory that reloads and atomically swaps an `Arc<RwLock<...>>`
//! snapshot.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRule {
    pub from: String,
    pub to: String,
    pub action: RuleAction,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct AccessCheck {
    pub allowed: bool,
    pub matched_rule: Option<AccessRule>,
}

pub struct AccessControl {
    path: PathBuf,
    rules: Arc<RwLock<Vec<AccessRule>>>,
    // Holding the debouncer alive keeps the watch active; dropping it stops
    // the watch, the same lifetime discipline as `config::ConfigWatcher`.
    _watcher: Option<
        notify_debouncer_full::Debouncer<
            notify_debouncer_full::notify::RecommendedWatcher,
            notify_debouncer_full::FileIdMap,
        >,
    >,
}

impl AccessControl {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("access-rules.json");
        let rules = Arc::new(RwLock::new(load_rules(&path)));
        let watcher = start_watcher(&path, rules.clone());

        Ok(Self {
            path,
            rules,
            _watcher: watcher,
        })
    }

    /// Evaluate rules in priority order (descending); first match
    /// (`from` pattern matches sender AND `to` pattern matches subject)
    /// decides. Default policy: allow.
    pub async fn check_access(&self, from: &str, to: &str) -> AccessCheck {
        let rules = self.rules.read().await;
        for rule in rules.iter() {
            if crate::subject::matches(&rule.from, from) && crate::subject::matches(&rule.to, to) {
                return AccessCheck {
                    allowed: rule.action == RuleAction::Allow,
                    matched_rule: Some(rule.clone()),
                };
            }
        }
        AccessCheck {
            allowed: true,
            matched_rule: None,
        }
    }

    pub async fn add_rule(&self, rule: AccessRule) -> Result<()> {
        {
            let mut rules = self.rules.write().await;
            rules.push(rule);
        }
        self.persist().await
    }

    pub async fn remove_rule(&self, from: &str, to: &str) -> Result<bool> {
        let removed = {
            let mut rules = self.rules.write().await;
            let before = rules.len();
            rules.retain(|r| !(r.from == from && r.to == to));
            rules.len() != before
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Shallow copy sorted by priority descending.
    pub async fn list_rules(&self) -> Vec<AccessRule> {
        self.rules.read().await.clone()
    }

    async fn persist(&self) -> Result<()> {
        let rules = self.rules.read().await.clone();
        let json = serde_json::to_string_pretty(&rules)
            .map_err(|e| crate::error::RelayError::Other(anyhow::anyhow!(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn load_rules(path: &Path) -> Vec<AccessRule> {
    let mut rules: Vec<AccessRule> = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

/// Start watching `access-rules.json` for changes. Returns `None` if the
/// watcher could not be created — non-fatal; the bus runs fine without
/// hot-reload, just like the teacher's `ConfigWatcher::start`.
fn start_watcher(
    path: &Path,
    rules: Arc<RwLock<Vec<AccessRule>>>,
) -> Option<
    notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
> {
    let path = path.to_path_buf();
    let rt_handle = tokio::runtime::Handle::try_current().ok()?;

    let watcher = notify_debouncer_full::new_debouncer(
        std::time::Duration::from_secs(2),
        None,
        move |result: notify_debouncer_full::DebounceEventResult| {
            if let Ok(events) = result {
                use notify_debouncer_full::notify::EventKind;
                let relevant = events
                    .iter()
                    .any(|e| matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_)));
                if relevant {
                    let rules = rules.clone();
                    let path = path.clone();
                    rt_handle.spawn(async move {
                        let reloaded = load_rules(&path);
                        let mut guard = rules.write().await;
                        info!(count = reloaded.len(), "access-rules.json reloaded");
                        *guard = reloaded;
                    });
                }
            }
        },
    );

    match watcher {
        Ok(mut debouncer) => {
            use notify_debouncer_full::notify::Watcher as _;
            let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(watch_dir).ok();
            if let Err(e) = debouncer.watcher().watch(
                watch_dir,
                notify_debouncer_full::notify::RecursiveMode::NonRecursive,
            ) {
                warn!("access-rules watcher failed to start: {e} — hot-reload disabled");
                return None;
            }
            info!(path = %path.display(), "access-rules hot-reload watcher started");
            Some(debouncer)
        }
        Err(e) => {
            warn!("access-rules watcher creation failed: {e} — hot-reload disabled");
            None
        }
    }
}
