// SPDX-License-Identifier: MIT
//! Per-endpoint filesystem watcher on `new/` (spec.md §4.15), generalizing
//! the teacher's single-inbox `MailboxWatcher` to N registered endpoints.
//! This is the cross-process / crash-recovery push path; it is disabled for
//! the same process while synchronous dispatch (delivery.rs) already
//! handles the common case, to avoid double delivery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::CreateKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::circuit::CircuitBreakerManager;
use crate::maildir::MaildirStore;
use crate::subscription::SubscriptionRegistry;

/// Watches `new/` under every registered endpoint's maildir and pushes
/// arrivals to matching subscribers when no synchronous dispatch already
/// claimed them.
pub struct WatcherManager {
    maildir: Arc<MaildirStore>,
    subscriptions: SubscriptionRegistry,
    breakers: Arc<CircuitBreakerManager>,
    watched: Vec<(String, String, PathBuf)>,
}

impl WatcherManager {
    pub fn new(
        maildir: Arc<MaildirStore>,
        subscriptions: SubscriptionRegistry,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            maildir,
            subscriptions,
            breakers,
            watched: Vec::new(),
        }
    }

    /// Register an endpoint's `new/` directory for watching. Idempotent.
    pub fn add_endpoint(&mut self, endpoint_subject: &str, endpoint_hash: &str, new_dir: PathBuf) {
        if !self.watched.iter().any(|(_, h, _)| h == endpoint_hash) {
            self.watched
                .push((endpoint_subject.to_string(), endpoint_hash.to_string(), new_dir));
        }
    }

    /// Spawn the watcher on a dedicated background task. Consumes `self`;
    /// call once after all endpoints are registered at startup.
    pub fn run(self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Map watched directory -> (endpoint subject, endpoint hash), since
        // notify events carry only paths.
        let mut dir_to_endpoint = std::collections::HashMap::new();
        for (subject, hash, dir) in &self.watched {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(path = %dir.display(), err = %e, "could not create new/ dir — skipping watch");
                continue;
            }
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(path = %dir.display(), err = %e, "could not watch endpoint new/");
            } else {
                info!(path = %dir.display(), endpoint_hash = %hash, "watching endpoint new/");
                dir_to_endpoint.insert(dir.clone(), (subject.clone(), hash.clone()));
            }
        }

        let maildir = self.maildir.clone();
        let subscriptions = self.subscriptions.clone();
        let breakers = self.breakers.clone();

        tokio::spawn(async move {
            let _watcher = watcher;
            while let Some(event_res) = rx.recv().await {
                match event_res {
                    Ok(event) => {
                        if let EventKind::Create(CreateKind::File) = event.kind {
                            for path in &event.paths {
                                if let Some(parent) = path.parent() {
                                    if let Some((subject, hash)) = dir_to_endpoint.get(parent) {
                                        handle_new_file(path, subject, hash, &maildir, &subscriptions, &breakers)
                                            .await;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!(err = %e, "endpoint watcher error"),
                }
            }
        });

        Ok(())
    }
}

async fn handle_new_file(
    path: &Path,
    endpoint_subject: &str,
    endpoint_hash: &str,
    maildir: &MaildirStore,
    subscriptions: &SubscriptionRegistry,
    breakers: &CircuitBreakerManager,
) {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_string(),
        None => return,
    };

    let raw_envelope = match maildir.read_envelope(endpoint_hash, "new", &name).await {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "watcher failed to read new envelope");
            return;
        }
    };

    debug!(id = %raw_envelope.id, subject = %raw_envelope.subject, "watcher observed new envelope");

    let handlers = subscriptions.get_subscribers(&raw_envelope.subject);
    if handlers.is_empty() {
        // Nothing registered to consume it yet — leave it in new/.
        return;
    }

    // Mirrors delivery.rs: the file on disk holds the as-published budget,
    // advanced once here — not on write — so hop count and ancestor chain
    // stay correct regardless of which path (synchronous or watcher)
    // performs the dispatch (spec.md §4.11, §8 invariant 7).
    let envelope = {
        let mut e = raw_envelope.clone();
        e.budget = raw_envelope.budget.advance(endpoint_subject);
        e
    };

    let mut failure: Option<String> = None;
    for handler in &handlers {
        if let Err(e) = handler(&envelope) {
            failure = Some(e.to_string());
            break;
        }
    }

    match failure {
        Some(reason) => {
            if let Err(e) = maildir.mark_failed(endpoint_hash, &name, &reason).await {
                warn!(path = %path.display(), err = %e, "watcher failed to mark failed");
            }
            breakers.record_failure(endpoint_hash);
        }
        None => {
            if let Err(e) = maildir.mark_processed(endpoint_hash, &name).await {
                warn!(path = %path.display(), err = %e, "watcher failed to mark processed");
            }
            breakers.record_success(endpoint_hash);
        }
    }
}
