// SPDX-License-Identifier: MIT
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use relay::access::{AccessRule, RuleAction};
use relay::index::MessageFilter;
use relay::{PublishOptions, Relay};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relay-cli", about = "Local file-backed message bus", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory holding mailboxes, the SQLite index, and config files
    #[arg(long, global = true, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RELAY_LOG", default_value = "info")]
    log: String,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a message onto a subject.
    ///
    /// Examples:
    ///   relay-cli publish relay.agent.backend '{"op":"ping"}' --from relay.agent.cli
    Publish {
        /// Destination subject
        subject: String,
        /// JSON payload
        payload: String,
        #[arg(long, default_value = "relay.cli")]
        from: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Register a durable endpoint for a subject.
    ///
    /// Examples:
    ///   relay-cli register-endpoint relay.agent.backend
    RegisterEndpoint {
        subject: String,
    },
    /// List all registered endpoints.
    ListEndpoints,
    /// Subscribe to a subject pattern and print deliveries until Ctrl-C.
    ///
    /// Examples:
    ///   relay-cli subscribe 'relay.agent.*'
    Subscribe {
        pattern: String,
    },
    /// Print the dead-letter queue, optionally filtered to one endpoint.
    ///
    /// Examples:
    ///   relay-cli dead-letters
    ///   relay-cli dead-letters --endpoint-hash abc123 --limit 20
    DeadLetters {
        #[arg(long)]
        endpoint_hash: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// List recent messages from the index, newest first.
    Messages {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Drain an endpoint's undelivered mailbox (new/) to stdout.
    ///
    /// Examples:
    ///   relay-cli read-inbox relay.agent.backend --limit 10
    ReadInbox {
        subject: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Print aggregate bus metrics (message counts, uptime).
    Metrics,
    /// Drop and rebuild the SQLite index from the files on disk.
    RebuildIndex,
    /// Manage access-control rules.
    #[command(subcommand)]
    Access(AccessCommand),
}

#[derive(Subcommand)]
enum AccessCommand {
    /// Add or replace an allow/deny rule.
    ///
    /// Examples:
    ///   relay-cli access add relay.agent.cli relay.agent.backend --action allow --priority 10
    Add {
        from: String,
        to: String,
        #[arg(long, default_value = "allow")]
        action: String,
        #[arg(long, default_value = "0")]
        priority: i64,
    },
    /// Remove the rule matching this from/to pair.
    Remove { from: String, to: String },
    /// List all access rules, highest priority first.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(args.log.clone()).compact().init();

    let data_dir = args.data_dir.unwrap_or_else(relay::config::default_data_dir);
    let relay = Relay::open(&data_dir).await.context("failed to open relay")?;

    match args.command {
        Command::Publish { subject, payload, from, reply_to } => {
            let value: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let result = relay
                .publish(&subject, value, PublishOptions { from, reply_to, budget: None })
                .await?;
            print_json_or(args.json, &result, || {
                println!("published: {}", result.message_id);
                println!("delivered to {} endpoint(s)", result.delivered_to);
                for r in &result.rejected {
                    println!("  rejected: {} ({})", r.endpoint_hash, r.reason);
                }
            });
        }

        Command::Subscribe { pattern } => {
            println!("subscribed to '{pattern}' — waiting for messages (Ctrl-C to stop)");
            let _unsubscribe = relay.subscribe(
                &pattern,
                Arc::new(move |envelope| {
                    println!(
                        "{} {} <- {}: {}",
                        envelope.id, envelope.subject, envelope.from, envelope.payload
                    );
                    Ok(())
                }),
            )?;
            tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
            println!("stopping.");
        }

        Command::RegisterEndpoint { subject } => {
            let info = relay.register_endpoint(&subject).await?;
            print_json_or(args.json, &info, || {
                println!("registered: {} -> {}", info.subject, info.hash);
            });
        }

        Command::ListEndpoints => {
            let endpoints = relay.list_endpoints()?;
            print_json_or(args.json, &endpoints, || {
                if endpoints.is_empty() {
                    println!("No endpoints registered.");
                } else {
                    println!("{:<40} {:<14} REGISTERED", "SUBJECT", "HASH");
                    for e in &endpoints {
                        println!("{:<40} {:<14} {}", e.subject, e.hash, e.registered_at);
                    }
                }
            });
        }

        Command::DeadLetters { endpoint_hash, limit } => {
            let entries = relay.get_dead_letters(endpoint_hash.as_deref(), limit).await?;
            print_json_or(args.json, &entries, || {
                if entries.is_empty() {
                    println!("No dead letters.");
                } else {
                    for e in &entries {
                        println!(
                            "[{}] {} from={} hash={} reason={}",
                            e.created_at, e.subject, e.sender, e.endpoint_hash, e.reason
                        );
                    }
                }
            });
        }

        Command::Messages { subject, sender, cursor, limit } => {
            let page = relay
                .list_messages(MessageFilter {
                    subject,
                    sender,
                    cursor,
                    limit,
                    status: None,
                    endpoint_hash: None,
                })
                .await?;
            print_json_or(args.json, &page, || {
                for m in &page.items {
                    println!("{} {} {} <- {}", m.id, m.created_at, m.subject, m.sender);
                }
                if let Some(c) = &page.next_cursor {
                    println!("next cursor: {c}");
                }
            });
        }

        Command::ReadInbox { subject, limit } => {
            let envelopes = relay.read_inbox(&subject, limit).await?;
            print_json_or(args.json, &envelopes, || {
                if envelopes.is_empty() {
                    println!("Inbox is empty.");
                } else {
                    for e in &envelopes {
                        println!("{} {} <- {}: {}", e.id, e.subject, e.from, e.payload);
                    }
                }
            });
        }

        Command::Metrics => {
            let metrics = relay.get_metrics().await?;
            print_json_or(args.json, &metrics, || {
                println!("total messages: {}", metrics.total_messages);
                println!("uptime: {}s", metrics.uptime_secs);
                for (status, count) in &metrics.by_status {
                    println!("  {status}: {count}");
                }
            });
        }

        Command::RebuildIndex => {
            let n = relay.rebuild_index().await?;
            if !args.json {
                println!("rebuilt index: {n} message(s)");
            } else {
                println!("{}", serde_json::json!({ "rebuilt": n }));
            }
        }

        Command::Access(action) => match action {
            AccessCommand::Add { from, to, action, priority } => {
                let action = match action.as_str() {
                    "deny" => RuleAction::Deny,
                    _ => RuleAction::Allow,
                };
                relay.add_access_rule(AccessRule { from, to, action, priority }).await?;
                if !args.json {
                    println!("rule added.");
                }
            }
            AccessCommand::Remove { from, to } => {
                let removed = relay.remove_access_rule(&from, &to).await?;
                if !args.json {
                    if removed {
                        println!("rule removed.");
                    } else {
                        println!("no matching rule.");
                    }
                }
            }
            AccessCommand::List => {
                let rules = relay.list_access_rules().await?;
                print_json_or(args.json, &rules, || {
                    if rules.is_empty() {
                        println!("No access rules.");
                    } else {
                        for r in &rules {
                            println!("{:>4} {:?} {} -> {}", r.priority, r.action, r.from, r.to);
                        }
                    }
                });
            }
        },
    }

    Ok(())
}

fn print_json_or<T: serde::Serialize>(json: bool, value: &T, human: impl FnOnce()) {
    if json {
        match serde_json::to_string(value) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to serialize output: {e}"),
        }
    } else {
        human();
    }
}
