// SPDX-License-Identifier: MIT
//! Typed errors surfaced to callers of the [`crate::Relay`] facade.
//!
//! Everything else — budget rejections, reliability rejections, adapter
//! timeouts — is reported structurally in a publish result rather than
//! through this enum (spec.md §6.4, §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid subject: {reason}")]
    InvalidSubject { reason: String },

    #[error("endpoint already registered: {subject}")]
    DuplicateEndpoint { subject: String },

    #[error("endpoint not found: {subject}")]
    EndpointNotFound { subject: String },

    #[error("access denied: {from} -> {to}")]
    AccessDenied { from: String, to: String },

    #[error("relay is closed")]
    RelayClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
