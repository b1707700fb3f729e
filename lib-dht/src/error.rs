//! Error taxonomy (spec.md §7).
//!
//! Configuration errors fail fast at `Runner::run`. Everything else is a
//! `DhtError` variant surfaced through an `on_done`/`on_value` callback or
//! a `Result` from a synchronous accessor; none of these unwind past the
//! I/O thread's top-level loop.

use crate::id::IdHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    /// No nodes were reachable to complete a search.
    #[error("search for {target} failed: no nodes reachable")]
    SearchFailed { target: IdHash },

    /// A value was rejected by a filter predicate or remote policy.
    #[error("value rejected: {reason}")]
    ValueRejected { reason: String },

    /// A signature or encryption requirement was violated.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// A local storage capacity limit was hit for a permanent put.
    #[error("local storage overflow for key {key}")]
    LocalOverflow { key: IdHash },

    /// The remote rejected our write-token (or we never obtained one).
    #[error("token rejected or missing for key {key}")]
    TokenRejected { key: IdHash },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The Runner is shutting down or has entered a degraded state.
    #[error("runner is not accepting new operations")]
    NotRunning,
}

/// Configuration errors that fail fast at `Runner::run` rather than being
/// delivered through a callback.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("failed to bind UDP socket on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("crypto initialization failed: {0}")]
    CryptoInit(String),

    #[error("invalid persist path: {0}")]
    InvalidPersistPath(String),
}
