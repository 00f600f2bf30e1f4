// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

#![allow(clippy::missing_docs_in_private_items)]
#![warn(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_panic_doc,
)]

//! Experiment orchestration for batch-queue HPC clusters.
//!
//! The expd library backs two daemons. The storage daemon keeps every
//! application as a git repository and versions each experiment and each
//! execution as a branch, with label substitution applied at preparation
//! time. The minion daemon owns a single SSH session to a cluster front-end
//! and maps experiment lifecycle calls onto PBS-style `qsub`/`qstat`/`qdel`
//! invocations. Both sides are exposed over the length-prefixed message RPC
//! in [`rpc`].

pub mod cmd;
pub mod config;
pub mod minion;
pub mod rpc;
pub mod storage;
pub mod store;
pub mod utils;

use std::time::Duration;

/// Error variants for the whole expd library.
///
/// Every variant maps onto one of the stable taxonomy kinds surfaced to RPC
/// callers through [`Error::kind`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller handed us something malformed: an absolute path where a
    /// relative one is required, a missing source directory, a bad config.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation is not legal in the entity's current state.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Instance lock entry was removed while a caller still wanted it.
    #[error("instance {0:?} is gone")]
    InstanceGone(String),

    /// Requested entity, file, or branch does not exist.
    #[error("{entity} {id:?} not found")]
    NotFound {
        /// Human name of the entity class ("application", "branch", ...).
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// SSH or document-store connectivity failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A remote or local tool (git, scp, qsub, qdel, qstat) exited non-zero.
    #[error("{program} failed: {message}")]
    RemoteTool {
        /// Program that failed.
        program: String,
        /// Combined "stdout: .. stderr: .." output of the failed call.
        message: String,
    },

    /// Deadline elapsed while a locked operation was in flight.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Repository manipulation failure out of libgit2.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Configuration file failure.
    #[error(transparent)]
    Config(#[from] ::config::ConfigError),
}

impl Error {
    /// Stable taxonomy tag for RPC error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(..) | Error::Json(..) | Error::Config(..) => "input-invalid",
            Error::StateViolation(..) | Error::InstanceGone(..) => "state-violation",
            Error::NotFound { .. } => "not-found",
            Error::Transport(..) | Error::Io(..) => "transport",
            Error::RemoteTool { .. } | Error::Git2(..) => "remote-tool",
            Error::Timeout(..) => "timeout",
        }
    }
}

/// Result type alias for the whole expd library.
pub type Result<T, E = Error> = std::result::Result<T, E>;
