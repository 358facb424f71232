//! Error taxonomy shared by every subsystem.
//!
//! The HTTP layer maps these onto status codes (`NotFound` → 404,
//! `Conflict` → 409, `Invalid` → 400, `Upstream` → 502/500); the core only
//! cares about the categories.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A VM, forwarder rule, base image, or volume does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Name collision, listen-triple collision, locked VM, or wrong state.
    #[error("{0}")]
    Conflict(String),

    /// Malformed size, CIDR, or name.
    #[error("{0}")]
    Invalid(String),

    /// QMP, shell, or I/O failure, wrapped with context.
    #[error("{context}: {source:#}")]
    Upstream {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// QMP deadline or retry exhaustion.
    #[error("{0} timed out")]
    Timeout(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn upstream(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Upstream {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Error::Timeout(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
