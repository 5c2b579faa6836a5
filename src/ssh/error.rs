// ABOUTME: SSH-specific error types.
// ABOUTME: Covers identity lookup, client config, keys, connection, streaming and transfer failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to determine local user: {0}")]
    IdentityLookup(String),

    #[error("error in SSH config {}:{line}: {reason}", .path.display())]
    ConfigParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to read SSH config {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse private key from {origin}: {reason}")]
    KeyParse { origin: String, reason: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed for user {user}: no offered method was accepted")]
    AuthenticationFailed { user: String },

    #[error("failed to set up command stream: {0}")]
    StreamSetup(String),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
