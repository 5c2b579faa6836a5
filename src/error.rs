// ABOUTME: Application-wide error types for sshot.
// ABOUTME: Wraps SSH errors and adds failures only the CLI reports.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ssh(#[from] crate::ssh::Error),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("remote command exited with status {0}")]
    CommandExited(u32),

    #[error("remote command did not finish: {0}")]
    CommandAborted(String),
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Mirror the remote status like ssh(1) does, clamped to a valid code.
            Error::CommandExited(status) => i32::try_from(*status).unwrap_or(255).clamp(1, 255),
            _ => 255,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
