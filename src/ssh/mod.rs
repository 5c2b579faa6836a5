// ABOUTME: SSH client module for one-shot remote commands and file uploads.
// ABOUTME: Resolves ~/.ssh/config targets, authenticates with fallback, streams output and pushes files.

mod client;
mod config;
mod error;
mod params;
mod stream;
mod target;
mod upload;

pub use client::{HostKeyPolicy, Session};
pub use config::{DEFAULT_PORT, HostStanza, ParseError, find_host, load_host};
pub use error::{Error, Result};
pub use params::ConnectionParameters;
pub use stream::{CommandStream, Completion, run_command, stream_command};
pub use target::{LocalIdentity, Target};
pub use upload::upload_file;
