// ABOUTME: Connection parameter resolution.
// ABOUTME: Merges a "user@host" target with the matching ~/.ssh/config stanza and explicit overrides.

use super::client::HostKeyPolicy;
use super::config::{self, DEFAULT_PORT};
use super::error::Result;
use super::target::{LocalIdentity, Target};
use std::path::PathBuf;

/// Everything needed to open a session.
#[derive(Clone)]
pub struct ConnectionParameters {
    /// Username for authentication.
    pub user: String,
    /// Address to dial.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Private key file, consulted only when `key_data` is absent.
    pub key_path: Option<PathBuf>,
    /// Raw private key material (OpenSSH or PEM text).
    pub key_data: Option<Vec<u8>>,
    pub password: Option<String>,
    pub host_key_policy: HostKeyPolicy,
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host_key_policy", &self.host_key_policy)
            .finish()
    }
}

impl ConnectionParameters {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        host_key_policy: HostKeyPolicy,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            key_path: None,
            key_data: None,
            password: None,
            host_key_policy,
        }
    }

    /// Resolve `[user@]host` for the invoking user.
    pub fn resolve(target: &str, host_key_policy: HostKeyPolicy) -> Result<Self> {
        let identity = LocalIdentity::current()?;
        Self::resolve_for(target, &identity, host_key_policy)
    }

    /// Resolve `[user@]host` against `identity`'s `~/.ssh/config`.
    ///
    /// A stanza whose alias equals the target host supplies host, port,
    /// user and key. A user written in the target string still wins over
    /// the stanza's `User`.
    pub fn resolve_for(
        target: &str,
        identity: &LocalIdentity,
        host_key_policy: HostKeyPolicy,
    ) -> Result<Self> {
        let target = Target::parse(target, identity);

        let stanza = match identity.ssh_config_path() {
            Some(path) => config::load_host(&path, &target.host, identity.home())?,
            None => None,
        };

        let Some(stanza) = stanza else {
            return Ok(Self::new(target.host, target.user, host_key_policy));
        };

        tracing::debug!(alias = %target.host, host = %stanza.host, "using SSH config stanza");

        // A stanza without User leaves the user empty unless the target
        // named one; fall back to the local account so it is never empty.
        let user = if target.explicit_user {
            target.user
        } else {
            stanza.user.unwrap_or(target.user)
        };

        Ok(Self {
            user,
            host: stanza.host,
            port: stanza.port,
            key_path: stanza.identity_file,
            key_data: None,
            password: None,
            host_key_policy,
        })
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn key_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.key_data = Some(data.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }
}
