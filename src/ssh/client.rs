// ABOUTME: SSH session establishment using russh.
// ABOUTME: Handles host key verification, ordered authentication fallback and channel opening.

use super::error::{Error, Result};
use super::params::ConnectionParameters;
use russh::client::{self, Config, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, load_secret_key, ssh_key};
use russh::{Channel, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

/// How the server's host key is verified.
///
/// Has no default; callers choose a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key. Insecure; vulnerable to man-in-the-middle.
    AcceptAny,
    /// Check against a known_hosts file.
    KnownHosts {
        /// known_hosts file to use; `None` means `~/.ssh/known_hosts`.
        path: Option<PathBuf>,
        /// Accept and record keys of hosts not yet in the file.
        trust_on_first_use: bool,
    },
    /// Accept only a key with this SHA-256 fingerprint (`SHA256:...`).
    Fingerprint(String),
}

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl SshHandler {
    fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }

    fn check_known_hosts(
        &self,
        server_public_key: &ssh_key::PublicKey,
        path: Option<&PathBuf>,
        trust_on_first_use: bool,
    ) -> bool {
        let check_result = match path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => true,
            Ok(false) if trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting unknown host key for {}:{}",
                    self.host,
                    self.port
                );
                let learn_result = match path {
                    Some(path) => {
                        learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                    }
                    None => learn_known_hosts(&self.host, self.port, server_public_key),
                };
                if let Err(e) = learn_result {
                    tracing::warn!("Failed to save host key to known_hosts: {}", e);
                }
                true
            }
            Ok(false) => {
                tracing::debug!("host {}:{} not in known_hosts", self.host, self.port);
                false
            }
            Err(russh::keys::Error::KeyChanged { .. }) => {
                tracing::warn!("host key for {}:{} has changed", self.host, self.port);
                false
            }
            Err(_) => trust_on_first_use,
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let accepted = match &self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::warn!(
                    "accepting host key for {}:{} without verification",
                    self.host,
                    self.port
                );
                true
            }
            HostKeyPolicy::KnownHosts {
                path,
                trust_on_first_use,
            } => self.check_known_hosts(server_public_key, path.as_ref(), *trust_on_first_use),
            HostKeyPolicy::Fingerprint(expected) => {
                fingerprint_matches(server_public_key, expected)
            }
        };
        Ok(accepted)
    }
}

fn fingerprint_matches(key: &ssh_key::PublicKey, expected: &str) -> bool {
    let actual = key.fingerprint(ssh_key::HashAlg::Sha256).to_string();
    let matches = actual == expected.trim();
    if !matches {
        tracing::warn!("host key fingerprint {} does not match pinned {}", actual, expected);
    }
    matches
}

/// Authentication method, in the order they are offered.
enum AuthMethod {
    Password(String),
    Key(Arc<ssh_key::PrivateKey>),
    Agent(AgentClient<UnixStream>),
}

impl AuthMethod {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::Key(_) => "publickey",
            AuthMethod::Agent(_) => "agent",
        }
    }
}

/// Load the private key to offer, if any.
///
/// Raw key data is preferred over a key file; when present the file is
/// never read. Any parse or read failure is fatal.
fn resolve_private_key(params: &ConnectionParameters) -> Result<Option<ssh_key::PrivateKey>> {
    if let Some(data) = params.key_data.as_deref().filter(|d| !d.is_empty()) {
        let text = std::str::from_utf8(data).map_err(|e| Error::KeyParse {
            origin: "key data".to_string(),
            reason: e.to_string(),
        })?;
        let key = decode_secret_key(text, None).map_err(|e| Error::KeyParse {
            origin: "key data".to_string(),
            reason: e.to_string(),
        })?;
        return Ok(Some(key));
    }

    if let Some(key_path) = &params.key_path {
        let key = load_secret_key(key_path, None).map_err(|e| Error::KeyParse {
            origin: key_path.display().to_string(),
            reason: e.to_string(),
        })?;
        return Ok(Some(key));
    }

    Ok(None)
}

/// Collect every method the parameters allow, highest priority first.
async fn resolve_auth_methods(params: &ConnectionParameters) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(password) = params.password.as_deref().filter(|p| !p.is_empty()) {
        methods.push(AuthMethod::Password(password.to_string()));
    }

    if let Some(key) = resolve_private_key(params)? {
        methods.push(AuthMethod::Key(Arc::new(key)));
    }

    match AgentClient::connect_env().await {
        Ok(agent) => methods.push(AuthMethod::Agent(agent)),
        Err(e) => tracing::debug!("SSH agent not available: {}", e),
    }

    Ok(methods)
}

/// An established SSH connection with one session channel open.
///
/// A session runs exactly one command or upload and is then closed.
pub struct Session {
    user: String,
    host: String,
    port: u16,
    handle: Handle<SshHandler>,
    pub(crate) channel: Channel<Msg>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Session {
    /// Connect, authenticate and open a session channel.
    pub async fn connect(params: &ConnectionParameters) -> Result<Self> {
        let methods = resolve_auth_methods(params).await?;

        let russh_config = Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        };

        let handler = SshHandler::new(
            params.host.clone(),
            params.port,
            params.host_key_policy.clone(),
        );

        tracing::debug!("connecting to {}:{} as {}", params.host, params.port, params.user);

        let mut handle = client::connect(
            Arc::new(russh_config),
            (params.host.as_str(), params.port),
            handler,
        )
        .await
        .map_err(|e| Error::Connection(format!("{}:{}: {}", params.host, params.port, e)))?;

        if !Self::authenticate(&mut handle, &params.user, methods).await? {
            return Err(Error::AuthenticationFailed {
                user: params.user.clone(),
            });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Connection(format!("failed to open session: {}", e)))?;

        Ok(Self {
            user: params.user.clone(),
            host: params.host.clone(),
            port: params.port,
            handle,
            channel,
        })
    }

    /// Try each method in order until the server accepts one.
    async fn authenticate(
        handle: &mut Handle<SshHandler>,
        user: &str,
        methods: Vec<AuthMethod>,
    ) -> Result<bool> {
        for method in methods {
            let name = method.name();
            let accepted = match method {
                AuthMethod::Password(password) => handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(Error::Protocol)?
                    .success(),
                AuthMethod::Key(key) => {
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(Error::Protocol)?
                        .flatten();

                    handle
                        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                        .await
                        .map_err(Error::Protocol)?
                        .success()
                }
                AuthMethod::Agent(mut agent) => {
                    Self::authenticate_with_agent(handle, user, &mut agent).await
                }
            };

            if accepted {
                tracing::debug!("authenticated as {} via {}", user, name);
                return Ok(true);
            }
            tracing::debug!("server rejected {} authentication for {}", name, user);
        }
        Ok(false)
    }

    async fn authenticate_with_agent(
        handle: &mut Handle<SshHandler>,
        user: &str,
        agent: &mut AgentClient<UnixStream>,
    ) -> bool {
        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!("failed to list agent keys: {}", e);
                return false;
            }
        };

        for key in &keys {
            match handle
                .authenticate_publickey_with(user, key.clone(), None, agent)
                .await
            {
                Ok(result) if result.success() => return true,
                _ => continue,
            }
        }
        false
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Split into the channel and a closer for the connection.
    pub(crate) fn into_parts(self) -> (Channel<Msg>, SessionCloser) {
        let closer = SessionCloser {
            host: self.host,
            handle: self.handle,
        };
        (self.channel, closer)
    }
}

/// Owns the connection after its channel has been handed to a task.
pub(crate) struct SessionCloser {
    host: String,
    handle: Handle<SshHandler>,
}

impl SessionCloser {
    /// Close `channel` and disconnect, logging rather than returning failures.
    pub(crate) async fn close(&self, channel: &Channel<Msg>) {
        if let Err(e) = channel.close().await {
            tracing::debug!("closing channel to {} failed: {}", self.host, e);
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::warn!("SSH disconnect failed for {}: {}", self.host, e);
        }
    }
}
