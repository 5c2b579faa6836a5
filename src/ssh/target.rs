// ABOUTME: Connection target parsing and local identity discovery.
// ABOUTME: Splits "user@host" strings and supplies the invoking account as fallback user.

use super::error::{Error, Result};
use std::path::{Path, PathBuf};

/// The local account running this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Login name of the invoking user.
    pub username: String,
    /// Home directory, when one could be determined.
    pub home: Option<PathBuf>,
}

impl LocalIdentity {
    pub fn new(username: impl Into<String>, home: Option<PathBuf>) -> Self {
        Self {
            username: username.into(),
            home,
        }
    }

    /// Look up the invoking user's account name and home directory.
    pub fn current() -> Result<Self> {
        let username =
            whoami::fallible::username().map_err(|e| Error::IdentityLookup(e.to_string()))?;
        Ok(Self {
            username,
            home: dirs::home_dir(),
        })
    }

    /// Conventional per-user client config location (`~/.ssh/config`).
    pub fn ssh_config_path(&self) -> Option<PathBuf> {
        self.home.as_deref().map(|home| home.join(".ssh").join("config"))
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }
}

/// A parsed `[user@]host` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    /// Whether the user came from the target string rather than the local account.
    pub explicit_user: bool,
}

impl Target {
    /// Split `target` at its first `@`.
    ///
    /// Without an `@` the whole string is the host and the user is the
    /// local account name.
    pub fn parse(target: &str, identity: &LocalIdentity) -> Self {
        match target.split_once('@') {
            Some((user, host)) => Self {
                user: user.to_string(),
                host: host.to_string(),
                explicit_user: true,
            },
            None => Self {
                user: identity.username.clone(),
                host: target.to_string(),
                explicit_user: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity() -> LocalIdentity {
        LocalIdentity::new("localuser", Some(PathBuf::from("/home/localuser")))
    }

    #[test]
    fn user_at_host_is_split() {
        let target = Target::parse("blub@bla", &identity());
        assert_eq!(target.user, "blub");
        assert_eq!(target.host, "bla");
        assert!(target.explicit_user);
    }

    #[test]
    fn bare_host_uses_local_account() {
        let target = Target::parse("blubber", &identity());
        assert_eq!(target.user, "localuser");
        assert_eq!(target.host, "blubber");
        assert!(!target.explicit_user);
    }

    #[test]
    fn only_first_at_separates_user() {
        let target = Target::parse("a@b@c", &identity());
        assert_eq!(target.user, "a");
        assert_eq!(target.host, "b@c");
    }

    #[test]
    fn config_path_is_under_home() {
        assert_eq!(
            identity().ssh_config_path(),
            Some(PathBuf::from("/home/localuser/.ssh/config"))
        );
        assert_eq!(LocalIdentity::new("x", None).ssh_config_path(), None);
    }

    #[test]
    fn current_identity_reads_home_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        temp_env::with_var("HOME", Some(dir.path()), || {
            let identity = LocalIdentity::current().unwrap();
            assert!(!identity.username.is_empty());
            assert_eq!(identity.home.as_deref(), Some(dir.path()));
        });
    }

    proptest! {
        #[test]
        fn explicit_user_round_trips(user in "[a-z_][a-z0-9_.-]{0,15}", host in "[a-z0-9.-]{1,30}") {
            let target = Target::parse(&format!("{user}@{host}"), &identity());
            prop_assert_eq!(target.user, user);
            prop_assert_eq!(target.host, host);
        }

        #[test]
        fn bare_string_is_host(host in "[^@]{0,40}") {
            let target = Target::parse(&host, &identity());
            prop_assert_eq!(target.user, "localuser");
            prop_assert_eq!(target.host, host);
        }
    }
}
