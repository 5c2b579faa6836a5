// ABOUTME: Minimal OpenSSH client config reader.
// ABOUTME: Extracts Hostname/User/IdentityFile/Port from the first Host stanza matching an alias.

use super::error::{Error, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Port used when a stanza has no `Port` directive.
pub const DEFAULT_PORT: u16 = 22;

/// `key value` with surrounding whitespace; anything else on the line is ignored.
static DIRECTIVE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\s*([A-Za-z0-9_]+)\s+(\S+)\s*").expect("directive pattern is valid")
});

/// Settings taken from the matching `Host` stanza.
///
/// Only exact alias equality selects a stanza. Unlike OpenSSH, patterns are
/// not globbed and later matching stanzas are never merged in: scanning stops
/// at the first `Host` line after the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStanza {
    /// Address to dial; the alias itself unless `Hostname` overrides it.
    pub host: String,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: u16,
}

impl HostStanza {
    fn new(alias: &str) -> Self {
        Self {
            host: alias.to_string(),
            user: None,
            identity_file: None,
            port: DEFAULT_PORT,
        }
    }
}

/// Why a config stream could not be scanned.
#[derive(Debug)]
pub enum ParseError {
    Read(std::io::Error),
    Directive { line: usize, reason: String },
}

/// Scan `reader` for the stanza whose `Host` value equals `alias`.
///
/// Lines are decoded lossily, so stray non-UTF-8 bytes never fail the scan.
/// Returns `Ok(None)` when no stanza matches. `home` expands `~/` in
/// `IdentityFile` values; a `~/` value with no home directory fails the scan.
pub fn find_host<R: BufRead>(
    reader: R,
    alias: &str,
    home: Option<&Path>,
) -> std::result::Result<Option<HostStanza>, ParseError> {
    let mut stanza: Option<HostStanza> = None;

    for (index, line) in reader.split(b'\n').enumerate() {
        let line = line.map_err(ParseError::Read)?;
        let line = String::from_utf8_lossy(&line);
        let Some(caps) = DIRECTIVE.captures(&line) else {
            continue;
        };
        let key = caps[1].to_lowercase();
        let value = &caps[2];

        match key.as_str() {
            "host" => {
                if stanza.is_some() {
                    break;
                }
                if value == alias {
                    stanza = Some(HostStanza::new(value));
                }
            }
            "hostname" => {
                if let Some(s) = stanza.as_mut() {
                    s.host = value.to_string();
                }
            }
            "user" => {
                if let Some(s) = stanza.as_mut() {
                    s.user = Some(value.to_string());
                }
            }
            "identityfile" => {
                if let Some(s) = stanza.as_mut() {
                    s.identity_file = Some(expand_home(value, home, index + 1)?);
                }
            }
            "port" => {
                if let Some(s) = stanza.as_mut() {
                    s.port = value.parse().map_err(|_| ParseError::Directive {
                        line: index + 1,
                        reason: format!("invalid port: {value}"),
                    })?;
                }
            }
            _ => {}
        }
    }

    Ok(stanza)
}

fn expand_home(
    value: &str,
    home: Option<&Path>,
    line: usize,
) -> std::result::Result<PathBuf, ParseError> {
    match value.strip_prefix("~/") {
        Some(rest) => home
            .map(|home| home.join(rest))
            .ok_or_else(|| ParseError::Directive {
                line,
                reason: format!("cannot expand {value}: home directory unknown"),
            }),
        None => Ok(PathBuf::from(value)),
    }
}

/// Read the config file at `path` and look up `alias`.
///
/// A missing file is not an error and yields `None`.
pub fn load_host(path: &Path, alias: &str, home: Option<&Path>) -> Result<Option<HostStanza>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no SSH config at {}", path.display());
            return Ok(None);
        }
        Err(source) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    find_host(std::io::BufReader::new(file), alias, home).map_err(|e| match e {
        ParseError::Read(source) => Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        },
        ParseError::Directive { line, reason } => Error::ConfigParse {
            path: path.to_path_buf(),
            line,
            reason,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HOME: &str = "/home/tester";

    fn find(text: &str, alias: &str) -> Option<HostStanza> {
        find_host(text.as_bytes(), alias, Some(Path::new(HOME))).unwrap()
    }

    #[test]
    fn resolves_stanza_among_others() {
        let cfg = "
Host notthisone\t


     Host
Host bla
\tHostname hostname
\tHostname 1.2.3.4
\tUser ubuntu
\tIdentityFile\t~/.ssh/bluurp.pem
Host anotherOne
User user
";
        let stanza = find(cfg, "bla").unwrap();
        assert_eq!(
            stanza,
            HostStanza {
                host: "1.2.3.4".to_string(),
                user: Some("ubuntu".to_string()),
                identity_file: Some(PathBuf::from("/home/tester/.ssh/bluurp.pem")),
                port: 22,
            }
        );
    }

    #[test]
    fn keys_are_case_insensitive() {
        let cfg = "HOST web\n  HOSTNAME 10.0.0.1\n  pOrT 2222\n";
        let stanza = find(cfg, "web").unwrap();
        assert_eq!(stanza.host, "10.0.0.1");
        assert_eq!(stanza.port, 2222);
    }

    #[test]
    fn later_stanza_does_not_leak() {
        let cfg = "Host a\nUser first\nHost b\nUser second\nPort 2200\nHostname other\n";
        let stanza = find(cfg, "a").unwrap();
        assert_eq!(stanza.user.as_deref(), Some("first"));
        assert_eq!(stanza.port, 22);
        assert_eq!(stanza.host, "a");
    }

    #[test]
    fn directives_before_match_are_ignored() {
        let cfg = "User global\nHost a\nPort 1\nHost b\n";
        let stanza = find(cfg, "b").unwrap();
        assert_eq!(stanza.user, None);
        assert_eq!(stanza.port, 22);
    }

    #[test]
    fn no_globbing() {
        assert_eq!(find("Host *\nUser star\n", "anything"), None);
        assert_eq!(find("Host web*\nUser star\n", "web1"), None);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let cfg = "Host a\nForwardAgent yes\nUser me\n";
        assert_eq!(find(cfg, "a").unwrap().user.as_deref(), Some("me"));
    }

    #[test]
    fn absolute_identity_file_kept() {
        let cfg = "Host a\nIdentityFile /keys/id\n";
        assert_eq!(
            find(cfg, "a").unwrap().identity_file,
            Some(PathBuf::from("/keys/id"))
        );
    }

    #[test]
    fn tilde_without_home_fails() {
        let err = find_host("Host a\nIdentityFile ~/.ssh/id\n".as_bytes(), "a", None).unwrap_err();
        assert!(matches!(err, ParseError::Directive { line: 2, .. }));
    }

    #[test]
    fn invalid_port_fails() {
        let err = find_host("Host a\nPort ssh\n".as_bytes(), "a", None).unwrap_err();
        assert!(matches!(err, ParseError::Directive { line: 2, .. }));
    }

    #[test]
    fn non_utf8_bytes_are_tolerated() {
        let cfg: &[u8] = b"# caf\xe9 servers\nHost bla\n  Hostname 1.2.3.4\n  User r\xf6ot\n";
        let stanza = find_host(cfg, "bla", None).unwrap().unwrap();
        assert_eq!(stanza.host, "1.2.3.4");
        assert_eq!(stanza.user.as_deref(), Some("r\u{fffd}ot"));
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_host(&dir.path().join("config"), "a", None).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host a\nIdentityFile ~/id\n").unwrap();
        let err = load_host(&path, "a", None).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { line: 2, .. }), "got {err:?}");
    }

    #[test]
    fn unreadable_path_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_host(dir.path(), "a", None).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }), "got {err:?}");
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._-]{1,12}"
    }

    proptest! {
        #[test]
        fn last_directive_wins(
            alias in word(),
            hostnames in prop::collection::vec(word(), 0..3),
            users in prop::collection::vec(word(), 1..3),
            ports in prop::collection::vec(1u16.., 0..3),
            key in word(),
        ) {
            let mut cfg = format!("Host {alias}\n");
            for h in &hostnames { cfg.push_str(&format!("  Hostname {h}\n")); }
            for u in &users { cfg.push_str(&format!("  User {u}\n")); }
            for p in &ports { cfg.push_str(&format!("  Port {p}\n")); }
            cfg.push_str(&format!("  IdentityFile ~/{key}\n"));

            let stanza = find(&cfg, &alias).unwrap();
            prop_assert_eq!(&stanza.host, hostnames.last().unwrap_or(&alias));
            prop_assert_eq!(stanza.user.as_ref(), users.last());
            prop_assert_eq!(stanza.port, ports.last().copied().unwrap_or(DEFAULT_PORT));
            prop_assert_eq!(stanza.identity_file, Some(Path::new(HOME).join(&key)));
        }

        #[test]
        fn unmatched_alias_is_none(aliases in prop::collection::vec(word(), 0..4), wanted in word()) {
            prop_assume!(!aliases.contains(&wanted));
            let cfg: String = aliases.iter().map(|a| format!("Host {a}\nUser u\n")).collect();
            prop_assert_eq!(find(&cfg, &wanted), None);
        }
    }
}
