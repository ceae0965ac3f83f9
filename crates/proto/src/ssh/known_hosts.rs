//! OpenSSH known_hosts trust store.
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! Lookups and appends share one normalization: port 22 is written as the bare
//! host, any other port as `[host]:port`.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::known_hosts::{check_known_hosts, learn_known_hosts};
//! use keel_proto::ssh::KeyPair;
//!
//! # fn main() -> keel_platform::KeelResult<()> {
//! let key = KeyPair::generate_ed25519().clone_public_key();
//! if !check_known_hosts("example.com", 22, &key, None)? {
//!     learn_known_hosts("example.com", 22, &key, None)?;
//! }
//! # Ok(())
//! # }
//! ```

use super::config::ServerKeyVerifier;
use super::hostkey::PublicKey;
use super::privatekey::user_ssh_dir;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use keel_platform::{KeelError, KeelResult};
use sha1::Sha1;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
    /// 1-based line number in the source file, 0 when not read from a file
    line: usize,
}

impl KnownHost {
    /// Creates an entry for `host`/`port` carrying `key`.
    pub fn new(host: &str, port: u16, key: &PublicKey) -> Self {
        Self {
            hostname_pattern: host_pattern(host, port),
            key_type: key.key_type().to_string(),
            key_data: key.to_blob(),
            comment: String::new(),
            line: 0,
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Returns the line number this entry was read from.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Decodes the stored key.
    pub fn public_key(&self) -> KeelResult<PublicKey> {
        PublicKey::from_blob(&self.key_data)
    }

    /// Checks if this entry applies to a hostname and port.
    ///
    /// A negated pattern that matches excludes the host even when another
    /// pattern on the same line matches it.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let full_host = host_pattern(hostname, port);
        let mut matched = false;

        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();

            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
                continue;
            }

            if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }

        matched
    }

    /// Parses a single line from a known_hosts file.
    ///
    /// ```rust
    /// use keel_proto::ssh::known_hosts::KnownHost;
    ///
    /// let line = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD user@host";
    /// let entry = KnownHost::parse_line(line).unwrap();
    /// assert_eq!(entry.hostname_pattern(), "example.com");
    /// assert_eq!(entry.key_type(), "ssh-ed25519");
    /// ```
    pub fn parse_line(line: &str) -> KeelResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(KeelError::KeyFormat("Empty or comment line".to_string()));
        }
        if line.starts_with('@') {
            return Err(KeelError::KeyFormat(
                "Marker lines (@cert-authority, @revoked) are not supported".to_string(),
            ));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(KeelError::KeyFormat(
                "Invalid known_hosts line: too few fields (need at least 3)".to_string(),
            ));
        }

        let key_data = STANDARD
            .decode(parts[2])
            .map_err(|e| KeelError::KeyFormat(format!("Invalid base64 key data: {}", e)))?;

        Ok(Self {
            hostname_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data,
            comment: parts[3..].join(" "),
            line: 0,
        })
    }

    fn to_line(&self) -> String {
        let encoded = STANDARD.encode(&self.key_data);
        if self.comment.is_empty() {
            format!("{} {} {}", self.hostname_pattern, self.key_type, encoded)
        } else {
            format!(
                "{} {} {} {}",
                self.hostname_pattern, self.key_type, encoded, self.comment
            )
        }
    }
}

/// Host pattern for `host` and `port`: `host` for port 22, `[host]:port` otherwise.
///
/// Bracketed IPv6 literals are unbracketed first.
pub fn host_pattern(host: &str, port: u16) -> String {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern.as_bytes(), hostname.as_bytes());
    }
    pattern.eq_ignore_ascii_case(hostname)
}

/// `|1|base64(salt)|base64(HMAC-SHA1(salt, hostname))`
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let (Ok(salt), Ok(expected)) = (STANDARD.decode(parts[2]), STANDARD.decode(parts[3])) else {
        return false;
    };
    let Ok(mut hmac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    hmac.update(hostname.as_bytes());
    let computed = hmac.finalize().into_bytes();

    computed.len() == expected.len() && bool::from(computed.ct_eq(&expected[..]))
}

/// Glob match where `*` is any run of bytes and `?` exactly one.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c.eq_ignore_ascii_case(&text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Host key verification status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Host key is known and matches.
    Known,
    /// The host has a different key of the same type.
    Changed {
        /// Line of the conflicting entry
        line: usize,
    },
    /// Host is unknown.
    Unknown,
}

/// Parsed known_hosts file.
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    entries: Vec<KnownHost>,
    path: PathBuf,
}

impl KnownHostsFile {
    /// Creates an empty file bound to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            entries: Vec::new(),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads known_hosts from a file. A missing file yields an empty store.
    pub fn from_file<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Ok(Self::new(path_ref));
        }

        let content = std::fs::read_to_string(path_ref)?;
        let mut file = Self::from_string(&content);
        file.path = path_ref.to_path_buf();
        Ok(file)
    }

    /// Parses known_hosts content. Unparsable lines are skipped.
    pub fn from_string(content: &str) -> Self {
        let mut entries = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match KnownHost::parse_line(trimmed) {
                Ok(mut entry) => {
                    entry.line = index + 1;
                    entries.push(entry);
                }
                Err(e) => warn!("Skipping known_hosts line {}: {}", index + 1, e),
            }
        }

        Self {
            entries,
            path: PathBuf::new(),
        }
    }

    /// Returns the entries.
    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }

    /// Returns the backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks `key` up for `hostname`/`port`.
    ///
    /// Entries of another key type are ignored, so a host may be known under
    /// several key types at once.
    pub fn verify_host_key(&self, hostname: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let key_type = key.key_type();
        let blob = key.to_blob();
        let mut changed = None;

        for entry in &self.entries {
            if entry.key_type() != key_type || !entry.matches(hostname, port) {
                continue;
            }
            if entry.key_data() == blob.as_slice() {
                return HostKeyStatus::Known;
            }
            changed.get_or_insert(entry.line);
        }

        match changed {
            Some(line) => HostKeyStatus::Changed { line },
            None => HostKeyStatus::Unknown,
        }
    }

    /// Adds an entry for `hostname`/`port`.
    pub fn add_host(&mut self, hostname: &str, port: u16, key: &PublicKey) {
        self.entries.push(KnownHost::new(hostname, port, key));
    }

    /// Removes all entries for `hostname`/`port`, returning how many went.
    pub fn remove_host(&mut self, hostname: &str, port: u16) -> usize {
        let initial_count = self.entries.len();
        self.entries.retain(|entry| !entry.matches(hostname, port));
        initial_count - self.entries.len()
    }

    /// Replaces all entries for `hostname`/`port` with one for `key`.
    pub fn update_host(&mut self, hostname: &str, port: u16, key: &PublicKey) {
        self.remove_host(hostname, port);
        self.add_host(hostname, port, key);
    }

    /// Rewrites the whole file through a temporary file and rename.
    pub fn save(&self) -> KeelResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut content = String::new();
        for entry in &self.entries {
            content.push_str(&entry.to_line());
            content.push('\n');
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// `~/.ssh/known_hosts` (`~/ssh/known_hosts` on Windows).
pub fn default_known_hosts_path() -> KeelResult<PathBuf> {
    Ok(user_ssh_dir()?.join("known_hosts"))
}

fn resolve(path: Option<&Path>) -> KeelResult<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => default_known_hosts_path(),
    }
}

/// Returns `Ok(true)` if `host`/`port` is recorded with `key`.
///
/// # Errors
///
/// [`KeelError::HostKeyChanged`] when the host is recorded with a different
/// key of the same type.
pub fn check_known_hosts(
    host: &str,
    port: u16,
    key: &PublicKey,
    path: Option<&Path>,
) -> KeelResult<bool> {
    let path = resolve(path)?;
    let file = KnownHostsFile::from_file(&path)?;

    match file.verify_host_key(host, port, key) {
        HostKeyStatus::Known => Ok(true),
        HostKeyStatus::Unknown => Ok(false),
        HostKeyStatus::Changed { line } => Err(KeelError::HostKeyChanged { line }),
    }
}

/// Appends an entry for `host`/`port` to the file, creating it if needed.
pub fn learn_known_hosts(
    host: &str,
    port: u16,
    key: &PublicKey,
    path: Option<&Path>,
) -> KeelResult<()> {
    let path = resolve(path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let needs_newline = match std::fs::read(&path) {
        Ok(existing) => existing.last().is_some_and(|&b| b != b'\n'),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    if needs_newline {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{}", KnownHost::new(host, port, key).to_line())?;

    info!(
        "Added {} key {} to {}",
        host_pattern(host, port),
        key.fingerprint(),
        path.display()
    );
    Ok(())
}

/// Host key checking policy for [`KnownHostsVerifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Reject unknown and changed keys.
    #[default]
    Strict,
    /// Learn unknown hosts, reject changed keys.
    AcceptNew,
    /// Learn unknown hosts and accept changed keys (testing only).
    No,
}

/// [`ServerKeyVerifier`] backed by a known_hosts file.
#[derive(Debug, Clone)]
pub struct KnownHostsVerifier {
    host: String,
    port: u16,
    path: Option<PathBuf>,
    policy: StrictHostKeyChecking,
}

impl KnownHostsVerifier {
    /// Verifier for `host`/`port` using the default file and strict checking.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: None,
            policy: StrictHostKeyChecking::Strict,
        }
    }

    /// Uses a specific known_hosts file.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the checking policy.
    pub fn with_policy(mut self, policy: StrictHostKeyChecking) -> Self {
        self.policy = policy;
        self
    }

    fn decide(&self, key: &PublicKey) -> bool {
        let path = self.path.as_deref();
        match check_known_hosts(&self.host, self.port, key, path) {
            Ok(true) => {
                debug!("Host key {} found in known_hosts", key.fingerprint());
                true
            }
            Ok(false) => match self.policy {
                StrictHostKeyChecking::Strict => {
                    warn!(
                        "Unknown host {} with key {}",
                        host_pattern(&self.host, self.port),
                        key.fingerprint()
                    );
                    false
                }
                StrictHostKeyChecking::AcceptNew | StrictHostKeyChecking::No => {
                    if let Err(e) = learn_known_hosts(&self.host, self.port, key, path) {
                        warn!("Failed to record host key: {}", e);
                    }
                    true
                }
            },
            Err(KeelError::HostKeyChanged { line }) => {
                warn!(
                    "Host key for {} changed (known_hosts line {}), now {}",
                    host_pattern(&self.host, self.port),
                    line,
                    key.fingerprint()
                );
                self.policy == StrictHostKeyChecking::No
            }
            Err(e) => {
                warn!("known_hosts lookup failed: {}", e);
                self.policy == StrictHostKeyChecking::No
            }
        }
    }
}

#[async_trait]
impl ServerKeyVerifier for KnownHostsVerifier {
    async fn check_server_key(&self, key: &PublicKey) -> bool {
        let verifier = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || verifier.decide(&key))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::KeyPair;

    const ED25519_LINE: &str = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    fn line_key() -> PublicKey {
        PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_standard_format() {
        let entry = KnownHost::parse_line(&format!("{} user@host", ED25519_LINE)).unwrap();
        assert_eq!(entry.hostname_pattern(), "example.com");
        assert_eq!(entry.key_type(), "ssh-ed25519");
        assert_eq!(entry.comment(), "user@host");
        assert_eq!(entry.public_key().unwrap(), line_key());
    }

    #[test]
    fn test_parse_rejects_comments_and_markers() {
        assert!(KnownHost::parse_line("# This is a comment").is_err());
        assert!(KnownHost::parse_line("   ").is_err());
        assert!(KnownHost::parse_line("@revoked * ssh-ed25519 AAAA").is_err());
        assert!(KnownHost::parse_line("host ssh-ed25519").is_err());
    }

    #[test]
    fn test_host_pattern() {
        assert_eq!(host_pattern("example.com", 22), "example.com");
        assert_eq!(host_pattern("example.com", 2222), "[example.com]:2222");
        assert_eq!(host_pattern("[::1]", 2222), "[::1]:2222");
        assert_eq!(host_pattern("[::1]", 22), "::1");
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match(b"*.example.com", b"host.example.com"));
        assert!(wildcard_match(b"*.example.com", b"sub.host.example.com"));
        assert!(!wildcard_match(b"*.example.com", b"example.com"));
        assert!(!wildcard_match(b"*.example.com", b"other.com"));
        assert!(wildcard_match(b"host?.example.com", b"host1.example.com"));
        assert!(!wildcard_match(b"host?.example.com", b"host12.example.com"));
        assert!(wildcard_match(b"*", b""));
    }

    #[test]
    fn test_negation_overrides_match() {
        let entry =
            KnownHost::parse_line("*.example.com,!bad.example.com ssh-ed25519 AQIDBA==").unwrap();
        assert!(entry.matches("good.example.com", 22));
        assert!(!entry.matches("bad.example.com", 22));
    }

    #[test]
    fn test_hashed_hostname() {
        let salt = [0x5au8; 20];
        let mut mac = Hmac::<Sha1>::new_from_slice(&salt).unwrap();
        mac.update(b"[example.com]:2200");
        let hash = mac.finalize().into_bytes();
        let pattern = format!("|1|{}|{}", STANDARD.encode(salt), STANDARD.encode(hash));

        let entry = KnownHost::parse_line(&format!("{} ssh-ed25519 AQIDBA==", pattern)).unwrap();
        assert!(entry.matches("example.com", 2200));
        assert!(!entry.matches("example.com", 22));
    }

    #[test]
    fn test_verify_statuses() {
        let content = format!("# header\n\n{}\n", ED25519_LINE);
        let file = KnownHostsFile::from_string(&content);
        assert_eq!(file.entries()[0].line(), 3);

        assert_eq!(
            file.verify_host_key("example.com", 22, &line_key()),
            HostKeyStatus::Known
        );
        assert_eq!(
            file.verify_host_key("other.com", 22, &line_key()),
            HostKeyStatus::Unknown
        );

        let other = KeyPair::generate_ed25519().clone_public_key();
        assert_eq!(
            file.verify_host_key("example.com", 22, &other),
            HostKeyStatus::Changed { line: 3 }
        );
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let content = format!("garbage\nhost ssh-ed25519 !!!notbase64\n{}\n", ED25519_LINE);
        let file = KnownHostsFile::from_string(&content);
        assert_eq!(file.entries().len(), 1);
        assert_eq!(file.entries()[0].line(), 3);
    }

    #[test]
    fn test_add_remove_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = KnownHostsFile::new(dir.path().join("known_hosts"));
        let old_key = KeyPair::generate_ed25519().clone_public_key();
        let new_key = KeyPair::generate_ed25519().clone_public_key();

        file.add_host("example.com", 22, &old_key);
        file.add_host("other.com", 2222, &old_key);
        assert_eq!(file.entries()[1].hostname_pattern(), "[other.com]:2222");

        file.update_host("example.com", 22, &new_key);
        assert_eq!(file.entries().len(), 2);
        assert_eq!(
            file.verify_host_key("example.com", 22, &new_key),
            HostKeyStatus::Known
        );

        assert_eq!(file.remove_host("other.com", 2222), 1);
        assert_eq!(file.remove_host("nonexistent.com", 22), 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");
        let key = KeyPair::generate_ed25519().clone_public_key();

        let mut file = KnownHostsFile::new(&path);
        file.add_host("example.com", 22, &key);
        file.save().unwrap();

        let loaded = KnownHostsFile::from_file(&path).unwrap();
        assert_eq!(loaded.entries().len(), 1);
        assert_eq!(loaded.entries()[0].public_key().unwrap(), key);
    }

    #[test]
    fn test_check_and_learn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let key = KeyPair::generate_ed25519().clone_public_key();

        assert!(!check_known_hosts("example.com", 2222, &key, Some(&path)).unwrap());
        learn_known_hosts("example.com", 2222, &key, Some(&path)).unwrap();
        assert!(check_known_hosts("example.com", 2222, &key, Some(&path)).unwrap());
        assert!(!check_known_hosts("example.com", 22, &key, Some(&path)).unwrap());

        let other = KeyPair::generate_ed25519().clone_public_key();
        assert!(matches!(
            check_known_hosts("example.com", 2222, &other, Some(&path)),
            Err(KeelError::HostKeyChanged { line: 1 })
        ));
    }

    #[test]
    fn test_learn_preserves_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("# mine\n{}", ED25519_LINE)).unwrap();

        let key = KeyPair::generate_ed25519().clone_public_key();
        learn_known_hosts("new.example.com", 22, &key, Some(&path)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# mine\n"));
        assert_eq!(content.lines().count(), 3);
        assert!(check_known_hosts("example.com", 22, &line_key(), Some(&path)).unwrap());
        assert!(check_known_hosts("new.example.com", 22, &key, Some(&path)).unwrap());
    }

    #[tokio::test]
    async fn test_verifier_policies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = KeyPair::generate_ed25519().clone_public_key();
        let other = KeyPair::generate_ed25519().clone_public_key();

        let strict = KnownHostsVerifier::new("example.com", 22).with_path(&path);
        assert!(!strict.check_server_key(&key).await);

        let accept_new = strict.clone().with_policy(StrictHostKeyChecking::AcceptNew);
        assert!(accept_new.check_server_key(&key).await);
        assert!(strict.check_server_key(&key).await);

        assert!(!accept_new.check_server_key(&other).await);
        let insecure = strict.clone().with_policy(StrictHostKeyChecking::No);
        assert!(insecure.check_server_key(&other).await);
    }
}
