//! Basic-auth verifier.
//!
//! Path policy first (public globs, regex off/deny rules, exact and prefix
//! exclusions), then credential verification against an htpasswd-style file
//! of `user:{SHA256}<hex>` lines (plaintext values are accepted for test
//! fixtures). Comparisons are constant-time.
//!
//! The credential table auto-reloads: the first *failed* verification after
//! the file's modification time advances re-reads it, single-flighted so a
//! burst of 401s triggers exactly one read.

use crate::config::{AuthAction, AuthConfig};
use crate::singleflight::SingleFlight;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, warn};

/// What the path policy says about a request before credentials are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No authentication required.
    Open,
    /// Authentication required; check the Authorization header.
    Protected,
    /// Always refused, regardless of credentials.
    Denied,
}

pub struct AuthVerifier {
    config: Option<AuthConfig>,
    creds: RwLock<HashMap<String, String>>,
    loaded_mtime: Mutex<Option<SystemTime>>,
    reload_flight: SingleFlight,
}

impl AuthVerifier {
    /// Build a verifier from the snapshot's auth section. `None` disables
    /// authentication entirely (every path is [`Access::Open`]).
    pub fn new(config: Option<AuthConfig>) -> Self {
        let verifier = Self {
            config,
            creds: RwLock::new(HashMap::new()),
            loaded_mtime: Mutex::new(None),
            reload_flight: SingleFlight::new(),
        };
        if let Some(cfg) = &verifier.config {
            verifier.load_credentials(&cfg.htpasswd);
        }
        verifier
    }

    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }

    /// `WWW-Authenticate` challenge value for 401 responses.
    pub fn challenge(&self) -> String {
        let realm = self
            .config
            .as_ref()
            .map(|c| c.realm.as_str())
            .unwrap_or("Navigator");
        format!("Basic realm=\"{realm}\"")
    }

    /// Apply the path policy. Exclusions win over globs, globs over regex
    /// rules, and the first matching regex rule decides.
    pub fn access_for(&self, path: &str) -> Access {
        let Some(cfg) = &self.config else {
            return Access::Open;
        };

        if cfg.exclude.iter().any(|e| e == path) {
            return Access::Open;
        }
        if cfg.exclude_prefix.iter().any(|p| path.starts_with(p.as_str())) {
            return Access::Open;
        }
        if cfg.public_paths.iter().any(|re| re.is_match(path)) {
            return Access::Open;
        }
        for rule in &cfg.patterns {
            if rule.pattern.is_match(path) {
                return match rule.action {
                    AuthAction::Off => Access::Open,
                    AuthAction::Deny => Access::Denied,
                };
            }
        }
        Access::Protected
    }

    /// Verify an `Authorization` header value for a protected path.
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(cfg) = &self.config else {
            return true;
        };
        let Some((user, pass)) = decode_basic(header) else {
            return false;
        };

        if self.check(&user, &pass) {
            return true;
        }

        // The stored table may be stale — an operator (or a start hook) can
        // rewrite the credential file at any time. Reload once per change.
        if self.maybe_reload(&cfg.htpasswd) {
            return self.check(&user, &pass);
        }
        false
    }

    fn check(&self, user: &str, pass: &str) -> bool {
        let creds = self.creds.read().unwrap_or_else(|e| e.into_inner());
        match creds.get(user) {
            Some(stored) => verify_password(stored, pass),
            None => {
                // Burn comparable time for unknown users.
                let _ = verify_password("{SHA256}0000", pass);
                false
            }
        }
    }

    /// Reload the credential file if its mtime advanced since the last load.
    /// Returns true when a reload happened.
    fn maybe_reload(&self, path: &Path) -> bool {
        let current = file_mtime(path);
        {
            let loaded = self.loaded_mtime.lock().unwrap_or_else(|e| e.into_inner());
            if current == *loaded {
                return false;
            }
        }
        // Collapse concurrent reloaders; losers just re-check credentials
        // against whatever the winner installed.
        let Some(_guard) = self.reload_flight.try_acquire("htpasswd") else {
            return true;
        };
        debug!(path = %path.display(), "credential file changed — reloading");
        self.load_credentials(path);
        true
    }

    fn load_credentials(&self, path: &Path) {
        let mtime = file_mtime(path);
        let table = match std::fs::read_to_string(path) {
            Ok(text) => parse_htpasswd(&text),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "cannot read credential file — keeping current table");
                return;
            }
        };
        *self.creds.write().unwrap_or_else(|e| e.into_inner()) = table;
        *self.loaded_mtime.lock().unwrap_or_else(|e| e.into_inner()) = mtime;
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn parse_htpasswd(text: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((user, stored)) = line.split_once(':') {
            table.insert(user.to_string(), stored.to_string());
        }
    }
    table
}

/// Decode `Basic <base64(user:pass)>`.
fn decode_basic(header: Option<&str>) -> Option<(String, String)> {
    let header = header?;
    let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn verify_password(stored: &str, supplied: &str) -> bool {
    if let Some(hex) = stored.strip_prefix("{SHA256}") {
        let digest = Sha256::digest(supplied.as_bytes());
        let supplied_hex = hex_encode(&digest);
        constant_time_eq(supplied_hex.as_bytes(), hex.trim().as_bytes())
    } else {
        constant_time_eq(supplied.as_bytes(), stored.as_bytes())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Constant-time byte comparison to prevent timing-based credential oracles.
/// Does not short-circuit on mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::io::Write;
    use std::path::PathBuf;

    fn basic(user: &str, pass: &str) -> String {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {token}")
    }

    fn sha256_hex(s: &str) -> String {
        hex_encode(&Sha256::digest(s.as_bytes()))
    }

    fn write_htpasswd(dir: &tempfile::TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("htpasswd");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    fn auth_config(htpasswd: PathBuf) -> config::AuthConfig {
        config::AuthConfig {
            htpasswd,
            realm: "Test".to_string(),
            public_paths: vec![regex::Regex::new("^/assets/.*$").unwrap()],
            patterns: vec![
                config::AuthPattern {
                    pattern: regex::Regex::new("^/private/").unwrap(),
                    action: AuthAction::Deny,
                },
                config::AuthPattern {
                    pattern: regex::Regex::new("^/open/").unwrap(),
                    action: AuthAction::Off,
                },
            ],
            exclude: vec!["/healthz".to_string()],
            exclude_prefix: vec!["/up/".to_string()],
        }
    }

    #[test]
    fn disabled_verifier_is_open() {
        let v = AuthVerifier::new(None);
        assert_eq!(v.access_for("/anything"), Access::Open);
        assert!(v.verify(None));
    }

    #[test]
    fn path_policy_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_htpasswd(&dir, &[format!("alice:{{SHA256}}{}", sha256_hex("s3cret"))]);
        let v = AuthVerifier::new(Some(auth_config(path)));

        assert_eq!(v.access_for("/healthz"), Access::Open);
        assert_eq!(v.access_for("/up/status"), Access::Open);
        assert_eq!(v.access_for("/assets/app.js"), Access::Open);
        assert_eq!(v.access_for("/private/keys"), Access::Denied);
        assert_eq!(v.access_for("/open/docs"), Access::Open);
        assert_eq!(v.access_for("/app/page"), Access::Protected);
    }

    #[test]
    fn sha256_and_plaintext_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_htpasswd(
            &dir,
            &[
                format!("alice:{{SHA256}}{}", sha256_hex("s3cret")),
                "bob:hunter2".to_string(),
            ],
        );
        let v = AuthVerifier::new(Some(auth_config(path)));

        assert!(v.verify(Some(&basic("alice", "s3cret"))));
        assert!(!v.verify(Some(&basic("alice", "wrong"))));
        assert!(v.verify(Some(&basic("bob", "hunter2"))));
        assert!(!v.verify(Some(&basic("eve", "s3cret"))));
        assert!(!v.verify(None));
        assert!(!v.verify(Some("Bearer xyz")));
    }

    #[test]
    fn credential_file_reloads_after_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_htpasswd(&dir, &["alice:old".to_string()]);
        let v = AuthVerifier::new(Some(auth_config(path.clone())));
        assert!(v.verify(Some(&basic("alice", "old"))));
        assert!(!v.verify(Some(&basic("alice", "new"))));

        // Rewrite with a strictly newer mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "alice:new").unwrap();
        drop(f);
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let _ = std::fs::File::options()
            .write(true)
            .open(&path)
            .map(|f| f.set_modified(later));

        // First failed verification after the change triggers the reload.
        assert!(v.verify(Some(&basic("alice", "new"))));
        assert!(!v.verify(Some(&basic("alice", "old"))));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
