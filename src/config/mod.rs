//! Configuration snapshot.
//!
//! The YAML file is deserialized into [`RawConfig`] and validated into an
//! immutable [`Config`]. Snapshots are replaced whole on reload — no field
//! is ever mutated after install, so every component can hold a cheap
//! `Arc<Config>` clone for the duration of a request.

use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
const DEFAULT_PORT_BASE: u16 = 4000;
const DEFAULT_PORT_COUNT: u16 = 100;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_DEADLINE_SECS: u64 = 3;
const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";
const DEFAULT_BROADCAST_PATH: &str = "/_broadcast";
const DEFAULT_AUTH_REALM: &str = "Navigator";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid listen address {0:?}")]
    Listen(String),
    #[error("duplicate tenant label {0:?}")]
    DuplicateLabel(String),
    #[error("tenant {label:?}: invalid path pattern {pattern:?}: {source}")]
    TenantPattern {
        label: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("tenant {0:?}: command must not be empty")]
    EmptyCommand(String),
    #[error("tenants.catch_all names unknown label {0:?}")]
    UnknownCatchAll(String),
    #[error("auth pattern {pattern:?}: {source}")]
    AuthPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("auth pattern {pattern:?}: action must be \"off\" or \"deny\", got {action:?}")]
    AuthAction { pattern: String, action: String },
    #[error("worker port range is empty")]
    EmptyPortRange,
    #[error("worker port range {base}+{count} exceeds 65535")]
    PortRangeOverflow { base: u16, count: u16 },
    #[error("cgi rule {path:?}: methods must not be empty")]
    EmptyCgiMethods { path: String },
}

// ─── Raw (serde) layer ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    listen: Option<String>,
    pidfile: Option<PathBuf>,
    #[serde(default)]
    log: RawLog,
    #[serde(default)]
    proxy: RawProxy,
    #[serde(default)]
    maintenance: RawMaintenance,
    #[serde(default, rename = "static")]
    static_files: RawStatic,
    #[serde(default)]
    cgi: Vec<RawCgiRule>,
    #[serde(default)]
    routes: Vec<RawRoute>,
    #[serde(default)]
    workers: RawWorkers,
    #[serde(default)]
    tenants: RawTenants,
    #[serde(default)]
    auth: Option<RawAuth>,
    #[serde(default)]
    hub: RawHub,
    #[serde(default)]
    hooks: RawHooks,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLog {
    level: Option<String>,
    file: Option<PathBuf>,
    access_log: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProxy {
    #[serde(default)]
    trust_forwarded_headers: bool,
    #[serde(default)]
    disable_compression: bool,
    retry_deadline_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMaintenance {
    #[serde(default)]
    enabled: bool,
    page: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStatic {
    #[serde(default)]
    rules: Vec<RawStaticRule>,
    #[serde(default)]
    try_files: Vec<String>,
    #[serde(default)]
    extensions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStaticRule {
    prefix: String,
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCgiRule {
    path: String,
    script: PathBuf,
    #[serde(default = "default_cgi_methods")]
    methods: Vec<String>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    allow_reload: bool,
}

fn default_cgi_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRoute {
    prefix: String,
    upstream: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkers {
    pool: Option<RawPortRange>,
    /// Maximum live workers; 0 = unlimited.
    max: Option<usize>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPortRange {
    base: u16,
    count: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTenants {
    /// Label of the tenant that catches requests no other tenant matches.
    catch_all: Option<String>,
    #[serde(default)]
    defs: Vec<RawTenant>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTenant {
    label: String,
    /// Literal URL prefix, e.g. `/acme/`.
    path: Option<String>,
    /// Anchored regex alternative to `path`.
    pattern: Option<String>,
    dir: Option<PathBuf>,
    command: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    /// Where the worker's stdout/stderr go; default is the server log.
    log_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    idle_eligible: bool,
    startup_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuth {
    htpasswd: PathBuf,
    realm: Option<String>,
    #[serde(default)]
    public_paths: Vec<String>,
    #[serde(default)]
    patterns: Vec<RawAuthPattern>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    exclude_prefix: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuthPattern {
    pattern: String,
    action: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHub {
    websocket_path: Option<String>,
    broadcast_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHooks {
    #[serde(default)]
    ready: Vec<RawHook>,
    #[serde(default)]
    start: Vec<RawHook>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHook {
    command: Vec<String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    reload: bool,
}

// ─── Validated snapshot ──────────────────────────────────────────────────────

/// One ordered `{URL prefix → filesystem directory}` rule.
#[derive(Debug, Clone)]
pub struct StaticRule {
    pub prefix: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CgiRule {
    pub path: String,
    pub script: PathBuf,
    pub methods: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub allow_reload: bool,
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub prefix: String,
    pub upstream: String,
}

/// How a tenant's URL space is recognized.
#[derive(Debug, Clone)]
pub enum TenantPattern {
    Prefix(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Tenant {
    pub label: String,
    pub pattern: TenantPattern,
    pub dir: Option<PathBuf>,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub log_file: Option<PathBuf>,
    pub idle_eligible: bool,
    pub startup_timeout: Duration,
}

impl Tenant {
    /// Match score for `path`: prefix matches score by prefix length so the
    /// longest prefix wins; regex matches score 0 (used only when no prefix
    /// tenant matched).
    pub fn match_score(&self, path: &str) -> Option<usize> {
        match &self.pattern {
            TenantPattern::Prefix(p) => path.starts_with(p.as_str()).then_some(p.len()),
            TenantPattern::Regex(re) => re.is_match(path).then_some(0),
        }
    }

    /// True when the startup command differs between two snapshots of the
    /// same label — the running worker must be replaced.
    pub fn command_changed(&self, other: &Tenant) -> bool {
        self.command != other.command || self.env != other.env || self.dir != other.dir
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Off,
    Deny,
}

#[derive(Debug, Clone)]
pub struct AuthPattern {
    pub pattern: Regex,
    pub action: AuthAction,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub htpasswd: PathBuf,
    pub realm: String,
    /// Glob-ish public prefixes (`*` wildcard), pre-compiled to regexes.
    pub public_paths: Vec<Regex>,
    pub patterns: Vec<AuthPattern>,
    pub exclude: Vec<String>,
    pub exclude_prefix: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HookSpec {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub reload: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Hooks {
    pub ready: Vec<HookSpec>,
    pub start: Vec<HookSpec>,
}

/// Immutable configuration snapshot. Built by [`load`], installed whole by
/// the lifecycle controller, and only ever read afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path the snapshot was loaded from; reload re-reads the same file.
    pub source: PathBuf,
    pub listen: SocketAddr,
    pub pidfile: Option<PathBuf>,

    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub access_log: Option<PathBuf>,

    pub trust_forwarded_headers: bool,
    pub disable_compression: bool,
    pub retry_deadline: Duration,

    pub maintenance: bool,
    pub maintenance_page: Option<PathBuf>,

    pub static_rules: Vec<StaticRule>,
    pub try_files: Vec<String>,
    pub allowed_extensions: HashSet<String>,

    pub cgi: Vec<CgiRule>,
    pub routes: Vec<RouteRule>,

    pub tenants: Vec<Tenant>,
    pub catch_all: Option<String>,

    pub port_base: u16,
    pub port_count: u16,
    /// 0 = unlimited.
    pub max_workers: usize,
    pub idle_timeout: Duration,

    pub auth: Option<AuthConfig>,

    pub websocket_path: String,
    pub broadcast_path: String,

    pub hooks: Hooks,
}

impl Config {
    pub fn tenant(&self, label: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.label == label)
    }
}

/// Translate a `*`-wildcard glob into an anchored regex.
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Load and validate a snapshot from `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(path, raw)
}

fn validate(source: &Path, raw: RawConfig) -> Result<Config, ConfigError> {
    let listen_str = raw.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen: SocketAddr = listen_str
        .parse()
        .map_err(|_| ConfigError::Listen(listen_str.clone()))?;

    let (port_base, port_count) = match raw.workers.pool {
        Some(RawPortRange { base, count }) => (base, count),
        None => (DEFAULT_PORT_BASE, DEFAULT_PORT_COUNT),
    };
    if port_count == 0 {
        return Err(ConfigError::EmptyPortRange);
    }
    if port_base.checked_add(port_count).is_none() {
        return Err(ConfigError::PortRangeOverflow {
            base: port_base,
            count: port_count,
        });
    }

    let mut labels = HashSet::new();
    let mut tenants = Vec::with_capacity(raw.tenants.defs.len());
    for t in raw.tenants.defs {
        if !labels.insert(t.label.clone()) {
            return Err(ConfigError::DuplicateLabel(t.label));
        }
        if t.command.is_empty() {
            return Err(ConfigError::EmptyCommand(t.label));
        }
        let pattern = match (&t.path, &t.pattern) {
            (_, Some(p)) => {
                let re = Regex::new(p).map_err(|source| ConfigError::TenantPattern {
                    label: t.label.clone(),
                    pattern: p.clone(),
                    source,
                })?;
                TenantPattern::Regex(re)
            }
            (Some(prefix), None) => TenantPattern::Prefix(prefix.clone()),
            // Label-only tenants are reachable via catch_all.
            (None, None) => TenantPattern::Prefix(format!("/{}/", t.label)),
        };
        tenants.push(Tenant {
            label: t.label,
            pattern,
            dir: t.dir,
            command: t.command,
            env: t.env,
            log_file: t.log_file,
            idle_eligible: t.idle_eligible,
            startup_timeout: Duration::from_secs(
                t.startup_timeout_secs
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            ),
        });
    }

    if let Some(label) = &raw.tenants.catch_all {
        if !labels.contains(label) {
            return Err(ConfigError::UnknownCatchAll(label.clone()));
        }
    }

    for rule in &raw.cgi {
        if rule.methods.is_empty() {
            return Err(ConfigError::EmptyCgiMethods {
                path: rule.path.clone(),
            });
        }
    }

    let auth = match raw.auth {
        None => None,
        Some(a) => {
            let mut public_paths = Vec::with_capacity(a.public_paths.len());
            for glob in &a.public_paths {
                let re = glob_to_regex(glob).map_err(|source| ConfigError::AuthPattern {
                    pattern: glob.clone(),
                    source,
                })?;
                public_paths.push(re);
            }
            let mut patterns = Vec::with_capacity(a.patterns.len());
            for p in a.patterns {
                let action = match p.action.as_str() {
                    "off" => AuthAction::Off,
                    "deny" => AuthAction::Deny,
                    other => {
                        return Err(ConfigError::AuthAction {
                            pattern: p.pattern,
                            action: other.to_string(),
                        })
                    }
                };
                let pattern =
                    Regex::new(&p.pattern).map_err(|source| ConfigError::AuthPattern {
                        pattern: p.pattern.clone(),
                        source,
                    })?;
                patterns.push(AuthPattern { pattern, action });
            }
            Some(AuthConfig {
                htpasswd: a.htpasswd,
                realm: a.realm.unwrap_or_else(|| DEFAULT_AUTH_REALM.to_string()),
                public_paths,
                patterns,
                exclude: a.exclude,
                exclude_prefix: a.exclude_prefix,
            })
        }
    };

    let hooks = Hooks {
        ready: raw.hooks.ready.into_iter().map(hook_spec).collect(),
        start: raw.hooks.start.into_iter().map(hook_spec).collect(),
    };

    Ok(Config {
        source: source.to_path_buf(),
        listen,
        pidfile: raw.pidfile,
        log_level: raw.log.level,
        log_file: raw.log.file,
        access_log: raw.log.access_log,
        trust_forwarded_headers: raw.proxy.trust_forwarded_headers,
        disable_compression: raw.proxy.disable_compression,
        retry_deadline: Duration::from_secs(
            raw.proxy
                .retry_deadline_secs
                .unwrap_or(DEFAULT_RETRY_DEADLINE_SECS),
        ),
        maintenance: raw.maintenance.enabled,
        maintenance_page: raw.maintenance.page,
        static_rules: raw
            .static_files
            .rules
            .into_iter()
            .map(|r| StaticRule {
                prefix: r.prefix,
                root: r.root,
            })
            .collect(),
        try_files: raw.static_files.try_files,
        allowed_extensions: raw
            .static_files
            .extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect(),
        cgi: raw
            .cgi
            .into_iter()
            .map(|r| CgiRule {
                path: r.path,
                script: r.script,
                methods: r.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                working_dir: r.working_dir,
                allow_reload: r.allow_reload,
            })
            .collect(),
        routes: raw
            .routes
            .into_iter()
            .map(|r| RouteRule {
                prefix: r.prefix,
                upstream: r.upstream.trim_end_matches('/').to_string(),
            })
            .collect(),
        tenants,
        catch_all: raw.tenants.catch_all,
        port_base,
        port_count,
        max_workers: raw.workers.max.unwrap_or(0),
        idle_timeout: Duration::from_secs(
            raw.workers
                .idle_timeout_secs
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        ),
        auth,
        websocket_path: raw
            .hub
            .websocket_path
            .unwrap_or_else(|| DEFAULT_WEBSOCKET_PATH.to_string()),
        broadcast_path: raw
            .hub
            .broadcast_path
            .unwrap_or_else(|| DEFAULT_BROADCAST_PATH.to_string()),
        hooks,
    })
}

fn hook_spec(raw: RawHook) -> HookSpec {
    HookSpec {
        command: raw.command,
        timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(30)),
        reload: raw.reload,
    }
}
