use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::lite::{net, router, strategy::Strategy};

pub const CONFIG_ENV: &str = "LITE_CONFIG";
const CONFIG_FILE_NAMES: [&str; 3] = ["lite.toml", "lite.yaml", "lite.yml"];

pub const DEFAULT_CACHE_PING_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already folds LITE_CONFIG into the flag; this covers library callers.
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    match fs::metadata(p) {
        Ok(m) if m.is_dir() => {
            Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_FILE_NAMES[0])))
        }
        Ok(_) => Ok(p.to_path_buf()),
        Err(_) => {
            let mut out = p.to_path_buf();
            if out.extension().is_none() {
                out.set_extension("toml");
            }
            Ok(out)
        }
    }
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/prism-lite/lite.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("com", "summpot", "prism-lite")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lite.toml"))
    }
}

/// Writes the commented template when `path` does not exist. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Loads, normalizes and validates a config file. Validation errors abort; warnings are
/// left for the caller to report via [`Config::validate`].
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&data)
            .with_context(|| format!("parse yaml {}", path.display()))?,
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    let cfg = Config::from_file_config(fc)?;
    let validation = cfg.validate();
    if !validation.errors.is_empty() {
        anyhow::bail!("config: invalid: {}", validation.errors.join("; "));
    }
    Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub admin_addr: String,
    pub dial_timeout: Duration,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
    pub blacklist_file: Option<PathBuf>,
    /// Installs the access-log plugin, which logs every forward's start and end.
    pub log_forwards: bool,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake: Duration,
    pub status: Duration,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// One routing rule: host patterns mapped to backends plus per-route policy.
#[derive(Debug, Clone)]
pub struct Route {
    pub hosts: Vec<String>,
    pub backends: Vec<String>,
    pub strategy: Strategy,
    pub proxy_protocol: bool,
    pub tcp_shield_real_ip: bool,
    pub modify_virtual_host: bool,
    pub cache_ping: CachePing,
    pub fallback: Option<FallbackStatus>,
    pub blacklist: Vec<IpAddr>,
    /// Cap on live forwards through this route; 0 is unlimited.
    pub max_connections: u32,
}

impl Route {
    pub fn new<H, B>(hosts: H, backends: B) -> Self
    where
        H: IntoIterator,
        H::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            backends: backends.into_iter().map(Into::into).collect(),
            strategy: Strategy::Sequential,
            proxy_protocol: false,
            tcp_shield_real_ip: false,
            modify_virtual_host: false,
            cache_ping: CachePing::default(),
            fallback: None,
            blacklist: Vec::new(),
            max_connections: 0,
        }
    }

    /// Counter key for `max_connections`: the first configured host.
    pub fn connection_key(&self) -> &str {
        self.hosts.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.contains(ip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePing {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CachePing {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_CACHE_PING_TTL,
        }
    }
}

impl CachePing {
    pub const DISABLED: CachePing = CachePing {
        enabled: false,
        ttl: Duration::ZERO,
    };
}

/// Status served when every backend of a route is unreachable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackStatus {
    /// Plain string or a chat component object.
    #[serde(default, alias = "description")]
    pub motd: Option<serde_json::Value>,
    #[serde(default)]
    pub version: FallbackVersion,
    #[serde(default)]
    pub players: Option<FallbackPlayers>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackVersion {
    #[serde(default)]
    pub name: String,
    /// 0 echoes the client's protocol version.
    #[serde(default)]
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlayers {
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub online: i64,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Validation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default, alias = "listen_addr")]
    bind: Option<String>,
    #[serde(default, alias = "adminAddr")]
    admin_addr: String,
    #[serde(default, alias = "dialTimeout")]
    dial_timeout: Option<String>,
    #[serde(default, alias = "logForwards")]
    log_forwards: bool,
    #[serde(default, alias = "blacklistFile")]
    blacklist_file: Option<PathBuf>,
    timeouts: Option<FileTimeouts>,
    logging: Option<FileLogging>,
    reload: Option<FileReload>,
    #[serde(default)]
    routes: Vec<FileRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    handshake: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReload {
    enabled: Option<bool>,
    poll_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRoute {
    host: Option<StringOrVec>,
    hosts: Option<StringOrVec>,
    backend: Option<StringOrVec>,
    backends: Option<StringOrVec>,
    strategy: Option<String>,
    #[serde(default, alias = "proxyProtocol")]
    proxy_protocol: bool,
    #[serde(default, alias = "tcpShieldRealIP")]
    tcp_shield_real_ip: bool,
    /// Deprecated spelling of `tcp_shield_real_ip`.
    #[serde(default, alias = "realIP")]
    real_ip: bool,
    #[serde(default, alias = "modifyVirtualHost")]
    modify_virtual_host: bool,
    #[serde(alias = "cachePing")]
    cache_ping: Option<FileCachePing>,
    /// Legacy form: absent or "0" is the default TTL, a negative value disables caching.
    #[serde(alias = "cachePingTTL")]
    cache_ping_ttl: Option<String>,
    fallback: Option<FallbackStatus>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default, alias = "maxConnections")]
    max_connections: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCachePing {
    enabled: Option<bool>,
    ttl: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn parse_duration(field: &str, raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw).with_context(|| format!("config: {field}: invalid duration {raw:?}"))
}

fn duration_or(field: &str, raw: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => {
            let d = parse_duration(field, s)?;
            Ok(if d.is_zero() { default } else { d })
        }
    }
}

fn non_empty(v: Option<&String>, default: &str) -> String {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let timeouts = Timeouts {
            handshake: duration_or(
                "timeouts.handshake",
                fc.timeouts.as_ref().and_then(|t| t.handshake.as_deref()),
                Duration::from_secs(5),
            )?,
            status: duration_or(
                "timeouts.status",
                fc.timeouts.as_ref().and_then(|t| t.status.as_deref()),
                Duration::from_secs(5),
            )?,
        };

        let logging = match &fc.logging {
            None => LoggingConfig::default(),
            Some(l) => {
                let d = LoggingConfig::default();
                LoggingConfig {
                    level: non_empty(l.level.as_ref(), &d.level),
                    format: non_empty(l.format.as_ref(), &d.format),
                    output: non_empty(l.output.as_ref(), &d.output),
                    add_source: l.add_source,
                }
            }
        };

        let reload = ReloadConfig {
            enabled: fc.reload.as_ref().and_then(|r| r.enabled).unwrap_or(true),
            poll_interval: duration_or(
                "reload.poll_interval",
                fc.reload.as_ref().and_then(|r| r.poll_interval.as_deref()),
                Duration::from_secs(1),
            )?,
        };

        let mut routes = Vec::with_capacity(fc.routes.len());
        for (i, r) in fc.routes.into_iter().enumerate() {
            routes.push(route_from_file(r).with_context(|| format!("config: routes[{i}]"))?);
        }

        Ok(Config {
            bind: non_empty(fc.bind.as_ref(), ":25565"),
            admin_addr: fc.admin_addr.trim().to_string(),
            dial_timeout: duration_or(
                "dial_timeout",
                fc.dial_timeout.as_deref(),
                DEFAULT_DIAL_TIMEOUT,
            )?,
            timeouts,
            logging,
            reload,
            blacklist_file: fc.blacklist_file.filter(|p| !p.as_os_str().is_empty()),
            log_forwards: fc.log_forwards,
            routes,
        })
    }

    pub fn validate(&self) -> Validation {
        validate_routes(&self.routes)
    }
}

fn route_from_file(r: FileRoute) -> anyhow::Result<Route> {
    let hosts: Vec<String> = r
        .host
        .or(r.hosts)
        .map(StringOrVec::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let backends: Vec<String> = r
        .backend
        .or(r.backends)
        .map(StringOrVec::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let strategy: Strategy = r.strategy.as_deref().unwrap_or("").parse()?;

    let cache_ping = match (r.cache_ping, r.cache_ping_ttl) {
        (Some(cp), _) => CachePing {
            enabled: cp.enabled.unwrap_or(true),
            ttl: duration_or("cache_ping.ttl", cp.ttl.as_deref(), DEFAULT_CACHE_PING_TTL)?,
        },
        (None, Some(ttl)) if ttl.trim().starts_with('-') => CachePing::DISABLED,
        (None, Some(ttl)) => CachePing {
            enabled: true,
            ttl: duration_or("cache_ping_ttl", Some(&ttl), DEFAULT_CACHE_PING_TTL)?,
        },
        (None, None) => CachePing::default(),
    };

    let mut blacklist = Vec::with_capacity(r.blacklist.len());
    for ip in &r.blacklist {
        blacklist.push(
            ip.trim()
                .parse::<IpAddr>()
                .with_context(|| format!("blacklist: invalid ip {ip:?}"))?,
        );
    }

    Ok(Route {
        hosts,
        backends,
        strategy,
        proxy_protocol: r.proxy_protocol,
        tcp_shield_real_ip: r.tcp_shield_real_ip || r.real_ip,
        modify_virtual_host: r.modify_virtual_host,
        cache_ping,
        fallback: r.fallback,
        blacklist,
        max_connections: r.max_connections,
    })
}

/// Checks routes for problems that would make them unusable (errors) or surprising (warnings).
pub fn validate_routes(routes: &[Route]) -> Validation {
    let mut v = Validation::default();
    if routes.is_empty() {
        v.errors.push("no routes configured".into());
        return v;
    }

    for (i, route) in routes.iter().enumerate() {
        if route.hosts.is_empty() {
            v.errors.push(format!("route {i}: no host configured"));
        }
        if route.backends.is_empty() {
            v.errors.push(format!("route {i}: no backend configured"));
        }

        for (bi, addr) in route.backends.iter().enumerate() {
            let params = router::parameter_indices(addr);
            if params.is_empty() && !net::is_valid_backend_addr(addr) {
                v.errors
                    .push(format!("route {i}: backend {bi}: invalid address {addr:?}"));
            }
            let Some(&max_param) = params.iter().max() else {
                continue;
            };
            for (hi, host) in route.hosts.iter().enumerate() {
                let wildcards = router::count_wildcards(host);
                if wildcards == 0 {
                    v.warnings.push(format!(
                        "route {i}: host {hi} {host:?} has no wildcards but backend {bi} {addr:?} uses parameters (parameters will not be substituted)"
                    ));
                } else if max_param > wildcards {
                    v.warnings.push(format!(
                        "route {i}: host {hi} {host:?} has {wildcards} wildcard(s) but backend {bi} {addr:?} uses parameter ${max_param} (parameters will not be substituted)"
                    ));
                }
            }
        }
    }
    v
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Prism Lite configuration (auto-generated)
#
# This file was created because no configuration file was found at the resolved
# config path. Edit the routes below and the proxy picks changes up automatically.

bind = ":25565"
# admin_addr = ":8080"
dial_timeout = "5s"
log_forwards = false
# blacklist_file = "ip_blacklist.json"

[timeouts]
handshake = "5s"
status = "5s"

[logging]
level = "info" # trace | debug | info | warn | error, or a verbosity number (0, 1, 2)
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[reload]
enabled = true
poll_interval = "1s"

[[routes]]
host = ["localhost", "127.0.0.1"]
backend = ["127.0.0.1:25566"]
strategy = "sequential" # sequential | random | round-robin | least-connections | lowest-latency
proxy_protocol = false
tcp_shield_real_ip = false
modify_virtual_host = false
max_connections = 0 # 0 = unlimited

[routes.cache_ping]
enabled = true
ttl = "10s"

[routes.fallback]
motd = "Server is offline"
version = { name = "Maintenance", protocol = 0 }
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Prism Lite configuration (auto-generated)
#
# This file was created because no configuration file was found at the resolved
# config path. Edit the routes below and the proxy picks changes up automatically.

bind: ":25565"
# admin_addr: ":8080"
dial_timeout: "5s"
log_forwards: false
# blacklist_file: "ip_blacklist.json"

timeouts:
  handshake: "5s"
  status: "5s"

logging:
  level: "info" # trace | debug | info | warn | error, or a verbosity number (0, 1, 2)
  format: "text" # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false

reload:
  enabled: true
  poll_interval: "1s"

routes:
  - host: ["localhost", "127.0.0.1"]
    backend: ["127.0.0.1:25566"]
    strategy: "sequential" # sequential | random | round-robin | least-connections | lowest-latency
    proxy_protocol: false
    tcp_shield_real_ip: false
    modify_virtual_host: false
    max_connections: 0 # 0 = unlimited
    cache_ping:
      enabled: true
      ttl: "10s"
    fallback:
      motd: "Server is offline"
      version:
        name: "Maintenance"
        protocol: 0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "prism_lite_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn load_str(name: &str, file: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let path = dir.join(file);
        std::fs::write(&path, body).expect("write");
        let res = load_config(&path);
        let _ = std::fs::remove_dir_all(&dir);
        res
    }

    #[test]
    fn templates_load_and_validate() {
        for file in ["lite.toml", "lite.yaml"] {
            let dir = temp_dir("template");
            let path = dir.join(file);
            assert!(ensure_config_file(&path).expect("create"));
            assert!(!ensure_config_file(&path).expect("exists"));

            let cfg = load_config(&path).expect("load template");
            assert_eq!(cfg.bind, ":25565");
            assert_eq!(cfg.routes.len(), 1);
            let r = &cfg.routes[0];
            assert_eq!(r.hosts, vec!["localhost", "127.0.0.1"]);
            assert_eq!(r.cache_ping, CachePing::default());
            let fb = r.fallback.as_ref().expect("fallback");
            assert_eq!(fb.version.name, "Maintenance");
            assert!(cfg.validate().warnings.is_empty());

            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn route_fields_and_aliases() {
        let cfg = load_str(
            "aliases",
            "lite.yaml",
            r#"
dialTimeout: "250ms"
routes:
  - host: "*.Example.com"
    backend: "$1.backend.local"
    strategy: "least connections"
    proxyProtocol: true
    realIP: true
    modifyVirtualHost: true
    cachePingTTL: "-1s"
    blacklist: ["198.51.100.7"]
    maxConnections: 50
    fallback:
      motd: { text: "Maintenance", color: "red" }
      version: { name: "Maintenance", protocol: 765 }
      players: { max: 100, online: 0, sample: [{ name: "Steve" }] }
"#,
        )
        .expect("load");

        assert_eq!(cfg.dial_timeout, Duration::from_millis(250));
        let r = &cfg.routes[0];
        assert_eq!(r.hosts, vec!["*.example.com"]);
        assert_eq!(r.backends, vec!["$1.backend.local"]);
        assert_eq!(r.strategy, Strategy::LeastConnections);
        assert!(r.proxy_protocol && r.tcp_shield_real_ip && r.modify_virtual_host);
        assert_eq!(r.cache_ping, CachePing::DISABLED);
        assert!(r.is_blacklisted(&"198.51.100.7".parse().expect("ip")));
        assert_eq!(r.max_connections, 50);
        assert_eq!(r.connection_key(), "*.example.com");

        let fb = r.fallback.as_ref().expect("fallback");
        assert_eq!(fb.version.protocol, 765);
        assert_eq!(
            fb.motd.as_ref().and_then(|m| m.get("text")).and_then(|t| t.as_str()),
            Some("Maintenance")
        );
        let players = fb.players.as_ref().expect("players");
        assert_eq!(players.max, 100);
        assert_eq!(players.sample[0].name, "Steve");
    }

    #[test]
    fn legacy_cache_ping_ttl_forms() {
        let cfg = load_str(
            "cache_ttl",
            "lite.toml",
            r#"
[[routes]]
host = "a.com"
backend = "127.0.0.1:1"
cache_ping_ttl = "0"

[[routes]]
host = "b.com"
backend = "127.0.0.1:2"
cache_ping_ttl = "30s"

[[routes]]
host = "c.com"
backend = "127.0.0.1:3"
[routes.cache_ping]
enabled = false
"#,
        )
        .expect("load");

        assert_eq!(cfg.routes[0].cache_ping, CachePing::default());
        assert_eq!(cfg.routes[1].cache_ping.ttl, Duration::from_secs(30));
        assert!(!cfg.routes[2].cache_ping.enabled);
    }

    #[test]
    fn invalid_strategy_is_rejected() {
        let err = load_str(
            "bad_strategy",
            "lite.toml",
            r#"
[[routes]]
host = "a.com"
backend = "127.0.0.1:1"
strategy = "fastest"
"#,
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("invalid strategy"), "{err:#}");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = load_str(
            "unknown",
            "lite.toml",
            r#"
[[routes]]
host = "a.com"
backend = "127.0.0.1:1"
weight = 5
"#,
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("weight"), "{err:#}");
    }

    #[test]
    fn validation_errors_abort_loading() {
        let err = load_str("no_routes", "lite.toml", "bind = \":25565\"\n").expect_err("no routes");
        assert!(format!("{err:#}").contains("no routes configured"));

        let err = load_str(
            "bad_backend",
            "lite.toml",
            r#"
[[routes]]
host = "a.com"
backend = "host:notaport"
"#,
        )
        .expect_err("bad backend");
        assert!(format!("{err:#}").contains("invalid address"), "{err:#}");
    }

    #[test]
    fn parameter_warnings() {
        let mut route = Route::new(["*.example.com"], ["$2.backend:25565"]);
        let v = validate_routes(std::slice::from_ref(&route));
        assert!(v.errors.is_empty(), "{:?}", v.errors);
        assert_eq!(v.warnings.len(), 1);
        assert!(v.warnings[0].contains("uses parameter $2"));

        route.hosts = vec!["exact.example.com".into()];
        let v = validate_routes(&[route]);
        assert_eq!(v.warnings.len(), 1);
        assert!(v.warnings[0].contains("no wildcards"));

        let ok = Route::new(["*.*.example.com"], ["$2-$1.backend"]);
        assert_eq!(validate_routes(&[ok]), Validation::default());
    }

    #[test]
    fn empty_host_and_backend_are_errors() {
        let v = validate_routes(&[Route::new(Vec::<String>::new(), Vec::<String>::new())]);
        assert_eq!(v.errors.len(), 2);
    }
}
