use std::{
    collections::BTreeMap,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::natpunch::tunnel::frame::Mode;

const CONFIG_ENV: &str = "NATPUNCH_CONFIG";
const CONFIG_CANDIDATES: [&str; 4] = ["natpunch.toml", "natpunch.yaml", "natpunch.yml", "natpunch.json"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(explicit_flag_path, std::env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("."))
}

fn resolve_config_path_in(
    flag: Option<PathBuf>,
    env: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds NATPUNCH_CONFIG into the flag already; this keeps the
    // precedence visible when the resolver is used on its own.
    if let Some(p) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
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

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/natpunch/natpunch.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;

        let proj = ProjectDirs::from("dev", "natpunch", "natpunch").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("natpunch.toml"))
    }
}

/// Writes the default server config when `path` does not exist yet.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match Format::from_path(path)? {
        Format::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
        Format::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
        Format::Json => DEFAULT_CONFIG_TEMPLATE_JSON,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            _ => anyhow::bail!(
                "config: unsupported config extension {:?} (expected .toml, .yaml/.yml or .json)",
                path.extension()
            ),
        }
    }
}

pub fn load_config(path: &Path, role_override: Option<Role>) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match Format::from_path(path)? {
        Format::Toml => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        Format::Yaml => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        Format::Json => serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?,
    };

    Config::from_file_config(fc, role_override)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => anyhow::bail!("config: role must be \"client\" or \"server\", got {other:?}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Never,
    Daily,
    Hourly,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
    pub rotation: Rotation,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_ip: IpAddr,
    pub negotiators: Vec<String>,
    pub public_ip: Option<IpAddr>,
    pub public_ip_url: String,
    pub services: Vec<u16>,
    pub listen_ip: IpAddr,
    pub bind_ip: IpAddr,
    pub mode: Mode,
    pub padding: bool,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub timeout: Duration,
    pub http_timeout: Duration,
    pub insecure_skip_verify: bool,
    pub resolve: Vec<(String, IpAddr)>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub bind_ip: IpAddr,
    pub forward_host: IpAddr,
    pub padding: bool,
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub ready_grace: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    role: Option<String>,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    client: Option<FileClient>,

    server: Option<FileServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
    rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_ip: Option<String>,
    #[serde(default)]
    negotiators: Vec<String>,
    public_ip: Option<String>,
    public_ip_url: Option<String>,
    #[serde(default)]
    services: Vec<u16>,
    listen_ip: Option<String>,
    bind_ip: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    padding: bool,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    keepalive_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
    #[serde(default)]
    insecure_skip_verify: bool,
    #[serde(default)]
    resolve: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    bind_ip: Option<String>,
    forward_host: Option<String>,
    #[serde(default)]
    padding: bool,
    timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    ready_grace_ms: Option<u64>,
}

fn parse_ip(key: &str, s: &str) -> anyhow::Result<IpAddr> {
    s.trim()
        .parse()
        .with_context(|| format!("config: {key}: invalid ip address {s:?}"))
}

fn opt_ip(key: &str, s: Option<&String>, default: [u8; 4]) -> anyhow::Result<IpAddr> {
    match s.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(s) => parse_ip(key, s),
        None => Ok(IpAddr::from(default)),
    }
}

fn millis(key: &str, v: Option<u64>, default_ms: u64) -> anyhow::Result<Duration> {
    let ms = v.unwrap_or(default_ms);
    if ms == 0 {
        anyhow::bail!("config: {key} must be greater than zero");
    }
    Ok(Duration::from_millis(ms))
}

impl Config {
    fn from_file_config(fc: FileConfig, role_override: Option<Role>) -> anyhow::Result<Config> {
        let role = match (role_override, fc.role.as_deref()) {
            (Some(r), _) => r,
            (None, Some(s)) => Role::parse(s)?,
            (None, None) => anyhow::bail!("config: role is required (\"client\" or \"server\")"),
        };

        let logging = LoggingConfig::from_file(fc.logging)?;

        let client = match (role, fc.client) {
            (Role::Client, None) => anyhow::bail!("config: [client] section is required for role client"),
            (_, Some(c)) => Some(ClientConfig::from_file(c).context("config: [client]")?),
            (Role::Server, None) => None,
        };

        // Every server key has a default, so the section may be omitted.
        let server = match (role, fc.server) {
            (Role::Server, s) => Some(ServerConfig::from_file(s.unwrap_or_default()).context("config: [server]")?),
            (Role::Client, Some(s)) => Some(ServerConfig::from_file(s).context("config: [server]")?),
            (Role::Client, None) => None,
        };

        Ok(Config {
            role,
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            client,
            server,
        })
    }
}

impl LoggingConfig {
    fn from_file(fl: Option<FileLogging>) -> anyhow::Result<Self> {
        let mut out = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
            rotation: Rotation::Never,
        };
        let Some(fl) = fl else {
            return Ok(out);
        };

        if let Some(v) = fl.level.filter(|v| !v.trim().is_empty()) {
            out.level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = fl.format.filter(|v| !v.trim().is_empty()) {
            let v = v.trim().to_ascii_lowercase();
            if v != "text" && v != "json" {
                anyhow::bail!("config: logging.format must be \"text\" or \"json\", got {v:?}");
            }
            out.format = v;
        }
        if let Some(v) = fl.output.filter(|v| !v.trim().is_empty()) {
            out.output = v.trim().to_string();
        }
        out.add_source = fl.add_source;
        out.rotation = match fl.rotation.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
            None => Rotation::Never,
            Some(s) => match s.as_str() {
                "" | "never" => Rotation::Never,
                "daily" => Rotation::Daily,
                "hourly" => Rotation::Hourly,
                other => anyhow::bail!("config: logging.rotation must be never, daily or hourly, got {other:?}"),
            },
        };
        Ok(out)
    }
}

impl ClientConfig {
    fn from_file(fc: FileClient) -> anyhow::Result<Self> {
        let server_ip = match fc.server_ip.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => parse_ip("client.server_ip", s)?,
            _ => anyhow::bail!("config: client.server_ip is required"),
        };

        let negotiators: Vec<String> = fc
            .negotiators
            .iter()
            .map(|n| n.trim().trim_end_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if negotiators.is_empty() {
            anyhow::bail!("config: client.negotiators must list at least one URL");
        }

        if fc.services.is_empty() {
            anyhow::bail!("config: client.services must list at least one port");
        }
        if fc.services.contains(&0) {
            anyhow::bail!("config: client.services: port 0 is not a service port");
        }
        let mut services = fc.services.clone();
        services.sort_unstable();
        services.dedup();

        let public_ip = match fc.public_ip.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Some(parse_ip("client.public_ip", s)?),
            _ => None,
        };

        let mode = match fc.mode.as_deref() {
            None => Mode::Tunnel,
            Some(s) => Mode::parse(s)
                .with_context(|| format!("config: client.mode must be \"tunnel\" or \"vpn\", got {s:?}"))?,
        };

        let mut resolve = Vec::with_capacity(fc.resolve.len());
        for (host, ip) in &fc.resolve {
            resolve.push((host.trim().to_string(), parse_ip(&format!("client.resolve.{host}"), ip)?));
        }

        Ok(ClientConfig {
            server_ip,
            negotiators,
            public_ip,
            public_ip_url: fc
                .public_ip_url
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://api.ipify.org".into()),
            services,
            listen_ip: opt_ip("client.listen_ip", fc.listen_ip.as_ref(), [0, 0, 0, 0])?,
            bind_ip: opt_ip("client.bind_ip", fc.bind_ip.as_ref(), [0, 0, 0, 0])?,
            mode,
            padding: fc.padding,
            retry_count: fc.retry_count.unwrap_or(5),
            retry_delay: Duration::from_millis(fc.retry_delay_ms.unwrap_or(3000)),
            handshake_timeout: millis("client.handshake_timeout_ms", fc.handshake_timeout_ms, 10_000)?,
            keepalive_interval: millis("client.keepalive_interval_ms", fc.keepalive_interval_ms, 5_000)?,
            timeout: millis("client.timeout_ms", fc.timeout_ms, 15_000)?,
            http_timeout: millis("client.http_timeout_ms", fc.http_timeout_ms, 5_000)?,
            insecure_skip_verify: fc.insecure_skip_verify,
            resolve,
        })
    }
}

impl ServerConfig {
    fn from_file(f: FileServer) -> anyhow::Result<Self> {
        let listen_addr = f
            .listen_addr
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ":80".into());

        Ok(ServerConfig {
            listen_addr,
            bind_ip: opt_ip("server.bind_ip", f.bind_ip.as_ref(), [0, 0, 0, 0])?,
            forward_host: opt_ip("server.forward_host", f.forward_host.as_ref(), [127, 0, 0, 1])?,
            padding: f.padding,
            timeout: millis("server.timeout_ms", f.timeout_ms, 15_000)?,
            sweep_interval: millis("server.sweep_interval_ms", f.sweep_interval_ms, 10_000)?,
            ready_grace: millis("server.ready_grace_ms", f.ready_grace_ms, 10_000)?,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# natpunch configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path. This
# default runs the rendezvous server; switch `role` to "client" and fill in
# the [client] section to expose local UDP services through it.

role = "server"
admin_addr = ""

[server]
listen_addr = ":80"
bind_ip = "0.0.0.0"
forward_host = "127.0.0.1"
padding = false
timeout_ms = 15000
sweep_interval_ms = 10000
ready_grace_ms = 10000

[logging]
level = "info"
format = "text"
output = "stderr"
add_source = false
rotation = "never"

# [client]
# server_ip = "203.0.113.10"
# negotiators = ["http://203.0.113.10"]
# services = [25565]
# mode = "tunnel"
# padding = false
# retry_count = 5
# retry_delay_ms = 3000
# keepalive_interval_ms = 5000
# timeout_ms = 15000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# natpunch configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path. This
# default runs the rendezvous server; switch `role` to "client" and add a
# `client` section to expose local UDP services through it.

role: "server"
admin_addr: ""

server:
  listen_addr: ":80"
  bind_ip: "0.0.0.0"
  forward_host: "127.0.0.1"
  padding: false
  timeout_ms: 15000
  sweep_interval_ms: 10000
  ready_grace_ms: 10000

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false
  rotation: "never"
"#;

const DEFAULT_CONFIG_TEMPLATE_JSON: &str = r#"{
  "role": "server",
  "admin_addr": "",
  "server": {
    "listen_addr": ":80",
    "bind_ip": "0.0.0.0",
    "forward_host": "127.0.0.1",
    "padding": false,
    "timeout_ms": 15000,
    "sweep_interval_ms": 10000,
    "ready_grace_ms": 10000
  },
  "logging": {
    "level": "info",
    "format": "text",
    "output": "stderr",
    "add_source": false,
    "rotation": "never"
  }
}
"#;
