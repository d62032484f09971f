//! Environment-variable configuration (§6) plus the handful of `clap`
//! flags worth overriding at the command line.
//!
//! Grounded on the teacher's `clap::Parser`/`clap::Args` style
//! (`shelter::commands::base::{Cli, AdditionalArgs}`): a top-level
//! `#[derive(clap::Parser)] #[command(version)]` struct, `SocketAddr`
//! as the arg type for network addresses so clap itself rejects bad
//! input before `main` runs, and env vars read once at startup with a
//! fatal, readable error on malformed required values.

use std::net::SocketAddr;
use std::time::Duration;

use gateway_core::admission::AdmissionLimits;
use gateway_core::dns::{ResolverConfig, Upstream};
use gateway_core::policy::{self, EgressPolicy};
use gateway_core::tcp::mux::MuxSessionConfig;

#[derive(Debug, clap::Parser)]
#[command(version, about = "Browser-facing egress gateway")]
pub struct Cli {
    /// Listen address; overrides HOST/PORT when given.
    #[arg(long = "listen")]
    pub listen: Option<SocketAddr>,

    #[arg(long = "host", env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long = "port", env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// `KEY=VALUE` file applied to the environment before `Config::from_env`
    /// runs; a variable already set in the real environment wins.
    #[arg(long = "config", env = "CONFIG_FILE")]
    pub config_file: Option<std::path::PathBuf>,
}

impl Cli {
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        match self.listen {
            Some(addr) => Ok(addr),
            None => format!("{}:{}", self.host, self.port).parse(),
        }
    }
}

/// Apply `KEY=VALUE` lines from `path` to the process environment,
/// skipping blank lines and `#` comments. A variable already set in
/// the real environment is left untouched.
pub fn apply_config_file(path: &std::path::Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError(format!("reading {path:?}: {e}")))?;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError(format!("{path:?}:{}: expected KEY=VALUE", lineno + 1)))?;
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

/// Everything the `gateway` binary needs once, assembled from the
/// environment at startup. Parsing failures for a required or
/// malformed variable are fatal — there is no sensible partial config.
pub struct Config {
    pub public_base_url: String,
    pub allowed_origins: Vec<String>,
    pub trust_proxy: bool,
    /// Parsed for operator visibility only — TLS termination is an
    /// external collaborator's job; the binary always binds plain HTTP.
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub rate_limit_requests_per_minute: u32,
    pub shutdown_grace_ms: u64,
    pub tcp_connect_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub tcp_total_timeout: Option<Duration>,
    pub admission_limits: AdmissionLimits,
    pub egress_policy: EgressPolicy,
    pub mux: MuxSessionConfig,
    pub resolver: ResolverConfig,
}

/// Raised when a required environment variable is present but cannot
/// be parsed into the type it needs to be.
#[derive(Debug)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|e| ConfigError(format!("{name}={raw:?}: {e}"))),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError(format!("{name}={raw:?} is not a boolean"))),
        },
    }
}

fn parse_upstream(raw: &str) -> Result<Upstream, ConfigError> {
    let raw = raw.trim();
    if let Some(url) = raw.strip_prefix("doh:") {
        return Ok(Upstream::Doh(url.to_string()));
    }
    if raw.starts_with("https://") || raw.starts_with("http://") {
        return Ok(Upstream::Doh(raw.to_string()));
    }
    if let Some(addr) = raw.strip_prefix("tcp:") {
        return addr
            .parse()
            .map(Upstream::Tcp)
            .map_err(|e| ConfigError(format!("DNS_UPSTREAMS entry {raw:?}: {e}")));
    }
    if let Some(addr) = raw.strip_prefix("udp:") {
        return addr
            .parse()
            .map(Upstream::Udp)
            .map_err(|e| ConfigError(format!("DNS_UPSTREAMS entry {raw:?}: {e}")));
    }
    raw.parse()
        .map(Upstream::Udp)
        .map_err(|e| ConfigError(format!("DNS_UPSTREAMS entry {raw:?}: {e}")))
}

impl Config {
    /// Load every §6 environment variable, applying the documented
    /// defaults. Loading happens once, at process startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_base_url = env_or("PUBLIC_BASE_URL", "http://localhost:8080");
        let allowed_origins = env_or("ALLOWED_ORIGINS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let trust_proxy = env_bool("TRUST_PROXY", false)?;
        let tls_enabled = env_bool("TLS_ENABLED", false)?;
        let tls_cert_path = std::env::var("TLS_CERT_PATH").ok();
        let tls_key_path = std::env::var("TLS_KEY_PATH").ok();
        if tls_enabled {
            log::warn!("TLS_ENABLED is set but TLS termination is out of scope for this process; put a reverse proxy in front of it");
        }
        let rate_limit_requests_per_minute = env_parse("RATE_LIMIT_REQUESTS_PER_MINUTE", 600u32)?;
        let shutdown_grace_ms = env_parse("SHUTDOWN_GRACE_MS", 5_000u64)?;

        let tcp_connect_timeout = Duration::from_millis(env_parse("TCP_CONNECT_TIMEOUT_MS", 15_000u64)?);
        let tcp_idle_timeout = Duration::from_secs(env_parse("TCP_IDLE_TIMEOUT_SECONDS", 300u64)?);
        let tcp_total_timeout_secs: u64 = env_parse("TCP_TOTAL_TIMEOUT_SECONDS", 0u64)?;
        let tcp_total_timeout = if tcp_total_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(tcp_total_timeout_secs))
        };

        let admission_limits = AdmissionLimits {
            max_global: env_parse("TCP_PROXY_MAX_CONNECTIONS", 0u64)?,
            max_per_ip: env_parse("TCP_PROXY_MAX_CONNECTIONS_PER_IP", 0u64)?,
        };

        let require_dns_name = env_bool("TCP_REQUIRE_DNS_NAME", false)?;
        let allow_private_ips = env_bool("TCP_ALLOW_PRIVATE_IPS", false)?;
        let block_list = policy::parse_policy_list(&env_or("TCP_BLOCK_LIST", ""))
            .map_err(|e| ConfigError(format!("TCP_BLOCK_LIST: {e}")))?;
        let allow_list = policy::parse_policy_list(&env_or("TCP_ALLOW_LIST", ""))
            .map_err(|e| ConfigError(format!("TCP_ALLOW_LIST: {e}")))?;
        let egress_policy = EgressPolicy {
            require_dns_name,
            allow_private_ips,
            block_list,
            allow_list,
        };

        let mux = MuxSessionConfig {
            max_frame_payload_bytes: env_parse("TCP_MUX_MAX_FRAME_PAYLOAD_BYTES", gateway_core::tcp::mux::DEFAULT_MAX_FRAME_PAYLOAD_BYTES)?,
            max_streams_per_session: env_parse("TCP_MUX_MAX_STREAMS", 64usize)?,
            our_initial_window: env_parse("TCP_MUX_INITIAL_WINDOW_BYTES", 256 * 1024u32)?,
            idle_ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        };

        let upstream_raw = env_or("DNS_UPSTREAMS", "");
        let upstreams = upstream_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_upstream)
            .collect::<Result<Vec<_>, _>>()?;

        let resolver = ResolverConfig {
            upstreams,
            upstream_timeout: Duration::from_millis(env_parse("DNS_UPSTREAM_TIMEOUT_MS", 200u64)?),
            max_query_bytes: env_parse("DNS_MAX_QUERY_BYTES", 512usize)?,
            max_response_bytes: env_parse("DNS_MAX_RESPONSE_BYTES", 4096usize)?,
            allow_any_qtype: env_bool("DNS_ALLOW_ANY", false)?,
            allow_private_answers: env_bool("DNS_ALLOW_PRIVATE_ANSWERS", false)?,
            allow_private_ptr: env_bool("DNS_ALLOW_PRIVATE_PTR", false)?,
            cache_max_entries: env_parse("DNS_CACHE_MAX_ENTRIES", 10_000usize)?,
            cache_max_ttl: Duration::from_secs(env_parse("DNS_CACHE_MAX_TTL_SECONDS", 300u64)?),
            cache_negative_ttl: Duration::from_secs(env_parse("DNS_CACHE_NEGATIVE_TTL_SECONDS", 30u64)?),
            qps_per_ip: env_parse("DNS_QPS_PER_IP", 20u32)?,
            burst_per_ip: env_parse("DNS_BURST_PER_IP", 40u32)?,
        };

        Ok(Self {
            public_base_url,
            allowed_origins,
            trust_proxy,
            tls_enabled,
            tls_cert_path,
            tls_key_path,
            rate_limit_requests_per_minute,
            shutdown_grace_ms,
            tcp_connect_timeout,
            tcp_idle_timeout,
            tcp_total_timeout,
            admission_limits,
            egress_policy,
            mux,
            resolver,
        })
    }
}
