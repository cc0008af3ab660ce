//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{Experiment, ExperimentName, ExperimentRegistry, Variant, forbidden_char};

mod cli;

pub use cli::*;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "render-cache";
const ENV_PREFIX: &str = "RENDER_CACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 90;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_LEAK_INTERVAL_SECS: u64 = 60;
const DEFAULT_LEAK_MAX_BASE_KEYS: u64 = 5_000;
const DEFAULT_LEAK_MAX_VARIANTS: u64 = 20_000;
const DEFAULT_LEAK_MAX_IN_FLIGHT: u64 = 500;
const DEFAULT_LEAK_MAX_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_HEALTH_CHECK_USER_AGENT: &str = "render-cache-healthcheck";
const DEFAULT_EXCLUDED_PATH_PREFIXES: [&str; 2] = ["/editPost", "/collaborateOnPost"];
const DEFAULT_LINK_PREVIEW_PREFIXES: [&str; 1] = ["Slackbot-LinkExpanding"];
const DEFAULT_AUTH_COOKIE: &str = "loginToken";
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ORIGIN_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub leak_monitor: LeakMonitorSettings,
    pub metrics: MetricsSettings,
    pub bypass: BypassSettings,
    pub origin: OriginSettings,
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_bytes: NonZeroUsize,
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LeakMonitorSettings {
    pub interval: Duration,
    pub max_base_keys: NonZeroUsize,
    pub max_variants: NonZeroUsize,
    pub max_in_flight: NonZeroUsize,
    pub max_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub health_check_user_agent: String,
}

#[derive(Debug, Clone)]
pub struct BypassSettings {
    pub excluded_path_prefixes: Vec<String>,
    pub user_agent_prefixes: Vec<String>,
    pub auth_cookie: String,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Required to serve; other commands run without it.
    pub url: Option<Url>,
    pub timeout: Duration,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("bypass.excluded_path_prefixes")
            .with_list_parse_key("bypass.user_agent_prefixes"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    leak_monitor: RawLeakMonitorSettings,
    metrics: RawMetricsSettings,
    bypass: RawBypassSettings,
    origin: RawOriginSettings,
    experiments: Vec<RawExperiment>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(seconds) = overrides.origin_timeout_seconds {
            self.origin.timeout_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(bytes) = overrides.cache_max_bytes {
            self.cache.max_bytes = Some(bytes);
        }
        if let Some(seconds) = overrides.cache_max_age_seconds {
            self.cache.max_age_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            leak_monitor,
            metrics,
            bypass,
            origin,
            experiments,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let leak_monitor = build_leak_monitor_settings(leak_monitor)?;
        let metrics = build_metrics_settings(metrics)?;
        let bypass = build_bypass_settings(bypass)?;
        let origin = build_origin_settings(origin)?;
        let experiments = build_experiments(experiments)?;

        Ok(Self {
            server,
            logging,
            cache,
            leak_monitor,
            metrics,
            bypass,
            origin,
            experiments,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_shutdown = seconds(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        max_bytes: non_zero_usize(
            cache.max_bytes.unwrap_or(DEFAULT_CACHE_MAX_BYTES),
            "cache.max_bytes",
        )?,
        max_age: seconds(
            cache.max_age_seconds.unwrap_or(DEFAULT_CACHE_MAX_AGE_SECS),
            "cache.max_age_seconds",
        )?,
        sweep_interval: seconds(
            cache
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            "cache.sweep_interval_seconds",
        )?,
    })
}

fn build_leak_monitor_settings(
    leak: RawLeakMonitorSettings,
) -> Result<LeakMonitorSettings, LoadError> {
    Ok(LeakMonitorSettings {
        interval: seconds(
            leak.interval_seconds.unwrap_or(DEFAULT_LEAK_INTERVAL_SECS),
            "leak_monitor.interval_seconds",
        )?,
        max_base_keys: non_zero_usize(
            leak.max_base_keys.unwrap_or(DEFAULT_LEAK_MAX_BASE_KEYS),
            "leak_monitor.max_base_keys",
        )?,
        max_variants: non_zero_usize(
            leak.max_variants.unwrap_or(DEFAULT_LEAK_MAX_VARIANTS),
            "leak_monitor.max_variants",
        )?,
        max_in_flight: non_zero_usize(
            leak.max_in_flight.unwrap_or(DEFAULT_LEAK_MAX_IN_FLIGHT),
            "leak_monitor.max_in_flight",
        )?,
        max_bytes: non_zero_usize(
            leak.max_bytes.unwrap_or(DEFAULT_LEAK_MAX_BYTES),
            "leak_monitor.max_bytes",
        )?,
    })
}

fn build_metrics_settings(metrics: RawMetricsSettings) -> Result<MetricsSettings, LoadError> {
    let health_check_user_agent = metrics
        .health_check_user_agent
        .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_USER_AGENT.to_string());
    if health_check_user_agent.trim().is_empty() {
        return Err(LoadError::invalid(
            "metrics.health_check_user_agent",
            "must not be empty",
        ));
    }

    Ok(MetricsSettings {
        health_check_user_agent,
    })
}

fn build_bypass_settings(bypass: RawBypassSettings) -> Result<BypassSettings, LoadError> {
    let excluded_path_prefixes = bypass.excluded_path_prefixes.unwrap_or_else(|| {
        DEFAULT_EXCLUDED_PATH_PREFIXES
            .iter()
            .map(|prefix| (*prefix).to_string())
            .collect()
    });
    if let Some(prefix) = excluded_path_prefixes
        .iter()
        .find(|prefix| !prefix.starts_with('/'))
    {
        return Err(LoadError::invalid(
            "bypass.excluded_path_prefixes",
            format!("`{prefix}` must start with `/`"),
        ));
    }

    let user_agent_prefixes = bypass.user_agent_prefixes.unwrap_or_else(|| {
        DEFAULT_LINK_PREVIEW_PREFIXES
            .iter()
            .map(|prefix| (*prefix).to_string())
            .collect()
    });
    if user_agent_prefixes.iter().any(|prefix| prefix.is_empty()) {
        return Err(LoadError::invalid(
            "bypass.user_agent_prefixes",
            "an empty prefix would bypass every request",
        ));
    }

    let auth_cookie = bypass
        .auth_cookie
        .unwrap_or_else(|| DEFAULT_AUTH_COOKIE.to_string());
    if auth_cookie.trim().is_empty() {
        return Err(LoadError::invalid("bypass.auth_cookie", "must not be empty"));
    }

    Ok(BypassSettings {
        excluded_path_prefixes,
        user_agent_prefixes,
        auth_cookie,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let url = match origin.url.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => {
            let url = Url::parse(value)
                .map_err(|err| LoadError::invalid("origin.url", format!("failed to parse: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "origin.url",
                    format!("unsupported scheme `{}`", url.scheme()),
                ));
            }
            Some(url)
        }
        _ => None,
    };

    Ok(OriginSettings {
        url,
        timeout: seconds(
            origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS),
            "origin.timeout_seconds",
        )?,
        max_body_bytes: non_zero_usize(
            origin
                .max_body_bytes
                .unwrap_or(DEFAULT_ORIGIN_MAX_BODY_BYTES),
            "origin.max_body_bytes",
        )?,
    })
}

fn build_experiments(raw: Vec<RawExperiment>) -> Result<Vec<Experiment>, LoadError> {
    let mut experiments = Vec::with_capacity(raw.len());
    for experiment in raw {
        let name = experiment.name.trim();
        if name.is_empty() {
            return Err(LoadError::invalid("experiments.name", "must not be empty"));
        }
        if let Some(found) = forbidden_char(name) {
            return Err(LoadError::invalid(
                "experiments.name",
                format!("`{name}` contains `{found:?}`; use visible ASCII without `=`, `;` or `,`"),
            ));
        }

        let mut variants: Vec<Variant> = Vec::with_capacity(experiment.variants.len());
        for variant in experiment.variants {
            let label = variant.label.trim();
            if label.is_empty() {
                return Err(LoadError::invalid(
                    "experiments.variants.label",
                    format!("experiment `{name}` has a variant without a label"),
                ));
            }
            if let Some(found) = forbidden_char(label) {
                return Err(LoadError::invalid(
                    "experiments.variants.label",
                    format!(
                        "experiment `{name}` label `{label}` contains `{found:?}`; use visible ASCII without `=`, `;` or `,`"
                    ),
                ));
            }
            if variants.iter().any(|existing| existing.label == label) {
                return Err(LoadError::invalid(
                    "experiments.variants.label",
                    format!("experiment `{name}` declares `{label}` twice"),
                ));
            }
            variants.push(Variant {
                label: label.to_string(),
                weight: variant.weight.unwrap_or(1),
            });
        }

        experiments.push(Experiment {
            name: ExperimentName::new(name),
            variants,
        });
    }

    ExperimentRegistry::from_experiments(experiments.iter().cloned())
        .map_err(|err| LoadError::invalid("experiments", err.to_string()))?;

    Ok(experiments)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_bytes: Option<u64>,
    max_age_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLeakMonitorSettings {
    interval_seconds: Option<u64>,
    max_base_keys: Option<u64>,
    max_variants: Option<u64>,
    max_in_flight: Option<u64>,
    max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMetricsSettings {
    health_check_user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBypassSettings {
    excluded_path_prefixes: Option<Vec<String>>,
    user_agent_prefixes: Option<Vec<String>>,
    auth_cookie: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawExperiment {
    name: String,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawVariant {
    label: String,
    weight: Option<u32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value = NonZeroU64::new(value)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))?;
    let value: usize = value
        .get()
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
