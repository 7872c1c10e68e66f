//! Configuration layer: typed settings with layered precedence (file → env → CLI).
//!
//! Server and logging problems abort startup. Problems in the cache, monitor
//! and warmer sections fall back to defaults and are returned as
//! [`ConfigWarning`]s so they can be logged once telemetry is up.

use std::{fmt, net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

use crate::cache::CacheConfig;
use crate::infra::cache_warmer::{DEFAULT_WARM_MAX_RECORDS, DEFAULT_WARM_TTL_SECONDS};
use crate::monitor::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_PARAM_LENGTH, DEFAULT_MAX_QUERY_LENGTH,
    DEFAULT_SLOW_QUERY_THRESHOLD_MS,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "recordcache";
const ENV_PREFIX: &str = "RECORDCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_WARM_INTERVAL_MINUTES: u64 = 0;
/// One week.
const MAX_WARM_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
    pub warmer: WarmerSettings,
    /// Values that were replaced by defaults.
    pub warnings: Vec<ConfigWarning>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub key_prefix: String,
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    pub operation_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            enabled: defaults.enabled,
            default_ttl_seconds: defaults.default_ttl_seconds,
            max_ttl_seconds: defaults.max_ttl_seconds,
            key_prefix: defaults.key_prefix,
            backend: CacheBackendKind::Memory,
            redis_url: None,
            operation_timeout: defaults.operation_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub slow_query_threshold_ms: u64,
    pub buffer_size: NonZeroUsize,
    pub max_query_length: NonZeroUsize,
    pub max_param_length: NonZeroUsize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            buffer_size: non_zero_default(DEFAULT_BUFFER_SIZE),
            max_query_length: non_zero_default(DEFAULT_MAX_QUERY_LENGTH),
            max_param_length: non_zero_default(DEFAULT_MAX_PARAM_LENGTH),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmerSettings {
    pub on_startup: bool,
    /// Minutes between scheduled passes; zero means no schedule.
    pub interval_minutes: u64,
    pub max_records: NonZeroUsize,
    pub ttl_seconds: u64,
}

impl Default for WarmerSettings {
    fn default() -> Self {
        Self {
            on_startup: false,
            interval_minutes: DEFAULT_WARM_INTERVAL_MINUTES,
            max_records: non_zero_default(DEFAULT_WARM_MAX_RECORDS),
            ttl_seconds: DEFAULT_WARM_TTL_SECONDS,
        }
    }
}

/// A configuration value that was rejected and replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` = `{}` ignored: {}",
            self.key, self.value, self.reason
        )
    }
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    monitor: RawMonitorSettings,
    warmer: RawWarmerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
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
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled.to_string());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(ttl) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(ttl.to_string());
        }
        if let Some(threshold) = overrides.monitor_slow_query_threshold_ms {
            self.monitor.slow_query_threshold_ms = Some(threshold.to_string());
        }
        if let Some(on_startup) = overrides.warm_on_startup {
            self.warmer.on_startup = Some(on_startup.to_string());
        }
        if let Some(minutes) = overrides.warm_interval_minutes {
            self.warmer.interval_minutes = Some(minutes.to_string());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            monitor,
            warmer,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;

        let mut warnings = Warnings::default();
        let cache = build_cache_settings(cache, &mut warnings);
        let monitor = build_monitor_settings(monitor, &mut warnings);
        let warmer = build_warmer_settings(warmer, &mut warnings);

        Ok(Self {
            server,
            logging,
            cache,
            monitor,
            warmer,
            warnings: warnings.0,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_cache_settings(cache: RawCacheSettings, warnings: &mut Warnings) -> CacheSettings {
    let defaults = CacheSettings::default();

    let enabled = warnings.flag("cache.enabled", cache.enabled, defaults.enabled);
    let mut default_ttl_seconds = warnings.positive(
        "cache.default_ttl_seconds",
        cache.default_ttl_seconds,
        defaults.default_ttl_seconds,
    );
    let max_ttl_seconds = warnings.positive(
        "cache.max_ttl_seconds",
        cache.max_ttl_seconds,
        defaults.max_ttl_seconds,
    );
    if default_ttl_seconds > max_ttl_seconds {
        warnings.push(
            "cache.default_ttl_seconds",
            default_ttl_seconds.to_string(),
            format!("exceeds cache.max_ttl_seconds ({max_ttl_seconds}); clamped"),
        );
        default_ttl_seconds = max_ttl_seconds;
    }

    let key_prefix = cache.key_prefix.unwrap_or(defaults.key_prefix);
    let backend = warnings.parsed("cache.backend", cache.backend, defaults.backend);
    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let backend = if backend == CacheBackendKind::Redis && redis_url.is_none() {
        warnings.push(
            "cache.backend",
            "redis",
            "cache.redis_url is not set; using the memory backend",
        );
        CacheBackendKind::Memory
    } else {
        backend
    };

    let timeout_ms = warnings.positive(
        "cache.operation_timeout_ms",
        cache.operation_timeout_ms,
        defaults.operation_timeout.as_millis() as u64,
    );

    CacheSettings {
        enabled,
        default_ttl_seconds,
        max_ttl_seconds,
        key_prefix,
        backend,
        redis_url,
        operation_timeout: Duration::from_millis(timeout_ms),
    }
}

fn build_monitor_settings(monitor: RawMonitorSettings, warnings: &mut Warnings) -> MonitorSettings {
    let defaults = MonitorSettings::default();
    MonitorSettings {
        slow_query_threshold_ms: warnings.parsed(
            "monitor.slow_query_threshold_ms",
            monitor.slow_query_threshold_ms,
            defaults.slow_query_threshold_ms,
        ),
        buffer_size: warnings.parsed(
            "monitor.buffer_size",
            monitor.buffer_size,
            defaults.buffer_size,
        ),
        max_query_length: warnings.parsed(
            "monitor.max_query_length",
            monitor.max_query_length,
            defaults.max_query_length,
        ),
        max_param_length: warnings.parsed(
            "monitor.max_param_length",
            monitor.max_param_length,
            defaults.max_param_length,
        ),
    }
}

fn build_warmer_settings(warmer: RawWarmerSettings, warnings: &mut Warnings) -> WarmerSettings {
    let defaults = WarmerSettings::default();
    WarmerSettings {
        on_startup: warnings.flag("warmer.on_startup", warmer.on_startup, defaults.on_startup),
        interval_minutes: warnings.at_most(
            "warmer.interval_minutes",
            warmer.interval_minutes,
            defaults.interval_minutes,
            MAX_WARM_INTERVAL_MINUTES,
        ),
        max_records: warnings.parsed(
            "warmer.max_records",
            warmer.max_records,
            defaults.max_records,
        ),
        ttl_seconds: warnings.positive("warmer.ttl_seconds", warmer.ttl_seconds, defaults.ttl_seconds),
    }
}

#[derive(Debug, Default)]
struct Warnings(Vec<ConfigWarning>);

impl Warnings {
    fn push(&mut self, key: &'static str, value: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ConfigWarning {
            key,
            value: value.into(),
            reason: reason.into(),
        });
    }

    fn parsed<T>(&mut self, key: &'static str, raw: Option<String>, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = raw else {
            return default;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(err) => {
                self.push(key, raw, format!("{err}; using default"));
                default
            }
        }
    }

    fn at_most(&mut self, key: &'static str, raw: Option<String>, default: u64, max: u64) -> u64 {
        match self.parsed(key, raw, default) {
            value if value > max => {
                self.push(
                    key,
                    value.to_string(),
                    format!("must be at most {max}; using default"),
                );
                default
            }
            value => value,
        }
    }

    fn positive(&mut self, key: &'static str, raw: Option<String>, default: u64) -> u64 {
        match self.parsed(key, raw, default) {
            0 => {
                self.push(key, "0", "must be greater than zero; using default");
                default
            }
            value => value,
        }
    }

    fn flag(&mut self, key: &'static str, raw: Option<String>, default: bool) -> bool {
        let Some(raw) = raw else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                self.push(key, raw, "expected a boolean; using default");
                default
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

// Cache, monitor and warmer values are read as text so a malformed entry
// degrades to its default instead of failing the whole load.

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<String>,
    default_ttl_seconds: Option<String>,
    max_ttl_seconds: Option<String>,
    key_prefix: Option<String>,
    backend: Option<String>,
    redis_url: Option<String>,
    operation_timeout_ms: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    slow_query_threshold_ms: Option<String>,
    buffer_size: Option<String>,
    max_query_length: Option<String>,
    max_param_length: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmerSettings {
    on_startup: Option<String>,
    interval_minutes: Option<String>,
    max_records: Option<String>,
    ttl_seconds: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_default(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}
