//! Configuration management for the Doxie MCP server.
//!
//! Settings are layered, highest precedence first: command-line flags,
//! environment variables (`DOXIE_*`, including those loaded from `.env`),
//! the YAML settings file, then built-in defaults.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default location of the YAML settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

/// Command-line arguments for the Doxie MCP server.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "doxie-mcp")]
#[command(author = "Doxie Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Doxie MCP server: JSON-RPC over stdio or streaming HTTP")]
pub struct Args {
    /// YAML settings file
    #[arg(short, long, env = "DOXIE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Transport mode: stdio or http (sse is an alias of http)
    #[arg(short, long, env = "DOXIE_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// HTTP bind address (only for http transport)
    #[arg(long, env = "DOXIE_HOST")]
    pub host: Option<String>,

    /// HTTP port (only for http transport)
    #[arg(short, long, env = "DOXIE_PORT")]
    pub port: Option<u16>,

    /// HTTP endpoint path (only for http transport)
    #[arg(long, env = "DOXIE_PATH")]
    pub path: Option<String>,

    /// How long closing sessions wait for outstanding requests (e.g. 10s, 500ms)
    #[arg(long, env = "DOXIE_DRAIN_TIMEOUT", value_parser = parse_duration)]
    pub drain_timeout: Option<Duration>,

    /// Close HTTP sessions whose event stream has not attached within this window
    #[arg(long, env = "DOXIE_SESSION_IDLE_TIMEOUT", value_parser = parse_duration)]
    pub session_idle_timeout: Option<Duration>,

    /// Request dispatch within a session: concurrent or serialized
    #[arg(long, env = "DOXIE_DISPATCH")]
    pub dispatch: Option<DispatchMode>,

    /// Maximum size of one incoming message in bytes
    #[arg(long, env = "DOXIE_MAX_FRAME_BYTES")]
    pub max_frame_bytes: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, env = "DOXIE_DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, env = "DOXIE_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Enable Prometheus metrics
    #[arg(long, env = "DOXIE_METRICS")]
    pub metrics: bool,
}

/// Transport mode. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    #[value(alias = "sse")]
    #[serde(alias = "sse")]
    Http,
}

/// How requests within one session are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Each request runs as its own task; responses may overtake each other.
    Concurrent,
    /// One request at a time; responses follow arrival order.
    Serialized,
}

impl DispatchMode {
    /// Default for a transport: serialized on stdio, concurrent on HTTP.
    pub fn default_for(transport: TransportKind) -> Self {
        match transport {
            TransportKind::Stdio => Self::Serialized,
            TransportKind::Http => Self::Concurrent,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Contents of the YAML settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSettings {
    #[serde(default)]
    pub app: AppSection,
}

/// The `app:` section of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub transport: Option<TransportKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    #[serde(default, with = "duration::option")]
    pub drain_timeout: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub session_idle_timeout: Option<Duration>,
    pub dispatch: Option<DispatchMode>,
    pub max_frame_bytes: Option<usize>,
    pub debug: Option<bool>,
    pub log_format: Option<LogFormat>,
    pub metrics: Option<bool>,
}

impl FileSettings {
    /// Read a settings file. A missing file yields empty settings.
    pub fn read(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Self::default()),
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Transport mode
    pub transport: TransportKind,
    /// HTTP bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// HTTP endpoint path
    pub path: String,
    /// Drain window for closing sessions
    #[serde(with = "duration")]
    pub drain_timeout: Duration,
    /// How long an HTTP session may wait for its event stream
    #[serde(with = "duration")]
    pub session_idle_timeout: Duration,
    /// Dispatch mode
    pub dispatch: DispatchMode,
    /// Maximum incoming message size
    pub max_frame_bytes: usize,
    /// Debug mode
    pub debug: bool,
    /// Log format
    pub log_format: LogFormat,
    /// Metrics enabled
    pub metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            host: "127.0.0.1".to_string(),
            port: 8000,
            path: "/mcp".to_string(),
            drain_timeout: Duration::from_secs(10),
            session_idle_timeout: Duration::from_secs(300),
            dispatch: DispatchMode::default_for(TransportKind::Stdio),
            max_frame_bytes: 4 * 1024 * 1024,
            debug: false,
            log_format: LogFormat::Text,
            metrics: false,
        }
    }
}

impl Config {
    /// Load configuration from parsed arguments and the settings file they
    /// point at.
    pub fn load(args: &Args) -> Result<Self> {
        let path = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = FileSettings::read(&path)?;
        Self::resolve(args, file)
    }

    /// Merge arguments over file settings over defaults.
    pub fn resolve(args: &Args, file: FileSettings) -> Result<Self> {
        let defaults = Self::default();
        let app = file.app;

        let transport = args.transport.or(app.transport).unwrap_or(defaults.transport);
        let config = Self {
            transport,
            host: args.host.clone().or(app.host).unwrap_or(defaults.host),
            port: args.port.or(app.port).unwrap_or(defaults.port),
            path: args.path.clone().or(app.path).unwrap_or(defaults.path),
            drain_timeout: args
                .drain_timeout
                .or(app.drain_timeout)
                .unwrap_or(defaults.drain_timeout),
            session_idle_timeout: args
                .session_idle_timeout
                .or(app.session_idle_timeout)
                .unwrap_or(defaults.session_idle_timeout),
            dispatch: args
                .dispatch
                .or(app.dispatch)
                .unwrap_or_else(|| DispatchMode::default_for(transport)),
            max_frame_bytes: args
                .max_frame_bytes
                .or(app.max_frame_bytes)
                .unwrap_or(defaults.max_frame_bytes),
            debug: args.debug || app.debug.unwrap_or(defaults.debug),
            log_format: args.log_format.or(app.log_format).unwrap_or_default(),
            metrics: args.metrics || app.metrics.unwrap_or(defaults.metrics),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::Config(format!(
                "HTTP path must start with '/': {}",
                self.path
            )));
        }
        if self.session_idle_timeout.is_zero() {
            return Err(Error::Config(
                "session_idle_timeout must be positive".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config("max_frame_bytes must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parse a duration such as `10s`, `500ms`, `2m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", input))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        other => return Err(format!("unknown duration unit {:?} in {:?}", other, input)),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {:?}: {}", input, e))
}

/// Serde helpers for durations written as `10s`, `500ms` or plain seconds.
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    fn from_raw<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(s) => Duration::try_from_secs_f64(s).map_err(E::custom),
            Raw::Text(t) => super::parse_duration(&t).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(from_raw)
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml(text: &str) -> FileSettings {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_transport_default() {
        assert_eq!(TransportKind::default(), TransportKind::Stdio);
    }

    #[test]
    fn test_transport_deserialization() {
        let stdio: TransportKind = serde_json::from_str("\"stdio\"").unwrap();
        assert_eq!(stdio, TransportKind::Stdio);

        let http: TransportKind = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(http, TransportKind::Http);

        let sse: TransportKind = serde_json::from_str("\"sse\"").unwrap();
        assert_eq!(sse, TransportKind::Http);
    }

    #[test]
    fn test_sse_alias_on_command_line() {
        let args = Args::try_parse_from(["doxie-mcp", "--transport", "sse"]).unwrap();
        assert_eq!(args.transport, Some(TransportKind::Http));
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.path, "/mcp");
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.dispatch, DispatchMode::Serialized);
        assert!(!config.debug);
        assert!(!config.metrics);
    }

    #[test]
    fn test_dispatch_defaults_follow_transport() {
        let args = Args {
            transport: Some(TransportKind::Http),
            ..Args::default()
        };
        let config = Config::resolve(&args, FileSettings::default()).unwrap();
        assert_eq!(config.dispatch, DispatchMode::Concurrent);

        let config = Config::resolve(&Args::default(), FileSettings::default()).unwrap();
        assert_eq!(config.dispatch, DispatchMode::Serialized);
    }

    #[test]
    fn test_args_override_file_override_defaults() {
        let file = yaml(
            "app:\n  transport: http\n  port: 9000\n  host: 0.0.0.0\n  drain_timeout: 2m\n",
        );
        let args = Args {
            port: Some(4000),
            ..Args::default()
        };

        let config = Config::resolve(&args, file).unwrap();
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.drain_timeout, Duration::from_secs(120));
        assert_eq!(config.path, "/mcp");
    }

    #[test]
    fn test_invalid_path_rejected() {
        let args = Args {
            path: Some("mcp".to_string()),
            ..Args::default()
        };
        let err = Config::resolve(&args, FileSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_session_idle_timeout_layering() {
        let file = yaml("app:\n  session_idle_timeout: 90s\n");
        let config = Config::resolve(&Args::default(), file).unwrap();
        assert_eq!(config.session_idle_timeout, Duration::from_secs(90));

        let args = Args {
            session_idle_timeout: Some(Duration::ZERO),
            ..Args::default()
        };
        let err = Config::resolve(&args, FileSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5h").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            transport: TransportKind::Http,
            port: 8080,
            drain_timeout: Duration::from_millis(1500),
            ..Config::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"transport\":\"http\""));
        assert!(json.contains("\"port\":8080"));
        assert!(json.contains("\"drain_timeout\":\"1500ms\""));

        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_reads_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "app:\n  transport: sse\n  path: /rpc\n  dispatch: serialized").unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Args::default()
        };
        let config = Config::load(&args).unwrap();
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.path, "/rpc");
        assert_eq!(config.dispatch, DispatchMode::Serialized);
    }

    #[test]
    fn test_missing_settings_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            config: Some(dir.path().join("absent.yaml")),
            ..Args::default()
        };
        assert_eq!(Config::load(&args).unwrap(), Config::default());
    }

    #[test]
    fn test_malformed_settings_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "app: [not, a, map]").unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Args::default()
        };
        assert!(matches!(Config::load(&args), Err(Error::Yaml(_))));
    }
}
