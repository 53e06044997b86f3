use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::Value;

pub const CONFIG_ENV_VAR: &str = "FLEETD_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "fleetd.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub dispatcher: DispatcherConfig,
    pub jobs: JobsConfig,
    pub heartbeat: HeartbeatConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    /// Identity of this management server; owns the jobs it submits.
    pub management_server_id: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8250,
            tls_enabled: false,
            management_server_id: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
    pub startup_timeout_ms: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: 8 * 1024 * 1024,
            startup_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub default_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Threads executing inbound batches that are not sequenced.
    pub batch_workers: usize,
    /// Unsequenced batches allowed to wait for a worker before new ones are refused.
    pub batch_queue_depth: usize,
    /// How long a send waits for an agent with no live connection to reconnect.
    pub reconnect_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            poll_interval_ms: 20,
            batch_workers: 8,
            batch_queue_depth: 64,
            reconnect_grace_ms: 15_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    pub worker_threads: usize,
    pub retention_secs: u64,
    /// Purge runs on every Nth heartbeat tick.
    pub purge_every_ticks: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            retention_secs: 7 * 24 * 60 * 60,
            purge_every_ticks: 600,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub peer_ttl_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            peer_ttl_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.fleetd/data".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config '{path}': {source}")]
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    #[error("failed to render default config: {0}")]
    Defaults(#[from] toml::ser::Error),
    #[error("failed to deserialize config: {0}")]
    Deserialize(#[from] toml::de::Error),
    #[error("missing value for CLI override '--{key}'")]
    MissingValueForArg { key: String },
    #[error("invalid CLI argument format '{arg}', expected '--section.key value'")]
    InvalidArgFormat { arg: String },
    #[error("invalid override key path '{key}'")]
    InvalidPath { key: String },
    #[error("unknown override key path '{key}'")]
    UnknownPath { key: String },
    #[error("override not supported for complex TOML type at '{key}'")]
    UnsupportedOverrideType { key: String },
    #[error("invalid value '{value}' for '{key}', expected type {expected}")]
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, then `FLEETD_CONFIG`,
    /// then `./fleetd.toml`, falling back to built-in defaults. Remaining
    /// `--section.key value` pairs are applied as overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, rest) = split_config_arg(args)?;
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);

        match discover_config_path(explicit_path, env_path, Path::new(DEFAULT_CONFIG_FILE)) {
            Some(path) => Self::load_from_toml_with_args(path, rest),
            None => Self::defaults_with_args(rest),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let parsed: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;

        // Merge over defaults so overrides can target keys the file omits.
        let mut root_value = Value::try_from(Self::default())?;
        merge_values(&mut root_value, parsed);
        Self::apply_overrides(root_value, args)
    }

    pub fn defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::apply_overrides(Value::try_from(Self::default())?, args)
    }

    fn apply_overrides(
        mut root_value: Value,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        Ok(root_value.try_into()?)
    }
}

fn discover_config_path(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    local_default: &Path,
) -> Option<PathBuf> {
    explicit
        .or(from_env)
        .or_else(|| local_default.exists().then(|| local_default.to_path_buf()))
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(parts[parts.len() - 1])
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::{discover_config_path, split_config_arg, AppConfig, ConfigError};

    fn write_temp_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("fleetd.toml");
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    const SAMPLE: &str = r#"
[logging]
level = "debug"
human_friendly = false

[server]
host = "127.0.0.1"
port = 8250
management_server_id = 42

[heartbeat]
interval_ms = 500
"#;

    #[test]
    fn loads_config_from_toml_without_overrides() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = write_temp_config(&dir, SAMPLE);

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.server.management_server_id, 42);
        assert_eq!(config.heartbeat.interval_ms, 500);
        assert_eq!(config.heartbeat.peer_ttl_ms, 10_000);
        assert_eq!(config.wire.max_envelope_size_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = write_temp_config(&dir, SAMPLE);

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "verbose".to_owned(),
                "--logging.human_friendly".to_owned(),
                "true".to_owned(),
                "--jobs.worker_threads".to_owned(),
                "2".to_owned(),
            ],
        )
        .expect("config with overrides should load");

        assert_eq!(config.logging.level, "verbose");
        assert!(config.logging.human_friendly);
        assert_eq!(config.jobs.worker_threads, 2);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::defaults_with_args(vec!["--logging.nonexistent".to_owned(), "x".to_owned()])
            .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_override_with_wrong_type() {
        let err = AppConfig::defaults_with_args(vec![
            "--dispatcher.default_timeout_ms".to_owned(),
            "soon".to_owned(),
        ])
        .expect_err("non-numeric timeout should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn config_flag_is_split_from_overrides() {
        let (path, rest) = split_config_arg(vec![
            "--server.port".to_owned(),
            "9000".to_owned(),
            "--config".to_owned(),
            "/etc/fleetd.toml".to_owned(),
        ])
        .expect("args should split");

        assert_eq!(path, Some(PathBuf::from("/etc/fleetd.toml")));
        assert_eq!(rest, vec!["--server.port".to_owned(), "9000".to_owned()]);

        let err = split_config_arg(vec!["--config".to_owned()]).expect_err("dangling flag");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }

    #[test]
    fn discovery_prefers_explicit_then_env_then_local_file() {
        let dir = TempDir::new().expect("temp dir should be created");
        let local = write_temp_config(&dir, SAMPLE);
        let missing = dir.path().join("absent.toml");

        assert_eq!(
            discover_config_path(Some("a.toml".into()), Some("b.toml".into()), &local),
            Some(PathBuf::from("a.toml"))
        );
        assert_eq!(
            discover_config_path(None, Some("b.toml".into()), &local),
            Some(PathBuf::from("b.toml"))
        );
        assert_eq!(discover_config_path(None, None, &local), Some(local.clone()));
        assert_eq!(discover_config_path(None, None, Path::new(&missing)), None);
    }
}
