use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const CONFIG_ENV_VAR: &str = "DRONEWIRE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "dronewire.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub process: ProcessConfig,
    pub transport: TransportConfig,
    pub imm: ImmConfig,
    pub rds: RdsConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessConfig {
    /// `imm` (ground-station backend) or `rds` (relay emulator).
    pub role: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            role: "imm".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// 0 waits for replies forever.
    pub reply_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_size_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            poll_interval_ms: 100,
            reply_timeout_ms: 0,
            write_timeout_ms: 5_000,
            max_frame_size_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImmConfig {
    pub gui_requests: String,
    pub gui_notifications: String,
    pub rds_commands: String,
    pub rds_info: String,
    pub rds_notifications: String,
    pub client_id: i64,
    pub drone_mode: String,
}

impl Default for ImmConfig {
    fn default() -> Self {
        Self {
            gui_requests: "0.0.0.0:4572".to_owned(),
            gui_notifications: "0.0.0.0:4570".to_owned(),
            rds_commands: "localhost:5570".to_owned(),
            rds_info: "localhost:5572".to_owned(),
            rds_notifications: "localhost:5571".to_owned(),
            client_id: 1,
            drone_mode: "auto".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RdsConfig {
    pub commands: String,
    pub info: String,
    pub notifications: String,
    pub drone_id: String,
    pub flying_time_ms: u64,
    /// Image announced by the emulator's demo record; empty disables seeding.
    pub seed_image_path: String,
}

impl Default for RdsConfig {
    fn default() -> Self {
        Self {
            commands: "0.0.0.0:5570".to_owned(),
            info: "0.0.0.0:5572".to_owned(),
            notifications: "0.0.0.0:5571".to_owned(),
            drone_id: "one".to_owned(),
            flying_time_ms: 4_000,
            seed_image_path: "images/testimage.jpg".to_owned(),
        }
    }
}

impl AppConfig {
    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        Self::from_value_with_args(root_value, args)
    }

    pub fn defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let root_value = Value::try_from(Self::default()).map_err(ConfigError::Serialize)?;
        Self::from_value_with_args(root_value, args)
    }

    /// Resolves the config file from `--config <path>` (first pair only),
    /// then `$DRONEWIRE_CONFIG`, then `./dronewire.toml`, falling back to
    /// built-in defaults. Remaining arguments are `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();

        let explicit_path = if args.first().map(String::as_str) == Some(CONFIG_PATH_ARG) {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: CONFIG_PATH_ARG.trim_start_matches("--").to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            None
        };

        let discovered = explicit_path
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.is_file().then_some(local)
            });

        match discovered {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None => Self::defaults_with_args(args),
        }
    }

    fn from_value_with_args(
        mut root_value: Value,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "transport.poll_interval_ms",
                reason: "must be at least 1",
            });
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "transport.connect_timeout_ms",
                reason: "must be at least 1",
            });
        }
        if self.transport.max_frame_size_bytes == 0
            || self.transport.max_frame_size_bytes > u64::from(u32::MAX)
        {
            return Err(ConfigError::InvalidSetting {
                key: "transport.max_frame_size_bytes",
                reason: "must fit a 4-byte frame header and be non-zero",
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
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

    let (final_key, sections) = parts.split_last().ok_or_else(unknown)?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
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
