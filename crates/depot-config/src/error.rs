use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("TOML serialization error: {0}")]
    #[diagnostic(
        code(depot_config::toml_serialize),
        help("Check your configuration structure for invalid values")
    )]
    TomlSerError(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    #[diagnostic(
        code(depot_config::toml_deserialize),
        help("Check your depot.toml syntax and structure")
    )]
    TomlDeError(#[from] toml::de::Error),

    #[error("Configuration file already exists: {0}")]
    #[diagnostic(
        code(depot_config::already_exists),
        help("Remove the existing config file or use a different location")
    )]
    ConfigAlreadyExists(String),

    #[error("Duplicate uplink name: {0}")]
    #[diagnostic(
        code(depot_config::duplicate_uplink),
        help("Each uplink must have a unique name")
    )]
    DuplicateUplinkName(String),

    #[error("Uplink name cannot be empty")]
    #[diagnostic(code(depot_config::empty_uplink_name))]
    EmptyUplinkName,

    #[error("Package rule `{pattern}` proxies to unknown uplink `{uplink}`")]
    #[diagnostic(
        code(depot_config::unknown_uplink),
        help("Declare the uplink under [[uplinks]] or remove it from the rule")
    )]
    UnknownUplink { pattern: String, uplink: String },

    #[error("Invalid URL for uplink `{name}`: {url}")]
    #[diagnostic(
        code(depot_config::invalid_uplink_url),
        help("Uplink URLs must be absolute http(s) URLs")
    )]
    InvalidUplinkUrl { name: String, url: String },

    #[error("Invalid duration for `{field}`: {value}")]
    #[diagnostic(
        code(depot_config::invalid_duration),
        help("Use values like `30s`, `2m`, `1h 30m` or a number of seconds")
    )]
    InvalidDuration { field: String, value: String },

    #[error("IO error while {action}: {source}")]
    #[diagnostic(code(depot_config::io))]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            ConfigError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
