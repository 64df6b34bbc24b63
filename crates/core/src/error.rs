use thiserror::Error;

/// Errors raised while loading or validating runner configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}
