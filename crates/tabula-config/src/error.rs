use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or checking the host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A layer is not valid TOML, or the merged tree does not fit [`Config`](crate::Config).
    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        /// Offending file, or a placeholder for the defaults and merged tree.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// A file is larger than the loader accepts.
    #[error("{} is {len} bytes, over the {limit} byte limit", path.display())]
    TooLarge {
        /// Offending file.
        path: PathBuf,
        /// Actual size.
        len: u64,
        /// Accepted size.
        limit: u64,
    },

    /// A value is out of range.
    #[error("invalid value for {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The user layer was requested but no home directory is known.
    #[error("no home directory for the user configuration layer")]
    NoHomeDir,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
