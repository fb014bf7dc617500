use std::path::PathBuf;

use thiserror::Error;

/// Malformed rule, sanitization, or mock configuration. Raised eagerly while
/// configuration is resolved or a rule selection runs; never ignored.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid configuration for `{option}`: {reason}")]
    Invalid { option: String, reason: String },
    #[error("configuration file was not found: {path}")]
    MissingFile { path: PathBuf },
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl ConfigurationError {
    pub fn invalid(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Name of the option at fault, when the error concerns a single option.
    pub fn option(&self) -> Option<&str> {
        match self {
            Self::Invalid { option, .. } => Some(option.as_str()),
            _ => None,
        }
    }
}
