//! Error types for the trigger engine

use thiserror::Error;

/// Result type for trigger engine operations
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Errors raised while loading configuration, resolving regions or opening outputs
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Reading the configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration text could not be deserialized
    #[error("Parse error: {0}")]
    Parse(String),

    /// A trigger definition is missing a field or has an out-of-range value
    #[error("Invalid trigger '{trigger}': {message}")]
    Config { trigger: String, message: String },

    /// A region could not be mapped onto the current frame
    #[error("Region of trigger '{trigger}' is invalid: {message}")]
    Region { trigger: String, message: String },

    /// A named output target could not be opened
    #[error("Output target '{target}' unavailable: {message}")]
    Target { target: String, message: String },

    /// Writing to an output connection failed
    #[error("Output error: {0}")]
    Output(String),
}

impl TriggerError {
    /// Create a configuration error for a trigger
    pub fn config(trigger: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            trigger: trigger.into(),
            message: message.into(),
        }
    }

    /// Create a region resolution error for a trigger
    pub fn region(trigger: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Region {
            trigger: trigger.into(),
            message: message.into(),
        }
    }

    /// Create a target resolution error
    pub fn target(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Target {
            target: target.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for TriggerError {
    fn from(e: toml::de::Error) -> Self {
        TriggerError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for TriggerError {
    fn from(e: serde_json::Error) -> Self {
        TriggerError::Parse(e.to_string())
    }
}
