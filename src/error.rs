use crate::configuration::ConfigurationKey;
use crate::fetch::FetchKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmConnectError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authorization error: {message}")]
    Authorization { message: String },

    #[error("Connection error on {device_id} during {operation}{}: {message}", format_key_suffix(key))]
    Connection {
        device_id: String,
        operation: String,
        key: Option<ConfigurationKey>,
        message: String,
    },

    #[error("Not authorized to fetch {resource} for shot {shot_id}")]
    NotAuthorized { shot_id: String, resource: FetchKind },

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("System error: {message}")]
    System { message: String },
}

fn format_key_suffix(key: &Option<ConfigurationKey>) -> String {
    match key {
        Some(key) => format!(" ({})", key),
        None => String::new(),
    }
}

impl LmConnectError {
    pub fn authorization<S: Into<String>>(message: S) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    pub fn connection<D: Into<String>, O: Into<String>, M: Into<String>>(
        device_id: D,
        operation: O,
        message: M,
    ) -> Self {
        Self::Connection {
            device_id: device_id.into(),
            operation: operation.into(),
            key: None,
            message: message.into(),
        }
    }

    pub fn not_authorized<S: Into<String>>(shot_id: S, resource: FetchKind) -> Self {
        Self::NotAuthorized {
            shot_id: shot_id.into(),
            resource,
        }
    }

    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Attach the configuration key that was being applied when a connection error occurred
    pub fn with_key(self, key: ConfigurationKey) -> Self {
        match self {
            Self::Connection {
                device_id,
                operation,
                message,
                ..
            } => Self::Connection {
                device_id,
                operation,
                key: Some(key),
                message,
            },
            other => other,
        }
    }

    /// Configuration key attached to a connection error, if any
    pub fn configuration_key(&self) -> Option<ConfigurationKey> {
        match self {
            Self::Connection { key, .. } => *key,
            _ => None,
        }
    }

    /// Whether the run can continue past this error.
    ///
    /// Authorization failures end the run. Connection failures end only the
    /// current session and auxiliary fetch failures end only that fetch.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Authorization { .. } | Self::Config(_) => false,
            Self::Connection { .. } | Self::NotAuthorized { .. } => true,
            Self::Io(_) | Self::EventBus(_) => true,
            Self::Session { .. } | Self::System { .. } => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventBusError {
    #[error("No subscribers for {category} events")]
    NoSubscribers { category: &'static str },

    #[error("Event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, LmConnectError>;
