// src/error.rs
//
// Typed errors for the library. The binary wraps these in anyhow.

/// Startup configuration rejected by `Config::validate`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no gates configured")]
    NoGates,

    #[error("duplicate gate name: {0}")]
    DuplicateGate(String),

    #[error("gate {name}: {reason}")]
    DegenerateGate { name: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Local durable queue failures.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Last-occupancy record failures.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One failed delivery attempt. Always transient from the worker's view.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{status} {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A frame line that could not be decoded at all.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("malformed frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame timestamp is not finite")]
    BadTimestamp,

    #[error("line of {len} bytes is not valid UTF-8")]
    NotUtf8 { len: usize },
}
