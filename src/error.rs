//! Application error types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Application error carrying a kind and a small key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host not found
    HostNotFound,
    /// Instance not found
    InstanceNotFound,
    /// No pending prompt under the given index
    OptionNotPending,
    /// Version reference not installed
    VersionNotFound,
    /// A bounded wait exceeded its budget
    Timeout,
    /// A subprocess exited with a non-zero status
    Failure,
    /// Contract violation by the caller
    IllegalState,
    /// Cooperative cancellation
    Interrupted,
    /// State missing from the state table
    UnknownState,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Process could not be spawned or inspected
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::HostNotFound => 1001,
            Self::InstanceNotFound => 1002,
            Self::OptionNotPending => 1004,
            Self::VersionNotFound => 1005,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Timeout => 3001,
            Self::Failure => 3002,
            Self::Process => 3003,
            Self::Interrupted => 3004,
            Self::IllegalState => 4001,
            Self::UnknownState => 4002,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn host_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::HostNotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn option_not_pending(index: u32) -> Self {
        Self::new(
            ErrorKind::OptionNotPending,
            HashMap::from([("index".to_string(), index.to_string())]),
        )
    }

    pub fn version_not_found(version: &str) -> Self {
        Self::new(
            ErrorKind::VersionNotFound,
            HashMap::from([("version".to_string(), version.to_string())]),
        )
    }

    /// A tracked process was still alive after `timeout`.
    pub fn timeout(pid: Option<u32>, timeout: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            HashMap::from([
                ("pid".to_string(), format_pid(pid)),
                ("timeout_ms".to_string(), timeout.as_millis().to_string()),
            ]),
        )
    }

    /// A tracked process exited with a non-zero status.
    pub fn failure(pid: Option<u32>, exit_code: i32) -> Self {
        Self::new(
            ErrorKind::Failure,
            HashMap::from([
                ("pid".to_string(), format_pid(pid)),
                ("exit_code".to_string(), exit_code.to_string()),
            ]),
        )
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::IllegalState, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, HashMap::new())
    }

    pub fn unknown_state(state: &str) -> Self {
        Self::new(
            ErrorKind::UnknownState,
            HashMap::from([("state".to_string(), state.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == ErrorKind::Interrupted
    }

    /// Look up a payload entry, e.g. `exit_code` on a failure.
    pub fn payload_value(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

fn format_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
