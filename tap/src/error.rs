use serde_json::{json, Value};
use std::fmt;

/// Wire-visible failure kinds. The set is closed: reply envelopes carry one
/// of these names, and deserialization never constructs anything outside it;
/// unrecognized names degrade to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// a user command exited non-zero; the message carries its stderr
    StdErr,
    /// a user command did not terminate within the allotted wall clock
    Timeout,
    /// a `fetch` was issued for a task whose worker has not stored results
    NoResponse,
    /// no handler for the named request, or its argument shape was wrong
    InvalidRequest,
    /// the slave could not find a master on any host in its subnet
    AutoDetectFailure,
    /// the master's proxy worker detected a broken stream to a slave
    ClientConnectionLoss,
    /// IPC referred to a name not present in the master's client pool
    ClientNotFound,
    /// `sync_code` referred to a basename not in `codebase`
    CodebaseNonExist,
    /// catch-all for wire names outside the taxonomy
    Unknown,
}

impl ErrorKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::StdErr => "StdErrException",
            Self::Timeout => "TimeoutException",
            Self::NoResponse => "NoResponseException",
            Self::InvalidRequest => "InvalidRequestException",
            Self::AutoDetectFailure => "AutoDetectFailureException",
            Self::ClientConnectionLoss => "ClientConnectionLossException",
            Self::ClientNotFound => "ClientNotFoundException",
            Self::CodebaseNonExist => "CodebaseNonExistException",
            Self::Unknown => "Exception",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "StdErrException" => Self::StdErr,
            "TimeoutException" => Self::Timeout,
            "NoResponseException" => Self::NoResponse,
            "InvalidRequestException" => Self::InvalidRequest,
            "AutoDetectFailureException" => Self::AutoDetectFailure,
            "ClientConnectionLossException" => Self::ClientConnectionLoss,
            "ClientNotFoundException" => Self::ClientNotFound,
            "CodebaseNonExistException" => Self::CodebaseNonExist,
            _ => Self::Unknown,
        }
    }
}

/// An error as it travels between roles: a kind from the closed taxonomy
/// plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapError {
    kind: ErrorKind,
    message: String,
}

impl TapError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.wire_name(), self.message)
    }
}

impl std::error::Error for TapError {}

/// Builds the reply-side `err` envelope: `{"err": [kind_name, message]}`,
/// with the message prefixed by the role that failed.
pub fn envelope(role: &str, e: &TapError) -> Value {
    json!({
        "err": [e.kind.wire_name(), format!("[[{}]]: {}", role, e.message)]
    })
}

/// Inspects a reply for an `err` member and reconstructs the error through
/// the closed kind mapping. Success replies carry no `err` member at all.
pub fn from_reply(reply: &Value) -> Option<TapError> {
    let err = reply.get("err")?;
    untangle(err)
}

/// Reconstructs an error from a raw `[kind_name, message]` envelope value.
pub fn untangle(err: &Value) -> Option<TapError> {
    let parts = err.as_array()?;
    let kind = ErrorKind::from_wire_name(parts.first()?.as_str()?);
    let message = parts
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(TapError::new(kind, message))
}
