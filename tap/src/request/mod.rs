use crate::error::{ErrorKind, TapError};
use crate::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A reply payload: either the result object or an `err` envelope.
pub type Reply = Value;

/// The request catalogue. Every request kind routes through up to four
/// roles (console, server, proxy, client); the dispatch tables live with
/// the role owners (`console::Connector`, `run::task::master`,
/// `run::task::slave` / `node::Node`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    ListAll,
    Describe,
    Info,
    Reload,
    Warmup,
    Execute,
    Fetch,
    SyncCode,
    BatchExecute,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ListAll => "list_all",
            Self::Describe => "describe",
            Self::Info => "info",
            Self::Reload => "reload",
            Self::Warmup => "warmup",
            Self::Execute => "execute",
            Self::Fetch => "fetch",
            Self::SyncCode => "sync_code",
            Self::BatchExecute => "batch_execute",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, TapError> {
        let kind = match name {
            "list_all" => Self::ListAll,
            "describe" => Self::Describe,
            "info" => Self::Info,
            "reload" => Self::Reload,
            "warmup" => Self::Warmup,
            "execute" => Self::Execute,
            "fetch" => Self::Fetch,
            "sync_code" => Self::SyncCode,
            "batch_execute" => Self::BatchExecute,
            _ => {
                return Err(TapError::new(
                    ErrorKind::InvalidRequest,
                    format!("Request \"{}\" is invalid.", name),
                ))
            }
        };
        Ok(kind)
    }
}

/// The control frame exchanged on the master⇌slave stream:
/// `{"request": <name>, "args": <object>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request: String,
    pub args: Value,
}

impl RequestFrame {
    pub fn new(kind: RequestKind, args: Value) -> Self {
        Self {
            request: kind.name().to_string(),
            args,
        }
    }
}

/// Arguments of the `execute` request. A negative timeout selects the
/// 999 s default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteArgs {
    pub function: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    -1.0
}

/// Formats the IPC request line for a normal request:
/// `<request> <client>@{"request":<name>,"args":<object>}`.
pub fn ipc_line(kind: RequestKind, client: &str, args: &Value) -> String {
    let frame = json!({"request": kind.name(), "args": args});
    format!("{} {}@{}", kind.name(), client, frame)
}

/// Formats the IPC request line for a batch:
/// `batch_execute <t1>@<a1>##<t2>@<a2>…` where each `<ai>` is a serialized
/// inner execute frame.
pub fn ipc_batch_line(tasks: &[(String, String)]) -> String {
    let tail: Vec<String> = tasks
        .iter()
        .map(|(target, args)| format!("{}@{}", target, args))
        .collect();
    format!(
        "{} {}",
        RequestKind::BatchExecute.name(),
        tail.join("##")
    )
}

/// Splits an IPC request line into `(request_name, tail)` on the first
/// whitespace run.
pub fn split_ipc_line(line: &str) -> Result<(&str, &str), TapError> {
    let mut parts = line.splitn(2, char::is_whitespace);
    match (parts.next(), parts.next()) {
        (Some(request), Some(tail)) if !request.is_empty() => {
            Ok((request, tail))
        }
        _ => Err(TapError::new(
            ErrorKind::InvalidRequest,
            format!("Malformed IPC request {:?}.", line),
        )),
    }
}

/// Splits a `name@payload` envelope once on the first `@`.
pub fn split_envelope(tail: &str) -> Result<(&str, &str), TapError> {
    tail.split_once('@').ok_or_else(|| {
        TapError::new(
            ErrorKind::InvalidRequest,
            format!("Malformed request envelope {:?}.", tail),
        )
    })
}

/// Splits a batch tail `t1@a1##t2@a2…` into `(target, args)` pairs.
pub fn split_batch_tail(
    tail: &str,
) -> Result<Vec<(String, String)>, TapError> {
    tail.split("##")
        .map(|item| {
            split_envelope(item)
                .map(|(target, args)| (target.to_string(), args.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_name_round_trip() {
        let kinds = [
            RequestKind::ListAll,
            RequestKind::Describe,
            RequestKind::Info,
            RequestKind::Reload,
            RequestKind::Warmup,
            RequestKind::Execute,
            RequestKind::Fetch,
            RequestKind::SyncCode,
            RequestKind::BatchExecute,
        ];
        for kind in kinds {
            assert_eq!(RequestKind::from_name(kind.name()).unwrap(), kind);
        }
        let err = RequestKind::from_name("self_destruct").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn ipc_line_shape() {
        let line =
            ipc_line(RequestKind::Info, "test", &json!({"function": "f"}));
        let (request, tail) = split_ipc_line(&line).unwrap();
        assert_eq!(request, "info");
        let (name, args) = split_envelope(tail).unwrap();
        assert_eq!(name, "test");
        let frame: RequestFrame = serde_json::from_str(args).unwrap();
        assert_eq!(frame.request, "info");
        assert_eq!(frame.args, json!({"function": "f"}));
    }

    #[test]
    fn empty_client_name_addresses_master() {
        let line = ipc_line(RequestKind::Describe, "", &json!({}));
        let (_, tail) = split_ipc_line(&line).unwrap();
        let (name, _) = split_envelope(tail).unwrap();
        assert_eq!(name, "");
    }

    #[test]
    fn batch_tail_round_trip() {
        let tasks = vec![
            ("".to_string(), json!({"request": "execute"}).to_string()),
            ("test".to_string(), json!({"request": "execute"}).to_string()),
        ];
        let line = ipc_batch_line(&tasks);
        let (request, tail) = split_ipc_line(&line).unwrap();
        assert_eq!(request, "batch_execute");
        assert_eq!(split_batch_tail(tail).unwrap(), tasks);
    }

    #[test]
    fn execute_args_defaults() {
        let args: ExecuteArgs =
            serde_json::from_value(json!({"function": "f"})).unwrap();
        assert_eq!(args.function, "f");
        assert!(args.parameters.is_empty());
        assert_eq!(args.timeout, -1.0);
    }

    #[test]
    fn malformed_lines_are_invalid_requests() {
        assert!(split_ipc_line("list_all").is_err());
        assert!(split_envelope("no-at-sign").is_err());
        assert!(split_batch_tail("a@x##no-at-sign").is_err());
    }
}
