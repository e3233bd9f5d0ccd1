// This module contains the definition of `BatchExecutor`.
pub mod batch;

// Re-exports.
pub use batch::BatchExecutor;

use crate::error;
use crate::id::Tid;
use crate::manifest::FunctionConfig;
use crate::request::{self, Reply, RequestKind};
use crate::run::rw::datagram;
use crate::{HashMap, IPC_PORT};
use color_eyre::eyre::{eyre, Report, WrapErr};
use serde_json::{json, Value};
use tokio::net::UdpSocket;

/// The operator-facing connector: speaks IPC datagrams to the master and
/// addresses one client by name (the empty name addresses the master
/// itself).
pub struct Connector {
    client: String,
    sock: UdpSocket,
}

impl Connector {
    /// Connects to the master's IPC endpoint. An empty `addr` means
    /// localhost; a zero `port` selects the default IPC port.
    pub async fn connect(
        client: impl Into<String>,
        addr: &str,
        port: u16,
    ) -> Result<Self, Report> {
        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .wrap_err("binding console socket")?;
        let addr = if addr.is_empty() { "127.0.0.1" } else { addr };
        let port = if port == 0 { IPC_PORT } else { port };
        sock.connect((addr, port))
            .await
            .wrap_err("connecting console socket")?;
        Ok(Self {
            client: client.into(),
            sock,
        })
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// The `console` role: serialize to the master over IPC, read the
    /// fragmented reply, and re-raise any `err` envelope it carries.
    async fn request(
        &self,
        kind: RequestKind,
        args: Value,
        client: Option<&str>,
    ) -> Result<Reply, Report> {
        let client = client.unwrap_or(&self.client);
        let line = request::ipc_line(kind, client, &args);
        self.round_trip(line.as_bytes()).await
    }

    pub(crate) async fn round_trip(
        &self,
        line: &[u8],
    ) -> Result<Reply, Report> {
        self.sock
            .send(line)
            .await
            .wrap_err("sending IPC request")?;
        let reply = datagram::frag_recv(&self.sock).await?;
        let reply: Value = serde_json::from_slice(&reply)
            .wrap_err("deserializing IPC reply")?;
        if let Some(e) = error::from_reply(&reply) {
            return Err(Report::new(e));
        }
        Ok(reply)
    }

    /// Lists all online clients and their addresses.
    pub async fn list_all(&self) -> Result<HashMap<String, String>, Report> {
        let reply =
            self.request(RequestKind::ListAll, json!({}), None).await?;
        serde_json::from_value(reply).wrap_err("malformed list_all reply")
    }

    /// The available functions on the connected client.
    pub async fn describe(&self) -> Result<HashMap<String, String>, Report> {
        let reply =
            self.request(RequestKind::Describe, json!({}), None).await?;
        serde_json::from_value(reply).wrap_err("malformed describe reply")
    }

    /// The full manifest entry of one function.
    pub async fn info(
        &self,
        function: &str,
    ) -> Result<FunctionConfig, Report> {
        let reply = self
            .request(
                RequestKind::Info,
                json!({ "function": function }),
                None,
            )
            .await?;
        serde_json::from_value(reply).wrap_err("malformed info reply")
    }

    /// Asks the client to re-load its manifest from disk.
    pub async fn reload(&self) -> Result<Reply, Report> {
        self.request(RequestKind::Reload, json!({}), None).await
    }

    /// Pushes the master's codebase to the client.
    pub async fn sync_code(&self, basename: &str) -> Result<Reply, Report> {
        self.request(
            RequestKind::SyncCode,
            json!({ "basename": basename }),
            None,
        )
        .await
    }

    /// Starts the client's warmup commands; returns the task id.
    pub async fn warmup(&self) -> Result<Tid, Report> {
        let reply =
            self.request(RequestKind::Warmup, json!({}), None).await?;
        tid_of(&reply)
    }

    /// Executes a function with default parameters and no timeout bound;
    /// returns instantly with the task id.
    pub async fn execute(&self, function: &str) -> Result<Tid, Report> {
        self.execute_with(function, HashMap::new(), -1.0).await
    }

    /// Executes a function asynchronously; absent parameters fall back to
    /// the manifest defaults. Returns instantly with the task id.
    pub async fn execute_with(
        &self,
        function: &str,
        parameters: HashMap<String, Value>,
        timeout: f64,
    ) -> Result<Tid, Report> {
        let args = json!({
            "function": function,
            "parameters": parameters,
            "timeout": timeout
        });
        let reply =
            self.request(RequestKind::Execute, args, None).await?;
        tid_of(&reply)
    }

    /// Fetches the results of a previous execution by task id.
    pub async fn fetch(&self, tid: &Tid) -> Result<Reply, Report> {
        self.request(RequestKind::Fetch, json!({ "tid": tid }), None)
            .await
    }

    pub(crate) async fn fetch_from(
        &self,
        client: &str,
        tid: &Tid,
    ) -> Result<Reply, Report> {
        self.request(
            RequestKind::Fetch,
            json!({ "tid": tid }),
            Some(client),
        )
        .await
    }

    /// Starts a batch pipeline; chain `batch`/`wait`/`fetch` calls and
    /// finish with `apply`.
    pub fn batch(&self, client: &str, function: &str) -> BatchExecutor<'_> {
        BatchExecutor::new(self).batch(client, function)
    }

    /// Starts a batch pipeline from a list of `(client, function)` pairs.
    pub fn batch_all<'a>(
        &self,
        tasks: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> BatchExecutor<'_> {
        BatchExecutor::new(self).batch_all(tasks)
    }
}

fn tid_of(reply: &Reply) -> Result<Tid, Report> {
    reply
        .get("tid")
        .and_then(Value::as_str)
        .map(Tid::from)
        .ok_or_else(|| eyre!("reply carries no tid: {}", reply))
}
