use crate::error::{self, ErrorKind, TapError};
use crate::node::Node;
use crate::request::{self, Reply, RequestFrame, RequestKind};
use crate::run::chan;
use crate::run::prelude::*;
use crate::run::rw::{self, datagram, Connection};
use crate::run::task;
use crate::{log, warn};
use color_eyre::eyre::{Report, WrapErr};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;

/// The first frame a slave sends after connecting.
#[derive(Debug, Deserialize)]
struct Register {
    name: String,
}

struct ClientEntry {
    addr: SocketAddr,
    tx: ProxySender,
    /// registration generation; a re-registered name must not be removed
    /// by the previous session's dying proxy worker
    session: u64,
}

/// The master's registry of connected slaves. Inserted by the accept loop,
/// removed by a proxy worker on connection loss, read by the IPC service;
/// all lookups and removals are atomic.
#[derive(Clone, Default)]
pub struct ClientPool {
    clients: Arc<DashMap<String, ClientEntry>>,
    sessions: Arc<AtomicU64>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slave, replacing any previous entry with the same name
    /// (last writer wins). Returns this registration's session id.
    fn register(
        &self,
        name: String,
        addr: SocketAddr,
        tx: ProxySender,
    ) -> u64 {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(name, ClientEntry { addr, tx, session });
        session
    }

    /// Removes the entry for `name`, but only if it still belongs to the
    /// given session.
    fn remove_session(&self, name: &str, session: u64) {
        self.clients
            .remove_if(name, |_, entry| entry.session == session);
    }

    /// A clone of the proxy channel for `name`, or client-not-found. The
    /// clone keeps pool lookups from holding the map across awaits.
    fn proxy_sender(&self, name: &str) -> Result<ProxySender, TapError> {
        self.clients
            .get(name)
            .map(|entry| entry.tx.clone())
            .ok_or_else(|| {
                TapError::new(
                    ErrorKind::ClientNotFound,
                    format!("Client \"{}\" not exists.", name),
                )
            })
    }

    /// The `list_all` reply: every connected slave and its address.
    pub fn list_all(&self) -> Reply {
        let clients: serde_json::Map<String, Value> = self
            .clients
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    Value::String(entry.value().addr.to_string()),
                )
            })
            .collect();
        Value::Object(clients)
    }
}

/// Accept loop: reads the registration frame off every new connection and
/// spawns that slave's proxy worker.
pub async fn accept_task(
    listener: TcpListener,
    pool: ClientPool,
    node: Arc<Node>,
) {
    log!("server is now on");
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("[master] error accepting connection: {:?}", e);
                continue;
            }
        };
        let mut conn = Connection::from(stream);
        match conn.recv::<Register>().await {
            Ok(Some(register)) => {
                log!("client \"{}\" connected", register.name);
                let (mut tx, rx) = chan::channel(CHANNEL_BUFFER_SIZE);
                tx.set_name(format!("to_proxy_{}", register.name));
                let session =
                    pool.register(register.name.clone(), addr, tx);
                task::spawn(proxy_worker(
                    register.name,
                    session,
                    conn,
                    rx,
                    pool.clone(),
                    node.clone(),
                ));
            }
            _ => warn!("invalid connection detected: {}", addr),
        }
    }
}

enum ProxyFailure {
    /// the stream to the slave broke; fatal to the session
    ConnectionLoss,
    /// anything else; reply with an envelope and keep serving
    Other(TapError),
}

/// Per-slave proxy worker: the sole reader and writer of this slave's
/// stream. Serves requests from its channel one at a time until the
/// channel closes (re-registration) or the stream breaks.
async fn proxy_worker(
    name: String,
    session: u64,
    mut conn: Connection,
    mut rx: ProxyReceiver,
    pool: ClientPool,
    node: Arc<Node>,
) {
    while let Some((kind, raw_args, reply_tx)) = rx.recv().await {
        match proxy_request(&node, &mut conn, &name, kind, &raw_args).await
        {
            Ok(reply) => {
                let _ = reply_tx.send(reply);
            }
            Err(ProxyFailure::ConnectionLoss) => {
                let e = TapError::new(
                    ErrorKind::ClientConnectionLoss,
                    format!("{} disconnected.", name),
                );
                let _ = reply_tx.send(error::envelope("Proxy", &e));
                pool.remove_session(&name, session);
                warn!("[proxy] {} disconnected, worker exiting", name);
                return;
            }
            Err(ProxyFailure::Other(e)) => {
                let _ = reply_tx.send(error::envelope("Proxy", &e));
            }
        }
    }
}

/// The `proxy` role: forward the raw request frame and read the reply.
/// `sync_code` extends the exchange with the push sessions in between.
async fn proxy_request(
    node: &Node,
    conn: &mut Connection,
    name: &str,
    kind: RequestKind,
    raw_args: &str,
) -> Result<Reply, ProxyFailure> {
    match kind {
        RequestKind::SyncCode => {
            proxy_sync_code(node, conn, name, raw_args).await
        }
        _ => proxy_round_trip(conn, raw_args).await,
    }
}

async fn proxy_round_trip(
    conn: &mut Connection,
    raw_args: &str,
) -> Result<Reply, ProxyFailure> {
    conn.send_bytes(raw_args.as_bytes().to_vec())
        .await
        .map_err(|_| ProxyFailure::ConnectionLoss)?;
    proxy_read_reply(conn).await
}

async fn proxy_read_reply(
    conn: &mut Connection,
) -> Result<Reply, ProxyFailure> {
    let bytes = conn
        .recv_bytes()
        .await
        .map_err(|_| ProxyFailure::ConnectionLoss)?
        .ok_or(ProxyFailure::ConnectionLoss)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ProxyFailure::Other(TapError::new(
            ErrorKind::Unknown,
            format!("undecodable reply: {}", e),
        ))
    })
}

/// `sync_code` over the proxy: request, slave ack, one push session per
/// glob of the master's own codebase, then the slave's closing reply.
async fn proxy_sync_code(
    node: &Node,
    conn: &mut Connection,
    name: &str,
    raw_args: &str,
) -> Result<Reply, ProxyFailure> {
    let ack = proxy_round_trip(conn, raw_args).await?;
    if ack.get("err").is_some() {
        return Ok(ack);
    }

    let frame: RequestFrame =
        serde_json::from_str(raw_args).map_err(|e| {
            ProxyFailure::Other(TapError::new(
                ErrorKind::InvalidRequest,
                format!("Malformed sync_code arguments: {}.", e),
            ))
        })?;
    let basename = frame
        .args
        .get("basename")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProxyFailure::Other(TapError::new(
                ErrorKind::InvalidRequest,
                "Missing \"basename\" argument.",
            ))
        })?;
    let globs = node
        .codebase_globs(basename)
        .map_err(ProxyFailure::Other)?;

    for glob in &globs {
        rw::send_files(conn, name, node.root(), glob)
            .await
            .map_err(|e| {
                ProxyFailure::Other(TapError::new(
                    ErrorKind::Unknown,
                    format!("{:#}", e),
                ))
            })?;
    }
    // the slave's request loop closes the exchange with its own reply
    proxy_read_reply(conn).await
}

/// IPC datagram service: one request per datagram, replies framed and
/// fragmented back to the caller's return address.
pub async fn ipc_task(
    sock: UdpSocket,
    node: Arc<Node>,
    pool: ClientPool,
) -> Result<(), Report> {
    log!("IPC daemon is now on");
    let mut buf = vec![0u8; datagram::BUFFER_SIZE];
    loop {
        let (read, caller) = sock
            .recv_from(&mut buf)
            .await
            .wrap_err("receiving IPC datagram")?;
        let line = String::from_utf8_lossy(&buf[..read]).into_owned();
        let reply = match serve_request(&node, &pool, &line).await {
            Ok(reply) => reply,
            Err(e) => error::envelope("Server", &e),
        };
        let bytes =
            serde_json::to_vec(&reply).wrap_err("serializing IPC reply")?;
        if let Err(e) = datagram::frag_send(&sock, &bytes, caller).await {
            warn!("[master] error replying to {}: {:?}", caller, e);
        }
    }
}

/// The `server` role: route one IPC request line. Requests naming the
/// empty string or the master itself are served locally; everything else
/// is handed to the named slave's proxy worker.
pub async fn serve_request(
    node: &Node,
    pool: &ClientPool,
    line: &str,
) -> Result<Reply, TapError> {
    let (request, tail) = request::split_ipc_line(line)?;
    let kind = RequestKind::from_name(request)?;
    match kind {
        RequestKind::ListAll => Ok(pool.list_all()),
        RequestKind::BatchExecute => batch_execute(node, pool, tail).await,
        _ => {
            let (name, raw_args) = request::split_envelope(tail)?;
            if name.is_empty() || name == node.name() {
                let frame = parse_frame(raw_args)?;
                node.handle_client(kind, frame.args, None).await
            } else {
                forward(pool, name, kind, raw_args).await
            }
        }
    }
}

fn parse_frame(raw_args: &str) -> Result<RequestFrame, TapError> {
    serde_json::from_str(raw_args).map_err(|e| {
        TapError::new(
            ErrorKind::InvalidRequest,
            format!("Malformed request frame: {}.", e),
        )
    })
}

/// Hands one request to a slave's proxy worker and waits for the reply.
/// The reply may itself be an `err` envelope; only pool misses fail here.
async fn forward(
    pool: &ClientPool,
    name: &str,
    kind: RequestKind,
    raw_args: &str,
) -> Result<Reply, TapError> {
    let tx = pool.proxy_sender(name)?;
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send((kind, raw_args.to_string(), reply_tx))
        .await
        .map_err(|_| {
            TapError::new(
                ErrorKind::ClientNotFound,
                format!("Client \"{}\" not exists.", name),
            )
        })?;
    reply_rx.await.map_err(|_| {
        TapError::new(
            ErrorKind::ClientConnectionLoss,
            format!("{} disconnected.", name),
        )
    })
}

enum BatchSlot {
    Done(Reply),
    Pending(ReplyReceiver),
}

/// `batch_execute` on the master: first start every execute (local ones
/// inline, remote ones queued on their proxies), then collect the replies
/// in input order. Every target is running before any reply is awaited.
async fn batch_execute(
    node: &Node,
    pool: &ClientPool,
    tail: &str,
) -> Result<Reply, TapError> {
    let items = request::split_batch_tail(tail)?;

    let mut slots = Vec::with_capacity(items.len());
    for (target, raw_args) in &items {
        if target.is_empty() || target == node.name() {
            let frame = parse_frame(raw_args)?;
            let reply = node
                .handle_client(RequestKind::Execute, frame.args, None)
                .await?;
            slots.push(BatchSlot::Done(reply));
        } else {
            match pool.proxy_sender(target) {
                Ok(tx) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    match tx
                        .send((
                            RequestKind::Execute,
                            raw_args.clone(),
                            reply_tx,
                        ))
                        .await
                    {
                        Ok(()) => slots.push(BatchSlot::Pending(reply_rx)),
                        Err(_) => slots.push(BatchSlot::Done(
                            missing_target_slot(target),
                        )),
                    }
                }
                Err(_) => {
                    slots.push(BatchSlot::Done(missing_target_slot(
                        target,
                    )));
                }
            }
        }
    }

    let mut tid_list = Vec::with_capacity(slots.len());
    let mut err_list = Vec::with_capacity(slots.len());
    for slot in slots {
        let reply = match slot {
            BatchSlot::Done(reply) => reply,
            BatchSlot::Pending(reply_rx) => {
                reply_rx.await.unwrap_or_else(|_| {
                    let e = TapError::new(
                        ErrorKind::ClientConnectionLoss,
                        "proxy worker dropped the reply.",
                    );
                    error::envelope("Proxy", &e)
                })
            }
        };
        tid_list.push(reply.get("tid").cloned().unwrap_or(Value::Null));
        err_list.push(reply.get("err").cloned().unwrap_or(Value::Null));
    }
    Ok(json!({"tid_list": tid_list, "err_list": err_list}))
}

fn missing_target_slot(target: &str) -> Reply {
    let e = TapError::new(
        ErrorKind::ClientNotFound,
        format!("Client \"{}\" not exists.", target),
    );
    let mut slot = error::envelope("Server", &e);
    slot["tid"] = Value::Null;
    slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn master_node() -> Node {
        let manifest: Manifest = serde_json::from_value(json!({
            "name": "",
            "functions": {
                "f": {
                    "description": "local echo",
                    "commands": ["echo local"],
                    "outputs": {
                        "o": {"cmd": "echo $output_0", "format": ".*"}
                    }
                }
            }
        }))
        .unwrap();
        Node::new(
            String::new(),
            manifest,
            "./manifest.json",
            String::new(),
        )
    }

    #[tokio::test]
    async fn list_all_on_empty_pool() {
        let node = master_node();
        let pool = ClientPool::new();
        let line = request::ipc_line(RequestKind::ListAll, "", &json!({}));
        let reply = serve_request(&node, &pool, &line).await.unwrap();
        assert_eq!(reply, json!({}));
    }

    #[tokio::test]
    async fn unknown_target_is_client_not_found() {
        let node = master_node();
        let pool = ClientPool::new();
        let line = request::ipc_line(
            RequestKind::Describe,
            "nope",
            &json!({}),
        );
        let err = serve_request(&node, &pool, &line).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotFound);
    }

    #[tokio::test]
    async fn empty_target_self_handles() {
        let node = master_node();
        let pool = ClientPool::new();
        let line =
            request::ipc_line(RequestKind::Describe, "", &json!({}));
        let reply = serve_request(&node, &pool, &line).await.unwrap();
        assert_eq!(reply, json!({"f": "local echo"}));
    }

    #[tokio::test]
    async fn unknown_request_is_invalid() {
        let node = master_node();
        let pool = ClientPool::new();
        let err = serve_request(&node, &pool, "frobnicate x@{}")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn batch_with_missing_target_keeps_slot_order() {
        let node = master_node();
        let pool = ClientPool::new();
        let inner = json!({
            "request": "execute",
            "args": {"function": "f", "parameters": {}, "timeout": -1.0}
        })
        .to_string();
        let line = request::ipc_batch_line(&[
            (String::new(), inner.clone()),
            ("ghost".to_string(), inner),
        ]);
        let reply = serve_request(&node, &pool, &line).await.unwrap();

        let tid_list = reply["tid_list"].as_array().unwrap();
        let err_list = reply["err_list"].as_array().unwrap();
        assert_eq!(tid_list.len(), 2);
        assert_eq!(err_list.len(), 2);
        // slot 0 ran locally, slot 1 failed to resolve
        assert!(tid_list[0].is_string());
        assert!(err_list[0].is_null());
        assert!(tid_list[1].is_null());
        assert_eq!(
            err_list[1][0].as_str().unwrap(),
            "ClientNotFoundException"
        );
    }

    #[tokio::test]
    async fn sync_code_to_master_is_invalid() {
        let node = master_node();
        let pool = ClientPool::new();
        let line = request::ipc_line(
            RequestKind::SyncCode,
            "",
            &json!({"basename": "*"}),
        );
        let err = serve_request(&node, &pool, &line).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
