/// The runtime wires four task populations together:
///
/// 1. The master's accept loop reads a `{name}` registration frame off
/// every new slave connection and registers the slave in the client pool,
/// last writer wins. Each registration spawns one proxy worker.
///
/// 2. A proxy worker is the sole gatekeeper of its slave's stream: it
/// serves `(request, args, reply-slot)` triples from the pool entry's
/// channel one at a time, so traffic on a single stream is strictly
/// serialized. A broken stream ends the worker and removes the pool
/// entry; every other failure is answered with an error envelope and the
/// worker keeps serving.
///
/// 3. The IPC datagram service turns operator request lines into
/// dispatches: requests naming the empty string or the master are served
/// against the master's own node state, everything else is handed to the
/// named slave's proxy. `batch_execute` starts every target before it
/// awaits any reply, which is the whole point of batching.
///
/// 4. The slave runs one dispatcher loop: request frame in, reply frame
/// out, in arrival order, with one short-lived worker task per running
/// manifest function.
// This module contains the common channel wrappers.
pub mod chan;

// This module contains the runner type aliases.
pub mod prelude;

// This module contains the framed connection, the file-push sub-protocol
// and the IPC datagram fragmentation.
pub mod rw;

// This module contains the master and slave daemons.
pub mod task;

use crate::node::Node;
use color_eyre::eyre::{Report, WrapErr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

/// Runs the master daemon: the stream listener for slave uplinks on
/// `port` and the operator-facing datagram endpoint on `ipc_port`.
pub async fn master(
    port: u16,
    ipc_port: u16,
    node: Node,
) -> Result<(), Report> {
    // create semaphore for callers that don't care about the bound
    // notification
    let semaphore = Arc::new(Semaphore::new(0));
    master_with_notify(port, ipc_port, node, semaphore).await
}

async fn master_with_notify(
    port: u16,
    ipc_port: u16,
    node: Node,
    bound: Arc<Semaphore>,
) -> Result<(), Report> {
    let node = Arc::new(node);
    let pool = task::master::ClientPool::new();

    let listener = task::listen(("0.0.0.0", port)).await?;
    let sock = UdpSocket::bind(("0.0.0.0", ipc_port))
        .await
        .wrap_err("binding IPC datagram socket")?;

    task::spawn(task::master::accept_task(
        listener,
        pool.clone(),
        node.clone(),
    ));

    // notify parent that both sockets are bound
    bound.add_permits(1);

    task::master::ipc_task(sock, node, pool).await
}

/// Runs the slave daemon: dial the master (or auto-detect it when `addr`
/// is empty), register, serve requests until the stream closes.
pub async fn slave(
    addr: &str,
    port: u16,
    node: Node,
) -> Result<(), Report> {
    task::slave::slave(addr, port, node).await
}
