// This module contains the master daemon: accept loop, client pool, proxy
// workers and the IPC datagram service.
pub mod master;

// This module contains the slave daemon and master auto-detection.
pub mod slave;

use super::rw::Connection;
use color_eyre::eyre::{Report, WrapErr};
use std::future::Future;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

/// Spawns a new task.
pub fn spawn<F>(task: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(task)
}

/// Starts a stream listener.
pub async fn listen<A>(addr: A) -> Result<TcpListener, Report>
where
    A: ToSocketAddrs,
{
    TcpListener::bind(addr)
        .await
        .wrap_err("binding stream listener")
}

/// Dials a stream connection.
pub async fn connect<A>(addr: A) -> Result<Connection, Report>
where
    A: ToSocketAddrs,
{
    Connection::connect(addr).await
}
