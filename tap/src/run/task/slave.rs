use crate::error::{self, ErrorKind, TapError};
use crate::executor::shell_output;
use crate::node::Node;
use crate::request::{RequestFrame, RequestKind};
use crate::run::rw::Connection;
use crate::run::task;
use crate::{log, warn};
use color_eyre::eyre::{Report, WrapErr};
use regex::Regex;
use serde_json::json;
use std::net::Ipv4Addr;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Connect timeout for each probed host during auto-detection.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Slave entry point: connect (or auto-detect) the master, register under
/// the node's name, then serve request frames until the stream closes.
pub async fn slave(
    addr: &str,
    port: u16,
    node: Node,
) -> Result<(), Report> {
    let mut conn = if addr.is_empty() {
        auto_detect(port).await?
    } else {
        task::connect((addr, port)).await?
    };
    conn.send(&json!({"name": node.name()})).await?;
    log!("client \"{}\" is now on", node.name());
    serve(&node, conn).await
}

/// The slave's request loop: one frame in, one reply out, in arrival
/// order. Dispatcher failures become error envelopes; only a broken
/// stream ends the loop.
pub async fn serve(
    node: &Node,
    mut conn: Connection,
) -> Result<(), Report> {
    loop {
        let frame = match conn.recv::<RequestFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("[slave] master closed the stream");
                return Ok(());
            }
            Err(e) => {
                // undecodable frame: report it and keep serving
                let e = TapError::new(
                    ErrorKind::InvalidRequest,
                    format!("{:#}", e),
                );
                conn.send(&error::envelope("Client", &e))
                    .await
                    .wrap_err("replying to undecodable frame")?;
                continue;
            }
        };
        let reply = match RequestKind::from_name(&frame.request) {
            Ok(kind) => {
                match node
                    .handle_client(kind, frame.args, Some(&mut conn))
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => error::envelope("Client", &e),
                }
            }
            Err(e) => error::envelope("Client", &e),
        };
        conn.send(&reply).await.wrap_err("sending reply frame")?;
    }
}

/// Finds the master without an address: derive the default gateway
/// interface's network from `ip route` and `ip addr`, then try every host
/// with a short connect timeout; the first one that accepts is the master.
pub async fn auto_detect(port: u16) -> Result<Connection, Report> {
    let route = stdout_of("ip route | grep default").await?;
    let iface = parse_default_iface(&route).ok_or_else(|| {
        detect_failure(format!("no default route in {:?}", route.trim()))
    })?;
    let addresses = stdout_of("ip addr").await?;
    let network =
        parse_iface_network(&addresses, &iface).ok_or_else(|| {
            detect_failure(format!("no inet address on {}", iface))
        })?;
    let hosts = subnet_hosts(&network).ok_or_else(|| {
        detect_failure(format!("unparsable network {:?}", network))
    })?;

    log!("auto-detect master over {} ...", iface);
    for host in hosts {
        if let Ok(Ok(stream)) =
            timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await
        {
            log!("found master on {}", host);
            return Ok(Connection::from(stream));
        }
    }
    Err(detect_failure("No master found."))
}

fn detect_failure(message: impl Into<String>) -> Report {
    Report::new(TapError::new(ErrorKind::AutoDetectFailure, message))
}

async fn stdout_of(cmd: &str) -> Result<String, Report> {
    let output = shell_output(cmd)
        .await
        .wrap_err_with(|| format!("running {:?}", cmd))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The device of the default route: `default via <gw> dev <dev> ...`.
fn parse_default_iface(route: &str) -> Option<String> {
    let re = Regex::new(r"default via (\S+) dev (\S+)").unwrap();
    re.captures(route).map(|caps| caps[2].to_string())
}

/// The CIDR address of `iface` from `ip addr` output: the `inet` line
/// that names the interface.
fn parse_iface_network(addresses: &str, iface: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r"inet (\S+).+{}",
        regex::escape(iface)
    ))
    .ok()?;
    re.captures(addresses).map(|caps| caps[1].to_string())
}

/// All host addresses of a `a.b.c.d/len` network, network and broadcast
/// addresses excluded.
fn subnet_hosts(cidr: &str) -> Option<Vec<Ipv4Addr>> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    if broadcast <= network + 1 {
        // /31 and /32 have no host range to scan
        return Some(vec![addr]);
    }
    Some(((network + 1)..broadcast).map(Ipv4Addr::from).collect())
}
