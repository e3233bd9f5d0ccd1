use color_eyre::eyre::{eyre, Report, WrapErr};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Fixed datagram size used by the IPC surface. Replies larger than this
/// are split into consecutive datagrams; reassembly relies on a lossless
/// local link (loopback or an equivalent LAN).
pub const BUFFER_SIZE: usize = 10240;

/// Sends `msg` to `target` as a 4-byte little-endian length prefix plus
/// payload, chunked into `BUFFER_SIZE`-byte datagrams.
pub async fn frag_send(
    sock: &UdpSocket,
    msg: &[u8],
    target: SocketAddr,
) -> Result<(), Report> {
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    framed.extend_from_slice(msg);
    for chunk in framed.chunks(BUFFER_SIZE) {
        sock.send_to(chunk, target)
            .await
            .wrap_err("sending reply datagram")?;
    }
    Ok(())
}

/// Receives one framed message on a connected socket: the first datagram
/// carries the length prefix, further datagrams are accumulated until the
/// announced length is reached.
pub async fn frag_recv(sock: &UdpSocket) -> Result<Vec<u8>, Report> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let read = sock.recv(&mut buf).await.wrap_err("receiving datagram")?;
    if read < 4 {
        return Err(eyre!("short datagram: {} bytes", read));
    }
    let len =
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut msg = buf[4..read].to_vec();
    while msg.len() < len {
        let read =
            sock.recv(&mut buf).await.wrap_err("receiving datagram")?;
        msg.extend_from_slice(&buf[..read]);
    }
    msg.truncate(len);
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn socket_pair() -> (UdpSocket, UdpSocket, SocketAddr) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        b.connect(a_addr).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, b_addr)
    }

    #[tokio::test]
    async fn small_reply_fits_one_datagram() {
        let (server, console, console_addr) = socket_pair().await;
        let msg = br#"{"res":true}"#;
        frag_send(&server, msg, console_addr).await.unwrap();
        let received = frag_recv(&console).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn large_reply_spans_datagrams() {
        let (server, console, console_addr) = socket_pair().await;
        // three full datagrams plus a remainder
        let msg: Vec<u8> = (0..BUFFER_SIZE * 3 + 123)
            .map(|i| (i % 251) as u8)
            .collect();

        let recv = tokio::spawn(async move {
            frag_recv(&console).await.unwrap()
        });
        frag_send(&server, &msg, console_addr).await.unwrap();
        let received = recv.await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn exact_multiple_of_buffer_size() {
        let (server, console, console_addr) = socket_pair().await;
        // framed length 4 + msg lands exactly on a datagram boundary
        let msg = vec![7u8; BUFFER_SIZE * 2 - 4];
        let recv = tokio::spawn(async move {
            frag_recv(&console).await.unwrap()
        });
        frag_send(&server, &msg, console_addr).await.unwrap();
        let received = recv.await.unwrap();
        assert_eq!(received, msg);
    }
}
