// This module contains the datagram fragmentation used by the IPC surface.
pub mod datagram;

use crate::{log, trace};
use bytes::{Bytes, BytesMut};
use color_eyre::eyre::{eyre, Report, WrapErr};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use glob::{MatchOptions, Pattern};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest raw-byte chunk carried by one file-push frame.
pub const CHUNK_SIZE: usize = 4096;

/// Sentinel frame closing one pushed file.
const END_OF_FILE: &[u8] = b"@end";

/// Receive timeout applied while a push session is in progress.
const PUSH_RECV_TIMEOUT: tokio::time::Duration =
    tokio::time::Duration::from_secs(1);

/// A stream carrying length-prefixed frames: 4-byte little-endian length,
/// then exactly that many payload bytes. Control payloads are JSON; the
/// file-push sub-protocol reuses the same framing for raw bytes.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Sends one value as a JSON frame.
    pub async fn send<V>(&mut self, value: &V) -> Result<(), Report>
    where
        V: Serialize,
    {
        let bytes =
            serde_json::to_vec(value).wrap_err("serializing frame")?;
        self.send_bytes(bytes).await
    }

    /// Receives one JSON frame; `None` means the peer closed the stream.
    pub async fn recv<V>(&mut self) -> Result<Option<V>, Report>
    where
        V: DeserializeOwned,
    {
        match self.recv_bytes().await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .wrap_err("deserializing frame")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Sends one raw frame.
    pub async fn send_bytes(
        &mut self,
        bytes: impl Into<Bytes>,
    ) -> Result<(), Report> {
        self.framed
            .send(bytes.into())
            .await
            .wrap_err("sending frame")
    }

    /// Receives one raw frame; `None` means the peer closed the stream.
    pub async fn recv_bytes(&mut self) -> Result<Option<BytesMut>, Report> {
        match self.framed.next().await {
            Some(frame) => {
                let frame = frame.wrap_err("receiving frame")?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Connection<TcpStream> {
    pub async fn connect(
        addr: impl tokio::net::ToSocketAddrs,
    ) -> Result<Self, Report> {
        let stream = TcpStream::connect(addr)
            .await
            .wrap_err("connecting stream socket")?;
        Ok(Self::from(stream))
    }
}

/// Pushes every file under `root` matching `file_glob` and terminates the
/// session with an empty path frame. Per file: one path frame, raw chunk
/// frames of up to `CHUNK_SIZE` bytes, then the `@end` sentinel.
pub async fn send_files<S>(
    conn: &mut Connection<S>,
    name: &str,
    root: &Path,
    file_glob: &str,
) -> Result<(), Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pattern = root.join(file_glob);
    let pattern = pattern.to_string_lossy();
    for entry in
        glob::glob(&pattern).wrap_err_with(|| format!("bad glob {:?}", file_glob))?
    {
        let path = match entry {
            Ok(path) if path.is_file() => path,
            _ => continue,
        };
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        log!(
            "[sync] send to {:?}: {:?}",
            name,
            relative
        );
        conn.send_bytes(relative.to_string_lossy().into_owned().into_bytes())
            .await?;

        let mut file = tokio::fs::File::open(&path)
            .await
            .wrap_err_with(|| format!("opening {:?}", path))?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            conn.send_bytes(chunk[..read].to_vec()).await?;
        }
        conn.send_bytes(END_OF_FILE).await?;
    }
    // session terminator
    conn.send_bytes(Bytes::new()).await?;
    Ok(())
}

/// Receives one push session into `root`: stages every file in a
/// temporary file, then renames it into place iff its path matches
/// `file_glob`; anything else is rejected without error. Every receive is
/// bounded by a 1 s timeout to catch a stalled sender.
pub async fn recv_files<S>(
    conn: &mut Connection<S>,
    root: &Path,
    file_glob: &str,
) -> Result<(), Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pattern = Pattern::new(file_glob)
        .wrap_err_with(|| format!("bad glob {:?}", file_glob))?;
    loop {
        let name = recv_in_session(conn).await?;
        if name.is_empty() {
            return Ok(());
        }
        let name = PathBuf::from(String::from_utf8_lossy(&name).into_owned());

        let mut staged = tempfile::NamedTempFile::new_in(root)
            .wrap_err("staging pushed file")?;
        loop {
            let chunk = recv_in_session(conn).await?;
            if chunk == END_OF_FILE {
                break;
            }
            std::io::Write::write_all(&mut staged, &chunk)
                .wrap_err("writing staged chunk")?;
        }

        if matches_from_right(&pattern, &name) {
            let target = root.join(&name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .wrap_err("creating codebase directories")?;
            }
            staged
                .persist(&target)
                .wrap_err_with(|| format!("persisting {:?}", target))?;
            log!("[sync] {:?} received", name);
        } else {
            trace!("[sync] {:?} rejected", name);
        }
    }
}

async fn recv_in_session<S>(
    conn: &mut Connection<S>,
) -> Result<BytesMut, Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(PUSH_RECV_TIMEOUT, conn.recv_bytes())
        .await
        .map_err(|_| eyre!("push sender stalled"))??;
    frame.ok_or_else(|| eyre!("stream closed during push session"))
}

/// Matches a relative glob against the trailing components of `path`, the
/// way the push receiver accepts files: a pattern of k components is
/// compared against the path's last k components, `*` never crossing a
/// separator.
pub fn matches_from_right(pattern: &Pattern, path: &Path) -> bool {
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::default()
    };
    let pattern_len = pattern.as_str().split('/').count();
    let components: Vec<_> = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if components.len() < pattern_len {
        return false;
    }
    let tail: PathBuf = components[components.len() - pattern_len..]
        .iter()
        .collect();
    pattern.matches_path_with(&tail, options)
}
