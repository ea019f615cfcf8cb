//! Control-channel I/O: buffered line reading, reply writing, TLS upgrade.
//!
//! The channel starts as plain TCP and can be upgraded in place after
//! `AUTH TLS` has been acknowledged. Lines are decoded lossily (invalid
//! UTF-8 bytes are replaced, never fatal) and capped in length so a
//! misbehaving client cannot grow the buffer without bound.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::trace;

use crate::protocol::reply::Reply;

/// Longest accepted control line, terminator included.
const MAX_LINE: usize = 4096;

enum ChannelStream {
    Plain(BufStream<TcpStream>),
    Tls(Box<BufStream<TlsStream<TcpStream>>>),
    /// Transient state while the TLS handshake owns the socket.
    Upgrading,
}

/// One session's control connection.
pub struct ControlChannel {
    stream: ChannelStream,
    /// Partially-read line; persists across cancelled reads so a command
    /// arriving during a transfer is never truncated.
    partial: Vec<u8>,
}

impl ControlChannel {
    pub fn new(socket: TcpStream) -> Self {
        ControlChannel {
            stream: ChannelStream::Plain(BufStream::new(socket)),
            partial: Vec::with_capacity(128),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ChannelStream::Tls(_))
    }

    /// Reads one CRLF-terminated line; `None` on clean EOF.
    ///
    /// Cancel-safe: a cancelled call leaves the bytes read so far in the
    /// internal buffer for the next call.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let read = match &mut self.stream {
            ChannelStream::Plain(s) => read_capped(s, &mut self.partial).await?,
            ChannelStream::Tls(s) => read_capped(s, &mut self.partial).await?,
            ChannelStream::Upgrading => {
                return Err(io::Error::other("control channel mid-upgrade"));
            }
        };
        if read == 0 && self.partial.is_empty() {
            return Ok(None);
        }
        let buf = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&buf).into_owned();
        trace!("<<< {}", line.trim_end());
        Ok(Some(line))
    }

    /// Writes and flushes one reply.
    pub async fn send(&mut self, reply: &Reply) -> io::Result<()> {
        let text = reply.render();
        trace!(">>> {}", text.trim_end());
        match &mut self.stream {
            ChannelStream::Plain(s) => {
                s.write_all(text.as_bytes()).await?;
                s.flush().await
            }
            ChannelStream::Tls(s) => {
                s.write_all(text.as_bytes()).await?;
                s.flush().await
            }
            ChannelStream::Upgrading => Err(io::Error::other("control channel mid-upgrade")),
        }
    }

    /// Performs the server-side handshake after `234` has been sent.
    ///
    /// Fails when the channel is already TLS; the caller turns that into a
    /// protocol error instead of tearing the session down.
    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        match std::mem::replace(&mut self.stream, ChannelStream::Upgrading) {
            ChannelStream::Plain(buffered) => {
                let socket = buffered.into_inner();
                match acceptor.accept(socket).await {
                    Ok(tls) => {
                        self.stream = ChannelStream::Tls(Box::new(BufStream::new(tls)));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            other => {
                self.stream = other;
                Err(io::Error::other("control channel is already TLS"))
            }
        }
    }
}

/// Reads up to and including the next `\n`, enforcing the length cap.
///
/// Built on `fill_buf`/`consume` so a cancelled call never consumes bytes
/// it did not append to `buf`.
async fn read_capped<S>(stream: &mut S, buf: &mut Vec<u8>) -> io::Result<usize>
where
    S: AsyncBufReadExt + Unpin,
{
    let mut total = 0;
    loop {
        let (complete, used, eof) = {
            let available = stream.fill_buf().await?;
            if available.is_empty() {
                (false, 0, true)
            } else {
                match available.iter().position(|&b| b == b'\n') {
                    Some(idx) => {
                        buf.extend_from_slice(&available[..=idx]);
                        (true, idx + 1, false)
                    }
                    None => {
                        buf.extend_from_slice(available);
                        (false, available.len(), false)
                    }
                }
            }
        };
        if eof {
            return Ok(total);
        }
        stream.consume(used);
        total += used;
        if complete {
            return Ok(total);
        }
        if buf.len() > MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "control line too long"));
        }
    }
}
