use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

pub(crate) const MAX_CONNECT_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Reads the CONNECT request head (through the terminating CRLFCRLF) from
/// the browser. Returns the raw head plus any bytes the client pipelined
/// after it, which must be replayed in front of the TLS handshake.
pub(crate) async fn read_connect_head(
    stream: &mut TcpStream,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, Bytes)> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before CONNECT head completed",
            ));
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(end) = find_head_end(&buffer) {
            let remainder = Bytes::copy_from_slice(&buffer[end..]);
            buffer.truncate(end);
            return Ok((buffer, remainder));
        }

        if buffer.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT head exceeds maximum size",
            ));
        }
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

/// Parses `CONNECT host:port HTTP/1.x`. IPv6 literals use bracket form.
pub(crate) fn parse_connect_head(head: &[u8]) -> io::Result<ConnectTarget> {
    let text = std::str::from_utf8(head)
        .map_err(|_| invalid_request("CONNECT head is not valid UTF-8"))?;
    let request_line = text
        .lines()
        .next()
        .ok_or_else(|| invalid_request("empty CONNECT head"))?;

    let mut parts = request_line.split_ascii_whitespace();
    let method = parts.next().unwrap_or_default();
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(invalid_request(&format!(
            "expected CONNECT method, got '{method}'"
        )));
    }
    let authority = parts
        .next()
        .ok_or_else(|| invalid_request("CONNECT request missing authority"))?;
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid_request(&format!(
            "unsupported CONNECT protocol version '{version}'"
        )));
    }

    let (host, port) = parse_host_port(authority)?;
    Ok(ConnectTarget {
        host: host.to_ascii_lowercase(),
        port,
    })
}

fn parse_host_port(authority: &str) -> io::Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let Some(closing_bracket) = rest.find(']') else {
            return Err(invalid_request(&format!(
                "invalid IPv6 authority '{authority}'"
            )));
        };
        let host = &rest[..closing_bracket];
        if host.is_empty() {
            return Err(invalid_request("authority host must not be empty"));
        }
        let Some(port_raw) = rest[closing_bracket + 1..].strip_prefix(':') else {
            return Err(invalid_request(&format!(
                "authority must include ':port': '{authority}'"
            )));
        };
        return Ok((host.to_string(), parse_port(port_raw, authority)?));
    }

    let Some((host, port_raw)) = authority.rsplit_once(':') else {
        return Err(invalid_request(&format!(
            "authority must be host:port, got '{authority}'"
        )));
    };
    if host.is_empty() {
        return Err(invalid_request("authority host must not be empty"));
    }
    if host.contains(':') {
        return Err(invalid_request(&format!(
            "IPv6 authorities must use bracket form [::1]:443, got '{authority}'"
        )));
    }
    Ok((host.to_string(), parse_port(port_raw, authority)?))
}

fn parse_port(raw: &str, authority: &str) -> io::Result<u16> {
    let port = raw
        .parse::<u16>()
        .map_err(|error| invalid_request(&format!("invalid port in '{authority}': {error}")))?;
    if port == 0 {
        return Err(invalid_request(&format!(
            "port must be greater than zero: '{authority}'"
        )));
    }
    Ok(port)
}

fn invalid_request(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

pub(crate) async fn write_proxy_response(
    stream: &mut TcpStream,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

pin_project_lite::pin_project! {
    /// A stream with bytes buffered ahead of it. Used to replay anything a
    /// client pipelined behind its CONNECT head into the TLS acceptor.
    pub(crate) struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let take = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(take));
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
