// Client-side connection: request head parsing and response writing.
use crate::config::MAX_REQUEST_HEAD;
use crate::error::{ProxyError, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A parsed HTTP/1.x request head. Header order and duplicates are
/// preserved; lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProxyError::Protocol("request head is not valid UTF-8".to_string()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProxyError::Protocol("empty request line".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ProxyError::Protocol("missing method".to_string()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| ProxyError::Protocol("missing request target".to_string()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.0").to_string();
        if !version.starts_with("HTTP/1.") {
            return Err(ProxyError::Protocol(format!(
                "unsupported protocol version: {}",
                version
            )));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProxyError::Protocol(format!("malformed header line: {}", line))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RequestHead {
            method,
            target,
            version,
            headers,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Serialize back to wire form: request line, headers in their original
    /// order, blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// One accepted client connection. Owns the socket for its lifetime; the
/// socket is released to the duplex pump by `detach` once a tunnel is up.
pub struct ClientConnection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    pub head: RequestHead,
    residue: Vec<u8>,
    committed: bool,
}

impl ClientConnection {
    /// Read and parse one request head, bounded by `MAX_REQUEST_HEAD`.
    /// Bytes read past CRLFCRLF are retained as the body/tunnel residue.
    pub async fn accept(
        mut stream: TcpStream,
        peer: SocketAddr,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut buffer: Vec<u8> = Vec::with_capacity(2048);
        let mut chunk = [0u8; 2048];

        let head_end = loop {
            if let Some(pos) = find_head_end(&buffer) {
                break pos;
            }
            if buffer.len() > MAX_REQUEST_HEAD {
                let err = ProxyError::Protocol("request head exceeds 64 KiB".to_string());
                write_error_raw(&mut stream, 400, &err.to_string()).await;
                return Err(err);
            }
            let n = match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ProxyError::Io(e)),
                Err(_) => {
                    // Idle client; drop without a response.
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out reading the request head",
                    )));
                }
            };
            if n == 0 {
                if buffer.is_empty() {
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "client closed without sending a request",
                    )));
                }
                let err = ProxyError::Protocol("truncated request head".to_string());
                write_error_raw(&mut stream, 400, &err.to_string()).await;
                return Err(err);
            }
            buffer.extend_from_slice(&chunk[..n]);
        };

        let head = match RequestHead::parse(&buffer[..head_end]) {
            Ok(head) => head,
            Err(e) => {
                write_error_raw(&mut stream, 400, &e.to_string()).await;
                return Err(e);
            }
        };
        let residue = buffer.split_off(head_end + 4);

        Ok(ClientConnection {
            stream: Some(stream),
            peer,
            head,
            residue,
            committed: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Body/tunnel bytes that arrived together with the head.
    pub fn take_residue(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.residue)
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket already detached"))
    }

    /// Read request body bytes, residue first.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.residue.is_empty() {
            let n = self.residue.len().min(buf.len());
            buf[..n].copy_from_slice(&self.residue[..n]);
            self.residue.drain(..n);
            return Ok(n);
        }
        self.stream_mut()?.read(buf).await
    }

    /// Write raw response bytes. The first write commits the response, even
    /// if it fails partway: a half-written response must never be followed
    /// by a synthesized error.
    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.committed = true;
        let stream = self.stream_mut()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Synthesize a plain-text error response, unless a response has already
    /// been committed -- then the connection just closes.
    pub async fn write_error_response(&mut self, status: u16, message: &str) {
        if self.committed {
            tracing::debug!(
                "Response already committed for {}, suppressing {} {}",
                self.peer,
                status,
                message
            );
            return;
        }
        if let Err(e) = self.write_raw(&error_response_bytes(status, message)).await {
            tracing::debug!("Failed writing {} to {}: {}", status, self.peer, e);
        }
    }

    /// Hand the socket over for tunneling. Further write helpers fail.
    pub fn detach(&mut self) -> Result<TcpStream> {
        self.committed = true;
        self.stream
            .take()
            .ok_or_else(|| ProxyError::Internal("client socket already detached".to_string()))
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn error_response_bytes(status: u16, message: &str) -> Vec<u8> {
    let body = format!("{}\n", message);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    )
    .into_bytes()
}

async fn write_error_raw(stream: &mut TcpStream, status: u16, message: &str) {
    let _ = stream
        .write_all(&error_response_bytes(status, message))
        .await;
    let _ = stream.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_ordered_headers() {
        let raw = b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\nAccept: */*\r\nAccept: text/html\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.org/");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.headers.len(), 3);
        // Duplicates preserved in order, first one wins for lookup.
        assert_eq!(head.header("accept"), Some("*/*"));
        assert_eq!(head.header("HOST"), Some("example.org"));
    }

    #[test]
    fn reserializing_is_byte_stable() {
        let raw = b"POST http://example.org/api HTTP/1.1\r\nHost: example.org\r\nContent-Length: 4\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap();
        assert_eq!(head.to_bytes(), raw.to_vec());
    }

    #[test]
    fn rejects_garbage() {
        assert!(RequestHead::parse(b"\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / SPDY/3\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nbroken line\r\n\r\n").is_err());
    }

    #[test]
    fn connect_detection_and_body_framing() {
        let head =
            RequestHead::parse(b"CONNECT secure.example:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.is_connect());

        let head = RequestHead::parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert!(head.is_chunked());
        assert_eq!(head.content_length(), None);

        let head =
            RequestHead::parse(b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Some(12));
    }

    #[tokio::test]
    async fn residue_after_head_is_preserved() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let send = tokio::spawn(async move {
            let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
            s.write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            s
        });
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = ClientConnection::accept(stream, peer, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.take_residue(), b"hello".to_vec());
        let _ = send.await.unwrap();
    }
}
