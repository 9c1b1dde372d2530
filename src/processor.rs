// Request processors: CONNECT through an HTTP upstream, CONNECT through
// SOCKS/direct sockets, and plain-method relaying. The router tries each
// candidate upstream in order and owns the error policy.
use crate::auth::ProxyChallenge;
use crate::client::{ClientConnection, RequestHead};
use crate::config::TUNNEL_GRACE;
use crate::error::{ProxyError, Result};
use crate::selector::{TargetEndpoint, UpstreamDirective};
use crate::server::Session;
use crate::tunnel;
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

/// Largest upstream response head we accept, and the cap on an error-response
/// body buffered for verbatim forwarding.
const MAX_RESPONSE_HEAD: usize = 32 * 1024;
const MAX_FORWARD_BODY: usize = 64 * 1024;

/// Handle one parsed client request end to end. All response writing happens
/// here or below; the caller only closes the connection afterwards.
pub async fn process(session: &Session, conn: &mut ClientConnection) {
    let target = match TargetEndpoint::from_head(&conn.head) {
        Ok(target) => target,
        Err(e) => {
            conn.write_error_response(e.status_code(), &e.to_string()).await;
            return;
        }
    };

    tracing::debug!(
        "{} {} from {} -> {}",
        conn.head.method,
        conn.head.target,
        conn.peer(),
        target.authority()
    );

    let candidates = match session.selector.select(&conn.head, &target).await {
        Ok(candidates) if !candidates.is_empty() => candidates,
        Ok(_) => {
            conn.write_error_response(502, "no upstream available").await;
            return;
        }
        Err(e) => {
            conn.write_error_response(e.status_code(), &e.to_string()).await;
            return;
        }
    };

    for directive in candidates {
        match dispatch(session, conn, &target, &directive).await {
            Ok(()) => return,
            Err(ProxyError::ProxyConnect(e)) => {
                tracing::debug!("Upstream {} unreachable: {}, trying next", directive, e);
                session.blacklist.mark_bad(&directive);
            }
            Err(
                ProxyError::ProxyAuthorization { response }
                | ProxyError::TunnelRefused { response, .. },
            ) => {
                // The upstream spoke; its response goes to the client as-is.
                if !conn.is_committed() {
                    if let Err(e) = conn.write_raw(&response).await {
                        tracing::debug!("Failed forwarding upstream response: {}", e);
                    }
                }
                return;
            }
            Err(e) => {
                if conn.is_committed() {
                    tracing::debug!("Error after response was committed: {}", e);
                } else {
                    conn.write_error_response(e.status_code(), &e.to_string()).await;
                }
                return;
            }
        }
    }

    conn.write_error_response(502, "no reachable upstream").await;
}

async fn dispatch(
    session: &Session,
    conn: &mut ClientConnection,
    target: &TargetEndpoint,
    directive: &UpstreamDirective,
) -> Result<()> {
    match (conn.head.is_connect(), directive) {
        (true, UpstreamDirective::Http { host, port }) => {
            http_connect(session, conn, target, host, *port).await
        }
        (true, _) => socket_connect(session, conn, target, directive).await,
        (false, _) => non_connect(session, conn, target, directive).await,
    }
}

// ---- CONNECT through an HTTP upstream ----------------------------------------

async fn http_connect(
    session: &Session,
    conn: &mut ClientConnection,
    target: &TargetEndpoint,
    proxy_host: &str,
    proxy_port: u16,
) -> Result<()> {
    let config = &session.config;
    let mut upstream =
        connect_upstream(proxy_host, proxy_port, config.connect_timeout()).await?;

    let token = session.authenticator.initial_token()?;
    let mut response = exchange_connect(
        &mut upstream,
        target,
        token.as_deref(),
        config.socket_timeout(),
    )
    .await?;

    if response.status == 407 {
        let challenge =
            ProxyChallenge::from_headers(response.headers_named("Proxy-Authenticate"));
        if let Some(next) = session.authenticator.answer_challenge(&challenge)? {
            // Re-sending an identical token cannot change the answer.
            if Some(next.as_str()) != token.as_deref() {
                response.fill_body(&mut upstream, config.socket_timeout()).await;
                if !response.reusable() {
                    // The scheme wants connection affinity, but the upstream
                    // dropped the connection; start over once.
                    upstream =
                        connect_upstream(proxy_host, proxy_port, config.connect_timeout())
                            .await?;
                }
                response = exchange_connect(
                    &mut upstream,
                    target,
                    Some(&next),
                    config.socket_timeout(),
                )
                .await?;
            }
        }
    }

    if (200..300).contains(&response.status) {
        // Relay the upstream's own status line and headers, then pump bytes.
        conn.write_raw(&response.head).await?;
        if !response.residue.is_empty() {
            // Tunnel bytes that arrived glued to the response head.
            conn.write_raw(&response.residue).await?;
        }
        let residue = conn.take_residue();
        let client = conn.detach()?;
        tunnel::duplex(client, upstream, residue, config.socket_timeout(), TUNNEL_GRACE).await;
        return Ok(());
    }

    response.fill_body(&mut upstream, config.socket_timeout()).await;
    if response.status == 407 {
        Err(ProxyError::ProxyAuthorization {
            response: response.into_verbatim(),
        })
    } else {
        Err(ProxyError::TunnelRefused {
            status_line: response.status_line.clone(),
            response: response.into_verbatim(),
        })
    }
}

async fn exchange_connect(
    upstream: &mut TcpStream,
    target: &TargetEndpoint,
    token: Option<&str>,
    read_timeout: Duration,
) -> Result<RawResponse> {
    let authority = target.authority();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
        authority, authority
    );
    if let Some(token) = token {
        request.push_str("Proxy-Authorization: ");
        request.push_str(token);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    upstream.write_all(request.as_bytes()).await?;
    upstream.flush().await?;
    RawResponse::read(upstream, read_timeout).await
}

// ---- CONNECT through SOCKS or directly ---------------------------------------

async fn socket_connect(
    session: &Session,
    conn: &mut ClientConnection,
    target: &TargetEndpoint,
    directive: &UpstreamDirective,
) -> Result<()> {
    let config = &session.config;
    let upstream = open_target_stream(session, target, directive).await?;

    conn.write_raw(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    let residue = conn.take_residue();
    let client = conn.detach()?;
    tunnel::duplex(client, upstream, residue, config.socket_timeout(), TUNNEL_GRACE).await;
    Ok(())
}

/// Open a TCP path to the target itself: through SOCKS4/5, or directly.
async fn open_target_stream(
    session: &Session,
    target: &TargetEndpoint,
    directive: &UpstreamDirective,
) -> Result<TcpStream> {
    let connect_timeout = session.config.connect_timeout();
    let destination = (target.host.as_str(), target.port);

    match directive {
        UpstreamDirective::Socks5 { host, port } => {
            let proxy = (host.as_str(), *port);
            let connect = async {
                // The target goes through as a DOMAINNAME, unresolved.
                let stream = match session.authenticator.socks_credentials() {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password(proxy, destination, user, pass).await
                    }
                    None => Socks5Stream::connect(proxy, destination).await,
                }?;
                Ok::<_, tokio_socks::Error>(stream.into_inner())
            };
            tokio::time::timeout(connect_timeout, connect)
                .await
                .map_err(|_| connect_timed_out(host, *port))?
                .map_err(classify_socks_error)
        }
        UpstreamDirective::Socks4 { host, port } => {
            let proxy = (host.as_str(), *port);
            let connect = async {
                let stream = match session.authenticator.socks_user_id() {
                    Some(user) => {
                        Socks4Stream::connect_with_userid(proxy, destination, user).await
                    }
                    None => Socks4Stream::connect(proxy, destination).await,
                }?;
                Ok::<_, tokio_socks::Error>(stream.into_inner())
            };
            tokio::time::timeout(connect_timeout, connect)
                .await
                .map_err(|_| connect_timed_out(host, *port))?
                .map_err(classify_socks_error)
        }
        UpstreamDirective::Direct => {
            connect_upstream(&target.host, target.port, connect_timeout).await
        }
        UpstreamDirective::Http { .. } => Err(ProxyError::Internal(
            "HTTP upstream has no raw socket path".to_string(),
        )),
    }
}

// ---- Plain methods through an upstream ---------------------------------------

async fn non_connect(
    session: &Session,
    conn: &mut ClientConnection,
    target: &TargetEndpoint,
    directive: &UpstreamDirective,
) -> Result<()> {
    let config = &session.config;
    let via_http_proxy = directive.is_http();

    let mut upstream = match directive {
        UpstreamDirective::Http { host, port } => {
            connect_upstream(host, *port, config.connect_timeout()).await?
        }
        _ => open_target_stream(session, target, directive).await?,
    };

    let token = if via_http_proxy {
        session.authenticator.initial_token()?
    } else {
        None
    };

    let framing = BodyFraming::of(&conn.head);
    let head_bytes =
        rewrite_request_head(&conn.head, target, via_http_proxy, token.as_deref());
    upstream.write_all(&head_bytes).await?;
    stream_request_body(conn, &mut upstream, &framing).await?;
    upstream.flush().await?;

    let mut response = RawResponse::read(&mut upstream, config.socket_timeout()).await?;

    // Transparent retry on a 407 from the HTTP upstream. Bodies are streamed
    // through, never buffered, so only bodyless requests can be replayed.
    if response.status == 407 && via_http_proxy && matches!(framing, BodyFraming::None) {
        let challenge =
            ProxyChallenge::from_headers(response.headers_named("Proxy-Authenticate"));
        if let Some(next) = session.authenticator.answer_challenge(&challenge)? {
            if Some(next.as_str()) != token.as_deref() {
                if let UpstreamDirective::Http { host, port } = directive {
                    let mut retry =
                        connect_upstream(host, *port, config.connect_timeout()).await?;
                    let head_bytes =
                        rewrite_request_head(&conn.head, target, true, Some(&next));
                    retry.write_all(&head_bytes).await?;
                    retry.flush().await?;
                    response = RawResponse::read(&mut retry, config.socket_timeout()).await?;
                    upstream = retry;
                }
            }
        }
    }

    // Relay the upstream's bytes back verbatim: head, whatever was read past
    // it, then the rest of the stream until it closes.
    conn.write_raw(&response.head).await?;
    if !response.residue.is_empty() {
        conn.write_raw(&response.residue).await?;
    }
    relay_until_eof(&mut upstream, conn, config.socket_timeout()).await;
    Ok(())
}

async fn relay_until_eof(
    upstream: &mut TcpStream,
    conn: &mut ClientConnection,
    idle: Duration,
) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match tokio::time::timeout(idle, upstream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!("Upstream read ended: {}", e);
                break;
            }
        };
        if let Err(e) = conn.write_raw(&buf[..n]).await {
            tracing::debug!("Client went away during relay: {}", e);
            break;
        }
    }
}

/// How the request body is delimited on the wire.
#[derive(Debug, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

impl BodyFraming {
    fn of(head: &RequestHead) -> Self {
        if head.is_chunked() {
            BodyFraming::Chunked
        } else {
            match head.content_length() {
                Some(n) if n > 0 => BodyFraming::Length(n),
                _ => BodyFraming::None,
            }
        }
    }
}

/// Headers that never travel past this hop. The Connection header may name
/// further ones per RFC 7230 §6.1.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Rewrite the client's request head for the upstream: hop-by-hop headers
/// stripped, Host pinned to the target, request-target in absolute form for
/// HTTP upstreams and origin form otherwise, framing and auth re-added.
fn rewrite_request_head(
    head: &RequestHead,
    target: &TargetEndpoint,
    absolute: bool,
    auth: Option<&str>,
) -> Vec<u8> {
    let request_target = if absolute {
        if head.target.starts_with("http://") || head.target.starts_with("https://") {
            head.target.clone()
        } else {
            format!("http://{}{}", target.authority(), origin_form(&head.target))
        }
    } else {
        origin_form(&head.target)
    };

    // Connection-named tokens are hop-by-hop too.
    let mut named: HashSet<String> = HashSet::new();
    for value in head
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("Connection"))
        .map(|(_, v)| v)
    {
        for token in value.split(',') {
            named.insert(token.trim().to_ascii_lowercase());
        }
    }

    let mut out = format!("{} {} {}\r\n", head.method, request_target, head.version);
    out.push_str(&format!("Host: {}\r\n", host_header_value(target)));

    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if is_hop_by_hop(&lower)
            || named.contains(&lower)
            || lower == "host"
            || lower == "content-length"
        {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }

    match BodyFraming::of(head) {
        BodyFraming::Length(n) => out.push_str(&format!("Content-Length: {}\r\n", n)),
        BodyFraming::Chunked => out.push_str("Transfer-Encoding: chunked\r\n"),
        BodyFraming::None => {}
    }
    out.push_str("Connection: close\r\n");
    if let Some(token) = auth {
        out.push_str("Proxy-Authorization: ");
        out.push_str(token);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn host_header_value(target: &TargetEndpoint) -> String {
    let default_port = if target.secure { 443 } else { 80 };
    if target.port == default_port {
        target.host.clone()
    } else {
        target.authority()
    }
}

fn origin_form(request_target: &str) -> String {
    if let Ok(parsed) = url::Url::parse(request_target) {
        let mut origin = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            origin.push('?');
            origin.push_str(query);
        }
        if origin.is_empty() {
            origin.push('/');
        }
        return origin;
    }
    request_target.to_string()
}

async fn stream_request_body(
    conn: &mut ClientConnection,
    upstream: &mut TcpStream,
    framing: &BodyFraming,
) -> Result<()> {
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(total) => {
            let mut remaining = *total;
            let mut buf = [0u8; 16 * 1024];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let n = conn.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(ProxyError::Protocol(
                        "request body ended before Content-Length".to_string(),
                    ));
                }
                upstream.write_all(&buf[..n]).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
        BodyFraming::Chunked => stream_chunked_body(conn, upstream).await,
    }
}

/// Forward a chunked body as-is, chunk by chunk, until the terminal chunk
/// and its trailer section have passed through.
async fn stream_chunked_body(
    conn: &mut ClientConnection,
    upstream: &mut TcpStream,
) -> Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let line = read_line(conn, &mut pending).await?;
        upstream.write_all(&line).await?;

        let size_text = std::str::from_utf8(&line)
            .map_err(|_| ProxyError::Protocol("invalid chunk size line".to_string()))?
            .trim_end();
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::Protocol(format!("invalid chunk size: {}", size_text)))?;

        if size == 0 {
            // Trailer section through the final blank line.
            loop {
                let trailer = read_line(conn, &mut pending).await?;
                upstream.write_all(&trailer).await?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        let mut remaining = size + 2;
        while remaining > 0 {
            if !pending.is_empty() {
                let take = pending.len().min(remaining as usize);
                upstream.write_all(&pending[..take]).await?;
                pending.drain(..take);
                remaining -= take as u64;
                continue;
            }
            let mut buf = [0u8; 16 * 1024];
            let want = buf.len().min(remaining as usize);
            let n = conn.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(ProxyError::Protocol(
                    "chunked body ended mid-chunk".to_string(),
                ));
            }
            upstream.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
    }
}

/// Read one CRLF-terminated line out of `pending` + the client socket.
async fn read_line(conn: &mut ClientConnection, pending: &mut Vec<u8>) -> Result<Vec<u8>> {
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            return Ok(line);
        }
        if pending.len() > 8 * 1024 {
            return Err(ProxyError::Protocol("chunk size line too long".to_string()));
        }
        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "chunked body ended mid-line".to_string(),
            ));
        }
        pending.extend_from_slice(&buf[..n]);
    }
}

// ---- Upstream response heads -------------------------------------------------

/// An upstream's response head, kept verbatim for relaying, plus whatever
/// body bytes were read together with it.
#[derive(Debug)]
pub struct RawResponse {
    pub head: Vec<u8>,
    pub residue: Vec<u8>,
    pub status: u16,
    pub status_line: String,
    headers: Vec<(String, String)>,
    version_11: bool,
    body_complete: bool,
}

impl RawResponse {
    /// Read status line and headers from the upstream. EOF before a complete
    /// head means the gateway never answered usefully.
    pub async fn read(stream: &mut TcpStream, read_timeout: Duration) -> Result<Self> {
        let mut buffer: Vec<u8> = Vec::with_capacity(1024);
        let mut chunk = [0u8; 2048];

        let head_end = loop {
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if buffer.len() > MAX_RESPONSE_HEAD {
                return Err(ProxyError::Internal(
                    "upstream response head too large".to_string(),
                ));
            }
            let n = tokio::time::timeout(read_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    ProxyError::GatewayTimeout("upstream response timed out".to_string())
                })?
                .map_err(ProxyError::Io)?;
            if n == 0 {
                return Err(ProxyError::GatewayTimeout(
                    "upstream closed without a response".to_string(),
                ));
            }
            buffer.extend_from_slice(&chunk[..n]);
        };

        let residue = buffer.split_off(head_end);
        let head = buffer;

        let text = String::from_utf8_lossy(&head);
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_string();
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        let status: u16 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| {
            ProxyError::Internal(format!("unparsable upstream status line: {}", status_line))
        })?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let version_11 = version.eq_ignore_ascii_case("HTTP/1.1");

        Ok(RawResponse {
            head,
            residue,
            status,
            status_line,
            headers,
            version_11,
            body_complete: false,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Pull the (bounded) response body into `residue`, so the response can
    /// be forwarded verbatim or the connection reused for a retry.
    pub async fn fill_body(&mut self, stream: &mut TcpStream, read_timeout: Duration) {
        let want = if self.is_chunked() {
            // Bounded scan for the terminal chunk.
            None
        } else {
            match self.content_length() {
                Some(n) if n as usize <= MAX_FORWARD_BODY => Some(n as usize),
                Some(_) => {
                    // Too large to buffer; leave it and give up on reuse.
                    return;
                }
                None => {
                    self.body_complete = true;
                    return;
                }
            }
        };

        let mut chunk = [0u8; 2048];
        loop {
            match want {
                Some(total) if self.residue.len() >= total => {
                    self.body_complete = true;
                    return;
                }
                None if self.residue.ends_with(b"0\r\n\r\n") => {
                    self.body_complete = true;
                    return;
                }
                _ => {}
            }
            if self.residue.len() > MAX_FORWARD_BODY {
                return;
            }
            let n = match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => return,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => return,
            };
            self.residue.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether the upstream connection can carry another exchange.
    pub fn reusable(&self) -> bool {
        if !self.body_complete {
            return false;
        }
        let connection = self
            .header("Connection")
            .or_else(|| self.header("Proxy-Connection"))
            .map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.version_11,
        }
    }

    /// The full response bytes read so far: head plus buffered body.
    pub fn into_verbatim(mut self) -> Vec<u8> {
        self.head.append(&mut self.residue);
        self.head
    }
}

fn connect_timed_out(host: &str, port: u16) -> ProxyError {
    ProxyError::ProxyConnect(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connect to {}:{} timed out", host, port),
    ))
}

/// Open a TCP connection, classifying every failure as a blacklistable
/// connect error.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::ProxyConnect(e)),
        Err(_) => Err(connect_timed_out(host, port)),
    }
}

fn classify_socks_error(e: tokio_socks::Error) -> ProxyError {
    match e {
        // The SOCKS endpoint itself was unreachable.
        tokio_socks::Error::Io(io) => ProxyError::ProxyConnect(io),
        // The endpoint answered; failures past that are not blacklistable.
        other => ProxyError::Internal(format!("SOCKS negotiation failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    fn target(host: &str, port: u16) -> TargetEndpoint {
        TargetEndpoint {
            host: host.to_string(),
            port,
            secure: false,
        }
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let request = head(
            "GET http://example.org/ HTTP/1.1\r\n\
             Host: example.org\r\n\
             Proxy-Connection: keep-alive\r\n\
             Keep-Alive: timeout=5\r\n\
             Upgrade: h2c\r\n\
             Connection: upgrade, x-tracking\r\n\
             X-Tracking: abc\r\n\
             Accept: */*\r\n\r\n",
        );
        let rewritten =
            String::from_utf8(rewrite_request_head(&request, &target("example.org", 80), true, None))
                .unwrap();

        assert!(rewritten.starts_with("GET http://example.org/ HTTP/1.1\r\n"));
        assert!(rewritten.contains("Host: example.org\r\n"));
        assert!(rewritten.contains("Accept: */*\r\n"));
        assert!(!rewritten.contains("Proxy-Connection"));
        assert!(!rewritten.contains("Keep-Alive"));
        assert!(!rewritten.contains("Upgrade"));
        // Connection-named extension header goes too.
        assert!(!rewritten.contains("X-Tracking"));
        assert!(rewritten.contains("Connection: close\r\n"));
    }

    #[test]
    fn absolute_and_origin_forms() {
        let request = head("GET http://example.org/a/b?q=1 HTTP/1.1\r\nHost: example.org\r\n\r\n");

        let via_proxy =
            String::from_utf8(rewrite_request_head(&request, &target("example.org", 80), true, None))
                .unwrap();
        assert!(via_proxy.starts_with("GET http://example.org/a/b?q=1 HTTP/1.1\r\n"));

        let direct = String::from_utf8(rewrite_request_head(
            &request,
            &target("example.org", 80),
            false,
            None,
        ))
        .unwrap();
        assert!(direct.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn auth_header_is_injected_for_http_upstreams() {
        let request = head("GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n");
        let rewritten = String::from_utf8(rewrite_request_head(
            &request,
            &target("example.org", 80),
            true,
            Some("Basic dTpw"),
        ))
        .unwrap();
        assert!(rewritten.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn body_framing_is_preserved() {
        let request = head("POST http://example.org/ HTTP/1.1\r\nHost: example.org\r\nContent-Length: 11\r\n\r\n");
        assert_eq!(BodyFraming::of(&request), BodyFraming::Length(11));
        let rewritten =
            String::from_utf8(rewrite_request_head(&request, &target("example.org", 80), true, None))
                .unwrap();
        assert!(rewritten.contains("Content-Length: 11\r\n"));

        let request = head("POST http://example.org/ HTTP/1.1\r\nHost: example.org\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(BodyFraming::of(&request), BodyFraming::Chunked);
        let rewritten =
            String::from_utf8(rewrite_request_head(&request, &target("example.org", 80), true, None))
                .unwrap();
        assert!(rewritten.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(host_header_value(&target("example.org", 80)), "example.org");
        assert_eq!(
            host_header_value(&target("example.org", 8080)),
            "example.org:8080"
        );
    }

    #[tokio::test]
    async fn response_head_parsing_keeps_residue() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\nContent-Length: 6\r\n\r\ndenied")
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut response = RawResponse::read(&mut stream, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 407);
        assert_eq!(response.header("Content-Length"), Some("6"));

        response.fill_body(&mut stream, Duration::from_secs(5)).await;
        let verbatim = response.into_verbatim();
        assert!(verbatim.ends_with(b"denied"));
    }

    #[tokio::test]
    async fn unresponsive_upstream_is_a_gateway_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = RawResponse::read(&mut stream, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::GatewayTimeout(_)));
    }

    #[tokio::test]
    async fn refused_connect_is_blacklistable() {
        // Bind then drop to get a port that refuses.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_upstream(&addr.ip().to_string(), addr.port(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProxyConnect(_)));
    }
}
