// Plain-method relaying details: header rewriting on the wire, request
// bodies, and 407 handling against an HTTP upstream.
use proxlet::config::{AuthProtocol, Config, ProxyType};
use proxlet::server::{ProxyServer, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(mut config: Config) -> (ProxyServer, Arc<Session>, SocketAddr) {
    config.local_port = 0;
    let session = Session::open(config).await.expect("session should open");
    let mut server = ProxyServer::new(Arc::clone(&session));
    let addr = server.start().await.expect("server should start");
    (server, session, addr)
}

fn http_upstream_config(addr: SocketAddr) -> Config {
    let mut config = Config::default();
    config.proxy_type = ProxyType::Http;
    config.set_proxy_endpoint(ProxyType::Http, &addr.ip().to_string(), addr.port());
    config
}

async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

/// Upstream that records everything it receives until the client half
/// closes or the expected byte count arrives, then answers.
async fn spawn_recording_upstream(
    responses: Vec<&'static [u8]>,
) -> (SocketAddr, tokio::sync::mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            // Read the request head plus any body the framing announces.
            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(total) = expected_request_len(&received) {
                    if received.len() >= total {
                        break;
                    }
                }
                match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => received.extend_from_slice(&chunk[..n]),
                    Ok(Err(_)) => break,
                }
            }
            let _ = tx.send(received).await;
            let _ = stream.write_all(response).await;
            let _ = stream.flush().await;
        }
    });
    (addr, rx)
}

/// Total request length once the head is complete: head plus Content-Length
/// body, or head plus a chunked body ending in the terminal chunk.
fn expected_request_len(received: &[u8]) -> Option<usize> {
    let head_end = received.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&received[..head_end]).to_lowercase();
    if head.contains("transfer-encoding: chunked") {
        if received[head_end..]
            .windows(5)
            .any(|w| w == b"0\r\n\r\n")
        {
            return Some(received.len());
        }
        return None;
    }
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    Some(head_end + length)
}

#[tokio::test]
async fn request_body_with_content_length_is_streamed() {
    let (upstream_addr, mut captured) =
        spawn_recording_upstream(vec![b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n"]).await;
    let (mut server, _session, addr) = start_proxy(http_upstream_config(upstream_addr)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"POST http://example.org/submit HTTP/1.1\r\nHost: example.org\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 201 Created\r\n"));

    let request = captured.recv().await.unwrap();
    let request_text = String::from_utf8_lossy(&request);
    assert!(request_text.contains("Content-Length: 11\r\n"));
    assert!(request_text.ends_with("hello world"), "{}", request_text);

    server.stop().await;
}

#[tokio::test]
async fn chunked_request_body_passes_through_unchanged() {
    let (upstream_addr, mut captured) =
        spawn_recording_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"]).await;
    let (mut server, _session, addr) = start_proxy(http_upstream_config(upstream_addr)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"POST http://example.org/upload HTTP/1.1\r\nHost: example.org\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK\r\n"));

    let request = captured.recv().await.unwrap();
    let request_text = String::from_utf8_lossy(&request);
    assert!(request_text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(
        request_text.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"),
        "{}",
        request_text
    );

    server.stop().await;
}

#[tokio::test]
async fn basic_credentials_are_injected_preemptively() {
    let (upstream_addr, mut captured) =
        spawn_recording_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"]).await;
    let mut config = http_upstream_config(upstream_addr);
    config.proxy_username = "jdoe".into();
    config.proxy_password = "s3cr3t".into();
    config.auth_protocol = AuthProtocol::Basic;
    let (mut server, _session, addr) = start_proxy(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .unwrap();
    let response = read_until_close(&mut client).await;
    assert!(String::from_utf8_lossy(&response).ends_with("ok"));

    let request = captured.recv().await.unwrap();
    let request_text = String::from_utf8_lossy(&request);
    // base64("jdoe:s3cr3t")
    assert!(
        request_text.contains("Proxy-Authorization: Basic amRvZTpzM2NyM3Q=\r\n"),
        "{}",
        request_text
    );

    server.stop().await;
}

#[tokio::test]
async fn persistent_407_reaches_the_client_verbatim() {
    let (upstream_addr, mut captured) = spawn_recording_upstream(vec![
        b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nContent-Length: 6\r\n\r\ndenied",
    ])
    .await;
    // No credentials configured: nothing to retry with.
    let (mut server, _session, addr) = start_proxy(http_upstream_config(upstream_addr)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    let response_text = String::from_utf8_lossy(&response);
    assert!(
        response_text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"),
        "{}",
        response_text
    );
    assert!(response_text.contains("Proxy-Authenticate: Negotiate"));
    assert!(response_text.ends_with("denied"));

    let _ = captured.recv().await;
    server.stop().await;
}

#[tokio::test]
async fn origin_form_is_used_when_the_socket_goes_to_the_target() {
    // DIRECT config: the proxy opens the socket to the target itself, so the
    // request line must carry the origin-form target.
    let (target_addr, mut captured) =
        spawn_recording_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"]).await;
    let (mut server, _session, addr) = start_proxy(Config::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET http://{}/path?x=1 HTTP/1.1\r\nHost: {}\r\n\r\n",
        target_addr, target_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_until_close(&mut client).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK\r\n"));

    let seen = captured.recv().await.unwrap();
    let seen_text = String::from_utf8_lossy(&seen);
    assert!(seen_text.starts_with("GET /path?x=1 HTTP/1.1\r\n"), "{}", seen_text);

    server.stop().await;
}
