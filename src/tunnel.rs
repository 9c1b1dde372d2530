// Full-duplex byte pump between the client socket and the upstream socket.
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const COPY_BUFFER: usize = 16 * 1024;

/// Aborts the wrapped task when dropped, so a cancelled connection handler
/// never leaves its reverse-direction copy running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Copy bytes until EOF, an error, or an idle read timeout. A timeout is
/// treated as a normal end of the direction, not as a failure.
async fn copy_until_idle<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(total),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Run the two directions of an established tunnel until it winds down.
///
/// The reverse direction (upstream to client) runs on its own task; the
/// forward direction runs here. When the forward copy ends cleanly the
/// upstream's write side is half-closed to signal EOF, and the reverse task
/// gets a bounded grace period to drain before being cancelled. A forward
/// I/O error cancels it immediately. Both sockets are closed on every exit.
pub async fn duplex(
    client: TcpStream,
    upstream: TcpStream,
    residue: Vec<u8>,
    idle: Duration,
    grace: Duration,
) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let reverse = tokio::spawn(async move {
        let result = copy_until_idle(&mut upstream_read, &mut client_write, idle).await;
        let _ = client_write.shutdown().await;
        result
    });
    let mut reverse = AbortOnDrop(reverse);

    let forward = async {
        if !residue.is_empty() {
            upstream_write.write_all(&residue).await?;
        }
        copy_until_idle(&mut client_read, &mut upstream_write, idle).await
    }
    .await;

    match forward {
        Ok(sent) => {
            tracing::debug!("Forward direction done after {} bytes", sent);
            // Half-close towards the upstream so it can finish its side.
            let _ = upstream_write.shutdown().await;
            match tokio::time::timeout(grace, &mut reverse.0).await {
                Ok(Ok(Ok(received))) => {
                    tracing::debug!("Reverse direction done after {} bytes", received);
                }
                Ok(Ok(Err(e))) => tracing::debug!("Reverse direction error: {}", e),
                Ok(Err(e)) => tracing::debug!("Reverse task failed: {}", e),
                Err(_) => {
                    tracing::debug!("Reverse direction still busy after {:?}, cancelling", grace);
                    reverse.0.abort();
                }
            }
        }
        Err(e) => {
            tracing::debug!("Forward direction error, cancelling reverse: {}", e);
            reverse.0.abort();
        }
    }
    // Remaining halves drop here, closing both sockets.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, connect.await.unwrap())
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_residue_goes_first() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, upstream_far) = tcp_pair().await;

        let pump = tokio::spawn(duplex(
            client_near,
            upstream_near,
            b"early".to_vec(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));

        let (mut client_far, mut upstream_far) = (client_far, upstream_far);

        // Residue must arrive upstream before anything else.
        let mut first = [0u8; 5];
        upstream_far.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"early");

        client_far.write_all(b"ping").await.unwrap();
        let mut ping = [0u8; 4];
        upstream_far.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");

        upstream_far.write_all(b"pong").await.unwrap();
        let mut pong = [0u8; 4];
        client_far.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        // Client EOF winds the session down within the grace period.
        drop(client_far);
        drop(upstream_far);
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("duplex should terminate")
            .unwrap();
    }

    #[tokio::test]
    async fn client_eof_half_closes_upstream() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, upstream_far) = tcp_pair().await;

        let pump = tokio::spawn(duplex(
            client_near,
            upstream_near,
            Vec::new(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));

        let mut upstream_far = upstream_far;
        drop(client_far);

        // Upstream observes EOF from the half-close.
        let mut buf = [0u8; 1];
        let n = upstream_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(upstream_far);
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("duplex should terminate")
            .unwrap();
    }

    #[tokio::test]
    async fn idle_timeout_ends_the_session() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, upstream_far) = tcp_pair().await;

        let started = std::time::Instant::now();
        duplex(
            client_near,
            upstream_near,
            Vec::new(),
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));

        drop((client_far, upstream_far));
    }
}
