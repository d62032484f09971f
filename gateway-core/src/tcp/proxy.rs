//! Single-stream TCP proxy supervisor (C6): connect-with-timeout and
//! full-duplex relay with half-close.
//!
//! `SocketFactory` is grounded directly on the retrieved `ztunnel`
//! proxy module's trait of the same name — a thin seam over
//! `TcpSocket` construction that sets `TCP_NODELAY` and exists mainly
//! so tests can substitute a fake without touching a real NIC.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;

use crate::error::{GatewayError, Result};

pub trait SocketFactory: Send + Sync {
    fn new_tcp_v4(&self) -> io::Result<TcpSocket>;
    fn new_tcp_v6(&self) -> io::Result<TcpSocket>;
}

#[derive(Clone, Copy, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn new_tcp_v4(&self) -> io::Result<TcpSocket> {
        let socket = TcpSocket::new_v4()?;
        socket.set_nodelay(true)?;
        Ok(socket)
    }

    fn new_tcp_v6(&self) -> io::Result<TcpSocket> {
        let socket = TcpSocket::new_v6()?;
        socket.set_nodelay(true)?;
        Ok(socket)
    }
}

/// Connect to `addr`, bounded by `timeout` (default 15s per the
/// supervisor's opening sequence).
pub async fn connect_with_timeout(
    factory: &dyn SocketFactory,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    let socket = if addr.is_ipv6() {
        factory.new_tcp_v6()?
    } else {
        factory.new_tcp_v4()?
    };
    tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| GatewayError::upstream_unavailable(format!("connect to {addr} timed out")))?
        .map_err(GatewayError::from)
}

/// Why a relay ended. `BothEof` is the clean case; every other variant
/// means at least one side was torn down before both directions
/// finished naturally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    BothEof,
    IdleTimeout,
    TotalTimeout,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
    pub end_reason: EndReason,
}

/// Relay bytes between `client` and `target` until both sides have
/// seen EOF, an idle timeout elapses with no traffic in either
/// direction, an optional total timeout elapses, or either side
/// errors. Each direction is an independent pump: on EOF it half-closes
/// the other side's write half and exits, matching the source's
/// two-pump relay model. Buffers are capped at 64 KiB per pump.
pub async fn relay_full_duplex<C>(
    client: C,
    target: TcpStream,
    idle_timeout: Duration,
    total_timeout: Option<Duration>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    const BUFFER_SIZE: usize = 64 * 1024;

    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = target.into_split();
    let cancel = Arc::new(Notify::new());

    let c2t = tokio::spawn(pump(client_read, target_write, idle_timeout, BUFFER_SIZE, Arc::clone(&cancel)));
    let t2c = tokio::spawn(pump(target_read, client_write, idle_timeout, BUFFER_SIZE, Arc::clone(&cancel)));

    let relay = async {
        let (c2t_result, t2c_result) = tokio::join!(c2t, t2c);
        (
            c2t_result.unwrap_or_else(|e| (0, Err(GatewayError::internal(e.to_string())))),
            t2c_result.unwrap_or_else(|e| (0, Err(GatewayError::internal(e.to_string())))),
        )
    };

    let ((sent, sent_err), (received, received_err)) = match total_timeout {
        Some(budget) => match tokio::time::timeout(budget, relay).await {
            Ok(result) => result,
            Err(_) => {
                cancel.notify_waiters();
                return RelayOutcome {
                    bytes_client_to_target: 0,
                    bytes_target_to_client: 0,
                    end_reason: EndReason::TotalTimeout,
                };
            }
        },
        None => relay.await,
    };

    let end_reason = match (sent_err, received_err) {
        (Err(e), _) | (_, Err(e)) if e.kind() == "resource-exhausted" && e.to_string().contains("idle") => {
            EndReason::IdleTimeout
        }
        (Err(e), _) => EndReason::Error(e.to_string()),
        (_, Err(e)) => EndReason::Error(e.to_string()),
        (Ok(()), Ok(())) => EndReason::BothEof,
    };

    RelayOutcome {
        bytes_client_to_target: sent,
        bytes_target_to_client: received,
        end_reason,
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, idle_timeout: Duration, buffer_size: usize, cancel: Arc<Notify>) -> (u64, Result<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let read_result = tokio::select! {
            biased;
            _ = cancel.notified() => {
                let _ = writer.shutdown().await;
                return (total, Ok(()));
            }
            result = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => result,
        };

        let n = match read_result {
            Err(_) => {
                cancel.notify_waiters();
                return (total, Err(GatewayError::resource_exhausted("pump idle timeout")));
            }
            Ok(Err(e)) => {
                cancel.notify_waiters();
                return (total, Err(GatewayError::from(e)));
            }
            Ok(Ok(0)) => {
                let _ = writer.shutdown().await;
                return (total, Ok(()));
            }
            Ok(Ok(n)) => n,
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            cancel.notify_waiters();
            return (total, Err(GatewayError::from(e)));
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connector);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn relay_conserves_bytes_in_both_directions() {
        let (client_side, mut target_remote) = duplex(4096);
        let (target_local, server_target) = loopback_pair().await;

        let relay_task = tokio::spawn(relay_full_duplex(client_side, target_local, Duration::from_secs(5), None));

        tokio::io::AsyncWriteExt::write_all(&mut target_remote, b"hello from client")
            .await
            .unwrap();
        let mut server_target = server_target;
        let mut echo_buf = vec![0u8; 64];
        let n = server_target.read(&mut echo_buf).await.unwrap();
        assert_eq!(&echo_buf[..n], b"hello from client");
        server_target.write_all(b"hello from target").await.unwrap();

        let mut client_echo = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut target_remote, &mut client_echo).await.unwrap();
        assert_eq!(&client_echo[..n], b"hello from target");

        drop(target_remote);
        drop(server_target);

        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.bytes_client_to_target, "hello from client".len() as u64);
        assert_eq!(outcome.bytes_target_to_client, "hello from target".len() as u64);
    }

    #[tokio::test]
    async fn idle_timeout_ends_relay_without_panicking() {
        let (client_side, _keep_alive) = duplex(4096);
        let (target_local, _server_target) = loopback_pair().await;
        let outcome = relay_full_duplex(client_side, target_local, Duration::from_millis(20), None).await;
        assert_eq!(outcome.end_reason, EndReason::IdleTimeout);
    }
}
