//! Byte forwarding between accepted clients and their backend, plus the
//! per-client UDP session used on the Bedrock path.

use crate::lifecycle::ServerRuntime;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// A Java client that stops producing keepalives for this long is gone.
pub const TCP_SESSION_IDLE: Duration = Duration::from_secs(300);
/// Bedrock sessions are connectionless; silence is the only close signal.
pub const UDP_SESSION_IDLE: Duration = Duration::from_secs(60);

const COPY_BUF: usize = 8 * 1024;

/// Holds the runtime's session count for exactly the guard's lifetime, so
/// the decrement runs once on every exit path.
pub struct SessionGuard {
    runtime: Arc<ServerRuntime>,
}

impl SessionGuard {
    pub fn new(runtime: Arc<ServerRuntime>) -> Self {
        runtime.inc_sessions();
        SessionGuard { runtime }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.runtime.dec_sessions();
    }
}

/// Splice bytes both ways until either side closes, the shared idle deadline
/// expires, or shutdown is requested. Consumes and closes both sockets.
pub async fn splice(
    client: TcpStream,
    backend: TcpStream,
    runtime: Arc<ServerRuntime>,
    shutdown: CancellationToken,
) {
    let _guard = SessionGuard::new(runtime.clone());
    let deadline = Arc::new(Mutex::new(Instant::now() + TCP_SESSION_IDLE));
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    tokio::select! {
        _ = shutdown.cancelled() => {
            log::debug!("Session for '{}' cancelled by shutdown", runtime.id);
        }
        _ = idle_watch(deadline.clone()) => {
            log::debug!("Session for '{}' idle, closing", runtime.id);
        }
        result = pump(client_read, backend_write, runtime.clone(), deadline.clone()) => {
            log_pump_result("client", &runtime.id, result);
        }
        result = pump(backend_read, client_write, runtime.clone(), deadline.clone()) => {
            log_pump_result("backend", &runtime.id, result);
        }
    }
    // all halves drop here, closing both sockets
}

fn log_pump_result(side: &str, id: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => log::debug!("Session for '{}': {} side closed", id, side),
        Err(err) => log::debug!("Session for '{}': {} side error: {}", id, side, err),
    }
}

async fn pump(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    runtime: Arc<ServerRuntime>,
    deadline: Arc<Mutex<Instant>>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            let _ = write.shutdown().await;
            return Ok(());
        }
        write.write_all(&buf[..n]).await?;
        runtime.touch();
        *deadline.lock().unwrap() = Instant::now() + TCP_SESSION_IDLE;
    }
}

/// Resolves when the shared deadline passes without being pushed forward.
async fn idle_watch(deadline: Arc<Mutex<Instant>>) {
    loop {
        let at = *deadline.lock().unwrap();
        if Instant::now() >= at {
            return;
        }
        sleep_until(at).await;
    }
}

/// One Bedrock client. The dedicated backend socket gives the backend a
/// unique peer per client, so the kernel's 4-tuple routing attributes reply
/// datagrams without any parsing on our side.
pub struct UdpSession {
    pub client_addr: SocketAddr,
    backend: Arc<UdpSocket>,
    runtime: Arc<ServerRuntime>,
    last_activity: Mutex<Instant>,
    counted: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl UdpSession {
    /// Bind the backend-facing socket and spawn the backend -> client relay.
    pub async fn open(
        client_addr: SocketAddr,
        backend_addr: &str,
        listener: Arc<UdpSocket>,
        runtime: Arc<ServerRuntime>,
        shutdown: &CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let backend = UdpSocket::bind("0.0.0.0:0").await?;
        backend.connect(backend_addr).await?;
        let session = Arc::new(UdpSession {
            client_addr,
            backend: Arc::new(backend),
            runtime,
            last_activity: Mutex::new(Instant::now()),
            counted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: shutdown.child_token(),
        });
        session.clone().spawn_backend_reader(listener);
        Ok(session)
    }

    fn spawn_backend_reader(self: Arc<Self>, listener: Arc<UdpSocket>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::raknet::MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    received = self.backend.recv(&mut buf) => match received {
                        Ok(n) => {
                            if listener.send_to(&buf[..n], self.client_addr).await.is_err() {
                                break;
                            }
                            self.touch();
                            self.runtime.touch();
                        }
                        Err(err) => {
                            log::debug!(
                                "Backend socket for {} closed: {}",
                                self.client_addr,
                                err
                            );
                            break;
                        }
                    },
                }
            }
            self.close();
        });
    }

    pub async fn forward_to_backend(&self, datagram: &[u8]) -> std::io::Result<()> {
        self.backend.send(datagram).await?;
        self.touch();
        self.runtime.touch();
        Ok(())
    }

    /// Count this session against the runtime, at most once; retransmitted
    /// connection requests are a no-op.
    pub fn count_once(&self) {
        if !self.counted.swap(true, Ordering::SeqCst) {
            self.runtime.inc_sessions();
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: stops the relay and releases the session count.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if self.counted.load(Ordering::SeqCst) {
            self.runtime.dec_sessions();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn splice_bridges_both_directions_and_counts_once() {
        let runtime = ServerRuntime::new("splice");
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();

        let runtime_clone = runtime.clone();
        let bridge = tokio::spawn(async move {
            let (client_side, _) = front_listener.accept().await.unwrap();
            let backend_side = TcpStream::connect(backend_addr).await.unwrap();
            splice(
                client_side,
                backend_side,
                runtime_clone,
                CancellationToken::new(),
            )
            .await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (mut backend, _) = backend_listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(runtime.active_sessions(), 1);

        drop(client);
        bridge.await.unwrap();
        assert_eq!(runtime.active_sessions(), 0);
    }

    #[tokio::test]
    async fn udp_session_counts_once_and_releases_on_close() {
        let runtime = ServerRuntime::new("udp");
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();

        let session = UdpSession::open(
            "127.0.0.1:40000".parse().unwrap(),
            &backend_addr,
            listener,
            runtime.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        session.count_once();
        session.count_once();
        assert_eq!(runtime.active_sessions(), 1);

        session.forward_to_backend(b"\x05hello").await.unwrap();
        let mut buf = [0u8; 32];
        let (n, _) = backend.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x05hello");

        session.close();
        session.close();
        assert_eq!(runtime.active_sessions(), 0);
        assert!(session.is_closed());
    }
}
