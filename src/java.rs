//! Java edition front door: accept, classify the handshake, answer status
//! pings from config, and wake the backend for real logins.

use crate::config::ServerConfig;
use crate::docker::ContainerCtl;
use crate::events::{Event, EventBus};
use crate::forward;
use crate::lifecycle::{ServerRuntime, ServerState};
use crate::mcproto::{self, NextState, ProtocolError};
use anyhow::{Context, Result};
use serde_json::json;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
const STATUS_DEADLINE: Duration = Duration::from_secs(5);
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    cfg: ServerConfig,
    runtime: Arc<ServerRuntime>,
    ctl: Arc<dyn ContainerCtl>,
    events: EventBus,
}

pub struct JavaListener {
    shared: Arc<Shared>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl JavaListener {
    pub async fn bind(
        cfg: ServerConfig,
        runtime: Arc<ServerRuntime>,
        ctl: Arc<dyn ContainerCtl>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.external_port))
            .await
            .with_context(|| {
                format!(
                    "cannot bind tcp port {} for server '{}'",
                    cfg.external_port, cfg.id
                )
            })?;
        Ok(JavaListener {
            shared: Arc::new(Shared {
                cfg,
                runtime,
                ctl,
                events,
            }),
            listener,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        log::info!(
            "Listening on tcp/{} for '{}'",
            self.shared.cfg.external_port,
            self.shared.cfg.id
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let shared = self.shared.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(shared, socket, peer, shutdown).await;
                        });
                    }
                    Err(err) => {
                        log::warn!("Accept failed on '{}': {}", self.shared.cfg.id, err);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        log::info!("Listener for '{}' shut down", self.shared.cfg.id);
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    mut socket: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let _ = socket.set_nodelay(true);
    log::debug!("Incoming TCP connection from {}", peer);

    let intent = match timeout(HANDSHAKE_DEADLINE, read_intent(&mut socket)).await {
        Ok(Ok(intent)) => intent,
        Ok(Err(err)) => {
            log::debug!("Dropping {}: {}", peer, err);
            return;
        }
        Err(_) => {
            log::debug!("Dropping {}: no handshake within deadline", peer);
            return;
        }
    };

    let outcome = match intent {
        Intent::Legacy => serve_legacy(&shared, socket).await,
        Intent::Status { protocol } => {
            match timeout(STATUS_DEADLINE, serve_status(&shared, socket, protocol)).await {
                Ok(result) => result,
                Err(_) => Ok(()),
            }
        }
        Intent::Login { username, replay } => {
            serve_login(&shared, socket, peer, username, replay, shutdown).await
        }
    };
    if let Err(err) = outcome {
        log::debug!("Connection from {} ended with error: {:#}", peer, err);
    }
}

enum Intent {
    Legacy,
    Status {
        protocol: i32,
    },
    Login {
        username: String,
        /// Exact handshake + login-start bytes, replayed to the backend.
        replay: Vec<u8>,
    },
}

async fn read_intent(socket: &mut TcpStream) -> Result<Intent, ProtocolError> {
    let mut first = [0u8; 1];
    let n = socket.peek(&mut first).await?;
    if n == 0 {
        return Err(ProtocolError::Truncated);
    }
    if first[0] == mcproto::LEGACY_PING_BYTE {
        return Ok(Intent::Legacy);
    }

    let mut replay = Vec::with_capacity(256);
    let body = mcproto::read_frame(socket, mcproto::MAX_CLIENT_FRAME, &mut replay).await?;
    let handshake = mcproto::parse_handshake(&body)?;
    match handshake.next_state {
        NextState::Status => Ok(Intent::Status {
            protocol: handshake.protocol,
        }),
        NextState::Login | NextState::Transfer => {
            let login_body =
                mcproto::read_frame(socket, mcproto::MAX_CLIENT_FRAME, &mut replay).await?;
            let username = mcproto::parse_login_start(&login_body)?;
            Ok(Intent::Login { username, replay })
        }
    }
}

fn status_json(cfg: &ServerConfig, state: ServerState, protocol: i32) -> serde_json::Value {
    let description = if state == ServerState::Running {
        cfg.motd.clone()
    } else {
        format!("{} — sleeping", cfg.motd)
    };
    let mut status = json!({
        "version": {
            "name": cfg.fake_version,
            // echo the client's protocol so the list entry never shows a mismatch
            "protocol": protocol,
        },
        "players": {
            "max": cfg.max_players,
            "online": 0,
            "sample": [],
        },
        "description": {
            "text": description,
        },
    });
    if let Some(favicon) = &cfg.favicon_b64 {
        status["favicon"] = json!(format!("data:image/png;base64,{favicon}"));
    }
    status
}

/// Serve the status exchange from config alone; the backend is never woken.
async fn serve_status(
    shared: &Shared,
    mut socket: TcpStream,
    protocol: i32,
) -> Result<()> {
    let response =
        status_json(&shared.cfg, shared.runtime.state(), protocol).to_string();
    loop {
        let mut raw = Vec::new();
        let body = match mcproto::read_frame(&mut socket, mcproto::MAX_CLIENT_FRAME, &mut raw).await
        {
            Ok(body) => body,
            Err(ProtocolError::Io(err))
                if matches!(
                    err.kind(),
                    ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
                ) =>
            {
                break;
            }
            Err(err) => return Err(err.into()),
        };
        let mut cur = std::io::Cursor::new(body.as_slice());
        match mcproto::get_varint(&mut cur)? {
            mcproto::STATUS_REQUEST_ID if body.len() == 1 => {
                socket
                    .write_all(&mcproto::status_response_packet(&response))
                    .await?;
            }
            mcproto::PING_ID => {
                // echo the 8-byte payload unchanged
                socket
                    .write_all(&mcproto::pong_packet(&body[1..]))
                    .await?;
                break;
            }
            other => {
                log::debug!("Unexpected status-phase packet {:#04x}", other);
                break;
            }
        }
    }
    socket.shutdown().await.ok();
    Ok(())
}

async fn serve_legacy(shared: &Shared, mut socket: TcpStream) -> Result<()> {
    let response = mcproto::legacy_ping_response(
        &shared.cfg.fake_version,
        &shared.cfg.motd,
        0,
        shared.cfg.max_players,
    );
    socket.write_all(&response).await?;
    socket.shutdown().await.ok();
    Ok(())
}

fn plausible_username(name: &str) -> bool {
    (2..=16).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn serve_login(
    shared: &Shared,
    mut socket: TcpStream,
    peer: SocketAddr,
    username: String,
    replay: Vec<u8>,
    shutdown: CancellationToken,
) -> Result<()> {
    let cfg = &shared.cfg;
    shared
        .events
        .emit(Event::login_attempt(&cfg.id, &username, peer.ip()));

    if !plausible_username(&username) {
        log::info!("Rejecting implausible username {:?} from {}", username, peer);
        shared
            .events
            .emit(Event::unauthorized(&cfg.id, &username, peer.ip()));
        let reason = json!({ "text": "Invalid username." }).to_string();
        return disconnect(socket, &reason).await;
    }

    log::info!(
        "Login attempt by '{}' from {} for '{}'",
        username,
        peer,
        cfg.id
    );
    if let Err(err) = shared
        .runtime
        .ensure_running(cfg, &shared.ctl, &shared.events)
        .await
    {
        log::warn!("Cannot bring up '{}' for {}: {:#}", cfg.id, peer, err);
        let reason = json!({
            "text": "Server failed to start, try again shortly",
            "color": "red",
        })
        .to_string();
        return disconnect(socket, &reason).await;
    }

    let backend = timeout(BACKEND_CONNECT_TIMEOUT, TcpStream::connect(cfg.internal_addr()))
        .await
        .map_err(|_| anyhow::anyhow!("backend connect timed out"))?
        .with_context(|| format!("cannot reach backend {}", cfg.internal_addr()))?;
    let _ = backend.set_nodelay(true);

    let mut backend = backend;
    backend.write_all(&replay).await?;

    forward::splice(socket, backend, shared.runtime.clone(), shutdown).await;
    Ok(())
}

async fn disconnect(mut socket: TcpStream, reason_json: &str) -> Result<()> {
    socket
        .write_all(&mcproto::login_disconnect_packet(reason_json))
        .await?;
    // let the client drain the packet before the socket goes away,
    // otherwise it shows a generic connection error instead of the message
    sleep(Duration::from_millis(50)).await;
    socket.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_plausibility() {
        assert!(plausible_username("alice"));
        assert!(plausible_username("Notch_99"));
        assert!(!plausible_username("a"));
        assert!(!plausible_username("way_too_long_for_minecraft"));
        assert!(!plausible_username("bad name"));
        assert!(!plausible_username("mötley"));
    }

    #[test]
    fn sleeping_suffix_tracks_state() {
        let cfg = ServerConfig {
            id: "s".into(),
            display_name: None,
            edition: crate::config::Edition::Java,
            container_name: "mc".into(),
            external_port: 0,
            internal_host: "127.0.0.1".into(),
            internal_port: 1,
            crossplay: false,
            bedrock_port: None,
            bedrock_internal_port: None,
            motd: "Hello".into(),
            fake_version: "1.20.5".into(),
            fake_protocol: 766,
            max_players: 20,
            favicon_b64: None,
            favicon_path: None,
            idle_timeout_s: 600,
            max_startup_wait_s: 60,
        };
        let asleep = status_json(&cfg, ServerState::Stopped, 765);
        assert_eq!(asleep["description"]["text"], "Hello — sleeping");
        assert_eq!(asleep["version"]["protocol"], 765);
        let awake = status_json(&cfg, ServerState::Running, 765);
        assert_eq!(awake["description"]["text"], "Hello");
    }
}
