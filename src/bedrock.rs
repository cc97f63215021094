//! Bedrock edition front door: one UDP socket per server, RakNet offline
//! message classification, and a session table keyed by client address.

use crate::config::{Edition, ServerConfig};
use crate::docker::ContainerCtl;
use crate::events::EventBus;
use crate::forward::{self, UdpSession};
use crate::lifecycle::{ServerRuntime, ServerState};
use crate::raknet;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::time::{Duration, interval, timeout};
use tokio_util::sync::CancellationToken;

/// Budget for relaying a ping to a running backend.
const PING_RELAY_TIMEOUT: Duration = Duration::from_secs(1);

struct Shared {
    cfg: ServerConfig,
    runtime: Arc<ServerRuntime>,
    ctl: Arc<dyn ContainerCtl>,
    events: EventBus,
    socket: Arc<UdpSocket>,
    /// Target for relayed datagrams, the backend's RakNet port.
    backend_addr: String,
    /// Port advertised in synthetic pongs.
    public_port: u16,
    server_guid: i64,
    sessions: Mutex<HashMap<SocketAddr, Arc<UdpSession>>>,
    shutdown: CancellationToken,
}

pub struct BedrockListener {
    shared: Arc<Shared>,
    session_idle: Duration,
}

impl BedrockListener {
    /// Binds the public UDP port: `external_port` for a native Bedrock
    /// server, `bedrock_port` for a Java server with crossplay.
    pub async fn bind(
        cfg: ServerConfig,
        runtime: Arc<ServerRuntime>,
        ctl: Arc<dyn ContainerCtl>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let port = match cfg.edition {
            Edition::Bedrock => cfg.external_port,
            Edition::Java => cfg
                .bedrock_port
                .with_context(|| format!("server '{}' has no bedrock_port", cfg.id))?,
        };
        let backend_addr = cfg
            .bedrock_internal_addr()
            .with_context(|| format!("server '{}' has no bedrock backend address", cfg.id))?;
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("cannot bind udp port {} for server '{}'", port, cfg.id))?;
        let public_port = socket.local_addr()?.port();
        Ok(BedrockListener {
            shared: Arc::new(Shared {
                cfg,
                runtime,
                ctl,
                events,
                socket: Arc::new(socket),
                backend_addr,
                public_port,
                server_guid: rand::random(),
                sessions: Mutex::new(HashMap::new()),
                shutdown,
            }),
            session_idle: forward::UDP_SESSION_IDLE,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Shorten the session expiry, for tests that cannot wait a minute.
    pub fn set_session_idle(&mut self, idle: Duration) {
        self.session_idle = idle;
    }

    pub async fn run(self) {
        let shared = self.shared;
        log::info!(
            "Listening on udp/{} for '{}'",
            shared.public_port,
            shared.cfg.id
        );
        let sweep_period = (self.session_idle / 4).max(Duration::from_millis(500));
        let mut sweeper = interval(sweep_period);
        let mut buf = vec![0u8; raknet::MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = sweeper.tick() => shared.sweep_sessions(self.session_idle),
                received = shared.socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => shared.clone().handle_datagram(peer, &buf[..n]).await,
                    Err(err) => log::warn!(
                        "UDP receive failed on '{}': {}",
                        shared.cfg.id,
                        err
                    ),
                },
            }
        }
        for session in shared.drain_sessions() {
            session.close();
        }
        log::info!("Listener for '{}' shut down", shared.cfg.id);
    }
}

impl Shared {
    fn session(&self, peer: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.lock().unwrap().get(peer).cloned()
    }

    fn drain_sessions(&self) -> Vec<Arc<UdpSession>> {
        self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect()
    }

    /// Snapshot victims under the lock, close them outside it.
    fn sweep_sessions(&self, idle: Duration) {
        let victims: Vec<Arc<UdpSession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            let expired: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, s)| s.is_closed() || s.idle_for() > idle)
                .map(|(addr, _)| *addr)
                .collect();
            expired
                .into_iter()
                .filter_map(|addr| sessions.remove(&addr))
                .collect()
        };
        for session in victims {
            log::debug!(
                "Expiring Bedrock session {} on '{}'",
                session.client_addr,
                self.cfg.id
            );
            session.close();
        }
    }

    async fn handle_datagram(self: Arc<Self>, peer: SocketAddr, data: &[u8]) {
        let Some(&first) = data.first() else {
            return;
        };
        match first {
            raknet::UNCONNECTED_PING | raknet::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let Some(ping) = raknet::UnconnectedPing::from_bytes(data) else {
                    return;
                };
                if self.runtime.state() == ServerState::Running {
                    let this = self.clone();
                    let data = data.to_vec();
                    tokio::spawn(async move { this.relay_ping(peer, ping, &data).await });
                } else {
                    self.send_sleeping_pong(peer, ping).await;
                }
            }
            raknet::OPEN_CONNECTION_REQUEST_1 => {
                if let Some(session) = self.session(&peer)
                    && !session.is_closed()
                {
                    if let Err(err) = session.forward_to_backend(data).await {
                        log::debug!("Forward from {} failed: {}", peer, err);
                    }
                    return;
                }
                // wake path; runs detached so a slow start never blocks the
                // receive loop, and retransmits just join the same start
                let this = self.clone();
                let data = data.to_vec();
                tokio::spawn(async move {
                    if let Err(err) = this.wake_and_open(peer, &data).await {
                        log::warn!(
                            "Cannot open Bedrock session for {} on '{}': {:#}",
                            peer,
                            this.cfg.id,
                            err
                        );
                    }
                });
            }
            raknet::OPEN_CONNECTION_REQUEST_2 => {
                if let Some(session) = self.session(&peer) {
                    session.count_once();
                    if let Err(err) = session.forward_to_backend(data).await {
                        log::debug!("Forward from {} failed: {}", peer, err);
                    }
                }
            }
            _ => {
                if let Some(session) = self.session(&peer) {
                    if let Err(err) = session.forward_to_backend(data).await {
                        log::debug!("Forward from {} failed: {}", peer, err);
                    }
                }
                // no session: stray datagram, drop
            }
        }
    }

    /// Status path while the backend runs: relay through a throwaway socket
    /// and rewrite the advertised ports to ours.
    async fn relay_ping(&self, peer: SocketAddr, ping: raknet::UnconnectedPing, data: &[u8]) {
        let relayed = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
            socket.connect(&self.backend_addr).await.ok()?;
            socket.send(data).await.ok()?;
            let mut buf = vec![0u8; raknet::MAX_DATAGRAM];
            let n = socket.recv(&mut buf).await.ok()?;
            raknet::UnconnectedPong::from_bytes(&buf[..n])
        };
        match timeout(PING_RELAY_TIMEOUT, relayed).await {
            Ok(Some(mut pong)) => {
                if let Some(mut motd) = raknet::Motd::decode_payload(&pong.payload) {
                    motd.port = self.public_port;
                    pong.payload = motd.encode_payload();
                }
                if let Err(err) = self.socket.send_to(&pong.to_bytes(), peer).await {
                    log::debug!("Pong to {} failed: {}", peer, err);
                }
            }
            _ => {
                // backend did not answer; advertise from config instead
                self.send_sleeping_pong(peer, ping).await;
            }
        }
    }

    async fn send_sleeping_pong(&self, peer: SocketAddr, ping: raknet::UnconnectedPing) {
        let motd = raknet::Motd {
            motd: format!("{} — sleeping", self.cfg.motd),
            protocol: self.cfg.fake_protocol,
            version: self.cfg.fake_version.clone(),
            online_players: 0,
            max_players: self.cfg.max_players,
            server_guid: self.server_guid,
            level_name: self.cfg.display_name().to_owned(),
            gamemode: "Survival".to_owned(),
            port: self.public_port,
        };
        let pong = raknet::UnconnectedPong {
            time: ping.time,
            server_guid: self.server_guid,
            payload: motd.encode_payload(),
        };
        if let Err(err) = self.socket.send_to(&pong.to_bytes(), peer).await {
            log::debug!("Pong to {} failed: {}", peer, err);
        }
    }

    async fn wake_and_open(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        self.runtime
            .ensure_running(&self.cfg, &self.ctl, &self.events)
            .await?;

        let session = match self.session(&peer) {
            Some(existing) if !existing.is_closed() => existing,
            _ => {
                let fresh = UdpSession::open(
                    peer,
                    &self.backend_addr,
                    self.socket.clone(),
                    self.runtime.clone(),
                    &self.shutdown,
                )
                .await
                .context("cannot open backend socket")?;
                let mut sessions = self.sessions.lock().unwrap();
                // a concurrent retransmit may have won the race
                let winner = sessions.get(&peer).filter(|s| !s.is_closed()).cloned();
                match winner {
                    Some(existing) => {
                        drop(sessions);
                        fresh.close();
                        existing
                    }
                    None => {
                        sessions.insert(peer, fresh.clone());
                        drop(sessions);
                        log::info!("New Bedrock session {} on '{}'", peer, self.cfg.id);
                        fresh
                    }
                }
            }
        };
        session.forward_to_backend(data).await?;
        Ok(())
    }
}
