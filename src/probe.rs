//! Backend readiness probing. A freshly started Minecraft container can take
//! tens of seconds before it accepts game traffic; this module decides when
//! it is safe to hand players over.

use crate::config::{Edition, ServerConfig};
use crate::docker::{ContainerCtl, ContainerHealth};
use crate::{mcproto, raknet};
use anyhow::{Result, bail};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Duration, Instant, sleep, timeout};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Wait until the backend accepts game traffic, or until
/// `max_startup_wait_s` has elapsed. Each round first trusts a healthy
/// container healthcheck, then falls back to poking the game port itself.
pub async fn wait_ready(cfg: &ServerConfig, ctl: &dyn ContainerCtl) -> Result<()> {
    let deadline = Instant::now() + cfg.max_startup_wait();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if let Ok(state) = ctl.state(&cfg.container_name).await
            && state.health == ContainerHealth::Healthy
        {
            log::debug!("Container {} reports healthy", cfg.container_name);
            return Ok(());
        }

        let attempt_budget = backoff;
        let ready = match cfg.edition {
            Edition::Java => {
                probe_java(
                    &cfg.internal_host,
                    cfg.internal_port,
                    cfg.fake_protocol,
                    attempt_budget,
                )
                .await
            }
            Edition::Bedrock => probe_bedrock(&cfg.internal_addr(), attempt_budget).await,
        };
        if ready {
            return Ok(());
        }

        if Instant::now() + backoff >= deadline {
            bail!(
                "backend for '{}' not ready within {}s",
                cfg.id,
                cfg.max_startup_wait_s
            );
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Minimal server list ping: handshake with next-state 1, status request,
/// and any well-formed Status Response counts as ready.
async fn probe_java(host: &str, port: u16, protocol: i32, budget: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port)).await.ok()?;
        stream
            .write_all(&mcproto::client_handshake_packet(protocol, host, port, 1))
            .await
            .ok()?;
        stream
            .write_all(&mcproto::status_request_packet())
            .await
            .ok()?;
        let mut raw = Vec::new();
        let body = mcproto::read_frame(&mut stream, mcproto::MAX_STATUS_FRAME, &mut raw)
            .await
            .ok()?;
        mcproto::parse_status_response(&body).ok()?;
        Some(())
    };
    matches!(timeout(budget, attempt).await, Ok(Some(())))
}

/// RakNet unconnected ping; a pong carrying the offline-message magic means
/// the backend is up.
async fn probe_bedrock(addr: &str, budget: Duration) -> bool {
    let attempt = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(addr).await.ok()?;
        let ping = raknet::UnconnectedPing {
            time: unix_millis(),
            client_guid: rand::random(),
        };
        socket.send(&ping.to_bytes()).await.ok()?;
        let mut buf = [0u8; raknet::MAX_DATAGRAM];
        let len = socket.recv(&mut buf).await.ok()?;
        raknet::UnconnectedPong::from_bytes(&buf[..len])?;
        Some(())
    };
    matches!(timeout(budget, attempt).await, Ok(Some(())))
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerState, ContainerStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct HealthAfter {
        calls: AtomicU32,
        healthy_from: u32,
    }

    #[async_trait]
    impl ContainerCtl for HealthAfter {
        async fn start(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _name: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn state(&self, _name: &str) -> Result<ContainerState> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let health = if call >= self.healthy_from {
                ContainerHealth::Healthy
            } else {
                ContainerHealth::Starting
            };
            Ok(ContainerState {
                status: ContainerStatus::Running,
                health,
            })
        }

        async fn exec(&self, _name: &str, _argv: &[String]) -> Result<String> {
            Ok(String::new())
        }
    }

    fn probe_cfg() -> ServerConfig {
        ServerConfig {
            id: "probe".into(),
            display_name: None,
            edition: Edition::Java,
            container_name: "mc-probe".into(),
            external_port: 25565,
            internal_host: "127.0.0.1".into(),
            // reserved port nothing listens on in the test environment
            internal_port: 1,
            crossplay: false,
            bedrock_port: None,
            bedrock_internal_port: None,
            motd: "probe".into(),
            fake_version: "1.20.5".into(),
            fake_protocol: 766,
            max_players: 20,
            favicon_b64: None,
            favicon_path: None,
            idle_timeout_s: 600,
            max_startup_wait_s: 30,
        }
    }

    #[tokio::test]
    async fn accepts_once_healthcheck_passes() {
        let ctl = HealthAfter {
            calls: AtomicU32::new(0),
            healthy_from: 3,
        };
        let cfg = probe_cfg();
        wait_ready(&cfg, &ctl).await.unwrap();
        assert_eq!(ctl.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_backend_never_answers() {
        let ctl = HealthAfter {
            calls: AtomicU32::new(0),
            healthy_from: u32::MAX,
        };
        let mut cfg = probe_cfg();
        cfg.max_startup_wait_s = 1;
        assert!(wait_ready(&cfg, &ctl).await.is_err());
    }
}
