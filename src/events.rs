//! Lifecycle and player events, fanned out to subscribers over a bounded
//! broadcast buffer. Emission never blocks the forwarding paths; a slow
//! subscriber skips the oldest entries and learns how many it missed.

use serde::Serialize;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "server.starting")]
    ServerStarting,
    #[serde(rename = "server.ready")]
    ServerReady,
    #[serde(rename = "server.start_failed")]
    ServerStartFailed { reason: String },
    #[serde(rename = "server.stopping")]
    ServerStopping,
    #[serde(rename = "server.stopped")]
    ServerStopped,
    #[serde(rename = "player.login_attempt")]
    PlayerLoginAttempt { username: String, ip: IpAddr },
    #[serde(rename = "player.unauthorized")]
    PlayerUnauthorized { username: String, ip: IpAddr },
    #[serde(rename = "proxy.error")]
    ProxyError { detail: String },
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    fn new(server_id: Option<&str>, kind: EventKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Event {
            server_id: server_id.map(str::to_owned),
            timestamp_ms,
            kind,
        }
    }

    pub fn server_starting(id: &str) -> Self {
        Self::new(Some(id), EventKind::ServerStarting)
    }

    pub fn server_ready(id: &str) -> Self {
        Self::new(Some(id), EventKind::ServerReady)
    }

    pub fn server_start_failed(id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            EventKind::ServerStartFailed {
                reason: reason.into(),
            },
        )
    }

    pub fn server_stopping(id: &str) -> Self {
        Self::new(Some(id), EventKind::ServerStopping)
    }

    pub fn server_stopped(id: &str) -> Self {
        Self::new(Some(id), EventKind::ServerStopped)
    }

    pub fn login_attempt(id: &str, username: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(
            Some(id),
            EventKind::PlayerLoginAttempt {
                username: username.into(),
                ip,
            },
        )
    }

    pub fn unauthorized(id: &str, username: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(
            Some(id),
            EventKind::PlayerUnauthorized {
                username: username.into(),
                ip,
            },
        )
    }

    pub fn proxy_error(id: Option<&str>, detail: impl Into<String>) -> Self {
        Self::new(
            id,
            EventKind::ProxyError {
                detail: detail.into(),
            },
        )
    }

    /// Stable name, the contract with external subscribers.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::ServerStarting => "server.starting",
            EventKind::ServerReady => "server.ready",
            EventKind::ServerStartFailed { .. } => "server.start_failed",
            EventKind::ServerStopping => "server.stopping",
            EventKind::ServerStopped => "server.stopped",
            EventKind::PlayerLoginAttempt { .. } => "player.login_attempt",
            EventKind::PlayerUnauthorized { .. } => "player.unauthorized",
            EventKind::ProxyError { .. } => "proxy.error",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        EventBus { tx }
    }

    /// Best-effort: events with no subscribers are dropped silently.
    pub fn emit(&self, event: Event) {
        log::debug!(
            "event {} server={}",
            event.name(),
            event.server_id.as_deref().unwrap_or("-")
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in subscriber: one JSON line per event on the usage log.
pub fn spawn_log_writer(bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut dropped: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => log::info!(target: "containap::events", "{}", line),
                        Err(err) => log::warn!("cannot serialize event: {}", err),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped += n;
                        log::warn!("event log fell behind, {} events dropped so far", dropped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::server_starting("survival"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "server.starting");
        assert_eq!(event.server_id.as_deref(), Some("survival"));
    }

    #[test]
    fn serialized_form_uses_stable_names() {
        let event = Event::login_attempt("survival", "alice", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["event"], "player.login_attempt");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["server_id"], "survival");
        assert!(json["timestamp_ms"].is_u64());
    }

    #[tokio::test]
    async fn overflow_reports_lag() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..(EVENT_BUFFER + 10) {
            bus.emit(Event::server_ready("s"));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
