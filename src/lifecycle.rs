//! Per-backend lifecycle: STOPPED -> STARTING -> RUNNING -> STOPPING and back,
//! with start deduplication and idle shutdown.
//!
//! The runtime lock is a plain mutex, never held across an await. The actual
//! container start runs on a detached task so a disconnecting client cannot
//! abort a start other players are waiting on; everyone (including the caller
//! that won the race) waits on the same completion channel.

use crate::config::ServerConfig;
use crate::docker::ContainerCtl;
use crate::events::{Event, EventBus};
use crate::probe;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{Duration, interval, sleep};
use tokio_util::sync::CancellationToken;

pub const IDLE_TICK: Duration = Duration::from_secs(10);
const START_ATTEMPTS: u32 = 3;
const START_RETRY_DELAY: Duration = Duration::from_millis(500);
const STOPPING_POLL: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Completion channel for one start attempt. None while in flight.
type StartSignal = watch::Receiver<Option<Result<(), String>>>;

struct RuntimeInner {
    state: ServerState,
    active_sessions: u32,
    last_activity: Instant,
    starting: Option<StartSignal>,
    start_error: Option<String>,
}

pub struct ServerRuntime {
    pub id: String,
    inner: Mutex<RuntimeInner>,
}

enum Plan {
    Ready,
    AwaitStop,
    Wait(StartSignal),
    Launch {
        tx: watch::Sender<Option<Result<(), String>>>,
        rx: StartSignal,
    },
}

impl ServerRuntime {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(ServerRuntime {
            id: id.into(),
            inner: Mutex::new(RuntimeInner {
                state: ServerState::Stopped,
                active_sessions: 0,
                last_activity: Instant::now(),
                starting: None,
                start_error: None,
            }),
        })
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().unwrap().state
    }

    pub fn active_sessions(&self) -> u32 {
        self.inner.lock().unwrap().active_sessions
    }

    pub fn start_error(&self) -> Option<String> {
        self.inner.lock().unwrap().start_error.clone()
    }

    pub fn inc_sessions(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_sessions += 1;
        inner.last_activity = Instant::now();
    }

    pub fn dec_sessions(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_sessions = inner.active_sessions.saturating_sub(1);
        inner.last_activity = Instant::now();
    }

    /// Forwarded traffic refreshes the idle clock.
    pub fn touch(&self) {
        self.inner.lock().unwrap().last_activity = Instant::now();
    }

    /// Bring the backend to RUNNING, joining an in-flight start if there is
    /// one. All waiters of the same attempt observe the same outcome; a
    /// failed attempt is not retried here, the next caller starts fresh.
    pub async fn ensure_running(
        self: &Arc<Self>,
        cfg: &ServerConfig,
        ctl: &Arc<dyn ContainerCtl>,
        events: &EventBus,
    ) -> Result<()> {
        loop {
            let plan = {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    ServerState::Running => Plan::Ready,
                    ServerState::Stopping => Plan::AwaitStop,
                    ServerState::Starting => match inner.starting.clone() {
                        Some(rx) => Plan::Wait(rx),
                        // start task died before publishing; recover
                        None => {
                            inner.state = ServerState::Stopped;
                            Plan::AwaitStop
                        }
                    },
                    ServerState::Stopped => {
                        let (tx, rx) = watch::channel(None);
                        inner.state = ServerState::Starting;
                        inner.starting = Some(rx.clone());
                        Plan::Launch { tx, rx }
                    }
                }
            };

            match plan {
                Plan::Ready => return Ok(()),
                Plan::AwaitStop => sleep(STOPPING_POLL).await,
                Plan::Wait(rx) => return await_start(rx).await,
                Plan::Launch { tx, rx } => {
                    events.emit(Event::server_starting(&self.id));
                    let runtime = self.clone();
                    let cfg = cfg.clone();
                    let ctl = ctl.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        let outcome = match runtime.run_start(&cfg, ctl.as_ref()).await {
                            Ok(()) => Ok(()),
                            Err(err) => Err(format!("{err:#}")),
                        };
                        {
                            let mut inner = runtime.inner.lock().unwrap();
                            match &outcome {
                                Ok(()) => {
                                    inner.state = ServerState::Running;
                                    inner.start_error = None;
                                    inner.last_activity = Instant::now();
                                }
                                Err(reason) => {
                                    inner.state = ServerState::Stopped;
                                    inner.start_error = Some(reason.clone());
                                }
                            }
                            inner.starting = None;
                        }
                        match &outcome {
                            Ok(()) => {
                                log::info!("Server '{}' is ready", runtime.id);
                                events.emit(Event::server_ready(&runtime.id));
                            }
                            Err(reason) => {
                                log::error!("Server '{}' failed to start: {}", runtime.id, reason);
                                events.emit(Event::server_start_failed(&runtime.id, reason));
                            }
                        }
                        let _ = tx.send(Some(outcome));
                    });
                    return await_start(rx).await;
                }
            }
        }
    }

    async fn run_start(&self, cfg: &ServerConfig, ctl: &dyn ContainerCtl) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match ctl.start(&cfg.container_name).await {
                Ok(()) => break,
                Err(err) if attempt < START_ATTEMPTS => {
                    log::warn!(
                        "Starting container {} failed (attempt {}): {:#}",
                        cfg.container_name,
                        attempt,
                        err
                    );
                    sleep(START_RETRY_DELAY).await;
                }
                Err(err) => return Err(err.context("container start failed")),
            }
        }
        probe::wait_ready(cfg, ctl).await
    }

    /// Atomically claim RUNNING -> STOPPING when the server has been idle
    /// longer than `idle_timeout`.
    fn begin_idle_stop(&self, idle_timeout: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ServerState::Running
            && inner.active_sessions == 0
            && inner.last_activity.elapsed() > idle_timeout
        {
            inner.state = ServerState::Stopping;
            true
        } else {
            false
        }
    }

    fn finish_stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ServerState::Stopped;
        inner.last_activity = Instant::now();
    }
}

async fn await_start(mut rx: StartSignal) -> Result<()> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome.map_err(|reason| anyhow!(reason));
        }
        if rx.changed().await.is_err() {
            return Err(anyhow!("start attempt abandoned"));
        }
    }
}

/// Process-lifetime map of runtimes, keyed by server id. Entries survive
/// config reloads so session counts and state carry across listener restarts.
#[derive(Default)]
pub struct Runtimes {
    map: Mutex<HashMap<String, Arc<ServerRuntime>>>,
}

impl Runtimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str) -> Arc<ServerRuntime> {
        self.map
            .lock()
            .unwrap()
            .entry(id.to_owned())
            .or_insert_with(|| ServerRuntime::new(id))
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<ServerRuntime>> {
        self.map.lock().unwrap().values().cloned().collect()
    }
}

/// Background sweep shutting down backends nobody plays on. One ticker serves
/// every runtime; a runtime in STOPPING blocks nothing else.
pub async fn idle_ticker(
    runtimes: Arc<Runtimes>,
    store: Arc<crate::config::ConfigStore>,
    ctl: Arc<dyn ContainerCtl>,
    events: EventBus,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(IDLE_TICK);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = store.snapshot();
        for runtime in runtimes.all() {
            let Some(cfg) = snapshot.servers.iter().find(|c| c.id == runtime.id) else {
                continue;
            };
            if !runtime.begin_idle_stop(cfg.idle_timeout()) {
                continue;
            }
            log::info!(
                "Server '{}' idle for over {}s, stopping container {}",
                runtime.id,
                cfg.idle_timeout_s,
                cfg.container_name
            );
            events.emit(Event::server_stopping(&runtime.id));
            if let Err(err) = ctl.stop(&cfg.container_name, STOP_GRACE).await {
                log::error!("Stopping container {} failed: {:#}", cfg.container_name, err);
                events.emit(Event::proxy_error(
                    Some(&runtime.id),
                    format!("container stop failed: {err:#}"),
                ));
            }
            // back to STOPPED either way so the next login can retry
            runtime.finish_stop();
            events.emit(Event::server_stopped(&runtime.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Edition;
    use crate::docker::{ContainerHealth, ContainerState, ContainerStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingCtl {
        start_calls: AtomicU32,
        in_flight: AtomicU32,
        overlapped: AtomicBool,
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl ContainerCtl for CountingCtl {
        async fn start(&self, _name: &str) -> Result<()> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                Err(anyhow!("daemon unreachable"))
            } else {
                Ok(())
            }
        }

        async fn stop(&self, _name: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn state(&self, _name: &str) -> Result<ContainerState> {
            Ok(ContainerState {
                status: ContainerStatus::Running,
                health: ContainerHealth::Healthy,
            })
        }

        async fn exec(&self, _name: &str, _argv: &[String]) -> Result<String> {
            Ok(String::new())
        }
    }

    fn cfg() -> ServerConfig {
        ServerConfig {
            id: "lifecycle".into(),
            display_name: None,
            edition: Edition::Java,
            container_name: "mc-lifecycle".into(),
            external_port: 25565,
            internal_host: "127.0.0.1".into(),
            internal_port: 1,
            crossplay: false,
            bedrock_port: None,
            bedrock_internal_port: None,
            motd: "test".into(),
            fake_version: "1.20.5".into(),
            fake_protocol: 766,
            max_players: 20,
            favicon_b64: None,
            favicon_path: None,
            idle_timeout_s: 600,
            max_startup_wait_s: 10,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_calls_share_one_start() {
        let runtime = ServerRuntime::new("lifecycle");
        let counting = Arc::new(CountingCtl::default());
        let ctl: Arc<dyn ContainerCtl> = counting.clone();
        let events = EventBus::new();
        let cfg = cfg();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let runtime = runtime.clone();
            let ctl = ctl.clone();
            let events = events.clone();
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                runtime.ensure_running(&cfg, &ctl, &events).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(counting.start_calls.load(Ordering::SeqCst), 1);
        assert!(!counting.overlapped.load(Ordering::SeqCst));
        assert_eq!(runtime.state(), ServerState::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_is_shared_and_state_returns_to_stopped() {
        let runtime = ServerRuntime::new("lifecycle");
        let counting = Arc::new(CountingCtl::default());
        counting.fail_start.store(true, Ordering::SeqCst);
        let ctl: Arc<dyn ContainerCtl> = counting.clone();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cfg = cfg();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let runtime = runtime.clone();
            let ctl = ctl.clone();
            let events = events.clone();
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                runtime.ensure_running(&cfg, &ctl, &events).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }

        // one attempt = bounded retries of the runtime call, not one per waiter
        assert_eq!(counting.start_calls.load(Ordering::SeqCst), START_ATTEMPTS);
        assert_eq!(runtime.state(), ServerState::Stopped);
        assert!(runtime.start_error().is_some());

        let mut saw_failure_event = false;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "server.start_failed" {
                saw_failure_event = true;
            }
        }
        assert!(saw_failure_event);
    }

    #[tokio::test]
    async fn session_counters_gate_idle_stop() {
        let runtime = ServerRuntime::new("lifecycle");
        {
            let mut inner = runtime.inner.lock().unwrap();
            inner.state = ServerState::Running;
            inner.last_activity = Instant::now() - Duration::from_secs(120);
        }
        runtime.inc_sessions();
        // a live session blocks the reap even though last_activity is stale
        {
            let mut inner = runtime.inner.lock().unwrap();
            inner.last_activity = Instant::now() - Duration::from_secs(120);
        }
        assert!(!runtime.begin_idle_stop(Duration::from_secs(60)));
        runtime.dec_sessions();
        {
            let mut inner = runtime.inner.lock().unwrap();
            inner.last_activity = Instant::now() - Duration::from_secs(120);
        }
        assert!(runtime.begin_idle_stop(Duration::from_secs(60)));
        assert_eq!(runtime.state(), ServerState::Stopping);
        runtime.finish_stop();
        assert_eq!(runtime.state(), ServerState::Stopped);
    }
}
