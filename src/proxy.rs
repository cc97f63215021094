//! Wires the pieces together: one listener set per configured server, the
//! idle ticker, the event log, and periodic config reconciliation.

use crate::bedrock::BedrockListener;
use crate::config::{ConfigStore, Edition, ServerConfig};
use crate::docker::ContainerCtl;
use crate::events::{self, Event, EventBus};
use crate::java::JavaListener;
use crate::lifecycle::{self, Runtimes};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;

const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

struct ListenerSet {
    cfg: ServerConfig,
    cancel: CancellationToken,
}

/// Run the proxy until `shutdown` fires. Binding failures are fatal on the
/// initial pass and soft (logged, retried on the next reconcile) afterwards,
/// so a broken config edit cannot take the whole proxy down.
pub async fn run(
    store: Arc<ConfigStore>,
    ctl: Arc<dyn ContainerCtl>,
    events: EventBus,
    shutdown: CancellationToken,
) -> Result<()> {
    let runtimes = Arc::new(Runtimes::new());
    events::spawn_log_writer(&events, shutdown.child_token());
    tokio::spawn(lifecycle::idle_ticker(
        runtimes.clone(),
        store.clone(),
        ctl.clone(),
        events.clone(),
        shutdown.child_token(),
    ));

    let mut active: HashMap<String, ListenerSet> = HashMap::new();
    reconcile(
        &mut active,
        &store,
        &runtimes,
        &ctl,
        &events,
        &shutdown,
        true,
    )
    .await?;

    let mut ticker = interval(RELOAD_INTERVAL);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.reload() {
            Ok(true) => log::info!("Configuration changed, reconciling listeners"),
            Ok(false) => {}
            Err(err) => {
                log::warn!("Config reload failed, keeping previous: {:#}", err);
                continue;
            }
        }
        reconcile(
            &mut active,
            &store,
            &runtimes,
            &ctl,
            &events,
            &shutdown,
            false,
        )
        .await?;
    }

    for (_, set) in active.drain() {
        set.cancel.cancel();
    }
    log::info!("Proxy shut down; backends left running");
    Ok(())
}

async fn reconcile(
    active: &mut HashMap<String, ListenerSet>,
    store: &Arc<ConfigStore>,
    runtimes: &Arc<Runtimes>,
    ctl: &Arc<dyn ContainerCtl>,
    events: &EventBus,
    shutdown: &CancellationToken,
    strict: bool,
) -> Result<()> {
    let snapshot = store.snapshot();

    active.retain(|id, set| {
        match snapshot.servers.iter().find(|cfg| &cfg.id == id) {
            Some(cfg) if *cfg == set.cfg => true,
            _ => {
                log::info!("Tearing down listeners for '{}'", id);
                set.cancel.cancel();
                false
            }
        }
    });

    for cfg in &snapshot.servers {
        if active.contains_key(&cfg.id) {
            continue;
        }
        let cancel = shutdown.child_token();
        let runtime = runtimes.get_or_create(&cfg.id);
        match spawn_listeners(cfg, runtime, ctl, events, cancel.clone()).await {
            Ok(()) => {
                active.insert(
                    cfg.id.clone(),
                    ListenerSet {
                        cfg: cfg.clone(),
                        cancel,
                    },
                );
            }
            Err(err) if strict => {
                cancel.cancel();
                return Err(err);
            }
            Err(err) => {
                log::error!("Cannot bind listeners for '{}': {:#}", cfg.id, err);
                events.emit(Event::proxy_error(
                    Some(&cfg.id),
                    format!("listener bind failed: {err:#}"),
                ));
                cancel.cancel();
            }
        }
    }
    Ok(())
}

async fn spawn_listeners(
    cfg: &ServerConfig,
    runtime: Arc<crate::lifecycle::ServerRuntime>,
    ctl: &Arc<dyn ContainerCtl>,
    events: &EventBus,
    cancel: CancellationToken,
) -> Result<()> {
    match cfg.edition {
        Edition::Java => {
            let listener = JavaListener::bind(
                cfg.clone(),
                runtime.clone(),
                ctl.clone(),
                events.clone(),
                cancel.clone(),
            )
            .await?;
            tokio::spawn(listener.run());
            if cfg.crossplay {
                let bedrock = BedrockListener::bind(
                    cfg.clone(),
                    runtime,
                    ctl.clone(),
                    events.clone(),
                    cancel,
                )
                .await?;
                tokio::spawn(bedrock.run());
            }
        }
        Edition::Bedrock => {
            let listener = BedrockListener::bind(
                cfg.clone(),
                runtime,
                ctl.clone(),
                events.clone(),
                cancel,
            )
            .await?;
            tokio::spawn(listener.run());
        }
    }
    Ok(())
}
