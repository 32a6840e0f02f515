//! Guest agent
//!
//! Long-polls the metadata service and drives the reconcilers on every
//! snapshot change: forwarded IP addresses, OS accounts, the failover
//! cluster health probe, and diagnostics collection. A separate
//! long-lived listener answers snapshot quiesce requests. Runs in the
//! foreground until interrupted; the `noservice` argument is accepted
//! for parity with service-managed installs.

mod accounts;
mod addresses;
mod diagnostics;
#[cfg(unix)]
mod linux_accounts;
mod manager;
mod net;
mod snapshot;
mod users;
mod wsfc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use guest_core::config::DEFAULT_CONFIG_PATH;
use guest_core::metadata::{MetadataWatcher, Snapshot};
use guest_core::store::KeyStore;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::net::{NetOps, SystemNet};
use crate::snapshot::SnapshotListener;
use crate::wsfc::AgentState;

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The only recognized argument keeps the agent in the foreground;
    // that is also the default, so it changes nothing here.
    let _ = std::env::args().any(|arg| arg == "noservice");

    info!("guest agent started (version {})", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let store = Arc::new(KeyStore::open_default());
    let net: Arc<dyn NetOps> = Arc::new(SystemNet);
    let latest = Arc::new(RwLock::new(Arc::new(Snapshot::default())));

    let listener = Arc::new(SnapshotListener::new(
        DEFAULT_CONFIG_PATH.into(),
        latest.clone(),
    ));
    let listener_done = tokio::spawn(listener.run(shutdown_rx.clone()));

    watch_loop(&store, &net, &latest, shutdown_rx).await;

    // Leave things tidy: the health probe owns a listener and in-flight
    // handlers that deserve a drain.
    let probe = wsfc::instance();
    if probe.state() == AgentState::Running {
        if let Err(err) = probe.stop().await {
            error!("stopping health probe: {err:#}");
        }
    }
    let _ = listener_done.await;

    info!("guest agent stopped");
    Ok(())
}

/// The main loop: each delivered snapshot runs one manager tick, then
/// becomes the baseline for the next. Transport errors back off and
/// keep the log quiet until something changes.
async fn watch_loop(
    store: &Arc<KeyStore>,
    net: &Arc<dyn NetOps>,
    latest: &Arc<RwLock<Arc<Snapshot>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut watcher = MetadataWatcher::new();
    let mut prev = Arc::new(Snapshot::default());
    let mut report_errors = true;

    loop {
        if *shutdown.borrow() {
            return;
        }
        match watcher.watch(&mut shutdown).await {
            Ok(Some(next)) => {
                let next = Arc::new(next);
                *latest.write() = next.clone();
                manager::run_tick(&prev, &next, store, net, DEFAULT_CONFIG_PATH.as_ref()).await;
                prev = next;
                report_errors = true;
            }
            Ok(None) => return,
            Err(err) => {
                if report_errors {
                    error!("watching metadata: {err:#}");
                    report_errors = false;
                }
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(TRANSIENT_BACKOFF) => {}
                }
            }
        }
    }
}
