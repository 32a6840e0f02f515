//! Manager contract and per-tick runner
//!
//! Every reconciler implements the same three-method shape. Each
//! snapshot tick builds the full manager set bound to (previous, new,
//! config) and fans them out in parallel; a failing manager is logged
//! and never blocks its siblings or the next tick.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use guest_core::config::InstanceConfig;
use guest_core::metadata::Snapshot;
use guest_core::store::KeyStore;
use tracing::{error, info};

use crate::accounts::WindowsAccountsManager;
use crate::addresses::AddressManager;
use crate::diagnostics::DiagnosticsManager;
use crate::net::NetOps;
use crate::wsfc::{self, WsfcManager};

/// One facet of local state reconciled against the snapshot.
#[async_trait]
pub trait Manager: Send {
    fn name(&self) -> &'static str;
    /// Three-layer enable/disable resolution; logs a transition at most
    /// once per change.
    fn disabled(&self) -> bool;
    /// Whether this manager's slice of state changed between the
    /// previous and new snapshot. False skips `set` this tick.
    fn diff(&self) -> bool;
    /// Idempotent reconciliation from observed to desired state.
    async fn set(&mut self) -> Result<()>;
}

/// Logs an enabled/disabled transition exactly once per change.
pub fn log_transition(name: &str, disabled: bool, last: &AtomicBool) {
    if last.swap(disabled, Ordering::Relaxed) != disabled {
        let status = if disabled { "disabled" } else { "enabled" };
        info!("{name} manager status: {status}");
    }
}

/// Runs one reconciliation tick: builds every manager against the two
/// snapshots and the freshly parsed config, then runs them all
/// concurrently and waits for the stragglers.
pub async fn run_tick(
    prev: &Arc<Snapshot>,
    next: &Arc<Snapshot>,
    store: &Arc<KeyStore>,
    net: &Arc<dyn NetOps>,
    config_path: &Path,
) {
    let config = Arc::new(InstanceConfig::load(config_path));

    let mut managers: Vec<Box<dyn Manager>> = vec![
        Box::new(AddressManager::new(
            prev.clone(),
            next.clone(),
            config.clone(),
            store.clone(),
            net.clone(),
        )),
        Box::new(WsfcManager::new(next.as_ref(), wsfc::instance())),
        Box::new(DiagnosticsManager::new(
            prev.clone(),
            next.clone(),
            config.clone(),
        )),
    ];
    if cfg!(windows) {
        managers.push(Box::new(WindowsAccountsManager::new(
            prev.clone(),
            next.clone(),
            config.clone(),
            store.clone(),
        )));
    }
    #[cfg(unix)]
    managers.push(Box::new(crate::linux_accounts::LinuxAccountsManager::new(
        prev.clone(),
        next.clone(),
        config.clone(),
    )));

    let mut workers = tokio::task::JoinSet::new();
    for mut manager in managers {
        workers.spawn(async move {
            if manager.disabled() || !manager.diff() {
                return;
            }
            if let Err(err) = manager.set().await {
                error!("{} manager: {err:#}", manager.name());
            }
        });
    }
    while workers.join_next().await.is_some() {}
}
