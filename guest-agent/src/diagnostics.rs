//! Diagnostics hook
//!
//! A one-shot, opt-in trigger: the diagnostics attribute carries a
//! signed upload URL, and the agent fires the external log collector at
//! it once per distinct attribute value. Collection runs detached so a
//! slow upload never holds up the tick.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use async_trait::async_trait;
use guest_core::config::{resolve_flag, InstanceConfig};
use guest_core::dedup::DedupSet;
use guest_core::metadata::Snapshot;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, info};

use crate::accounts::timestamp_expired;
use crate::manager::{log_transition, Manager};

#[cfg(windows)]
const DEFAULT_COLLECTOR: &str =
    r"C:\Program Files\Google\Compute Engine\diagnostics\diagnostics.exe";
#[cfg(not(windows))]
const DEFAULT_COLLECTOR: &str = "/usr/bin/guest-diagnostics";

static DIAGNOSTICS_DISABLED: AtomicBool = AtomicBool::new(true);
static SEEN_ENTRIES: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DiagnosticsEntry {
    signed_url: String,
    expire_on: String,
    trace_flag: bool,
}

pub struct DiagnosticsManager {
    prev: Arc<Snapshot>,
    next: Arc<Snapshot>,
    config: Arc<InstanceConfig>,
    collector: PathBuf,
}

impl DiagnosticsManager {
    pub fn new(prev: Arc<Snapshot>, next: Arc<Snapshot>, config: Arc<InstanceConfig>) -> Self {
        let collector = config
            .get_str("diagnostics", "cmd")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COLLECTOR));
        Self {
            prev,
            next,
            config,
            collector,
        }
    }

    fn collector_args(entry: &DiagnosticsEntry) -> Vec<String> {
        let mut args = vec!["-signedUrl".to_string(), entry.signed_url.clone()];
        if entry.trace_flag {
            args.push("-trace".to_string());
        }
        args
    }
}

#[async_trait]
impl Manager for DiagnosticsManager {
    fn name(&self) -> &'static str {
        "diagnostics"
    }

    fn disabled(&self) -> bool {
        // Collection is opt-in: with nothing set anywhere it stays off.
        let disabled = resolve_flag(
            self.config.get_bool("diagnostics", "disable"),
            self.next.instance.attributes.enable_diagnostics.map(|v| !v),
            self.next.project.attributes.enable_diagnostics.map(|v| !v),
            true,
        );
        log_transition(self.name(), disabled, &DIAGNOSTICS_DISABLED);
        disabled
    }

    fn diff(&self) -> bool {
        self.next.instance.attributes.diagnostics != self.prev.instance.attributes.diagnostics
    }

    async fn set(&mut self) -> Result<()> {
        let Some(raw) = self.next.instance.attributes.diagnostics.clone() else {
            return Ok(());
        };
        // Each distinct request value is acted on exactly once.
        if !SEEN_ENTRIES.lock().first(&raw) {
            return Ok(());
        }

        let entry: DiagnosticsEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                error!("bad diagnostics entry: {err}");
                return Ok(());
            }
        };
        if entry.signed_url.is_empty() || timestamp_expired(&entry.expire_on) {
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new(&self.collector);
        cmd.args(Self::collector_args(&entry));
        info!("collecting system logs for upload");
        tokio::spawn(async move {
            match cmd.output().await {
                Ok(output) => {
                    let text = String::from_utf8_lossy(&output.stdout);
                    if !text.trim().is_empty() {
                        info!("diagnostics collector: {}", text.trim());
                    }
                    if !output.status.success() {
                        error!("diagnostics collector exited with {}", output.status);
                    }
                }
                Err(err) => error!("running diagnostics collector: {err}"),
            }
        });
        Ok(())
    }
}
