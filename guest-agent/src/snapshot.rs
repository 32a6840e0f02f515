//! Snapshot-hook listener
//!
//! Disk snapshots are orchestrated externally; the orchestrator asks
//! the guest to quiesce through a serial control channel. Requests and
//! responses are newline-framed JSON sharing a `signature` tag. Each
//! request carries an operation id; replays are dropped through
//! bounded seen-id caches so a retransmitted request never runs the
//! hook script twice.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use guest_core::config::{resolve_flag, InstanceConfig};
use guest_core::metadata::Snapshot;
use guest_core::script::{fetch_and_run, TIMEOUT_EXIT_CODE};
use guest_core::serial::{open_port, write_serial};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const IDENTIFIER: &str = "329d1643-127b-4096-84a6-ac19f597e51c";
const PROTOCOL_VERSION: u32 = 1;
const SEEN_OPERATIONS: usize = 128;

#[cfg(windows)]
const DEFAULT_SNAPSHOT_PORT: &str = "COM4";
#[cfg(not(windows))]
const DEFAULT_SNAPSHOT_PORT: &str = "/dev/ttyS3";

/// Every frame on the snapshot channel, dispatched on its signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signature")]
pub enum SnapshotMessage {
    #[serde(rename = "READY")]
    Ready { identifier: String, version: u32 },
    #[serde(rename = "SHUTDOWN")]
    Shutdown { identifier: String, version: u32 },
    #[serde(rename = "PREREQ")]
    PreRequest {
        #[serde(default)]
        identifier: String,
        #[serde(default)]
        version: u32,
        operation_id: u64,
        #[serde(default)]
        all_disks: bool,
        #[serde(default)]
        disks: String,
    },
    #[serde(rename = "POSTREQ")]
    PostRequest {
        #[serde(default)]
        identifier: String,
        #[serde(default)]
        version: u32,
        operation_id: u64,
        #[serde(default)]
        all_disks: bool,
        #[serde(default)]
        disks: String,
    },
    #[serde(rename = "PRERESP")]
    PreResponse {
        identifier: String,
        version: u32,
        rc: i32,
        operation_id: u64,
    },
    #[serde(rename = "POSTRESP")]
    PostResponse {
        identifier: String,
        version: u32,
        rc: i32,
        operation_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Pre,
    Post,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::Pre => "pre-snapshot",
            Direction::Post => "post-snapshot",
        }
    }
}

/// Resolved hook settings: config file over instance over project
/// attributes, defaults last. Disabled with a 60s timeout unless
/// someone says otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct HookConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub continue_on_script_error: bool,
    pub pre_script_url: String,
    pub post_script_url: String,
}

pub fn resolve_hook_config(snapshot: &Snapshot, config: &InstanceConfig) -> HookConfig {
    let instance = &snapshot.instance.attributes;
    let project = &snapshot.project.attributes;
    HookConfig {
        enabled: resolve_flag(
            config.get_bool("Snapshots", "enabled"),
            instance.snapshot_enabled,
            project.snapshot_enabled,
            false,
        ),
        timeout_secs: config
            .get_int("Snapshots", "timeout_in_seconds")
            .and_then(|v| u64::try_from(v).ok())
            .or(instance.snapshot_timeout)
            .or(project.snapshot_timeout)
            .unwrap_or(60),
        continue_on_script_error: resolve_flag(
            config.get_bool("Snapshots", "continue_on_script_error"),
            instance.snapshot_continue_on_error,
            project.snapshot_continue_on_error,
            false,
        ),
        pre_script_url: config
            .get_str("Snapshots", "pre_snapshot_script")
            .or_else(|| instance.snapshot_pre_script_url.clone())
            .or_else(|| project.snapshot_pre_script_url.clone())
            .unwrap_or_default(),
        post_script_url: config
            .get_str("Snapshots", "post_snapshot_script")
            .or_else(|| instance.snapshot_post_script_url.clone())
            .or_else(|| project.snapshot_post_script_url.clone())
            .unwrap_or_default(),
    }
}

/// Outbound half of the control channel.
trait MessageSink: Send + Sync {
    fn send(&self, msg: &SnapshotMessage) -> Result<()>;
}

struct SerialMessageSink {
    port: String,
}

impl MessageSink for SerialMessageSink {
    fn send(&self, msg: &SnapshotMessage) -> Result<()> {
        let line = serde_json::to_vec(msg)?;
        write_serial(&self.port, &line)
    }
}

pub struct SnapshotListener {
    port: String,
    config_path: PathBuf,
    latest: Arc<RwLock<Arc<Snapshot>>>,
    sink: Box<dyn MessageSink>,
    seen_pre: Mutex<LruCache<u64, ()>>,
    seen_post: Mutex<LruCache<u64, ()>>,
}

impl SnapshotListener {
    pub fn new(config_path: PathBuf, latest: Arc<RwLock<Arc<Snapshot>>>) -> Self {
        let config = InstanceConfig::load(&config_path);
        let port = config
            .get_str("Snapshots", "port")
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_PORT.to_string());
        let sink = Box::new(SerialMessageSink { port: port.clone() });
        Self::with_sink(port, config_path, latest, sink)
    }

    fn with_sink(
        port: String,
        config_path: PathBuf,
        latest: Arc<RwLock<Arc<Snapshot>>>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        let capacity = NonZeroUsize::new(SEEN_OPERATIONS).expect("nonzero cache size");
        Self {
            port,
            config_path,
            latest,
            sink,
            seen_pre: Mutex::new(LruCache::new(capacity)),
            seen_post: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn announce(&self, msg: SnapshotMessage) {
        if let Err(err) = self.sink.send(&msg) {
            error!("announcing on snapshot channel: {err:#}");
        }
    }

    /// Reads requests until shutdown, then says goodbye on the channel.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.announce(SnapshotMessage::Ready {
            identifier: IDENTIFIER.to_string(),
            version: PROTOCOL_VERSION,
        });

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        let port = self.port.clone();
        std::thread::spawn(move || read_loop(&port, tx));

        let mut frame: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                chunk = rx.recv() => match chunk {
                    Some(bytes) => {
                        for byte in bytes {
                            if byte == b'\n' {
                                if !frame.is_empty() {
                                    self.handle_frame(&frame).await;
                                    frame.clear();
                                }
                            } else if byte != 0 {
                                frame.push(byte);
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        self.announce(SnapshotMessage::Shutdown {
            identifier: IDENTIFIER.to_string(),
            version: PROTOCOL_VERSION,
        });
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let msg: SnapshotMessage = match serde_json::from_slice(frame) {
            Ok(msg) => msg,
            Err(err) => {
                error!("bad frame on snapshot channel: {err}");
                return;
            }
        };
        match msg {
            SnapshotMessage::PreRequest {
                operation_id,
                version,
                disks,
                ..
            } => {
                self.handle_request(Direction::Pre, operation_id, version, &disks)
                    .await
            }
            SnapshotMessage::PostRequest {
                operation_id,
                version,
                disks,
                ..
            } => {
                self.handle_request(Direction::Post, operation_id, version, &disks)
                    .await
            }
            other => warn!("unexpected message on snapshot channel: {other:?}"),
        }
    }

    async fn handle_request(
        &self,
        direction: Direction,
        operation_id: u64,
        version: u32,
        disks: &str,
    ) {
        let seen = match direction {
            Direction::Pre => &self.seen_pre,
            Direction::Post => &self.seen_post,
        };
        {
            // Insert before handling so a replay racing the script run
            // is also dropped.
            let mut cache = seen.lock();
            if cache.contains(&operation_id) {
                info!(
                    "ignoring duplicate {} request with operation id {operation_id}",
                    direction.label()
                );
                return;
            }
            cache.put(operation_id, ());
        }

        let config = InstanceConfig::load(&self.config_path);
        let hook = resolve_hook_config(&self.latest.read().clone(), &config);
        if !hook.enabled {
            info!(
                "snapshot handling disabled, not running {} script",
                direction.label()
            );
            return;
        }
        let url = match direction {
            Direction::Pre => &hook.pre_script_url,
            Direction::Post => &hook.post_script_url,
        };
        if url.is_empty() {
            info!("no {} script configured", direction.label());
            return;
        }

        info!("running {} script", direction.label());
        let arg = (!disks.is_empty()).then_some(disks);
        let rc = match fetch_and_run(
            url,
            direction.label(),
            arg,
            Duration::from_secs(hook.timeout_secs),
        )
        .await
        {
            Ok(rc) => rc,
            Err(err) => {
                error!("running {} script: {err:#}", direction.label());
                -1
            }
        };
        if rc == TIMEOUT_EXIT_CODE {
            warn!("{} script timed out", direction.label());
        } else if rc != 0 && !hook.continue_on_script_error {
            error!("{} script failed with exit code {rc}", direction.label());
        }

        let response = match direction {
            Direction::Pre => SnapshotMessage::PreResponse {
                identifier: IDENTIFIER.to_string(),
                version,
                rc,
                operation_id,
            },
            Direction::Post => SnapshotMessage::PostResponse {
                identifier: IDENTIFIER.to_string(),
                version,
                rc,
                operation_id,
            },
        };
        if let Err(err) = self.sink.send(&response) {
            error!("sending {} response: {err:#}", direction.label());
        }
    }
}

fn read_loop(port: &str, tx: mpsc::Sender<Vec<u8>>) {
    use std::io::Read;

    let mut dev = match open_port(port, Duration::from_secs(1)) {
        Ok(dev) => dev,
        Err(err) => {
            error!("snapshot listener: {err:#}");
            return;
        }
    };
    let mut buf = [0u8; 128];
    loop {
        if tx.is_closed() {
            return;
        }
        match dev.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!("reading snapshot channel: {err}");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
