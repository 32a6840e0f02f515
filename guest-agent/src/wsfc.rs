//! Failover-cluster health probe
//!
//! A process-wide TCP agent that answers cluster health checks: the
//! probe payload is an IP address, the reply is "1" when that address
//! is assigned to a local non-loopback interface, "0" otherwise. A thin
//! manager interprets metadata into start/stop/port transitions; the
//! agent itself is never "disabled", users simply stop requesting it.

use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use guest_core::metadata::Snapshot;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::manager::Manager;
use crate::net::local_ipv4_present;

pub const DEFAULT_AGENT_PORT: u16 = 59998;

const PROBE_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Running,
}

type StopSignal = oneshot::Sender<oneshot::Sender<()>>;

struct Inner {
    state: AgentState,
    port: u16,
    stop_tx: Option<StopSignal>,
}

/// The health agent singleton. All mutation goes through the wsfc
/// manager, which is the only code calling start/stop/set_port.
pub struct HealthAgent {
    inner: Mutex<Inner>,
}

static AGENT: LazyLock<Arc<HealthAgent>> = LazyLock::new(|| Arc::new(HealthAgent::new()));

/// The process-wide agent instance.
pub fn instance() -> Arc<HealthAgent> {
    AGENT.clone()
}

impl HealthAgent {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: AgentState::Stopped,
                port: DEFAULT_AGENT_PORT,
                stop_tx: None,
            }),
        }
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().state
    }

    pub fn port(&self) -> u16 {
        self.inner.lock().port
    }

    pub fn set_port(&self, port: u16) {
        let mut inner = self.inner.lock();
        if inner.port != port {
            info!("updating health probe port from {} to {port}", inner.port);
            inner.port = port;
        }
    }

    /// Binds the listener and enters the accept loop. Running already
    /// is a no-op; a bind failure leaves the agent stopped.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let port = {
            let inner = self.inner.lock();
            if inner.state == AgentState::Running {
                info!("health probe is already running");
                return Ok(());
            }
            inner.port
        };

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding health probe to port {port}"))?;
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.state = AgentState::Running;
            inner.port = bound_port;
            inner.stop_tx = Some(stop_tx);
        }
        info!("health probe listening on port {bound_port}");

        let agent = self.clone();
        tokio::spawn(accept_loop(agent, listener, stop_rx));
        Ok(())
    }

    /// Signals the accept loop and waits for it to close the listener
    /// and drain in-flight handlers. Stopped already is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let stop_tx = {
            let mut inner = self.inner.lock();
            if inner.state == AgentState::Stopped {
                info!("health probe is already stopped");
                return Ok(());
            }
            inner.stop_tx.take()
        };
        let Some(stop_tx) = stop_tx else {
            bail!("health probe running without a stop channel");
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).is_err() {
            // The accept loop is already gone; reconcile our state.
            warn!("health probe accept loop exited unexpectedly");
            self.inner.lock().state = AgentState::Stopped;
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }
}

async fn accept_loop(
    agent: Arc<HealthAgent>,
    listener: TcpListener,
    mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>,
) {
    let mut handlers = tokio::task::JoinSet::new();
    let ack = loop {
        tokio::select! {
            ack = &mut stop_rx => break ack,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    handlers.spawn(handle_probe(stream));
                }
                Err(err) => error!("health probe accept: {err}"),
            },
        }
    };

    // Close the listener before draining so no new work sneaks in.
    drop(listener);
    while handlers.join_next().await.is_some() {}

    {
        let mut inner = agent.inner.lock();
        inner.state = AgentState::Stopped;
        inner.stop_tx = None;
    }
    info!("health probe stopped");
    if let Ok(ack) = ack {
        let _ = ack.send(());
    }
}

async fn handle_probe(mut stream: TcpStream) {
    let mut buf = [0u8; 1024];
    let read = tokio::time::timeout(PROBE_DEADLINE, stream.read(&mut buf)).await;
    let n = match read {
        Ok(Ok(n)) => n,
        Ok(Err(err)) => {
            error!("health probe read: {err}");
            return;
        }
        Err(_) => return,
    };

    let payload = String::from_utf8_lossy(&buf[..n]);
    let reply = match payload.trim().parse::<Ipv4Addr>() {
        Ok(ip) => match local_ipv4_present(ip) {
            Ok(true) => "1",
            Ok(false) => "0",
            Err(err) => {
                error!("health probe address check: {err:#}");
                "0"
            }
        },
        Err(_) => "0",
    };
    if let Err(err) = stream.write_all(reply.as_bytes()).await {
        error!("health probe reply: {err}");
    }
}

/// Manager broker for the health agent. Desired state is Running iff
/// the cluster feature is enabled or it owns specific addresses; the
/// port comes from wsfc-agent-port.
pub struct WsfcManager {
    desired_state: AgentState,
    desired_port: u16,
    agent: Arc<HealthAgent>,
}

impl WsfcManager {
    pub fn new(snapshot: &Snapshot, agent: Arc<HealthAgent>) -> Self {
        let attrs = &snapshot.instance.attributes;
        let wants_probe = attrs.enable_wsfc == Some(true)
            || attrs.wsfc_addrs.as_deref().is_some_and(|a| !a.is_empty());
        let desired_state = if wants_probe {
            AgentState::Running
        } else {
            AgentState::Stopped
        };

        let desired_port = match attrs.wsfc_agent_port.as_deref() {
            None | Some("") => DEFAULT_AGENT_PORT,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("invalid wsfc-agent-port {raw:?}, using {DEFAULT_AGENT_PORT}");
                DEFAULT_AGENT_PORT
            }),
        };

        Self {
            desired_state,
            desired_port,
            agent,
        }
    }
}

#[async_trait]
impl Manager for WsfcManager {
    fn name(&self) -> &'static str {
        "wsfc"
    }

    fn disabled(&self) -> bool {
        false
    }

    fn diff(&self) -> bool {
        self.desired_state != self.agent.state() || self.desired_port != self.agent.port()
    }

    /// diff ran first, so either the state flipped (start or stop) or
    /// the agent is running on the wrong port (restart). A stopped
    /// agent with a new port just records it.
    async fn set(&mut self) -> Result<()> {
        self.agent.set_port(self.desired_port);

        if self.desired_state != self.agent.state() {
            return match self.desired_state {
                AgentState::Running => self.agent.start().await,
                AgentState::Stopped => self.agent.stop().await,
            };
        }

        if self.agent.state() == AgentState::Running {
            self.agent.stop().await?;
            return self.agent.start().await;
        }
        Ok(())
    }
}
