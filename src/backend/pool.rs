use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::warn;

use crate::error::ProxyError;
use crate::metrics;
use crate::protocol::redis::{RespCodec, RespValue};

use super::conn;

/// Backend node address (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendNode(Arc<str>);

impl BackendNode {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self(addr.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ReplyRx = oneshot::Receiver<Result<RespValue, ProxyError>>;
type ReplyTx = oneshot::Sender<Result<RespValue, ProxyError>>;

/// One request handed to a backend session task.
pub struct SessionCommand {
    pub frame: RespValue,
    /// Logical db the issuing session selected; injected on mismatch.
    pub db: u32,
    /// Prefix the request with `ASKING` (transient cluster redirect).
    pub asking: bool,
    pub respond_to: ReplyTx,
}

/// Socket state as observed from outside a node's session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Up,
    Suspect,
    Down,
}

const DOWN_AFTER_FAILURES: u32 = 3;

#[derive(Default)]
struct NodeHealth {
    health: Option<Health>,
    consecutive_failures: u32,
}

/// Connect/health bookkeeping shared between session tasks and pickers.
pub(crate) struct HealthBoard {
    proxy: Arc<str>,
    states: RwLock<HashMap<BackendNode, NodeHealth>>,
}

impl HealthBoard {
    fn new(proxy: Arc<str>) -> Self {
        Self {
            proxy,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn connect_failed(&self, node: &BackendNode) {
        let mut states = self.states.write();
        let entry = states.entry(node.clone()).or_default();
        entry.consecutive_failures += 1;
        let next = if entry.consecutive_failures >= DOWN_AFTER_FAILURES {
            Health::Down
        } else {
            Health::Suspect
        };
        if entry.health != Some(next) {
            if next == Health::Down {
                warn!(proxy = %self.proxy, backend = %node, "backend marked down");
                metrics::stats_version_bump();
            }
            entry.health = Some(next);
        }
        metrics::backend_error(&self.proxy, node.as_str(), "connect");
    }

    pub(crate) fn round_trip_ok(&self, node: &BackendNode) {
        let mut states = self.states.write();
        let entry = states.entry(node.clone()).or_default();
        entry.consecutive_failures = 0;
        if entry.health != Some(Health::Up) {
            entry.health = Some(Health::Up);
            metrics::stats_version_bump();
        }
    }

    pub(crate) fn stream_failed(&self, node: &BackendNode) {
        metrics::backend_error(&self.proxy, node.as_str(), "stream");
        let mut states = self.states.write();
        let entry = states.entry(node.clone()).or_default();
        if entry.health != Some(Health::Down) {
            entry.health = Some(Health::Suspect);
        }
    }

    fn health(&self, node: &BackendNode) -> Health {
        self.states
            .read()
            .get(node)
            .and_then(|entry| entry.health)
            // a node we never talked to is assumed reachable
            .unwrap_or(Health::Up)
    }
}

/// Tunables shared by every connection of one pool.
#[derive(Clone)]
pub struct ConnOptions {
    pub connect_timeout: Duration,
    /// Upper bound of unanswered requests pipelined on one connection.
    pub inflight_cap: usize,
    /// `AUTH` argument vector applied when a backend connection opens.
    pub backend_auth: Option<Vec<Bytes>>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1_000),
            inflight_cap: 128,
            backend_auth: None,
        }
    }
}

struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

const SESSION_QUEUE_CAPACITY: usize = 1024;

/// Per-worker map of pipelined backend sessions, one lane per node.
///
/// Requests over the in-flight cap wait in the per-node queue; the session
/// task drains them in order so replies pair with the head of its FIFO.
pub struct ConnectionPool {
    proxy: Arc<str>,
    options: Arc<ConnOptions>,
    sessions: RwLock<HashMap<BackendNode, SessionHandle>>,
    health: Arc<HealthBoard>,
}

impl ConnectionPool {
    pub fn new(proxy: Arc<str>, options: ConnOptions) -> Self {
        let health = Arc::new(HealthBoard::new(proxy.clone()));
        Self {
            proxy,
            options: Arc::new(options),
            sessions: RwLock::new(HashMap::new()),
            health,
        }
    }

    pub fn node_health(&self, node: &BackendNode) -> Health {
        self.health.health(node)
    }

    /// Enqueue a request on the node's pipelined session, creating the
    /// session on first use. The returned receiver resolves with the reply
    /// frame or a backend error; dropping it orphans the request without
    /// disturbing the in-flight FIFO.
    pub async fn dispatch(
        &self,
        node: &BackendNode,
        frame: RespValue,
        db: u32,
        asking: bool,
    ) -> Result<ReplyRx, ProxyError> {
        let (respond_to, reply_rx) = oneshot::channel();
        let mut command = SessionCommand {
            frame,
            db,
            asking,
            respond_to,
        };

        // one respawn attempt when the previous session task has exited
        for _attempt in 0..2 {
            let tx = self.session_tx(node);
            match tx.send(command).await {
                Ok(()) => return Ok(reply_rx),
                Err(mpsc::error::SendError(returned)) => {
                    command = returned;
                    self.sessions.write().remove(node);
                }
            }
        }
        Err(ProxyError::BackendDown(node.as_str().to_string()))
    }

    fn session_tx(&self, node: &BackendNode) -> mpsc::Sender<SessionCommand> {
        if let Some(handle) = self.sessions.read().get(node) {
            return handle.tx.clone();
        }
        let mut sessions = self.sessions.write();
        let handle = sessions.entry(node.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
            let task = conn::SessionTask {
                proxy: self.proxy.clone(),
                node: node.clone(),
                options: self.options.clone(),
                health: self.health.clone(),
            };
            tokio::spawn(task.run(rx));
            SessionHandle { tx }
        });
        handle.tx.clone()
    }

    /// Open a dedicated connection outside the shared pipeline, for
    /// transactions, subscriptions, and topology fetches. The connection is
    /// authenticated with the pool's backend credentials when configured.
    pub async fn open_exclusive(
        &self,
        node: &BackendNode,
    ) -> Result<Framed<TcpStream, RespCodec>> {
        let framed = conn::open_stream(node, &self.options, &self.health)
            .await
            .with_context(|| format!("exclusive connection to {} failed", node))?;
        Ok(framed)
    }
}
