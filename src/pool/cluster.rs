use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{BackendNode, ConnectionPool, Health};
use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::metrics;
use crate::protocol::redis::{
    new_cluster_nodes_command, RedisCommand, RespCodec, RespValue, SlotMap,
};

const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 3;

#[derive(Debug, PartialEq, Eq)]
enum Redirect {
    Moved { slot: u16, address: String },
    Ask { address: String },
}

/// Slot-addressed deployment with a topology learned from `CLUSTER NODES`.
pub struct ClusterPool {
    name: Arc<str>,
    hash_tag: Option<Vec<u8>>,
    read_from_replica: bool,
    slots: Arc<watch::Sender<SlotMap>>,
    conns: Arc<ConnectionPool>,
    fetch_trigger: mpsc::UnboundedSender<()>,
    replica_rr: AtomicUsize,
}

impl ClusterPool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        if config.servers.is_empty() {
            bail!("cluster pool {} declares no seed servers", config.name);
        }
        let name: Arc<str> = config.name.clone().into();
        let conns = Arc::new(ConnectionPool::new(name.clone(), config.conn_options()));
        let (slot_tx, _slot_rx) = watch::channel(SlotMap::new());
        let slots = Arc::new(slot_tx);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        let pool = Self {
            name: name.clone(),
            hash_tag: config.hash_tag_bytes(),
            read_from_replica: config.read_from_replica,
            slots: slots.clone(),
            conns: conns.clone(),
            fetch_trigger: trigger_tx.clone(),
            replica_rr: AtomicUsize::new(0),
        };

        let interval = config
            .fetch_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FETCH_INTERVAL);
        // fetch immediately, then on the interval and on demand
        let _ = trigger_tx.send(());
        tokio::spawn(fetch_topology(
            name,
            config.servers.clone(),
            conns,
            slots,
            trigger_rx,
            interval,
        ));

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_count(&self) -> usize {
        self.slots.borrow().all_nodes().len()
    }

    pub fn masters(&self) -> Vec<BackendNode> {
        self.slots
            .borrow()
            .ordered_masters()
            .into_iter()
            .map(BackendNode::new)
            .collect()
    }

    pub fn trigger_fetch(&self) {
        let _ = self.fetch_trigger.send(());
    }

    fn pick(&self, slot: u16, read_only: bool) -> Result<BackendNode, ProxyError> {
        let map = self.slots.borrow();
        if read_only && self.read_from_replica {
            let replicas = map.replicas_for_slot(slot);
            if !replicas.is_empty() {
                let start = self.replica_rr.fetch_add(1, Ordering::Relaxed);
                for offset in 0..replicas.len() {
                    let candidate = BackendNode::new(replicas[(start + offset) % replicas.len()].clone());
                    if self.conns.node_health(&candidate) != Health::Down {
                        return Ok(candidate);
                    }
                }
            }
        }
        map.master_for_slot(slot)
            .map(BackendNode::new)
            .ok_or(ProxyError::ClusterDown)
    }

    fn slot_of(&self, command: &RedisCommand) -> u16 {
        // keyless requests land on slot zero's owner
        command.hash_slot(self.hash_tag.as_deref()).unwrap_or(0)
    }

    pub fn pick_for_command(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        self.pick(self.slot_of(command), command.is_read_only())
    }

    pub fn pick_master(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        self.pick(self.slot_of(command), false)
    }

    pub fn first_master(&self) -> Result<BackendNode, ProxyError> {
        self.pick(0, false)
    }

    pub async fn dispatch_to(
        &self,
        node: &BackendNode,
        command: &RedisCommand,
        db: u32,
    ) -> Result<RespValue, ProxyError> {
        let reply_rx = self
            .conns
            .dispatch(node, command.to_resp(), db, false)
            .await?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::BackendDown(node.as_str().to_string())),
        }
    }

    /// Round trip with redirect handling.
    ///
    /// MOVED rewrites the slot's owner and retries against the new node; ASK
    /// retries with an `ASKING` prefix and leaves the map alone. LOADING and
    /// CLUSTERDOWN replies pass through but schedule a topology refresh.
    pub async fn dispatch(&self, command: &RedisCommand, db: u32) -> Result<RespValue, ProxyError> {
        let mut slot = self.slot_of(command);
        let read_only = command.is_read_only();
        let mut target: Option<BackendNode> = None;
        let mut asking = false;

        for _hop in 0..MAX_REDIRECTS {
            let node = match target.clone() {
                Some(node) => node,
                None => self.pick(slot, read_only)?,
            };
            let reply_rx = self
                .conns
                .dispatch(&node, command.to_resp(), db, asking)
                .await?;
            let reply = match reply_rx.await {
                Ok(result) => result?,
                Err(_) => return Err(ProxyError::BackendDown(node.as_str().to_string())),
            };

            match parse_redirect(&reply) {
                Some(Redirect::Moved { slot: new_slot, address }) => {
                    debug!(pool = %self.name, slot = new_slot, to = %address,
                        "MOVED redirect");
                    self.learn_moved(new_slot, &address);
                    slot = new_slot;
                    target = Some(BackendNode::new(address));
                    asking = false;
                }
                Some(Redirect::Ask { address }) => {
                    debug!(pool = %self.name, to = %address, "ASK redirect");
                    target = Some(BackendNode::new(address));
                    asking = true;
                }
                None => {
                    if let Some(code) = reply.error_code() {
                        if matches!(code, b"LOADING" | b"CLUSTERDOWN" | b"READONLY") {
                            self.trigger_fetch();
                        }
                    }
                    return Ok(reply);
                }
            }
        }
        Err(ProxyError::TooManyRedirects)
    }

    fn learn_moved(&self, slot: u16, address: &str) {
        self.slots.send_modify(|map| {
            if map.set_master(slot, address) {
                metrics::stats_version_bump();
            }
        });
        // a moved slot usually means more moved; refresh the whole map
        self.trigger_fetch();
    }

    pub async fn open_exclusive(
        &self,
        node: &BackendNode,
    ) -> Result<Framed<TcpStream, RespCodec>> {
        self.conns.open_exclusive(node).await
    }
}

fn parse_redirect(reply: &RespValue) -> Option<Redirect> {
    let data = match reply {
        RespValue::Error(data) => data,
        _ => return None,
    };
    let text = std::str::from_utf8(data).ok()?;
    if let Some(rest) = text.strip_prefix("MOVED ") {
        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let address = parts.next()?.to_string();
        return Some(Redirect::Moved { slot, address });
    }
    if let Some(rest) = text.strip_prefix("ASK ") {
        let mut parts = rest.split_whitespace();
        let _slot = parts.next()?;
        let address = parts.next()?.to_string();
        return Some(Redirect::Ask { address });
    }
    None
}

/// Background topology refresh: periodically, and whenever dispatch asks,
/// send `CLUSTER NODES` to one reachable seed and swap in the fresh map.
/// Runs on its own connections so a slow fetch never stalls dispatch.
async fn fetch_topology(
    pool: Arc<str>,
    seeds: Vec<String>,
    conns: Arc<ConnectionPool>,
    slots: Arc<watch::Sender<SlotMap>>,
    mut trigger: mpsc::UnboundedReceiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            received = trigger.recv() => {
                if received.is_none() {
                    return;
                }
                // coalesce a burst of triggers into one fetch
                while trigger.try_recv().is_ok() {}
            }
        }

        match fetch_once(&seeds, &conns, &slots).await {
            Ok(changed) => {
                if changed {
                    info!(pool = %pool, "cluster slot map refreshed");
                    metrics::stats_version_bump();
                }
            }
            Err(err) => {
                warn!(pool = %pool, error = %err, "cluster topology refresh failed");
            }
        }
    }
}

async fn fetch_once(
    seeds: &[String],
    conns: &ConnectionPool,
    slots: &watch::Sender<SlotMap>,
) -> Result<bool> {
    // prefer live members over the static seed list, in random order
    let mut candidates = slots.borrow().ordered_masters();
    for seed in seeds {
        if !candidates.contains(seed) {
            candidates.push(seed.clone());
        }
    }
    candidates.shuffle(&mut thread_rng());

    let mut last_error = anyhow!("no seed nodes configured");
    for candidate in candidates {
        let node = BackendNode::new(candidate.clone());
        match fetch_from_seed(&node, conns).await {
            Ok(map) => {
                if map.is_empty() {
                    last_error = anyhow!("seed {} returned an empty slot map", candidate);
                    continue;
                }
                let changed = map.differs_from(&slots.borrow());
                if changed {
                    slots.send_replace(map);
                }
                return Ok(changed);
            }
            Err(err) => {
                debug!(seed = %candidate, error = %err, "seed fetch failed");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn fetch_from_seed(node: &BackendNode, conns: &ConnectionPool) -> Result<SlotMap> {
    const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

    let mut framed = conns.open_exclusive(node).await?;
    timeout(
        FETCH_TIMEOUT,
        framed.send(new_cluster_nodes_command().to_resp()),
    )
    .await
    .map_err(|_| anyhow!("timed out sending CLUSTER NODES to {}", node))??;

    let reply = timeout(FETCH_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow!("timed out waiting for CLUSTER NODES from {}", node))?
        .ok_or_else(|| anyhow!("{} closed connection during CLUSTER NODES", node))??;

    match reply {
        RespValue::BulkString(payload) => SlotMap::from_nodes_payload(&payload),
        RespValue::Error(err) => Err(anyhow!(
            "{} refused CLUSTER NODES: {}",
            node,
            String::from_utf8_lossy(&err)
        )),
        other => Err(anyhow!("unexpected CLUSTER NODES reply: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn parses_moved_and_ask_redirects() {
        let moved = RespValue::Error(Bytes::from_static(b"MOVED 12539 10.0.0.7:6379"));
        assert_eq!(
            parse_redirect(&moved),
            Some(Redirect::Moved {
                slot: 12539,
                address: "10.0.0.7:6379".to_string()
            })
        );

        let ask = RespValue::Error(Bytes::from_static(b"ASK 42 10.0.0.8:6379"));
        assert_eq!(
            parse_redirect(&ask),
            Some(Redirect::Ask {
                address: "10.0.0.8:6379".to_string()
            })
        );

        let plain = RespValue::Error(Bytes::from_static(b"ERR nope"));
        assert_eq!(parse_redirect(&plain), None);
        assert_eq!(parse_redirect(&RespValue::ok()), None);
    }
}
