use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::backend::{BackendNode, ConnectionPool, Health};
use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::protocol::redis::{RedisCommand, RespCodec, RespValue};
use crate::utils::{crc16, trim_hash_tag};

struct Group {
    master: BackendNode,
    replicas: Vec<BackendNode>,
    rr: AtomicUsize,
}

/// Fixed set of master groups addressed by modular key hashing.
pub struct StandalonePool {
    name: Arc<str>,
    hash_tag: Option<Vec<u8>>,
    read_from_replica: bool,
    groups: Vec<Group>,
    conns: Arc<ConnectionPool>,
}

impl StandalonePool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let groups: Vec<Group> = config
            .groups
            .iter()
            .map(|group| Group {
                master: BackendNode::new(group.master.clone()),
                replicas: group
                    .replicas
                    .iter()
                    .map(|addr| BackendNode::new(addr.clone()))
                    .collect(),
                rr: AtomicUsize::new(0),
            })
            .collect();
        if groups.is_empty() {
            bail!("standalone pool {} declares no groups", config.name);
        }

        let name: Arc<str> = config.name.clone().into();
        let conns = Arc::new(ConnectionPool::new(name.clone(), config.conn_options()));

        Ok(Self {
            name,
            hash_tag: config.hash_tag_bytes(),
            read_from_replica: config.read_from_replica,
            groups,
            conns,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn backend_count(&self) -> usize {
        self.groups
            .iter()
            .map(|group| 1 + group.replicas.len())
            .sum()
    }

    pub fn masters(&self) -> Vec<BackendNode> {
        self.groups.iter().map(|g| g.master.clone()).collect()
    }

    fn group_for_key(&self, key: &[u8]) -> &Group {
        let hash = crc16(trim_hash_tag(key, self.hash_tag.as_deref())) as usize;
        &self.groups[hash % self.groups.len()]
    }

    fn pick_in_group(&self, group: &Group, read_only: bool) -> BackendNode {
        if read_only && self.read_from_replica && !group.replicas.is_empty() {
            let start = group.rr.fetch_add(1, Ordering::Relaxed);
            for offset in 0..group.replicas.len() {
                let replica = &group.replicas[(start + offset) % group.replicas.len()];
                if self.conns.node_health(replica) != Health::Down {
                    return replica.clone();
                }
            }
        }
        group.master.clone()
    }

    pub fn pick_for_command(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        let group = match command.primary_key() {
            Some(key) => self.group_for_key(key),
            // keyless requests land on the first group
            None => &self.groups[0],
        };
        Ok(self.pick_in_group(group, command.is_read_only()))
    }

    pub fn pick_master(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        let group = match command.primary_key() {
            Some(key) => self.group_for_key(key),
            None => &self.groups[0],
        };
        Ok(group.master.clone())
    }

    pub async fn dispatch(&self, command: &RedisCommand, db: u32) -> Result<RespValue, ProxyError> {
        let node = self.pick_for_command(command)?;
        self.dispatch_to(&node, command, db).await
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

    pub async fn open_exclusive(
        &self,
        node: &BackendNode,
    ) -> Result<Framed<TcpStream, RespCodec>> {
        self.conns.open_exclusive(node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, PoolConfig, PoolKind};

    fn pool_with_groups(masters: &[&str]) -> StandalonePool {
        let config = PoolConfig {
            name: "test".into(),
            kind: PoolKind::Standalone,
            servers: Vec::new(),
            groups: masters
                .iter()
                .map(|master| GroupConfig {
                    master: master.to_string(),
                    replicas: Vec::new(),
                })
                .collect(),
            read_from_replica: false,
            fetch_interval_ms: None,
            connect_timeout_ms: None,
            inflight_cap: None,
            backend_auth: None,
            hash_tag: Some("{}".to_string()),
        };
        StandalonePool::new(&config).unwrap()
    }

    #[tokio::test]
    async fn keys_map_to_groups_by_modular_hash() {
        let pool = pool_with_groups(&["127.0.0.1:7101", "127.0.0.1:7102"]);
        let get = RedisCommand::new(vec![
            bytes::Bytes::from_static(b"GET"),
            bytes::Bytes::from_static(b"some-key"),
        ])
        .unwrap();
        let expected = {
            let hash = crc16(b"some-key") as usize;
            [("127.0.0.1:7101"), ("127.0.0.1:7102")][hash % 2]
        };
        assert_eq!(pool.pick_for_command(&get).unwrap().as_str(), expected);
    }

    #[tokio::test]
    async fn tagged_keys_stay_in_one_group() {
        let pool = pool_with_groups(&["127.0.0.1:7101", "127.0.0.1:7102", "127.0.0.1:7103"]);
        let a = RedisCommand::new(vec![
            bytes::Bytes::from_static(b"GET"),
            bytes::Bytes::from_static(b"{tenant}:a"),
        ])
        .unwrap();
        let b = RedisCommand::new(vec![
            bytes::Bytes::from_static(b"SET"),
            bytes::Bytes::from_static(b"{tenant}:b"),
            bytes::Bytes::from_static(b"1"),
        ])
        .unwrap();
        assert_eq!(
            pool.pick_for_command(&a).unwrap(),
            pool.pick_for_command(&b).unwrap()
        );
    }
}
