mod cluster;
mod standalone;

pub use cluster::ClusterPool;
pub use standalone::StandalonePool;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::backend::BackendNode;
use crate::error::ProxyError;
use crate::protocol::redis::{RedisCommand, RespCodec, RespValue};

/// One logical backend deployment.
///
/// The two shapes share a picker surface; dynamic dispatch in the original
/// becomes an exhaustive match here.
pub enum ServerPool {
    Standalone(StandalonePool),
    Cluster(ClusterPool),
}

impl ServerPool {
    pub fn name(&self) -> &str {
        match self {
            ServerPool::Standalone(pool) => pool.name(),
            ServerPool::Cluster(pool) => pool.name(),
        }
    }

    /// Multi-key commands split into children when the deployment cannot
    /// serve them on one connection: any cluster, or standalone with more
    /// than one group.
    pub fn split_multi_key(&self) -> bool {
        match self {
            ServerPool::Standalone(pool) => pool.group_count() > 1,
            ServerPool::Cluster(_) => true,
        }
    }

    /// Transactions need a single pinned connection; that only works when
    /// the pool resolves every key to one place the session can pin.
    pub fn supports_transactions(&self) -> bool {
        match self {
            ServerPool::Standalone(pool) => pool.group_count() == 1,
            ServerPool::Cluster(_) => true,
        }
    }

    /// Logical database support: cluster backends only expose db 0.
    pub fn supports_db(&self, db: u32) -> bool {
        match self {
            ServerPool::Standalone(_) => true,
            ServerPool::Cluster(_) => db == 0,
        }
    }

    /// Full request round trip, redirect-aware for cluster pools.
    pub async fn dispatch(&self, command: &RedisCommand, db: u32) -> Result<RespValue, ProxyError> {
        match self {
            ServerPool::Standalone(pool) => pool.dispatch(command, db).await,
            ServerPool::Cluster(pool) => pool.dispatch(command, db).await,
        }
    }

    /// Resolve the node a request would go to, without sending anything.
    /// Used to pin sticky backends for transactions and subscriptions.
    pub fn pick_node(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        match self {
            ServerPool::Standalone(pool) => pool.pick_for_command(command),
            ServerPool::Cluster(pool) => pool.pick_for_command(command),
        }
    }

    /// Resolve the master a request's key lives on, ignoring replica
    /// policy. Transactions pin this node for their whole lifetime.
    pub fn pick_master(&self, command: &RedisCommand) -> Result<BackendNode, ProxyError> {
        match self {
            ServerPool::Standalone(pool) => pool.pick_master(command),
            ServerPool::Cluster(pool) => pool.pick_master(command),
        }
    }

    /// Send one request to an explicit node, bypassing the picker. SCAN
    /// fan-out uses this to walk masters in cursor order.
    pub async fn dispatch_to(
        &self,
        node: &BackendNode,
        command: &RedisCommand,
        db: u32,
    ) -> Result<RespValue, ProxyError> {
        match self {
            ServerPool::Standalone(pool) => pool.dispatch_to(node, command, db).await,
            ServerPool::Cluster(pool) => pool.dispatch_to(node, command, db).await,
        }
    }

    /// Masters in stable order for SCAN fan-out.
    pub fn scan_targets(&self) -> Vec<BackendNode> {
        match self {
            ServerPool::Standalone(pool) => pool.masters(),
            ServerPool::Cluster(pool) => pool.masters(),
        }
    }

    /// Where keyless pinned work lands: the pool's first master.
    pub fn first_master(&self) -> Result<BackendNode, ProxyError> {
        match self {
            ServerPool::Standalone(pool) => Ok(pool.masters()[0].clone()),
            ServerPool::Cluster(pool) => pool.first_master(),
        }
    }

    /// Dedicated connection for transactions and subscriptions.
    pub async fn open_exclusive(
        &self,
        node: &BackendNode,
    ) -> Result<Framed<TcpStream, RespCodec>> {
        match self {
            ServerPool::Standalone(pool) => pool.open_exclusive(node).await,
            ServerPool::Cluster(pool) => pool.open_exclusive(node).await,
        }
    }

    pub fn backend_count(&self) -> usize {
        match self {
            ServerPool::Standalone(pool) => pool.backend_count(),
            ServerPool::Cluster(pool) => pool.backend_count(),
        }
    }
}
