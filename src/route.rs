use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;

use crate::config::Config;

/// Shared handle workers sample once per request; the auxiliary reloader
/// publishes replacement tables through it.
pub type RouteHandle = Arc<ArcSwap<RouteTable>>;

#[derive(Debug, Clone)]
pub struct RouteEntry {
    prefix: Vec<u8>,
    write_pool: usize,
    read_pool: Option<usize>,
}

/// Ordered prefix routing table over pool indices.
///
/// Immutable once published; hot reload swaps in a fresh instance while
/// requests already routed keep the pools they resolved.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    pool_count: usize,
}

impl RouteTable {
    /// Derive the table from configuration, resolving pool names against
    /// the fixed pool list built at startup.
    pub fn from_config(config: &Config, pool_names: &[String]) -> Result<Self> {
        let index_of = |name: &str| -> Result<usize> {
            pool_names
                .iter()
                .position(|candidate| candidate == name)
                .ok_or_else(|| anyhow::anyhow!("route references unknown pool '{}'", name))
        };

        let mut entries = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let write_pool = index_of(&route.write_pool)?;
            let read_pool = route
                .read_pool
                .as_deref()
                .map(index_of)
                .transpose()?;
            entries.push(RouteEntry {
                prefix: route.prefix.as_bytes().to_vec(),
                write_pool,
                read_pool,
            });
        }

        if pool_names.is_empty() {
            bail!("no server pools configured");
        }

        Ok(Self {
            entries,
            pool_count: pool_names.len(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(entries: Vec<(&str, usize, Option<usize>)>, pool_count: usize) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(prefix, write_pool, read_pool)| RouteEntry {
                    prefix: prefix.as_bytes().to_vec(),
                    write_pool,
                    read_pool,
                })
                .collect(),
            pool_count,
        }
    }

    /// Resolve the pool index for a request.
    ///
    /// Declaration order wins; an empty prefix or `"*"` matches every key;
    /// keyless requests and unmatched keys fall back to pool zero. Returns
    /// `None` only when no pools exist at all.
    pub fn route(&self, key: &[u8], requires_write: bool) -> Option<usize> {
        if self.pool_count == 0 {
            return None;
        }
        if key.is_empty() || self.entries.is_empty() {
            return Some(0);
        }
        for entry in &self.entries {
            let matches = entry.prefix.is_empty()
                || entry.prefix == b"*"
                || key.starts_with(&entry.prefix);
            if matches {
                if requires_write {
                    return Some(entry.write_pool);
                }
                return Some(entry.read_pool.unwrap_or(entry.write_pool));
            }
        }
        Some(0)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

pub fn new_handle(table: RouteTable) -> RouteHandle {
    Arc::new(ArcSwap::from_pointee(table))
}
