use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::backend::ConnOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(raw)?;
        config.apply_defaults();
        config.ensure_valid()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        for pool in &mut self.pools {
            if pool.hash_tag.is_none() {
                pool.hash_tag = self.proxy.hash_tag.clone();
            }
        }
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.proxy.name.trim().is_empty() {
            bail!("proxy name cannot be empty");
        }
        if self.proxy.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!(
                "proxy listen_addr {} is not a valid socket address",
                self.proxy.listen_addr
            );
        }
        if self.pools.is_empty() {
            bail!("configuration must declare at least one pool");
        }

        let mut names = HashSet::new();
        for pool in &self.pools {
            pool.ensure_valid()?;
            if !names.insert(pool.name.to_lowercase()) {
                bail!("duplicate pool name: {}", pool.name);
            }
        }

        for route in &self.routes {
            let exists = |name: &str| self.pools.iter().any(|pool| pool.name == name);
            if !exists(&route.write_pool) {
                bail!("route '{}' references unknown pool '{}'", route.prefix, route.write_pool);
            }
            if let Some(read_pool) = &route.read_pool {
                if !exists(read_pool) {
                    bail!("route '{}' references unknown pool '{}'", route.prefix, read_pool);
                }
            }
        }

        if let Some(auth) = &self.auth {
            let mut users = HashSet::new();
            for user in &auth.users {
                if user.username.is_empty() || user.password.is_empty() {
                    bail!("auth users need both username and password");
                }
                if !users.insert(user.username.clone()) {
                    bail!("duplicate auth user: {}", user.username);
                }
            }
        }
        Ok(())
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.iter().map(|pool| pool.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub listen_addr: String,
    #[serde(default)]
    pub thread: Option<usize>,
    #[serde(default)]
    pub hash_tag: Option<String>,
    /// Global buffer memory cap in megabytes; zero or absent disables it.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// Per-request round-trip deadline.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl ProxyConfig {
    pub fn worker_threads(&self) -> usize {
        self.thread.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(1_000))
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    Standalone,
    Cluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub kind: PoolKind,
    /// Cluster seed nodes.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Standalone master groups.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub read_from_replica: bool,
    #[serde(default)]
    pub fetch_interval_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub inflight_cap: Option<usize>,
    #[serde(default)]
    pub backend_auth: Option<BackendAuthConfig>,
    #[serde(default)]
    pub hash_tag: Option<String>,
}

impl PoolConfig {
    pub fn ensure_valid(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("pool name cannot be empty");
        }
        match self.kind {
            PoolKind::Cluster if self.servers.is_empty() => {
                bail!("cluster pool {} needs seed servers", self.name)
            }
            PoolKind::Standalone if self.groups.is_empty() => {
                bail!("standalone pool {} needs at least one group", self.name)
            }
            _ => Ok(()),
        }
    }

    pub fn hash_tag_bytes(&self) -> Option<Vec<u8>> {
        self.hash_tag.as_ref().map(|tag| tag.as_bytes().to_vec())
    }

    pub fn conn_options(&self) -> ConnOptions {
        let mut options = ConnOptions::default();
        if let Some(millis) = self.connect_timeout_ms {
            options.connect_timeout = Duration::from_millis(millis);
        }
        if let Some(cap) = self.inflight_cap {
            options.inflight_cap = cap.max(1);
        }
        options.backend_auth = self.backend_auth.as_ref().map(|auth| auth.command_parts());
        options
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub master: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Backend credentials, either a bare password or an ACL pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendAuthConfig {
    Password(String),
    Credential { username: String, password: String },
}

impl BackendAuthConfig {
    pub fn command_parts(&self) -> Vec<Bytes> {
        match self {
            BackendAuthConfig::Password(password) => vec![
                Bytes::from_static(b"AUTH"),
                Bytes::from(password.clone()),
            ],
            BackendAuthConfig::Credential { username, password } => vec![
                Bytes::from_static(b"AUTH"),
                Bytes::from(username.clone()),
                Bytes::from(password.clone()),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Key prefix; empty or `"*"` matches every key.
    #[serde(default)]
    pub prefix: String,
    pub write_pool: String,
    #[serde(default)]
    pub read_pool: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<AuthUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUserConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Read,
    #[default]
    Write,
    Admin,
}

/// Watches the config file for the auxiliary reloader.
pub struct ConfigSource {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stamp = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self {
            path,
            last_modified: Mutex::new(stamp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the file changed since the last check.
    pub fn changed(&self) -> bool {
        let stamp = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(stamp) => stamp,
            Err(_) => return false,
        };
        let mut guard = self.last_modified.lock();
        if *guard != Some(stamp) {
            *guard = Some(stamp);
            return true;
        }
        false
    }

    pub fn load(&self) -> Result<Config> {
        Config::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[proxy]
name = "edge"
listen_addr = "127.0.0.1:6379"
thread = 2
hash_tag = "{}"
max_memory_mb = 64
request_timeout_ms = 500

[[pools]]
name = "main"
kind = "cluster"
servers = ["127.0.0.1:7000", "127.0.0.1:7001"]
read_from_replica = true

[[pools]]
name = "sessions"
kind = "standalone"

[[pools.groups]]
master = "127.0.0.1:7100"
replicas = ["127.0.0.1:7101"]

[[routes]]
prefix = "sess:"
write_pool = "sessions"

[[routes]]
prefix = "*"
write_pool = "main"

[auth]
users = [
    { username = "app", password = "secret" },
    { username = "ops", password = "super", role = "admin" },
]
"#;

    #[test]
    fn parses_full_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.proxy.worker_threads(), 2);
        assert_eq!(config.proxy.listen_port(), 6379);
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].kind, PoolKind::Cluster);
        // pool-level hash tag inherits from the proxy section
        assert_eq!(config.pools[0].hash_tag.as_deref(), Some("{}"));
        assert_eq!(config.pools[1].groups[0].replicas.len(), 1);
        assert_eq!(config.routes.len(), 2);
        let auth = config.auth.as_ref().unwrap();
        assert_eq!(auth.users[0].role, Role::Write);
        assert_eq!(auth.users[1].role, Role::Admin);
    }

    #[test]
    fn rejects_route_to_unknown_pool() {
        let raw = r#"
[proxy]
name = "edge"
listen_addr = "127.0.0.1:6379"

[[pools]]
name = "main"
kind = "cluster"
servers = ["127.0.0.1:7000"]

[[routes]]
prefix = "a:"
write_pool = "missing"
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn rejects_standalone_without_groups() {
        let raw = r#"
[proxy]
name = "edge"
listen_addr = "127.0.0.1:6379"

[[pools]]
name = "main"
kind = "standalone"
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn backend_auth_accepts_both_shapes() {
        let password = BackendAuthConfig::Password("pw".into());
        assert_eq!(password.command_parts().len(), 2);
        let credential = BackendAuthConfig::Credential {
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(credential.command_parts().len(), 3);
    }
}
