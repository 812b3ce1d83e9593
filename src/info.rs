use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::metrics;
use crate::utils;

static START_TIME: Lazy<SystemTime> = Lazy::new(SystemTime::now);

#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    Standalone,
    Cluster,
    Mixed,
}

impl ProxyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyMode::Standalone => "standalone",
            ProxyMode::Cluster => "cluster",
            ProxyMode::Mixed => "mixed",
        }
    }
}

pub struct InfoContext<'a> {
    pub proxy: &'a str,
    pub mode: ProxyMode,
    pub listen_port: u16,
    pub pool_count: usize,
    pub backend_nodes: usize,
}

/// Render the payload of a synthesized `INFO [section]` reply.
pub fn render_info(context: InfoContext<'_>, section: Option<&str>) -> Bytes {
    let uptime = SystemTime::now()
        .duration_since(*START_TIME)
        .unwrap_or_default()
        .as_secs();
    let startup_unix = START_TIME
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let commands_ok = metrics::front_commands(context.proxy, "ok");
    let commands_fail = metrics::front_commands(context.proxy, "fail");

    let sections: Vec<(&str, Vec<(String, String)>)> = vec![
        (
            "Server",
            vec![
                ("sedum_version".into(), env!("CARGO_PKG_VERSION").into()),
                ("sedum_mode".into(), context.mode.as_str().into()),
                ("proxy_name".into(), context.proxy.into()),
                ("process_id".into(), std::process::id().to_string()),
                ("tcp_port".into(), context.listen_port.to_string()),
                ("os".into(), std::env::consts::OS.into()),
                ("startup_time_unix".into(), startup_unix.to_string()),
                ("uptime_in_seconds".into(), uptime.to_string()),
                ("uptime_in_days".into(), (uptime / 86_400).to_string()),
            ],
        ),
        (
            "Clients",
            vec![
                (
                    "connected_clients".into(),
                    metrics::front_connections_current(context.proxy).to_string(),
                ),
                (
                    "total_connections_received".into(),
                    metrics::front_connections_total(context.proxy).to_string(),
                ),
            ],
        ),
        (
            "Stats",
            vec![
                (
                    "total_commands_processed".into(),
                    (commands_ok + commands_fail).to_string(),
                ),
                ("total_commands_failed".into(), commands_fail.to_string()),
                (
                    "global_error_count".into(),
                    metrics::global_error_count().to_string(),
                ),
                (
                    "stats_version".into(),
                    metrics::stats_version().to_string(),
                ),
            ],
        ),
        (
            "Memory",
            vec![
                ("used_memory".into(), utils::memory_in_use().to_string()),
                ("maxmemory".into(), utils::memory_limit().to_string()),
            ],
        ),
        (
            "Proxy",
            vec![
                ("proxy_mode".into(), context.mode.as_str().into()),
                ("server_pools".into(), context.pool_count.to_string()),
                ("backend_nodes".into(), context.backend_nodes.to_string()),
            ],
        ),
    ];

    let filter = section
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty() && s != "all" && s != "default" && s != "everything");

    let mut output = String::new();
    for (name, entries) in sections {
        if let Some(wanted) = &filter {
            if wanted != &name.to_ascii_lowercase() {
                continue;
            }
        }
        if !output.is_empty() {
            output.push_str("\r\n");
        }
        output.push_str("# ");
        output.push_str(name);
        output.push_str("\r\n");
        for (key, value) in entries {
            output.push_str(&key);
            output.push(':');
            output.push_str(&value);
            output.push_str("\r\n");
        }
    }

    if output.is_empty() {
        output.push_str("\r\n");
    }
    Bytes::from(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InfoContext<'static> {
        InfoContext {
            proxy: "info-test",
            mode: ProxyMode::Cluster,
            listen_port: 6379,
            pool_count: 2,
            backend_nodes: 6,
        }
    }

    #[test]
    fn renders_all_sections_by_default() {
        let payload = render_info(context(), None);
        let text = std::str::from_utf8(&payload).unwrap();
        assert!(text.contains("# Server"));
        assert!(text.contains("# Stats"));
        assert!(text.contains("sedum_mode:cluster"));
        assert!(text.contains("tcp_port:6379"));
        assert!(text.contains("server_pools:2"));
    }

    #[test]
    fn section_filter_narrows_output() {
        let payload = render_info(context(), Some("memory"));
        let text = std::str::from_utf8(&payload).unwrap();
        assert!(text.contains("# Memory"));
        assert!(!text.contains("# Server"));
    }
}
