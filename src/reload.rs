use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ConfigSource;
use crate::metrics;
use crate::route::{RouteHandle, RouteTable};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The auxiliary controller: wakes once a second and, when the config file
/// changed, rebuilds the route table and publishes it through the shared
/// handle. Server pool lists are never swapped at runtime; a pool rename or
/// removal requires a restart and is rejected here.
pub fn spawn(
    source: ConfigSource,
    route: RouteHandle,
    pool_names: Vec<String>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("sedum-aux".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_INTERVAL);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if !source.changed() {
                    continue;
                }

                let config = match source.load() {
                    Ok(config) => config,
                    Err(err) => {
                        warn!(error = %err, "config reload failed, keeping current routes");
                        continue;
                    }
                };

                match RouteTable::from_config(&config, &pool_names) {
                    Ok(table) => {
                        let entries = table.entry_count();
                        route.store(Arc::new(table));
                        let version = metrics::stats_version_bump();
                        info!(entries, version, "route table published");
                    }
                    Err(err) => {
                        warn!(error = %err, "new routes rejected, keeping current table");
                    }
                }
            }
        })
        .expect("failed to spawn auxiliary thread")
}
