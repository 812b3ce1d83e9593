use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::auth::Authority;
use crate::config::{Config, ConfigSource, PoolKind};
use crate::info::ProxyMode;
use crate::metrics;
use crate::pool::{ClusterPool, ServerPool, StandalonePool};
use crate::reload;
use crate::route::{self, RouteHandle, RouteTable};
use crate::session::{self, Session};
use crate::utils;

/// Everything a session needs, owned per worker apart from the read-only
/// handles. Pools (and therefore backend connections) belong to exactly one
/// worker; only the route handle, the authority, and counters are shared.
pub struct ProxyShared {
    pub name: Arc<str>,
    pub pools: Vec<Arc<ServerPool>>,
    pub route: RouteHandle,
    pub authority: Arc<Authority>,
    pub request_timeout: Duration,
    pub listen_port: u16,
    pub advertise_ip: String,
    pool_kinds: Vec<PoolKind>,
}

impl ProxyShared {
    pub fn mode(&self) -> ProxyMode {
        let clusters = self
            .pool_kinds
            .iter()
            .filter(|kind| **kind == PoolKind::Cluster)
            .count();
        if clusters == self.pool_kinds.len() {
            ProxyMode::Cluster
        } else if clusters == 0 {
            ProxyMode::Standalone
        } else {
            ProxyMode::Mixed
        }
    }

    pub fn node_id(&self) -> u64 {
        session::node_id_for(&self.name, self.listen_port)
    }
}

/// Build one worker's view of the world. Must run inside that worker's
/// runtime: cluster pools spawn their topology fetchers here.
pub fn build_shared(
    config: &Config,
    route: RouteHandle,
    authority: Arc<Authority>,
) -> Result<Arc<ProxyShared>> {
    let mut pools = Vec::with_capacity(config.pools.len());
    let mut pool_kinds = Vec::with_capacity(config.pools.len());
    for pool_config in &config.pools {
        let pool = match pool_config.kind {
            PoolKind::Cluster => ServerPool::Cluster(ClusterPool::new(pool_config)?),
            PoolKind::Standalone => ServerPool::Standalone(StandalonePool::new(pool_config)?),
        };
        pools.push(Arc::new(pool));
        pool_kinds.push(pool_config.kind);
    }

    let listen: SocketAddr = config
        .proxy
        .listen_addr
        .parse()
        .context("invalid listen address")?;
    let advertise_ip = if listen.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        listen.ip().to_string()
    };

    Ok(Arc::new(ProxyShared {
        name: config.proxy.name.clone().into(),
        pools,
        route,
        authority,
        request_timeout: config.proxy.request_timeout(),
        listen_port: listen.port(),
        advertise_ip,
        pool_kinds,
    }))
}

/// Per-worker listener; the kernel balances accepts across workers.
pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// One worker's accept loop. An accepted socket is owned by this worker for
/// its whole life; sessions never migrate.
pub async fn serve_worker(
    shared: Arc<ProxyShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let shared = shared.clone();
                        sessions.spawn(async move {
                            if let Err(err) = Session::run(shared, socket).await {
                                debug!(client = %peer, error = %err, "session ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_finished) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace period expired with sessions still active");
        sessions.abort_all();
    }
    Ok(())
}

/// Process entry: spawn workers, the auxiliary reloader, and the metrics
/// exporter, then wait for a shutdown signal.
///
/// Teardown order is workers, then the auxiliary thread; the process exits
/// zero on a signal-driven stop and non-zero on an init failure.
pub fn run(config: Config, source: ConfigSource) -> Result<()> {
    metrics::register_version(env!("CARGO_PKG_VERSION"));
    if let Some(megabytes) = config.proxy.max_memory_mb {
        utils::set_memory_limit(megabytes * 1024 * 1024);
    }

    let authority = Authority::from_config(config.auth.as_ref());
    let pool_names = config.pool_names();
    let route = route::new_handle(RouteTable::from_config(&config, &pool_names)?);

    let listen_addr: SocketAddr = config
        .proxy
        .listen_addr
        .parse()
        .context("invalid listen address")?;
    let workers = config.proxy.worker_threads();
    info!(
        proxy = %config.proxy.name,
        listen = %listen_addr,
        workers,
        pools = config.pools.len(),
        "starting workers"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let config = config.clone();
        let route = route.clone();
        let authority = authority.clone();
        let shutdown_rx = shutdown_rx.clone();
        let ready_tx = ready_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker-{}", config.proxy.name, index))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match bind_reuseport(listen_addr) {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let shared = match build_shared(&config, route, authority) {
                        Ok(shared) => shared,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    if let Err(err) = serve_worker(shared, listener, shutdown_rx).await {
                        error!(error = %err, "worker exited with error");
                    }
                });
            })
            .context("failed to spawn worker thread")?;
        handles.push(handle);
    }
    drop(ready_tx);

    // every worker must come up before the proxy counts as started
    for _ in 0..workers {
        match ready_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                stop_flag.store(true, Ordering::Relaxed);
                let _ = shutdown_tx.send(true);
                return Err(err.context("worker failed to initialize"));
            }
            Err(_) => {
                stop_flag.store(true, Ordering::Relaxed);
                let _ = shutdown_tx.send(true);
                return Err(anyhow!("worker startup timed out"));
            }
        }
    }

    let auxiliary = reload::spawn(source, route.clone(), pool_names, stop_flag.clone());

    if let Some(port) = config.proxy.metrics_port {
        std::thread::Builder::new()
            .name("sedum-metrics".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("metrics runtime must build");
                if let Err(err) = runtime.block_on(metrics::run_http_server(port)) {
                    error!(error = %err, "metrics server exited");
                }
            })
            .context("failed to spawn metrics thread")?;
    }

    let signal_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    signal_runtime.block_on(wait_for_shutdown())?;

    info!("shutdown requested, draining workers");
    stop_flag.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked during shutdown");
        }
    }
    let _ = auxiliary.join();
    info!("bye");
    Ok(())
}

/// INT and TERM stop the proxy; HUP is ignored (reload is mtime driven).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = interrupt.recv() => return Ok(()),
                _ = terminate.recv() => return Ok(()),
                _ = hangup.recv() => {
                    debug!("SIGHUP ignored; route reload is driven by config mtime");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
