use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::auth::SessionAuth;
use crate::backend::{BackendNode, ClientId, FrontConnectionGuard};
use crate::config::Role;
use crate::error::ProxyError;
use crate::info::{render_info, InfoContext};
use crate::metrics;
use crate::pool::ServerPool;
use crate::protocol::redis::{
    encode_scan_cursor, parse_scan_cursor, CmdKind, MultiDispatch, RedisCommand, RespCodec,
    RespValue, SubscriptionKind,
};
use crate::proxy::ProxyShared;
use crate::utils;

/// Upper bound of unanswered requests queued per client connection.
const PIPELINE_LIMIT: usize = 1024;
const TXN_QUEUE_LIMIT: usize = 10_000;

type RespFramed = Framed<TcpStream, RespCodec>;
type PendingReply = BoxFuture<'static, RespValue>;

enum Action {
    /// No reply at all (empty inline lines and the like).
    Ignore,
    Reply(RespValue),
    Dispatch(PendingReply),
    Subscribe(RedisCommand, Arc<ServerPool>),
    /// Reply, then close once the reply queue drained.
    Quit(RespValue),
}

enum Outcome {
    Closed,
    Subscribe {
        framed: RespFramed,
        command: RedisCommand,
        pool: Arc<ServerPool>,
    },
}

struct TxnQueue {
    commands: Vec<RedisCommand>,
    pool: Option<Arc<ServerPool>>,
    node: Option<BackendNode>,
    aborted: bool,
}

impl TxnQueue {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            pool: None,
            node: None,
            aborted: false,
        }
    }
}

/// One client connection: parses requests, runs the per-session state
/// machine, and drains replies strictly in arrival order.
pub struct Session {
    shared: Arc<ProxyShared>,
    client_id: ClientId,
    peer: String,
    auth: SessionAuth,
    db: u32,
    txn: Option<TxnQueue>,
}

impl Session {
    pub async fn run(shared: Arc<ProxyShared>, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true)?;
        let peer = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let name = shared.name.clone();
        let _guard = FrontConnectionGuard::new(&name);

        let mut session = Session {
            auth: shared.authority.new_session(),
            shared,
            client_id: ClientId::next(),
            peer,
            db: 0,
            txn: None,
        };

        let mut framed = Framed::new(socket, RespCodec);
        loop {
            match session.serve_pipelined(framed).await? {
                Outcome::Closed => return Ok(()),
                Outcome::Subscribe {
                    framed: restored,
                    command,
                    pool,
                } => match session.run_subscription(restored, command, pool).await? {
                    Some(resumed) => framed = resumed,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Normal request/reply mode.
    ///
    /// Replies collect in a `FuturesOrdered` queue and are written back in
    /// request-arrival order no matter how backends interleave; dropping
    /// the queue on disconnect orphans outstanding requests without
    /// touching backend FIFOs.
    async fn serve_pipelined(&mut self, framed: RespFramed) -> Result<Outcome> {
        let (mut sink, stream) = framed.split();
        let mut stream = stream.fuse();
        let mut pending: FuturesOrdered<PendingReply> = FuturesOrdered::new();
        let mut inflight = 0usize;
        let mut stream_closed = false;
        let mut quitting = false;
        let mut enter_sub: Option<(RedisCommand, Arc<ServerPool>)> = None;

        loop {
            tokio::select! {
                Some(resp) = pending.next(), if inflight > 0 => {
                    inflight -= 1;
                    metrics::front_command(&self.shared.name, !resp.is_error());
                    sink.send(resp).await?;
                }
                frame_opt = stream.next(),
                    if !stream_closed && !quitting && enter_sub.is_none()
                        && inflight < PIPELINE_LIMIT =>
                {
                    match frame_opt {
                        Some(Ok(frame)) => match self.on_frame(frame) {
                            Action::Ignore => {}
                            Action::Reply(resp) => {
                                pending.push_back(Box::pin(async move { resp }));
                                inflight += 1;
                            }
                            Action::Dispatch(fut) => {
                                pending.push_back(fut);
                                inflight += 1;
                            }
                            Action::Quit(resp) => {
                                pending.push_back(Box::pin(async move { resp }));
                                inflight += 1;
                                quitting = true;
                            }
                            Action::Subscribe(command, pool) => {
                                enter_sub = Some((command, pool));
                            }
                        },
                        Some(Err(err)) => {
                            // malformed RESP is terminal for the session
                            metrics::global_error_incr();
                            warn!(client = %self.peer, error = %err, "protocol error, closing");
                            return Ok(Outcome::Closed);
                        }
                        None => stream_closed = true,
                    }
                }
                else => {}
            }

            if inflight == 0 {
                if let Some((command, pool)) = enter_sub.take() {
                    let framed = sink
                        .reunite(stream.into_inner())
                        .map_err(|_| anyhow!("failed to reassemble client stream"))?;
                    return Ok(Outcome::Subscribe {
                        framed,
                        command,
                        pool,
                    });
                }
                if quitting {
                    let _ = sink.close().await;
                    return Ok(Outcome::Closed);
                }
                if stream_closed {
                    return Ok(Outcome::Closed);
                }
            }
        }
    }

    fn on_frame(&mut self, frame: RespValue) -> Action {
        if matches!(&frame, RespValue::Array(items) if items.is_empty()) {
            return Action::Ignore;
        }
        match RedisCommand::from_resp(frame) {
            Ok(command) => self.handle_command(command),
            Err(err) => {
                metrics::global_error_incr();
                Action::Quit(RespValue::error(format!("ERR Protocol error: {err}")))
            }
        }
    }

    fn handle_command(&mut self, command: RedisCommand) -> Action {
        let spec = match command.validate() {
            Ok(spec) => spec,
            Err(err) => {
                if let Some(txn) = self.txn.as_mut() {
                    txn.aborted = true;
                }
                return Action::Reply(err.to_resp());
            }
        };

        if !self.auth.authenticated && !SessionAuth::allowed_preauth(&command) {
            return Action::Reply(ProxyError::NoAuth.to_resp());
        }

        match command.name() {
            b"AUTH" => {
                let reply = self
                    .shared
                    .authority
                    .process_auth(&mut self.auth, &command);
                return Action::Reply(reply);
            }
            b"HELLO" => return Action::Reply(self.handle_hello(&command)),
            _ => {}
        }

        if !self.shared.authority.permits(self.auth.role, spec.kind) {
            return Action::Reply(ProxyError::NoPermission(command.name_lossy()).to_resp());
        }

        if self.txn.is_some() {
            return self.handle_in_txn(command);
        }

        match spec.kind {
            CmdKind::Ctrl => self.handle_ctrl(command),
            CmdKind::Txn => self.handle_txn_boundary(command),
            CmdKind::Sub => self.handle_subscribe_entry(command),
            CmdKind::NotSupport => Action::Reply(RespValue::error(format!(
                "ERR unsupported command '{}'",
                command.name_lossy()
            ))),
            CmdKind::Read | CmdKind::Write => self.dispatch_data(command),
        }
    }

    // ---- transactions -------------------------------------------------

    fn handle_txn_boundary(&mut self, command: RedisCommand) -> Action {
        match command.name() {
            b"MULTI" => {
                if self.shared.pools.is_empty() {
                    return Action::Reply(ProxyError::NoRoute.to_resp());
                }
                self.txn = Some(TxnQueue::new());
                Action::Reply(RespValue::ok())
            }
            b"EXEC" => Action::Reply(RespValue::error(b"ERR EXEC without MULTI".as_ref())),
            b"DISCARD" => Action::Reply(RespValue::error(b"ERR DISCARD without MULTI".as_ref())),
            _ => Action::Reply(RespValue::error(b"ERR unknown transaction command".as_ref())),
        }
    }

    fn handle_in_txn(&mut self, command: RedisCommand) -> Action {
        match command.name() {
            b"MULTI" => {
                return Action::Reply(RespValue::error(
                    b"ERR MULTI calls can not be nested".as_ref(),
                ))
            }
            b"DISCARD" => {
                self.txn = None;
                return Action::Reply(RespValue::ok());
            }
            b"EXEC" => {
                let queue = self.txn.take().expect("txn state checked by caller");
                return self.exec_transaction(queue);
            }
            _ => {}
        }

        if command.subscription_kind() != SubscriptionKind::None {
            // second open question: pubsub inside MULTI is refused
            if let Some(txn) = self.txn.as_mut() {
                txn.aborted = true;
            }
            return Action::Reply(RespValue::error(
                b"ERR SUBSCRIBE is not allowed in transactions".as_ref(),
            ));
        }

        let sticky = self.resolve_txn_target(&command);
        let txn = self.txn.as_mut().expect("txn state checked by caller");
        match sticky {
            Ok(()) => {
                if txn.commands.len() >= TXN_QUEUE_LIMIT {
                    txn.aborted = true;
                    return Action::Reply(RespValue::error(
                        b"ERR transaction queue is too large".as_ref(),
                    ));
                }
                txn.commands.push(command);
                Action::Reply(RespValue::queued())
            }
            Err(err) => {
                txn.aborted = true;
                Action::Reply(err.to_resp())
            }
        }
    }

    /// Pin the sticky backend off the first key-bearing queued command.
    fn resolve_txn_target(&mut self, command: &RedisCommand) -> Result<(), ProxyError> {
        let needs_node = self
            .txn
            .as_ref()
            .map(|txn| txn.node.is_none())
            .unwrap_or(false);
        if !needs_node {
            return Ok(());
        }
        let key = match command.primary_key() {
            Some(key) => key.to_vec(),
            None => return Ok(()),
        };

        let table = self.shared.route.load();
        let index = table.route(&key, true).ok_or(ProxyError::NoRoute)?;
        let pool = self.shared.pools[index].clone();
        if !pool.supports_transactions() {
            return Err(ProxyError::Other(
                "MULTI is not supported on a multi-group standalone pool".to_string(),
            ));
        }
        let node = pool.pick_master(command)?;
        if let Some(txn) = self.txn.as_mut() {
            txn.pool = Some(pool);
            txn.node = Some(node);
        }
        Ok(())
    }

    fn exec_transaction(&mut self, queue: TxnQueue) -> Action {
        if queue.aborted {
            return Action::Reply(RespValue::error(
                b"EXECABORT Transaction discarded because of previous errors.".as_ref(),
            ));
        }
        if queue.commands.is_empty() {
            return Action::Reply(RespValue::Array(Vec::new()));
        }

        let fallback_pool = self.shared.pools.first().cloned();
        let db = self.db;
        // the deadline covers the pipelined block as a whole
        let deadline = self.shared.request_timeout * (queue.commands.len() as u32 + 2);
        let proxy = self.shared.name.clone();

        Action::Dispatch(Box::pin(async move {
            let _tracker = metrics::total_tracker(&proxy);
            match timeout(deadline, run_exec(queue, fallback_pool, db)).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    metrics::global_error_incr();
                    err.to_resp()
                }
                Err(_) => ProxyError::Timeout.to_resp(),
            }
        }))
    }

    // ---- plain keyed traffic ------------------------------------------

    fn dispatch_data(&mut self, command: RedisCommand) -> Action {
        let key = command.primary_key().map(<[u8]>::to_vec).unwrap_or_default();
        let table = self.shared.route.load();
        let index = match table.route(&key, !command.is_read_only()) {
            Some(index) => index,
            None => return Action::Reply(ProxyError::NoRoute.to_resp()),
        };
        let pool = self.shared.pools[index].clone();

        let frame_size: u64 = command
            .args()
            .iter()
            .map(|arg| arg.len() as u64 + 16)
            .sum();
        let charge = match utils::reserve_memory(frame_size) {
            Some(charge) => charge,
            None => return Action::Reply(ProxyError::OutOfMemory.to_resp()),
        };

        let db = self.db;
        let deadline = self.shared.request_timeout;
        let proxy = self.shared.name.clone();

        if pool.split_multi_key() {
            if let Some(multi) = command.expand_for_multi() {
                return Action::Dispatch(Box::pin(async move {
                    let _charge = charge;
                    let _tracker = metrics::total_tracker(&proxy);
                    match timeout(deadline, run_scatter(pool, multi, db)).await {
                        Ok(Ok(resp)) => resp,
                        Ok(Err(err)) => {
                            metrics::global_error_incr();
                            err.to_resp()
                        }
                        Err(_) => ProxyError::Timeout.to_resp(),
                    }
                }));
            }
        }

        if command.is_blocking() {
            // blocking commands honor their own timeout semantics; the
            // proxy deadline does not apply
            return Action::Dispatch(Box::pin(async move {
                let _charge = charge;
                let _tracker = metrics::total_tracker(&proxy);
                match run_blocking(pool, command, db).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        metrics::global_error_incr();
                        err.to_resp()
                    }
                }
            }));
        }

        Action::Dispatch(Box::pin(async move {
            let _charge = charge;
            let _tracker = metrics::total_tracker(&proxy);
            match timeout(deadline, pool.dispatch(&command, db)).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    metrics::global_error_incr();
                    err.to_resp()
                }
                Err(_) => ProxyError::Timeout.to_resp(),
            }
        }))
    }

    // ---- control plane ------------------------------------------------

    fn handle_ctrl(&mut self, command: RedisCommand) -> Action {
        match command.name() {
            b"PING" => match command.arg(1) {
                Some(payload) => Action::Reply(RespValue::BulkString(payload.clone())),
                None => Action::Reply(RespValue::pong()),
            },
            b"ECHO" => Action::Reply(RespValue::BulkString(
                command.arg(1).cloned().unwrap_or_default(),
            )),
            b"QUIT" => Action::Quit(RespValue::ok()),
            b"SELECT" => self.handle_select(&command),
            b"INFO" => {
                let section = command
                    .arg(1)
                    .and_then(|arg| std::str::from_utf8(arg).ok().map(str::to_string));
                let backend_nodes = self
                    .shared
                    .pools
                    .iter()
                    .map(|pool| pool.backend_count())
                    .sum();
                let payload = render_info(
                    InfoContext {
                        proxy: &self.shared.name,
                        mode: self.shared.mode(),
                        listen_port: self.shared.listen_port,
                        pool_count: self.shared.pools.len(),
                        backend_nodes,
                    },
                    section.as_deref(),
                );
                Action::Reply(RespValue::BulkString(payload))
            }
            b"CONFIG" => self.handle_config(&command),
            b"CLUSTER" => self.handle_cluster(&command),
            b"COMMAND" => Action::Reply(RespValue::NullArray),
            b"READONLY" | b"READWRITE" => Action::Reply(RespValue::ok()),
            b"SCAN" => self.dispatch_scan(command),
            other => Action::Reply(RespValue::error(format!(
                "ERR unsupported command '{}'",
                String::from_utf8_lossy(other).to_ascii_lowercase()
            ))),
        }
    }

    fn handle_select(&mut self, command: &RedisCommand) -> Action {
        let db = command
            .arg(1)
            .and_then(|arg| std::str::from_utf8(arg).ok())
            .and_then(|text| text.parse::<u32>().ok());
        let db = match db {
            Some(db) => db,
            None => {
                return Action::Reply(RespValue::error(b"ERR invalid DB index".as_ref()));
            }
        };
        if !self.shared.pools.iter().all(|pool| pool.supports_db(db)) {
            return Action::Reply(RespValue::error(b"ERR DB index is out of range".as_ref()));
        }
        self.db = db;
        Action::Reply(RespValue::ok())
    }

    fn handle_config(&mut self, command: &RedisCommand) -> Action {
        let sub = command
            .arg(1)
            .map(|arg| arg.to_ascii_uppercase())
            .unwrap_or_default();
        match sub.as_slice() {
            b"GET" => {
                let param = match command.arg(2) {
                    Some(param) => param.to_ascii_lowercase(),
                    None => {
                        return Action::Reply(
                            ProxyError::WrongArgCount("config|get".to_string()).to_resp(),
                        )
                    }
                };
                let value = match param.as_slice() {
                    b"maxmemory" => Some(utils::memory_limit().to_string()),
                    b"timeout" => Some(self.shared.request_timeout.as_millis().to_string()),
                    b"proxy-name" => Some(self.shared.name.to_string()),
                    _ => None,
                };
                match value {
                    Some(value) => Action::Reply(RespValue::Array(vec![
                        RespValue::BulkString(Bytes::from(param.to_vec())),
                        RespValue::bulk(value.as_bytes()),
                    ])),
                    None => Action::Reply(RespValue::Array(Vec::new())),
                }
            }
            b"SET" => {
                if self.auth.role != Role::Admin {
                    return Action::Reply(
                        ProxyError::NoPermission("config|set".to_string()).to_resp(),
                    );
                }
                let (param, value) = match (command.arg(2), command.arg(3)) {
                    (Some(param), Some(value)) => (param.to_ascii_lowercase(), value),
                    _ => {
                        return Action::Reply(
                            ProxyError::WrongArgCount("config|set".to_string()).to_resp(),
                        )
                    }
                };
                match param.as_slice() {
                    b"maxmemory" => {
                        let bytes = std::str::from_utf8(value)
                            .ok()
                            .and_then(|text| text.parse::<u64>().ok());
                        match bytes {
                            Some(bytes) => {
                                utils::set_memory_limit(bytes);
                                Action::Reply(RespValue::ok())
                            }
                            None => Action::Reply(RespValue::error(
                                b"ERR argument must be a byte count".as_ref(),
                            )),
                        }
                    }
                    _ => Action::Reply(RespValue::error(
                        b"ERR Unsupported CONFIG parameter".as_ref(),
                    )),
                }
            }
            _ => Action::Reply(RespValue::error(
                b"ERR CONFIG subcommand must be GET or SET".as_ref(),
            )),
        }
    }

    /// The proxy presents itself as a single-node cluster, the way other
    /// cluster-aware clients expect.
    fn handle_cluster(&self, command: &RedisCommand) -> Action {
        let sub = command
            .arg(1)
            .map(|arg| arg.to_ascii_uppercase())
            .unwrap_or_default();
        let ip = self.shared.advertise_ip.clone();
        let port = self.shared.listen_port;
        match sub.as_slice() {
            b"INFO" => Action::Reply(RespValue::bulk(
                b"cluster_enabled:1\r\ncluster_state:ok\r\ncluster_slots_assigned:16384\r\n\
                  cluster_slots_ok:16384\r\ncluster_known_nodes:1\r\ncluster_size:1\r\n"
                    .as_ref(),
            )),
            b"NODES" => {
                let line = format!(
                    "{:040x} {}:{}@{} myself,master - 0 0 0 connected 0-16383\n",
                    self.shared.node_id(),
                    ip,
                    port,
                    port as u32 + 10_000,
                );
                Action::Reply(RespValue::bulk(line.as_bytes()))
            }
            b"SLOTS" => Action::Reply(RespValue::Array(vec![RespValue::Array(vec![
                RespValue::Integer(0),
                RespValue::Integer(16_383),
                RespValue::Array(vec![
                    RespValue::bulk(ip.as_bytes()),
                    RespValue::Integer(port as i64),
                ]),
            ])])),
            _ => Action::Reply(RespValue::error(
                b"ERR CLUSTER subcommand must be NODES, SLOTS or INFO".as_ref(),
            )),
        }
    }

    fn handle_hello(&mut self, command: &RedisCommand) -> RespValue {
        let mut idx = 1usize;
        if let Some(proto) = command.arg(1) {
            if !proto.eq_ignore_ascii_case(b"AUTH") && !proto.eq_ignore_ascii_case(b"SETNAME") {
                if proto.as_ref() != b"2" {
                    return RespValue::error(
                        b"NOPROTO unsupported protocol version".as_ref(),
                    );
                }
                idx = 2;
            }
        }

        // optional AUTH <user> <pass> clause
        while idx < command.args().len() {
            let token = &command.args()[idx];
            if token.eq_ignore_ascii_case(b"AUTH") {
                match (command.arg(idx + 1), command.arg(idx + 2)) {
                    (Some(user), Some(pass)) => {
                        let auth = RedisCommand::new(vec![
                            Bytes::from_static(b"AUTH"),
                            user.clone(),
                            pass.clone(),
                        ])
                        .expect("AUTH frame is valid");
                        let reply = self.shared.authority.process_auth(&mut self.auth, &auth);
                        if reply.is_error() {
                            return reply;
                        }
                        idx += 3;
                    }
                    _ => return ProxyError::WrongArgCount("hello".to_string()).to_resp(),
                }
            } else if token.eq_ignore_ascii_case(b"SETNAME") {
                idx += 2;
            } else {
                idx += 1;
            }
        }

        if !self.auth.authenticated {
            return ProxyError::NoAuth.to_resp();
        }

        RespValue::Array(vec![
            RespValue::bulk(b"server".as_ref()),
            RespValue::bulk(b"redis".as_ref()),
            RespValue::bulk(b"version".as_ref()),
            RespValue::bulk(env!("CARGO_PKG_VERSION").as_bytes()),
            RespValue::bulk(b"proto".as_ref()),
            RespValue::Integer(2),
            RespValue::bulk(b"id".as_ref()),
            RespValue::Integer(self.client_id.as_u64() as i64),
            RespValue::bulk(b"mode".as_ref()),
            RespValue::bulk(self.shared.mode().as_str().as_bytes()),
            RespValue::bulk(b"role".as_ref()),
            RespValue::bulk(b"master".as_ref()),
            RespValue::bulk(b"modules".as_ref()),
            RespValue::Array(Vec::new()),
        ])
    }

    // ---- SCAN fan-out -------------------------------------------------

    fn dispatch_scan(&self, command: RedisCommand) -> Action {
        let table = self.shared.route.load();
        let index = match table.route(b"", false) {
            Some(index) => index,
            None => return Action::Reply(ProxyError::NoRoute.to_resp()),
        };
        let pool = self.shared.pools[index].clone();
        let db = self.db;
        let deadline = self.shared.request_timeout;
        Action::Dispatch(Box::pin(async move {
            match timeout(deadline, run_scan(pool, command, db)).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => err.to_resp(),
                Err(_) => ProxyError::Timeout.to_resp(),
            }
        }))
    }

    // ---- subscribe mode -----------------------------------------------

    fn handle_subscribe_entry(&mut self, command: RedisCommand) -> Action {
        match command.subscription_kind() {
            SubscriptionKind::Channel | SubscriptionKind::Pattern => {
                let channel = command.primary_key().map(<[u8]>::to_vec).unwrap_or_default();
                let table = self.shared.route.load();
                let index = match table.route(&channel, false) {
                    Some(index) => index,
                    None => return Action::Reply(ProxyError::NoRoute.to_resp()),
                };
                Action::Subscribe(command, self.shared.pools[index].clone())
            }
            _ => Action::Reply(RespValue::error(
                b"ERR unsubscribe without an active subscription".as_ref(),
            )),
        }
    }

    /// Subscribed mode: one pinned backend connection relayed in both
    /// directions until the subscription count drops to zero.
    async fn run_subscription(
        &mut self,
        framed: RespFramed,
        command: RedisCommand,
        pool: Arc<ServerPool>,
    ) -> Result<Option<RespFramed>> {
        let node = match pool.pick_master(&command) {
            Ok(node) => node,
            Err(err) => {
                let mut framed = framed;
                framed.send(err.to_resp()).await?;
                return Ok(Some(framed));
            }
        };
        let mut backend = match pool.open_exclusive(&node).await {
            Ok(backend) => backend,
            Err(_) => {
                let mut framed = framed;
                framed
                    .send(ProxyError::BackendDown(node.as_str().to_string()).to_resp())
                    .await?;
                return Ok(Some(framed));
            }
        };
        debug!(client = %self.peer, backend = %node, "entering subscribe mode");
        backend.send(command.to_resp()).await?;

        let (mut front_sink, mut front_stream) = framed.split();
        let mut stay_subscribed = true;

        while stay_subscribed {
            tokio::select! {
                backend_frame = backend.next() => {
                    match backend_frame {
                        Some(Ok(frame)) => {
                            if let Some(count) = subscription_count(&frame) {
                                front_sink.send(frame).await?;
                                if count == 0 {
                                    stay_subscribed = false;
                                }
                            } else {
                                front_sink.send(frame).await?;
                            }
                        }
                        Some(Err(_)) | None => {
                            let _ = front_sink
                                .send(
                                    ProxyError::BackendDown(node.as_str().to_string()).to_resp(),
                                )
                                .await;
                            return Ok(None);
                        }
                    }
                }
                front_frame = front_stream.next() => {
                    match front_frame {
                        Some(Ok(frame)) => {
                            let command = match RedisCommand::from_resp(frame) {
                                Ok(command) => command,
                                Err(_) => return Ok(None),
                            };
                            match command.subscription_kind() {
                                SubscriptionKind::None => match command.name() {
                                    b"PING" => front_sink.send(RespValue::pong()).await?,
                                    b"QUIT" => {
                                        front_sink.send(RespValue::ok()).await?;
                                        return Ok(None);
                                    }
                                    _ => {
                                        front_sink
                                            .send(RespValue::error(
                                                b"ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT allowed"
                                                    .as_ref(),
                                            ))
                                            .await?
                                    }
                                },
                                _ => backend.send(command.to_resp()).await?,
                            }
                        }
                        Some(Err(_)) | None => return Ok(None),
                    }
                }
            }
        }

        let framed = front_sink
            .reunite(front_stream)
            .map_err(|_| anyhow!("failed to reassemble client stream"))?;
        Ok(Some(framed))
    }
}

// ---- dispatch helpers (owned futures on the reply queue) ---------------

async fn run_scatter(
    pool: Arc<ServerPool>,
    multi: MultiDispatch,
    db: u32,
) -> Result<RespValue, ProxyError> {
    let MultiDispatch {
        subcommands,
        aggregator,
        key_count,
    } = multi;

    let mut tasks: FuturesOrdered<BoxFuture<'static, Result<(usize, RespValue), ProxyError>>> =
        FuturesOrdered::new();
    for sub in subcommands {
        let pool = pool.clone();
        tasks.push_back(Box::pin(async move {
            let resp = pool.dispatch(&sub.command, db).await?;
            Ok((sub.position, resp))
        }));
    }

    let mut responses = Vec::with_capacity(key_count);
    while let Some(item) = tasks.next().await {
        responses.push(item?);
    }
    aggregator
        .combine(key_count, responses)
        .map_err(|err| ProxyError::Other(err.to_string()))
}

async fn run_blocking(
    pool: Arc<ServerPool>,
    command: RedisCommand,
    db: u32,
) -> Result<RespValue, ProxyError> {
    let node = pool.pick_master(&command)?;
    let mut framed = pool
        .open_exclusive(&node)
        .await
        .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;
    if db != 0 {
        exchange(&mut framed, crate::protocol::redis::new_select_command(db), &node).await?;
    }
    exchange(&mut framed, command, &node).await
}

async fn run_scan(
    pool: Arc<ServerPool>,
    command: RedisCommand,
    db: u32,
) -> Result<RespValue, ProxyError> {
    let cursor_arg = command.arg(1).ok_or(ProxyError::InvalidCursor)?;
    let (node_index, native) = parse_scan_cursor(cursor_arg)?;
    let targets = pool.scan_targets();
    if targets.is_empty() {
        return Err(ProxyError::ClusterDown);
    }
    if node_index >= targets.len() {
        return Err(ProxyError::InvalidCursor);
    }

    let mut parts: Vec<Bytes> = command.args().to_vec();
    parts[1] = native;
    let rewritten =
        RedisCommand::new(parts).map_err(|err| ProxyError::Other(err.to_string()))?;

    let reply = pool.dispatch_to(&targets[node_index], &rewritten, db).await?;
    match reply {
        RespValue::Array(mut items) if items.len() == 2 => {
            let returned = items[0]
                .as_bytes()
                .ok_or_else(|| ProxyError::Other("malformed SCAN cursor reply".to_string()))?
                .to_vec();
            items[0] = RespValue::BulkString(encode_scan_cursor(
                node_index,
                &returned,
                targets.len(),
            ));
            Ok(RespValue::Array(items))
        }
        reply @ RespValue::Error(_) => Ok(reply),
        _ => Err(ProxyError::Other("unexpected SCAN reply shape".to_string())),
    }
}

async fn run_exec(
    queue: TxnQueue,
    fallback_pool: Option<Arc<ServerPool>>,
    db: u32,
) -> Result<RespValue, ProxyError> {
    let pool = queue
        .pool
        .or(fallback_pool)
        .ok_or(ProxyError::NoRoute)?;
    let node = match queue.node {
        Some(node) => node,
        // every queued command was keyless; pin wherever the pool starts
        None => pool.first_master()?,
    };

    let mut framed = pool
        .open_exclusive(&node)
        .await
        .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;

    if db != 0 {
        let select = exchange(
            &mut framed,
            crate::protocol::redis::new_select_command(db),
            &node,
        )
        .await?;
        if select.is_error() {
            return Ok(select);
        }
    }

    // MULTI, the queued block, and EXEC travel as one pipelined write
    let multi = RedisCommand::new(vec![Bytes::from_static(b"MULTI")])
        .expect("MULTI frame is valid");
    let exec = RedisCommand::new(vec![Bytes::from_static(b"EXEC")])
        .expect("EXEC frame is valid");
    let queued_count = queue.commands.len();

    framed
        .feed(multi.to_resp())
        .await
        .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;
    for command in &queue.commands {
        framed
            .feed(command.to_resp())
            .await
            .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;
    }
    framed
        .send(exec.to_resp())
        .await
        .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;

    let multi_reply = next_frame(&mut framed, &node).await?;
    if multi_reply.is_error() {
        return Ok(multi_reply);
    }
    for _ in 0..queued_count {
        // +QUEUED acknowledgements (or queue-time errors folded into EXEC)
        let _ = next_frame(&mut framed, &node).await?;
    }
    next_frame(&mut framed, &node).await
}

async fn exchange(
    framed: &mut RespFramed,
    command: RedisCommand,
    node: &BackendNode,
) -> Result<RespValue, ProxyError> {
    framed
        .send(command.to_resp())
        .await
        .map_err(|_| ProxyError::BackendDown(node.as_str().to_string()))?;
    next_frame(framed, node).await
}

async fn next_frame(
    framed: &mut RespFramed,
    node: &BackendNode,
) -> Result<RespValue, ProxyError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        _ => Err(ProxyError::BackendDown(node.as_str().to_string())),
    }
}

fn subscription_count(frame: &RespValue) -> Option<i64> {
    let items = frame.as_array()?;
    if items.len() < 3 {
        return None;
    }
    let kind = items[0].as_bytes()?;
    if !matches!(
        kind,
        b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe"
    ) {
        return None;
    }
    match &items[2] {
        RespValue::Integer(count) => Some(*count),
        _ => None,
    }
}

/// Stable pseudo node id for synthesized CLUSTER NODES replies.
pub(crate) fn node_id_for(name: &str, port: u16) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    port.hash(&mut hasher);
    hasher.finish()
}
