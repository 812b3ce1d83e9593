use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::protocol::redis::{
    new_asking_command, new_select_command, RedisCommand, RespCodec, RespValue,
};

use super::pool::{BackendNode, ConnOptions, HealthBoard, SessionCommand};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(3_200);

type Sink = SplitSink<Framed<TcpStream, RespCodec>, RespValue>;
type Stream = SplitStream<Framed<TcpStream, RespCodec>>;
type ReplyTx = oneshot::Sender<Result<RespValue, ProxyError>>;

/// Open, tune, and authenticate one backend connection.
pub(crate) async fn open_stream(
    node: &BackendNode,
    options: &ConnOptions,
    health: &HealthBoard,
) -> Result<Framed<TcpStream, RespCodec>> {
    let result = open_stream_inner(node, options).await;
    if result.is_err() {
        health.connect_failed(node);
    }
    result
}

async fn open_stream_inner(
    node: &BackendNode,
    options: &ConnOptions,
) -> Result<Framed<TcpStream, RespCodec>> {
    let stream = timeout(options.connect_timeout, TcpStream::connect(node.as_str()))
        .await
        .with_context(|| format!("connect to {} timed out", node))??;
    stream
        .set_nodelay(true)
        .with_context(|| format!("failed to set TCP_NODELAY on {}", node))?;
    let mut framed = Framed::new(stream, RespCodec);

    if let Some(parts) = options.backend_auth.as_ref() {
        let auth = RedisCommand::new(parts.clone()).expect("backend AUTH command is valid");
        timeout(options.connect_timeout, framed.send(auth.to_resp()))
            .await
            .with_context(|| format!("timed out sending AUTH to {}", node))??;
        let reply = timeout(options.connect_timeout, framed.next())
            .await
            .with_context(|| format!("timed out waiting for AUTH reply from {}", node))?
            .ok_or_else(|| anyhow!("backend {} closed connection during AUTH", node))??;
        match reply {
            RespValue::SimpleString(ref data) if data.eq_ignore_ascii_case(b"OK") => {}
            RespValue::Error(err) => bail!(
                "backend {} rejected AUTH: {}",
                node,
                String::from_utf8_lossy(&err)
            ),
            other => bail!("unexpected AUTH reply from {}: {:?}", node, other),
        }
    }

    Ok(framed)
}

/// The pipelined session owning one backend connection.
///
/// Requests drain from the node queue into the socket in order; each one
/// pushes a reply slot onto the in-flight FIFO, and each reply frame pops
/// exactly the head slot. Injected `SELECT`/`ASKING` prefixes occupy slots
/// with no receiver so alignment survives them.
pub(crate) struct SessionTask {
    pub(crate) proxy: Arc<str>,
    pub(crate) node: BackendNode,
    pub(crate) options: Arc<ConnOptions>,
    pub(crate) health: Arc<HealthBoard>,
}

impl SessionTask {
    pub(crate) async fn run(self, mut rx: mpsc::Receiver<SessionCommand>) {
        debug!(proxy = %self.proxy, backend = %self.node, "backend session starting");
        let mut backoff = INITIAL_BACKOFF;
        let mut carry: Option<SessionCommand> = None;

        'connect: loop {
            // connect lazily, on the first queued request
            let first = match carry.take() {
                Some(command) => command,
                None => match rx.recv().await {
                    Some(command) => command,
                    None => break 'connect,
                },
            };

            let framed = match open_stream(&self.node, &self.options, &self.health).await {
                Ok(framed) => {
                    backoff = INITIAL_BACKOFF;
                    framed
                }
                Err(err) => {
                    warn!(proxy = %self.proxy, backend = %self.node, error = %err,
                        "backend connect failed");
                    let _ = first
                        .respond_to
                        .send(Err(ProxyError::BackendDown(self.node.as_str().to_string())));
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'connect;
                }
            };

            let (mut sink, mut stream) = framed.split();
            let mut inflight: VecDeque<Option<ReplyTx>> = VecDeque::new();
            let mut conn_db = 0u32;
            let mut marked_up = false;

            if self
                .send_command(&mut sink, first, &mut inflight, &mut conn_db)
                .await
                .is_err()
            {
                self.abandon(&mut inflight);
                continue 'connect;
            }

            loop {
                tokio::select! {
                    maybe_cmd = rx.recv(), if inflight.len() < self.options.inflight_cap => {
                        match maybe_cmd {
                            Some(command) => {
                                if self
                                    .send_command(&mut sink, command, &mut inflight, &mut conn_db)
                                    .await
                                    .is_err()
                                {
                                    self.abandon(&mut inflight);
                                    continue 'connect;
                                }
                            }
                            None => {
                                self.drain(&mut stream, &mut inflight, &mut marked_up).await;
                                break 'connect;
                            }
                        }
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(frame)) => {
                                if !self.fulfill(&mut inflight, frame, &mut marked_up) {
                                    self.abandon(&mut inflight);
                                    continue 'connect;
                                }
                            }
                            Some(Err(err)) => {
                                warn!(proxy = %self.proxy, backend = %self.node, error = %err,
                                    "backend stream error");
                                self.abandon(&mut inflight);
                                continue 'connect;
                            }
                            None => {
                                self.abandon(&mut inflight);
                                continue 'connect;
                            }
                        }
                    }
                }
            }
        }
        debug!(proxy = %self.proxy, backend = %self.node, "backend session terminated");
    }

    async fn send_command(
        &self,
        sink: &mut Sink,
        command: SessionCommand,
        inflight: &mut VecDeque<Option<ReplyTx>>,
        conn_db: &mut u32,
    ) -> Result<()> {
        let SessionCommand {
            frame,
            db,
            asking,
            respond_to,
        } = command;

        if db != *conn_db {
            sink.feed(new_select_command(db).to_resp()).await?;
            inflight.push_back(None);
            *conn_db = db;
        }
        if asking {
            sink.feed(new_asking_command().to_resp()).await?;
            inflight.push_back(None);
        }
        let sent = sink.send(frame).await;
        match sent {
            Ok(()) => {
                inflight.push_back(Some(respond_to));
                Ok(())
            }
            Err(err) => {
                let _ = respond_to
                    .send(Err(ProxyError::BackendDown(self.node.as_str().to_string())));
                Err(err)
            }
        }
    }

    /// Pop the FIFO head for one reply frame. Returns false on a frame with
    /// no matching slot, which means the stream lost alignment.
    fn fulfill(
        &self,
        inflight: &mut VecDeque<Option<ReplyTx>>,
        frame: RespValue,
        marked_up: &mut bool,
    ) -> bool {
        match inflight.pop_front() {
            Some(slot) => {
                if !*marked_up {
                    self.health.round_trip_ok(&self.node);
                    *marked_up = true;
                }
                if let Some(tx) = slot {
                    // a closed receiver is an orphaned request; the reply
                    // consumed its FIFO slot and is dropped here
                    let _ = tx.send(Ok(frame));
                }
                true
            }
            None => {
                warn!(proxy = %self.proxy, backend = %self.node,
                    "unsolicited frame from backend");
                false
            }
        }
    }

    /// Fail every outstanding request on this connection.
    fn abandon(&self, inflight: &mut VecDeque<Option<ReplyTx>>) {
        self.health.stream_failed(&self.node);
        for slot in inflight.drain(..) {
            if let Some(tx) = slot {
                let _ = tx.send(Err(ProxyError::BackendDown(self.node.as_str().to_string())));
            }
        }
    }

    /// Pool is gone: read out whatever replies are still owed, then stop.
    async fn drain(
        &self,
        stream: &mut Stream,
        inflight: &mut VecDeque<Option<ReplyTx>>,
        marked_up: &mut bool,
    ) {
        while !inflight.is_empty() {
            match timeout(self.options.connect_timeout, stream.next()).await {
                Ok(Some(Ok(frame))) => {
                    if !self.fulfill(inflight, frame, marked_up) {
                        break;
                    }
                }
                _ => {
                    self.abandon(inflight);
                    break;
                }
            }
        }
    }
}
