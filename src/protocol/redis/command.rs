use std::fmt;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::error::ProxyError;
use crate::utils::{crc16, trim_hash_tag};

use super::types::RespValue;

pub const SLOT_COUNT: u16 = 16384;

/// Routing class of a command, driving permission checks and pool choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Keyed read, may go to a replica.
    Read,
    /// Keyed write, always goes to a master.
    Write,
    /// Answered by the proxy itself (PING, INFO, CONFIG, ...).
    Ctrl,
    /// MULTI / EXEC / DISCARD.
    Txn,
    /// SUBSCRIBE family.
    Sub,
    /// Recognized but refused.
    NotSupport,
}

#[derive(Debug, Clone, Copy)]
pub struct CmdSpec {
    pub kind: CmdKind,
    /// Minimum argument count including the command name.
    pub min_args: usize,
    /// Maximum argument count, 0 for unbounded.
    pub max_args: usize,
    /// Index of the first key, 0 when the command carries no key.
    pub key_pos: usize,
}

const fn spec(kind: CmdKind, min_args: usize, max_args: usize, key_pos: usize) -> CmdSpec {
    CmdSpec {
        kind,
        min_args,
        max_args,
        key_pos,
    }
}

static CMD_TABLE: Lazy<HashMap<&'static [u8], CmdSpec>> = Lazy::new(|| {
    use CmdKind::*;
    let mut table: HashMap<&'static [u8], CmdSpec> = HashMap::with_capacity(128);

    // generic key commands
    table.insert(b"DEL", spec(Write, 2, 0, 1));
    table.insert(b"UNLINK", spec(Write, 2, 0, 1));
    table.insert(b"DUMP", spec(Read, 2, 2, 1));
    table.insert(b"EXISTS", spec(Read, 2, 0, 1));
    table.insert(b"EXPIRE", spec(Write, 3, 4, 1));
    table.insert(b"EXPIREAT", spec(Write, 3, 4, 1));
    table.insert(b"PERSIST", spec(Write, 2, 2, 1));
    table.insert(b"PEXPIRE", spec(Write, 3, 4, 1));
    table.insert(b"PEXPIREAT", spec(Write, 3, 4, 1));
    table.insert(b"PTTL", spec(Read, 2, 2, 1));
    table.insert(b"RESTORE", spec(Write, 4, 0, 1));
    table.insert(b"SORT", spec(Write, 2, 0, 1));
    table.insert(b"TTL", spec(Read, 2, 2, 1));
    table.insert(b"TYPE", spec(Read, 2, 2, 1));
    table.insert(b"TOUCH", spec(Write, 2, 0, 1));
    table.insert(b"SCAN", spec(Ctrl, 2, 0, 0));

    // strings
    table.insert(b"APPEND", spec(Write, 3, 3, 1));
    table.insert(b"BITCOUNT", spec(Read, 2, 4, 1));
    table.insert(b"BITPOS", spec(Read, 3, 5, 1));
    table.insert(b"BITFIELD", spec(Write, 2, 0, 1));
    table.insert(b"DECR", spec(Write, 2, 2, 1));
    table.insert(b"DECRBY", spec(Write, 3, 3, 1));
    table.insert(b"GET", spec(Read, 2, 2, 1));
    table.insert(b"GETBIT", spec(Read, 3, 3, 1));
    table.insert(b"GETDEL", spec(Write, 2, 2, 1));
    table.insert(b"GETRANGE", spec(Read, 4, 4, 1));
    table.insert(b"GETSET", spec(Write, 3, 3, 1));
    table.insert(b"INCR", spec(Write, 2, 2, 1));
    table.insert(b"INCRBY", spec(Write, 3, 3, 1));
    table.insert(b"INCRBYFLOAT", spec(Write, 3, 3, 1));
    table.insert(b"MGET", spec(Read, 2, 0, 1));
    table.insert(b"MSET", spec(Write, 3, 0, 1));
    table.insert(b"MSETNX", spec(NotSupport, 3, 0, 1));
    table.insert(b"PSETEX", spec(Write, 4, 4, 1));
    table.insert(b"SET", spec(Write, 3, 0, 1));
    table.insert(b"SETBIT", spec(Write, 4, 4, 1));
    table.insert(b"SETEX", spec(Write, 4, 4, 1));
    table.insert(b"SETNX", spec(Write, 3, 3, 1));
    table.insert(b"SETRANGE", spec(Write, 4, 4, 1));
    table.insert(b"STRLEN", spec(Read, 2, 2, 1));
    table.insert(b"SUBSTR", spec(Read, 4, 4, 1));

    // hashes
    table.insert(b"HDEL", spec(Write, 3, 0, 1));
    table.insert(b"HEXISTS", spec(Read, 3, 3, 1));
    table.insert(b"HGET", spec(Read, 3, 3, 1));
    table.insert(b"HGETALL", spec(Read, 2, 2, 1));
    table.insert(b"HINCRBY", spec(Write, 4, 4, 1));
    table.insert(b"HINCRBYFLOAT", spec(Write, 4, 4, 1));
    table.insert(b"HKEYS", spec(Read, 2, 2, 1));
    table.insert(b"HLEN", spec(Read, 2, 2, 1));
    table.insert(b"HMGET", spec(Read, 3, 0, 1));
    table.insert(b"HMSET", spec(Write, 4, 0, 1));
    table.insert(b"HSCAN", spec(Read, 3, 0, 1));
    table.insert(b"HSET", spec(Write, 4, 0, 1));
    table.insert(b"HSETNX", spec(Write, 4, 4, 1));
    table.insert(b"HSTRLEN", spec(Read, 3, 3, 1));
    table.insert(b"HVALS", spec(Read, 2, 2, 1));

    // lists
    table.insert(b"BLPOP", spec(Write, 3, 0, 1));
    table.insert(b"BRPOP", spec(Write, 3, 0, 1));
    table.insert(b"BRPOPLPUSH", spec(Write, 4, 4, 1));
    table.insert(b"LINDEX", spec(Read, 3, 3, 1));
    table.insert(b"LINSERT", spec(Write, 5, 5, 1));
    table.insert(b"LLEN", spec(Read, 2, 2, 1));
    table.insert(b"LPOP", spec(Write, 2, 3, 1));
    table.insert(b"LPUSH", spec(Write, 3, 0, 1));
    table.insert(b"LPUSHX", spec(Write, 3, 0, 1));
    table.insert(b"LRANGE", spec(Read, 4, 4, 1));
    table.insert(b"LREM", spec(Write, 4, 4, 1));
    table.insert(b"LSET", spec(Write, 4, 4, 1));
    table.insert(b"LTRIM", spec(Write, 4, 4, 1));
    table.insert(b"RPOP", spec(Write, 2, 3, 1));
    table.insert(b"RPOPLPUSH", spec(Write, 3, 3, 1));
    table.insert(b"RPUSH", spec(Write, 3, 0, 1));
    table.insert(b"RPUSHX", spec(Write, 3, 0, 1));

    // sets
    table.insert(b"SADD", spec(Write, 3, 0, 1));
    table.insert(b"SCARD", spec(Read, 2, 2, 1));
    table.insert(b"SDIFF", spec(Read, 2, 0, 1));
    table.insert(b"SDIFFSTORE", spec(Write, 3, 0, 1));
    table.insert(b"SINTER", spec(Read, 2, 0, 1));
    table.insert(b"SINTERSTORE", spec(Write, 3, 0, 1));
    table.insert(b"SISMEMBER", spec(Read, 3, 3, 1));
    table.insert(b"SMEMBERS", spec(Read, 2, 2, 1));
    table.insert(b"SMOVE", spec(Write, 4, 4, 1));
    table.insert(b"SPOP", spec(Write, 2, 3, 1));
    table.insert(b"SRANDMEMBER", spec(Read, 2, 3, 1));
    table.insert(b"SREM", spec(Write, 3, 0, 1));
    table.insert(b"SSCAN", spec(Read, 3, 0, 1));
    table.insert(b"SUNION", spec(Read, 2, 0, 1));
    table.insert(b"SUNIONSTORE", spec(Write, 3, 0, 1));

    // sorted sets
    table.insert(b"ZADD", spec(Write, 4, 0, 1));
    table.insert(b"ZCARD", spec(Read, 2, 2, 1));
    table.insert(b"ZCOUNT", spec(Read, 4, 4, 1));
    table.insert(b"ZINCRBY", spec(Write, 4, 4, 1));
    table.insert(b"ZINTERSTORE", spec(Write, 4, 0, 1));
    table.insert(b"ZLEXCOUNT", spec(Read, 4, 4, 1));
    table.insert(b"ZRANGE", spec(Read, 4, 0, 1));
    table.insert(b"ZRANGEBYLEX", spec(Read, 4, 0, 1));
    table.insert(b"ZRANGEBYSCORE", spec(Read, 4, 0, 1));
    table.insert(b"ZRANK", spec(Read, 3, 3, 1));
    table.insert(b"ZREM", spec(Write, 3, 0, 1));
    table.insert(b"ZREMRANGEBYLEX", spec(Write, 4, 4, 1));
    table.insert(b"ZREMRANGEBYRANK", spec(Write, 4, 4, 1));
    table.insert(b"ZREMRANGEBYSCORE", spec(Write, 4, 4, 1));
    table.insert(b"ZREVRANGE", spec(Read, 4, 5, 1));
    table.insert(b"ZREVRANGEBYLEX", spec(Read, 4, 0, 1));
    table.insert(b"ZREVRANGEBYSCORE", spec(Read, 4, 0, 1));
    table.insert(b"ZREVRANK", spec(Read, 3, 3, 1));
    table.insert(b"ZSCAN", spec(Read, 3, 0, 1));
    table.insert(b"ZSCORE", spec(Read, 3, 3, 1));
    table.insert(b"ZUNIONSTORE", spec(Write, 4, 0, 1));

    // hyperloglog and geo
    table.insert(b"PFADD", spec(Write, 2, 0, 1));
    table.insert(b"PFCOUNT", spec(Read, 2, 0, 1));
    table.insert(b"PFMERGE", spec(Write, 2, 0, 1));
    table.insert(b"GEOADD", spec(Write, 5, 0, 1));
    table.insert(b"GEODIST", spec(Read, 4, 5, 1));
    table.insert(b"GEOHASH", spec(Read, 3, 0, 1));
    table.insert(b"GEOPOS", spec(Read, 3, 0, 1));
    table.insert(b"GEORADIUS", spec(Write, 6, 0, 1));
    table.insert(b"GEORADIUSBYMEMBER", spec(Write, 5, 0, 1));

    // scripting: key position follows the numkeys argument
    table.insert(b"EVAL", spec(Write, 3, 0, 3));
    table.insert(b"EVALSHA", spec(NotSupport, 3, 0, 3));

    // pubsub
    table.insert(b"SUBSCRIBE", spec(Sub, 2, 0, 1));
    table.insert(b"PSUBSCRIBE", spec(Sub, 2, 0, 1));
    table.insert(b"UNSUBSCRIBE", spec(Sub, 1, 0, 1));
    table.insert(b"PUNSUBSCRIBE", spec(Sub, 1, 0, 1));
    table.insert(b"PUBLISH", spec(Write, 3, 3, 1));

    // transactions
    table.insert(b"MULTI", spec(Txn, 1, 1, 0));
    table.insert(b"EXEC", spec(Txn, 1, 1, 0));
    table.insert(b"DISCARD", spec(Txn, 1, 1, 0));
    table.insert(b"WATCH", spec(NotSupport, 2, 0, 1));
    table.insert(b"UNWATCH", spec(NotSupport, 1, 1, 0));

    // control plane, answered by the proxy
    table.insert(b"AUTH", spec(Ctrl, 2, 3, 0));
    table.insert(b"HELLO", spec(Ctrl, 1, 0, 0));
    table.insert(b"PING", spec(Ctrl, 1, 2, 0));
    table.insert(b"ECHO", spec(Ctrl, 2, 2, 0));
    table.insert(b"QUIT", spec(Ctrl, 1, 1, 0));
    table.insert(b"SELECT", spec(Ctrl, 2, 2, 0));
    table.insert(b"INFO", spec(Ctrl, 1, 2, 0));
    table.insert(b"CONFIG", spec(Ctrl, 2, 4, 0));
    table.insert(b"CLUSTER", spec(Ctrl, 2, 3, 0));
    table.insert(b"COMMAND", spec(Ctrl, 1, 0, 0));
    table.insert(b"READONLY", spec(Ctrl, 1, 1, 0));
    table.insert(b"READWRITE", spec(Ctrl, 1, 1, 0));

    // refused outright
    table.insert(b"KEYS", spec(NotSupport, 2, 2, 1));
    table.insert(b"MIGRATE", spec(NotSupport, 6, 0, 0));
    table.insert(b"MOVE", spec(NotSupport, 3, 3, 1));
    table.insert(b"OBJECT", spec(NotSupport, 2, 0, 0));
    table.insert(b"RANDOMKEY", spec(NotSupport, 1, 1, 0));
    table.insert(b"RENAME", spec(NotSupport, 3, 3, 1));
    table.insert(b"RENAMENX", spec(NotSupport, 3, 3, 1));
    table.insert(b"SLOWLOG", spec(NotSupport, 2, 3, 0));
    table.insert(b"WAIT", spec(NotSupport, 3, 3, 0));
    table.insert(b"FLUSHALL", spec(NotSupport, 1, 2, 0));
    table.insert(b"FLUSHDB", spec(NotSupport, 1, 2, 0));
    table.insert(b"SHUTDOWN", spec(NotSupport, 1, 2, 0));

    table
});

/// A parsed client request: the argument vector of one RESP array frame.
pub struct RedisCommand {
    parts: Vec<Bytes>,
    upper_name: Vec<u8>,
}

impl Clone for RedisCommand {
    fn clone(&self) -> Self {
        Self {
            parts: self.parts.clone(),
            upper_name: self.upper_name.clone(),
        }
    }
}

impl fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCommand")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl fmt::Display for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .collect();
        write!(f, "{}", args.join(" "))
    }
}

impl RedisCommand {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("redis command must contain at least one element");
        }
        let upper_name = parts[0].iter().map(|b| b.to_ascii_uppercase()).collect();
        Ok(Self { parts, upper_name })
    }

    pub fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::from(int.to_string()))
                        }
                        other => bail!("invalid command argument frame: {:?}", other),
                    }
                }
                Self::new(parts)
            }
            other => Err(anyhow!(
                "redis command must be an array frame, received {:?}",
                other
            )),
        }
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }

    /// Uppercased command name used for table lookup.
    pub fn name(&self) -> &[u8] {
        &self.upper_name
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.upper_name).to_ascii_lowercase()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.parts.get(index)
    }

    /// Table record for this command, `None` for unknown commands.
    pub fn spec(&self) -> Option<&'static CmdSpec> {
        CMD_TABLE.get(self.upper_name.as_slice())
    }

    /// Reject unknown names and arity violations before routing.
    pub fn validate(&self) -> Result<&'static CmdSpec, ProxyError> {
        let spec = self
            .spec()
            .ok_or_else(|| ProxyError::UnknownCommand(self.name_lossy()))?;
        let argc = self.parts.len();
        if argc < spec.min_args || (spec.max_args != 0 && argc > spec.max_args) {
            return Err(ProxyError::WrongArgCount(self.name_lossy()));
        }
        Ok(spec)
    }

    pub fn kind(&self) -> CmdKind {
        self.spec().map(|s| s.kind).unwrap_or(CmdKind::NotSupport)
    }

    pub fn is_read_only(&self) -> bool {
        self.kind() == CmdKind::Read
    }

    pub fn requires_write(&self) -> bool {
        self.kind() == CmdKind::Write
    }

    /// First key of the request, honoring the table's key position.
    pub fn primary_key(&self) -> Option<&[u8]> {
        let pos = self.spec().map(|s| s.key_pos).unwrap_or(1);
        if pos == 0 {
            return None;
        }
        self.parts.get(pos).map(|b| b.as_ref())
    }

    pub fn hash_slot(&self, hash_tag: Option<&[u8]>) -> Option<u16> {
        let key = self.primary_key()?;
        Some(crc16(trim_hash_tag(key, hash_tag)) % SLOT_COUNT)
    }

    /// Blocking list commands require an exclusive backend connection.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self.upper_name.as_slice(),
            b"BLPOP" | b"BRPOP" | b"BRPOPLPUSH"
        )
    }

    pub fn subscription_kind(&self) -> SubscriptionKind {
        match self.upper_name.as_slice() {
            b"SUBSCRIBE" => SubscriptionKind::Channel,
            b"PSUBSCRIBE" => SubscriptionKind::Pattern,
            b"UNSUBSCRIBE" => SubscriptionKind::Unsubscribe,
            b"PUNSUBSCRIBE" => SubscriptionKind::Punsubscribe,
            _ => SubscriptionKind::None,
        }
    }

    /// Split a multi-key command into per-key children.
    ///
    /// Applied when the deployment shape requires it (any cluster pool, or a
    /// standalone pool with more than one group). The parent's reply is
    /// rebuilt from the children by the returned aggregator.
    pub fn expand_for_multi(&self) -> Option<MultiDispatch> {
        match self.upper_name.as_slice() {
            b"MGET" if self.parts.len() > 2 => Some(self.expand_per_key(b"GET", Aggregator::Array)),
            b"MSET" if self.parts.len() > 3 && self.parts.len() % 2 == 1 => {
                Some(self.expand_pairs())
            }
            b"DEL" | b"UNLINK" | b"EXISTS" | b"TOUCH" if self.parts.len() > 2 => {
                Some(self.expand_per_key(&self.upper_name.clone(), Aggregator::IntegerSum))
            }
            _ => None,
        }
    }

    fn expand_per_key(&self, name: &[u8], aggregator: Aggregator) -> MultiDispatch {
        let name = Bytes::copy_from_slice(name);
        let mut subcommands = Vec::with_capacity(self.parts.len() - 1);
        for (index, key) in self.parts.iter().enumerate().skip(1) {
            let command = RedisCommand::new(vec![name.clone(), key.clone()])
                .expect("single key child command is valid");
            subcommands.push(SubCommand {
                position: index - 1,
                command,
            });
        }
        MultiDispatch {
            key_count: subcommands.len(),
            subcommands,
            aggregator,
        }
    }

    fn expand_pairs(&self) -> MultiDispatch {
        let mut subcommands = Vec::with_capacity((self.parts.len() - 1) / 2);
        let mut position = 0usize;
        let mut iter = self.parts.iter().skip(1);
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let command = RedisCommand::new(vec![
                Bytes::from_static(b"SET"),
                key.clone(),
                value.clone(),
            ])
            .expect("SET child command is valid");
            subcommands.push(SubCommand { position, command });
            position += 1;
        }
        MultiDispatch {
            key_count: subcommands.len(),
            subcommands,
            aggregator: Aggregator::OkAll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    None,
    Channel,
    Pattern,
    Unsubscribe,
    Punsubscribe,
}

#[derive(Debug)]
pub struct MultiDispatch {
    pub subcommands: Vec<SubCommand>,
    pub aggregator: Aggregator,
    pub key_count: usize,
}

#[derive(Debug)]
pub struct SubCommand {
    pub position: usize,
    pub command: RedisCommand,
}

/// Reducer that fires once all children of a split command resolved.
#[derive(Debug, Clone, Copy)]
pub enum Aggregator {
    /// MGET: merge children back in key order, nils preserved.
    Array,
    /// DEL / UNLINK / EXISTS / TOUCH: sum of child integers.
    IntegerSum,
    /// MSET: `+OK` once every child acknowledged.
    OkAll,
}

impl Aggregator {
    pub fn combine(&self, key_count: usize, responses: Vec<(usize, RespValue)>) -> Result<RespValue> {
        match self {
            Aggregator::Array => {
                let mut ordered: Vec<Option<RespValue>> = vec![None; key_count];
                for (index, resp) in responses {
                    if resp.is_error() {
                        return Ok(resp);
                    }
                    if index >= key_count {
                        bail!("unexpected child response position {}", index);
                    }
                    ordered[index] = Some(resp);
                }
                Ok(RespValue::Array(
                    ordered
                        .into_iter()
                        .map(|item| item.unwrap_or(RespValue::NullBulk))
                        .collect(),
                ))
            }
            Aggregator::IntegerSum => {
                let mut sum = 0i64;
                for (_index, resp) in responses {
                    match resp {
                        RespValue::Integer(value) => sum += value,
                        RespValue::Error(_) => return Ok(resp),
                        other => bail!("unexpected child response type: {:?}", other),
                    }
                }
                Ok(RespValue::Integer(sum))
            }
            Aggregator::OkAll => {
                for (_index, resp) in responses {
                    match resp {
                        RespValue::SimpleString(ref s) if s.as_ref() == b"OK" => {}
                        RespValue::Error(_) => return Ok(resp),
                        other => bail!("unexpected child response type: {:?}", other),
                    }
                }
                Ok(RespValue::ok())
            }
        }
    }
}

pub fn new_asking_command() -> RedisCommand {
    RedisCommand::new(vec![Bytes::from_static(b"ASKING")]).expect("ASKING is valid")
}

pub fn new_select_command(db: u32) -> RedisCommand {
    RedisCommand::new(vec![
        Bytes::from_static(b"SELECT"),
        Bytes::from(db.to_string()),
    ])
    .expect("SELECT is valid")
}

pub fn new_cluster_nodes_command() -> RedisCommand {
    RedisCommand::new(vec![
        Bytes::from_static(b"CLUSTER"),
        Bytes::from_static(b"NODES"),
    ])
    .expect("CLUSTER NODES is valid")
}

/// SCAN cursors seen by clients carry the target master index:
/// `<nodeIndex>:<nativeCursor>`. A bare decimal addresses node zero, which
/// keeps the very first `SCAN 0` call byte-compatible with a real server.
pub fn parse_scan_cursor(raw: &[u8]) -> Result<(usize, Bytes), ProxyError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProxyError::InvalidCursor)?;
    match text.split_once(':') {
        Some((node, native)) => {
            let node = node.parse::<usize>().map_err(|_| ProxyError::InvalidCursor)?;
            if native.is_empty() || !native.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProxyError::InvalidCursor);
            }
            Ok((node, Bytes::copy_from_slice(native.as_bytes())))
        }
        None => {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProxyError::InvalidCursor);
            }
            Ok((0, Bytes::copy_from_slice(raw)))
        }
    }
}

/// Re-encode the cursor a backend returned for the reply to the client.
///
/// A native `0` means the node is exhausted: move on to the next node, or
/// finish the iteration with a plain `0` after the last one.
pub fn encode_scan_cursor(node: usize, native: &[u8], node_count: usize) -> Bytes {
    if native == b"0" {
        let next = node + 1;
        if next >= node_count {
            Bytes::from_static(b"0")
        } else {
            Bytes::from(format!("{}:0", next))
        }
    } else {
        Bytes::from(format!("{}:{}", node, String::from_utf8_lossy(native)))
    }
}
