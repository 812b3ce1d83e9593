mod codec;
mod command;
mod nodes;
mod types;

pub use codec::RespCodec;
pub use command::{
    encode_scan_cursor, new_asking_command, new_cluster_nodes_command, new_select_command,
    parse_scan_cursor, Aggregator, CmdKind, CmdSpec, MultiDispatch, RedisCommand, SubCommand,
    SubscriptionKind, SLOT_COUNT,
};
pub use nodes::SlotMap;
pub use types::RespValue;
