mod client;
mod conn;
mod pool;

pub use client::{ClientId, FrontConnectionGuard};
pub use pool::{BackendNode, ConnOptions, ConnectionPool, Health, ReplyRx, SessionCommand};
