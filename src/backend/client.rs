use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics;

/// Sequential identifier for frontend client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Guard keeping the frontend connection gauge accurate.
pub struct FrontConnectionGuard<'a> {
    proxy: &'a str,
}

impl<'a> FrontConnectionGuard<'a> {
    pub fn new(proxy: &'a str) -> Self {
        metrics::front_conn_open(proxy);
        Self { proxy }
    }
}

impl<'a> Drop for FrontConnectionGuard<'a> {
    fn drop(&mut self) {
        metrics::front_conn_close(self.proxy);
    }
}
