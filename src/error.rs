use bytes::Bytes;
use thiserror::Error;

use crate::protocol::redis::RespValue;

/// Failures surfaced by the proxy data plane.
///
/// Every variant renders to a RESP error reply; none of them abort the
/// worker. Parse errors terminate the offending session only, backend
/// errors fail exactly the requests in flight on that backend.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("ERR Protocol error: {0}")]
    BadMessage(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("NOAUTH Authentication required.")]
    NoAuth,

    #[error("NOPERM this user has no permissions to run the '{0}' command")]
    NoPermission(String),

    #[error("ROUTE no server pool is available for this request")]
    NoRoute,

    #[error("CLUSTERDOWN Hash slot not served")]
    ClusterDown,

    #[error("BACKEND_DOWN {0}")]
    BackendDown(String),

    #[error("TIMEOUT request deadline exceeded")]
    Timeout,

    #[error("OOM proxy memory limit reached")]
    OutOfMemory,

    #[error("ERR too many cluster redirects")]
    TooManyRedirects,

    #[error("ERR invalid cursor")]
    InvalidCursor,

    #[error("ERR {0}")]
    Other(String),
}

impl ProxyError {
    /// Render into the RESP error frame sent back to the client.
    pub fn to_resp(&self) -> RespValue {
        RespValue::Error(Bytes::from(self.to_string()))
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_resp_prefixes() {
        assert!(ProxyError::NoAuth.to_string().starts_with("NOAUTH"));
        assert!(ProxyError::Timeout.to_string().starts_with("TIMEOUT"));
        assert!(ProxyError::OutOfMemory.to_string().starts_with("OOM"));
        assert!(ProxyError::ClusterDown.to_string().starts_with("CLUSTERDOWN"));
        assert!(matches!(
            ProxyError::BackendDown("10.0.0.7:6379".into()).to_resp(),
            RespValue::Error(_)
        ));
    }
}
