use bytes::Bytes;

/// A decoded RESP2 frame.
///
/// Requests arrive as `Array` (multi-bulk) or are synthesized from inline
/// commands; replies may be any variant including nested arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn ok() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    pub fn pong() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"PONG"))
    }

    pub fn queued() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"QUEUED"))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Payload bytes for string-ish frames.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(data)
            | RespValue::BulkString(data)
            | RespValue::Error(data) => Some(data.as_ref()),
            _ => None,
        }
    }

    /// The leading word of an error reply, e.g. `MOVED` or `LOADING`.
    pub fn error_code(&self) -> Option<&[u8]> {
        match self {
            RespValue::Error(data) => {
                let end = data
                    .iter()
                    .position(|&b| b == b' ')
                    .unwrap_or(data.len());
                Some(&data[..end])
            }
            _ => None,
        }
    }
}
