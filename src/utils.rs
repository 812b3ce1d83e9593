use std::sync::atomic::{AtomicU64, Ordering};

/// CRC16 (XMODEM) as used by Redis Cluster for key slots.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Extract the hash-tag portion of a key.
///
/// The tag is the substring between the first `{` and the following `}` when
/// that substring is non-empty; otherwise the whole key hashes. One forward
/// scan: the first opener arms the tag, the first closer after it decides.
pub fn trim_hash_tag<'a>(key: &'a [u8], hash_tag: Option<&[u8]>) -> &'a [u8] {
    let (open, close) = match hash_tag {
        Some(&[open, close]) => (open, close),
        _ => return key,
    };

    let mut tag_start = None;
    for (index, &byte) in key.iter().enumerate() {
        match tag_start {
            None if byte == open => tag_start = Some(index + 1),
            Some(start) if byte == close => {
                if index > start {
                    return &key[start..index];
                }
                // adjacent braces form an empty tag; the whole key hashes
                return key;
            }
            _ => {}
        }
    }
    key
}

static MEMORY_LIMIT: AtomicU64 = AtomicU64::new(0);
static MEMORY_IN_USE: AtomicU64 = AtomicU64::new(0);

/// Install the global buffer memory cap. Zero disables enforcement.
pub fn set_memory_limit(bytes: u64) {
    MEMORY_LIMIT.store(bytes, Ordering::Relaxed);
}

pub fn memory_in_use() -> u64 {
    MEMORY_IN_USE.load(Ordering::Relaxed)
}

pub fn memory_limit() -> u64 {
    MEMORY_LIMIT.load(Ordering::Relaxed)
}

/// Charge `bytes` against the global cap, releasing the charge on drop.
///
/// Returns `None` when the reservation would push usage over the cap; the
/// caller surfaces that as an OOM reply and the session keeps running.
pub fn reserve_memory(bytes: u64) -> Option<MemoryCharge> {
    let limit = MEMORY_LIMIT.load(Ordering::Relaxed);
    let prev = MEMORY_IN_USE.fetch_add(bytes, Ordering::Relaxed);
    if limit > 0 && prev + bytes > limit {
        MEMORY_IN_USE.fetch_sub(bytes, Ordering::Relaxed);
        return None;
    }
    Some(MemoryCharge { bytes })
}

pub struct MemoryCharge {
    bytes: u64,
}

impl Drop for MemoryCharge {
    fn drop(&mut self) {
        MEMORY_IN_USE.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}
