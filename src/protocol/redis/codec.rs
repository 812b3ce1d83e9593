use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;

/// Streaming RESP2 codec shared by the client and backend sides.
///
/// The decoder is restartable: a partial frame leaves the buffer untouched
/// and yields `None` until more bytes arrive. A malformed frame is a terminal
/// error and the owning session closes.
///
/// On the decode side the codec also accepts inline commands (space
/// separated, newline terminated) and surfaces them as the same array shape
/// multi-bulk requests produce, so everything downstream sees one request
/// representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let mut pos = 0usize;
            match parse_value(&src[..], &mut pos)? {
                Some(RespValue::Array(items)) if items.is_empty() => {
                    // empty inline line, consume and keep reading
                    src.advance(pos);
                    continue;
                }
                Some(frame) => {
                    src.advance(pos);
                    return Ok(Some(frame));
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b'-' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b':' => match read_line(src, pos) {
            Some(line) => {
                let value = parse_integer(line, "integer")?;
                Ok(Some(RespValue::Integer(value)))
            }
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start),
        _ => {
            // only a frame opener may be an inline command; a stray byte
            // inside a frame is a protocol violation
            if start != 0 {
                return Err(anyhow!("expected '$' but got '{}'", prefix as char));
            }
            *pos = start;
            parse_inline(src, pos)
        }
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_integer(line, "bulk string length")?;
    if len == -1 {
        return Ok(Some(RespValue::NullBulk));
    }
    if len < 0 {
        return Err(anyhow!("invalid bulk length"));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    if &src[*pos + len..*pos + len + 2] != b"\r\n" {
        return Err(anyhow!("expected CRLF after bulk payload"));
    }
    let data = Bytes::copy_from_slice(&src[*pos..*pos + len]);
    *pos += len + 2;
    Ok(Some(RespValue::BulkString(data)))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_integer(line, "multibulk length")?;
    if len == -1 {
        return Ok(Some(RespValue::NullArray));
    }
    if len < 0 {
        return Err(anyhow!("invalid multibulk length"));
    }
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match parse_value(src, pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(values)))
}

fn parse_inline(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    let end = match src[*pos..].iter().position(|&b| b == b'\n') {
        Some(offset) => *pos + offset,
        None => return Ok(None),
    };
    let mut line = &src[*pos..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    let parts: Vec<RespValue> = line
        .split(|&b| b == b' ')
        .filter(|field| !field.is_empty())
        .map(|field| RespValue::BulkString(Bytes::copy_from_slice(field)))
        .collect();
    *pos = end + 1;
    Ok(Some(RespValue::Array(parts)))
}

fn parse_integer(bytes: &[u8], kind: &str) -> Result<i64> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| anyhow!("invalid {kind}: not utf-8"))?;
    text.parse::<i64>()
        .map_err(|err| anyhow!("invalid {kind}: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(data.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(data: &[u8]) -> Option<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(data);
        codec.decode(&mut buf).unwrap()
    }

    #[test]
    fn decodes_multibulk_request() {
        let frame = decode_one(b"*2\r\n$3\r\nGET\r\n$4\r\nab\nc\r\n").unwrap();
        let items = frame.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], RespValue::bulk(b"GET"));
        assert_eq!(items[1], RespValue::bulk(b"ab\nc"));
    }

    #[test]
    fn decodes_inline_command() {
        let frame = decode_one(b"GET a\r\n").unwrap();
        assert_eq!(
            frame,
            RespValue::Array(vec![RespValue::bulk(b"GET"), RespValue::bulk(b"a")])
        );
        // bare newline termination is accepted too
        let frame = decode_one(b"PING\n").unwrap();
        assert_eq!(frame, RespValue::Array(vec![RespValue::bulk(b"PING")]));
    }

    #[test]
    fn partial_frames_keep_the_buffer() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 15);
        buf.extend_from_slice(b"\r\na\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    // cases lifted from redis/tests/unit/protocol.tcl

    #[test]
    fn empty_inline_lines_are_skipped() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"\r\nPING\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, RespValue::Array(vec![RespValue::bulk(b"PING")]));
    }

    #[test]
    fn negative_multibulk_length_is_malformed() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*-10\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn wrong_bulk_payload_header_is_malformed() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\nfooz\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn non_numeric_bulk_length_is_malformed() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$blabla\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decodes_reply_forms() {
        assert_eq!(decode_one(b"+OK\r\n").unwrap(), RespValue::ok());
        assert_eq!(
            decode_one(b"-ERR boom\r\n").unwrap(),
            RespValue::error(b"ERR boom")
        );
        assert_eq!(decode_one(b":42\r\n").unwrap(), RespValue::Integer(42));
        assert_eq!(decode_one(b"$-1\r\n").unwrap(), RespValue::NullBulk);
        assert_eq!(decode_one(b"*-1\r\n").unwrap(), RespValue::NullArray);
        let nested = decode_one(b"*2\r\n*1\r\n:1\r\n$2\r\nhi\r\n").unwrap();
        assert_eq!(
            nested,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Integer(1)]),
                RespValue::bulk(b"hi"),
            ])
        );
    }

    #[test]
    fn encode_round_trips_requests() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                RespValue::Array(vec![RespValue::bulk(b"PING")]),
                &mut buf,
            )
            .unwrap();
        assert_eq!(buf.as_ref(), b"*1\r\n$4\r\nPING\r\n");

        let mut buf = BytesMut::new();
        codec.encode(RespValue::Integer(-1), &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b":-1\r\n");
    }
}
