//! The RESP wire codec (C1).
//!
//! `decode_one` always restarts from the head of the buffer it is given —
//! there is no parser state carried across calls. Callers that see
//! `DecodeError::Incomplete` read more bytes and retry the whole buffer;
//! this keeps the decoder itself trivial to reason about at the cost of
//! re-scanning already-seen bytes, which is fine at the chunk sizes this
//! server reads (see `connection.rs`).
use thiserror::Error;

pub const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not enough bytes buffered for a full frame")]
    Incomplete,

    #[error("invalid UTF-8 in frame")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid integer in frame")]
    NotAnInteger(#[from] std::num::ParseIntError),

    #[error("unsupported RESP type byte: {0}")]
    UnsupportedType(char),

    #[error("malformed frame")]
    Malformed,
}

/// Decode exactly one frame from the head of `buf`.
///
/// Returns the parsed frame and the number of bytes it consumed — that
/// byte count is the "raw slice" the spec requires for replication offset
/// accounting and verbatim command forwarding.
pub fn decode_one(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Incomplete);
    }
    match buf[0] {
        b'+' => {
            let (line, consumed) = read_line(buf, 1)?;
            Ok((Frame::Simple(std::str::from_utf8(line)?.to_string()), consumed))
        }
        b'-' => {
            let (line, consumed) = read_line(buf, 1)?;
            Ok((Frame::Error(std::str::from_utf8(line)?.to_string()), consumed))
        }
        b':' => {
            let (line, consumed) = read_line(buf, 1)?;
            let n: i64 = std::str::from_utf8(line)?.parse()?;
            Ok((Frame::Integer(n), consumed))
        }
        b'$' => {
            let (line, after_len_line) = read_line(buf, 1)?;
            let len: i64 = std::str::from_utf8(line)?.parse()?;
            if len == -1 {
                return Ok((Frame::Null, after_len_line));
            }
            if len < 0 {
                return Err(DecodeError::Malformed);
            }
            let len = len as usize;
            let payload_start = after_len_line;
            let payload_end = payload_start
                .checked_add(len)
                .ok_or(DecodeError::Malformed)?;
            if buf.len() < payload_end + 2 {
                return Err(DecodeError::Incomplete);
            }
            if &buf[payload_end..payload_end + 2] != CRLF {
                return Err(DecodeError::Malformed);
            }
            let payload = buf[payload_start..payload_end].to_vec();
            Ok((Frame::Bulk(payload), payload_end + 2))
        }
        b'*' => {
            let (line, mut pos) = read_line(buf, 1)?;
            let count: i64 = std::str::from_utf8(line)?.parse()?;
            if count < 0 {
                return Ok((Frame::Array(Vec::new()), pos));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (item, consumed) = decode_one(&buf[pos..])?;
                items.push(item);
                pos += consumed;
            }
            Ok((Frame::Array(items), pos))
        }
        c => Err(DecodeError::UnsupportedType(c as char)),
    }
}

/// Decode the `$<len>\r\n<payload>` RDB payload frame — a bulk string
/// without the trailing CRLF, used exactly once during a full resync.
pub fn decode_rdb_payload(buf: &[u8]) -> Result<(Vec<u8>, usize), DecodeError> {
    if buf.first() != Some(&b'$') {
        return Err(DecodeError::Malformed);
    }
    let (line, payload_start) = read_line(buf, 1)?;
    let len: usize = std::str::from_utf8(line)?
        .parse()
        .map_err(|_| DecodeError::Malformed)?;
    let payload_end = payload_start.checked_add(len).ok_or(DecodeError::Malformed)?;
    if buf.len() < payload_end {
        return Err(DecodeError::Incomplete);
    }
    Ok((buf[payload_start..payload_end].to_vec(), payload_end))
}

/// Read bytes starting at `from` up to (not including) the next `\r\n`.
/// Returns the line and the offset just past the CRLF.
fn read_line(buf: &[u8], from: usize) -> Result<(&[u8], usize), DecodeError> {
    let rest = buf.get(from..).ok_or(DecodeError::Incomplete)?;
    let pos = rest
        .windows(2)
        .position(|w| w == CRLF)
        .ok_or(DecodeError::Incomplete)?;
    Ok((&rest[..pos], from + pos + 2))
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(frame, &mut buf);
    buf
}

fn encode_into(frame: &Frame, buf: &mut Vec<u8>) {
    match frame {
        Frame::Simple(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        Frame::Error(e) => {
            buf.push(b'-');
            buf.extend_from_slice(e.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        Frame::Integer(i) => {
            buf.push(b':');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.extend_from_slice(CRLF);
        }
        Frame::Bulk(b) => {
            buf.push(b'$');
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.extend_from_slice(CRLF);
            buf.extend_from_slice(b);
            buf.extend_from_slice(CRLF);
        }
        Frame::Null => {
            buf.extend_from_slice(b"$-1\r\n");
        }
        Frame::Array(items) => {
            buf.push(b'*');
            buf.extend_from_slice(items.len().to_string().as_bytes());
            buf.extend_from_slice(CRLF);
            for item in items {
                encode_into(item, buf);
            }
        }
    }
}

/// Encode an RDB payload frame: `$<len>\r\n<payload>`, no trailing CRLF.
pub fn encode_rdb_payload(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 16);
    buf.push(b'$');
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf
}

impl Frame {
    pub fn bulk(s: impl Into<Vec<u8>>) -> Self {
        Frame::Bulk(s.into())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        Frame::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn as_bulk_str(&self) -> Option<&str> {
        match self {
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bulk_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bulk(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_supported_kinds() {
        let frames = vec![
            Frame::Simple("OK".to_string()),
            Frame::Error("ERR bad".to_string()),
            Frame::Integer(-42),
            Frame::Bulk(b"hello".to_vec()),
            Frame::Null,
            Frame::Array(vec![Frame::Bulk(b"PING".to_vec())]),
        ];
        for frame in frames {
            let encoded = encode(&frame);
            let (decoded, consumed) = decode_one(&encoded).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn decodes_command_array_byte_exact() {
        let input = b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n";
        let (frame, consumed) = decode_one(input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            frame,
            Frame::Array(vec![Frame::Bulk(b"ECHO".to_vec()), Frame::Bulk(b"hi".to_vec())])
        );
    }

    #[test]
    fn incomplete_frame_is_reported_not_panicked() {
        let input = b"*2\r\n$4\r\nECHO\r\n$2\r\nh";
        assert!(matches!(decode_one(input), Err(DecodeError::Incomplete)));
    }

    #[test]
    fn decodes_back_to_back_frames_from_one_buffer() {
        let mut input = Vec::new();
        input.extend_from_slice(b"+PONG\r\n");
        input.extend_from_slice(b":5\r\n");
        let (first, n1) = decode_one(&input).unwrap();
        assert_eq!(first, Frame::Simple("PONG".to_string()));
        let (second, n2) = decode_one(&input[n1..]).unwrap();
        assert_eq!(second, Frame::Integer(5));
        assert_eq!(n1 + n2, input.len());
    }

    #[test]
    fn rdb_payload_has_no_trailing_crlf() {
        let payload = b"REDIS0011abc";
        let encoded = encode_rdb_payload(payload);
        assert_eq!(&encoded[encoded.len() - payload.len()..], payload);
        let (decoded, consumed) = decode_rdb_payload(&encoded).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn unknown_type_byte_is_a_decode_error() {
        assert!(matches!(decode_one(b"!oops\r\n"), Err(DecodeError::UnsupportedType('!'))));
    }
}
