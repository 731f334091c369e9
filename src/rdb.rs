//! The snapshot loader (C4): reads a binary file in the Redis-RDB lineage
//! and turns it into a flat list of key/value/expiry entries for the
//! store to absorb at boot. Does not write snapshots back out — the
//! full-resync payload a primary sends a new replica is a fixed, minimal
//! RDB blob (spec permits persistence writes to be left out entirely).
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::data::Value;
use crate::utils::now_ms;

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("no snapshot file configured")]
    NotConfigured,

    #[error("failed to read snapshot file")]
    Io(#[from] tokio::io::Error),

    #[error("bad RDB header")]
    BadHeader,

    #[error("truncated RDB file")]
    Truncated,

    #[error("unsupported RDB length encoding")]
    UnsupportedLengthEncoding,

    #[error("unsupported RDB special integer encoding: {0}")]
    UnsupportedSpecialEncoding(u8),

    #[error("unsupported RDB opcode: {0:#x}")]
    UnknownOpcode(u8),
}

pub struct RdbEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at_ms: Option<u64>,
}

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_SEC: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

/// Read `config.dir`/`config.dbfilename` and decode it into entries ready
/// to hand to `Store::load_from`. Already-expired entries are discarded.
pub async fn load(config: &Config) -> Result<Vec<RdbEntry>, RdbError> {
    let (dir, dbfilename) = match (&config.dir, &config.dbfilename) {
        (Some(dir), Some(name)) => (dir, name),
        _ => return Err(RdbError::NotConfigured),
    };
    let mut path = PathBuf::from(dir);
    path.push(dbfilename);
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    let entries = decode(&buf)?;
    let now = now_ms();
    Ok(entries
        .into_iter()
        .filter(|e| e.expires_at_ms.map(|t| t > now).unwrap_or(true))
        .collect())
}

pub fn decode(buf: &[u8]) -> Result<Vec<RdbEntry>, RdbError> {
    if buf.len() < 9 || &buf[0..5] != b"REDIS" {
        return Err(RdbError::BadHeader);
    }
    let mut pos = 9;
    let mut entries = Vec::new();
    loop {
        let opcode = *buf.get(pos).ok_or(RdbError::Truncated)?;
        pos += 1;
        match opcode {
            OP_AUX => {
                let (_key, np) = read_string(buf, pos)?;
                pos = np;
                let (_value, np) = read_string(buf, pos)?;
                pos = np;
            }
            OP_RESIZEDB => {
                let (_table_size, np) = read_length(buf, pos)?;
                pos = np;
                let (_expire_table_size, np) = read_length(buf, pos)?;
                pos = np;
            }
            OP_SELECTDB => {
                let (_db_index, np) = read_length(buf, pos)?;
                pos = np;
            }
            OP_EOF => break,
            OP_EXPIRE_MS => {
                let expiry = u64::from_le_bytes(
                    buf.get(pos..pos + 8)
                        .ok_or(RdbError::Truncated)?
                        .try_into()
                        .unwrap(),
                );
                pos += 8;
                let _value_type = *buf.get(pos).ok_or(RdbError::Truncated)?;
                pos += 1;
                let (key, np) = read_string(buf, pos)?;
                pos = np;
                let (value, np) = read_string(buf, pos)?;
                pos = np;
                entries.push(RdbEntry { key: String::from_utf8_lossy(&key).into_owned(), value, expires_at_ms: Some(expiry) });
            }
            OP_EXPIRE_SEC => {
                let expiry_sec = u32::from_le_bytes(
                    buf.get(pos..pos + 4)
                        .ok_or(RdbError::Truncated)?
                        .try_into()
                        .unwrap(),
                );
                pos += 4;
                let _value_type = *buf.get(pos).ok_or(RdbError::Truncated)?;
                pos += 1;
                let (key, np) = read_string(buf, pos)?;
                pos = np;
                let (value, np) = read_string(buf, pos)?;
                pos = np;
                entries.push(RdbEntry {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    value,
                    expires_at_ms: Some(expiry_sec as u64 * 1000),
                });
            }
            0x00 => {
                let (key, np) = read_string(buf, pos)?;
                pos = np;
                let (value, np) = read_string(buf, pos)?;
                pos = np;
                entries.push(RdbEntry { key: String::from_utf8_lossy(&key).into_owned(), value, expires_at_ms: None });
            }
            other => return Err(RdbError::UnknownOpcode(other)),
        }
    }
    Ok(entries)
}

pub fn entries_into_store_rows(entries: Vec<RdbEntry>) -> Vec<(String, Value, Option<u64>)> {
    entries
        .into_iter()
        .map(|e| (e.key, Value::Str(e.value), e.expires_at_ms))
        .collect()
}

enum Length {
    Len(usize),
    Int8,
    Int16,
    Int32,
}

fn read_length(buf: &[u8], pos: usize) -> Result<(Length, usize), RdbError> {
    let b0 = *buf.get(pos).ok_or(RdbError::Truncated)?;
    match b0 >> 6 {
        0b00 => Ok((Length::Len((b0 & 0x3F) as usize), pos + 1)),
        0b01 => {
            let b1 = *buf.get(pos + 1).ok_or(RdbError::Truncated)?;
            let len = (((b0 & 0x3F) as usize) << 8) | b1 as usize;
            Ok((Length::Len(len), pos + 2))
        }
        0b11 => match b0 & 0x3F {
            0 => Ok((Length::Int8, pos + 1)),
            1 => Ok((Length::Int16, pos + 1)),
            2 => Ok((Length::Int32, pos + 1)),
            n => Err(RdbError::UnsupportedSpecialEncoding(n)),
        },
        _ => Err(RdbError::UnsupportedLengthEncoding),
    }
}

fn read_string(buf: &[u8], pos: usize) -> Result<(Vec<u8>, usize), RdbError> {
    let (len_or_special, p) = read_length(buf, pos)?;
    match len_or_special {
        Length::Len(len) => {
            let bytes = buf.get(p..p + len).ok_or(RdbError::Truncated)?.to_vec();
            Ok((bytes, p + len))
        }
        Length::Int8 => {
            let v = *buf.get(p).ok_or(RdbError::Truncated)? as i8;
            Ok((v.to_string().into_bytes(), p + 1))
        }
        Length::Int16 => {
            let v = i16::from_le_bytes(buf.get(p..p + 2).ok_or(RdbError::Truncated)?.try_into().unwrap());
            Ok((v.to_string().into_bytes(), p + 2))
        }
        Length::Int32 => {
            let v = i32::from_le_bytes(buf.get(p..p + 4).ok_or(RdbError::Truncated)?.try_into().unwrap());
            Ok((v.to_string().into_bytes(), p + 4))
        }
    }
}

/// A hardcoded, minimal empty RDB image (header + EOF + checksum), used
/// as the full-resync payload a primary sends a freshly-attached replica.
pub const EMPTY_RDB: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, 0xfa, 0x09, 0x72, 0x65, 0x64, 0x69, 0x73,
    0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32, 0x2e, 0x30, 0xfa, 0x0a, 0x72, 0x65, 0x64, 0x69,
    0x73, 0x2d, 0x62, 0x69, 0x74, 0x73, 0xc0, 0x40, 0xfa, 0x05, 0x63, 0x74, 0x69, 0x6d, 0x65, 0xc2,
    0x6d, 0x08, 0xbc, 0x65, 0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d, 0x65, 0x6d, 0xc2, 0xb0,
    0xc4, 0x10, 0x00, 0xfa, 0x08, 0x61, 0x6f, 0x66, 0x2d, 0x62, 0x61, 0x73, 0x65, 0xc0, 0x00, 0xff,
    0xf0, 0x6e, 0x3b, 0xfe, 0xc0, 0xff, 0x5a, 0xa2,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_length(len: usize, out: &mut Vec<u8>) {
        assert!(len < 0x4000);
        if len < 64 {
            out.push(len as u8);
        } else {
            out.push(0b01_000000 | ((len >> 8) as u8));
            out.push((len & 0xFF) as u8);
        }
    }

    fn encode_string(s: &str, out: &mut Vec<u8>) {
        encode_length(s.len(), out);
        out.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn decodes_no_expiry_pair() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"REDIS0011");
        buf.push(0x00);
        encode_string("foo", &mut buf);
        encode_string("bar", &mut buf);
        buf.push(OP_EOF);
        let entries = decode(&buf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "foo");
        assert_eq!(entries[0].value, b"bar");
        assert_eq!(entries[0].expires_at_ms, None);
    }

    #[test]
    fn decodes_ms_expiry_pair_and_skips_aux() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"REDIS0011");
        buf.push(OP_AUX);
        encode_string("redis-ver", &mut buf);
        encode_string("7.2.0", &mut buf);
        buf.push(OP_EXPIRE_MS);
        buf.extend_from_slice(&1_900_000_000_000u64.to_le_bytes());
        buf.push(0x00);
        encode_string("k", &mut buf);
        encode_string("v", &mut buf);
        buf.push(OP_EOF);
        let entries = decode(&buf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].expires_at_ms, Some(1_900_000_000_000));
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = b"NOTREDIS01".to_vec();
        assert!(matches!(decode(&buf), Err(RdbError::BadHeader)));
    }
}
