//! The stream container (C3): an ordered sequence of entries keyed by a
//! totally ordered `(timestamp, sequence)` id.
use indexmap::IndexMap;
use thiserror::Error;

use crate::utils::now_ms;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream id")]
    Malformed,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    NotIncreasing,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    ZeroId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };
    pub const MAX: EntryId = EntryId { ms: u64::MAX, seq: u64::MAX };

    pub fn is_zero(&self) -> bool {
        *self == EntryId::MIN
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

enum Side {
    Start,
    End,
}

/// Parse an `XRANGE`/`XREAD` boundary token: `-`, `+`, a bare timestamp, or an exact `ms-seq` id.
fn parse_boundary(s: &str, side: Side) -> Result<EntryId, StreamError> {
    match s {
        "-" => Ok(EntryId::MIN),
        "+" => Ok(EntryId::MAX),
        _ if s.contains('-') => parse_exact(s),
        _ => {
            let ms: u64 = s.parse().map_err(|_| StreamError::Malformed)?;
            let seq = match side {
                Side::Start => 0,
                Side::End => u64::MAX,
            };
            Ok(EntryId { ms, seq })
        }
    }
}

pub fn parse_exact(s: &str) -> Result<EntryId, StreamError> {
    let (ms_str, seq_str) = s.split_once('-').ok_or(StreamError::Malformed)?;
    let ms: u64 = ms_str.parse().map_err(|_| StreamError::Malformed)?;
    let seq: u64 = seq_str.parse().map_err(|_| StreamError::Malformed)?;
    Ok(EntryId { ms, seq })
}

/// Ordered append-only entries for one stream-valued key.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: IndexMap<EntryId, Vec<(String, Vec<u8>)>>,
    last_id: EntryId,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            last_id: EntryId::MIN,
        }
    }

    pub fn last_id(&self) -> EntryId {
        self.last_id
    }

    fn resolve_id_spec(&self, id_spec: &str) -> Result<EntryId, StreamError> {
        if id_spec == "*" {
            let ms = now_ms();
            let seq = if self.last_id.ms == ms { self.last_id.seq + 1 } else { 0 };
            return Ok(EntryId { ms, seq });
        }
        if let Some(ms_str) = id_spec.strip_suffix("-*") {
            let ms: u64 = ms_str.parse().map_err(|_| StreamError::Malformed)?;
            let seq = if self.last_id.ms == ms { self.last_id.seq + 1 } else { 0 };
            return Ok(EntryId { ms, seq });
        }
        parse_exact(id_spec)
    }

    /// Append `fields` under the id resolved from `id_spec`, validating ordering.
    pub fn xadd(
        &mut self,
        id_spec: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<EntryId, StreamError> {
        let id = self.resolve_id_spec(id_spec)?;
        if id.is_zero() {
            return Err(StreamError::ZeroId);
        }
        if id <= self.last_id {
            return Err(StreamError::NotIncreasing);
        }
        self.entries.insert(id, fields);
        self.last_id = id;
        Ok(id)
    }

    pub fn xrange(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<(EntryId, Vec<(String, Vec<u8>)>)>, StreamError> {
        let start_id = parse_boundary(start, Side::Start)?;
        let end_id = parse_boundary(end, Side::End)?;
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|(id, _)| **id >= start_id && **id <= end_id)
            .map(|(id, fields)| (*id, fields.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    /// Entries strictly after `after`; `None` means "since the beginning".
    pub fn entries_after(&self, after: Option<EntryId>) -> Vec<(EntryId, Vec<(String, Vec<u8>)>)> {
        self.entries
            .iter()
            .filter(|(id, _)| after.map(|w| **id > w).unwrap_or(true))
            .map(|(id, fields)| (*id, fields.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_id() {
        let mut s = Stream::new();
        let err = s.xadd("0-0", vec![]).unwrap_err();
        assert!(matches!(err, StreamError::ZeroId));
    }

    #[test]
    fn rejects_non_increasing_id() {
        let mut s = Stream::new();
        s.xadd("1-1", vec![("k".into(), b"v".to_vec())]).unwrap();
        let err = s.xadd("1-1", vec![]).unwrap_err();
        assert!(matches!(err, StreamError::NotIncreasing));
        let err = s.xadd("1-0", vec![]).unwrap_err();
        assert!(matches!(err, StreamError::NotIncreasing));
    }

    #[test]
    fn auto_sequence_increments_within_same_millisecond() {
        let mut s = Stream::new();
        let id1 = s.xadd("5-*", vec![]).unwrap();
        let id2 = s.xadd("5-*", vec![]).unwrap();
        assert_eq!(id1, EntryId { ms: 5, seq: 0 });
        assert_eq!(id2, EntryId { ms: 5, seq: 1 });
    }

    #[test]
    fn xrange_is_sorted_and_bounded() {
        let mut s = Stream::new();
        s.xadd("1-1", vec![("a".into(), b"1".to_vec())]).unwrap();
        s.xadd("2-1", vec![("b".into(), b"2".to_vec())]).unwrap();
        s.xadd("3-1", vec![("c".into(), b"3".to_vec())]).unwrap();
        let range = s.xrange("2", "+").unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, EntryId { ms: 2, seq: 1 });
        assert_eq!(range[1].0, EntryId { ms: 3, seq: 1 });
    }

    #[test]
    fn xrange_full_range() {
        let mut s = Stream::new();
        s.xadd("1-1", vec![]).unwrap();
        let range = s.xrange("-", "+").unwrap();
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn entries_after_none_includes_everything() {
        let mut s = Stream::new();
        s.xadd("1-1", vec![]).unwrap();
        s.xadd("1-2", vec![]).unwrap();
        assert_eq!(s.entries_after(None).len(), 2);
        assert_eq!(s.entries_after(Some(EntryId { ms: 1, seq: 1 })).len(), 1);
    }
}
