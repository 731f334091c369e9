//! The key/value store (C2): a scoped owner of one server instance's key
//! space, with TTL-based lazy expiry.
use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::data::stream::{Stream, StreamError};
use crate::data::Value;
use crate::utils::now_ms;

struct Slot {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.map(|t| now >= t).unwrap_or(false)
    }
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Slot>,
}

/// Owns the entire key space for one server instance. Cheap to clone
/// (it's a handle around an `Arc`); command handlers borrow it for the
/// duration of one command.
#[derive(Clone)]
pub struct Store {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Replace both the value and expiry atomically.
    pub async fn set(&self, key: String, value: Value, expires_at_ms: Option<u64>) {
        let mut inner = self.inner.write().await;
        inner.map.insert(key, Slot { value, expires_at_ms });
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        match inner.map.get(key) {
            Some(slot) if slot.is_expired(now) => {
                inner.map.remove(key);
                None
            }
            Some(slot) => Some(slot.value.clone()),
            None => None,
        }
    }

    pub async fn type_of(&self, key: &str) -> &'static str {
        match self.get(key).await {
            Some(v) => v.type_name(),
            None => "none",
        }
    }

    /// All live (non-expired) keys, lazily evicting any expired entries found along the way.
    pub async fn keys(&self) -> Vec<String> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            inner.map.remove(&k);
        }
        inner.map.keys().cloned().collect()
    }

    /// Mutate the stream at `key`, creating an empty one if absent.
    /// Fails without mutating state if the key holds a non-stream value.
    pub async fn with_stream_mut<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Stream) -> Result<R, StreamError>,
    ) -> Result<R, StreamTypeError> {
        let mut inner = self.inner.write().await;
        let now = now_ms();
        if let Some(slot) = inner.map.get(key) {
            if slot.is_expired(now) {
                inner.map.remove(key);
            }
        }
        let slot = inner.map.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Stream(Stream::new()),
            expires_at_ms: None,
        });
        match &mut slot.value {
            Value::Stream(stream) => f(stream).map_err(StreamTypeError::Stream),
            Value::Str(_) => Err(StreamTypeError::WrongType),
        }
    }

    /// Read-only access to the stream at `key`. Returns `Ok(None)` if the
    /// key is absent (without creating it) and an error if it holds a
    /// non-stream value.
    pub async fn stream_read<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Stream) -> R,
    ) -> Result<Option<R>, StreamTypeError> {
        let inner = self.inner.read().await;
        match inner.map.get(key) {
            Some(Slot { value: Value::Stream(s), .. }) => Ok(Some(f(s))),
            Some(Slot { value: Value::Str(_), .. }) => Err(StreamTypeError::WrongType),
            None => Ok(None),
        }
    }

    /// The stream's current last id, or `EntryId::MIN` if the key is absent
    /// or not a stream. Used to resolve the `$` watermark in `XREAD`.
    pub async fn stream_last_id(&self, key: &str) -> crate::data::stream::EntryId {
        let inner = self.inner.read().await;
        match inner.map.get(key) {
            Some(Slot { value: Value::Stream(s), .. }) => s.last_id(),
            _ => crate::data::stream::EntryId::MIN,
        }
    }

    /// Entries appended after `after` for a stream key; empty if the key is
    /// absent. Does not create the key and does not check expiry — streams
    /// carry no TTL in this server.
    pub async fn stream_entries_after(
        &self,
        key: &str,
        after: Option<crate::data::stream::EntryId>,
    ) -> Vec<(crate::data::stream::EntryId, Vec<(String, Vec<u8>)>)> {
        let inner = self.inner.read().await;
        match inner.map.get(key) {
            Some(Slot { value: Value::Stream(s), .. }) => s.entries_after(after),
            _ => Vec::new(),
        }
    }

    /// Load entries straight from a snapshot, skipping expiry checks (the
    /// caller — the RDB loader — already discarded expired entries).
    pub async fn load_from(&self, entries: Vec<(String, Value, Option<u64>)>) {
        let mut inner = self.inner.write().await;
        for (key, value, expires_at_ms) in entries {
            inner.map.insert(key, Slot { value, expires_at_ms });
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamTypeError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = Store::new();
        store.set("foo".into(), Value::Str(b"bar".to_vec()), None).await;
        match store.get("foo").await {
            Some(Value::Str(v)) => assert_eq!(v, b"bar"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let store = Store::new();
        store.set("foo".into(), Value::Str(b"bar".to_vec()), Some(0)).await;
        assert!(store.get("foo").await.is_none());
        assert!(!store.keys().await.contains(&"foo".to_string()));
    }

    #[tokio::test]
    async fn xadd_on_string_key_does_not_mutate() {
        let store = Store::new();
        store.set("foo".into(), Value::Str(b"bar".to_vec()), None).await;
        let result = store
            .with_stream_mut("foo", |s| s.xadd("1-1", vec![]))
            .await;
        assert!(matches!(result, Err(StreamTypeError::WrongType)));
        match store.get("foo").await {
            Some(Value::Str(v)) => assert_eq!(v, b"bar"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
