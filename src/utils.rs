use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for TTL accounting and auto `XADD` ids.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// A `size`-character lowercase alphanumeric id, used for the replication id.
pub fn random_id(size: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// `XREAD ... STREAMS k1 k2 s1 s2` carries keys then ids in one flat, evenly split list.
pub fn to_pairs(values: &[String]) -> Option<Vec<(String, String)>> {
    if values.is_empty() || values.len() % 2 != 0 {
        return None;
    }
    let half = values.len() / 2;
    Some(
        values[..half]
            .iter()
            .cloned()
            .zip(values[half..].iter().cloned())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_has_requested_length_and_alphabet() {
        let id = random_id(40);
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn to_pairs_splits_evenly() {
        let values = vec!["a".to_string(), "b".to_string(), "1".to_string(), "2".to_string()];
        let pairs = to_pairs(&values).unwrap();
        assert_eq!(pairs, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn to_pairs_rejects_odd_length() {
        let values = vec!["a".to_string(), "b".to_string(), "1".to_string()];
        assert!(to_pairs(&values).is_none());
    }
}
