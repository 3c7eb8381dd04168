//! Chunked record codec
//!
//! A store write becomes one or more JSON records, each small enough to be a
//! single Discord message. Records of one write share the store name and the
//! write timestamp; `p`/`tp` give the part position.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{KeystoreError, Result};

/// Wire format of one chunk: `{"s":..,"t":..,"p":..,"tp":..,"d":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "s")]
    pub store: String,
    /// Unix milliseconds of the write that produced this record.
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// 1-based part index.
    #[serde(rename = "p")]
    pub part: u32,
    #[serde(rename = "tp")]
    pub total_parts: u32,
    #[serde(rename = "d")]
    pub data: JsonValue,
}

impl ChunkRecord {
    pub fn new(
        store: impl Into<String>,
        timestamp: i64,
        part: u32,
        total_parts: u32,
        data: JsonValue,
    ) -> Self {
        Self {
            store: store.into(),
            timestamp,
            part,
            total_parts,
            data,
        }
    }

    /// Message content for this record.
    pub fn to_content(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Length of the message content as Discord counts it.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(utf16_len(&self.to_content()?))
    }
}

/// Discord's limit is counted in UTF-16 code units.
pub(crate) fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Parse message content as a chunk record.
///
/// Accepts the compact `{s,t,p,tp,d}` form and the legacy
/// `{__storeName, __data}` form (single part, timestamp 0). Anything else
/// yields `None`.
pub fn parse_record(content: &str) -> Option<ChunkRecord> {
    let content = content.trim();
    if !content.starts_with('{') {
        return None;
    }
    let JsonValue::Object(mut obj) = serde_json::from_str::<JsonValue>(content).ok()? else {
        return None;
    };

    let store = match obj.get("s").or_else(|| obj.get("__storeName")) {
        Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    let data = obj.remove("d").or_else(|| obj.remove("__data"))?;
    let part = obj
        .get("p")
        .and_then(JsonValue::as_u64)
        .filter(|p| *p >= 1)
        .unwrap_or(1) as u32;
    let total_parts = obj
        .get("tp")
        .and_then(JsonValue::as_u64)
        .filter(|tp| *tp >= 1)
        .unwrap_or(1) as u32;
    let timestamp = obj.get("t").and_then(JsonValue::as_i64).unwrap_or(0);

    Some(ChunkRecord {
        store,
        timestamp,
        part,
        total_parts,
        data,
    })
}

/// Split one store write into records of at most `budget` characters.
///
/// Oversized objects are split along their top-level keys. A value that
/// cannot be split further and still does not fit is rejected with
/// [`KeystoreError::EntryTooLarge`].
pub fn encode(
    store: &str,
    data: &JsonValue,
    timestamp: i64,
    budget: usize,
) -> Result<Vec<ChunkRecord>> {
    let single = ChunkRecord::new(store, timestamp, 1, 1, data.clone());
    let size = single.encoded_len()?;
    if size <= budget {
        return Ok(vec![single]);
    }

    let JsonValue::Object(map) = data else {
        return Err(KeystoreError::EntryTooLarge {
            store: store.to_string(),
            key: None,
            size,
            budget,
        });
    };

    // Part numbers are budgeted at full width; widen and retry if the
    // part count outgrows the guess.
    let mut digits = 1;
    loop {
        let buckets = bucket_entries(store, map, timestamp, budget, digits)?;
        let needed = decimal_digits(buckets.len());
        if needed <= digits {
            let total = buckets.len() as u32;
            let records: Vec<ChunkRecord> = buckets
                .into_iter()
                .enumerate()
                .map(|(i, bucket)| {
                    ChunkRecord::new(store, timestamp, i as u32 + 1, total, JsonValue::Object(bucket))
                })
                .collect();
            tracing::debug!(
                "Split store \"{}\" ({} chars) into {} parts",
                store,
                size,
                records.len()
            );
            return Ok(records);
        }
        digits = needed;
    }
}

fn bucket_entries(
    store: &str,
    map: &Map<String, JsonValue>,
    timestamp: i64,
    budget: usize,
    digits: u32,
) -> Result<Vec<Map<String, JsonValue>>> {
    let widest = 10u32.saturating_pow(digits).saturating_sub(1).max(1);
    // Envelope around an empty object: `{"s":..,"t":..,"p":99,"tp":99,"d":{}}`
    let envelope = ChunkRecord::new(store, timestamp, widest, widest, JsonValue::Object(Map::new()))
        .encoded_len()?;

    let mut buckets = Vec::new();
    let mut current = Map::new();
    let mut current_len = envelope;

    for (key, value) in map {
        // `"key":value`, plus a comma when it is not the first entry
        let entry_len =
            utf16_len(&serde_json::to_string(key)?) + 1 + utf16_len(&serde_json::to_string(value)?);

        if envelope + entry_len > budget {
            return Err(KeystoreError::EntryTooLarge {
                store: store.to_string(),
                key: Some(key.clone()),
                size: envelope + entry_len,
                budget,
            });
        }

        let added = if current.is_empty() {
            entry_len
        } else {
            entry_len + 1
        };
        if current_len + added > budget {
            buckets.push(std::mem::take(&mut current));
            current_len = envelope + entry_len;
        } else {
            current_len += added;
        }
        current.insert(key.clone(), value.clone());
    }

    if !current.is_empty() {
        buckets.push(current);
    }
    Ok(buckets)
}

fn decimal_digits(n: usize) -> u32 {
    n.max(1).ilog10() + 1
}

/// Rebuild a store value from the records of one write.
///
/// Parts are merged in `p` order as a shallow key union.
pub fn decode(mut records: Vec<ChunkRecord>) -> JsonValue {
    records.sort_by_key(|r| r.part);

    if records.len() == 1 && !records[0].data.is_object() {
        return records.remove(0).data;
    }

    let mut merged = Map::new();
    for record in records {
        match record.data {
            JsonValue::Object(part) => merged.extend(part),
            other => tracing::warn!(
                "Ignoring non-object part {} of store \"{}\": {}",
                record.part,
                record.store,
                other
            ),
        }
    }
    JsonValue::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    const BUDGET: usize = 1900;

    fn roundtrip(value: &JsonValue, budget: usize) -> Vec<ChunkRecord> {
        let records = encode("store", value, 1_700_000_000_000, budget).unwrap();
        for r in &records {
            assert!(r.encoded_len().unwrap() <= budget);
        }
        assert_eq!(&decode(records.clone()), value);
        records
    }

    #[test]
    fn test_small_store_is_single_record() {
        let value = json!({"g1-u1": [120, 1_700_000_000_000i64, 9]});
        let records = roundtrip(&value, BUDGET);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].part, 1);
        assert_eq!(records[0].total_parts, 1);
        assert_eq!(
            records[0].to_content().unwrap(),
            r#"{"s":"store","t":1700000000000,"p":1,"tp":1,"d":{"g1-u1":[120,1700000000000,9]}}"#
        );
    }

    #[test]
    fn test_many_keys_split_into_parts() {
        let mut map = Map::new();
        for i in 0..500 {
            map.insert(format!("key-{i:04}-{}", "k".repeat(40)), json!(i));
        }
        let value = JsonValue::Object(map);
        let records = roundtrip(&value, BUDGET);
        assert!(records.len() > 1);
        let total = records.len() as u32;
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.part, i as u32 + 1);
            assert_eq!(r.total_parts, total);
            assert_eq!(r.timestamp, 1_700_000_000_000);
        }
    }

    #[test]
    fn test_one_char_over_budget_splits_in_two() {
        let mut value = json!({"a": "x".repeat(900), "b": ""});
        let len = ChunkRecord::new("store", 1, 1, 1, value.clone())
            .encoded_len()
            .unwrap();
        value["b"] = json!("y".repeat(BUDGET + 1 - len));
        let single = ChunkRecord::new("store", 1, 1, 1, value.clone())
            .encoded_len()
            .unwrap();
        assert_eq!(single, BUDGET + 1);

        let records = encode("store", &value, 1, BUDGET).unwrap();
        assert_eq!(records.len(), 2);
        for r in &records {
            assert!(r.encoded_len().unwrap() <= BUDGET);
        }
        assert_eq!(decode(records), value);
    }

    #[test]
    fn test_budget_respected_for_random_stores() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyzé☕\"\\\n".chars().collect();
        for _ in 0..40 {
            let keys = rng.random_range(0..400);
            let mut map = Map::new();
            for k in 0..keys {
                let len = rng.random_range(0..120);
                let s: String = (0..len)
                    .map(|_| alphabet[rng.random_range(0..alphabet.len())])
                    .collect();
                let value = match k % 3 {
                    0 => json!(s),
                    1 => json!([rng.random_range(0..10_000i64), s]),
                    _ => json!({"n": rng.random_range(0..u32::MAX), "s": s}),
                };
                map.insert(format!("{k}-{}", rng.random_range(0..1_000_000u32)), value);
            }
            let budget = rng.random_range(400..=BUDGET);
            roundtrip(&JsonValue::Object(map), budget);
        }
    }

    #[test]
    fn test_entry_too_large_is_an_error() {
        let value = json!({"small": 1, "huge": "z".repeat(BUDGET * 2)});
        let err = encode("big", &value, 1, BUDGET).unwrap_err();
        match err {
            KeystoreError::EntryTooLarge {
                store, key, budget, ..
            } => {
                assert_eq!(store, "big");
                assert_eq!(key.as_deref(), Some("huge"));
                assert_eq!(budget, BUDGET);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_non_object_is_an_error() {
        let value = json!("w".repeat(BUDGET));
        let err = encode("text", &value, 1, BUDGET).unwrap_err();
        assert!(matches!(err, KeystoreError::EntryTooLarge { key: None, .. }));
    }

    #[test]
    fn test_parse_compact_and_legacy_records() {
        let compact = parse_record(r#"{"s":"x","t":200,"p":2,"tp":3,"d":{"a":2}}"#).unwrap();
        assert_eq!(compact, ChunkRecord::new("x", 200, 2, 3, json!({"a": 2})));

        let legacy = parse_record(r#"{"__storeName":"user-levels","__data":{"u":[1,2,3]}}"#)
            .unwrap();
        assert_eq!(
            legacy,
            ChunkRecord::new("user-levels", 0, 1, 1, json!({"u": [1, 2, 3]}))
        );
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert!(parse_record("hello there").is_none());
        assert!(parse_record("{not json").is_none());
        assert!(parse_record(r#"{"s":"x"}"#).is_none());
        assert!(parse_record(r#"{"s":"","d":{}}"#).is_none());
        assert!(parse_record(r#"["s","d"]"#).is_none());
    }

    #[test]
    fn test_decode_orders_parts() {
        let records = vec![
            ChunkRecord::new("x", 5, 2, 2, json!({"b": 2, "shared": "late"})),
            ChunkRecord::new("x", 5, 1, 2, json!({"a": 1, "shared": "early"})),
        ];
        assert_eq!(
            decode(records),
            json!({"a": 1, "b": 2, "shared": "late"})
        );
        assert_eq!(decode(Vec::new()), json!({}));
    }
}
