//! Bounded LRU DNS answer cache (part of C5), keyed by `(qname, qtype)`.
//!
//! Grounded on the `lru` crate usage elsewhere in the retrieval pack
//! (`lib-network`, `zhtp`): a fixed-capacity `LruCache` behind a mutex,
//! the simplest correct way to get bounded-memory LRU eviction without
//! hand-rolling an intrusive list.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_resolver::proto::rr::RecordType;
use lru::LruCache;

type CacheKey = (String, RecordType);

enum Payload {
    Positive(Vec<u8>),
    Negative,
}

struct Entry {
    payload: Payload,
    expires_at: Instant,
}

/// Positive/negative DNS answer cache with TTL-aware reads: a hit
/// returns the cached wire bytes with every RR's TTL reduced by the
/// elapsed time since insertion, never going below zero.
pub struct DnsCache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    negative_ttl: Duration,
    max_ttl: Duration,
}

pub enum Lookup {
    Miss,
    Positive(Vec<u8>),
    Negative,
}

impl DnsCache {
    pub fn new(max_entries: usize, max_ttl: Duration, negative_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            negative_ttl,
            max_ttl,
        }
    }

    pub fn get(&self, qname: &str, qtype: RecordType, now: Instant, request_id: u16) -> Lookup {
        let key = (qname.to_ascii_lowercase(), qtype);
        let mut cache = self.inner.lock().unwrap();
        let Some(entry) = cache.get(&key) else {
            return Lookup::Miss;
        };
        if entry.expires_at <= now {
            cache.pop(&key);
            return Lookup::Miss;
        }
        match &entry.payload {
            Payload::Negative => Lookup::Negative,
            Payload::Positive(bytes) => {
                let remaining = entry.expires_at.saturating_duration_since(now);
                Lookup::Positive(rewrite_ttls_and_id(bytes, remaining.as_secs() as u32, request_id))
            }
        }
    }

    /// Insert a positive answer. `min_answer_ttl` is the smallest TTL
    /// among the answer RRs; the stored TTL is clamped to
    /// `DNS_CACHE_MAX_TTL_SECONDS`.
    pub fn insert_positive(&self, qname: &str, qtype: RecordType, bytes: Vec<u8>, min_answer_ttl: u32, now: Instant) {
        let ttl = Duration::from_secs(min_answer_ttl as u64).min(self.max_ttl);
        let key = (qname.to_ascii_lowercase(), qtype);
        self.inner.lock().unwrap().put(
            key,
            Entry {
                payload: Payload::Positive(bytes),
                expires_at: now + ttl,
            },
        );
    }

    pub fn insert_negative(&self, qname: &str, qtype: RecordType, now: Instant) {
        let key = (qname.to_ascii_lowercase(), qtype);
        self.inner.lock().unwrap().put(
            key,
            Entry {
                payload: Payload::Negative,
                expires_at: now + self.negative_ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Rewrite every answer RR's TTL to `new_ttl` and the message ID to
/// `request_id` before serving a cached response to a fresh request —
/// a reused cache entry must echo the asking request's own ID and
/// reflect how much of its TTL has already elapsed. Done by re-parsing
/// and re-emitting rather than byte-patching; still O(n) in message size.
fn rewrite_ttls_and_id(bytes: &[u8], new_ttl: u32, request_id: u16) -> Vec<u8> {
    use hickory_resolver::proto::op::Message;
    use hickory_resolver::proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

    let Ok(mut message) = Message::from_bytes(bytes) else {
        return bytes.to_vec();
    };
    message.set_id(request_id);
    for record in message.answers_mut() {
        record.set_ttl(new_ttl);
    }
    let mut buf = Vec::with_capacity(bytes.len());
    let mut encoder = BinEncoder::new(&mut buf);
    if message.emit(&mut encoder).is_err() {
        return bytes.to_vec();
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::op::{Message, MessageType, Query};
    use hickory_resolver::proto::rr::{rdata::A as ARdata, Name, RData, Record};
    use hickory_resolver::proto::serialize::binary::BinDecodable;
    use std::str::FromStr;
    use std::time::Duration;

    fn sample_response(ttl: u32) -> Vec<u8> {
        use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        message.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            ttl,
            RData::A(ARdata(std::net::Ipv4Addr::new(8, 8, 8, 8))),
        ));
        let mut buf = Vec::new();
        let mut encoder = BinEncoder::new(&mut buf);
        message.emit(&mut encoder).unwrap();
        buf
    }

    #[test]
    fn positive_hit_decrements_ttl_by_elapsed_time() {
        let cache = DnsCache::new(10, Duration::from_secs(3600), Duration::from_secs(30));
        let t0 = Instant::now();
        cache.insert_positive("example.com.", RecordType::A, sample_response(300), 300, t0);
        let later = t0 + Duration::from_secs(100);
        match cache.get("example.com.", RecordType::A, later, 1) {
            Lookup::Positive(bytes) => {
                let msg = Message::from_bytes(&bytes).unwrap();
                let ttl = msg.answers()[0].ttl();
                assert!(ttl <= 200 && ttl > 0, "ttl was {ttl}");
            }
            _ => panic!("expected cache hit"),
        }
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = DnsCache::new(10, Duration::from_secs(3600), Duration::from_secs(30));
        let t0 = Instant::now();
        cache.insert_positive("example.com.", RecordType::A, sample_response(10), 10, t0);
        let later = t0 + Duration::from_secs(11);
        assert!(matches!(cache.get("example.com.", RecordType::A, later, 1), Lookup::Miss));
    }

    #[test]
    fn max_ttl_clamps_long_lived_answers() {
        let cache = DnsCache::new(10, Duration::from_secs(60), Duration::from_secs(30));
        let t0 = Instant::now();
        cache.insert_positive("example.com.", RecordType::A, sample_response(100_000), 100_000, t0);
        let just_past_clamp = t0 + Duration::from_secs(61);
        assert!(matches!(
            cache.get("example.com.", RecordType::A, just_past_clamp, 1),
            Lookup::Miss
        ));
    }

    #[test]
    fn negative_entries_use_fixed_ttl() {
        let cache = DnsCache::new(10, Duration::from_secs(3600), Duration::from_secs(5));
        let t0 = Instant::now();
        cache.insert_negative("missing.example.", RecordType::A, t0);
        assert!(matches!(
            cache.get("missing.example.", RecordType::A, t0 + Duration::from_secs(1), 1),
            Lookup::Negative
        ));
        assert!(matches!(
            cache.get("missing.example.", RecordType::A, t0 + Duration::from_secs(6), 1),
            Lookup::Miss
        ));
    }
}
