//! `dns_queries_total{qtype,result}` counters for the `/metrics` façade.
//!
//! Grounded on the same `dashmap`-backed shared-counter shape as
//! [`crate::admission`] and [`crate::dns::ratelimit`]: a concurrent map
//! keyed by label tuple, incremented with a plain atomic, no locking
//! across the increment.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Query outcomes tracked per QTYPE, mirroring the response codes a
/// caller of [`crate::dns::resolver::DnsResolver::resolve`] can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryResult {
    CacheHit,
    Resolved,
    NxDomain,
    ServFail,
    Refused,
}

impl QueryResult {
    fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::Resolved => "resolved",
            Self::NxDomain => "nxdomain",
            Self::ServFail => "servfail",
            Self::Refused => "refused",
        }
    }
}

#[derive(Default)]
pub struct DnsMetrics {
    counts: DashMap<(String, &'static str), AtomicU64>,
}

impl DnsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, qtype: &str, result: QueryResult) {
        self.counts
            .entry((qtype.to_string(), result.as_str()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Render every tracked counter as Prometheus exposition text lines,
    /// one per `(qtype, result)` pair observed so far.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for entry in self.counts.iter() {
            let (qtype, result) = entry.key();
            let count = entry.value().load(Ordering::Relaxed);
            out.push_str(&format!(
                "dns_queries_total{{qtype=\"{qtype}\",result=\"{result}\"}} {count}\n"
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_label_pair() {
        let metrics = DnsMetrics::new();
        metrics.record("A", QueryResult::Resolved);
        metrics.record("A", QueryResult::Resolved);
        metrics.record("AAAA", QueryResult::NxDomain);
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("dns_queries_total{qtype=\"A\",result=\"resolved\"} 2"));
        assert!(rendered.contains("dns_queries_total{qtype=\"AAAA\",result=\"nxdomain\"} 1"));
    }
}
