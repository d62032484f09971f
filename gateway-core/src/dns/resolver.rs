//! Forwarding DNS resolver pipeline (C5): admission, QTYPE policy,
//! cache, upstream round-trip with single-flight coalescing, and
//! response post-filtering/caching.
//!
//! Upstream transport is grounded on the teacher's own DNS transport
//! selection in `runner/src/commands/exfiltrate.rs`
//! (`hickory_resolver::proto::xfer::Protocol::{Udp,Tcp}`), extended
//! here with a DoH transport using `reqwest` (already in the teacher's
//! stack for its own HTTP exfil command) per RFC 8484.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_resolver::proto::op::{Message, MessageType, ResponseCode};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;

use crate::dns::cache::{DnsCache, Lookup};
use crate::dns::codec::{self, ParsedQuery, ALLOWED_QTYPES};
use crate::dns::metrics::{DnsMetrics, QueryResult};
use crate::dns::ratelimit::DnsRateLimiter;
use crate::error::{GatewayError, Result};

/// One configured upstream resolver.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// A DoH endpoint, queried with a `POST application/dns-message`.
    Doh(String),
    Udp(SocketAddr),
    Tcp(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub upstreams: Vec<Upstream>,
    pub upstream_timeout: Duration,
    pub max_query_bytes: usize,
    pub max_response_bytes: usize,
    pub allow_any_qtype: bool,
    pub allow_private_answers: bool,
    pub allow_private_ptr: bool,
    pub cache_max_entries: usize,
    pub cache_max_ttl: Duration,
    pub cache_negative_ttl: Duration,
    pub qps_per_ip: u32,
    pub burst_per_ip: u32,
}

type InflightKey = (String, RecordType);

/// The full C4+C5 pipeline: one instance serves every `/dns-query` and
/// `/dns-json` request for the process's lifetime.
pub struct DnsResolver {
    config: ResolverConfig,
    cache: DnsCache,
    rate_limiter: DnsRateLimiter,
    inflight: DashMap<InflightKey, Arc<AsyncMutex<()>>>,
    http: reqwest::Client,
    metrics: DnsMetrics,
}

impl DnsResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let cache = DnsCache::new(config.cache_max_entries, config.cache_max_ttl, config.cache_negative_ttl);
        let rate_limiter = DnsRateLimiter::new(config.qps_per_ip, config.burst_per_ip);
        Self {
            config,
            cache,
            rate_limiter,
            inflight: DashMap::new(),
            http: reqwest::Client::new(),
            metrics: DnsMetrics::new(),
        }
    }

    /// Counters for the `/metrics` endpoint; rendered by the `gateway`
    /// binary alongside the admission counters.
    pub fn metrics(&self) -> &DnsMetrics {
        &self.metrics
    }

    /// Cap a `/dns-query` GET's `dns=` parameter must respect before
    /// any wire parsing happens.
    pub fn max_query_bytes(&self) -> usize {
        self.config.max_query_bytes
    }

    /// Resolve one raw wire-format query from `client_ip`, returning a
    /// raw wire-format response. Never returns a transport error for a
    /// well-formed admitted query — rejections become SERVFAIL/REFUSED
    /// responses, per the façade's "always answer something" contract.
    /// Malformed input is the one case that surfaces as an `Err`, since
    /// there's no query ID to safely echo back.
    pub async fn resolve(&self, query_bytes: &[u8], client_ip: IpAddr) -> Result<Vec<u8>> {
        let peek_id = peek_message_id(query_bytes);

        if !self.rate_limiter.admit(client_ip) {
            self.metrics.record("unknown", QueryResult::ServFail);
            return Ok(build_response(peek_id.unwrap_or(0), ResponseCode::ServFail));
        }

        let parsed = codec::parse_dns_query(query_bytes)?;
        let qtype_label = parsed.qtype.to_string();

        if !self.config.allow_any_qtype && !ALLOWED_QTYPES.contains(&parsed.qtype) {
            self.metrics.record(&qtype_label, QueryResult::Refused);
            return Ok(build_response(parsed.id, ResponseCode::Refused));
        }

        let key = parsed.cache_key();
        let now = Instant::now();

        if let Some(bytes) = self.try_cache(&key, now, parsed.id) {
            self.metrics.record(&qtype_label, QueryResult::CacheHit);
            return Ok(bytes);
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            // Someone else may have populated the cache while we waited.
            match self.try_cache(&key, Instant::now(), parsed.id) {
                Some(bytes) => {
                    self.metrics.record(&qtype_label, QueryResult::CacheHit);
                    Ok(bytes)
                }
                None => self.resolve_uncached(&parsed, query_bytes).await,
            }
        };
        drop(lock);
        // Only drop the shared entry once nothing else is waiting on it.
        self.inflight.remove_if(&key, |_, v| Arc::strong_count(v) <= 1);
        result
    }

    fn try_cache(&self, key: &InflightKey, now: Instant, request_id: u16) -> Option<Vec<u8>> {
        match self.cache.get(&key.0, key.1, now, request_id) {
            Lookup::Positive(bytes) => Some(bytes),
            Lookup::Negative => Some(build_response(request_id, ResponseCode::NXDomain)),
            Lookup::Miss => None,
        }
    }

    async fn resolve_uncached(&self, parsed: &ParsedQuery, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let qtype_label = parsed.qtype.to_string();
        let budget = self.config.upstream_timeout;
        let upstream_result = tokio::time::timeout(budget, self.query_upstreams(query_bytes)).await;

        let raw = match upstream_result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(_)) | Err(_) => {
                self.metrics.record(&qtype_label, QueryResult::ServFail);
                return Ok(build_response(parsed.id, ResponseCode::ServFail));
            }
        };

        if raw.len() > self.config.max_response_bytes {
            self.metrics.record(&qtype_label, QueryResult::ServFail);
            return Ok(build_response(parsed.id, ResponseCode::ServFail));
        }

        let filtered = match codec::filter_dns_response(&raw, self.config.allow_private_answers, self.config.allow_private_ptr) {
            Ok(filtered) => filtered,
            Err(GatewayError::PolicyDenied(_)) => {
                self.metrics.record(&qtype_label, QueryResult::Refused);
                return Ok(build_response(parsed.id, ResponseCode::Refused));
            }
            Err(_) => {
                self.metrics.record(&qtype_label, QueryResult::ServFail);
                return Ok(build_response(parsed.id, ResponseCode::ServFail));
            }
        };

        let now = Instant::now();
        let (qname, qtype) = parsed.cache_key();
        if filtered.is_negative {
            self.cache.insert_negative(&qname, qtype, now);
            self.metrics.record(&qtype_label, QueryResult::NxDomain);
        } else {
            if let Some(ttl) = filtered.min_answer_ttl {
                self.cache.insert_positive(&qname, qtype, filtered.bytes.clone(), ttl, now);
            }
            self.metrics.record(&qtype_label, QueryResult::Resolved);
        }

        Ok(filtered.bytes)
    }

    /// Resolve a bare hostname to its A and AAAA answers, going through
    /// the same admission/cache/post-filter pipeline as a direct
    /// `/dns-query` request. This is how the TCP proxy supervisor
    /// satisfies §4.6's "connect is subject to DNS TTL: each attempt
    /// re-resolves" — a hostname target is never resolved via the
    /// system resolver, only ever through this pipeline, so every
    /// answer has already had private/reserved addresses stripped.
    pub async fn resolve_target_addrs(&self, hostname: &str, client_ip: IpAddr) -> Result<Vec<IpAddr>> {
        use hickory_resolver::proto::rr::Name;
        use std::str::FromStr;

        let qname = Name::from_str(hostname)
            .map_err(|e| GatewayError::invalid_input(format!("invalid hostname for resolution {hostname:?}: {e}")))?;

        let mut addrs = Vec::new();
        for qtype in [RecordType::A, RecordType::AAAA] {
            let query = codec::build_simple_query(rand_query_id(), &qname, qtype)?;
            let response = self.resolve(&query, client_ip).await?;
            addrs.extend(codec::extract_answer_addrs(&response));
        }
        Ok(addrs)
    }

    async fn query_upstreams(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut last_err = GatewayError::upstream_unavailable("no upstreams configured");
        for upstream in &self.config.upstreams {
            match self.query_one(upstream, query_bytes).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn query_one(&self, upstream: &Upstream, query_bytes: &[u8]) -> Result<Vec<u8>> {
        match upstream {
            Upstream::Doh(url) => self.query_doh(url, query_bytes).await,
            Upstream::Udp(addr) => query_udp(*addr, query_bytes).await,
            Upstream::Tcp(addr) => query_tcp(*addr, query_bytes).await,
        }
    }

    async fn query_doh(&self, url: &str, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
            .header(reqwest::header::ACCEPT, "application/dns-message")
            .body(query_bytes.to_vec())
            .send()
            .await
            .map_err(|e| GatewayError::upstream_unavailable(format!("doh upstream {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::upstream_unavailable(format!(
                "doh upstream {url} returned {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| GatewayError::upstream_unavailable(format!("doh upstream {url}: {e}")))
    }
}

async fn query_udp(addr: SocketAddr, query_bytes: &[u8]) -> Result<Vec<u8>> {
    let local: SocketAddr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(query_bytes).await?;
    let mut buf = vec![0u8; 65535];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

async fn query_tcp(addr: SocketAddr, query_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    let len = u16::try_from(query_bytes.len())
        .map_err(|_| GatewayError::invalid_input("query too large for TCP DNS framing"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(query_bytes).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let reply_len = u16::from_be_bytes(len_buf) as usize;
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

/// A fresh id for an internally-generated query. The actual value is
/// never observed by a client (it's rewritten on every cache read), so
/// a wrapping counter is all the uniqueness this needs.
fn rand_query_id() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static COUNTER: AtomicU16 = AtomicU16::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn peek_message_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn build_response(id: u16, rcode: ResponseCode) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Response);
    message.set_response_code(rcode);
    let mut buf = Vec::with_capacity(12);
    let mut encoder = BinEncoder::new(&mut buf);
    // A header-only message always encodes; an encode failure here
    // would mean the encoder itself is broken, not the input.
    let _ = message.emit(&mut encoder);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::op::Query;
    use hickory_resolver::proto::rr::Name;
    use hickory_resolver::proto::serialize::binary::BinDecodable;
    use std::str::FromStr;

    fn base_config() -> ResolverConfig {
        ResolverConfig {
            upstreams: vec![],
            upstream_timeout: Duration::from_millis(200),
            max_query_bytes: 512,
            max_response_bytes: 4096,
            allow_any_qtype: false,
            allow_private_answers: false,
            allow_private_ptr: false,
            cache_max_entries: 1000,
            cache_max_ttl: Duration::from_secs(300),
            cache_negative_ttl: Duration::from_secs(30),
            qps_per_ip: 100,
            burst_per_ip: 200,
        }
    }

    fn build_query(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(7);
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        let mut buf = Vec::new();
        let mut encoder = BinEncoder::new(&mut buf);
        message.emit(&mut encoder).unwrap();
        buf
    }

    #[tokio::test]
    async fn no_upstreams_yields_servfail_not_error() {
        let resolver = DnsResolver::new(base_config());
        let query = build_query("example.com.", RecordType::A);
        let response = resolver.resolve(&query, "203.0.113.1".parse().unwrap()).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
        assert_eq!(msg.id(), 7);
    }

    #[tokio::test]
    async fn disallowed_qtype_without_allow_any_is_refused() {
        let resolver = DnsResolver::new(base_config());
        let query = build_query("example.com.", RecordType::NS);
        let response = resolver.resolve(&query, "203.0.113.1".parse().unwrap()).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn rate_limited_client_gets_servfail_without_upstream_attempt() {
        let mut config = base_config();
        config.qps_per_ip = 1;
        config.burst_per_ip = 1;
        let resolver = DnsResolver::new(config);
        let ip = "203.0.113.2".parse().unwrap();
        let _ = resolver.resolve(&build_query("a.example.", RecordType::A), ip).await;
        let second = resolver.resolve(&build_query("b.example.", RecordType::A), ip).await.unwrap();
        let msg = Message::from_bytes(&second).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
    }
}
