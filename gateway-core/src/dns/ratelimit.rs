//! Per-client-IP token bucket admission for the DNS resolver (C5 step 1).
//!
//! Grounded on `governor`'s keyed rate limiter, the same crate a
//! `lib-network`-style pack example pulls in specifically for
//! "rate limiting for DoS protection". One token bucket per client IP,
//! pruned the same way the admission and cache maps are.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{Quota, RateLimiter};

type KeyedLimiter = RateLimiter<IpAddr, governor::state::keyed::DefaultKeyedStateStore<IpAddr>, governor::clock::DefaultClock>;

/// How many `admit` calls between sweeps of stale per-IP buckets. Keeps
/// the same bounded-memory property `AdmissionController::prune_if_oversized`
/// gives the admission map, without paying the sweep's cost on every query.
const PRUNE_EVERY_N_CALLS: u64 = 10_000;

/// Per-client-IP token buckets, rate `DNS_QPS_PER_IP` with burst
/// `DNS_BURST_PER_IP`.
pub struct DnsRateLimiter {
    limiter: KeyedLimiter,
    calls_since_prune: AtomicU64,
}

impl DnsRateLimiter {
    pub fn new(qps_per_ip: u32, burst_per_ip: u32) -> Self {
        let rate = NonZeroU32::new(qps_per_ip.max(1)).unwrap();
        let burst = NonZeroU32::new(burst_per_ip.max(1)).unwrap();
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            calls_since_prune: AtomicU64::new(0),
        }
    }

    /// `true` if a query from `client_ip` is admitted (consumes one
    /// token). `false` means the caller must return SERVFAIL without
    /// contacting any upstream.
    pub fn admit(&self, client_ip: IpAddr) -> bool {
        if self.calls_since_prune.fetch_add(1, Ordering::Relaxed) >= PRUNE_EVERY_N_CALLS {
            self.calls_since_prune.store(0, Ordering::Relaxed);
            self.prune();
        }
        self.limiter.check_key(&client_ip).is_ok()
    }

    /// Drop state for keys that haven't been touched recently, bounding
    /// memory for a gateway seeing a long tail of one-off client IPs.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_burst_then_throttles() {
        let limiter = DnsRateLimiter::new(1, 2);
        let ip: IpAddr = "203.0.113.10".parse().unwrap();
        assert!(limiter.admit(ip));
        assert!(limiter.admit(ip));
        assert!(!limiter.admit(ip));
    }

    #[test]
    fn separate_ips_have_independent_buckets() {
        let limiter = DnsRateLimiter::new(1, 1);
        let a: IpAddr = "203.0.113.10".parse().unwrap();
        let b: IpAddr = "203.0.113.11".parse().unwrap();
        assert!(limiter.admit(a));
        assert!(!limiter.admit(a));
        assert!(limiter.admit(b));
    }
}
