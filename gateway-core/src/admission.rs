//! Shared admission counters (C10): global and per-client-IP caps on
//! concurrent TCP tunnel streams.
//!
//! Grounded on the same `dashmap`-backed shared-counter shape used for
//! the DNS token-bucket map (`dns::ratelimit`) — both are concurrent
//! maps keyed by client IP, pruned the same way, and both exist so a
//! single abusive client can't starve the others.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};

use crate::error::GatewayError;

/// A map is only swept for stale entries once it exceeds this size —
/// pruning an always-small map would just be wasted work.
const PRUNE_THRESHOLD: usize = 10_000;
const STALE_AFTER_MS: i64 = 10 * 60 * 1000;

type DirectLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Caps how often a single refusal reason (global-limit, per-ip-limit)
/// is logged, so a sustained flood of over-limit connection attempts
/// can't itself flood the log. One token bucket per reason, not per
/// client — the point is to protect the log, not to rate-limit clients
/// a second time.
struct RefusalLogLimiter {
    global: DirectLimiter,
    per_ip: DirectLimiter,
}

impl RefusalLogLimiter {
    fn new() -> Self {
        let quota = Quota::per_second(NonZeroU32::new(1).unwrap()).allow_burst(NonZeroU32::new(5).unwrap());
        Self {
            global: RateLimiter::direct(quota),
            per_ip: RateLimiter::direct(quota),
        }
    }

    fn log_global_refusal(&self) {
        if self.global.check().is_ok() {
            log::warn!("admission refused: global connection limit reached");
        }
    }

    fn log_per_ip_refusal(&self, client_ip: IpAddr) {
        if self.per_ip.check().is_ok() {
            log::warn!("admission refused: per-ip connection limit reached for {client_ip}");
        }
    }
}

/// `0` means unlimited, matching `TCP_PROXY_MAX_CONNECTIONS{,_PER_IP}`.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub max_global: u64,
    pub max_per_ip: u64,
}

/// Which `/metrics` gauge an admitted stream counts against:
/// `tcp_proxy_active` for single-stream `/tcp` tunnels, `mux_streams_active`
/// for streams opened inside a `/tcp-mux` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Mux,
}

struct PerIpCounter {
    count: AtomicI64,
    last_touched_ms: AtomicI64,
}

/// Shared global + per-IP stream counters. The TCP and mux supervisors
/// hold a `Weak<AdmissionController>` back-reference; each admitted
/// stream holds an [`AdmissionGuard`] that releases its slot on drop so
/// a panicking or cancelled pump can never leak a counted slot.
pub struct AdmissionController {
    global: AtomicI64,
    per_ip: DashMap<IpAddr, PerIpCounter>,
    limits: AdmissionLimits,
    tcp_active: AtomicI64,
    mux_active: AtomicI64,
    refusal_log: RefusalLogLimiter,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Arc<Self> {
        Arc::new(Self {
            global: AtomicI64::new(0),
            per_ip: DashMap::new(),
            limits,
            tcp_active: AtomicI64::new(0),
            mux_active: AtomicI64::new(0),
            refusal_log: RefusalLogLimiter::new(),
        })
    }

    pub fn global_active(&self) -> i64 {
        self.global.load(Ordering::SeqCst)
    }

    pub fn per_ip_active(&self, client_ip: IpAddr) -> i64 {
        self.per_ip
            .get(&client_ip)
            .map(|c| c.count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Count of admitted single-stream `/tcp` tunnels, for the
    /// `tcp_proxy_active` `/metrics` gauge.
    pub fn tcp_active(&self) -> i64 {
        self.tcp_active.load(Ordering::SeqCst)
    }

    /// Count of admitted `/tcp-mux` streams, for the
    /// `mux_streams_active` `/metrics` gauge.
    pub fn mux_active(&self) -> i64 {
        self.mux_active.load(Ordering::SeqCst)
    }

    /// Attempt to admit one more stream of `kind` for `client_ip`. On
    /// success, the returned guard must be held for the stream's
    /// lifetime and dropped when it closes.
    pub fn try_admit(
        self: &Arc<Self>,
        client_ip: IpAddr,
        kind: StreamKind,
        now_ms: i64,
    ) -> Result<AdmissionGuard, GatewayError> {
        if self.limits.max_global != 0 && self.global_active() >= self.limits.max_global as i64 {
            self.refusal_log.log_global_refusal();
            return Err(GatewayError::resource_exhausted("global connection limit reached"));
        }

        self.prune_if_oversized(now_ms);

        let entry = self
            .per_ip
            .entry(client_ip)
            .or_insert_with(|| PerIpCounter {
                count: AtomicI64::new(0),
                last_touched_ms: AtomicI64::new(now_ms),
            });
        let current = entry.count.load(Ordering::SeqCst);
        if self.limits.max_per_ip != 0 && current >= self.limits.max_per_ip as i64 {
            self.refusal_log.log_per_ip_refusal(client_ip);
            return Err(GatewayError::resource_exhausted(format!(
                "per-ip connection limit reached for {client_ip}"
            )));
        }
        entry.count.fetch_add(1, Ordering::SeqCst);
        entry.last_touched_ms.store(now_ms, Ordering::SeqCst);
        drop(entry);

        self.global.fetch_add(1, Ordering::SeqCst);
        match kind {
            StreamKind::Tcp => self.tcp_active.fetch_add(1, Ordering::SeqCst),
            StreamKind::Mux => self.mux_active.fetch_add(1, Ordering::SeqCst),
        };

        Ok(AdmissionGuard {
            controller: Arc::clone(self),
            client_ip,
            kind,
            released: false,
        })
    }

    fn release(&self, client_ip: IpAddr, kind: StreamKind) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        match kind {
            StreamKind::Tcp => self.tcp_active.fetch_sub(1, Ordering::SeqCst),
            StreamKind::Mux => self.mux_active.fetch_sub(1, Ordering::SeqCst),
        };
        if let Some(entry) = self.per_ip.get(&client_ip) {
            entry.count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Evict per-IP entries that are both idle (count 0) and stale
    /// (untouched for `STALE_AFTER_MS`), mirroring the DNS token-bucket
    /// map's pruning rule. Only runs once the map has grown large
    /// enough for the sweep to be worth its cost.
    fn prune_if_oversized(&self, now_ms: i64) {
        if self.per_ip.len() <= PRUNE_THRESHOLD {
            return;
        }
        self.per_ip.retain(|_, counter| {
            let idle = counter.count.load(Ordering::SeqCst) == 0;
            let stale = now_ms.saturating_sub(counter.last_touched_ms.load(Ordering::SeqCst)) > STALE_AFTER_MS;
            !(idle && stale)
        });
    }
}

/// RAII admission slot. Releasing twice is harmless (the second release
/// is a no-op) but dropping without releasing would leak a counted slot,
/// so this type is not `Clone`.
pub struct AdmissionGuard {
    controller: Arc<AdmissionController>,
    client_ip: IpAddr,
    kind: StreamKind,
    released: bool,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.controller.release(self.client_ip, self.kind);
            self.released = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn admits_up_to_per_ip_limit_then_rejects() {
        let limits = AdmissionLimits {
            max_global: 0,
            max_per_ip: 2,
        };
        let controller = AdmissionController::new(limits);
        let a = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        let b = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        assert!(controller.try_admit(ip(), StreamKind::Tcp, 0).is_err());
        drop(a);
        let c = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        drop(b);
        drop(c);
        assert_eq!(controller.per_ip_active(ip()), 0);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let limits = AdmissionLimits {
            max_global: 0,
            max_per_ip: 0,
        };
        let controller = AdmissionController::new(limits);
        let guards: Vec<_> = (0..50).map(|_| controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap()).collect();
        assert_eq!(controller.global_active(), 50);
        drop(guards);
        assert_eq!(controller.global_active(), 0);
    }

    #[test]
    fn global_limit_caps_across_all_ips() {
        let limits = AdmissionLimits {
            max_global: 1,
            max_per_ip: 0,
        };
        let controller = AdmissionController::new(limits);
        let _a = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        let other: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(controller.try_admit(other, StreamKind::Tcp, 0).is_err());
    }

    #[test]
    fn guard_release_is_idempotent_on_repeated_drop_semantics() {
        let limits = AdmissionLimits {
            max_global: 0,
            max_per_ip: 0,
        };
        let controller = AdmissionController::new(limits);
        let guard = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        drop(guard);
        assert_eq!(controller.global_active(), 0);
    }

    #[test]
    fn tcp_and_mux_streams_are_counted_separately() {
        let limits = AdmissionLimits {
            max_global: 0,
            max_per_ip: 0,
        };
        let controller = AdmissionController::new(limits);
        let tcp_guard = controller.try_admit(ip(), StreamKind::Tcp, 0).unwrap();
        let mux_guard = controller.try_admit(ip(), StreamKind::Mux, 0).unwrap();
        assert_eq!(controller.tcp_active(), 1);
        assert_eq!(controller.mux_active(), 1);
        drop(tcp_guard);
        assert_eq!(controller.tcp_active(), 0);
        assert_eq!(controller.mux_active(), 1);
        drop(mux_guard);
        assert_eq!(controller.mux_active(), 0);
    }
}
