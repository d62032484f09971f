//! Shared application state handed to every actix-web handler via
//! `web::Data`.
//!
//! Grounded on `shelter::main`'s single `tx: Sender<...>` passed as
//! `web::Data` to every route, generalized to the handful of
//! long-lived collaborators this gateway's handlers need: the DNS
//! resolver, the admission controller, the egress policy context, and
//! the graceful-shutdown flag.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use actix_web::HttpRequest;
use gateway_core::admission::AdmissionController;
use gateway_core::dns::DnsResolver;
use gateway_core::tcp::mux::MuxSessionConfig;
use gateway_core::tcp::{DefaultSocketFactory, ProxyContext};
use governor::{Quota, RateLimiter};

use crate::config::Config;

type KeyedLimiter = RateLimiter<IpAddr, governor::state::keyed::DefaultKeyedStateStore<IpAddr>, governor::clock::DefaultClock>;

pub struct AppState {
    pub proxy_ctx: Arc<ProxyContext>,
    pub admission: Arc<AdmissionController>,
    pub mux_config: MuxSessionConfig,
    pub allowed_origins: Vec<String>,
    pub public_base_url: String,
    pub trust_proxy: bool,
    pub tcp_idle_timeout: std::time::Duration,
    pub tcp_total_timeout: Option<std::time::Duration>,
    pub shutting_down: Arc<AtomicBool>,
    pub http_requests_total: AtomicU64,
    http_rate_limiter: KeyedLimiter,
}

impl AppState {
    pub fn new(config: &Config) -> Arc<Self> {
        let resolver = Arc::new(DnsResolver::new(config.resolver.clone()));
        let proxy_ctx = Arc::new(ProxyContext {
            policy: config.egress_policy.clone(),
            resolver,
            socket_factory: Arc::new(DefaultSocketFactory),
            connect_timeout: config.tcp_connect_timeout,
        });

        let per_minute = config.rate_limit_requests_per_minute.max(1);
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap());

        Arc::new(Self {
            proxy_ctx,
            admission: AdmissionController::new(config.admission_limits),
            mux_config: config.mux.clone(),
            allowed_origins: config.allowed_origins.clone(),
            public_base_url: config.public_base_url.clone(),
            trust_proxy: config.trust_proxy,
            tcp_idle_timeout: config.tcp_idle_timeout,
            tcp_total_timeout: config.tcp_total_timeout,
            shutting_down: Arc::new(AtomicBool::new(false)),
            http_requests_total: AtomicU64::new(0),
            http_rate_limiter: RateLimiter::keyed(quota),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// The real client address behind a trusted reverse proxy
    /// (`X-Forwarded-For`'s first hop) or the peer socket otherwise.
    pub fn client_ip_of(&self, req: &HttpRequest) -> IpAddr {
        if self.trust_proxy {
            if let Some(forwarded) = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                if let Some(candidate) = forwarded.split(',').next().map(str::trim) {
                    if let Ok(ip) = candidate.parse::<IpAddr>() {
                        return ip;
                    }
                }
            }
        }
        req.peer_addr().map(|addr| addr.ip()).unwrap_or(IpAddr::from([0, 0, 0, 0]))
    }

    pub fn record_http_request(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `true` if `client_ip` is still within `RATE_LIMIT_REQUESTS_PER_MINUTE`
    /// for plain HTTP endpoints (§6's pre-upgrade 429).
    pub fn admit_http_request(&self, client_ip: IpAddr) -> bool {
        self.http_rate_limiter.check_key(&client_ip).is_ok()
    }

    /// Empty allowlist means "no Origin enforcement" (e.g. local dev);
    /// otherwise the header must be present and match exactly.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }

    pub fn render_metrics(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "http_requests_total {}\n",
            self.http_requests_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!("tcp_proxy_active {}\n", self.admission.tcp_active()));
        out.push_str(&format!("mux_streams_active {}\n", self.admission.mux_active()));
        out.push_str(&self.proxy_ctx.resolver.metrics().render_prometheus());
        out
    }
}
