//! Shared "resolve a target string, apply policy, connect" path used
//! by both the single-stream supervisor (C6) and every mux stream's
//! OPEN handler (C8), so the two surfaces can never drift in which
//! checks they run before touching a socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::dns::resolver::DnsResolver;
use crate::error::{DenyReason, GatewayError, Result};
use crate::ip::IpAddress;
use crate::policy::{self, EgressDecision, EgressPolicy, EgressTarget};

use super::proxy::{self, SocketFactory};

use tokio::net::TcpStream;

/// Everything a connect attempt needs beyond the raw `host:port` pair.
pub struct ProxyContext {
    pub policy: EgressPolicy,
    pub resolver: Arc<DnsResolver>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub connect_timeout: Duration,
}

/// Evaluate policy for `host`, resolving it through the gateway's own
/// forwarding resolver if it's a hostname (never the system resolver,
/// so DNS-rebinding re-checks in [`policy::apply_dns_rebinding_check`]
/// always see fresh, post-filtered answers), then connect to the first
/// address that accepts a connection.
pub async fn resolve_and_connect(
    host: &str,
    port: u16,
    client_ip: std::net::IpAddr,
    ctx: &ProxyContext,
) -> Result<(TcpStream, EgressTarget)> {
    let target = resolve_target(host, client_ip, ctx).await?;

    let candidates: Vec<std::net::IpAddr> = match &target {
        EgressTarget::Ip(ip) => vec![ip.std_addr()],
        EgressTarget::Dns { resolved_ips, .. } => resolved_ips.iter().map(IpAddress::std_addr).collect(),
    };

    let mut last_err = GatewayError::upstream_unavailable("no candidate addresses to connect to");
    for ip in candidates {
        let addr = SocketAddr::new(ip, port);
        match proxy::connect_with_timeout(ctx.socket_factory.as_ref(), addr, ctx.connect_timeout).await {
            Ok(stream) => return Ok((stream, target)),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// The policy half of [`resolve_and_connect`], split out so the mux
/// session can run it once per OPEN frame without necessarily
/// connecting yet (e.g. to surface a policy denial without ever
/// touching the network).
pub async fn resolve_target(host: &str, client_ip: std::net::IpAddr, ctx: &ProxyContext) -> Result<EgressTarget> {
    match policy::evaluate_tcp_host_policy(host, &ctx.policy)? {
        EgressDecision::Denied(reason) => Err(GatewayError::PolicyDenied(reason)),
        EgressDecision::Allowed(EgressTarget::Ip(ip)) => Ok(EgressTarget::Ip(ip)),
        EgressDecision::Allowed(EgressTarget::Dns { hostname, .. }) => {
            let addrs = ctx
                .resolver
                .resolve_target_addrs(hostname.as_str(), client_ip)
                .await
                .map_err(|_| GatewayError::PolicyDenied(DenyReason::DnsResolutionFailed))?;
            let resolved: Vec<IpAddress> = addrs.into_iter().map(IpAddress::from_std).collect();
            match policy::apply_dns_rebinding_check(hostname, resolved, &ctx.policy) {
                EgressDecision::Allowed(target) => Ok(target),
                EgressDecision::Denied(reason) => Err(GatewayError::PolicyDenied(reason)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::ResolverConfig;
    use crate::policy::PolicyEntry;

    fn ctx(allow: Vec<PolicyEntry>) -> ProxyContext {
        ProxyContext {
            policy: EgressPolicy {
                require_dns_name: false,
                allow_private_ips: true,
                block_list: vec![],
                allow_list: allow,
            },
            resolver: Arc::new(DnsResolver::new(ResolverConfig {
                upstreams: vec![],
                upstream_timeout: Duration::from_millis(50),
                max_query_bytes: 512,
                max_response_bytes: 4096,
                allow_any_qtype: false,
                allow_private_answers: true,
                allow_private_ptr: false,
                cache_max_entries: 100,
                cache_max_ttl: Duration::from_secs(60),
                cache_negative_ttl: Duration::from_secs(10),
                qps_per_ip: 100,
                burst_per_ip: 100,
            })),
            socket_factory: Arc::new(super::proxy::DefaultSocketFactory),
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn ip_literal_target_skips_resolution() {
        let context = ctx(vec![]);
        let target = resolve_target("203.0.113.5", "127.0.0.1".parse().unwrap(), &context)
            .await
            .unwrap();
        assert!(matches!(target, EgressTarget::Ip(_)));
    }

    #[tokio::test]
    async fn blocked_hostname_never_touches_resolver() {
        let mut context = ctx(vec![]);
        context.policy.block_list = vec![crate::policy::parse_policy_entry("example.com").unwrap()];
        let err = resolve_target("example.com", "127.0.0.1".parse().unwrap(), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyDenied(DenyReason::BlockedByHostPolicy)));
    }
}
