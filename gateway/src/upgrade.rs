//! Upgrade dispatcher (C9): the checks every `/tcp` and `/tcp-mux`
//! WebSocket upgrade must pass before a supervisor ever sees the
//! socket — shutdown state, per-IP rate limit, Origin allowlist, and
//! (for `/tcp`) target parameter parsing.
//!
//! Grounded on spec §4.9 directly; the actual routing to C6/C8 and the
//! WS handshake itself are actix-web/actix-ws route plumbing in
//! `http.rs`, outside this module's job.

use std::collections::HashMap;

use actix_web::HttpRequest;

use crate::error::HttpError;
use crate::state::AppState;

/// Step 1 + step 3 of §4.9: refuse during shutdown, enforce
/// `RATE_LIMIT_REQUESTS_PER_MINUTE` (§6's pre-upgrade 429), then enforce
/// the Origin allowlist. Call before doing anything else with the request.
pub fn check_preconditions(state: &AppState, req: &HttpRequest) -> Result<(), HttpError> {
    if state.is_shutting_down() {
        return Err(HttpError::service_unavailable("shutting down"));
    }

    if !state.admit_http_request(state.client_ip_of(req)) {
        return Err(HttpError::too_many_requests("rate limit exceeded"));
    }

    let origin = req.headers().get(actix_web::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.origin_allowed(origin) {
        return Err(HttpError::forbidden("origin not allowed"));
    }

    Ok(())
}

/// Step 4 of §4.9: `target=host:port` or `host=&port=`. IPv6 literals
/// must be bracketed (`target=[::1]:80`); an unbracketed host
/// containing `:` is ambiguous and rejected rather than guessed at.
pub fn parse_tcp_target(query: &HashMap<String, String>) -> Result<(String, u16), HttpError> {
    if let Some(target) = query.get("target") {
        return parse_target_param(target);
    }

    let host = query.get("host").ok_or_else(|| HttpError::bad_request("missing target or host parameter"))?;
    let port = query
        .get("port")
        .ok_or_else(|| HttpError::bad_request("missing port parameter"))?
        .parse::<u16>()
        .map_err(|_| HttpError::bad_request("port is not a valid u16"))?;

    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    Ok((host.to_string(), port))
}

fn parse_target_param(raw: &str) -> Result<(String, u16), HttpError> {
    if let Some(rest) = raw.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(|| HttpError::bad_request("unterminated bracketed IPv6 literal"))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| HttpError::bad_request("missing port after bracketed host"))?;
        let port = port_str.parse::<u16>().map_err(|_| HttpError::bad_request("port is not a valid u16"))?;
        return Ok((host.to_string(), port));
    }

    let colon_count = raw.matches(':').count();
    if colon_count == 0 {
        return Err(HttpError::bad_request("target is missing a port"));
    }
    if colon_count > 1 {
        return Err(HttpError::bad_request(
            "unbracketed host contains multiple ':' — bracket IPv6 literals as [::1]:port",
        ));
    }

    let (host, port_str) = raw.rsplit_once(':').expect("colon_count == 1 guarantees a split point");
    if host.is_empty() {
        return Err(HttpError::bad_request("target is missing a host"));
    }
    let port = port_str.parse::<u16>().map_err(|_| HttpError::bad_request("port is not a valid u16"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn bracketed_ipv6_target_parses() {
        let (host, port) = parse_tcp_target(&query(&[("target", "[2001:db8::abcd]:443")])).unwrap();
        assert_eq!(host, "2001:db8::abcd");
        assert_eq!(port, 443);
    }

    #[test]
    fn unbracketed_ipv6_target_is_rejected() {
        assert!(parse_tcp_target(&query(&[("target", "2001:db8::abcd:443")])).is_err());
    }

    #[test]
    fn host_and_port_params_work() {
        let (host, port) = parse_tcp_target(&query(&[("host", "example.com"), ("port", "80")])).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(parse_tcp_target(&query(&[("target", "example.com")])).is_err());
    }
}
