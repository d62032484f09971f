//! Error taxonomy for the gateway core.
//!
//! Every failure in `gateway-core` is tagged with one of the kinds from
//! the error handling design: malformed client input, a policy denial,
//! an unavailable upstream, resource exhaustion, or an internal bug.
//! The kind (not the concrete variant) is what callers in the `gateway`
//! binary crate switch on when choosing an HTTP status code or a
//! WebSocket close code.

use std::fmt;

/// Result alias using the crate's [`GatewayError`] as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The reason an [`crate::policy::EgressDecision`] denied a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    BlockedByHostPolicy,
    IpLiteralDisallowed,
    PrivateIpDisallowed,
    DnsResolutionFailed,
    NoPublicIps,
}

impl DenyReason {
    /// Machine-readable reason string, used in OPEN_ACK errors and
    /// pre-upgrade 403 bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedByHostPolicy => "blocked-by-host-policy",
            Self::IpLiteralDisallowed => "ip-literal-disallowed",
            Self::PrivateIpDisallowed => "private-ip-disallowed",
            Self::DnsResolutionFailed => "dns-resolution-failed",
            Self::NoPublicIps => "no-public-ips",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all `gateway-core` failures.
///
/// Each variant is tagged with its error-handling kind in its doc
/// comment; see §7 of the design for the full propagation rules.
#[derive(Debug)]
pub enum GatewayError {
    /// Kind: InvalidClientInput. Malformed URL, frame, base64url, or
    /// DNS wire data from the client side.
    InvalidInput(String),
    /// Kind: PolicyDenied. Carries the machine-readable reason.
    PolicyDenied(DenyReason),
    /// Kind: UpstreamUnavailable. DNS upstream or TCP target connect
    /// failed or timed out after the retry budget was exhausted.
    UpstreamUnavailable(String),
    /// Kind: ResourceExhausted. Admission limit, flow-control window
    /// violation, or cache/map overflow.
    ResourceExhausted(String),
    /// Kind: Internal. Unreachable states; always logged with context
    /// before being surfaced.
    Internal(String),
}

impl GatewayError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The taxonomy kind this error belongs to, as a short tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid-client-input",
            Self::PolicyDenied(_) => "policy-denied",
            Self::UpstreamUnavailable(_) => "upstream-unavailable",
            Self::ResourceExhausted(_) => "resource-exhausted",
            Self::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid client input: {msg}"),
            Self::PolicyDenied(reason) => write!(f, "policy denied: {reason}"),
            Self::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}
