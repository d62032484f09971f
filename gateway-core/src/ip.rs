//! IP literal parsing and public/reserved classification.
//!
//! The permissive IPv4 parser mirrors what `getaddrinfo`/`dns.lookup`
//! accept (dotted-quad decimal, octal, hex, 32-bit integer, and
//! `a.b`/`a.b.c` shorthands) so the policy layer can recognize every
//! non-canonical way a client might smuggle an IP literal past a
//! naive "looks like a hostname" check. The IPv6 parser is the
//! opposite: strict RFC 4291, rejecting the non-canonical forms a
//! permissive parser would accept, because IPv6 literals have no
//! equivalent legacy-syntax ambiguity to defend against and accepting
//! sloppy input there only widens the attack surface.
//!
//! Grounded on the reserved-range table and embedded-v4 extraction in
//! a retrieved SSRF guard (`url_validation.rs`), extended with the
//! additional ranges spec'd for this system (192.88.99/24, 198.18/15,
//! NAT64 prefixes, the IPv4-mapped/compatible v6 forms).

use std::net::{Ipv4Addr, Ipv6Addr};

/// IP version tag, matching the data model's `{version: 4|6, ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// A parsed IP literal in both native and canonical-string form.
///
/// Canonical form is dotted-decimal for v4 and fully-expanded
/// lowercase 8-group hex for v6, so that two textually different
/// encodings of the same address compare equal after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddress {
    pub version: IpVersion,
    pub canonical: String,
    addr: std::net::IpAddr,
}

impl IpAddress {
    fn v4(addr: Ipv4Addr) -> Self {
        Self {
            version: IpVersion::V4,
            canonical: addr.to_string(),
            addr: std::net::IpAddr::V4(addr),
        }
    }

    fn v6(addr: Ipv6Addr) -> Self {
        Self {
            version: IpVersion::V6,
            canonical: canonical_ipv6_string(&addr),
            addr: std::net::IpAddr::V6(addr),
        }
    }

    pub fn std_addr(&self) -> std::net::IpAddr {
        self.addr
    }

    /// Wrap an already-resolved [`std::net::IpAddr`] (e.g. a DNS answer)
    /// in its canonical form, without re-parsing a string.
    pub fn from_std(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(v4) => Self::v4(v4),
            std::net::IpAddr::V6(v6) => Self::v6(v6),
        }
    }

    /// True if this address is public (not in any reserved range),
    /// including classification of the embedded v4 address for
    /// v4-mapped/compatible v6 literals.
    pub fn is_public(&self) -> bool {
        match self.addr {
            std::net::IpAddr::V4(v4) => is_public_ipv4(v4),
            std::net::IpAddr::V6(v6) => is_public_ipv6(v6),
        }
    }
}

/// Fully-expanded, lowercase, colon-separated 8-group hex form.
fn canonical_ipv6_string(addr: &Ipv6Addr) -> String {
    let segs = addr.segments();
    segs.iter()
        .map(|s| format!("{:04x}", s))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `s` as an IP literal using the permissive rules a client's
/// resolver library would accept, for either version. Never panics;
/// returns `None` for anything that isn't recognizable as an IP.
pub fn parse_ip_literal(s: &str) -> Option<IpAddress> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(v6) = parse_ipv6_strict(s) {
        return Some(IpAddress::v6(v6));
    }
    if let Some(v4) = parse_ipv4_permissive(s) {
        return Some(IpAddress::v4(v4));
    }
    None
}

/// `true` iff `s` parses as an IP literal and that address is not in
/// any reserved range. Never throws; malformed input returns `false`.
pub fn is_public_ip_address(s: &str) -> bool {
    parse_ip_literal(s).map(|ip| ip.is_public()).unwrap_or(false)
}

// ---------------------------------------------------------------------
// IPv4: permissive parsing (dotted-quad decimal/octal/hex, 32-bit
// integer, a.b / a.b.c shorthands).
// ---------------------------------------------------------------------

/// Parse an IPv4 literal using the legacy syntax `getaddrinfo` accepts.
///
/// A leading `0` followed by a digit outside the octal range (`8`/`9`)
/// in *any* component forces the *entire* address to be reinterpreted
/// as plain decimal in every component (matches glibc's `inet_aton`).
/// A trailing dot forces decimal-only interpretation outright.
pub fn parse_ipv4_permissive(s: &str) -> Option<Ipv4Addr> {
    let trailing_dot = s.ends_with('.') && s.len() > 1;
    let body = if trailing_dot { &s[..s.len() - 1] } else { s };
    if body.is_empty() {
        return None;
    }

    let parts: Vec<&str> = body.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let mut decimal_only = trailing_dot;
    if !decimal_only {
        for part in &parts {
            if component_forces_decimal_fallback(part) {
                decimal_only = true;
                break;
            }
        }
    }

    let mut values: Vec<u64> = Vec::with_capacity(parts.len());
    for part in &parts {
        let v = if decimal_only {
            parse_component_decimal(part)?
        } else {
            parse_component_mixed(part)?
        };
        values.push(v);
    }

    // Distribute bits across components the way inet_aton does: every
    // component but the last is an 8-bit octet, the last absorbs the
    // remaining bits.
    let n = values.len();
    for (i, v) in values.iter().enumerate() {
        let max = if i + 1 < n {
            0xFFu64
        } else {
            match n {
                1 => u32::MAX as u64,
                2 => 0x00FF_FFFFu64,
                3 => 0x0000_FFFFu64,
                _ => 0xFFu64,
            }
        };
        if *v > max {
            return None;
        }
    }

    let addr: u32 = match n {
        1 => values[0] as u32,
        2 => ((values[0] as u32) << 24) | (values[1] as u32),
        3 => ((values[0] as u32) << 24) | ((values[1] as u32) << 16) | (values[2] as u32),
        4 => {
            ((values[0] as u32) << 24)
                | ((values[1] as u32) << 16)
                | ((values[2] as u32) << 8)
                | (values[3] as u32)
        }
        _ => unreachable!(),
    };

    Some(Ipv4Addr::from(addr))
}

/// `true` if this component has a leading zero, is longer than one
/// character, isn't hex-prefixed, and contains an out-of-octal digit
/// (8 or 9) — the glibc decimal-fallback trigger.
fn component_forces_decimal_fallback(part: &str) -> bool {
    if part.len() <= 1 {
        return false;
    }
    let lower = part.to_ascii_lowercase();
    if lower.starts_with("0x") {
        return false;
    }
    if !part.starts_with('0') {
        return false;
    }
    part.bytes().any(|b| b == b'8' || b == b'9')
}

/// Parse one component honoring its own base (hex `0x`, octal leading
/// `0`, or decimal).
fn parse_component_mixed(part: &str) -> Option<u64> {
    let lower = part.to_ascii_lowercase();
    if let Some(hex_digits) = lower.strip_prefix("0x") {
        if hex_digits.is_empty() || !hex_digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return u64::from_str_radix(hex_digits, 16).ok();
    }
    if part.starts_with('0') && part.len() > 1 {
        if !part.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return None;
        }
        return u64::from_str_radix(part, 8).ok();
    }
    parse_component_decimal(part)
}

fn parse_component_decimal(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse::<u64>().ok()
}

// ---------------------------------------------------------------------
// IPv6: strict RFC 4291 parsing.
// ---------------------------------------------------------------------

/// Parse an IPv6 literal, rejecting every non-canonical shorthand the
/// permissive IPv4 parser above would otherwise have to worry about:
/// stray leading/trailing colons, `:::`, an over-full `::`, and
/// non-canonical dotted-decimal v4 tails.
pub fn parse_ipv6_strict(s: &str) -> Option<Ipv6Addr> {
    if s.is_empty() || s.contains(":::") {
        return None;
    }

    let compressed = s.matches("::").count();
    if compressed > 1 {
        return None;
    }

    if compressed == 1 {
        let mut halves = s.splitn(2, "::");
        let left = halves.next().unwrap();
        let right = halves.next().unwrap();
        if right.contains("::") {
            return None;
        }
        let left_groups = parse_hex_groups(left)?;
        let right_groups = parse_hex_groups(right)?;
        let total = left_groups.len() + right_groups.len();
        if total >= 8 {
            // "::" with 8 groups already present has nothing left to
            // compress and is rejected.
            return None;
        }
        let mut segments = [0u16; 8];
        segments[..left_groups.len()].copy_from_slice(&left_groups);
        let right_start = 8 - right_groups.len();
        segments[right_start..].copy_from_slice(&right_groups);
        return Some(Ipv6Addr::from(segments));
    }

    // No compression: every group must be given explicitly, and a
    // leading/trailing lone colon (no "::") is invalid.
    if s.starts_with(':') || s.ends_with(':') {
        return None;
    }
    let groups = parse_hex_groups(s)?;
    if groups.len() != 8 {
        return None;
    }
    let mut segments = [0u16; 8];
    segments.copy_from_slice(&groups);
    Some(Ipv6Addr::from(segments))
}

/// Parse a colon-separated run of hex groups, with an optional trailing
/// canonical IPv4 dotted-decimal tail occupying the last two groups.
/// Returns the flattened `u16` segments (the v4 tail expands to two).
/// An empty input produces zero groups (used for the empty side of a
/// leading/trailing `::`).
fn parse_hex_groups(s: &str) -> Option<Vec<u16>> {
    if s.is_empty() {
        return Some(Vec::new());
    }
    let tokens: Vec<&str> = s.split(':').collect();
    let mut segments = Vec::with_capacity(tokens.len() + 1);
    for (i, tok) in tokens.iter().enumerate() {
        let is_last = i + 1 == tokens.len();
        if is_last && tok.contains('.') {
            let v4 = parse_ipv4_canonical_dotted(tok)?;
            let octets = v4.octets();
            segments.push(u16::from_be_bytes([octets[0], octets[1]]));
            segments.push(u16::from_be_bytes([octets[2], octets[3]]));
            continue;
        }
        if tok.is_empty() || tok.len() > 4 || !tok.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        segments.push(u16::from_str_radix(tok, 16).ok()?);
    }
    Some(segments)
}

/// Strict canonical dotted-decimal parse used only for an IPv6 literal's
/// embedded v4 tail: exactly 4 octets, each 1-3 plain decimal digits,
/// no leading zero unless the octet is literally `"0"`.
fn parse_ipv4_canonical_dotted(s: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        octets[i] = part.parse::<u16>().ok().filter(|v| *v <= 255)? as u8;
    }
    Some(Ipv4Addr::from(octets))
}

// ---------------------------------------------------------------------
// Reserved-range classification (§4.1).
// ---------------------------------------------------------------------

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    !is_reserved_ipv4(ip)
}

fn is_reserved_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    let (a, b, c) = (o[0], o[1], o[2]);

    a == 0                                   // 0.0.0.0/8
        || a == 10                           // 10/8
        || (a == 100 && (64..=127).contains(&b)) // 100.64/10
        || a == 127                          // 127/8
        || (a == 169 && b == 254)            // 169.254/16
        || (a == 172 && (16..=31).contains(&b)) // 172.16/12
        || (a == 192 && b == 0 && c == 0)    // 192.0.0/24
        || (a == 192 && b == 0 && c == 2)    // 192.0.2/24
        || (a == 192 && b == 88 && c == 99)  // 192.88.99/24
        || (a == 192 && b == 168)            // 192.168/16
        || (a == 198 && (18..=19).contains(&b)) // 198.18/15
        || (a == 198 && b == 51 && c == 100) // 198.51.100/24
        || (a == 203 && b == 0 && c == 113)  // 203.0.113/24
        || (224..=239).contains(&a)          // 224/4
        || a >= 240                          // 240/4 (includes 255.255.255.255)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = embedded_ipv4(ip) {
        return is_public_ipv4(v4);
    }
    !is_reserved_ipv6(ip)
}

fn is_reserved_ipv6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();

    ip.is_unspecified()                        // ::/128
        || ip.is_loopback()                    // ::1/128
        || (s[0] & 0xfe00) == 0xfc00            // fc00::/7
        || (s[0] & 0xffc0) == 0xfe80             // fe80::/10
        || (s[0] & 0xff00) == 0xff00              // ff00::/8
        || (s[0] == 0x2001 && s[1] == 0x0db8)     // 2001:db8::/32
        || (s[0] == 0x0064 && s[1] == 0xff9b && s[2] == 0x0001) // 64:ff9b:1::/48
        || (s[0] == 0x0100 && s[1] == 0 && s[2] == 0 && s[3] == 0) // 100::/64
}

/// Extract the embedded IPv4 address from IPv4-mapped (`::ffff:a.b.c.d`)
/// or IPv4-compatible (`::a.b.c.d`, excluding `::`/`::1`) IPv6 forms, and
/// from the NAT64 well-known prefix `64:ff9b::/96`.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let segs = ip.segments();
    let octets = ip.octets();

    // ::ffff:a.b.c.d
    if segs[0..5] == [0, 0, 0, 0, 0] && segs[5] == 0xffff {
        return Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }

    // 64:ff9b::a.b.c.d (NAT64 well-known prefix, /96)
    if segs[0] == 0x0064 && segs[1] == 0xff9b && segs[2..6] == [0, 0, 0, 0] {
        return Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }

    // ::a.b.c.d (IPv4-compatible, deprecated) — excludes :: and ::1,
    // which are native IPv6 addresses, not embedded v4.
    if segs[0..6] == [0, 0, 0, 0, 0, 0] && !ip.is_unspecified() && !ip.is_loopback() {
        return Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_ipv4_forms_all_parse_to_same_address() {
        let expected = Ipv4Addr::new(127, 0, 0, 1);
        assert_eq!(parse_ipv4_permissive("0177.0.0.1"), Some(expected));
        assert_eq!(parse_ipv4_permissive("0x7f.0.0.1"), Some(expected));
        assert_eq!(parse_ipv4_permissive("2130706433"), Some(expected));
        assert_eq!(parse_ipv4_permissive("127.1"), Some(expected));
        assert_eq!(parse_ipv4_permissive("8.8.8.8."), None); // handled via parse_ip_literal path below
    }

    #[test]
    fn trailing_dot_forces_decimal_only() {
        assert_eq!(
            parse_ip_literal("8.8.8.8.").map(|ip| ip.canonical),
            Some("8.8.8.8".to_string())
        );
    }

    #[test]
    fn leading_zero_with_out_of_octal_digit_falls_back_to_decimal() {
        assert_eq!(
            parse_ipv4_permissive("08.0.0.1"),
            Some(Ipv4Addr::new(8, 0, 0, 1))
        );
    }

    #[test]
    fn ipv6_rejects_non_canonical_tail() {
        assert_eq!(parse_ipv6_strict("::001.002.003.004"), None);
        assert_eq!(parse_ipv6_strict("::1.2.3.4"), Some("::1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn ipv6_rejects_triple_colon_and_stray_colons() {
        assert_eq!(parse_ipv6_strict(":::1"), None);
        assert_eq!(parse_ipv6_strict(":1:2:3:4:5:6:7"), None);
        assert_eq!(parse_ipv6_strict("1:2:3:4:5:6:7:"), None);
    }

    #[test]
    fn ipv6_rejects_over_full_compression() {
        assert_eq!(parse_ipv6_strict("1:2:3:4:5:6:7::8"), None);
    }

    #[test]
    fn ipv6_case_insensitive_matches_canonically() {
        let a = parse_ip_literal("2001:DB8::ABCD").unwrap();
        let b = parse_ip_literal("2001:0db8:0000:0000:0000:0000:0000:abcd").unwrap();
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn classification_reserved_ranges() {
        assert!(!is_public_ip_address("10.0.0.1"));
        assert!(!is_public_ip_address("192.168.1.5"));
        assert!(is_public_ip_address("8.8.8.8"));
        assert!(!is_public_ip_address("169.254.1.1"));
        assert!(!is_public_ip_address("192.88.99.1"));
        assert!(!is_public_ip_address("198.18.0.1"));
    }

    #[test]
    fn classification_v4_mapped_v6_uses_embedded_v4() {
        assert!(!is_public_ip_address("::ffff:192.168.1.5"));
        assert!(is_public_ip_address("::ffff:8.8.8.8"));
    }

    #[test]
    fn malformed_input_never_panics_and_returns_false() {
        assert!(!is_public_ip_address(""));
        assert!(!is_public_ip_address("not-an-ip"));
        assert!(!is_public_ip_address("999.999.999.999"));
        assert!(!is_public_ip_address("1:2:3"));
    }
}
