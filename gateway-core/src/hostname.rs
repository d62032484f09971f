//! Hostname normalization and allowlist pattern matching.
//!
//! Any hostname that reaches the policy layer is first run through
//! IDNA (Unicode-to-Punycode + case folding) so that visually or
//! byte-wise distinct spellings of the same name can't be used to slip
//! past an allowlist entry written in its ASCII form. Matching against
//! operator-configured patterns happens only after that normalization.

use crate::error::{GatewayError, Result};

/// A hostname after IDNA normalization: lowercase, ASCII-compatible
/// encoding (punycode for non-ASCII labels), no trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedHostname(String);

impl NormalizedHostname {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NormalizedHostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of an allowlist/denylist: either an exact hostname or a
/// `*.suffix` wildcard matching exactly one label of subdomain depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostnamePattern {
    Exact(String),
    /// Holds the suffix after `*.`, e.g. `*.example.com` -> `example.com`.
    Wildcard(String),
}

/// Normalize a hostname: strip a trailing dot, lowercase, and apply
/// IDNA's ToASCII so every label is punycode-or-ASCII, then enforce the
/// label-shape rules IDNA alone doesn't: no underscores, no label
/// starting/ending with a hyphen, no empty labels, total length <= 253.
pub fn normalize_hostname(raw: &str) -> Result<NormalizedHostname> {
    let trimmed = raw.strip_suffix('.').unwrap_or(raw);
    if trimmed.is_empty() {
        return Err(GatewayError::invalid_input("empty hostname"));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|e| GatewayError::invalid_input(format!("invalid hostname {raw:?}: {e}")))?;

    if ascii.len() > 253 {
        return Err(GatewayError::invalid_input(format!(
            "hostname {raw:?} exceeds 253 characters after normalization"
        )));
    }
    for label in ascii.split('.') {
        if label.is_empty() {
            return Err(GatewayError::invalid_input(format!(
                "hostname {raw:?} has an empty label"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(GatewayError::invalid_input(format!(
                "hostname {raw:?} has a label starting or ending with '-'"
            )));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(GatewayError::invalid_input(format!(
                "hostname {raw:?} has a label with characters outside [A-Za-z0-9-]"
            )));
        }
    }

    Ok(NormalizedHostname(ascii))
}

/// Parse one allowlist/denylist entry into a pattern. `*.` prefixes a
/// wildcard; everything else is an exact match. The suffix (or the
/// whole entry, for an exact pattern) is normalized through IDNA the
/// same way a candidate hostname would be, so comparisons never drift
/// due to case or encoding differences between config and input.
pub fn parse_hostname_pattern(raw: &str) -> Result<HostnamePattern> {
    let raw = raw.trim();
    if let Some(suffix) = raw.strip_prefix("*.") {
        let normalized = normalize_hostname(suffix)?;
        if normalized.as_str().split('.').count() < 2 {
            return Err(GatewayError::invalid_input(format!(
                "wildcard pattern {raw:?} needs at least two labels after '*.'"
            )));
        }
        Ok(HostnamePattern::Wildcard(normalized.as_str().to_string()))
    } else {
        let normalized = normalize_hostname(raw)?;
        Ok(HostnamePattern::Exact(normalized.as_str().to_string()))
    }
}

/// Parse a comma-separated list of pattern strings (as configured via
/// an env var), trimming each entry, skipping empties, and
/// deduplicating. Fails on the first malformed entry so a bad config
/// value is caught at startup rather than silently matching nothing.
pub fn parse_hostname_patterns(csv: &str) -> Result<Vec<HostnamePattern>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in csv.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let pattern = parse_hostname_pattern(entry)?;
        if seen.insert(pattern.clone()) {
            out.push(pattern);
        }
    }
    Ok(out)
}

/// `true` if `hostname` is covered by `pattern`. A wildcard matches
/// exactly one additional label beneath its suffix — `*.example.com`
/// matches `api.example.com` but not `example.com` itself and not
/// `a.b.example.com`.
pub fn hostname_matches_pattern(hostname: &NormalizedHostname, pattern: &HostnamePattern) -> bool {
    match pattern {
        HostnamePattern::Exact(exact) => hostname.as_str() == exact,
        HostnamePattern::Wildcard(suffix) => {
            let h = hostname.as_str();
            match h.strip_suffix(suffix) {
                Some(prefix) => {
                    prefix.ends_with('.')
                        && prefix[..prefix.len() - 1].find('.').is_none()
                        && !prefix[..prefix.len() - 1].is_empty()
                }
                None => false,
            }
        }
    }
}

/// `true` if `hostname` matches any pattern in `patterns`.
pub fn hostname_matches_any(hostname: &NormalizedHostname, patterns: &[HostnamePattern]) -> bool {
    patterns.iter().any(|p| hostname_matches_pattern(hostname, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        let a = normalize_hostname("Example.COM.").unwrap();
        let b = normalize_hostname("example.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalizes_unicode_to_punycode() {
        let n = normalize_hostname("bücher.example").unwrap();
        assert!(n.as_str().starts_with("xn--"));
    }

    #[test]
    fn wildcard_matches_exactly_one_label_deep() {
        let pattern = parse_hostname_pattern("*.example.com").unwrap();
        let api = normalize_hostname("api.example.com").unwrap();
        let bare = normalize_hostname("example.com").unwrap();
        let nested = normalize_hostname("a.b.example.com").unwrap();
        assert!(hostname_matches_pattern(&api, &pattern));
        assert!(!hostname_matches_pattern(&bare, &pattern));
        assert!(!hostname_matches_pattern(&nested, &pattern));
    }

    #[test]
    fn exact_pattern_requires_full_match() {
        let pattern = parse_hostname_pattern("example.com").unwrap();
        let other = normalize_hostname("other.example.com").unwrap();
        assert!(!hostname_matches_pattern(&other, &pattern));
    }

    #[test]
    fn rejects_empty_hostname() {
        assert!(normalize_hostname("").is_err());
        assert!(normalize_hostname(".").is_err());
    }

    #[test]
    fn csv_patterns_trim_skip_empty_and_dedupe() {
        let patterns = parse_hostname_patterns(" example.com, ,example.com,*.foo.com").unwrap();
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn wildcard_requires_two_labels_in_suffix() {
        assert!(parse_hostname_pattern("*.com").is_err());
        assert!(parse_hostname_pattern("*.example.com").is_ok());
    }
}
