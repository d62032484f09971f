//! DNS wire codec (C4): DoH query-string decoding, strict question
//! parsing, and answer post-filtering.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_resolver::proto::op::{Message, MessageType, ResponseCode};
use hickory_resolver::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_resolver::proto::serialize::binary::BinDecodable;

use crate::error::{GatewayError, Result};
use crate::ip;

/// QTYPEs the façade forwards when `DNS_ALLOW_ANY` is unset.
pub const ALLOWED_QTYPES: &[RecordType] = &[
    RecordType::A,
    RecordType::AAAA,
    RecordType::CNAME,
    RecordType::PTR,
    RecordType::MX,
    RecordType::TXT,
    RecordType::SRV,
    RecordType::HTTPS,
    RecordType::SVCB,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionClass {
    In,
    Other,
}

/// The question this query carries, extracted after strict validation.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub id: u16,
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: QuestionClass,
}

impl ParsedQuery {
    pub fn cache_key(&self) -> (String, RecordType) {
        (self.qname.to_ascii().to_ascii_lowercase(), self.qtype)
    }
}

/// Decode a `dns=<base64url>` query-string value. No padding is
/// accepted — a trailing `=` is a malformed-query error, not a
/// tolerated variant — and the decoded length is capped at
/// `max_query_bytes` before any wire parsing happens.
pub fn parse_doh_get_param(base64url: &str, max_query_bytes: usize) -> Result<Vec<u8>> {
    let decoded = URL_SAFE_NO_PAD
        .decode(base64url)
        .map_err(|e| GatewayError::invalid_input(format!("malformed-query: bad base64url: {e}")))?;
    if decoded.len() > max_query_bytes {
        return Err(GatewayError::invalid_input(
            "malformed-query: query exceeds DNS_MAX_QUERY_BYTES",
        ));
    }
    Ok(decoded)
}

/// Parse and strictly validate a DNS query message.
///
/// Rejects anything other than exactly one question, QCLASS != IN,
/// an over-long QNAME, an over-long label, or a QNAME built with a
/// compression pointer (queries must be unpointered — pointers only
/// make sense relative to bytes earlier in the same message, which a
/// freshly-built question never has reason to use).
pub fn parse_dns_query(bytes: &[u8]) -> Result<ParsedQuery> {
    reject_qname_compression(bytes)?;

    let message = Message::from_bytes(bytes)
        .map_err(|e| GatewayError::invalid_input(format!("malformed-query: {e}")))?;

    let queries = message.queries();
    if queries.len() != 1 {
        return Err(GatewayError::invalid_input(
            "malformed-query: expected exactly one question",
        ));
    }
    let query = &queries[0];

    let qclass = if query.query_class() == DNSClass::IN {
        QuestionClass::In
    } else {
        QuestionClass::Other
    };
    if qclass != QuestionClass::In {
        return Err(GatewayError::invalid_input("malformed-query: QCLASS must be IN"));
    }

    let qname = query.name().clone();
    if qname.to_ascii().len() > 255 {
        return Err(GatewayError::invalid_input("malformed-query: QNAME exceeds 255 bytes"));
    }
    for label in qname.iter() {
        if label.len() > 63 {
            return Err(GatewayError::invalid_input("malformed-query: label exceeds 63 bytes"));
        }
    }

    Ok(ParsedQuery {
        id: message.id(),
        qname,
        qtype: query.query_type(),
        qclass,
    })
}

/// Walk the raw question-section bytes by hand (the header is always a
/// fixed 12 bytes) and reject any length byte whose top two bits are
/// set — a compression pointer — before a decompressing parser ever
/// gets a chance to quietly resolve it.
fn reject_qname_compression(bytes: &[u8]) -> Result<()> {
    const HEADER_LEN: usize = 12;
    if bytes.len() < HEADER_LEN + 1 {
        return Err(GatewayError::invalid_input("malformed-query: truncated message"));
    }
    let mut offset = HEADER_LEN;
    loop {
        let len_byte = *bytes
            .get(offset)
            .ok_or_else(|| GatewayError::invalid_input("malformed-query: truncated QNAME"))?;
        if len_byte & 0xC0 == 0xC0 {
            return Err(GatewayError::invalid_input(
                "malformed-query: QNAME uses a compression pointer",
            ));
        }
        if len_byte == 0 {
            return Ok(());
        }
        offset = offset
            .checked_add(1 + len_byte as usize)
            .ok_or_else(|| GatewayError::invalid_input("malformed-query: QNAME overruns message"))?;
        if offset >= bytes.len() {
            return Err(GatewayError::invalid_input("malformed-query: QNAME overruns message"));
        }
    }
}

/// Outcome of post-filtering an upstream DNS response.
pub struct FilteredResponse {
    pub bytes: Vec<u8>,
    pub min_answer_ttl: Option<u32>,
    pub is_negative: bool,
}

/// Re-parse an upstream response, strip any A/AAAA answer RR whose
/// address isn't public (unless private is allowed), recompute the
/// header counts, and downgrade a now-empty successful response to
/// NXDOMAIN so cache semantics stay consistent with what the client
/// actually received.
pub fn filter_dns_response(bytes: &[u8], allow_private: bool, allow_private_ptr: bool) -> Result<FilteredResponse> {
    let mut message = Message::from_bytes(bytes)
        .map_err(|e| GatewayError::upstream_unavailable(format!("malformed upstream response: {e}")))?;

    if !allow_private_ptr {
        for query in message.queries() {
            if query.query_type() == RecordType::PTR && is_private_ptr_query(query.name()) {
                return Err(GatewayError::PolicyDenied(crate::error::DenyReason::PrivateIpDisallowed));
            }
        }
    }

    let kept: Vec<Record> = message
        .answers()
        .iter()
        .filter(|record| record_is_acceptable(record, allow_private))
        .cloned()
        .collect();

    let stripped_any = kept.len() != message.answers().len();
    let min_ttl = kept.iter().map(|r| r.ttl()).min();

    if stripped_any {
        message.answers_mut().clear();
        for record in kept {
            message.add_answer(record);
        }
        if message.answers().is_empty() && message.response_code() == ResponseCode::NoError {
            message.set_response_code(ResponseCode::NXDomain);
        }
    }

    let is_negative = message.response_code() != ResponseCode::NoError || message.answers().is_empty();

    Ok(FilteredResponse {
        bytes: message_to_bytes(&message)?,
        min_answer_ttl: min_ttl,
        is_negative,
    })
}

fn record_is_acceptable(record: &Record, allow_private: bool) -> bool {
    match record.record_type() {
        RecordType::A | RecordType::AAAA => match record.data() {
            RData::A(addr) => allow_private || ip::is_public_ip_address(&addr.0.to_string()),
            RData::AAAA(addr) => allow_private || ip::is_public_ip_address(&addr.0.to_string()),
            _ => true,
        },
        _ => true,
    }
}

fn is_private_ptr_query(name: &Name) -> bool {
    let ascii = name.to_ascii().to_ascii_lowercase();
    ascii.ends_with("in-addr.arpa.") || ascii.ends_with("ip6.arpa.")
}

fn message_to_bytes(message: &Message) -> Result<Vec<u8>> {
    use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| GatewayError::internal(format!("failed to re-encode dns response: {e}")))?;
    Ok(buf)
}

#[allow(dead_code)]
fn response_is_query(message: &Message) -> bool {
    message.message_type() == MessageType::Query
}

/// Build a minimal single-question query message, used by the TCP
/// proxy supervisor to re-resolve a hostname target through the same
/// forwarding pipeline (and therefore the same answer post-filtering)
/// that serves `/dns-query` directly.
pub fn build_simple_query(id: u16, qname: &Name, qtype: RecordType) -> Result<Vec<u8>> {
    use hickory_resolver::proto::op::Query;
    use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(qname.clone(), qtype));
    let mut buf = Vec::with_capacity(32);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| GatewayError::internal(format!("failed to encode query: {e}")))?;
    Ok(buf)
}

/// Extract every A/AAAA answer address from a wire-format response.
/// Used after [`build_simple_query`] round-trips through the resolver
/// pipeline (which already applies [`filter_dns_response`]), so the
/// caller gets back only addresses that already passed post-filtering.
pub fn extract_answer_addrs(bytes: &[u8]) -> Vec<std::net::IpAddr> {
    let Ok(message) = Message::from_bytes(bytes) else {
        return Vec::new();
    };
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(addr) => Some(std::net::IpAddr::V4(addr.0)),
            RData::AAAA(addr) => Some(std::net::IpAddr::V6(addr.0)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::op::Query;
    use std::str::FromStr;

    fn build_query_bytes(name: &str, qtype: RecordType) -> Vec<u8> {
        use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
        let mut message = Message::new();
        message.set_id(42);
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        let mut buf = Vec::new();
        let mut encoder = BinEncoder::new(&mut buf);
        message.emit(&mut encoder).unwrap();
        buf
    }

    #[test]
    fn parses_well_formed_single_question() {
        let bytes = build_query_bytes("example.com.", RecordType::A);
        let parsed = parse_dns_query(&bytes).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.qtype, RecordType::A);
        assert!(matches!(parsed.qclass, QuestionClass::In));
    }

    #[test]
    fn doh_param_rejects_padding() {
        assert!(parse_doh_get_param("AAA=", 512).is_err());
        assert!(parse_doh_get_param("AAAA", 512).is_ok());
    }

    #[test]
    fn doh_param_enforces_max_length() {
        let too_big = URL_SAFE_NO_PAD.encode(vec![0u8; 100]);
        assert!(parse_doh_get_param(&too_big, 10).is_err());
    }

    #[test]
    fn filters_private_answers_and_downgrades_to_nxdomain() {
        use hickory_resolver::proto::rr::rdata::A as ARdata;
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);
        let name = Name::from_str("example.com.").unwrap();
        message.add_answer(Record::from_rdata(name, 300, RData::A(ARdata(std::net::Ipv4Addr::new(10, 0, 0, 1)))));
        let mut buf = Vec::new();
        {
            use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
            let mut encoder = BinEncoder::new(&mut buf);
            message.emit(&mut encoder).unwrap();
        }
        let filtered = filter_dns_response(&buf, false, false).unwrap();
        assert!(filtered.is_negative);
        let reparsed = Message::from_bytes(&filtered.bytes).unwrap();
        assert_eq!(reparsed.answer_count(), 0);
        assert_eq!(reparsed.response_code(), ResponseCode::NXDomain);
    }
}
