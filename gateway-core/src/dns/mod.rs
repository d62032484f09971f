//! DNS façade: wire codec (C4) and forwarding resolver pipeline (C5)
//! behind the `/dns-query` (DoH) and `/dns-json` HTTP endpoints.
//!
//! Grounded on the teacher's `hickory-server`-based authoritative zone
//! handler (`shelter/src/commands/dns.rs`), generalized from "answer
//! every query for one zone with a crafted TXT record" to "forward
//! every permitted query to a real upstream and post-filter the
//! answer". The wire types come from `hickory_resolver::proto`, the
//! same re-export the teacher's `runner` crate already depends on for
//! its own DNS transport selection.

pub mod cache;
pub mod codec;
pub mod metrics;
pub mod ratelimit;
pub mod resolver;

pub use codec::{ParsedQuery, QuestionClass};
pub use metrics::{DnsMetrics, QueryResult};
pub use resolver::{DnsResolver, ResolverConfig, Upstream};
