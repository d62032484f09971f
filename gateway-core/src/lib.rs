//! Core protocol, policy, and proxy logic for the browser egress
//! gateway. The `gateway` binary crate wires this into an HTTP/WebSocket
//! server; everything here is transport-agnostic and testable without
//! a running network stack.

pub mod admission;
pub mod dns;
pub mod error;
pub mod hostname;
pub mod ip;
pub mod policy;
pub mod tcp;

pub use error::{GatewayError, Result};
