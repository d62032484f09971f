//! TCP egress: the single-stream tunnel supervisor (C6) and the
//! credit-flow multiplexed tunnel (C7/C8).

pub mod mux;
pub mod proxy;
pub mod target;

pub use proxy::{connect_with_timeout, relay_full_duplex, DefaultSocketFactory, RelayOutcome, SocketFactory};
pub use target::{resolve_and_connect, resolve_target, ProxyContext};
