//! Wire transports.
//!
//! Three layers: [`protocol`] knows how to open connections, [`dgram`]
//! performs single UDP exchanges, and [`stream`] frames messages over
//! TCP or TLS, either one-shot or multiplexed over a long-lived
//! connection. Retry policy and server selection live above, in the
//! dispatcher.

pub mod dgram;
pub mod protocol;
pub mod stream;
