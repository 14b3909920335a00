//! A per-network stub DNS resolver engine.
//!
//! This crate mediates name lookups for a system with multiple
//! concurrently connected networks. Each network carries its own server
//! list, search domains, tuning parameters, answer cache and NAT64
//! prefix. Queries are routed to a network by a pluggable platform
//! policy, dispatched over UDP with TCP upgrade or over validated TLS
//! transports, scored into per-server statistics, and post-processed
//! with search expansion, CNAME resolution, DNS64 synthesis and
//! RFC 6724 ordering.
//!
//! The central type is [`Resolver`]: an explicit engine object with no
//! global state. Configure networks with
//! [`Resolver::set_resolver_configuration`], then resolve through
//! [`Resolver::lookup_host`], [`Resolver::lookup_addr`] or the raw
//! [`Resolver::raw_query`] interface.
//!
//! ```no_run
//! use std::sync::Arc;
//! use netresolv::{LookupArgs, Resolver, ResolverConfig, StaticRoutes};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Resolver::new(Arc::new(StaticRoutes::new(100)));
//! resolver.create_network_cache(100)?;
//! resolver.set_resolver_configuration(ResolverConfig {
//!     netid: 100,
//!     servers: vec!["8.8.8.8:53".parse()?],
//!     ..Default::default()
//! })?;
//!
//! let found = resolver
//!     .lookup_host("www.example.com", LookupArgs::on_network(100, 0))
//!     .await?;
//! for entry in &found.entries {
//!     println!("{}", entry.addr);
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod clock;
mod config;
mod context;
mod dispatch;
mod dns64;
mod dot;
mod error;
mod events;
mod hosts;
mod lookup;
mod mdns;
mod oracle;
mod registry;
mod sort;
mod stats;
mod transport;

pub use self::clock::{Clock, Elapsed, MockClock, SystemClock};
pub use self::config::{
    AddrConfig, DohParams, PrivateDnsMode, ResolverConfig, ResolverOptions,
    ResolverParams, RuntimeFlags, TcMode, TransportType, MAXDNSRCH, MAXNS,
};
pub use self::dns64::Prefix64;
pub use self::dot::{DohDispatcher, ServerIdentity, Validation};
pub use self::error::{ConfigError, LookupError, QueryError};
pub use self::events::{Event, EventObserver};
pub use self::hosts::Hosts;
pub use self::lookup::{
    AddrInfo, Family, HostResults, LookupArgs, LookupFlags, SockType,
};
pub use self::oracle::{
    Route, RoutingOracle, StaticRoutes, NETID_UNSET,
    NETID_USE_LOCAL_NAMESERVERS,
};
pub use self::registry::{QueryFlags, Resolver, ResolverInfo};
pub use self::stats::{Counts, ServerSnapshot};
