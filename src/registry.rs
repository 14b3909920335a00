//! The network registry and public entry object.
//!
//! A [`Resolver`] owns the per-network contexts, the private-DNS
//! subsystem and the event log. It is an explicit object handed around
//! by reference; nothing in the crate is process-global. Configuration
//! replacement is atomic under a monotonically increasing revision id.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::name::Name;
use parking_lot::RwLock;

use crate::cache::CacheFlags;
use crate::clock::{Clock, SystemClock};
use crate::config::{ResolverConfig, ResolverParams, RuntimeFlags};
use crate::context::{resolve, ResolverContext};
use crate::dispatch::QuestionBytes;
use crate::dns64::{prefix_from_answer, Prefix64, IPV4ONLY_ARPA};
use crate::dot::{
    DohDispatcher, PrivateDns, ServerIdentity, Validation,
};
use crate::error::{ConfigError, LookupError, QueryError};
use crate::events::{EventLog, EventObserver};
use crate::hosts::Hosts;
use crate::lookup::{addr, host, HostResults, LookupArgs};
use crate::oracle::RoutingOracle;
use crate::stats::ServerSnapshot;

/// How often a discovered prefix is re-checked.
const DISCOVERY_RECHECK: Duration = Duration::from_secs(600);

/// Initial and maximum retry delays while nothing is discovered.
const DISCOVERY_RETRY_INITIAL: Duration = Duration::from_secs(1);
const DISCOVERY_RETRY_MAX: Duration = Duration::from_secs(3600);

//------------ QueryFlags ----------------------------------------------------

/// Behavior flags of the raw-query interface.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// Make a single attempt only.
    pub const NO_RETRY: QueryFlags = QueryFlags(1 << 0);

    /// Do not store the answer in the cache.
    pub const NO_CACHE_STORE: QueryFlags = QueryFlags(1 << 1);

    /// Do not answer from the cache.
    pub const NO_CACHE_LOOKUP: QueryFlags = QueryFlags(1 << 2);

    /// Returns whether all bits of `other` are set.
    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

//------------ ResolverInfo --------------------------------------------------

/// A point-in-time view of one network's configuration and health.
#[derive(Clone, Debug)]
pub struct ResolverInfo {
    /// The network id.
    pub netid: u32,

    /// Cleartext servers as configured.
    pub servers: Vec<std::net::SocketAddr>,

    /// Search domains after sanitizing.
    pub search_domains: Vec<String>,

    /// Active parameters.
    pub params: ResolverParams,

    /// Per-server statistics.
    pub stats: Vec<ServerSnapshot>,

    /// Encrypted servers and their validation states.
    pub dot_servers: Vec<(ServerIdentity, Validation)>,

    /// The active NAT64 prefix, if any.
    pub prefix64: Option<Prefix64>,
}

//------------ Resolver ------------------------------------------------------

/// The resolver engine.
///
/// Generic over the clock only so tests can drive time; embedders use
/// the default.
pub struct Resolver<C: Clock = SystemClock> {
    /// Per-network contexts.
    networks: RwLock<HashMap<u32, Arc<ResolverContext<C>>>>,

    /// The private-DNS subsystem, shared across networks.
    private_dns: Arc<PrivateDns<C>>,

    /// Event fan-out and ring buffer.
    events: Arc<EventLog>,

    /// The platform routing policy.
    oracle: Arc<dyn RoutingOracle>,

    /// The system hosts table, read once at startup.
    system_hosts: Hosts,

    /// Runtime flags, snapshotted into networks when they are
    /// configured.
    flags: RwLock<RuntimeFlags>,

    /// Source of configuration revision ids.
    next_revision: AtomicU64,

    /// Time source.
    clock: C,
}

impl Resolver<SystemClock> {
    /// Creates a resolver with the system clock and hosts file.
    pub fn new(oracle: Arc<dyn RoutingOracle>) -> Self {
        Self::with_parts(oracle, Hosts::system(), SystemClock)
    }
}

impl<C: Clock> Resolver<C> {
    /// Creates a resolver with explicit collaborators. For embedders
    /// and tests.
    pub fn with_parts(
        oracle: Arc<dyn RoutingOracle>,
        system_hosts: Hosts,
        clock: C,
    ) -> Self {
        let events = Arc::new(EventLog::new());
        Self {
            networks: RwLock::new(HashMap::new()),
            private_dns: PrivateDns::new(events.clone(), clock.clone()),
            events,
            oracle,
            system_hosts,
            flags: RwLock::new(RuntimeFlags::default()),
            next_revision: AtomicU64::new(1),
            clock,
        }
    }

    /// Replaces the runtime flags.
    ///
    /// Flags become effective for a network the next time it is
    /// configured.
    pub fn set_runtime_flags(&self, flags: RuntimeFlags) {
        *self.flags.write() = flags;
    }

    /// Registers an event observer. Held weakly.
    pub fn register_observer(&self, observer: &Arc<dyn EventObserver>) {
        self.events.register(observer);
    }

    /// Installs the delegated HTTPS transport.
    pub fn set_doh_dispatcher(&self, doh: Arc<dyn DohDispatcher>) {
        self.private_dns.set_doh_dispatcher(doh);
    }

    /// Gives the private-DNS subsystem a short validation backoff. For
    /// testing.
    pub fn set_validation_backoff_for_testing(
        &self,
        initial: Duration,
        max: Duration,
    ) {
        self.private_dns.set_backoff_for_testing(initial, max);
    }

    //--- Network lifecycle

    /// Creates the state of a network.
    pub fn create_network_cache(&self, netid: u32) -> Result<(), ConfigError> {
        let mut networks = self.networks.write();
        if networks.contains_key(&netid) {
            return Err(ConfigError::Exists);
        }
        tracing::info!(netid, "creating network");
        networks.insert(
            netid,
            Arc::new(ResolverContext::new(
                netid,
                self.events.clone(),
                self.clock.clone(),
            )),
        );
        Ok(())
    }

    /// Destroys a network.
    ///
    /// In-flight queries fail with a transient error; cache waiters are
    /// woken.
    pub fn destroy_network_cache(
        &self,
        netid: u32,
    ) -> Result<(), ConfigError> {
        let ctx = self
            .networks
            .write()
            .remove(&netid)
            .ok_or(ConfigError::NotFound)?;
        tracing::info!(netid, "destroying network");
        ctx.destroy();
        self.private_dns.clear(netid);
        Ok(())
    }

    /// Evicts the cached answers of a network. Statistics and
    /// private-DNS state are untouched.
    pub fn flush_network_cache(&self, netid: u32) -> Result<(), ConfigError> {
        self.context(netid)?.flush();
        Ok(())
    }

    /// Atomically replaces the configuration of a network.
    pub fn set_resolver_configuration(
        &self,
        config: ResolverConfig,
    ) -> Result<(), ConfigError> {
        let ctx = self.context(config.netid)?;
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed);
        let flags = self.flags.read().clone();
        tracing::info!(
            netid = config.netid,
            revision,
            servers = config.servers.len(),
            dot_servers = config.dot_servers.len(),
            "installing configuration"
        );
        self.private_dns.configure(&config, &flags);
        ctx.set_configuration(config, revision, flags);
        Ok(())
    }

    /// Returns a view of a network's configuration and health.
    pub fn get_resolver_info(
        &self,
        netid: u32,
    ) -> Result<ResolverInfo, ConfigError> {
        let ctx = self.context(netid)?;
        let config = ctx.config();
        Ok(ResolverInfo {
            netid,
            servers: config.servers.clone(),
            search_domains: config.search_domains.clone(),
            params: config.params,
            stats: ctx.stats_snapshot(),
            dot_servers: self.private_dns.status(netid),
            prefix64: ctx.dns64().prefix(),
        })
    }

    //--- NAT64 prefix management

    /// Installs or clears a static NAT64 prefix.
    pub fn set_prefix64(
        &self,
        netid: u32,
        prefix: Option<&str>,
    ) -> Result<(), ConfigError> {
        let ctx = self.context(netid)?;
        let prefix = match prefix {
            Some(prefix) => Some(Prefix64::from_str(prefix)?),
            None => None,
        };
        ctx.dns64().set_prefix(prefix)
    }

    /// Starts periodic prefix discovery on a network.
    pub fn start_prefix64_discovery(
        &self,
        netid: u32,
    ) -> Result<(), ConfigError> {
        let ctx = self.context(netid)?;
        let generation = ctx.dns64().start_discovery()?;
        self.spawn_discovery(ctx, generation);
        Ok(())
    }

    /// Stops prefix discovery, removing a discovered prefix.
    pub fn stop_prefix64_discovery(
        &self,
        netid: u32,
    ) -> Result<(), ConfigError> {
        self.context(netid)?.dns64().stop_discovery();
        Ok(())
    }

    //--- Lookups

    /// Resolves a name into addresses.
    pub async fn lookup_host(
        &self,
        name: &str,
        args: LookupArgs,
    ) -> Result<HostResults, LookupError> {
        let (ctx, bypass) = self.route(args.uid, args.netid).map_err(
            |err| match err {
                QueryError::Refused => {
                    LookupError::System(libc::ECONNREFUSED)
                }
                _ => LookupError::System(libc::ENONET),
            },
        )?;
        host::lookup_host(
            &ctx,
            &self.private_dns,
            &self.events,
            &self.system_hosts,
            name,
            &args,
            bypass,
        )
        .await
    }

    /// Resolves an address into host names.
    pub async fn lookup_addr(
        &self,
        address: IpAddr,
        args: LookupArgs,
    ) -> Result<Vec<Name<Vec<u8>>>, LookupError> {
        let (ctx, bypass) = self.route(args.uid, args.netid).map_err(
            |err| match err {
                QueryError::Refused => {
                    LookupError::System(libc::ECONNREFUSED)
                }
                _ => LookupError::System(libc::ENONET),
            },
        )?;
        addr::lookup_addr(
            &ctx,
            &self.private_dns,
            &self.events,
            &self.system_hosts,
            address,
            bypass,
        )
        .await
    }

    /// Sends a caller-built query and returns the raw reply bytes.
    ///
    /// Failures map to negative errno values.
    pub async fn raw_query(
        &self,
        netid: u32,
        uid: u32,
        msg: Vec<u8>,
        flags: QueryFlags,
    ) -> Result<Bytes, i32> {
        let (ctx, bypass) =
            self.route(uid, netid).map_err(|err| err.errno())?;

        let question =
            QuestionBytes::from_raw(msg).map_err(|err| err.errno())?;
        let cache_flags = CacheFlags {
            no_lookup: flags.contains(QueryFlags::NO_CACHE_LOOKUP),
            no_store: flags.contains(QueryFlags::NO_CACHE_STORE),
        };
        let reply = resolve(
            &ctx,
            &self.private_dns,
            &self.events,
            &question,
            cache_flags,
            flags.contains(QueryFlags::NO_RETRY),
            bypass,
        )
        .await
        .map_err(|err| err.errno())?;

        // Cached entries carry the id of whoever filled them; always
        // hand back the caller's.
        let mut bytes = reply.as_slice().to_vec();
        bytes[..2].copy_from_slice(&question.caller_id().to_be_bytes());
        Ok(Bytes::from(bytes))
    }

    //--- Diagnostics

    /// Renders the full diagnostic dump.
    pub fn dump(&self, target: &mut String) {
        use std::fmt::Write;

        let networks: Vec<Arc<ResolverContext<C>>> = {
            let networks = self.networks.read();
            let mut list: Vec<_> = networks.values().cloned().collect();
            list.sort_by_key(|ctx| ctx.netid());
            list
        };

        for ctx in networks {
            let config = ctx.config();
            let _ = writeln!(target, "network {}:", ctx.netid());
            for snapshot in ctx.stats_snapshot() {
                let _ = writeln!(
                    target,
                    "  server {} {} successes {} errors {} timeouts {} \
                     internal {} rtt {}",
                    snapshot.server,
                    if snapshot.usable { "usable" } else { "unusable" },
                    snapshot.counts.successes,
                    snapshot.counts.errors,
                    snapshot.counts.timeouts,
                    snapshot.counts.internal_errors,
                    snapshot
                        .rtt_average
                        .map(|rtt| format!("{}ms", rtt.as_millis()))
                        .unwrap_or_else(|| "-".into()),
                );
            }
            if !config.search_domains.is_empty() {
                let _ = writeln!(
                    target,
                    "  search: {}",
                    config.search_domains.join(" ")
                );
            }
            let params = config.params;
            let _ = writeln!(
                target,
                "  params: timeout {}ms retries {} samples {}/{} \
                 validity {}s threshold {}%",
                params.base_timeout_msec,
                params.retry_count,
                params.min_samples,
                params.max_samples,
                params.sample_validity_sec,
                params.success_threshold,
            );
            self.private_dns.dump(ctx.netid(), target);
            if let Some(prefix) = ctx.dns64().prefix() {
                let _ = writeln!(target, "  prefix64: {}", prefix);
            }
        }

        let _ = writeln!(target, "events:");
        self.events.dump(target);
    }

    //--- Internals

    /// Looks up a context.
    fn context(
        &self,
        netid: u32,
    ) -> Result<Arc<ResolverContext<C>>, ConfigError> {
        self.networks
            .read()
            .get(&netid)
            .cloned()
            .ok_or(ConfigError::NotFound)
    }

    /// Routes a caller to its effective network.
    fn route(
        &self,
        uid: u32,
        requested_netid: u32,
    ) -> Result<(Arc<ResolverContext<C>>, bool), QueryError> {
        let route = self.oracle.route(uid, requested_netid);
        let ctx = self
            .networks
            .read()
            .get(&route.netid)
            .cloned()
            .ok_or(QueryError::NetworkGone)?;
        if route.uid_blocked && !ctx.config().options.enforce_dns_uid {
            return Err(QueryError::Refused);
        }
        Ok((ctx, route.local_nameservers))
    }

    /// Runs the periodic prefix discovery loop.
    fn spawn_discovery(
        &self,
        ctx: Arc<ResolverContext<C>>,
        generation: u64,
    ) {
        let private_dns = self.private_dns.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let qname = Name::<Vec<u8>>::from_str(IPV4ONLY_ARPA)
                .expect("well-known name parses");
            let mut retry = DISCOVERY_RETRY_INITIAL;
            loop {
                if ctx.is_destroyed() || !ctx.dns64().discovery_running()
                {
                    break;
                }
                let question = match QuestionBytes::new(
                    &qname,
                    Rtype::AAAA,
                    Class::IN,
                ) {
                    Ok(question) => question,
                    Err(_) => break,
                };
                // Discovery bypasses both the cache and the encrypted
                // path: the prefix belongs to the network, not to the
                // private DNS provider.
                let result = resolve(
                    &ctx,
                    &private_dns,
                    &events,
                    &question,
                    CacheFlags {
                        no_lookup: true,
                        no_store: true,
                    },
                    false,
                    true,
                )
                .await;
                let prefix = result
                    .ok()
                    .and_then(|msg| prefix_from_answer(&msg));
                if !ctx.dns64().on_discovered(generation, prefix) {
                    break;
                }
                let sleep_for = if prefix.is_some() {
                    retry = DISCOVERY_RETRY_INITIAL;
                    DISCOVERY_RECHECK
                } else {
                    retry = (retry * 2).min(DISCOVERY_RETRY_MAX);
                    retry
                };
                tokio::time::sleep(sleep_for).await;
            }
        });
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::oracle::StaticRoutes;

    fn resolver() -> Resolver<MockClock> {
        Resolver::with_parts(
            Arc::new(StaticRoutes::new(100)),
            Hosts::new(),
            MockClock::new(),
        )
    }

    #[tokio::test]
    async fn network_lifecycle() {
        let resolver = resolver();
        resolver.create_network_cache(100).unwrap();
        assert_eq!(
            resolver.create_network_cache(100),
            Err(ConfigError::Exists)
        );
        assert!(resolver.get_resolver_info(100).is_ok());

        resolver.destroy_network_cache(100).unwrap();
        assert_eq!(
            resolver.destroy_network_cache(100),
            Err(ConfigError::NotFound)
        );
        assert_eq!(
            resolver.flush_network_cache(100),
            Err(ConfigError::NotFound)
        );
    }

    #[tokio::test]
    async fn configuration_requires_existing_network() {
        let resolver = resolver();
        let config = ResolverConfig {
            netid: 100,
            servers: vec!["127.0.0.4:53".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(
            resolver.set_resolver_configuration(config.clone()),
            Err(ConfigError::NotFound)
        );
        resolver.create_network_cache(100).unwrap();
        resolver.set_resolver_configuration(config).unwrap();

        let info = resolver.get_resolver_info(100).unwrap();
        assert_eq!(info.servers.len(), 1);
        assert_eq!(info.stats.len(), 1);
    }

    #[tokio::test]
    async fn prefix64_rules() {
        let resolver = resolver();
        resolver.create_network_cache(100).unwrap();

        assert_eq!(
            resolver.set_prefix64(100, Some("not-a-prefix")),
            Err(ConfigError::Invalid("prefix"))
        );
        assert_eq!(
            resolver.set_prefix64(100, None),
            Err(ConfigError::NotFound)
        );
        resolver.set_prefix64(100, Some("64:ff9b::/96")).unwrap();
        assert_eq!(
            resolver.start_prefix64_discovery(100),
            Err(ConfigError::Exists)
        );
        resolver.set_prefix64(100, None).unwrap();

        resolver.start_prefix64_discovery(100).unwrap();
        assert_eq!(
            resolver.set_prefix64(100, Some("64:ff9b::/96")),
            Err(ConfigError::Exists)
        );
        resolver.stop_prefix64_discovery(100).unwrap();
    }

    #[tokio::test]
    async fn blocked_uid_is_refused() {
        let routes = Arc::new(StaticRoutes::new(100));
        routes.set_uid_blocked(4000, true);
        let resolver = Resolver::with_parts(
            routes,
            Hosts::new(),
            MockClock::new(),
        );
        resolver.create_network_cache(100).unwrap();

        let err = resolver
            .raw_query(0, 4000, vec![0u8; 12], QueryFlags::default())
            .await
            .unwrap_err();
        assert_eq!(err, -libc::ECONNREFUSED);
    }

    #[tokio::test]
    async fn raw_query_rejects_garbage() {
        let resolver = resolver();
        resolver.create_network_cache(100).unwrap();
        let err = resolver
            .raw_query(100, 1000, vec![1, 2, 3], QueryFlags::default())
            .await
            .unwrap_err();
        assert_eq!(err, -libc::EILSEQ);
    }

    #[tokio::test]
    async fn dump_renders_networks() {
        let resolver = resolver();
        resolver.create_network_cache(100).unwrap();
        resolver
            .set_resolver_configuration(ResolverConfig {
                netid: 100,
                servers: vec!["127.0.0.4:53".parse().unwrap()],
                search_domains: vec!["example.org".into()],
                ..Default::default()
            })
            .unwrap();
        let mut out = String::new();
        resolver.dump(&mut out);
        assert!(out.contains("network 100:"));
        assert!(out.contains("127.0.0.4:53"));
        assert!(out.contains("search: example.org"));
        assert!(out.contains("events:"));
    }
}
