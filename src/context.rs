//! Per-network resolver state.
//!
//! A [`ResolverContext`] owns everything one network needs: the
//! sanitized configuration under a revision id, the server statistics,
//! the answer cache and the NAT64 prefix state. Reads take the shared
//! lock briefly to snapshot an [`AttemptPlan`]; a query then proceeds
//! without ever re-entering the lock. Destroying the network flips the
//! cancellation flag, wakes cache waiters and detaches the context from
//! the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::name::Name;
use domain::base::Message;
use parking_lot::{Mutex, RwLock};

use crate::cache::{AnswerCache, CacheFlags, CacheKey, CacheOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::{
    sanitize_search_domains, sanitize_servers, AddrConfig, PrivateDnsMode,
    ResolverConfig, ResolverParams, RuntimeFlags, TransportType,
};
use crate::dispatch::{
    AttemptPlan, Dispatcher, QuestionBytes, StatsReporter,
};
use crate::dns64::Dns64State;
use crate::dot::PrivateDns;
use crate::error::QueryError;
use crate::events::EventLog;
use crate::hosts::Hosts;
use crate::stats::{NetworkStats, SampleOutcome, ServerSnapshot};

//------------ ResolverContext -----------------------------------------------

/// The state of one network.
pub(crate) struct ResolverContext<C: Clock = SystemClock> {
    /// The network id.
    netid: u32,

    /// Configuration and its revision.
    inner: RwLock<NetConfig>,

    /// Per-server sample windows.
    stats: Mutex<NetworkStats<C>>,

    /// The answer cache.
    cache: AnswerCache<C>,

    /// NAT64 prefix state.
    dns64: Dns64State,

    /// Flipped once when the network is destroyed.
    cancelled: Arc<AtomicBool>,
}

/// The replaceable part of the context.
struct NetConfig {
    /// The sanitized configuration.
    config: Arc<ResolverConfig>,

    /// Revision id of this configuration.
    revision: u64,

    /// Flags snapshotted when the configuration was installed.
    flags: RuntimeFlags,

    /// The per-network authoritative host table.
    custom_hosts: Arc<Hosts>,
}

impl<C: Clock> ResolverContext<C> {
    /// Creates a context with an empty configuration.
    pub fn new(netid: u32, events: Arc<EventLog>, clock: C) -> Self {
        Self {
            netid,
            inner: RwLock::new(NetConfig {
                config: Arc::new(ResolverConfig {
                    netid,
                    ..Default::default()
                }),
                revision: 0,
                flags: RuntimeFlags::default(),
                custom_hosts: Arc::new(Hosts::new()),
            }),
            stats: Mutex::new(NetworkStats::new(clock.clone())),
            cache: AnswerCache::new(clock.clone()),
            dns64: Dns64State::new(netid, events),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The network id.
    pub fn netid(&self) -> u32 {
        self.netid
    }

    /// Installs a new configuration under `revision`.
    ///
    /// Statistics survive iff the cleartext server set is unchanged;
    /// the cache, DNS64 prefix and private-DNS state always survive.
    pub fn set_configuration(
        &self,
        mut config: ResolverConfig,
        revision: u64,
        flags: RuntimeFlags,
    ) {
        config.servers = sanitize_servers(&config.servers);
        config.search_domains =
            sanitize_search_domains(&config.search_domains);

        let custom_hosts =
            Arc::new(Hosts::from_pairs(&config.options.custom_hosts));

        let mut inner = self.inner.write();
        let old_set: std::collections::HashSet<SocketAddr> =
            inner.config.servers.iter().copied().collect();
        let new_set: std::collections::HashSet<SocketAddr> =
            config.servers.iter().copied().collect();
        let preserve = old_set == new_set;

        self.stats.lock().install(revision, &config.servers, preserve);

        inner.config = Arc::new(config);
        inner.revision = revision;
        inner.flags = flags;
        inner.custom_hosts = custom_hosts;
    }

    /// Snapshots everything a query needs.
    pub fn attempt_plan(&self, mode: PrivateDnsMode) -> AttemptPlan {
        let inner = self.inner.read();
        let ordered = self.stats.lock().ordered(
            &inner.config.params,
            inner.flags.sort_nameservers,
        );
        // Flag overrides beat the configured parameters when set.
        let mut params = inner.config.params;
        if inner.flags.retry_count > 0 {
            params.retry_count = inner.flags.retry_count;
        }
        if inner.flags.retransmission_time_ms > 0 {
            params.base_timeout_msec = inner.flags.retransmission_time_ms;
        }
        AttemptPlan {
            netid: self.netid,
            revision: inner.revision,
            servers: ordered,
            params,
            flags: inner.flags.clone(),
            tc_mode: inner.config.options.tc_mode,
            mode,
            cancelled: self.cancelled.clone(),
        }
    }

    /// The current configuration.
    pub fn config(&self) -> Arc<ResolverConfig> {
        self.inner.read().config.clone()
    }

    /// The flag snapshot of the current configuration.
    pub fn flags(&self) -> RuntimeFlags {
        self.inner.read().flags.clone()
    }

    /// The per-network host table.
    pub fn custom_hosts(&self) -> Arc<Hosts> {
        self.inner.read().custom_hosts.clone()
    }

    /// The transport types of the network.
    pub fn transport_types(&self) -> Vec<TransportType> {
        self.inner.read().config.transport_types.clone()
    }

    /// The interface address configuration.
    pub fn addr_config(&self) -> AddrConfig {
        self.inner.read().config.addr_config
    }

    /// Current parameters.
    pub fn params(&self) -> ResolverParams {
        self.inner.read().config.params
    }

    /// The NAT64 prefix state.
    pub fn dns64(&self) -> &Dns64State {
        &self.dns64
    }

    /// The answer cache.
    pub fn cache(&self) -> &AnswerCache<C> {
        &self.cache
    }

    /// Statistics snapshot for the diagnostic dump.
    pub fn stats_snapshot(&self) -> Vec<ServerSnapshot> {
        let params = self.params();
        self.stats.lock().snapshot(&params)
    }

    /// Evicts cached answers, leaving stats and validation alone.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Tears the network down.
    pub fn destroy(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.cache.destroy();
        self.dns64.stop_discovery();
    }

    /// Whether the network has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl<C: Clock> StatsReporter for ResolverContext<C> {
    fn report(
        &self,
        revision: u64,
        server: SocketAddr,
        outcome: SampleOutcome,
        rtt: Option<Duration>,
    ) {
        let params = self.params();
        self.stats
            .lock()
            .report(revision, server, outcome, rtt, &params);
    }
}

//------------ resolve -------------------------------------------------------

/// Answers one question through the cache and the dispatcher.
///
/// Identical concurrent questions coalesce onto a single upstream
/// query. A stale entry is served immediately while a background
/// refresh runs under its own lease.
pub(crate) async fn resolve<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    question: &QuestionBytes,
    cache_flags: CacheFlags,
    no_retry: bool,
    bypass_private_dns: bool,
) -> Result<Message<Bytes>, QueryError> {
    if ctx.is_destroyed() {
        return Err(QueryError::NetworkGone);
    }

    let mode = if bypass_private_dns {
        PrivateDnsMode::Off
    } else {
        private_dns.mode(ctx.netid)
    };

    let key =
        CacheKey::new(question.qname(), question.qtype(), Class::IN);

    match ctx.cache.lookup(&key, cache_flags).await {
        CacheOutcome::Hit(answer) => Ok(answer),
        CacheOutcome::Shared(result) => result,
        CacheOutcome::Gone => Err(QueryError::NetworkGone),
        CacheOutcome::Stale(answer, lease) => {
            if let Some(lease) = lease {
                let ctx = ctx.clone();
                let private_dns = private_dns.clone();
                let events = events.clone();
                let question = question.clone();
                tokio::spawn(async move {
                    let plan = ctx.attempt_plan(mode);
                    let dispatcher = Dispatcher::new(
                        &plan,
                        &private_dns,
                        ctx.as_ref(),
                        &events,
                    );
                    let result = dispatcher.run(&question, false).await;
                    lease.complete(result).await;
                });
            }
            Ok(answer)
        }
        CacheOutcome::Miss(lease) => {
            let plan = ctx.attempt_plan(mode);
            let dispatcher =
                Dispatcher::new(&plan, private_dns, ctx.as_ref(), events);
            let result = dispatcher.run(question, no_retry).await;
            if let Some(lease) = lease {
                lease.complete(result.clone()).await;
            }
            result
        }
    }
}

/// Resolves a (name, type) pair on the Internet class.
///
/// Convenience wrapper used by the high-level lookups.
pub(crate) async fn resolve_question<C: Clock>(
    ctx: &Arc<ResolverContext<C>>,
    private_dns: &Arc<PrivateDns<C>>,
    events: &Arc<EventLog>,
    qname: &Name<Vec<u8>>,
    qtype: Rtype,
    bypass_private_dns: bool,
) -> Result<Message<Bytes>, QueryError> {
    let question = QuestionBytes::new(qname, qtype, Class::IN)?;
    resolve(
        ctx,
        private_dns,
        events,
        &question,
        CacheFlags::default(),
        false,
        bypass_private_dns,
    )
    .await
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn context() -> ResolverContext<MockClock> {
        ResolverContext::new(1, Arc::new(EventLog::new()), MockClock::new())
    }

    fn config_with(servers: &[&str]) -> ResolverConfig {
        ResolverConfig {
            netid: 1,
            servers: servers.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn stats_survive_unchanged_server_set() {
        let ctx = context();
        ctx.set_configuration(
            config_with(&["127.0.0.4:53"]),
            1,
            RuntimeFlags::default(),
        );
        ctx.report(
            1,
            "127.0.0.4:53".parse().unwrap(),
            SampleOutcome::Success,
            Some(Duration::from_millis(5)),
        );
        assert_eq!(ctx.stats_snapshot()[0].counts.successes, 1);

        // Same set, different order of arrival: preserved.
        ctx.set_configuration(
            config_with(&["127.0.0.4:53"]),
            2,
            RuntimeFlags::default(),
        );
        assert_eq!(ctx.stats_snapshot()[0].counts.successes, 1);

        // Different set: reset.
        ctx.set_configuration(
            config_with(&["127.0.0.5:53"]),
            3,
            RuntimeFlags::default(),
        );
        assert_eq!(ctx.stats_snapshot()[0].counts.total(), 0);
    }

    #[test]
    fn stale_revision_reports_dropped() {
        let ctx = context();
        ctx.set_configuration(
            config_with(&["127.0.0.4:53"]),
            5,
            RuntimeFlags::default(),
        );
        // Plan snapshotted under revision 1 reports after revision 5
        // took over.
        ctx.report(
            1,
            "127.0.0.4:53".parse().unwrap(),
            SampleOutcome::Timeout,
            None,
        );
        assert_eq!(ctx.stats_snapshot()[0].counts.total(), 0);
    }

    #[test]
    fn plan_snapshot_carries_revision() {
        let ctx = context();
        ctx.set_configuration(
            config_with(&["127.0.0.4:53", "127.0.0.5:53"]),
            9,
            RuntimeFlags::default(),
        );
        let plan = ctx.attempt_plan(PrivateDnsMode::Off);
        assert_eq!(plan.revision, 9);
        assert_eq!(plan.servers.len(), 2);
        assert!(!plan.cancelled.load(Ordering::Relaxed));

        ctx.destroy();
        assert!(plan.cancelled.load(Ordering::Relaxed));
    }
}
