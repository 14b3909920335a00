//! The private-DNS subsystem.
//!
//! Every encrypted server is identified by its socket address together
//! with the pinned provider hostname; two servers at the same address
//! with different hostnames validate independently. A configuration
//! change moves affected servers through `Unknown -> InProcess` and a
//! background task performs the TLS handshake plus one probe query.
//! Failures are retried on an exponential backoff from one minute to one
//! hour. In opportunistic mode a UDP latency probe may additionally gate
//! validation so that a paranoid but very distant server does not win
//! over the local cleartext path.
//!
//! Transports are retained for at least five minutes after last use,
//! even across reconfiguration, so a transient network change does not
//! restart validation. A transport dies only with its network or when
//! its identity has left the configuration and the retention ran out.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::name::Name;
use domain::base::{Message, MessageBuilder};
use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, ServerName};

use crate::clock::{Clock, Elapsed, SystemClock};
use crate::config::{PrivateDnsMode, ResolverConfig, RuntimeFlags};
use crate::error::QueryError;
use crate::events::{Event, EventLog};
use crate::transport::dgram;
use crate::transport::protocol::{
    opportunistic_tls_config, tls_server_name, verifying_tls_config,
    AsyncConnect, TlsConnect, UdpConnect,
};
use crate::transport::stream;

/// The question asked over a fresh session to prove it works.
const PROBE_QNAME: &str = "dnsotls-ds.metric.gstatic.com.";

/// Deadline for the probe query itself.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the UDP latency probe waits before retrying once.
const UDP_PROBE_GAP: Duration = Duration::from_secs(3);

/// Initial and maximum validation retry delays.
const BACKOFF_INITIAL: Duration = Duration::from_secs(60);
const BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Minimum time an idle transport survives after last use.
const TRANSPORT_RETENTION: Duration = Duration::from_secs(300);

/// Reaper wake-up interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

//------------ Validation ----------------------------------------------------

/// The validation state of one encrypted server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validation {
    /// Never probed under the current epoch.
    Unknown,

    /// A validation task is running.
    InProcess,

    /// The server answered a probe over TLS.
    Success,

    /// The last probe failed; a retry is scheduled.
    Fail,
}

//------------ ServerIdentity ------------------------------------------------

/// What makes an encrypted server unique.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServerIdentity {
    /// The server's socket address.
    pub addr: SocketAddr,

    /// The pinned provider hostname, if any.
    pub provider: Option<String>,
}

impl ServerIdentity {
    /// Creates an identity.
    pub fn new(addr: SocketAddr, provider: Option<&str>) -> Self {
        Self {
            addr,
            provider: provider
                .filter(|p| !p.is_empty())
                .map(str::to_owned),
        }
    }
}

//------------ DohDispatcher -------------------------------------------------

/// The seam to a delegated DNS-over-HTTPS implementation.
///
/// Only the dispatcher-facing surface is defined here; handshake and
/// session management live behind it.
pub trait DohDispatcher: Send + Sync {
    /// Starts a probe towards the given server.
    fn probe(&self, netid: u32, server: SocketAddr, name: &str);

    /// Sends one wire-format query and returns the raw reply.
    fn query(
        &self,
        netid: u32,
        msg: Vec<u8>,
        deadline: Duration,
    ) -> Pin<
        Box<dyn Future<Output = Result<Vec<u8>, QueryError>> + Send + '_>,
    >;

    /// Drops all state of a network.
    fn clear(&self, netid: u32);
}

//------------ PrivateDns ----------------------------------------------------

/// Validation lifecycle and transport pool for all networks.
pub(crate) struct PrivateDns<C: Clock = SystemClock> {
    /// Handle to ourselves for background tasks.
    weak: Weak<PrivateDns<C>>,

    /// Per-network state.
    inner: Mutex<HashMap<u32, NetState<C>>>,

    /// Event sink.
    events: Arc<EventLog>,

    /// Time source.
    clock: C,

    /// Injectable backoff bounds.
    backoff: Mutex<(Duration, Duration)>,

    /// Whether the reaper task has been started.
    reaper_started: Mutex<bool>,

    /// The delegated HTTPS implementation, if any.
    doh: Mutex<Option<Arc<dyn DohDispatcher>>>,
}

/// Private-DNS state of one network.
struct NetState<C: Clock> {
    /// The operating mode.
    mode: PrivateDnsMode,

    /// Bumped whenever the mode changes; stale validation results are
    /// discarded by comparing epochs.
    epoch: u64,

    /// Flag snapshot taken at configuration time.
    flags: RuntimeFlags,

    /// Every server seen recently, active or not.
    servers: HashMap<ServerIdentity, DotServer<C>>,

    /// Identity order from the configuration, for quick fallback.
    order: Vec<ServerIdentity>,
}

/// One tracked encrypted server.
struct DotServer<C: Clock> {
    /// Current validation state.
    state: Validation,

    /// When the state last changed.
    state_changed: C::Instant,

    /// Still part of the current configuration.
    active: bool,

    /// Delay before the next validation retry.
    next_backoff: Duration,

    /// Live connection state shared with in-flight queries.
    shared: Arc<ServerShared>,

    /// When a query last used the transport.
    last_used: Option<C::Instant>,
}

/// Connection state usable without the subsystem lock.
struct ServerShared {
    /// The TLS connector for this server.
    connector: TlsConnect,

    /// The established connection, if any. The async mutex serializes
    /// handshakes: queries arriving during one queue here and observe
    /// its outcome collectively.
    conn: tokio::sync::Mutex<Option<stream::Connection>>,

    /// Consecutive query timeouts on this transport.
    consecutive_timeouts: AtomicU32,
}

impl<C: Clock> PrivateDns<C> {
    /// Creates the subsystem.
    pub fn new(events: Arc<EventLog>, clock: C) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            inner: Mutex::new(HashMap::new()),
            events,
            clock,
            backoff: Mutex::new((BACKOFF_INITIAL, BACKOFF_MAX)),
            reaper_started: Mutex::new(false),
            doh: Mutex::new(None),
        })
    }

    /// Replaces the backoff bounds. For testing.
    pub fn set_backoff_for_testing(&self, initial: Duration, max: Duration) {
        *self.backoff.lock() = (initial, max);
    }

    /// Installs the delegated HTTPS implementation.
    pub fn set_doh_dispatcher(&self, doh: Arc<dyn DohDispatcher>) {
        *self.doh.lock() = Some(doh);
    }

    /// Applies a new network configuration.
    ///
    /// Servers already tracked keep their validation state unless the
    /// mode changed; new servers start validation. Servers that left the
    /// configuration are marked inactive and linger until the reaper
    /// retires them, so a flapping configuration does not churn
    /// validations.
    pub fn configure(&self, cfg: &ResolverConfig, flags: &RuntimeFlags) {
        self.ensure_reaper();

        let mode = cfg.private_dns_mode();
        let provider = cfg.dot_name.as_deref();
        let tls_config: Arc<ClientConfig> = if provider.is_some() {
            match verifying_tls_config(cfg.ca_certificate_pem.as_deref()) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(%err, "bad CA material, dropping private DNS");
                    self.clear(cfg.netid);
                    return;
                }
            }
        } else {
            opportunistic_tls_config()
        };

        let initial_backoff = self.backoff.lock().0;
        let mut to_validate = Vec::new();
        {
            let mut inner = self.inner.lock();
            let net = inner.entry(cfg.netid).or_insert_with(|| NetState {
                mode,
                epoch: 0,
                flags: flags.clone(),
                servers: HashMap::new(),
                order: Vec::new(),
            });

            let mode_changed = net.mode != mode;
            net.mode = mode;
            net.flags = flags.clone();
            if mode_changed {
                net.epoch += 1;
            }

            let identities: Vec<ServerIdentity> = cfg
                .dot_servers
                .iter()
                .map(|addr| ServerIdentity::new(*addr, provider))
                .collect();
            net.order = identities.clone();

            for (identity, server) in net.servers.iter_mut() {
                server.active = identities.contains(identity);
                if mode_changed {
                    server.state = Validation::Unknown;
                    server.state_changed = self.clock.now();
                    server.next_backoff = initial_backoff;
                }
            }

            for identity in identities {
                let server = net
                    .servers
                    .entry(identity.clone())
                    .or_insert_with(|| DotServer {
                        state: Validation::Unknown,
                        state_changed: self.clock.now(),
                        active: true,
                        next_backoff: initial_backoff,
                        shared: Arc::new(ServerShared {
                            connector: TlsConnect::new(
                                tls_config.clone(),
                                server_name(&identity),
                                identity.addr,
                            ),
                            conn: tokio::sync::Mutex::new(None),
                            consecutive_timeouts: AtomicU32::new(0),
                        }),
                        last_used: None,
                    });
                server.active = true;
                if mode != PrivateDnsMode::Off
                    && server.state == Validation::Unknown
                {
                    server.state = Validation::InProcess;
                    server.state_changed = self.clock.now();
                    to_validate.push((identity, net.epoch));
                }
            }
        }

        for (identity, epoch) in to_validate {
            self.spawn_validation(cfg.netid, identity, epoch);
        }

        if let (Some(doh), Some(params)) =
            (self.doh.lock().clone(), cfg.doh.as_ref())
        {
            for server in &params.servers {
                doh.probe(cfg.netid, *server, &params.name);
            }
        }
    }

    /// Drops all state of a network.
    pub fn clear(&self, netid: u32) {
        self.inner.lock().remove(&netid);
        if let Some(doh) = self.doh.lock().clone() {
            doh.clear(netid);
        }
    }

    /// The mode a network currently runs in.
    pub fn mode(&self, netid: u32) -> PrivateDnsMode {
        self.inner
            .lock()
            .get(&netid)
            .map(|net| net.mode)
            .unwrap_or(PrivateDnsMode::Off)
    }

    /// Validated and currently usable servers, in configuration order.
    pub fn usable_servers(&self, netid: u32) -> Vec<ServerIdentity> {
        let inner = self.inner.lock();
        let Some(net) = inner.get(&netid) else {
            return Vec::new();
        };
        net.order
            .iter()
            .filter(|identity| {
                net.servers.get(identity).is_some_and(|server| {
                    server.active
                        && server.state == Validation::Success
                        && !unusable(net, server)
                })
            })
            .cloned()
            .collect()
    }

    /// The tracked servers of a network with their validation states,
    /// active ones first in configuration order.
    pub fn status(
        &self,
        netid: u32,
    ) -> Vec<(ServerIdentity, Validation)> {
        let inner = self.inner.lock();
        let Some(net) = inner.get(&netid) else {
            return Vec::new();
        };
        let mut out: Vec<(ServerIdentity, Validation)> = net
            .order
            .iter()
            .filter_map(|identity| {
                net.servers
                    .get(identity)
                    .map(|server| (identity.clone(), server.state))
            })
            .collect();
        for (identity, server) in &net.servers {
            if !server.active {
                out.push((identity.clone(), server.state));
            }
        }
        out
    }

    /// Whether quick fallback applies: opportunistic mode, the flag set,
    /// and the first configured server failing its handshakes.
    pub fn quick_fallback_applies(&self, netid: u32) -> bool {
        let inner = self.inner.lock();
        let Some(net) = inner.get(&netid) else {
            return false;
        };
        if !net.flags.dot_quick_fallback
            || net.mode != PrivateDnsMode::Opportunistic
        {
            return false;
        }
        match net.order.first().and_then(|id| net.servers.get(id)) {
            Some(server) => server.state == Validation::Fail,
            None => false,
        }
    }

    /// Sends one query over the encrypted transport of `identity`.
    pub async fn query(
        &self,
        netid: u32,
        identity: &ServerIdentity,
        payload: Vec<u8>,
        caller_id: u16,
    ) -> Result<Message<Bytes>, QueryError> {
        let (shared, flags) = {
            let mut inner = self.inner.lock();
            let net = inner
                .get_mut(&netid)
                .ok_or(QueryError::NetworkGone)?;
            let flags = net.flags.clone();
            let server = net
                .servers
                .get_mut(identity)
                .ok_or(QueryError::NoValidatedServers)?;
            server.last_used = Some(self.clock.now());
            (server.shared.clone(), flags)
        };

        let conn = match ensure_connection(&shared, &flags).await {
            Ok(conn) => conn,
            Err(err) => {
                self.note_failure(&shared, netid, identity);
                return Err(err);
            }
        };

        let result = conn
            .request(payload, caller_id, flags.dot_query_timeout())
            .await;

        match &result {
            Ok(_) => {
                shared.consecutive_timeouts.store(0, Ordering::Relaxed);
            }
            Err(QueryError::Timeout) => {
                self.note_failure(&shared, netid, identity);
            }
            Err(_) => {
                // The connection broke; drop it so the next query
                // reconnects.
                *shared.conn.lock().await = None;
                self.note_failure(&shared, netid, identity);
            }
        }
        result
    }

    /// Requests a fresh validation, e.g. after repeated query timeouts.
    ///
    /// Revalidation runs regardless of the backoff schedule.
    pub fn request_validation(&self, netid: u32, identity: &ServerIdentity) {
        let epoch = {
            let mut inner = self.inner.lock();
            let Some(net) = inner.get_mut(&netid) else {
                return;
            };
            let Some(server) = net.servers.get_mut(identity) else {
                return;
            };
            if server.state == Validation::InProcess {
                return;
            }
            server.state = Validation::InProcess;
            server.state_changed = self.clock.now();
            net.epoch
        };
        self.spawn_validation(netid, identity.clone(), epoch);
    }

    /// Renders the subsystem state of one network into the dump.
    pub fn dump(&self, netid: u32, target: &mut String) {
        use std::fmt::Write;

        let inner = self.inner.lock();
        let Some(net) = inner.get(&netid) else {
            return;
        };
        let _ = writeln!(target, "  private DNS mode: {:?}", net.mode);
        for (identity, server) in &net.servers {
            let _ = writeln!(
                target,
                "  dot {}{} {:?}{} since {}s ago{}",
                identity.addr,
                identity
                    .provider
                    .as_deref()
                    .map(|p| format!(" ({})", p))
                    .unwrap_or_default(),
                server.state,
                if server.active { "" } else { " [inactive]" },
                server.state_changed.elapsed().as_secs(),
                server
                    .last_used
                    .as_ref()
                    .map(|at| format!(", used {}s ago", at.elapsed().as_secs()))
                    .unwrap_or_default(),
            );
        }
    }

    /// Counts a failed query and triggers revalidation at the threshold.
    fn note_failure(
        &self,
        shared: &ServerShared,
        netid: u32,
        identity: &ServerIdentity,
    ) {
        let timeouts =
            shared.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        let wants_revalidation = {
            let inner = self.inner.lock();
            inner.get(&netid).is_some_and(|net| {
                net.flags.dot_revalidation_threshold > 0
                    && timeouts == net.flags.dot_revalidation_threshold
            })
        };
        if wants_revalidation {
            self.request_validation(netid, identity);
        }
    }

    /// Records a validation outcome. Returns false if it was stale.
    fn record_validation(
        &self,
        netid: u32,
        identity: &ServerIdentity,
        epoch: u64,
        success: bool,
    ) -> bool {
        let backoff_max = self.backoff.lock().1;
        let initial_backoff = self.backoff.lock().0;
        let retry_in = {
            let mut inner = self.inner.lock();
            let Some(net) = inner.get_mut(&netid) else {
                return false;
            };
            if net.epoch != epoch {
                return false;
            }
            let Some(server) = net.servers.get_mut(identity) else {
                return false;
            };
            server.state = if success {
                Validation::Success
            } else {
                Validation::Fail
            };
            server.state_changed = self.clock.now();
            if success {
                server.next_backoff = initial_backoff;
                None
            } else if server.active {
                let delay = server.next_backoff;
                server.next_backoff =
                    (server.next_backoff * 2).min(backoff_max);
                Some(delay)
            } else {
                None
            }
        };

        self.events.publish(Event::Validation {
            netid,
            server: identity.addr,
            provider: identity.provider.clone(),
            state: if success {
                Validation::Success
            } else {
                Validation::Fail
            },
        });

        if let Some(delay) = retry_in {
            let weak = self.weak.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(this) = weak.upgrade() {
                    this.retry_validation(netid, identity, epoch);
                }
            });
        }
        true
    }

    /// Retries a failed validation if the world has not moved on.
    fn retry_validation(
        &self,
        netid: u32,
        identity: ServerIdentity,
        epoch: u64,
    ) {
        {
            let mut inner = self.inner.lock();
            let Some(net) = inner.get_mut(&netid) else {
                return;
            };
            if net.epoch != epoch {
                return;
            }
            let Some(server) = net.servers.get_mut(&identity) else {
                return;
            };
            if !server.active || server.state != Validation::Fail {
                return;
            }
            server.state = Validation::InProcess;
            server.state_changed = self.clock.now();
        }
        self.spawn_validation(netid, identity, epoch);
    }

    /// Spawns the background validation task.
    fn spawn_validation(
        &self,
        netid: u32,
        identity: ServerIdentity,
        epoch: u64,
    ) {
        let (shared, flags, mode) = {
            let inner = self.inner.lock();
            let Some(net) = inner.get(&netid) else {
                return;
            };
            let Some(server) = net.servers.get(&identity) else {
                return;
            };
            (server.shared.clone(), net.flags.clone(), net.mode)
        };
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tracing::debug!(
                netid,
                server = %identity.addr,
                "starting private DNS validation"
            );
            let success = validate_once(&shared, &flags, mode).await;
            if let Some(this) = weak.upgrade() {
                this.record_validation(netid, &identity, epoch, success);
            }
        });
    }

    /// Starts the transport reaper once.
    fn ensure_reaper(&self) {
        let mut started = self.reaper_started.lock();
        if *started {
            return;
        }
        *started = true;
        let weak = self.weak.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_INTERVAL).await;
                let Some(this) = weak.upgrade() else { break };
                this.reap();
            }
        });
    }

    /// Retires idle transports and forgets retired inactive servers.
    fn reap(&self) {
        let mut inner = self.inner.lock();
        for net in inner.values_mut() {
            net.servers.retain(|identity, server| {
                let idle_long_enough = match &server.last_used {
                    Some(at) => at.elapsed() > TRANSPORT_RETENTION,
                    None => {
                        server.state_changed.elapsed() > TRANSPORT_RETENTION
                    }
                };
                if !server.active && idle_long_enough {
                    tracing::debug!(
                        server = %identity.addr,
                        "retiring idle private DNS server"
                    );
                    return false;
                }
                if idle_long_enough {
                    // Keep the server but drop the idle connection.
                    if let Ok(mut guard) = server.shared.conn.try_lock() {
                        *guard = None;
                    }
                }
                true
            });
        }
    }
}

/// Whether the unusable threshold currently sidelines a server.
fn unusable<C: Clock>(net: &NetState<C>, server: &DotServer<C>) -> bool {
    let threshold = net.flags.dot_xport_unusable_threshold;
    threshold > 0
        && server.shared.consecutive_timeouts.load(Ordering::Relaxed)
            >= threshold
}

//------------ Connection establishment --------------------------------------

/// Returns the live connection, establishing one if needed.
///
/// The per-server async mutex makes queries arriving during a handshake
/// wait for its outcome instead of dialing their own.
async fn ensure_connection(
    shared: &ServerShared,
    flags: &RuntimeFlags,
) -> Result<stream::Connection, QueryError> {
    let mut guard = shared.conn.lock().await;
    if let Some(conn) = guard.as_ref() {
        return Ok(conn.clone());
    }
    let tries = if flags.dot_async_handshake {
        flags.dot_maxtries.max(1)
    } else {
        1
    };
    let connect_timeout =
        Duration::from_millis(flags.dot_connect_timeout_ms as u64);
    let mut last_err = QueryError::Timeout;
    for _ in 0..tries {
        match timeout(connect_timeout, shared.connector.connect()).await {
            Ok(Ok(tls)) => {
                let (conn, driver) = stream::Connection::new(tls);
                tokio::spawn(driver.run());
                *guard = Some(conn.clone());
                return Ok(conn);
            }
            Ok(Err(err)) => last_err = err.into(),
            Err(_) => last_err = QueryError::Timeout,
        }
    }
    Err(last_err)
}

//------------ Validation probe ----------------------------------------------

/// Runs one complete validation attempt.
async fn validate_once(
    shared: &ServerShared,
    flags: &RuntimeFlags,
    mode: PrivateDnsMode,
) -> bool {
    // The latency gate only applies when we could fall back to Do53.
    let udp_latency = if mode == PrivateDnsMode::Opportunistic
        && flags.latency_gate_enabled()
    {
        udp_probe_latency(shared.connector.addr()).await
    } else {
        None
    };

    let connect_timeout =
        Duration::from_millis(flags.dot_connect_timeout_ms as u64);
    let handshake_started = tokio::time::Instant::now();
    let tls = match timeout(
        connect_timeout.max(Duration::from_secs(1)),
        shared.connector.connect(),
    )
    .await
    {
        Ok(Ok(tls)) => tls,
        _ => return false,
    };
    let handshake_time = handshake_started.elapsed();

    let (conn, driver) = stream::Connection::new(tls);
    tokio::spawn(driver.run());
    let probe = compose_probe();
    let probe_id = probe.header().id();
    let answered = conn
        .request(probe.as_slice().to_vec(), probe_id, Some(PROBE_TIMEOUT))
        .await
        .is_ok();
    if !answered {
        return false;
    }

    if let Some(udp_latency) = udp_latency {
        let factor = flags.dot_validation_latency_factor as u32;
        let offset = Duration::from_millis(
            flags.dot_validation_latency_offset_ms as u64,
        );
        let bound = udp_latency * factor + offset;
        if handshake_time > bound {
            tracing::info!(
                ?handshake_time,
                ?bound,
                "handshake too slow relative to cleartext, failing validation"
            );
            return false;
        }
    }
    true
}

/// Measures the UDP round-trip to the server, retrying once.
async fn udp_probe_latency(addr: SocketAddr) -> Option<Duration> {
    let mut addr = addr;
    addr.set_port(53);
    let probe = compose_probe();
    for _ in 0..2 {
        let started = tokio::time::Instant::now();
        match dgram::exchange(
            UdpConnect::new(addr),
            probe.as_slice(),
            probe.header().id(),
            UDP_PROBE_GAP,
        )
        .await
        {
            Ok(_) => return Some(started.elapsed()),
            Err(_) => continue,
        }
    }
    None
}

/// Builds the probe question.
fn compose_probe() -> Message<Vec<u8>> {
    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_random_id();
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder
        .push((
            Name::<Vec<u8>>::from_str(PROBE_QNAME)
                .expect("probe name is well-formed"),
            Rtype::A,
        ))
        .expect("probe question fits");
    builder.into_message()
}

/// The server name presented in the handshake.
fn server_name(identity: &ServerIdentity) -> ServerName {
    tls_server_name(identity.addr, identity.provider.as_deref())
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn subsystem() -> Arc<PrivateDns<MockClock>> {
        PrivateDns::new(Arc::new(EventLog::new()), MockClock::new())
    }

    fn config(netid: u32, dot: &[&str], name: Option<&str>) -> ResolverConfig {
        ResolverConfig {
            netid,
            dot_servers: dot.iter().map(|s| s.parse().unwrap()).collect(),
            dot_name: name.map(str::to_owned),
            ..Default::default()
        }
    }

    fn flags() -> RuntimeFlags {
        RuntimeFlags::default()
    }

    #[test]
    fn identities_distinguish_providers() {
        let addr: SocketAddr = "1.1.1.1:853".parse().unwrap();
        let a = ServerIdentity::new(addr, Some("one.one.one.one"));
        let b = ServerIdentity::new(addr, Some("cloudflare-dns.com"));
        let c = ServerIdentity::new(addr, None);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(ServerIdentity::new(addr, Some("")), c);
    }

    #[tokio::test]
    async fn configure_starts_validation() {
        let dns = subsystem();
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());
        assert_eq!(dns.mode(7), PrivateDnsMode::Opportunistic);

        let inner = dns.inner.lock();
        let net = inner.get(&7).unwrap();
        let identity =
            ServerIdentity::new("127.0.0.1:853".parse().unwrap(), None);
        assert_eq!(
            net.servers.get(&identity).unwrap().state,
            Validation::InProcess
        );
    }

    #[tokio::test]
    async fn identical_reconfiguration_is_a_noop_for_validation() {
        let dns = subsystem();
        let cfg = config(7, &["127.0.0.1:853"], None);
        dns.configure(&cfg, &flags());
        let identity =
            ServerIdentity::new("127.0.0.1:853".parse().unwrap(), None);

        // Force a terminal state, then reconfigure identically.
        {
            let mut inner = dns.inner.lock();
            let server = inner
                .get_mut(&7)
                .unwrap()
                .servers
                .get_mut(&identity)
                .unwrap();
            server.state = Validation::Success;
        }
        dns.configure(&cfg, &flags());
        let inner = dns.inner.lock();
        assert_eq!(
            inner.get(&7).unwrap().servers[&identity].state,
            Validation::Success
        );
    }

    #[tokio::test]
    async fn mode_switch_restarts_validation() {
        let dns = subsystem();
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());
        let epoch_before = dns.inner.lock().get(&7).unwrap().epoch;

        {
            let mut inner = dns.inner.lock();
            for server in inner.get_mut(&7).unwrap().servers.values_mut() {
                server.state = Validation::Success;
            }
        }
        dns.configure(
            &config(7, &["127.0.0.1:853"], Some("dns.example")),
            &flags(),
        );
        let inner = dns.inner.lock();
        let net = inner.get(&7).unwrap();
        assert!(net.epoch > epoch_before);
        assert_eq!(net.mode, PrivateDnsMode::Strict);
        // The old no-provider identity is inactive now, the pinned one
        // validates fresh.
        let pinned = ServerIdentity::new(
            "127.0.0.1:853".parse().unwrap(),
            Some("dns.example"),
        );
        assert_eq!(net.servers[&pinned].state, Validation::InProcess);
    }

    #[tokio::test]
    async fn removed_server_lingers_inactive() {
        let dns = subsystem();
        dns.configure(
            &config(7, &["127.0.0.1:853", "127.0.0.2:853"], None),
            &flags(),
        );
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());

        let inner = dns.inner.lock();
        let net = inner.get(&7).unwrap();
        let gone =
            ServerIdentity::new("127.0.0.2:853".parse().unwrap(), None);
        assert!(!net.servers[&gone].active);
        assert_eq!(net.order.len(), 1);
    }

    #[tokio::test]
    async fn stale_epoch_validation_discarded() {
        let dns = subsystem();
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());
        let identity =
            ServerIdentity::new("127.0.0.1:853".parse().unwrap(), None);
        let old_epoch = dns.inner.lock().get(&7).unwrap().epoch;

        // Mode switch bumps the epoch.
        dns.configure(
            &config(7, &["127.0.0.1:853"], Some("dns.example")),
            &flags(),
        );
        assert!(!dns.record_validation(7, &identity, old_epoch, true));
    }

    #[tokio::test]
    async fn backoff_doubles_to_cap() {
        let dns = subsystem();
        dns.set_backoff_for_testing(
            Duration::from_secs(60),
            Duration::from_secs(200),
        );
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());
        let identity =
            ServerIdentity::new("127.0.0.1:853".parse().unwrap(), None);
        let epoch = dns.inner.lock().get(&7).unwrap().epoch;

        for expected in [120u64, 200, 200] {
            assert!(dns.record_validation(7, &identity, epoch, false));
            let inner = dns.inner.lock();
            assert_eq!(
                inner.get(&7).unwrap().servers[&identity].next_backoff,
                Duration::from_secs(expected)
            );
        }
    }

    #[tokio::test]
    async fn validated_server_is_usable() {
        let dns = subsystem();
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());
        let identity =
            ServerIdentity::new("127.0.0.1:853".parse().unwrap(), None);
        assert!(dns.usable_servers(7).is_empty());

        let epoch = dns.inner.lock().get(&7).unwrap().epoch;
        assert!(dns.record_validation(7, &identity, epoch, true));
        assert_eq!(dns.usable_servers(7), vec![identity]);
    }

    #[tokio::test]
    async fn reaper_retires_inactive_idle_servers() {
        let clock = MockClock::new();
        let dns =
            PrivateDns::new(Arc::new(EventLog::new()), clock.clone());
        dns.configure(
            &config(7, &["127.0.0.1:853", "127.0.0.2:853"], None),
            &flags(),
        );
        dns.configure(&config(7, &["127.0.0.1:853"], None), &flags());

        // Within retention nothing is retired.
        dns.reap();
        assert_eq!(dns.inner.lock().get(&7).unwrap().servers.len(), 2);

        clock.advance(TRANSPORT_RETENTION + Duration::from_secs(1));
        dns.reap();
        let inner = dns.inner.lock();
        let net = inner.get(&7).unwrap();
        assert_eq!(net.servers.len(), 1);
        assert!(net.servers.contains_key(&ServerIdentity::new(
            "127.0.0.1:853".parse().unwrap(),
            None
        )));
    }
}
