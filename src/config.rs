//! Per-network resolver configuration.
//!
//! A network's configuration arrives as one atomic [`ResolverConfig`]
//! value. The registry sanitizes it (server de-duplication, search domain
//! pruning), derives the private-DNS mode, and installs it under a fresh
//! revision id.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use domain::base::name::Name;
use std::str::FromStr;

//------------ Limits and Defaults -------------------------------------------

/// Maximum number of cleartext servers retained per network.
pub const MAXNS: usize = 4;

/// Maximum number of search domains retained per network.
pub const MAXDNSRCH: usize = 6;

/// Maximum length of a search domain in octets.
pub const MAX_SEARCH_DOMAIN_LEN: usize = 255;

/// Default time a statistics sample stays valid.
const DEF_SAMPLE_VALIDITY: u32 = 1800;

/// Default success threshold in percent for a server to stay usable.
const DEF_SUCCESS_THRESHOLD: u32 = 75;

/// Default bounds of the per-server sample window.
const DEF_MIN_SAMPLES: u32 = 8;
const DEF_MAX_SAMPLES: u32 = 64;

/// Default per-server query deadline.
const DEF_BASE_TIMEOUT_MSEC: u32 = 5000;

/// Default number of passes across the server list.
const DEF_RETRY_COUNT: u32 = 2;

//------------ ResolverParams ------------------------------------------------

/// Tunable lookup parameters for one network.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolverParams {
    /// Seconds a statistics sample counts toward usability.
    pub sample_validity_sec: u32,

    /// Percentage of successful samples required for usability.
    pub success_threshold: u32,

    /// Below this many samples a server is always usable.
    pub min_samples: u32,

    /// Upper bound of the sample window.
    pub max_samples: u32,

    /// Per-server query deadline in milliseconds.
    pub base_timeout_msec: u32,

    /// Number of passes across the server list.
    pub retry_count: u32,
}

impl ResolverParams {
    /// Returns the per-server deadline as a [`Duration`].
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_msec as u64)
    }
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            sample_validity_sec: DEF_SAMPLE_VALIDITY,
            success_threshold: DEF_SUCCESS_THRESHOLD,
            min_samples: DEF_MIN_SAMPLES,
            max_samples: DEF_MAX_SAMPLES,
            base_timeout_msec: DEF_BASE_TIMEOUT_MSEC,
            retry_count: DEF_RETRY_COUNT,
        }
    }
}

//------------ TcMode --------------------------------------------------------

/// How a truncated UDP answer is handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TcMode {
    /// Retry the same server over TCP.
    #[default]
    UdpTcp,

    /// Try TCP on the same server, fall back to UDP on the next one if the
    /// TCP exchange fails.
    UdpTcpUdp,
}

//------------ ResolverOptions -----------------------------------------------

/// Behavioral options outside the numeric parameters.
#[derive(Clone, Debug, Default)]
pub struct ResolverOptions {
    /// Truncation handling.
    pub tc_mode: TcMode,

    /// Perform DNS under a privileged uid exempt from firewall rules
    /// instead of refusing for blocked callers.
    pub enforce_dns_uid: bool,

    /// Name to address entries that are authoritative when present: a name
    /// found here is never sent to the DNS.
    pub custom_hosts: Vec<(String, IpAddr)>,
}

//------------ TransportType -------------------------------------------------

/// The nature of the interfaces backing a network.
///
/// Used to decide whether `.local` names may take the multicast path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportType {
    Cellular,
    Wifi,
    Bluetooth,
    Ethernet,
    Vpn,
    WifiAware,
    Lowpan,
    Usb,
}

impl TransportType {
    /// Returns whether multicast DNS is permitted on this transport.
    ///
    /// Cellular and VPN transports never carry link-local multicast and
    /// take the unicast path instead.
    pub fn allows_mdns(self) -> bool {
        matches!(
            self,
            TransportType::Wifi
                | TransportType::Bluetooth
                | TransportType::Ethernet
                | TransportType::WifiAware
                | TransportType::Usb
        )
    }
}

//------------ PrivateDnsMode ------------------------------------------------

/// The private-DNS operating mode of a network.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PrivateDnsMode {
    /// Cleartext only.
    #[default]
    Off,

    /// Prefer encrypted transport, fall back to cleartext.
    Opportunistic,

    /// Never send cleartext.
    Strict,
}

impl PrivateDnsMode {
    /// Derives the mode from the configured encrypted servers and the
    /// optional pinned hostname.
    pub fn derive(dot_servers: &[SocketAddr], dot_name: Option<&str>) -> Self {
        if dot_servers.is_empty() {
            PrivateDnsMode::Off
        } else if dot_name.map_or(true, str::is_empty) {
            PrivateDnsMode::Opportunistic
        } else {
            PrivateDnsMode::Strict
        }
    }
}

//------------ AddrConfig ----------------------------------------------------

/// Address-family availability of the network's outbound interface.
///
/// The socket layer is external; embedders report the interface state here
/// and the orchestrator uses it to gate AAAA and A queries for callers
/// that request configured families only.
#[derive(Clone, Copy, Debug)]
pub struct AddrConfig {
    /// A usable IPv4 address exists.
    pub have_ipv4: bool,

    /// A usable global IPv6 address exists.
    pub have_ipv6_global: bool,

    /// Only a link-local IPv6 address exists.
    pub ipv6_link_local_only: bool,

    /// A default IPv6 route is installed.
    pub have_ipv6_default_route: bool,
}

impl AddrConfig {
    /// Returns whether AAAA queries can be answered usefully.
    ///
    /// A link-local address alone suffices only when no default route
    /// exists, so that queries which could not be delivered anywhere are
    /// not issued.
    pub fn usable_ipv6(&self) -> bool {
        if self.have_ipv6_global {
            return true;
        }
        self.ipv6_link_local_only && !self.have_ipv6_default_route
    }
}

impl Default for AddrConfig {
    fn default() -> Self {
        Self {
            have_ipv4: true,
            have_ipv6_global: true,
            ipv6_link_local_only: false,
            have_ipv6_default_route: true,
        }
    }
}

//------------ DohParams -----------------------------------------------------

/// Parameters for the delegated HTTPS transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DohParams {
    /// The server name used for the URI template and certificate check.
    pub name: String,

    /// Candidate server addresses.
    pub servers: Vec<SocketAddr>,
}

//------------ RuntimeFlags --------------------------------------------------

/// Runtime-tunable behavior flags.
///
/// Flags take effect the next time a network is configured; the attempt
/// plan snapshots them so an in-flight query never observes a change.
#[derive(Clone, Debug)]
pub struct RuntimeFlags {
    /// Order servers by score instead of insertion order.
    pub sort_nameservers: bool,

    /// Keep reading timed-out UDP sockets during later attempts.
    pub keep_listening_udp: bool,

    /// Delay before the second family query of a parallel pair.
    pub parallel_lookup_sleep_time_ms: u32,

    /// Overrides the configured retry count when non-zero.
    pub retry_count: u32,

    /// Overrides the configured per-server deadline when non-zero.
    pub retransmission_time_ms: u32,

    /// Maximum handshake attempts for an encrypted transport.
    pub dot_maxtries: u32,

    /// Handshake deadline per attempt in milliseconds.
    pub dot_connect_timeout_ms: u32,

    /// Query deadline over encrypted transport; negative means infinite.
    pub dot_query_timeout_ms: i32,

    /// Queries queue on a connecting transport and share one handshake.
    pub dot_async_handshake: bool,

    /// Consecutive timeouts before a transport is considered unusable.
    /// Zero disables the check.
    pub dot_xport_unusable_threshold: u32,

    /// Consecutive timeouts before a fresh validation is requested.
    /// Zero disables the check.
    pub dot_revalidation_threshold: u32,

    /// Skip remaining encrypted servers when the first is unresponsive
    /// (opportunistic mode only).
    pub dot_quick_fallback: bool,

    /// Multiplier of the measured UDP latency in the validation gate.
    /// Zero or negative disables the gate.
    pub dot_validation_latency_factor: i32,

    /// Constant addend of the validation latency gate in milliseconds.
    /// Zero or negative disables the gate.
    pub dot_validation_latency_offset_ms: i32,
}

impl RuntimeFlags {
    /// Returns the encrypted-transport query deadline, if finite.
    pub fn dot_query_timeout(&self) -> Option<Duration> {
        if self.dot_query_timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(self.dot_query_timeout_ms as u64))
        }
    }

    /// Returns whether the opportunistic latency gate is active.
    pub fn latency_gate_enabled(&self) -> bool {
        self.dot_validation_latency_factor > 0
            && self.dot_validation_latency_offset_ms > 0
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            sort_nameservers: false,
            keep_listening_udp: false,
            parallel_lookup_sleep_time_ms: 10,
            retry_count: 0,
            retransmission_time_ms: 0,
            dot_maxtries: 3,
            dot_connect_timeout_ms: 1000,
            dot_query_timeout_ms: -1,
            dot_async_handshake: false,
            dot_xport_unusable_threshold: 0,
            dot_revalidation_threshold: 0,
            dot_quick_fallback: false,
            dot_validation_latency_factor: 3,
            dot_validation_latency_offset_ms: 100,
        }
    }
}

//------------ ResolverConfig ------------------------------------------------

/// The complete configuration of one network, replaced atomically.
#[derive(Clone, Debug, Default)]
pub struct ResolverConfig {
    /// The network this configuration belongs to.
    pub netid: u32,

    /// Cleartext servers in preference order.
    pub servers: Vec<SocketAddr>,

    /// Encrypted servers in preference order.
    pub dot_servers: Vec<SocketAddr>,

    /// Pinned private-DNS hostname; presence selects strict mode.
    pub dot_name: Option<String>,

    /// Additional CA material in PEM form for the pinned hostname.
    pub ca_certificate_pem: Option<String>,

    /// Search domains applied to unqualified names.
    pub search_domains: Vec<String>,

    /// Numeric lookup parameters.
    pub params: ResolverParams,

    /// Behavioral options.
    pub options: ResolverOptions,

    /// Transport types of the backing interfaces.
    pub transport_types: Vec<TransportType>,

    /// Names of the backing interfaces.
    pub interface_names: Vec<String>,

    /// Address-family availability for family gating.
    pub addr_config: AddrConfig,

    /// Parameters for the delegated HTTPS transport.
    pub doh: Option<DohParams>,
}

impl ResolverConfig {
    /// Returns the private-DNS mode this configuration selects.
    pub fn private_dns_mode(&self) -> PrivateDnsMode {
        PrivateDnsMode::derive(&self.dot_servers, self.dot_name.as_deref())
    }
}

//------------ Sanitizers ----------------------------------------------------

/// De-duplicates servers preserving order and truncates to [`MAXNS`].
pub(crate) fn sanitize_servers(servers: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut out = Vec::with_capacity(servers.len().min(MAXNS));
    for server in servers {
        if out.contains(server) {
            continue;
        }
        out.push(*server);
        if out.len() == MAXNS {
            break;
        }
    }
    out
}

/// Returns whether a string is a plausible hostname.
///
/// The DNS itself is eight-bit clean but the lookup interfaces only
/// accept classic hostname characters; anything else is treated as
/// malformed input rather than sent upstream.
pub(crate) fn valid_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'
        })
}

/// Prunes the search domain list.
///
/// Drops duplicates, entries longer than 255 octets, and entries that do
/// not parse as domain names; keeps at most [`MAXDNSRCH`] entries.
pub(crate) fn sanitize_search_domains(domains: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for domain in domains {
        let trimmed = domain.trim().trim_end_matches('.');
        if trimmed.is_empty() || trimmed.len() > MAX_SEARCH_DOMAIN_LEN {
            continue;
        }
        if !valid_hostname(trimmed)
            || Name::<Vec<u8>>::from_str(trimmed).is_err()
        {
            continue;
        }
        let lowered = trimmed.to_ascii_lowercase();
        if out.contains(&lowered) {
            continue;
        }
        out.push(lowered);
        if out.len() == MAXDNSRCH {
            break;
        }
    }
    out
}

//============ Tests =========================================================
