//! NAT64 prefix handling and DNS64 address synthesis.
//!
//! A network either has a statically installed /96 prefix or runs
//! discovery, never both. Discovery periodically asks for the AAAA
//! records of `ipv4only.arpa.` and derives the prefix from answers whose
//! low 32 bits hold one of the two well-known IPv4 literals. Synthesis
//! maps an IPv4 address `a` to `prefix || a`; reverse lookups for
//! addresses under the prefix are un-synthesized back to IPv4 before the
//! `in-addr.arpa.` query is built.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use domain::base::iana::Rtype;
use domain::base::name::Name;
use domain::base::Message;
use octseq::Octets;
use parking_lot::Mutex;

use crate::error::ConfigError;
use crate::events::{Event, EventLog};

/// The name whose AAAA records reveal the NAT64 prefix.
pub const IPV4ONLY_ARPA: &str = "ipv4only.arpa.";

/// The well-known addresses of `ipv4only.arpa.`.
const WELL_KNOWN_V4: [Ipv4Addr; 2] =
    [Ipv4Addr::new(192, 0, 0, 170), Ipv4Addr::new(192, 0, 0, 171)];

//------------ Prefix64 ------------------------------------------------------

/// A /96 NAT64 prefix.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Prefix64 {
    /// The upper 96 bits.
    bits: [u8; 12],
}

impl Prefix64 {
    /// Creates a prefix from the upper 96 bits of an IPv6 address.
    ///
    /// Fails if anything is set in the lower 32 bits, since that cannot
    /// be a /96.
    pub fn new(addr: Ipv6Addr) -> Result<Self, ConfigError> {
        let octets = addr.octets();
        if octets[12..] != [0; 4] {
            return Err(ConfigError::Invalid("prefix"));
        }
        let mut bits = [0u8; 12];
        bits.copy_from_slice(&octets[..12]);
        Ok(Self { bits })
    }

    /// Extracts the prefix of a synthesized address.
    fn of(addr: Ipv6Addr) -> Self {
        let mut bits = [0u8; 12];
        bits.copy_from_slice(&addr.octets()[..12]);
        Self { bits }
    }

    /// Synthesizes an IPv6 address for an IPv4 one.
    pub fn synthesize(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[..12].copy_from_slice(&self.bits);
        octets[12..].copy_from_slice(&addr.octets());
        Ipv6Addr::from(octets)
    }

    /// Recovers the IPv4 address from a synthesized IPv6 address.
    ///
    /// Returns `None` if the address does not lie under this prefix.
    pub fn extract(&self, addr: Ipv6Addr) -> Option<Ipv4Addr> {
        if Prefix64::of(addr) != *self {
            return None;
        }
        let octets = addr.octets();
        Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ))
    }
}

impl fmt::Display for Prefix64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/96", self.synthesize(Ipv4Addr::UNSPECIFIED))
    }
}

impl FromStr for Prefix64 {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = match s.split_once('/') {
            Some((addr, "96")) => addr,
            Some(_) => return Err(ConfigError::Invalid("prefix length")),
            None => s,
        };
        let addr = Ipv6Addr::from_str(addr)
            .map_err(|_| ConfigError::Invalid("prefix"))?;
        Self::new(addr)
    }
}

//------------ Synthesis policy ----------------------------------------------

/// Returns whether an IPv4 address may be synthesized.
///
/// Unspecified, loopback, link-local, multicast and broadcast addresses
/// never make sense behind a NAT64.
pub fn may_synthesize(addr: Ipv4Addr) -> bool {
    !(addr.octets()[0] == 0
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast())
}

/// Derives the prefix from an `ipv4only.arpa.` AAAA answer.
///
/// Only answers whose low 32 bits equal one of the well-known literals
/// count.
pub fn prefix_from_answer<Octs: Octets>(
    msg: &Message<Octs>,
) -> Option<Prefix64> {
    let answer = msg.answer().ok()?;
    for record in answer.limit_to::<domain::rdata::Aaaa>().flatten() {
        let addr = record.data().addr();
        let prefix = Prefix64::of(addr);
        for well_known in WELL_KNOWN_V4 {
            if prefix.extract(addr) == Some(well_known) {
                return Some(prefix);
            }
        }
    }
    None
}

/// Builds the reverse name for an IPv4 address.
pub fn reverse_v4_name(addr: Ipv4Addr) -> Name<Vec<u8>> {
    let o = addr.octets();
    Name::from_str(&format!(
        "{}.{}.{}.{}.in-addr.arpa.",
        o[3], o[2], o[1], o[0]
    ))
    .expect("reverse name is always well-formed")
}

/// Builds the reverse name for an IPv6 address.
pub fn reverse_v6_name(addr: Ipv6Addr) -> Name<Vec<u8>> {
    let mut out = String::with_capacity(72);
    for octet in addr.octets().iter().rev() {
        out.push_str(&format!(
            "{:x}.{:x}.",
            octet & 0x0f,
            octet >> 4
        ));
    }
    out.push_str("ip6.arpa.");
    Name::from_str(&out).expect("reverse name is always well-formed")
}

/// The question type discovery uses.
pub const DISCOVERY_RTYPE: Rtype = Rtype::AAAA;

//------------ Dns64State ----------------------------------------------------

/// The NAT64 prefix state of one network.
pub(crate) struct Dns64State {
    /// The owning network, for events.
    netid: u32,

    /// The event sink.
    events: Arc<EventLog>,

    /// The actual state.
    state: Mutex<State>,
}

/// The mutually exclusive prefix modes.
#[derive(Clone, Copy, Debug)]
enum State {
    /// No prefix and no discovery.
    Empty,

    /// An operator-installed prefix.
    Static(Prefix64),

    /// Discovery is running; it may or may not have found a prefix yet.
    Discovery {
        /// The discovered prefix, if any.
        found: Option<Prefix64>,

        /// Bumped on every start so a superseded discovery task cannot
        /// publish.
        generation: u64,
    },
}

impl Dns64State {
    /// Creates an empty state.
    pub fn new(netid: u32, events: Arc<EventLog>) -> Self {
        Self {
            netid,
            events,
            state: Mutex::new(State::Empty),
        }
    }

    /// The active prefix, static or discovered.
    pub fn prefix(&self) -> Option<Prefix64> {
        match *self.state.lock() {
            State::Empty => None,
            State::Static(prefix) => Some(prefix),
            State::Discovery { found, .. } => found,
        }
    }

    /// Installs or clears a static prefix.
    pub fn set_prefix(
        &self,
        prefix: Option<Prefix64>,
    ) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        match (prefix, *state) {
            (Some(_), State::Discovery { .. }) => Err(ConfigError::Exists),
            (Some(prefix), _) => {
                *state = State::Static(prefix);
                self.publish(Some(prefix));
                Ok(())
            }
            (None, State::Static(_)) => {
                *state = State::Empty;
                self.publish(None);
                Ok(())
            }
            (None, _) => Err(ConfigError::NotFound),
        }
    }

    /// Switches into discovery mode, returning the new generation.
    pub fn start_discovery(&self) -> Result<u64, ConfigError> {
        let mut state = self.state.lock();
        match *state {
            State::Static(_) => Err(ConfigError::Exists),
            State::Discovery { .. } => Err(ConfigError::Exists),
            State::Empty => {
                let generation = self.next_generation();
                *state = State::Discovery {
                    found: None,
                    generation,
                };
                Ok(generation)
            }
        }
    }

    /// Leaves discovery mode.
    pub fn stop_discovery(&self) {
        let mut state = self.state.lock();
        if let State::Discovery { found, .. } = *state {
            if found.is_some() {
                self.publish(None);
            }
            *state = State::Empty;
        }
    }

    /// Records a prefix found by the discovery task of `generation`.
    ///
    /// Returns whether the report was accepted.
    pub fn on_discovered(
        &self,
        generation: u64,
        prefix: Option<Prefix64>,
    ) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Discovery {
                found,
                generation: current,
            } if current == generation => {
                if found != prefix {
                    *state = State::Discovery {
                        found: prefix,
                        generation,
                    };
                    self.publish(prefix);
                }
                true
            }
            _ => false,
        }
    }

    /// Whether discovery is currently running.
    pub fn discovery_running(&self) -> bool {
        matches!(*self.state.lock(), State::Discovery { .. })
    }

    /// Publishes a prefix change.
    fn publish(&self, prefix: Option<Prefix64>) {
        self.events.publish(Event::Prefix64 {
            netid: self.netid,
            prefix,
        });
    }

    /// Produces a generation number unique within this state.
    fn next_generation(&self) -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static GENERATION: AtomicU64 = AtomicU64::new(1);
        GENERATION.fetch_add(1, Ordering::Relaxed)
    }
}

//============ Tests =========================================================
