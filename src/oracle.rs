//! Routing of lookups to an effective network.
//!
//! Which network's configuration a query uses depends on platform policy:
//! the caller's per-process or per-app default network, VPN membership,
//! and firewall state. That policy lives outside this crate; the
//! [`RoutingOracle`] trait is the seam where it plugs in. A deterministic
//! in-memory implementation ships for embedders without platform IPC and
//! for tests.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

use parking_lot::RwLock;

//------------ Constants -----------------------------------------------------

/// Netid value requesting the caller's default network.
pub const NETID_UNSET: u32 = 0;

/// Bit requesting the system's bypass servers, short-circuiting VPN
/// routing.
pub const NETID_USE_LOCAL_NAMESERVERS: u32 = 0x8000_0000;

/// Mask extracting the plain netid from a request.
const NETID_MASK: u32 = !NETID_USE_LOCAL_NAMESERVERS;

//------------ Route ---------------------------------------------------------

/// The routing decision for one lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Route {
    /// The network whose configuration the query uses.
    pub netid: u32,

    /// The caller asked for the bypass servers; private DNS and VPN
    /// redirection do not apply.
    pub local_nameservers: bool,

    /// The caller's uid is blocked by the firewall. Unless the resolver
    /// is configured to perform DNS under a privileged uid, the query
    /// must be refused.
    pub uid_blocked: bool,
}

//------------ RoutingOracle -------------------------------------------------

/// Maps a calling uid and requested netid to an effective route.
pub trait RoutingOracle: Send + Sync {
    /// Decides the route for a lookup.
    fn route(&self, uid: u32, requested_netid: u32) -> Route;
}

//------------ StaticRoutes --------------------------------------------------

/// An in-memory routing policy.
#[derive(Debug, Default)]
pub struct StaticRoutes {
    inner: RwLock<RoutesInner>,
}

#[derive(Debug, Default)]
struct RoutesInner {
    /// The system default network.
    default_netid: u32,

    /// Per-uid app default networks.
    app_default: HashMap<u32, u32>,

    /// Secure VPNs and the uid ranges they cover.
    vpns: Vec<Vpn>,

    /// Uids the firewall blocks.
    blocked_uids: HashSet<u32>,
}

/// A secure VPN known to the policy.
#[derive(Clone, Debug)]
struct Vpn {
    /// The VPN's network.
    netid: u32,

    /// Uids routed into the VPN.
    uid_ranges: Vec<RangeInclusive<u32>>,
}

impl StaticRoutes {
    /// Creates a policy with the given system default network.
    pub fn new(default_netid: u32) -> Self {
        let routes = Self::default();
        routes.inner.write().default_netid = default_netid;
        routes
    }

    /// Sets the system default network.
    pub fn set_default_network(&self, netid: u32) {
        self.inner.write().default_netid = netid;
    }

    /// Sets or clears the app default network of a uid.
    pub fn set_app_default(&self, uid: u32, netid: Option<u32>) {
        let mut inner = self.inner.write();
        match netid {
            Some(netid) => {
                inner.app_default.insert(uid, netid);
            }
            None => {
                inner.app_default.remove(&uid);
            }
        }
    }

    /// Registers a secure VPN covering the given uid ranges.
    pub fn add_vpn(&self, netid: u32, uid_ranges: Vec<RangeInclusive<u32>>) {
        self.inner.write().vpns.push(Vpn { netid, uid_ranges });
    }

    /// Removes a VPN.
    pub fn remove_vpn(&self, netid: u32) {
        self.inner.write().vpns.retain(|vpn| vpn.netid != netid);
    }

    /// Marks a uid as blocked or unblocked by the firewall.
    pub fn set_uid_blocked(&self, uid: u32, blocked: bool) {
        let mut inner = self.inner.write();
        if blocked {
            inner.blocked_uids.insert(uid);
        } else {
            inner.blocked_uids.remove(&uid);
        }
    }
}

impl RoutingOracle for StaticRoutes {
    fn route(&self, uid: u32, requested_netid: u32) -> Route {
        let inner = self.inner.read();
        let local_nameservers =
            requested_netid & NETID_USE_LOCAL_NAMESERVERS != 0;
        let plain = requested_netid & NETID_MASK;
        let uid_blocked = inner.blocked_uids.contains(&uid);

        // An explicit netid is honored, except that a secure VPN only
        // accepts members of its uid ranges; everyone else falls back to
        // their app default network.
        let netid = if plain != NETID_UNSET {
            match inner.vpns.iter().find(|vpn| vpn.netid == plain) {
                Some(vpn) if !vpn.covers(uid) => inner.fallback_for(uid),
                _ => plain,
            }
        } else if local_nameservers {
            inner.fallback_for(uid)
        } else {
            // Default routing: a covering VPN wins over the app default.
            inner
                .vpns
                .iter()
                .find(|vpn| vpn.covers(uid))
                .map(|vpn| vpn.netid)
                .unwrap_or_else(|| inner.fallback_for(uid))
        };

        Route {
            netid,
            local_nameservers,
            uid_blocked,
        }
    }
}

impl RoutesInner {
    /// The network a uid uses when VPN routing does not apply.
    fn fallback_for(&self, uid: u32) -> u32 {
        self.app_default
            .get(&uid)
            .copied()
            .unwrap_or(self.default_netid)
    }
}

impl Vpn {
    /// Returns whether the uid belongs to this VPN.
    fn covers(&self, uid: u32) -> bool {
        self.uid_ranges.iter().any(|range| range.contains(&uid))
    }
}

//============ Tests =========================================================
