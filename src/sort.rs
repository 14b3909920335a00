//! Destination address ordering.
//!
//! Implements the destination address selection rules of RFC 6724 that
//! matter for a stub resolver handing a list to connect-happy callers:
//! matching label (rule 5), higher precedence (rule 6), smaller scope
//! (rule 8), longest matching prefix (rule 9) and leave-unchanged
//! (rule 10). Rules 1, 2, 3, 4 and 7 depend on interface state this crate
//! does not track and are deliberately not implemented.
//!
//! The source address for a destination is learned by connecting a UDP
//! socket, which consults the routing table without sending anything.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};

//------------ Policy table --------------------------------------------------

/// One row of the RFC 6724 default policy table.
struct Policy {
    /// The prefix, in IPv6 form.
    prefix: Ipv6Addr,

    /// Prefix length in bits.
    len: u8,

    /// Precedence: higher sorts earlier.
    precedence: u8,

    /// Label for source/destination matching.
    label: u8,
}

/// The default policy table of RFC 6724 section 2.1.
const POLICY: &[Policy] = &[
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1),
        len: 128,
        precedence: 50,
        label: 0,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0),
        len: 96,
        precedence: 35,
        label: 4,
    },
    Policy {
        prefix: Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0),
        len: 16,
        precedence: 30,
        label: 2,
    },
    Policy {
        prefix: Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0),
        len: 32,
        precedence: 5,
        label: 5,
    },
    Policy {
        prefix: Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0),
        len: 7,
        precedence: 3,
        label: 13,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0),
        len: 96,
        precedence: 1,
        label: 3,
    },
    Policy {
        prefix: Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0),
        len: 10,
        precedence: 1,
        label: 11,
    },
    Policy {
        prefix: Ipv6Addr::new(0x3ffe, 0, 0, 0, 0, 0, 0, 0),
        len: 16,
        precedence: 1,
        label: 12,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0),
        len: 0,
        precedence: 40,
        label: 1,
    },
];

/// Returns the policy row for an address, mapping IPv4 per RFC 6724.
fn lookup_policy(addr: IpAddr) -> &'static Policy {
    let addr = to_mapped(addr);
    let mut best: Option<&Policy> = None;
    for policy in POLICY {
        if common_prefix_bits(addr, policy.prefix) < policy.len as u32 {
            continue;
        }
        if best.map_or(true, |b| policy.len > b.len) {
            best = Some(policy);
        }
    }
    best.expect("the default row matches everything")
}

/// Maps IPv4 addresses into IPv6 space.
fn to_mapped(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Number of identical leading bits of two IPv6 addresses.
fn common_prefix_bits(a: Ipv6Addr, b: Ipv6Addr) -> u32 {
    let a = u128::from_be_bytes(a.octets());
    let b = u128::from_be_bytes(b.octets());
    (a ^ b).leading_zeros()
}

/// The multicast/unicast scope of an address, per RFC 6724 section 3.1.
fn scope(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_link_local() {
                0x02
            } else {
                0x0e
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_multicast() {
                v6.octets()[1] & 0x0f
            } else if v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80
            {
                0x02
            } else if (v6.segments()[0] & 0xffc0) == 0xfec0 {
                0x05
            } else {
                0x0e
            }
        }
    }
}

//------------ Sorting -------------------------------------------------------

/// The precomputed ordering key of one destination.
struct SortKey {
    /// Destination and source share a policy label.
    label_match: bool,

    /// Destination precedence.
    precedence: u8,

    /// Destination scope.
    scope: u8,

    /// Common prefix length with the source (IPv6 only).
    common_prefix: u32,
}

impl SortKey {
    fn new(dst: IpAddr, src: Option<IpAddr>) -> Self {
        let policy = lookup_policy(dst);
        let label_match = src
            .map(|src| lookup_policy(src).label == policy.label)
            .unwrap_or(false);
        let common_prefix = match (dst, src) {
            (IpAddr::V6(d), Some(IpAddr::V6(s))) => common_prefix_bits(d, s),
            _ => 0,
        };
        Self {
            label_match,
            precedence: policy.precedence,
            scope: scope(dst),
            common_prefix,
        }
    }

    fn cmp_rules(&self, other: &Self) -> Ordering {
        // Rule 5: prefer matching label.
        (other.label_match.cmp(&self.label_match))
            // Rule 6: prefer higher precedence.
            .then(other.precedence.cmp(&self.precedence))
            // Rule 8: prefer smaller scope.
            .then(self.scope.cmp(&other.scope))
            // Rule 9: prefer longer matching prefix.
            .then(other.common_prefix.cmp(&self.common_prefix))
        // Rule 10: leave unchanged -- the sort below is stable.
    }
}

/// Sorts destinations in place, learning sources from the routing table.
pub fn sort_addresses(addrs: &mut [IpAddr]) {
    sort_addresses_with(addrs, probe_source)
}

/// Sorts destinations in place with an injected source oracle.
pub fn sort_addresses_with<F>(addrs: &mut [IpAddr], source_for: F)
where
    F: Fn(IpAddr) -> Option<IpAddr>,
{
    let mut keyed: Vec<(SortKey, IpAddr)> = addrs
        .iter()
        .map(|&addr| (SortKey::new(addr, source_for(addr)), addr))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp_rules(b));
    for (slot, (_, addr)) in addrs.iter_mut().zip(keyed) {
        *slot = addr;
    }
}

/// Learns the source address the kernel would pick for a destination.
///
/// Connecting a datagram socket selects a route without any traffic.
fn probe_source(dst: IpAddr) -> Option<IpAddr> {
    let local: SocketAddr = if dst.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let sock = UdpSocket::bind(local).ok()?;
    sock.connect((dst, 53)).ok()?;
    sock.local_addr().ok().map(|addr| addr.ip())
}

//============ Tests =========================================================
