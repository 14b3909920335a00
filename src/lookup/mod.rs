//! The lookup orchestrator.
//!
//! Turns the caller-facing operations (name to address, address to
//! name, raw queries) into dispatcher questions: search-domain expansion,
//! host-table short-circuits, CNAME chain resolution, DNS64 synthesis
//! and final address ordering all live here.

pub mod addr;
pub mod host;
pub mod search;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::name::{Name, ToName};
use domain::base::Message;
use domain::rdata::{Aaaa, Cname, Ptr, A};

use crate::error::QueryError;

/// Upper bound on CNAME chain length.
const MAX_CNAME_CHAIN: usize = 8;

//------------ Caller-facing types -------------------------------------------

/// The address family of a lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    /// IPv4 only.
    V4,

    /// IPv6 only.
    V6,
}

/// Socket types a result entry applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SockType {
    /// Stream sockets.
    Stream,

    /// Datagram sockets.
    Dgram,
}

/// Behavior flags of a high-level lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupFlags {
    /// The name must be a numeric literal; no lookup of any kind.
    pub numeric_host: bool,

    /// Only query families the outbound interface can actually use.
    pub addr_config: bool,
}

/// Parameters of a high-level lookup.
#[derive(Clone, Copy, Debug)]
pub struct LookupArgs {
    /// The requested network.
    pub netid: u32,

    /// The calling application.
    pub uid: u32,

    /// Family restriction; `None` asks for both.
    pub family: Option<Family>,

    /// The socket type the caller intends; `None` leaves it open.
    pub sock_type: Option<SockType>,

    /// Behavior flags.
    pub flags: LookupFlags,
}

impl LookupArgs {
    /// Creates arguments with defaults for everything but the network.
    pub fn on_network(netid: u32, uid: u32) -> Self {
        Self {
            netid,
            uid,
            family: None,
            sock_type: None,
            flags: LookupFlags::default(),
        }
    }
}

/// One resolved address with its applicable socket types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddrInfo {
    /// The address.
    pub addr: IpAddr,

    /// Socket types this entry is valid for.
    pub sock_types: Vec<SockType>,
}

/// The outcome of a name to address lookup.
#[derive(Clone, Debug, Default)]
pub struct HostResults {
    /// Resolved addresses, best first.
    pub entries: Vec<AddrInfo>,

    /// The canonical name after CNAME resolution, if different from the
    /// question.
    pub canonical: Option<String>,
}

impl HostResults {
    /// Just the addresses, in order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.entries.iter().map(|entry| entry.addr).collect()
    }
}

//------------ CNAME chain handling ------------------------------------------

/// Follows the CNAME chain inside an answer.
///
/// Returns the owner whose records answer the question. A chain longer
/// than the bound or one that loops back on itself fails, as does a
/// record with unparseable data.
pub(crate) fn follow_cname(
    msg: &Message<Bytes>,
    qname: &Name<Vec<u8>>,
) -> Result<Name<Vec<u8>>, QueryError> {
    let mut owner = qname.to_canonical_name();
    let mut seen: Vec<Name<Vec<u8>>> = vec![owner.clone()];

    for _ in 0..MAX_CNAME_CHAIN {
        let answer =
            msg.answer().map_err(|_| QueryError::Malformed)?;
        let mut next = None;
        for record in answer.limit_to::<Cname<_>>() {
            let record = record.map_err(|_| QueryError::Malformed)?;
            if record.owner().to_name::<Vec<u8>>().to_canonical_name::<Vec<u8>>()
                == owner
            {
                next = Some(
                    record
                        .data()
                        .cname()
                        .to_name::<Vec<u8>>()
                        .to_canonical_name(),
                );
                break;
            }
        }
        match next {
            None => return Ok(owner),
            Some(target) => {
                if seen.contains(&target) {
                    return Err(QueryError::Malformed);
                }
                seen.push(target.clone());
                owner = target;
            }
        }
    }
    Err(QueryError::Malformed)
}

/// Collects the IPv4 addresses owned by `owner`.
pub(crate) fn collect_a(
    msg: &Message<Bytes>,
    owner: &Name<Vec<u8>>,
) -> Result<Vec<Ipv4Addr>, QueryError> {
    let answer = msg.answer().map_err(|_| QueryError::Malformed)?;
    let mut out = Vec::new();
    for record in answer.limit_to::<A>() {
        let record = record.map_err(|_| QueryError::Malformed)?;
        if record.owner().to_name::<Vec<u8>>().to_canonical_name::<Vec<u8>>() == *owner
        {
            out.push(record.data().addr());
        }
    }
    Ok(out)
}

/// Collects the IPv6 addresses owned by `owner`.
pub(crate) fn collect_aaaa(
    msg: &Message<Bytes>,
    owner: &Name<Vec<u8>>,
) -> Result<Vec<Ipv6Addr>, QueryError> {
    let answer = msg.answer().map_err(|_| QueryError::Malformed)?;
    let mut out = Vec::new();
    for record in answer.limit_to::<Aaaa>() {
        let record = record.map_err(|_| QueryError::Malformed)?;
        if record.owner().to_name::<Vec<u8>>().to_canonical_name::<Vec<u8>>() == *owner
        {
            out.push(record.data().addr());
        }
    }
    Ok(out)
}

/// Collects the PTR targets owned by `owner`.
pub(crate) fn collect_ptr(
    msg: &Message<Bytes>,
    owner: &Name<Vec<u8>>,
) -> Result<Vec<Name<Vec<u8>>>, QueryError> {
    let answer = msg.answer().map_err(|_| QueryError::Malformed)?;
    let mut out = Vec::new();
    for record in answer.limit_to::<Ptr<_>>() {
        let record = record.map_err(|_| QueryError::Malformed)?;
        if record.owner().to_name::<Vec<u8>>().to_canonical_name::<Vec<u8>>() == *owner
        {
            out.push(record.data().ptrdname().to_name::<Vec<u8>>());
        }
    }
    Ok(out)
}

/// Whether the answer is authoritative "no such name".
pub(crate) fn is_nxdomain(msg: &Message<Bytes>) -> bool {
    msg.header().rcode() == domain::base::iana::Rcode::NXDOMAIN
}

/// The socket types a result entry is tagged with.
pub(crate) fn sock_types_for(requested: Option<SockType>) -> Vec<SockType> {
    match requested {
        Some(sock_type) => vec![sock_type],
        None => vec![SockType::Stream, SockType::Dgram],
    }
}

/// The query type for a family.
pub(crate) fn rtype_for(family: Family) -> Rtype {
    match family {
        Family::V4 => Rtype::A,
        Family::V6 => Rtype::AAAA,
    }
}

//============ Tests =========================================================
