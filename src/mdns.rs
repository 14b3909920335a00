//! Multicast resolution of link-local names.
//!
//! Names under `.local` bypass the unicast dispatcher and are asked on
//! the well-known multicast groups as one-shot queries from an
//! ephemeral port (RFC 6762 section 5.1). Whether a network may do this
//! at all depends on its transport types; cellular and VPN networks
//! take the unicast path instead. When multicast produces nothing
//! within the timeout, the caller falls back to unicast.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use domain::base::name::{Label, Name};
use domain::base::Message;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::TransportType;
use crate::error::QueryError;

/// The IPv4 multicast group and port.
pub const GROUP_V4: SocketAddr = SocketAddr::new(
    IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)),
    5353,
);

/// The IPv6 multicast group and port.
pub const GROUP_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb)),
    5353,
);

/// How long to wait for multicast answers before unicast fallback.
pub const MDNS_TIMEOUT: Duration = Duration::from_secs(2);

//------------ Name and network gating ---------------------------------------

/// Returns whether a name belongs to the link-local `.local` zone.
///
/// The bare name `local` itself does not count; it goes through search
/// expansion like any other single label.
pub fn is_local_name(name: &Name<Vec<u8>>) -> bool {
    let local = Label::from_slice(b"local").expect("valid label");
    let labels: Vec<_> = name.iter().collect();
    labels.len() >= 3 && labels[labels.len() - 2] == local
}

/// Returns whether any of the network's transports permits multicast.
pub fn network_allows_mdns(transports: &[TransportType]) -> bool {
    !transports.is_empty()
        && transports.iter().all(|transport| transport.allows_mdns())
}

//------------ One-shot query ------------------------------------------------

/// Sends the question to both multicast groups and returns the first
/// matching reply.
pub(crate) async fn query(
    payload: &[u8],
    query_msg: &Message<Vec<u8>>,
    deadline: Duration,
) -> Result<Message<Bytes>, QueryError> {
    let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok();
    let v6 = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await.ok();
    if v4.is_none() && v6.is_none() {
        return Err(QueryError::Io(std::sync::Arc::new(
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no multicast-capable socket",
            ),
        )));
    }

    let mut sent = false;
    if let Some(sock) = &v4 {
        sent |= sock.send_to(payload, GROUP_V4).await.is_ok();
    }
    if let Some(sock) = &v6 {
        sent |= sock.send_to(payload, GROUP_V6).await.is_ok();
    }
    if !sent {
        return Err(QueryError::Timeout);
    }

    timeout(deadline, async {
        loop {
            let answer = tokio::select! {
                answer = recv_reply(v4.as_ref()) => answer,
                answer = recv_reply(v6.as_ref()) => answer,
            };
            if let Some(answer) = answer {
                if matches_query(&answer, query_msg) {
                    return Ok(answer);
                }
            }
        }
    })
    .await
    .unwrap_or(Err(QueryError::Timeout))
}

/// Receives one datagram, pending forever on an absent socket.
async fn recv_reply(sock: Option<&UdpSocket>) -> Option<Message<Bytes>> {
    let Some(sock) = sock else {
        return std::future::pending().await;
    };
    let mut buf = vec![0u8; 4096];
    let (n, _) = sock.recv_from(&mut buf).await.ok()?;
    buf.truncate(n);
    Message::from_octets(Bytes::from(buf)).ok()
}

/// Matches a multicast reply to the question.
///
/// Responders answering one-shot queries keep the query id, but some
/// answer with id zero and an empty question section; those are matched
/// by the answer records instead.
fn matches_query(
    reply: &Message<Bytes>,
    query: &Message<Vec<u8>>,
) -> bool {
    if !reply.header().qr() {
        return false;
    }
    if reply.header().id() == query.header().id()
        && reply.question() == query.question()
    {
        return true;
    }
    let Ok(question) = query.sole_question() else {
        return false;
    };
    let Ok(answer) = reply.answer() else {
        return false;
    };
    for record in answer.flatten() {
        if record.rtype() == question.qtype()
            && record.owner() == question.qname()
        {
            return true;
        }
    }
    false
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn name(s: &str) -> Name<Vec<u8>> {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn local_names_detected() {
        assert!(is_local_name(&name("printer.local")));
        assert!(is_local_name(&name("Printer.LOCAL")));
        assert!(!is_local_name(&name("printer.example.com")));
        assert!(!is_local_name(&name("local")));
    }

    #[test]
    fn transport_gating() {
        assert!(network_allows_mdns(&[TransportType::Wifi]));
        assert!(network_allows_mdns(&[
            TransportType::Wifi,
            TransportType::Ethernet
        ]));
        assert!(!network_allows_mdns(&[TransportType::Cellular]));
        assert!(!network_allows_mdns(&[
            TransportType::Wifi,
            TransportType::Vpn
        ]));
        assert!(!network_allows_mdns(&[]));
    }
}
