//! Single datagram exchanges.
//!
//! The dispatcher owns retry policy, server order and deadlines, and it
//! alone judges what a reply means for the question. This module only
//! puts bytes on the wire and hands back datagrams that carry the
//! query's id; everything else arriving on the socket is noise and is
//! skipped without ending the wait. The send and receive halves are
//! separate so the dispatcher can keep reading a socket whose deadline
//! has passed (the keep-listening optimization) while later attempts
//! run.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::Message;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::error::QueryError;
use crate::transport::protocol::{AsyncConnect, UdpConnect};

/// Receive buffer size, matching the advertised EDNS payload size.
const RECV_SIZE: usize = 4096;

//------------ Send / receive ------------------------------------------------

/// Connects a fresh socket to the server and sends one query.
pub(crate) async fn send_query(
    connect: UdpConnect,
    payload: &[u8],
) -> Result<Arc<UdpSocket>, QueryError> {
    let sock = connect.connect().await?;
    let sent = sock.send(payload).await?;
    if sent != payload.len() {
        return Err(QueryError::Io(Arc::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "short UDP send",
        ))));
    }
    Ok(Arc::new(sock))
}

/// Receives the next response datagram carrying `id` within `deadline`.
///
/// Unparseable datagrams, queries and foreign ids are skipped. Whether
/// the returned message actually answers the question is for the caller
/// to judge; it may loop back here with the remaining deadline if it
/// decides the id match was a coincidence.
pub(crate) async fn recv_reply(
    sock: &UdpSocket,
    id: u16,
    deadline: Duration,
) -> Result<Message<Bytes>, QueryError> {
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return Err(QueryError::Timeout);
        }
        let mut buf = vec![0u8; RECV_SIZE];
        let n = match timeout(deadline - elapsed, sock.recv(&mut buf)).await
        {
            Err(_) => return Err(QueryError::Timeout),
            Ok(res) => res?,
        };
        buf.truncate(n);
        let reply = match Message::from_octets(Bytes::from(buf)) {
            Ok(reply) => reply,
            Err(_) => continue,
        };
        if reply.header().qr() && reply.header().id() == id {
            return Ok(reply);
        }
    }
}

/// Performs one complete exchange against the server.
///
/// Convenience for probes that only need any id-matched response, such
/// as the private-DNS latency probe.
pub(crate) async fn exchange(
    connect: UdpConnect,
    payload: &[u8],
    id: u16,
    deadline: Duration,
) -> Result<Message<Bytes>, QueryError> {
    let sock = send_query(connect, payload).await?;
    recv_reply(&sock, id, deadline).await
}

//============ Tests =========================================================
