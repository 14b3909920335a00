//! In-process stub DNS servers for end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use domain::base::iana::{Rcode, Rtype};
use domain::base::name::{Name, ToName};
use domain::base::{Message, MessageBuilder, Ttl};
use domain::rdata::{Aaaa, Ptr, Soa, A};
use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// A record served by the stub.
#[derive(Clone, Debug)]
pub enum Rr {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(&'static str),
}

/// A very small authoritative server on a loopback UDP socket.
pub struct StubServer {
    addr: SocketAddr,
    queries: Arc<Mutex<Vec<(String, Rtype)>>>,
}

impl StubServer {
    /// Starts a server for the given records.
    ///
    /// Missing names are answered NXDOMAIN with a SOA so negative
    /// answers are cacheable; present names with a missing type get an
    /// empty NOERROR.
    pub async fn start(records: &[(&str, Rr)]) -> Self {
        Self::start_with_delay(records, Duration::ZERO).await
    }

    /// Like [`start`][Self::start] but delays every answer.
    pub async fn start_with_delay(
        records: &[(&str, Rr)],
        delay: Duration,
    ) -> Self {
        let mut zone: HashMap<String, Vec<Rr>> = HashMap::new();
        for (name, rr) in records {
            zone.entry(name.to_ascii_lowercase().trim_end_matches('.').into())
                .or_default()
                .push(rr.clone());
        }

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));

        let seen = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(request) = Message::from_octets(buf[..n].to_vec())
                else {
                    continue;
                };
                let Ok(question) = request.sole_question() else {
                    continue;
                };
                let qname = question
                    .qname()
                    .to_name::<Vec<u8>>()
                    .to_string()
                    .to_ascii_lowercase();
                let qtype = question.qtype();
                seen.lock().push((qname.clone(), qtype));

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let reply = match zone.get(&qname) {
                    Some(records) => {
                        answer(&request, records, qtype)
                    }
                    None => nxdomain(&request),
                };
                let _ = sock.send_to(&reply, peer).await;
            }
        });

        Self { addr, queries }
    }

    /// Starts a server that accepts queries but never answers.
    pub async fn silent() -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let seen = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, _)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                if let Ok(request) =
                    Message::from_octets(buf[..n].to_vec())
                {
                    if let Ok(question) = request.sole_question() {
                        seen.lock().push((
                            question.qname().to_string(),
                            question.qtype(),
                        ));
                    }
                }
            }
        });
        Self { addr, queries }
    }

    /// The server's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every question received so far.
    pub fn queries(&self) -> Vec<(String, Rtype)> {
        self.queries.lock().clone()
    }

    /// Number of questions received so far.
    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }
}

fn answer(
    request: &Message<Vec<u8>>,
    records: &[Rr],
    qtype: Rtype,
) -> Vec<u8> {
    let qname = request
        .sole_question()
        .unwrap()
        .qname()
        .to_name::<Vec<u8>>();
    let mut builder = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap();
    for rr in records {
        match rr {
            Rr::A(addr) if qtype == Rtype::A => {
                builder.push((&qname, 300, A::new(*addr))).unwrap();
            }
            Rr::Aaaa(addr) if qtype == Rtype::AAAA => {
                builder.push((&qname, 300, Aaaa::new(*addr))).unwrap();
            }
            Rr::Ptr(name) if qtype == Rtype::PTR => {
                builder
                    .push((
                        &qname,
                        300,
                        Ptr::new(Name::<Vec<u8>>::from_str(name).unwrap()),
                    ))
                    .unwrap();
            }
            _ => {}
        }
    }
    builder.into_message().into_octets()
}

fn nxdomain(request: &Message<Vec<u8>>) -> Vec<u8> {
    let mut builder = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NXDOMAIN)
        .unwrap()
        .authority();
    builder
        .push((
            Name::<Vec<u8>>::from_str("example.com").unwrap(),
            300,
            Soa::new(
                Name::<Vec<u8>>::from_str("ns.example.com").unwrap(),
                Name::<Vec<u8>>::from_str("admin.example.com").unwrap(),
                1.into(),
                Ttl::from_secs(300),
                Ttl::from_secs(300),
                Ttl::from_secs(300),
                Ttl::from_secs(60),
            ),
        ))
        .unwrap();
    builder.into_message().into_octets()
}
