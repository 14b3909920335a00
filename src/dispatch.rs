//! The per-query state machine.
//!
//! A query arrives with an attempt plan snapshotted from its network:
//! the ordered server list, parameters, flags and the private-DNS mode.
//! The dispatcher chooses the transport, walks the server list for up to
//! `retry_count` passes, upgrades to TCP on truncation, falls back from
//! EDNS on FORMERR, and reports one statistics sample per attempt tagged
//! with the plan's revision. The caller's original message id is
//! restored in the delivered reply.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::name::{Name, ToName};
use domain::base::{Message, MessageBuilder, Question};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::{
    PrivateDnsMode, ResolverParams, RuntimeFlags, TcMode,
};
use crate::dot::PrivateDns;
use crate::error::QueryError;
use crate::events::{Event, EventLog};
use crate::stats::SampleOutcome;
use crate::transport::dgram;
use crate::transport::protocol::{TcpConnect, UdpConnect};
use crate::transport::stream;

/// The EDNS0 UDP payload size advertised in queries.
const EDNS_UDP_PAYLOAD: u16 = 4096;

//------------ AttemptPlan ---------------------------------------------------

/// Everything a single query needs, snapshotted from its network.
///
/// The snapshot lets the query proceed without ever holding the
/// network's lock; statistics reported under a superseded revision are
/// dropped on arrival.
#[derive(Clone)]
pub(crate) struct AttemptPlan {
    /// The network the query runs on.
    pub netid: u32,

    /// Configuration revision at snapshot time.
    pub revision: u64,

    /// Cleartext servers in the order to try them.
    pub servers: Vec<SocketAddr>,

    /// Numeric parameters.
    pub params: ResolverParams,

    /// Flag snapshot.
    pub flags: RuntimeFlags,

    /// Truncation handling.
    pub tc_mode: TcMode,

    /// The effective private-DNS mode for this query. Callers that asked
    /// for the bypass servers run with [`PrivateDnsMode::Off`] here even
    /// if the network validates.
    pub mode: PrivateDnsMode,

    /// Cooperative cancellation, flipped when the network is destroyed.
    pub cancelled: Arc<AtomicBool>,
}

//------------ StatsReporter -------------------------------------------------

/// Receives one sample per attempt.
pub(crate) trait StatsReporter: Send + Sync {
    /// Records a sample for `server` under `revision`.
    fn report(
        &self,
        revision: u64,
        server: SocketAddr,
        outcome: SampleOutcome,
        rtt: Option<Duration>,
    );
}

//------------ QuestionBytes -------------------------------------------------

/// A question prepared for the wire.
///
/// High-level lookups carry two serializations, with and without an OPT
/// record, so the EDNS fallback does not have to re-enter the message
/// builder. Raw queries pass the caller's bytes through untouched except
/// for the id.
#[derive(Clone, Debug)]
pub(crate) struct QuestionBytes {
    /// The message with an OPT record, id zeroed. Absent for raw
    /// passthrough queries.
    edns: Option<Vec<u8>>,

    /// The message without an OPT record, id zeroed.
    plain: Vec<u8>,

    /// The id to restore in the delivered reply.
    caller_id: u16,

    /// The question name, for events.
    qname: Name<Vec<u8>>,

    /// The question type, for events.
    qtype: Rtype,
}

impl QuestionBytes {
    /// Builds both serializations of a question.
    pub fn new(
        qname: &Name<Vec<u8>>,
        qtype: Rtype,
        qclass: Class,
    ) -> Result<Self, QueryError> {
        let caller_id = rand::random();
        let plain = compose(qname, qtype, qclass, false)?;
        let edns = compose(qname, qtype, qclass, true)?;
        Ok(Self {
            edns: Some(edns),
            plain,
            caller_id,
            qname: qname.clone(),
            qtype,
        })
    }

    /// Wraps a caller-provided wire message.
    ///
    /// Validation is the minimum needed to match replies: the message
    /// must parse, be a query, and carry exactly one question.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, QueryError> {
        let msg = Message::from_octets(bytes.as_slice())
            .map_err(|_| QueryError::Malformed)?;
        if msg.header().qr() || msg.header().opcode() != Opcode::QUERY {
            return Err(QueryError::InvalidArgument);
        }
        let question =
            msg.sole_question().map_err(|_| QueryError::InvalidArgument)?;
        let qname = question.qname().to_name::<Vec<u8>>();
        let qtype = question.qtype();
        let caller_id = msg.header().id();
        Ok(Self {
            edns: None,
            plain: bytes,
            caller_id,
            qname,
            qtype,
        })
    }

    /// The question name.
    pub fn qname(&self) -> &Name<Vec<u8>> {
        &self.qname
    }

    /// The question type.
    pub fn qtype(&self) -> Rtype {
        self.qtype
    }

    /// The id the caller expects in the reply.
    pub fn caller_id(&self) -> u16 {
        self.caller_id
    }

    /// Produces a payload with a fresh random id.
    ///
    /// Returns the bytes and the parsed form used for reply matching.
    pub(crate) fn materialize(
        &self,
        edns: bool,
    ) -> (Vec<u8>, Message<Vec<u8>>) {
        let mut bytes = match (&self.edns, edns) {
            (Some(edns), true) => edns.clone(),
            _ => self.plain.clone(),
        };
        let id: u16 = rand::random();
        bytes[..2].copy_from_slice(&id.to_be_bytes());
        let msg = Message::from_octets(bytes.clone())
            .expect("prepared query must parse");
        (bytes, msg)
    }

    /// Whether this question may use EDNS at all.
    fn has_edns(&self) -> bool {
        self.edns.is_some()
    }
}

/// Builds a query message for a question.
fn compose(
    qname: &Name<Vec<u8>>,
    qtype: Rtype,
    qclass: Class,
    edns: bool,
) -> Result<Vec<u8>, QueryError> {
    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder
        .push(Question::new(qname, qtype, qclass))
        .map_err(|_| QueryError::InvalidArgument)?;
    let mut builder = builder.additional();
    if edns {
        builder
            .opt(|opt| {
                opt.set_udp_payload_size(EDNS_UDP_PAYLOAD);
                Ok(())
            })
            .map_err(|_| QueryError::InvalidArgument)?;
    }
    Ok(builder.finish())
}

//------------ Dispatcher ----------------------------------------------------

/// Runs single questions against a network.
pub(crate) struct Dispatcher<'a, C: Clock> {
    /// The plan snapshot.
    plan: &'a AttemptPlan,

    /// The private-DNS subsystem.
    private_dns: &'a Arc<PrivateDns<C>>,

    /// Where attempt samples go.
    stats: &'a dyn StatsReporter,

    /// Where the query event goes.
    events: &'a EventLog,
}

/// A socket whose deadline passed but that may still produce a usable
/// late reply.
struct LateSocket {
    /// The socket, still connected to its server.
    sock: Arc<UdpSocket>,

    /// The query that went out on it.
    msg: Message<Vec<u8>>,

    /// The server it was sent to, for late RTT accounting.
    server: SocketAddr,

    /// When the query was sent.
    sent: Instant,
}

impl<'a, C: Clock> Dispatcher<'a, C> {
    /// Creates a dispatcher for one plan.
    pub fn new(
        plan: &'a AttemptPlan,
        private_dns: &'a Arc<PrivateDns<C>>,
        stats: &'a dyn StatsReporter,
        events: &'a EventLog,
    ) -> Self {
        Self {
            plan,
            private_dns,
            stats,
            events,
        }
    }

    /// Runs the question to completion.
    ///
    /// With `no_retry` a single attempt is made against the first
    /// transport choice.
    pub async fn run(
        &self,
        question: &QuestionBytes,
        no_retry: bool,
    ) -> Result<Message<Bytes>, QueryError> {
        let started = Instant::now();
        let result = self.run_inner(question, no_retry).await;
        self.events.publish(Event::Query {
            netid: self.plan.netid,
            qname: question.qname.to_string(),
            qtype: question.qtype,
            rcode: result.as_ref().ok().map(|msg| msg.header().rcode()),
            latency: started.elapsed(),
            answers: result
                .as_ref()
                .map(|msg| msg.header_counts().ancount())
                .unwrap_or(0),
        });
        result
    }

    async fn run_inner(
        &self,
        question: &QuestionBytes,
        no_retry: bool,
    ) -> Result<Message<Bytes>, QueryError> {
        self.check_cancelled()?;

        match self.plan.mode {
            PrivateDnsMode::Strict => self.run_dot(question, true).await,
            PrivateDnsMode::Opportunistic => {
                match self.run_dot(question, false).await {
                    Ok(answer) => Ok(answer),
                    Err(_) => {
                        // Separate error path: opportunistic failures
                        // fall through to cleartext.
                        self.run_do53(question, no_retry).await
                    }
                }
            }
            PrivateDnsMode::Off => self.run_do53(question, no_retry).await,
        }
    }

    /// Queries over the encrypted transport.
    ///
    /// In strict mode every failure is final; nothing ever reaches a
    /// cleartext socket.
    async fn run_dot(
        &self,
        question: &QuestionBytes,
        strict: bool,
    ) -> Result<Message<Bytes>, QueryError> {
        let servers = self.private_dns.usable_servers(self.plan.netid);
        if servers.is_empty() {
            return Err(QueryError::NoValidatedServers);
        }
        if !strict && self.private_dns.quick_fallback_applies(self.plan.netid)
        {
            return Err(QueryError::NoValidatedServers);
        }

        let mut last_err = QueryError::Timeout;
        for identity in &servers {
            self.check_cancelled()?;
            let (payload, msg) = question.materialize(question.has_edns());
            let wire_id = msg.header().id();
            match self
                .private_dns
                .query(self.plan.netid, identity, payload, wire_id)
                .await
            {
                Ok(answer) => {
                    return Ok(deliver(&answer, question.caller_id));
                }
                Err(err) => {
                    tracing::debug!(
                        server = %identity.addr,
                        %err,
                        "encrypted query failed"
                    );
                    last_err = err;
                    if !strict {
                        // One failed encrypted attempt is enough to
                        // fall back; further servers would only add
                        // latency.
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Queries over classic UDP with TCP upgrade.
    async fn run_do53(
        &self,
        question: &QuestionBytes,
        no_retry: bool,
    ) -> Result<Message<Bytes>, QueryError> {
        if self.plan.servers.is_empty() {
            return Err(QueryError::NoServers);
        }

        let deadline = self.plan.params.base_timeout();
        let passes = if no_retry {
            1
        } else {
            self.plan.params.retry_count.max(1)
        };

        // Servers that answered FORMERR to an EDNS query this pass.
        let mut no_edns: HashSet<SocketAddr> = HashSet::new();
        // Sockets that timed out but stay readable under the flag.
        let mut late: Vec<LateSocket> = Vec::new();
        // Disabled after a failed upgrade in the fallback tc mode.
        let mut tcp_disabled = false;

        let mut best_err = QueryError::Timeout;

        for _pass in 0..passes {
            for &server in &self.plan.servers {
                self.check_cancelled()?;
                let use_edns =
                    question.has_edns() && !no_edns.contains(&server);
                match self
                    .attempt(question, server, use_edns, deadline, &mut late)
                    .await
                {
                    AttemptOutcome::Answer(answer) => {
                        return Ok(deliver(&answer, question.caller_id));
                    }
                    AttemptOutcome::FormErrWithEdns => {
                        // Retry the same server once without EDNS; a
                        // second failure is a hard failure there.
                        no_edns.insert(server);
                        match self
                            .attempt(
                                question, server, false, deadline,
                                &mut late,
                            )
                            .await
                        {
                            AttemptOutcome::Answer(answer) => {
                                return Ok(deliver(
                                    &answer,
                                    question.caller_id,
                                ));
                            }
                            AttemptOutcome::Truncated(answer) => {
                                match self
                                    .upgrade_tcp(
                                        question,
                                        server,
                                        deadline,
                                        &mut tcp_disabled,
                                        answer,
                                    )
                                    .await
                                {
                                    Some(answer) => {
                                        return Ok(deliver(
                                            &answer,
                                            question.caller_id,
                                        ))
                                    }
                                    None => {
                                        best_err = QueryError::ServerFailed(
                                            Rcode::FORMERR,
                                        )
                                    }
                                }
                            }
                            _ => {
                                best_err = QueryError::ServerFailed(
                                    Rcode::FORMERR,
                                );
                            }
                        }
                    }
                    AttemptOutcome::SoftFail(rcode) => {
                        best_err = QueryError::ServerFailed(rcode);
                    }
                    AttemptOutcome::Truncated(answer) => {
                        match self
                            .upgrade_tcp(
                                question,
                                server,
                                deadline,
                                &mut tcp_disabled,
                                answer,
                            )
                            .await
                        {
                            Some(answer) => {
                                return Ok(deliver(
                                    &answer,
                                    question.caller_id,
                                ))
                            }
                            None => {}
                        }
                    }
                    AttemptOutcome::Timeout | AttemptOutcome::ConnError => {}
                }

                if no_retry {
                    return Err(best_err);
                }
            }
        }
        Err(best_err)
    }

    /// One send/receive attempt against one server.
    ///
    /// The datagram layer hands up anything carrying the attempt's id;
    /// deciding what such a reply means happens here, per
    /// [`ReplyKind`]. Coincidental id matches keep the wait running on
    /// the remaining deadline.
    async fn attempt(
        &self,
        question: &QuestionBytes,
        server: SocketAddr,
        use_edns: bool,
        deadline: Duration,
        late: &mut Vec<LateSocket>,
    ) -> AttemptOutcome {
        let (payload, msg) = question.materialize(use_edns);
        let wire_id = msg.header().id();
        let sent_at = Instant::now();

        let sock = match dgram::send_query(
            UdpConnect::new(server),
            &payload,
        )
        .await
        {
            Ok(sock) => sock,
            Err(err) => {
                tracing::debug!(%server, %err, "could not send query");
                self.stats.report(
                    self.plan.revision,
                    server,
                    SampleOutcome::InternalError,
                    None,
                );
                return AttemptOutcome::ConnError;
            }
        };

        let deadline_at = sent_at + deadline;
        let received = loop {
            let remaining =
                deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(QueryError::Timeout);
            }

            let incoming = if self.plan.flags.keep_listening_udp
                && !late.is_empty()
            {
                tokio::select! {
                    incoming = dgram::recv_reply(&sock, wire_id, remaining) => {
                        incoming
                    }
                    late_answer = drain_late(late) => {
                        let (answer, server, sent) = late_answer;
                        // The timeout for that attempt was already
                        // recorded; the late reply only refreshes the
                        // RTT window.
                        self.stats.report(
                            self.plan.revision,
                            server,
                            SampleOutcome::Success,
                            Some(sent.elapsed()),
                        );
                        return AttemptOutcome::Answer(answer);
                    }
                }
            } else {
                dgram::recv_reply(&sock, wire_id, remaining).await
            };

            match incoming {
                Ok(reply) => match reply_kind(&reply, &msg) {
                    ReplyKind::Unrelated => continue,
                    ReplyKind::Answers | ReplyKind::ErrorReport => {
                        break Ok(reply)
                    }
                },
                Err(err) => break Err(err),
            }
        };

        match received {
            Ok(answer) => {
                let rcode = answer.header().rcode();
                if answer.header().tc() && rcode == Rcode::NOERROR {
                    self.stats.report(
                        self.plan.revision,
                        server,
                        SampleOutcome::Success,
                        Some(sent_at.elapsed()),
                    );
                    return AttemptOutcome::Truncated(answer);
                }
                match rcode {
                    Rcode::FORMERR if use_edns => {
                        self.stats.report(
                            self.plan.revision,
                            server,
                            SampleOutcome::Error,
                            None,
                        );
                        AttemptOutcome::FormErrWithEdns
                    }
                    Rcode::FORMERR | Rcode::SERVFAIL | Rcode::NOTIMP => {
                        self.stats.report(
                            self.plan.revision,
                            server,
                            SampleOutcome::Error,
                            None,
                        );
                        AttemptOutcome::SoftFail(rcode)
                    }
                    _ => {
                        // NOERROR and NXDOMAIN are successes for the
                        // stats even with zero answers: the server did
                        // its job.
                        self.stats.report(
                            self.plan.revision,
                            server,
                            SampleOutcome::Success,
                            Some(sent_at.elapsed()),
                        );
                        AttemptOutcome::Answer(answer)
                    }
                }
            }
            Err(QueryError::Timeout) => {
                self.stats.report(
                    self.plan.revision,
                    server,
                    SampleOutcome::Timeout,
                    None,
                );
                if self.plan.flags.keep_listening_udp {
                    late.push(LateSocket {
                        sock,
                        msg,
                        server,
                        sent: sent_at,
                    });
                }
                AttemptOutcome::Timeout
            }
            Err(_) => {
                self.stats.report(
                    self.plan.revision,
                    server,
                    SampleOutcome::InternalError,
                    None,
                );
                AttemptOutcome::ConnError
            }
        }
    }

    /// Retries over TCP after a truncated answer.
    ///
    /// Returns the TCP answer, or the truncated UDP answer when TCP
    /// does not work out in the fallback truncation mode. `None` asks
    /// the caller to move on to the next server.
    async fn upgrade_tcp(
        &self,
        question: &QuestionBytes,
        server: SocketAddr,
        deadline: Duration,
        tcp_disabled: &mut bool,
        udp_answer: Message<Bytes>,
    ) -> Option<Message<Bytes>> {
        if *tcp_disabled {
            return Some(udp_answer);
        }
        let (payload, msg) = question.materialize(question.has_edns());
        match stream::oneshot_query(
            &TcpConnect::new(server),
            &payload,
            &msg,
            deadline,
        )
        .await
        {
            Ok(answer) => Some(answer),
            Err(err) => {
                tracing::debug!(%server, %err, "TCP upgrade failed");
                match self.plan.tc_mode {
                    TcMode::UdpTcp => None,
                    TcMode::UdpTcpUdp => {
                        // Give up on TCP for this query and serve what
                        // UDP produced.
                        *tcp_disabled = true;
                        Some(udp_answer)
                    }
                }
            }
        }
    }

    /// Fails fast when the query was cancelled.
    fn check_cancelled(&self) -> Result<(), QueryError> {
        if self.plan.cancelled.load(Ordering::Relaxed) {
            Err(QueryError::NetworkGone)
        } else {
            Ok(())
        }
    }
}

//------------ AttemptOutcome ------------------------------------------------

/// The classified result of one attempt.
enum AttemptOutcome {
    /// A final answer, including authoritative negatives.
    Answer(Message<Bytes>),

    /// The server rejected the EDNS form of the query.
    FormErrWithEdns,

    /// A retriable server error; move to the next server.
    SoftFail(Rcode),

    /// The answer was truncated; upgrade to TCP.
    Truncated(Message<Bytes>),

    /// Nothing arrived before the deadline.
    Timeout,

    /// The socket failed.
    ConnError,
}

//------------ ReplyKind -----------------------------------------------------

/// What an id-matched datagram means for the attempt.
enum ReplyKind {
    /// The question is echoed intact: a real reply, positive or
    /// negative, to be classified by its rcode.
    Answers,

    /// Every section is empty and the header carries an error code or
    /// the truncation bit. Servers that could not process the query
    /// strip it entirely, so this feeds the same rcode classification
    /// (FORMERR and friends become protocol errors on this server, a
    /// bare TC forces the stream upgrade) instead of being dropped.
    ErrorReport,

    /// Carries the id by coincidence; keep listening.
    Unrelated,
}

/// Relates an id-matched reply to the question that was sent.
fn reply_kind(
    reply: &Message<Bytes>,
    query: &Message<Vec<u8>>,
) -> ReplyKind {
    let header = reply.header();
    let counts = reply.header_counts();

    let all_empty = counts.qdcount() == 0
        && counts.ancount() == 0
        && counts.nscount() == 0
        && counts.arcount() == 0;
    if all_empty {
        return if header.rcode() != Rcode::NOERROR || header.tc() {
            ReplyKind::ErrorReport
        } else {
            ReplyKind::Unrelated
        };
    }

    if counts.qdcount() == query.header_counts().qdcount()
        && reply.question() == query.question()
    {
        ReplyKind::Answers
    } else {
        ReplyKind::Unrelated
    }
}

//------------ Late replies --------------------------------------------------

/// Waits for a matching reply on any of the kept sockets.
///
/// Resolves never when no sockets are kept.
async fn drain_late(
    late: &mut Vec<LateSocket>,
) -> (Message<Bytes>, SocketAddr, Instant) {
    if late.is_empty() {
        return std::future::pending().await;
    }
    let mut receivers: FuturesUnordered<_> = late
        .iter()
        .map(|entry| {
            let sock = entry.sock.clone();
            async move {
                let mut buf = vec![0u8; 4096];
                let n = sock.recv(&mut buf).await.ok()?;
                buf.truncate(n);
                Message::from_octets(Bytes::from(buf)).ok()
            }
        })
        .collect();

    loop {
        match receivers.next().await {
            Some(Some(answer)) => {
                // A late reply only completes the question when it is a
                // genuine answer to the attempt it belongs to; bare
                // error reports from a server that already timed out
                // are not worth acting on.
                if let Some(entry) = late.iter().find(|entry| {
                    answer.header().qr()
                        && answer.header().id() == entry.msg.header().id()
                        && matches!(
                            reply_kind(&answer, &entry.msg),
                            ReplyKind::Answers
                        )
                }) {
                    return (answer, entry.server, entry.sent);
                }
            }
            Some(None) => continue,
            None => return std::future::pending().await,
        }
    }
}

/// Produces the caller-facing reply with the original id restored.
fn deliver(answer: &Message<Bytes>, caller_id: u16) -> Message<Bytes> {
    let mut bytes = answer.as_slice().to_vec();
    bytes[..2].copy_from_slice(&caller_id.to_be_bytes());
    Message::from_octets(Bytes::from(bytes))
        .expect("reply already parsed once")
}

//============ Tests =========================================================
