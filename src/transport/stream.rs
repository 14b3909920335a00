//! Length-framed stream exchanges.
//!
//! Stream transports frame DNS messages with a two-octet length prefix
//! (RFC 1035 section 4.2.2) over TCP or TLS. Two shapes are offered: a
//! one-shot exchange used when a truncated UDP answer forces a TCP
//! retry, and a multiplexed [`Connection`] that owns a long-lived stream
//! and interleaves many concurrent queries over it, as the encrypted
//! transport does. Replies on a multiplexed connection may arrive in any
//! order; matching is by message id, which the transport rewrites to
//! avoid collisions and restores before delivery.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::Message;
use parking_lot::Mutex;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::QueryError;
use crate::transport::protocol::AsyncConnect;

/// Largest frame accepted from a server.
const MAX_FRAME: usize = u16::MAX as usize;

/// Capacity of the channel transporting requests to the driver.
const DEF_CHAN_CAP: usize = 8;

/// Upper bound of concurrently outstanding queries per connection.
const MAX_OUTSTANDING: usize = 64;

//------------ One-shot exchange ---------------------------------------------

/// Performs a single query over a fresh stream connection.
///
/// The connection is private to this query, so the first parseable
/// response frame carrying the query's id is the answer; the caller
/// classifies it.
pub(crate) async fn oneshot_query<Connect>(
    connect: &Connect,
    payload: &[u8],
    query: &Message<Vec<u8>>,
    deadline: Duration,
) -> Result<Message<Bytes>, QueryError>
where
    Connect: AsyncConnect,
    Connect::Connection: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = query.header().id();
    timeout(deadline, async {
        let mut stream = connect.connect().await?;
        write_frame(&mut stream, payload).await?;
        loop {
            let frame = read_frame(&mut stream).await?;
            let answer = match Message::from_octets(Bytes::from(frame)) {
                Ok(answer) => answer,
                Err(_) => continue,
            };
            if answer.header().qr() && answer.header().id() == id {
                return Ok(answer);
            }
        }
    })
    .await
    .unwrap_or(Err(QueryError::Timeout))
}

/// Writes one length-prefixed frame.
async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), QueryError> {
    if payload.len() > MAX_FRAME {
        return Err(QueryError::MessageSize);
    }
    let len = (payload.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<u8>, QueryError> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let len = u16::from_be_bytes(len) as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

//------------ Connection -----------------------------------------------------

/// A handle onto a multiplexed stream transport.
///
/// Cloning is cheap; all clones feed the same driver. Dropping the last
/// clone ends the driver once outstanding queries have completed.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    /// The sender half of the request channel.
    sender: mpsc::Sender<ChanReq>,
}

/// A request in flight to the driver.
struct ChanReq {
    /// The serialized query.
    payload: Vec<u8>,

    /// The message id the caller expects in the reply.
    caller_id: u16,

    /// Completion channel.
    sender: oneshot::Sender<Result<Message<Bytes>, QueryError>>,
}

impl Connection {
    /// Creates a connection handle and its driver.
    ///
    /// The driver future must be spawned; the connection is dead once it
    /// finishes.
    pub fn new<Stream>(stream: Stream) -> (Self, Driver<Stream>)
    where
        Stream: AsyncRead + AsyncWrite + Send,
    {
        let (sender, receiver) = mpsc::channel(DEF_CHAN_CAP);
        (Self { sender }, Driver { stream, receiver })
    }

    /// Sends one query and awaits the matching reply.
    ///
    /// `deadline` of `None` waits for as long as the connection lives.
    pub async fn request(
        &self,
        payload: Vec<u8>,
        caller_id: u16,
        deadline: Option<Duration>,
    ) -> Result<Message<Bytes>, QueryError> {
        let (tx, rx) = oneshot::channel();
        let req = ChanReq {
            payload,
            caller_id,
            sender: tx,
        };
        if self.sender.send(req).await.is_err() {
            return Err(QueryError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "stream transport closed",
            ))));
        }
        let response = async {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(QueryError::Io(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "stream transport closed",
                )))),
            }
        };
        match deadline {
            Some(deadline) => timeout(deadline, response)
                .await
                .unwrap_or(Err(QueryError::Timeout)),
            None => response.await,
        }
    }
}

//------------ Driver ---------------------------------------------------------

/// The task side of a multiplexed connection.
#[derive(Debug)]
pub(crate) struct Driver<Stream> {
    /// The underlying stream.
    stream: Stream,

    /// Incoming requests.
    receiver: mpsc::Receiver<ChanReq>,
}

/// The queries waiting for replies, keyed by wire id.
type Pending =
    Mutex<HashMap<u16, (u16, oneshot::Sender<Result<Message<Bytes>, QueryError>>)>>;

impl<Stream> Driver<Stream>
where
    Stream: AsyncRead + AsyncWrite + Send,
{
    /// Runs the transport until the connection fails or all handles are
    /// dropped and no queries remain outstanding.
    pub async fn run(self) {
        let (read, write) = tokio::io::split(self.stream);
        let pending: Pending = Mutex::new(HashMap::new());
        let mut receiver = self.receiver;

        let write_side = Self::write_loop(&pending, &mut receiver, write);
        let read_side = Self::read_loop(&pending, read);

        // Either side ending tears the connection down; outstanding
        // queries fail through the dropped oneshot senders.
        tokio::select! {
            _ = write_side => {}
            _ = read_side => {}
        }
    }

    /// Accepts requests and writes them to the stream.
    async fn write_loop(
        pending: &Pending,
        receiver: &mut mpsc::Receiver<ChanReq>,
        mut write: WriteHalf<Stream>,
    ) {
        while let Some(mut req) = receiver.recv().await {
            if req.payload.len() < 2 {
                let _ = req.sender.send(Err(QueryError::Malformed));
                continue;
            }
            let wire_id = match alloc_id(pending) {
                Some(id) => id,
                None => {
                    let _ = req.sender.send(Err(QueryError::Refused));
                    continue;
                }
            };
            req.payload[..2].copy_from_slice(&wire_id.to_be_bytes());
            pending
                .lock()
                .insert(wire_id, (req.caller_id, req.sender));
            if write_frame(&mut write, &req.payload).await.is_err() {
                pending.lock().remove(&wire_id);
                break;
            }
        }
    }

    /// Reads frames and completes the matching queries.
    async fn read_loop(pending: &Pending, mut read: ReadHalf<Stream>) {
        loop {
            let frame = match read_frame(&mut read).await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            if frame.len() < 2 {
                continue;
            }
            let wire_id = u16::from_be_bytes([frame[0], frame[1]]);
            let entry = pending.lock().remove(&wire_id);
            if let Some((caller_id, sender)) = entry {
                let mut frame = frame;
                frame[..2].copy_from_slice(&caller_id.to_be_bytes());
                let result = Message::from_octets(Bytes::from(frame))
                    .map_err(|_| QueryError::Malformed);
                let _ = sender.send(result);
            }
        }
    }
}

/// Picks an unused wire id, or `None` when too many queries are
/// outstanding.
fn alloc_id(pending: &Pending) -> Option<u16> {
    let pending = pending.lock();
    if pending.len() >= MAX_OUTSTANDING {
        return None;
    }
    loop {
        let id: u16 = rand::random();
        if !pending.contains_key(&id) {
            return Some(id);
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::{Rcode, Rtype};
    use domain::base::name::Name;
    use domain::base::MessageBuilder;
    use domain::base::ToName;
    use std::str::FromStr;
    use tokio::net::{TcpListener, TcpStream};

    fn build_query(name: &str, id: u16) -> Message<Vec<u8>> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(id);
        let mut builder = builder.question();
        builder
            .push((Name::<Vec<u8>>::from_str(name).unwrap(), Rtype::A))
            .unwrap();
        builder.into_message()
    }

    /// A server that answers frames out of order in pairs.
    async fn run_swapping_server(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = Vec::new();
        for _ in 0..2 {
            let frame = read_frame(&mut stream).await.unwrap();
            frames.push(frame);
        }
        frames.reverse();
        for frame in frames {
            let request = Message::from_octets(frame).unwrap();
            let builder = MessageBuilder::new_vec();
            let mut answer =
                builder.start_answer(&request, Rcode::NOERROR).unwrap();
            answer
                .push((
                    request
                        .sole_question()
                        .unwrap()
                        .qname()
                        .to_name::<Vec<u8>>(),
                    3600,
                    domain::rdata::A::from_octets(127, 0, 0, 1),
                ))
                .unwrap();
            let reply = answer.into_message();
            write_frame(&mut stream, reply.as_slice()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_callers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_swapping_server(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (conn, driver) = Connection::new(stream);
        tokio::spawn(driver.run());

        let q1 = build_query("one.example.com", 1111);
        let q2 = build_query("two.example.com", 2222);
        let (r1, r2) = tokio::join!(
            conn.request(q1.as_slice().to_vec(), 1111, None),
            conn.request(q2.as_slice().to_vec(), 2222, None),
        );
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        assert_eq!(r1.header().id(), 1111);
        assert_eq!(r1.question(), q1.question());
        assert_eq!(r2.header().id(), 2222);
        assert_eq!(r2.question(), q2.question());
    }

    #[tokio::test]
    async fn oneshot_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            let request = Message::from_octets(frame).unwrap();
            let reply = MessageBuilder::new_vec()
                .start_answer(&request, Rcode::NOERROR)
                .unwrap()
                .into_message();
            write_frame(&mut stream, reply.as_slice()).await.unwrap();
        });

        let query = build_query("tcp.example.com", 99);
        let answer = oneshot_query(
            &crate::transport::protocol::TcpConnect::new(addr),
            query.as_slice(),
            &query,
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert_eq!(answer.header().id(), 99);
    }
}
