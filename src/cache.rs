//! The per-network answer cache.
//!
//! Entries are keyed by (canonical name, qtype, qclass) and hold the raw
//! answer with a validity derived from the minimum TTL across its
//! records, clamped to configured bounds. Negative answers are cached
//! from the SOA minimum. Concurrent lookups for the same key coalesce
//! onto one upstream query: the first caller receives a [`Lease`] and
//! performs the query, everyone else waits on the slot and shares the
//! outcome. A recently expired entry can be served stale while one
//! caller refreshes it in the background.
//!
//! Transient errors are never stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::name::{Name, ToName};
use domain::base::Message;
use moka::future::Cache;
use octseq::Octets;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::{Clock, Elapsed, SystemClock};
use crate::error::QueryError;

/// Maximum number of entries kept per network.
const MAX_CACHE_ENTRIES: u64 = 10_000;

/// Longest time any answer is considered valid.
const MAX_TTL: Duration = Duration::from_secs(3600);

/// Shortest validity assigned to a cacheable answer.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Cap for negative answers.
const MAX_NEGATIVE_TTL: Duration = Duration::from_secs(600);

/// Window after expiry within which an entry may be served stale while a
/// refresh runs.
const STALE_WINDOW: Duration = Duration::from_secs(30);

//------------ CacheKey ------------------------------------------------------

/// The lookup key of one cached answer.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct CacheKey {
    /// The canonical (lower-cased) question name.
    qname: Name<Vec<u8>>,

    /// The question type.
    qtype: Rtype,

    /// The question class.
    qclass: Class,
}

impl CacheKey {
    /// Creates a key, canonicalizing the name.
    pub fn new(qname: &impl ToName, qtype: Rtype, qclass: Class) -> Self {
        Self {
            qname: qname.to_canonical_name(),
            qtype,
            qclass,
        }
    }

    /// Derives the key from a query message.
    ///
    /// Only plain queries with exactly one question on the Internet class
    /// are cacheable.
    pub fn from_message<Octs: AsRef<[u8]> + Octets>(
        msg: &Message<Octs>,
    ) -> Option<Self> {
        if msg.header().opcode() != Opcode::QUERY {
            return None;
        }
        let question = msg.sole_question().ok()?;
        if question.qclass() != Class::IN {
            return None;
        }
        Some(Self::new(
            &question.qname().to_name::<Vec<u8>>(),
            question.qtype(),
            question.qclass(),
        ))
    }
}

//------------ CacheFlags ----------------------------------------------------

/// Call-site cache behavior.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CacheFlags {
    /// Bypass reads.
    pub no_lookup: bool,

    /// Bypass writes. Implies that a stale entry is never refreshed on
    /// this call's behalf, and the call does not take part in
    /// coalescing.
    pub no_store: bool,
}

//------------ CacheOutcome --------------------------------------------------

/// What a cache lookup produced.
pub(crate) enum CacheOutcome<C: Clock = SystemClock> {
    /// A valid answer.
    Hit(Message<Bytes>),

    /// An expired answer within the stale window. When a lease is
    /// attached the caller should refresh in the background.
    Stale(Message<Bytes>, Option<Lease<C>>),

    /// Nothing usable; the caller must query upstream. A lease is
    /// attached unless the call bypasses storing.
    Miss(Option<Lease<C>>),

    /// Another caller's query for the same key completed first.
    Shared(Result<Message<Bytes>, QueryError>),

    /// The network was destroyed while waiting.
    Gone,
}

//------------ AnswerCache ---------------------------------------------------

/// The cache of one network.
pub(crate) struct AnswerCache<C: Clock = SystemClock> {
    /// Shared state, also referenced by leases.
    shared: Arc<Shared<C>>,
}

impl<C: Clock> Clone for AnswerCache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// State shared between the cache and outstanding leases.
struct Shared<C: Clock> {
    /// The answer store.
    store: Cache<CacheKey, Arc<Entry<C::Instant>>>,

    /// In-flight upstream queries by key.
    pending: Mutex<HashMap<CacheKey, watch::Receiver<SlotState>>>,

    /// Flipped to true exactly once, when the network is destroyed.
    destroyed: watch::Sender<bool>,

    /// Time source.
    clock: C,
}

/// The state distributed through a pending slot.
#[derive(Clone, Debug, Default)]
enum SlotState {
    /// The leader is still working.
    #[default]
    Waiting,

    /// The leader finished with this outcome.
    Done(Result<Message<Bytes>, QueryError>),
}

/// A stored answer.
#[derive(Debug)]
struct Entry<I> {
    /// The raw answer as received.
    message: Message<Bytes>,

    /// When the entry was stored.
    created: I,

    /// How long the entry is valid.
    validity: Duration,
}

impl<C: Clock> AnswerCache<C> {
    /// Creates an empty cache.
    pub fn new(clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Cache::new(MAX_CACHE_ENTRIES),
                pending: Mutex::new(HashMap::new()),
                destroyed: watch::channel(false).0,
                clock,
            }),
        }
    }

    /// Looks up a key, joining an in-flight query if one exists.
    ///
    /// The returned outcome tells the caller whether to answer from the
    /// cache, to query upstream under a lease, or to use the shared
    /// result of another caller. Waiting is unbounded here; callers
    /// bound it with their query deadline.
    pub async fn lookup(
        &self,
        key: &CacheKey,
        flags: CacheFlags,
    ) -> CacheOutcome<C> {
        loop {
            if *self.shared.destroyed.borrow() {
                return CacheOutcome::Gone;
            }

            if !flags.no_lookup {
                if let Some(entry) = self.shared.store.get(key).await {
                    let age = entry.created.elapsed();
                    if age <= entry.validity {
                        return CacheOutcome::Hit(entry.message.clone());
                    }
                    if age <= entry.validity + STALE_WINDOW
                        && !flags.no_store
                    {
                        let lease = self.try_lease(key);
                        return CacheOutcome::Stale(
                            entry.message.clone(),
                            lease,
                        );
                    }
                }
            }

            if flags.no_store {
                // The caller cannot fill a slot, so it neither leads
                // nor joins.
                return CacheOutcome::Miss(None);
            }

            let mut slot_rx = {
                let mut pending = self.shared.pending.lock();
                match pending.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(SlotState::Waiting);
                        pending.insert(key.clone(), rx);
                        return CacheOutcome::Miss(Some(Lease {
                            shared: self.shared.clone(),
                            key: key.clone(),
                            tx,
                        }));
                    }
                }
            };
            let mut destroyed_rx = self.shared.destroyed.subscribe();

            tokio::select! {
                changed = slot_rx.changed() => match changed {
                    Ok(()) => {
                        let state = slot_rx.borrow().clone();
                        if let SlotState::Done(result) = state {
                            return CacheOutcome::Shared(result);
                        }
                        // Spurious wake-up; take another pass.
                    }
                    Err(_) => {
                        // The leader went away without completing.
                        // Take another pass and possibly become the
                        // leader ourselves.
                    }
                },
                _ = destroyed_rx.changed() => {
                    return CacheOutcome::Gone;
                }
            }
        }
    }

    /// Creates a lease for a background refresh if none is in flight.
    fn try_lease(&self, key: &CacheKey) -> Option<Lease<C>> {
        if *self.shared.destroyed.borrow() {
            return None;
        }
        let mut pending = self.shared.pending.lock();
        if pending.contains_key(key) {
            return None;
        }
        let (tx, rx) = watch::channel(SlotState::Waiting);
        pending.insert(key.clone(), rx);
        Some(Lease {
            shared: self.shared.clone(),
            key: key.clone(),
            tx,
        })
    }

    /// Evicts all answers. Pending queries are left to complete and
    /// statistics are untouched.
    pub fn flush(&self) {
        self.shared.store.invalidate_all();
    }

    /// Marks the cache as destroyed and wakes all waiters.
    pub fn destroy(&self) {
        let _ = self.shared.destroyed.send(true);
        self.shared.pending.lock().clear();
        self.shared.store.invalidate_all();
    }
}

//------------ Lease ---------------------------------------------------------

/// The right and duty to fill one pending slot.
///
/// Dropping a lease without completing wakes waiters so one of them can
/// take over.
pub(crate) struct Lease<C: Clock = SystemClock> {
    /// The cache this lease belongs to.
    shared: Arc<Shared<C>>,

    /// The slot key.
    key: CacheKey,

    /// The slot's sender half.
    tx: watch::Sender<SlotState>,
}

impl<C: Clock> Lease<C> {
    /// Completes the slot with the query outcome.
    ///
    /// A cacheable answer is stored; the outcome is distributed to every
    /// waiter either way.
    pub async fn complete(
        self,
        result: Result<Message<Bytes>, QueryError>,
    ) {
        if let Ok(msg) = &result {
            let validity = validity(msg);
            if !validity.is_zero() && !*self.shared.destroyed.borrow() {
                let entry = Arc::new(Entry {
                    message: msg.clone(),
                    created: self.shared.clock.now(),
                    validity,
                });
                self.shared.store.insert(self.key.clone(), entry).await;
            }
        }
        // Remove the slot before waking so that a waiter that misses
        // the notification finds the stored entry on its next pass.
        self.shared.pending.lock().remove(&self.key);
        let _ = self.tx.send(SlotState::Done(result));
    }
}

impl<C: Clock> Drop for Lease<C> {
    fn drop(&mut self) {
        // After complete() this is a no-op; an abandoned lease frees the
        // slot and the dropped sender wakes the waiters.
        self.shared.pending.lock().remove(&self.key);
    }
}

//------------ Validity ------------------------------------------------------

/// Computes how long an answer may be cached.
///
/// Positive answers use the minimum TTL across the answer and authority
/// sections. Negative answers (NXDOMAIN and NODATA) use the SOA minimum
/// from the authority section and are capped harder; a negative answer
/// without a SOA is not cached at all. Anything else is not cached.
fn validity(msg: &Message<Bytes>) -> Duration {
    let rcode = msg.header().rcode();

    match rcode {
        Rcode::NOERROR | Rcode::NXDOMAIN => {}
        _ => return Duration::ZERO,
    }

    let negative = rcode == Rcode::NXDOMAIN || !has_answer_records(msg);

    if negative {
        match soa_negative_ttl(msg) {
            Some(ttl) => ttl.clamp(MIN_TTL, MAX_NEGATIVE_TTL),
            None => Duration::ZERO,
        }
    } else {
        match min_record_ttl(msg) {
            Some(ttl) => ttl.clamp(MIN_TTL, MAX_TTL),
            None => Duration::ZERO,
        }
    }
}

/// Returns whether the answer section holds a record matching the
/// question type.
fn has_answer_records(msg: &Message<Bytes>) -> bool {
    let Ok(question) = msg.sole_question() else {
        return false;
    };
    let Ok(answer) = msg.answer() else {
        return false;
    };
    for record in answer.flatten() {
        if record.rtype() == question.qtype()
            || record.rtype() == Rtype::CNAME
        {
            return true;
        }
    }
    false
}

/// Minimum TTL across answer and authority records.
fn min_record_ttl(msg: &Message<Bytes>) -> Option<Duration> {
    let mut min: Option<u32> = None;
    let answer = msg.answer().ok()?;
    for record in answer.flatten() {
        let secs = record.ttl().as_secs();
        min = Some(min.map_or(secs, |m| m.min(secs)));
    }
    if let Ok(Some(authority)) = msg.answer().ok()?.next_section() {
        for record in authority.flatten() {
            let secs = record.ttl().as_secs();
            min = Some(min.map_or(secs, |m| m.min(secs)));
        }
    }
    min.map(|secs| Duration::from_secs(secs as u64))
}

/// The negative TTL from the authority SOA, per RFC 2308: the smaller of
/// the SOA minimum field and the SOA record's own TTL.
fn soa_negative_ttl(msg: &Message<Bytes>) -> Option<Duration> {
    let authority = msg.authority().ok()?;
    for record in authority.limit_to::<domain::rdata::Soa<_>>().flatten() {
        let secs =
            record.ttl().as_secs().min(record.data().minimum().as_secs());
        return Some(Duration::from_secs(secs as u64));
    }
    None
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use domain::base::MessageBuilder;
    use domain::rdata::{Soa, A};
    use std::str::FromStr;

    fn name(s: &str) -> Name<Vec<u8>> {
        Name::from_str(s).unwrap()
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(&name(s), Rtype::A, Class::IN)
    }

    fn positive_answer(qname: &str, ttl: u32) -> Message<Bytes> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_qr(true);
        let mut q = builder.question();
        q.push((name(qname), Rtype::A)).unwrap();
        let mut a = q.answer();
        a.push((name(qname), ttl, A::from_octets(1, 2, 3, 4))).unwrap();
        let msg = a.into_message();
        Message::from_octets(Bytes::copy_from_slice(msg.as_slice())).unwrap()
    }

    fn negative_answer(qname: &str, soa_min: u32) -> Message<Bytes> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_qr(true);
        builder.header_mut().set_rcode(Rcode::NXDOMAIN);
        let mut q = builder.question();
        q.push((name(qname), Rtype::A)).unwrap();
        let mut auth = q.answer().authority();
        auth.push((
            name("example.com"),
            3600,
            Soa::new(
                name("ns.example.com"),
                name("admin.example.com"),
                7.into(),
                domain::base::Ttl::from_secs(100),
                domain::base::Ttl::from_secs(100),
                domain::base::Ttl::from_secs(100),
                domain::base::Ttl::from_secs(soa_min),
            ),
        ))
        .unwrap();
        let msg = auth.into_message();
        Message::from_octets(Bytes::copy_from_slice(msg.as_slice())).unwrap()
    }

    #[test]
    fn key_is_case_insensitive() {
        assert_eq!(key("Hello.Example.COM"), key("hello.example.com"));
    }

    #[test]
    fn negative_validity_uses_soa_minimum() {
        let v = validity(&negative_answer("gone.example.com", 60));
        assert_eq!(v, Duration::from_secs(60));
        // Capped by the negative limit.
        let v = validity(&negative_answer("gone.example.com", 86400));
        assert_eq!(v, MAX_NEGATIVE_TTL);
    }

    #[test]
    fn positive_validity_clamped() {
        assert_eq!(
            validity(&positive_answer("a.example.com", 30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            validity(&positive_answer("a.example.com", 999999)),
            MAX_TTL
        );
    }

    #[test]
    fn transient_error_is_not_cacheable() {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_qr(true);
        builder.header_mut().set_rcode(Rcode::SERVFAIL);
        let msg = builder.into_message();
        let msg =
            Message::from_octets(Bytes::copy_from_slice(msg.as_slice()))
                .unwrap();
        assert_eq!(validity(&msg), Duration::ZERO);
    }

    #[tokio::test]
    async fn waiters_share_the_leaders_answer() {
        let cache = AnswerCache::new(MockClock::new());
        let key = key("shared.example.com");

        let lease = match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Miss(Some(lease)) => lease,
            _ => panic!("expected a leading miss"),
        };

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache.lookup(&key, CacheFlags::default()).await
            })
        };
        // Give the waiter time to join the slot.
        tokio::task::yield_now().await;

        lease
            .complete(Ok(positive_answer("shared.example.com", 60)))
            .await;
        match waiter.await.unwrap() {
            CacheOutcome::Shared(Ok(msg)) => {
                assert_eq!(msg.header_counts().ancount(), 1)
            }
            CacheOutcome::Hit(msg) => {
                // The waiter may also have found the stored entry on a
                // later pass.
                assert_eq!(msg.header_counts().ancount(), 1)
            }
            _ => panic!("expected a shared answer"),
        }
    }

    #[tokio::test]
    async fn entries_expire_and_serve_stale() {
        let clock = MockClock::new();
        let cache = AnswerCache::new(clock.clone());
        let key = key("ttl.example.com");

        let lease = match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Miss(Some(lease)) => lease,
            _ => panic!("expected a leading miss"),
        };
        lease
            .complete(Ok(positive_answer("ttl.example.com", 60)))
            .await;
        cache.shared.store.run_pending_tasks().await;

        // Fresh.
        clock.advance(Duration::from_secs(30));
        assert!(matches!(
            cache.lookup(&key, CacheFlags::default()).await,
            CacheOutcome::Hit(_)
        ));

        // Expired but within the stale window: served with a refresh
        // lease attached.
        clock.advance(Duration::from_secs(45));
        match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Stale(_, Some(_)) => {}
            _ => panic!("expected stale with refresh lease"),
        }

        // Far beyond the window: a plain miss.
        clock.advance(Duration::from_secs(120));
        assert!(matches!(
            cache.lookup(&key, CacheFlags::default()).await,
            CacheOutcome::Miss(Some(_))
        ));
    }

    #[tokio::test]
    async fn no_store_bypasses_coalescing_and_refresh() {
        let clock = MockClock::new();
        let cache = AnswerCache::new(clock.clone());
        let key = key("nostore.example.com");

        let flags = CacheFlags {
            no_store: true,
            ..Default::default()
        };
        // No lease even though nothing is pending.
        assert!(matches!(
            cache.lookup(&key, flags).await,
            CacheOutcome::Miss(None)
        ));

        // A stale entry is not refreshed on behalf of a no-store caller.
        let lease = match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Miss(Some(lease)) => lease,
            _ => panic!(),
        };
        lease
            .complete(Ok(positive_answer("nostore.example.com", 10)))
            .await;
        cache.shared.store.run_pending_tasks().await;
        clock.advance(Duration::from_secs(20));
        assert!(matches!(
            cache.lookup(&key, flags).await,
            CacheOutcome::Miss(None)
        ));
    }

    #[tokio::test]
    async fn flush_keeps_pending_slots() {
        let cache = AnswerCache::new(MockClock::new());
        let key = key("flush.example.com");
        let _lease = match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Miss(Some(lease)) => lease,
            _ => panic!(),
        };
        cache.flush();
        assert!(cache.shared.pending.lock().contains_key(&key));
    }

    #[tokio::test]
    async fn destroy_wakes_waiters_with_gone() {
        let cache = AnswerCache::new(MockClock::new());
        let key = key("gone.example.com");

        let _lease = match cache.lookup(&key, CacheFlags::default()).await {
            CacheOutcome::Miss(Some(lease)) => lease,
            _ => panic!(),
        };
        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache.lookup(&key, CacheFlags::default()).await
            })
        };
        tokio::task::yield_now().await;

        cache.destroy();
        assert!(matches!(waiter.await.unwrap(), CacheOutcome::Gone));
    }
}
