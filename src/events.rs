//! Structured resolver events.
//!
//! Validation transitions, query results and NAT64 prefix changes are
//! fanned out to registered observers and appended to a fixed-size ring
//! buffer that backs the diagnostic dump.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use domain::base::iana::{Rcode, Rtype};
use parking_lot::Mutex;

use crate::dns64::Prefix64;
use crate::dot::Validation;

/// Number of records retained for the diagnostic dump.
const RING_CAPACITY: usize = 100;

//------------ Event ---------------------------------------------------------

/// A single resolver event.
#[derive(Clone, Debug)]
pub enum Event {
    /// A private-DNS server reached a terminal validation state.
    Validation {
        /// The owning network.
        netid: u32,
        /// The server address.
        server: SocketAddr,
        /// The provider hostname, if pinned.
        provider: Option<String>,
        /// The state reached.
        state: Validation,
    },

    /// A query completed, successfully or not.
    Query {
        /// The network the query ran on.
        netid: u32,
        /// The question name.
        qname: String,
        /// The question type.
        qtype: Rtype,
        /// The response code, absent when no answer arrived.
        rcode: Option<Rcode>,
        /// Wall time from dispatch to completion.
        latency: Duration,
        /// Number of records in the answer section.
        answers: u16,
    },

    /// A NAT64 prefix was installed or removed.
    Prefix64 {
        /// The owning network.
        netid: u32,
        /// The prefix, absent on removal.
        prefix: Option<Prefix64>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Validation {
                netid,
                server,
                provider,
                state,
            } => {
                write!(f, "net {} dot {} ", netid, server)?;
                if let Some(provider) = provider {
                    write!(f, "({}) ", provider)?;
                }
                write!(f, "validation {:?}", state)
            }
            Event::Query {
                netid,
                qname,
                qtype,
                rcode,
                latency,
                answers,
            } => {
                write!(
                    f,
                    "net {} query {} {} -> ",
                    netid, qname, qtype
                )?;
                match rcode {
                    Some(rcode) => write!(f, "{}", rcode)?,
                    None => write!(f, "no answer")?,
                }
                write!(f, " {} rr {} ms", answers, latency.as_millis())
            }
            Event::Prefix64 { netid, prefix } => match prefix {
                Some(prefix) => {
                    write!(f, "net {} prefix64 found {}", netid, prefix)
                }
                None => write!(f, "net {} prefix64 removed", netid),
            },
        }
    }
}

//------------ EventObserver -------------------------------------------------

/// Receives resolver events as they happen.
///
/// Observers are held weakly; dropping the registered object silently
/// unregisters it.
pub trait EventObserver: Send + Sync {
    /// Called for every published event.
    fn on_event(&self, event: &Event);
}

//------------ EventLog ------------------------------------------------------

/// The event fan-out point and ring buffer.
#[derive(Default)]
pub struct EventLog {
    /// Recent records, newest at the back.
    ring: Mutex<VecDeque<Record>>,

    /// Registered observers.
    observers: Mutex<Vec<Weak<dyn EventObserver>>>,
}

/// A timestamped event in the ring buffer.
#[derive(Clone, Debug)]
struct Record {
    /// When the event was published.
    at: SystemTime,

    /// The event itself.
    event: Event,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers an observer.
    pub fn register(&self, observer: &Arc<dyn EventObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    /// Publishes an event to observers and the ring buffer.
    pub fn publish(&self, event: Event) {
        tracing::debug!(%event, "resolver event");
        {
            let mut observers = self.observers.lock();
            observers.retain(|weak| match weak.upgrade() {
                Some(observer) => {
                    observer.on_event(&event);
                    true
                }
                None => false,
            });
        }
        let mut ring = self.ring.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(Record {
            at: SystemTime::now(),
            event,
        });
    }

    /// Renders the retained records, oldest first.
    pub fn dump(&self, target: &mut String) {
        use fmt::Write;

        let ring = self.ring.lock();
        for record in ring.iter() {
            let age = record
                .at
                .elapsed()
                .unwrap_or_default()
                .as_secs();
            let _ = writeln!(target, "  {:>6}s ago  {}", age, record.event);
        }
    }

    /// Number of retained records.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ring.lock().len()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl EventObserver for Counter {
        fn on_event(&self, _: &Event) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn query_event(n: u32) -> Event {
        Event::Query {
            netid: n,
            qname: "example.com".into(),
            qtype: Rtype::A,
            rcode: Some(Rcode::NOERROR),
            latency: Duration::from_millis(12),
            answers: 1,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let log = EventLog::new();
        for n in 0..250 {
            log.publish(query_event(n));
        }
        assert_eq!(log.len(), 100);
        let mut dump = String::new();
        log.dump(&mut dump);
        assert_eq!(dump.lines().count(), 100);
        // The oldest surviving record is number 150.
        assert!(dump.lines().next().unwrap().contains("net 150"));
    }

    #[test]
    fn dropped_observer_is_unregistered() {
        let log = EventLog::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let dyn_counter: Arc<dyn EventObserver> = counter.clone();
        log.register(&dyn_counter);
        log.publish(query_event(1));
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        drop(dyn_counter);
        drop(counter);
        log.publish(query_event(2));
        assert_eq!(log.observers.lock().len(), 0);
    }
}
