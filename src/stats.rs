//! Per-server statistics and selection order.
//!
//! Every attempt against a cleartext server reports one sample: a success
//! with its round-trip time, a retriable server error, a timeout, or an
//! internal error (socket or connect failure). Samples age out after the
//! configured validity and the window is bounded, so a server that was
//! broken an hour ago is not punished forever. Selection puts unusable
//! servers last but never drops them entirely; if every server looks
//! unusable, insertion order is used so no server is permanently
//! blackholed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use crate::clock::{Clock, Elapsed, SystemClock};
use crate::config::ResolverParams;

//------------ SampleOutcome -------------------------------------------------

/// The outcome of one attempt against one server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SampleOutcome {
    /// A usable answer arrived. Negative answers count here too: a server
    /// that authoritatively reports NXDOMAIN is doing its job.
    Success,

    /// The server answered with a retriable error code.
    Error,

    /// No answer before the per-server deadline.
    Timeout,

    /// The socket could not be created, bound or connected.
    InternalError,
}

//------------ Counts --------------------------------------------------------

/// Aggregated valid samples for one server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counts {
    pub successes: u32,
    pub errors: u32,
    pub timeouts: u32,
    pub internal_errors: u32,
}

impl Counts {
    /// Total number of valid samples.
    pub fn total(&self) -> u32 {
        self.successes + self.errors + self.timeouts + self.internal_errors
    }
}

//------------ ServerStats ---------------------------------------------------

/// The sample window of a single server.
#[derive(Clone, Debug)]
struct ServerStats<C: Clock> {
    /// Recorded samples, oldest at the front.
    samples: VecDeque<Sample<C::Instant>>,
}

/// One recorded sample.
#[derive(Clone, Debug)]
struct Sample<I> {
    /// What happened.
    outcome: SampleOutcome,

    /// Round-trip time for successful attempts.
    rtt: Option<Duration>,

    /// When the sample was recorded.
    at: I,
}

impl<C: Clock> ServerStats<C> {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Records a sample, bounding the window to `max_samples`.
    fn record(
        &mut self,
        outcome: SampleOutcome,
        rtt: Option<Duration>,
        at: C::Instant,
        params: &ResolverParams,
    ) {
        while self.samples.len() >= params.max_samples as usize {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { outcome, rtt, at });
    }

    /// Counts samples still within the validity window.
    fn counts(&self, params: &ResolverParams) -> Counts {
        let validity = Duration::from_secs(params.sample_validity_sec as u64);
        let mut counts = Counts::default();
        for sample in &self.samples {
            if sample.at.elapsed() > validity {
                continue;
            }
            match sample.outcome {
                SampleOutcome::Success => counts.successes += 1,
                SampleOutcome::Error => counts.errors += 1,
                SampleOutcome::Timeout => counts.timeouts += 1,
                SampleOutcome::InternalError => counts.internal_errors += 1,
            }
        }
        counts
    }

    /// Returns whether the server is usable.
    ///
    /// A server with fewer than `min_samples` valid samples is given the
    /// benefit of the doubt.
    fn usable(&self, params: &ResolverParams) -> bool {
        let counts = self.counts(params);
        if counts.total() < params.min_samples {
            return true;
        }
        counts.successes * 100 >= params.success_threshold * counts.total()
    }

    /// Average round-trip time of valid successful samples.
    fn rtt_average(&self, params: &ResolverParams) -> Option<Duration> {
        let validity = Duration::from_secs(params.sample_validity_sec as u64);
        let mut sum = Duration::ZERO;
        let mut n = 0u32;
        for sample in &self.samples {
            if sample.at.elapsed() > validity {
                continue;
            }
            if let Some(rtt) = sample.rtt {
                sum += rtt;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some(sum / n)
        }
    }
}

//------------ NetworkStats --------------------------------------------------

/// The statistics of all cleartext servers of one network.
///
/// Reports carry the revision id of the configuration they were dispatched
/// under; a report whose revision does not match the current one is
/// dropped so that samples from a superseded configuration cannot land on
/// the wrong server set.
#[derive(Debug)]
pub(crate) struct NetworkStats<C: Clock = SystemClock> {
    /// Revision id of the server set below.
    revision: u64,

    /// Per-server windows in insertion order.
    servers: Vec<(SocketAddr, ServerStats<C>)>,

    /// Time source.
    clock: C,
}

impl<C: Clock> NetworkStats<C> {
    /// Creates empty statistics.
    pub fn new(clock: C) -> Self {
        Self {
            revision: 0,
            servers: Vec::new(),
            clock,
        }
    }

    /// Installs a new server set under a new revision.
    ///
    /// Windows are kept for servers that appear in both the old and the
    /// new set when `preserve` is true, and discarded wholesale otherwise.
    pub fn install(
        &mut self,
        revision: u64,
        servers: &[SocketAddr],
        preserve: bool,
    ) {
        let mut old = std::mem::take(&mut self.servers);
        self.revision = revision;
        self.servers = servers
            .iter()
            .map(|addr| {
                let stats = if preserve {
                    old.iter_mut()
                        .find(|(a, _)| a == addr)
                        .map(|(_, s)| std::mem::replace(s, ServerStats::new()))
                        .unwrap_or_else(ServerStats::new)
                } else {
                    ServerStats::new()
                };
                (*addr, stats)
            })
            .collect();
    }

    /// Records a sample if `revision` still matches.
    pub fn report(
        &mut self,
        revision: u64,
        server: SocketAddr,
        outcome: SampleOutcome,
        rtt: Option<Duration>,
        params: &ResolverParams,
    ) {
        if revision != self.revision {
            tracing::debug!(
                server = %server,
                "dropping stats sample from superseded configuration"
            );
            return;
        }
        let at = self.clock.now();
        if let Some((_, stats)) =
            self.servers.iter_mut().find(|(a, _)| *a == server)
        {
            stats.record(outcome, rtt, at, params);
        }
    }

    /// Returns the servers in the order the dispatcher should try them.
    pub fn ordered(
        &self,
        params: &ResolverParams,
        sort_by_score: bool,
    ) -> Vec<SocketAddr> {
        let mut scored: Vec<(usize, SocketAddr, bool, Duration)> = self
            .servers
            .iter()
            .enumerate()
            .map(|(idx, (addr, stats))| {
                let usable = stats.usable(params);
                let rtt = stats
                    .rtt_average(params)
                    .unwrap_or(Duration::from_millis(u32::MAX as u64));
                (idx, *addr, usable, rtt)
            })
            .collect();

        if scored.iter().all(|(_, _, usable, _)| !usable) {
            // Everything looks broken; fall back to insertion order so
            // every server still gets tried.
            return scored.into_iter().map(|(_, addr, _, _)| addr).collect();
        }

        if sort_by_score {
            scored.sort_by_key(|&(idx, _, usable, rtt)| (!usable, rtt, idx));
        } else {
            scored.sort_by_key(|&(idx, _, usable, _)| (!usable, idx));
        }
        scored.into_iter().map(|(_, addr, _, _)| addr).collect()
    }

    /// Current revision id.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Snapshot for the diagnostic dump.
    pub fn snapshot(&self, params: &ResolverParams) -> Vec<ServerSnapshot> {
        self.servers
            .iter()
            .map(|(addr, stats)| {
                let counts = stats.counts(params);
                ServerSnapshot {
                    server: *addr,
                    counts,
                    usable: stats.usable(params),
                    rtt_average: stats.rtt_average(params),
                }
            })
            .collect()
    }
}

//------------ ServerSnapshot ------------------------------------------------

/// A point-in-time view of one server's statistics.
#[derive(Clone, Debug)]
pub struct ServerSnapshot {
    /// The server address.
    pub server: SocketAddr,

    /// Valid sample counts.
    pub counts: Counts,

    /// Whether the server is currently considered usable.
    pub usable: bool,

    /// Average recent round-trip time.
    pub rtt_average: Option<Duration>,
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn params() -> ResolverParams {
        ResolverParams {
            min_samples: 2,
            max_samples: 8,
            success_threshold: 75,
            sample_validity_sec: 1800,
            ..Default::default()
        }
    }

    fn stats_with(
        clock: MockClock,
        servers: &[SocketAddr],
    ) -> NetworkStats<MockClock> {
        let mut stats = NetworkStats::new(clock);
        stats.install(1, servers, false);
        stats
    }

    #[test]
    fn failing_server_moves_back() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let b = addr("127.0.0.4:53");
        let mut stats = stats_with(clock, &[a, b]);
        let p = params();

        for _ in 0..4 {
            stats.report(1, a, SampleOutcome::Timeout, None, &p);
            stats.report(
                1,
                b,
                SampleOutcome::Success,
                Some(Duration::from_millis(5)),
                &p,
            );
        }
        assert_eq!(stats.ordered(&p, false), vec![b, a]);
    }

    #[test]
    fn all_unusable_keeps_insertion_order() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let b = addr("127.0.0.4:53");
        let mut stats = stats_with(clock, &[a, b]);
        let p = params();

        for _ in 0..4 {
            stats.report(1, a, SampleOutcome::Timeout, None, &p);
            stats.report(1, b, SampleOutcome::InternalError, None, &p);
        }
        assert_eq!(stats.ordered(&p, true), vec![a, b]);
    }

    #[test]
    fn stale_samples_do_not_count() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let mut stats = stats_with(clock.clone(), &[a]);
        let p = params();

        for _ in 0..4 {
            stats.report(1, a, SampleOutcome::Timeout, None, &p);
        }
        let snap = &stats.snapshot(&p)[0];
        assert!(!snap.usable);

        clock.advance(Duration::from_secs(1801));
        let snap = &stats.snapshot(&p)[0];
        assert_eq!(snap.counts.total(), 0);
        assert!(snap.usable);
    }

    #[test]
    fn window_is_bounded() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let mut stats = stats_with(clock, &[a]);
        let p = params();

        for _ in 0..100 {
            stats.report(
                1,
                a,
                SampleOutcome::Success,
                Some(Duration::from_millis(1)),
                &p,
            );
        }
        let snap = &stats.snapshot(&p)[0];
        assert_eq!(snap.counts.total(), p.max_samples);
    }

    #[test]
    fn stale_revision_report_dropped() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let mut stats = stats_with(clock, &[a]);
        let p = params();

        stats.report(0, a, SampleOutcome::Timeout, None, &p);
        assert_eq!(stats.snapshot(&p)[0].counts.total(), 0);
    }

    #[test]
    fn unchanged_set_preserves_windows() {
        let clock = MockClock::new();
        let a = addr("127.0.0.3:53");
        let b = addr("127.0.0.4:53");
        let mut stats = stats_with(clock, &[a, b]);
        let p = params();

        stats.report(
            1,
            a,
            SampleOutcome::Success,
            Some(Duration::from_millis(3)),
            &p,
        );
        stats.install(2, &[a, b], true);
        assert_eq!(stats.snapshot(&p)[0].counts.successes, 1);

        stats.install(3, &[a], false);
        assert_eq!(stats.snapshot(&p)[0].counts.total(), 0);
    }
}
