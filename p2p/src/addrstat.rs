//!
//! Long-term address reputation tracking.
//!
//! For every address we have seen reachable, a ring buffer counts
//! observations over the last [`WINDOW_COUNT`] windows of [`WINDOW`]
//! wall-clock time each, two weeks in total. The per-window cap keeps a
//! single chatty peer from inflating its own score faster than the
//! observation heartbeat allows. The score of an address is simply its
//! observation count over the whole horizon, and the selector favors one
//! end of the score-sorted table or the other depending on the caller's
//! bias.
//!
//! The tracker complements the address manager: below a quorum of
//! tracked addresses its selector returns nothing and the caller is
//! expected to fall back to the manager's.
#![warn(missing_docs)]
use std::io;
use std::net;

use bitcoin::consensus::{encode, Decodable, Encodable};

use peerbook_common::collections::{HashMap, HashSet};
use peerbook_common::endpoint;
use peerbook_common::time::{Clock, LocalDuration, LocalTime};

use crate::error::Error;

/// Length of a single reputation window.
pub const WINDOW: LocalDuration = LocalDuration::from_hours(6);
/// Number of windows kept per address; two weeks in total.
pub const WINDOW_COUNT: usize = 56;
/// Maximum number of addresses persisted.
pub const MAX_TRACKED: usize = 60_000;
/// How often connected peers are observed, in seconds.
pub const CHECK_INTERVAL: u64 = 321;
/// Minimum number of tracked addresses for [`AddressStats::select`] to
/// return anything.
pub const SELECT_QUORUM: usize = 3000;

/// Cap on the observations counted for one address within one window.
const WINDOW_CAP: i32 = (WINDOW.as_secs() / CHECK_INTERVAL) as i32;

/// Version of the serialized format.
const FORMAT_VERSION: i32 = 1;

/// Observation history of a single address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct History {
    /// Ring buffer of per-window observation counts.
    hits: Vec<i32>,
    /// Sum over all windows.
    count: i32,
}

impl History {
    fn new() -> Self {
        Self {
            hits: vec![0; WINDOW_COUNT],
            count: 0,
        }
    }
}

/// Tracks how often each address has been seen reachable.
#[derive(Debug)]
pub struct AddressStats<C> {
    /// Seed addresses, always reported with the maximum score.
    seeds: HashSet<net::IpAddr>,
    /// Observation histories.
    counters: HashMap<net::IpAddr, History>,
    /// All tracked addresses, lowest score first.
    sorted: Vec<net::IpAddr>,
    /// Ring position of the current window.
    index_pos: usize,
    /// Wall time at which the current window opened.
    index_time: LocalTime,
    rng: fastrand::Rng,
    clock: C,
}

impl<C: Clock> AddressStats<C> {
    /// Create a new, empty reputation tracker.
    ///
    /// The seed list is the node's read-only bootstrap table; seed
    /// addresses never decay.
    pub fn new(seeds: impl IntoIterator<Item = net::IpAddr>, rng: fastrand::Rng, clock: C) -> Self {
        let mut seed_set = HashSet::with_hasher(rng.clone().into());
        seed_set.extend(seeds);

        Self {
            seeds: seed_set,
            counters: HashMap::with_hasher(rng.clone().into()),
            sorted: Vec::new(),
            index_pos: 0,
            index_time: clock.local_time(),
            rng,
            clock,
        }
    }

    /// The number of addresses currently tracked.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether any addresses are tracked.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Roll the current window forward to the given time.
    ///
    /// Each window rolled subtracts its previous contents from every
    /// address's score; addresses whose score reaches zero are dropped.
    pub fn advance(&mut self, now: LocalTime) {
        let mut rolled = false;

        while now - self.index_time >= WINDOW {
            self.index_pos = (self.index_pos + 1) % WINDOW_COUNT;
            self.index_time = self.index_time + WINDOW;
            rolled = true;

            for history in self.counters.values_mut() {
                history.count -= history.hits[self.index_pos];
                history.hits[self.index_pos] = 0;
            }
        }
        if rolled {
            self.counters.retain(|addr, history| {
                if history.count <= 0 {
                    log::trace!(target: "addrstat", "expired {}", addr);
                    false
                } else {
                    true
                }
            });
            self.rebuild();
        }
    }

    /// Record that an address was seen reachable.
    ///
    /// The contribution of a single address within one window is capped,
    /// so that being observed on every heartbeat is the best any peer
    /// can do.
    pub fn observe(&mut self, addr: &net::IpAddr, hits: i32) {
        self.advance(self.clock.local_time());

        let hits = hits.max(0);

        if !self.counters.contains_key(addr) {
            let mut history = History::new();
            history.hits[self.index_pos] = 1;
            history.count = 1;

            self.counters.insert(*addr, history);
            // Fresh addresses start at the bottom of the pile.
            self.sorted.insert(0, *addr);
        }
        let index_pos = self.index_pos;
        let history = self.counters.get_mut(addr).expect("entry was just ensured");

        if history.hits[index_pos] < WINDOW_CAP {
            history.hits[index_pos] += hits;
            history.count += hits;
        }
    }

    /// Knock a misbehaving address back down without forgetting it.
    pub fn reset(&mut self, addr: &net::IpAddr) {
        if let Some(history) = self.counters.get_mut(addr) {
            if history.count <= 2 {
                return;
            }
            for cell in history.hits.iter_mut() {
                *cell = 0;
            }
            history.hits[self.index_pos] = 2;
            history.count = 2;

            log::debug!(target: "addrstat", "reset history of {}", addr);
        }
    }

    /// The reputation score of an address: its observation count over
    /// the whole horizon. Seed addresses score maximally, unknown ones
    /// zero.
    pub fn score(&mut self, addr: &net::IpAddr) -> i32 {
        self.advance(self.clock.local_time());

        if self.seeds.contains(addr) {
            return i32::MAX / 2;
        }
        self.counters.get(addr).map_or(0, |history| history.count)
    }

    /// Pick an address, biased along the score-sorted table.
    ///
    /// `new_bias` (0 to 100) shifts weight between the well-known end
    /// and the rarely-seen end of the table. Returns `None` below a
    /// quorum of tracked addresses; the caller is expected to fall back
    /// to the address manager's selector.
    pub fn select(&mut self, new_bias: u32) -> Option<net::IpAddr> {
        let count = self.sorted.len();
        if count < SELECT_QUORUM {
            return None;
        }
        let bias = f64::from(new_bias.min(100));
        let u = self.rng.f64();
        let weight = if u > 0.5 {
            (bias + (100. - bias) * 2. * (u - 0.5)) / 100.
        } else {
            bias * 2. * u / 100.
        };
        let ix = ((count - 1) as f64 * weight) as usize;

        self.sorted.get(ix).copied()
    }

    /// Rebuild the score-sorted view, lowest first.
    fn rebuild(&mut self) {
        let mut scored = self
            .counters
            .iter()
            .map(|(addr, history)| (history.count, *addr))
            .collect::<Vec<_>>();
        scored.sort_by_key(|(count, _)| *count);

        self.sorted = scored.into_iter().map(|(_, addr)| addr).collect();
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Write the tracker to the given stream: version, entry count, ring
    /// position and window open time, then per address the 16-byte
    /// mapped form and its [`WINDOW_COUNT`] cells.
    ///
    /// When more than [`MAX_TRACKED`] addresses are tracked, the
    /// lowest-scoring ones are dropped from the stream to fit.
    pub fn encode<W: io::Write>(&self, mut w: W) -> Result<usize, Error> {
        let mut len = 0;
        let tracked = self.sorted.len().min(MAX_TRACKED);

        len += FORMAT_VERSION.consensus_encode(&mut w)?;
        len += (tracked as u32).consensus_encode(&mut w)?;
        len += (self.index_pos as i32).consensus_encode(&mut w)?;
        len += (self.index_time.as_secs() as i64).consensus_encode(&mut w)?;

        for addr in self.sorted[self.sorted.len() - tracked..].iter() {
            let history = &self.counters[addr];

            len += endpoint::to_mapped(addr).consensus_encode(&mut w)?;
            for cell in history.hits.iter() {
                len += cell.consensus_encode(&mut w)?;
            }
        }
        Ok(len)
    }

    /// Replace the contents of this tracker with a store read from the
    /// given stream. Scores and the sorted view are recomputed from the
    /// ring buffers.
    pub fn decode<D: io::Read>(&mut self, mut d: D) -> Result<(), Error> {
        let version = i32::consensus_decode(&mut d)?;
        if version != FORMAT_VERSION {
            return Err(encode::Error::ParseFailed("unknown address statistics version").into());
        }
        let n_addr = u32::consensus_decode(&mut d)? as usize;
        let index_pos = i32::consensus_decode(&mut d)?;
        let index_time = i64::consensus_decode(&mut d)?;

        if index_pos < 0 || index_pos as usize >= WINDOW_COUNT {
            return Err(encode::Error::ParseFailed("window index out of range").into());
        }
        self.index_pos = index_pos as usize;
        self.index_time = LocalTime::from_secs(index_time.max(0) as u64);
        self.counters.clear();

        for _ in 0..n_addr {
            let addr = endpoint::from_mapped(<[u8; 16]>::consensus_decode(&mut d)?);
            let mut history = History::new();

            for cell in history.hits.iter_mut() {
                *cell = i32::consensus_decode(&mut d)?;
            }
            history.count = history.hits.iter().sum();
            self.counters.insert(addr, history);
        }
        self.rebuild();

        log::debug!(
            target: "addrstat",
            "loaded statistics for {} address(es)",
            self.counters.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck_macros::quickcheck;

    use peerbook_common::time::RefClock;

    const BASE: u64 = 1_600_000_000;

    fn tracker(seed: u64) -> (AddressStats<RefClock<LocalTime>>, RefClock<LocalTime>) {
        let clock = RefClock::from(LocalTime::from_secs(BASE));
        let rng = fastrand::Rng::with_seed(seed);

        (AddressStats::new(vec![], rng, clock.clone()), clock)
    }

    fn ip(octets: [u8; 4]) -> net::IpAddr {
        net::IpAddr::V4(net::Ipv4Addr::from(octets))
    }

    #[test]
    fn test_observe_is_capped() {
        let (mut stats, _clock) = tracker(1);
        let addr = ip([88, 1, 2, 3]);

        for _ in 0..100 {
            stats.observe(&addr, 1);
        }
        assert!(stats.score(&addr) >= 1);
        assert!(stats.score(&addr) <= WINDOW_CAP);
    }

    #[test]
    fn test_full_horizon_expiry() {
        let (mut stats, clock) = tracker(2);
        let addr = ip([88, 1, 2, 3]);

        stats.observe(&addr, 1);
        assert!(stats.score(&addr) > 0);

        // With no further observations, rolling past the whole horizon
        // forgets everything.
        clock.elapse(WINDOW * WINDOW_COUNT as u32);
        assert_eq!(stats.score(&addr), 0);
        assert!(stats.is_empty());
        assert!(stats.sorted.is_empty());
    }

    #[test]
    fn test_windows_age_out_gradually() {
        let (mut stats, clock) = tracker(3);
        let addr = ip([88, 1, 2, 3]);

        stats.observe(&addr, 1);
        let first = stats.score(&addr);

        // Half the horizon later the score is still there...
        clock.elapse(WINDOW * (WINDOW_COUNT as u32 / 2));
        assert_eq!(stats.score(&addr), first);

        // ...and observing again extends the entry's life.
        stats.observe(&addr, 1);
        clock.elapse(WINDOW * (WINDOW_COUNT as u32 / 2));
        assert!(stats.score(&addr) > 0);

        clock.elapse(WINDOW * WINDOW_COUNT as u32);
        assert_eq!(stats.score(&addr), 0);
    }

    #[test]
    fn test_reset() {
        let (mut stats, _clock) = tracker(4);
        let addr = ip([77, 4, 5, 6]);

        for _ in 0..8 {
            stats.observe(&addr, 1);
        }
        assert!(stats.score(&addr) > 2);

        stats.reset(&addr);
        assert_eq!(stats.score(&addr), 2);

        // Already-low scores are left alone.
        stats.reset(&addr);
        assert_eq!(stats.score(&addr), 2);

        // Unknown addresses are a no-op.
        stats.reset(&ip([1, 2, 3, 4]));
    }

    #[test]
    fn test_seed_scores() {
        let clock = RefClock::from(LocalTime::from_secs(BASE));
        let seed = ip([13, 37, 1, 1]);
        let mut stats = AddressStats::new(
            vec![seed],
            fastrand::Rng::with_seed(5),
            clock,
        );

        assert_eq!(stats.score(&seed), i32::MAX / 2);
        assert_eq!(stats.score(&ip([13, 37, 1, 2])), 0);

        // Observations don't change a seed's reported score.
        stats.observe(&seed, 1);
        assert_eq!(stats.score(&seed), i32::MAX / 2);
    }

    #[test]
    fn test_select_quorum() {
        let (mut stats, _clock) = tracker(6);

        for i in 0..SELECT_QUORUM as u32 - 1 {
            stats.observe(&ip([10 + (i / 250) as u8 % 200, (i % 250) as u8, 1, 1]), 1);
        }
        assert_eq!(stats.select(50), None, "below quorum nothing is selected");

        stats.observe(&ip([250, 250, 1, 1]), 1);
        for _ in 0..32 {
            let selected = stats.select(50).unwrap();
            assert!(stats.counters.contains_key(&selected));
        }
    }

    #[test]
    fn test_encode_decode() {
        let (mut stats, clock) = tracker(7);

        for i in 0..500u32 {
            let addr = ip([20 + (i / 250) as u8, (i % 250) as u8, 3, 3]);
            for _ in 0..=i % 5 {
                stats.observe(&addr, 1);
            }
            if i % 50 == 0 {
                clock.elapse(WINDOW);
            }
        }
        let mut bytes = Vec::new();
        stats.encode(&mut bytes).unwrap();

        let (mut copy, _) = tracker(8);
        let mut cursor = io::Cursor::new(&bytes);
        copy.decode(&mut cursor).unwrap();

        assert_eq!(cursor.position() as usize, bytes.len(), "whole stream is read");
        assert_eq!(copy.counters, stats.counters);
        assert_eq!(copy.index_pos, stats.index_pos);
        assert_eq!(copy.index_time.as_secs(), stats.index_time.as_secs());
        assert_eq!(copy.sorted.len(), stats.sorted.len());
    }

    #[test]
    fn test_decode_bad_version() {
        let (mut stats, _clock) = tracker(9);
        stats.observe(&ip([20, 1, 3, 3]), 1);

        let mut bytes = Vec::new();
        stats.encode(&mut bytes).unwrap();
        bytes[0] = 9;

        let (mut copy, _) = tracker(10);
        assert!(matches!(copy.decode(&bytes[..]), Err(Error::Encode(_))));
    }

    #[quickcheck]
    fn prop_scores_match_windows(ops: Vec<(u8, u8, bool)>, seed: u64) -> bool {
        let (mut stats, clock) = tracker(seed);

        for (a, b, roll) in ops {
            stats.observe(&ip([a, b, 1, 1]), 1);
            if roll {
                clock.elapse(WINDOW);
            }
        }
        stats.advance(clock.local_time());

        // Every tracked address's count matches its ring buffer, is
        // positive, and appears in the sorted view.
        stats.counters.iter().all(|(addr, history)| {
            history.count == history.hits.iter().sum::<i32>()
                && history.count > 0
                && stats.sorted.contains(addr)
        }) && stats.sorted.len() == stats.counters.len()
    }
}
