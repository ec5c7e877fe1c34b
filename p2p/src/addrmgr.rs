//!
//! The stochastic peer-to-peer address manager.
//!
//! Design goals:
//!
//! * Keep a bounded number of addresses around, so that the address store
//!   and memory requirements do not grow without bound.
//! * Keep all tables in memory, and let the surrounding node dump the
//!   entire store asynchronously through [`AddressManager::encode`].
//! * Make sure no (localized) attacker can fill the entire table with
//!   addresses they control.
//!
//! To that end, addresses are organized into buckets:
//!
//! * Addresses that have not yet been tried go into 256 *new* buckets.
//!   The bucket is picked from 32 candidates determined by the network
//!   group of the peer that told us about the address; which of the 32 is
//!   determined by the address's own group. A single address can occur in
//!   up to four different new buckets, to increase selection chances for
//!   addresses that are seen frequently; the chance of gaining
//!   multiplicity decreases with each bucket occupied.
//! * Addresses of peers we have connected to go into 64 *tried* buckets,
//!   four of which are selected by the address's network group. Tried
//!   entries are never deleted outright; when a bucket overflows, the
//!   displaced entry is evicted back into a new bucket.
//! * All bucket selection is keyed by a secret 256-bit value, so the
//!   placement of any given address is not observable by adversaries.
//!
//! Several indexes are kept over the same entries for constant-time
//! sampling. Enabling the `check` cargo feature verifies their agreement
//! after every public mutation.
#![warn(missing_docs)]
use std::convert::TryInto;
use std::io;
use std::net;

use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin_hashes::{sha256d, Hash, HashEngine};

use peerbook_common::collections::{HashMap, HashSet};
use peerbook_common::endpoint::{self, Endpoint};
use peerbook_common::time::{Clock, LocalDuration, LocalTime, Timestamp};

use crate::error::Error;

/// Total number of buckets for tried addresses.
pub const TRIED_BUCKET_COUNT: usize = 64;
/// Maximum number of entries in a tried bucket.
pub const TRIED_BUCKET_SIZE: usize = 64;
/// Total number of buckets for new addresses.
pub const NEW_BUCKET_COUNT: usize = 256;
/// Maximum number of entries in a new bucket.
pub const NEW_BUCKET_SIZE: usize = 64;
/// Over how many tried buckets entries from a single network group are
/// spread.
pub const TRIED_BUCKETS_PER_GROUP: u64 = 4;
/// Over how many new buckets entries from a single source group are
/// spread.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 32;
/// In how many new buckets a single address may occur.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 4;
/// How old addresses can maximally be.
pub const HORIZON: LocalDuration = LocalDuration::from_days(30);
/// After how many failed attempts we give up on a new address.
pub const RETRIES: u32 = 3;
/// How many successive failures are allowed...
pub const MAX_FAILURES: u32 = 10;
/// ... in at least this much time.
pub const MIN_FAIL_INTERVAL: LocalDuration = LocalDuration::from_days(7);
/// The maximum percentage of addresses returned by [`AddressManager::get_addr`].
pub const GETADDR_MAX_PCT: usize = 23;
/// The maximum number of addresses returned by [`AddressManager::get_addr`].
pub const GETADDR_MAX: usize = 2500;

/// How much fresher an advertised time must be to replace the stored one.
const UPDATE_INTERVAL: LocalDuration = LocalDuration::from_mins(60);
/// How often the advertised time of a connected peer is refreshed.
const CONNECTED_INTERVAL: LocalDuration = LocalDuration::from_mins(20);
/// How far into the future an advertised time may lie.
const FUTURE_MARGIN: LocalDuration = LocalDuration::from_mins(10);

/// Version byte of the serialized format.
const FORMAT_VERSION: u8 = 0;

// Domain separation tags for the keyed bucket hash.
const TRIED_SPREAD_TAG: u8 = 1;
const TRIED_BUCKET_TAG: u8 = 2;
const NEW_SPREAD_TAG: u8 = 3;
const NEW_BUCKET_TAG: u8 = 4;

/// Secret key randomizing bucket placement. Generated from a
/// cryptographic source by the caller, once per fresh store.
pub type Key = [u8; 32];

/// Internal entry identifier. All indexes are keyed by id, never by
/// reference.
type Id = u32;

/// Double-SHA256 of the tag byte, the key and the given parts,
/// truncated to 64 bits.
fn hash64(key: &Key, tag: u8, parts: &[&[u8]]) -> u64 {
    let mut engine = sha256d::Hash::engine();

    engine.input(&[tag]);
    engine.input(&key[..]);
    for part in parts {
        engine.input(part);
    }
    let hash = sha256d::Hash::from_engine(engine).into_inner();

    u64::from_le_bytes(hash[..8].try_into().expect("hash is at least 8 bytes"))
}

/// An endpoint together with everything we know about it.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    /// The endpoint itself.
    pub addr: Endpoint,
    /// Where knowledge about this address first came from.
    pub source: net::IpAddr,
    /// Last successful connection by us.
    pub last_success: Option<LocalTime>,
    /// Last connection attempt by us.
    pub last_try: Option<LocalTime>,
    /// Connection attempts since the last successful attempt.
    pub attempts: u32,

    /// Reference count in new buckets (memory only).
    ref_count: u32,
    /// In the tried table? (memory only)
    in_tried: bool,
    /// Position in the random vector (memory only).
    random_pos: usize,
}

impl AddrInfo {
    fn new(addr: Endpoint, source: net::IpAddr) -> Self {
        Self {
            addr,
            source,
            last_success: None,
            last_try: None,
            attempts: 0,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        }
    }

    /// Whether this entry has graduated to the tried table.
    pub fn is_tried(&self) -> bool {
        self.in_tried
    }

    /// Calculate in which tried bucket this entry belongs.
    ///
    /// The full address picks one of [`TRIED_BUCKETS_PER_GROUP`] slots;
    /// the address group maps each slot to a concrete bucket. A single
    /// group can therefore never occupy more than four tried buckets.
    fn tried_bucket(&self, key: &Key) -> usize {
        let ip = endpoint::to_mapped(&self.addr.ip);
        let port = self.addr.port.to_le_bytes();
        let spread = hash64(key, TRIED_SPREAD_TAG, &[&ip, &port]) % TRIED_BUCKETS_PER_GROUP;
        let group = endpoint::group(&self.addr.ip);

        (hash64(key, TRIED_BUCKET_TAG, &[&group, &spread.to_le_bytes()])
            % TRIED_BUCKET_COUNT as u64) as usize
    }

    /// Calculate in which new bucket this entry belongs, given the source
    /// that reported it.
    ///
    /// The address and source groups together pick one of
    /// [`NEW_BUCKETS_PER_SOURCE_GROUP`] slots; the source group maps each
    /// slot to a concrete bucket. A single source group can therefore
    /// never occupy more than 32 new buckets.
    fn new_bucket(&self, key: &Key, source: &net::IpAddr) -> usize {
        let group = endpoint::group(&self.addr.ip);
        let src_group = endpoint::group(source);
        let spread =
            hash64(key, NEW_SPREAD_TAG, &[&group, &src_group]) % NEW_BUCKETS_PER_SOURCE_GROUP;

        (hash64(key, NEW_BUCKET_TAG, &[&src_group, &spread.to_le_bytes()])
            % NEW_BUCKET_COUNT as u64) as usize
    }

    /// Determine whether the statistics about this entry are bad enough
    /// that it can just be deleted.
    pub fn is_terrible(&self, now: LocalTime) -> bool {
        let time = LocalTime::from_timestamp(self.addr.time);

        // Advertised from the future, and we never managed to connect.
        if self.last_success.is_none() && time > now + FUTURE_MARGIN {
            return true;
        }
        // Not advertised in over a month.
        if now - time > HORIZON {
            return true;
        }
        // In the middle of being dialed.
        if let Some(last_try) = self.last_try {
            if now - last_try < LocalDuration::from_mins(1) {
                return true;
            }
        }
        // Tried several times and never a success.
        if self.last_success.is_none() && self.attempts >= RETRIES {
            return true;
        }
        // Many successive failures, and no success in over a week.
        if self.attempts >= MAX_FAILURES
            && self.last_success.map_or(true, |t| now - t > MIN_FAIL_INTERVAL)
        {
            return true;
        }
        false
    }

    /// Calculate the relative chance this entry should be given when
    /// selecting an address to connect to.
    pub fn chance(&self, now: LocalTime) -> f64 {
        let mut chance = 1.0;

        // Don't hammer addresses that were dialed moments ago.
        if let Some(last_try) = self.last_try {
            if now - last_try < LocalDuration::from_mins(1) {
                chance *= 0.01;
            }
        }
        // Deprioritize a third for each failed attempt.
        chance *= 0.66_f64.powi(self.attempts.min(8) as i32);

        // Entries that never connected decay with the age of their
        // advertisement.
        if self.last_success.is_none() {
            let hours =
                (now - LocalTime::from_timestamp(self.addr.time)).as_secs() as f64 / 3600.;
            chance /= 1. + hours;
        }
        chance
    }
}

/// The serialized entry layout: the 30-byte endpoint, the 16-byte mapped
/// source address, `i64` seconds of the last success, `i32` attempts.
/// Everything else is reconstructed on load.
impl Encodable for AddrInfo {
    fn consensus_encode<W: io::Write>(&self, mut e: W) -> Result<usize, io::Error> {
        let mut len = 0;

        len += self.addr.consensus_encode(&mut e)?;
        len += endpoint::to_mapped(&self.source).consensus_encode(&mut e)?;
        len += self
            .last_success
            .map_or(0, |t| t.as_secs() as i64)
            .consensus_encode(&mut e)?;
        len += (self.attempts as i32).consensus_encode(&mut e)?;

        Ok(len)
    }
}

impl Decodable for AddrInfo {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        let addr = Endpoint::consensus_decode(&mut d)?;
        let source = endpoint::from_mapped(<[u8; 16]>::consensus_decode(&mut d)?);
        let last_success = i64::consensus_decode(&mut d)?;
        let attempts = i32::consensus_decode(&mut d)?;

        Ok(Self {
            addr,
            source,
            last_success: if last_success > 0 {
                Some(LocalTime::from_secs(last_success as u64))
            } else {
                None
            },
            last_try: None,
            attempts: attempts.max(0) as u32,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        })
    }
}

/// The stochastic address manager.
///
/// Single-writer, many-reader: the surrounding node wraps it in a mutex;
/// no operation here blocks or calls back into the manager.
#[derive(Debug)]
pub struct AddressManager<C> {
    /// Secret key to randomize bucket selection with.
    key: Key,
    /// Information about all entries, by id.
    infos: HashMap<Id, AddrInfo>,
    /// Find an id based on its socket address.
    ids: HashMap<net::SocketAddr, Id>,
    /// Randomly-ordered vector of all ids.
    random: Vec<Id>,
    /// The tried buckets.
    tried: Vec<Vec<Id>>,
    /// The new buckets.
    new: Vec<HashSet<Id>>,
    /// Number of tried entries.
    n_tried: usize,
    /// Number of (unique) new entries.
    n_new: usize,
    /// Last used id.
    next_id: Id,
    rng: fastrand::Rng,
    clock: C,
}

impl<C: Clock> AddressManager<C> {
    /// Create a new, empty address manager.
    ///
    /// The key must come from a cryptographic random source; bucket
    /// placement is only unpredictable as long as it stays secret.
    pub fn new(key: Key, rng: fastrand::Rng, clock: C) -> Self {
        Self {
            key,
            infos: HashMap::with_hasher(rng.clone().into()),
            ids: HashMap::with_hasher(rng.clone().into()),
            random: Vec::new(),
            tried: vec![Vec::new(); TRIED_BUCKET_COUNT],
            new: std::iter::repeat_with(|| HashSet::with_hasher(rng.clone().into()))
                .take(NEW_BUCKET_COUNT)
                .collect(),
            n_tried: 0,
            n_new: 0,
            next_id: 0,
            rng,
            clock,
        }
    }

    /// The number of (unique) addresses in all tables.
    pub fn len(&self) -> usize {
        self.random.len()
    }

    /// Whether the manager holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.random.is_empty()
    }

    /// The number of entries in the tried tier.
    pub fn n_tried(&self) -> usize {
        self.n_tried
    }

    /// The number of entries in the new tier.
    pub fn n_new(&self) -> usize {
        self.n_new
    }

    /// Look up everything we know about an address.
    pub fn get(&self, addr: &net::SocketAddr) -> Option<&AddrInfo> {
        self.ids.get(addr).map(|id| &self.infos[id])
    }

    /// Add an address learned from the given source.
    ///
    /// The time penalty is subtracted from the advertised time, to keep
    /// gossip forwarded at arm's length from looking fresh. Returns
    /// `true` if the address was not previously known.
    ///
    /// Non-routable addresses are ignored.
    pub fn add(
        &mut self,
        addr: Endpoint,
        source: net::IpAddr,
        time_penalty: LocalDuration,
    ) -> bool {
        if !endpoint::is_routable(&addr.ip) {
            return false;
        }
        let now = self.clock.local_time();

        // Clamp the advertised time to at most ten minutes into the
        // future, then apply the provenance penalty.
        let advertised = addr
            .time
            .min((now + FUTURE_MARGIN).as_secs() as Timestamp)
            .saturating_sub(time_penalty.as_secs() as Timestamp);

        if let Some(id) = self.ids.get(&addr.socket_addr()).copied() {
            {
                let info = self.infos.get_mut(&id).expect("known address has an entry");

                info.addr.services |= addr.services;

                // Rate-limit timestamp churn: only take the advertised
                // time when it is at least an hour fresher than ours.
                if advertised
                    > info
                        .addr
                        .time
                        .saturating_add(UPDATE_INTERVAL.as_secs() as Timestamp)
                {
                    info.addr.time = advertised;
                }
                if info.in_tried || info.ref_count >= NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }
                // Stochastic multiplicity boost: an entry already in n
                // buckets enters one more with probability 1/(n + 1).
                if self.rng.u32(..=info.ref_count) != 0 {
                    return false;
                }
            }
            let bucket = {
                let info = &self.infos[&id];
                info.new_bucket(&self.key, &source)
            };
            if !self.new[bucket].contains(&id) {
                if self.new[bucket].len() >= NEW_BUCKET_SIZE {
                    self.shrink_new(bucket);
                }
                self.new[bucket].insert(id);
                self.infos
                    .get_mut(&id)
                    .expect("known address has an entry")
                    .ref_count += 1;
            }
            self.check();

            return false;
        }

        // A fresh address. Allocate an id and insert into a new bucket.
        let socket_addr = addr.socket_addr();
        let mut info = AddrInfo::new(
            Endpoint {
                time: advertised,
                ..addr
            },
            source,
        );
        let id = self.next_id;
        self.next_id += 1;

        info.random_pos = self.random.len();
        let bucket = info.new_bucket(&self.key, &source);

        self.random.push(id);
        self.ids.insert(socket_addr, id);
        self.infos.insert(id, info);

        if self.new[bucket].len() >= NEW_BUCKET_SIZE {
            self.shrink_new(bucket);
        }
        self.new[bucket].insert(id);
        self.infos
            .get_mut(&id)
            .expect("entry was just inserted")
            .ref_count = 1;
        self.n_new += 1;

        log::trace!(
            target: "addrmgr",
            "added {} from {} ({} tried, {} new)",
            socket_addr, source, self.n_tried, self.n_new
        );
        self.check();

        true
    }

    /// Mark an address as successfully connected to, promoting it to the
    /// tried table.
    pub fn mark_good(&mut self, addr: &net::SocketAddr, time: LocalTime) {
        let id = match self.ids.get(addr) {
            Some(id) => *id,
            None => return,
        };
        let in_tried = {
            let info = self.infos.get_mut(&id).expect("known address has an entry");

            info.last_success = Some(time);
            info.last_try = Some(time);
            info.attempts = 0;
            info.addr.time = time.as_secs() as Timestamp;

            info.in_tried
        };
        if in_tried {
            self.check();
            return;
        }

        // Pull the entry out of the new tier entirely before promoting.
        self.clear_new(id);

        let bucket = self.infos[&id].tried_bucket(&self.key);

        if self.tried[bucket].len() < TRIED_BUCKET_SIZE {
            self.tried[bucket].push(id);
        } else {
            // The bucket is full: displace a uniformly random occupant
            // back into the new tier, under its own source.
            let slot = self.rng.usize(..self.tried[bucket].len());
            let victim = self.tried[bucket][slot];

            self.infos
                .get_mut(&victim)
                .expect("tried bucket entries exist")
                .in_tried = false;
            self.n_tried -= 1;

            let vbucket = {
                let info = &self.infos[&victim];
                info.new_bucket(&self.key, &info.source)
            };
            if self.new[vbucket].len() >= NEW_BUCKET_SIZE {
                self.shrink_new(vbucket);
            }
            self.new[vbucket].insert(victim);
            self.infos
                .get_mut(&victim)
                .expect("tried bucket entries exist")
                .ref_count = 1;
            self.n_new += 1;

            log::debug!(
                target: "addrmgr",
                "evicted {} from tried bucket {}",
                self.infos[&victim].addr, bucket
            );

            self.tried[bucket][slot] = id;
        }
        self.infos
            .get_mut(&id)
            .expect("known address has an entry")
            .in_tried = true;
        self.n_tried += 1;
        self.n_new -= 1;

        log::debug!(
            target: "addrmgr",
            "{} is good ({} tried, {} new)",
            addr, self.n_tried, self.n_new
        );
        self.check();
    }

    /// Mark an address as attempted to connect to.
    pub fn mark_attempt(&mut self, addr: &net::SocketAddr, time: LocalTime) {
        if let Some(id) = self.ids.get(addr) {
            let info = self.infos.get_mut(id).expect("known address has an entry");

            info.last_try = Some(time);
            info.attempts += 1;
        }
        self.check();
    }

    /// Mark an address as currently connected to.
    ///
    /// Refreshes the advertised time, but only on a heartbeat interval,
    /// to keep the serialized timestamps from churning.
    pub fn mark_connected(&mut self, addr: &net::SocketAddr, time: LocalTime) {
        if let Some(id) = self.ids.get(addr) {
            let info = self.infos.get_mut(id).expect("known address has an entry");

            if time - LocalTime::from_timestamp(info.addr.time) > CONNECTED_INTERVAL {
                info.addr.time = time.as_secs() as Timestamp;
            }
        }
        self.check();
    }

    /// Choose an address to connect to.
    ///
    /// `new_bias` determines how much new entries are favored over tried
    /// ones (min 0, max 100), capped by tier emptiness. Entries are
    /// accepted with a probability given by [`AddrInfo::chance`], so
    /// recently-failed addresses are returned rarely.
    pub fn select(&mut self, new_bias: u32) -> Option<AddrInfo> {
        if self.random.is_empty() {
            return None;
        }
        let now = self.clock.local_time();
        let bias = u64::from(new_bias.min(100));

        let tried_weight = self.n_tried as u64 * (100 - bias);
        let new_weight = self.n_new as u64 * bias;
        let use_tried = self.n_tried > 0
            && (self.n_new == 0 || self.rng.u64(..tried_weight + new_weight) < tried_weight);

        let mut factor = 1.0;
        loop {
            let id = if use_tried {
                let bucket = &self.tried[self.rng.usize(..TRIED_BUCKET_COUNT)];
                if bucket.is_empty() {
                    continue;
                }
                bucket[self.rng.usize(..bucket.len())]
            } else {
                let bucket = &self.new[self.rng.usize(..NEW_BUCKET_COUNT)];
                if bucket.is_empty() {
                    continue;
                }
                *bucket
                    .iter()
                    .nth(self.rng.usize(..bucket.len()))
                    .expect("slot is within bounds")
            };
            let info = &self.infos[&id];

            if self.rng.f64() < (factor * info.chance(now)).min(1.0) {
                return Some(info.clone());
            }
            // Selection must terminate even when every entry is
            // heavily penalized.
            factor *= 1.2;
        }
    }

    /// Return a random sample of known addresses, for answering peers
    /// that ask for addresses.
    ///
    /// At most 23% of the table is returned, capped at 2500 entries, and
    /// terrible entries are left out.
    pub fn get_addr(&mut self) -> Vec<Endpoint> {
        let now = self.clock.local_time();
        let quota = usize::min(self.random.len() * GETADDR_MAX_PCT / 100, GETADDR_MAX);
        let mut addrs = Vec::with_capacity(quota);

        // Partial Fisher-Yates over the random vector: element `i` is
        // swapped with a uniformly random successor, then kept.
        for i in 0..self.random.len() {
            if addrs.len() >= quota {
                break;
            }
            let j = i + self.rng.usize(..self.random.len() - i);
            self.swap_random(i, j);

            let info = &self.infos[&self.random[i]];
            if !info.is_terrible(now) {
                addrs.push(info.addr.clone());
            }
        }
        addrs
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Remove one entry from a full new bucket.
    ///
    /// Entries that are already terrible go first; otherwise the evictee
    /// is picked uniformly at random. This is the only place where
    /// entries are actually deleted: when the evictee's reference count
    /// drops to zero, it is removed from all indexes.
    fn shrink_new(&mut self, bucket: usize) {
        let now = self.clock.local_time();

        let mut evictee = None;
        for id in self.new[bucket].iter() {
            if self.infos[id].is_terrible(now) {
                evictee = Some(*id);
                break;
            }
        }
        let id = match evictee {
            Some(id) => id,
            None => {
                let slot = self.rng.usize(..self.new[bucket].len());
                *self.new[bucket]
                    .iter()
                    .nth(slot)
                    .expect("slot is within bounds")
            }
        };
        self.new[bucket].remove(&id);

        let info = self.infos.get_mut(&id).expect("bucket entries exist");
        info.ref_count -= 1;

        if info.ref_count == 0 {
            self.n_new -= 1;
            let dropped = self.drop_entry(id);

            log::trace!(target: "addrmgr", "dropped {} from new bucket {}", dropped, bucket);
        }
    }

    /// Remove an entry from all new buckets it occupies.
    fn clear_new(&mut self, id: Id) {
        let mut removed = 0;
        for bucket in self.new.iter_mut() {
            if bucket.remove(&id) {
                removed += 1;
            }
        }
        if removed > 0 {
            let info = self.infos.get_mut(&id).expect("known address has an entry");

            debug_assert_eq!(info.ref_count, removed);
            info.ref_count = 0;
        }
    }

    /// Delete an entry from all indexes. Must only be called for entries
    /// that are in neither tier.
    fn drop_entry(&mut self, id: Id) -> Endpoint {
        let info = self.infos.remove(&id).expect("known address has an entry");

        debug_assert_eq!(info.ref_count, 0);
        debug_assert!(!info.in_tried);

        self.ids.remove(&info.addr.socket_addr());

        let last = self.random.len() - 1;
        self.swap_random(info.random_pos, last);
        self.random.pop();

        info.addr
    }

    /// Swap two elements of the random vector, fixing up the cached
    /// positions of the entries involved.
    fn swap_random(&mut self, pos1: usize, pos2: usize) {
        self.random.swap(pos1, pos2);

        if let Some(info) = self.infos.get_mut(&self.random[pos1]) {
            info.random_pos = pos1;
        }
        if let Some(info) = self.infos.get_mut(&self.random[pos2]) {
            info.random_pos = pos2;
        }
    }

    fn check(&self) {
        #[cfg(feature = "check")]
        self.consistency_check();
    }

    /// Verify the agreement of all indexes. Panics on violation.
    ///
    /// This is quadratic-ish in the table size and only meant for tests
    /// and debugging; enable the `check` cargo feature to run it after
    /// every public mutation.
    #[cfg(any(test, feature = "check"))]
    pub fn consistency_check(&self) {
        assert_eq!(self.random.len(), self.infos.len());
        assert_eq!(self.ids.len(), self.infos.len());

        for (pos, id) in self.random.iter().enumerate() {
            assert_eq!(self.infos[id].random_pos, pos);
        }

        let mut n_new = 0;
        let mut n_tried = 0;

        for (id, info) in self.infos.iter() {
            assert_eq!(self.ids[&info.addr.socket_addr()], *id);

            let refs = self.new.iter().filter(|b| b.contains(id)).count();
            let tried = self.tried.iter().filter(|b| b.contains(id)).count();

            if info.in_tried {
                assert_eq!(info.ref_count, 0);
                assert_eq!(refs, 0);
                assert_eq!(tried, 1);
                assert!(self.tried[info.tried_bucket(&self.key)].contains(id));
                n_tried += 1;
            } else {
                assert!(info.ref_count >= 1);
                assert!(info.ref_count <= NEW_BUCKETS_PER_ADDRESS);
                assert_eq!(refs, info.ref_count as usize);
                assert_eq!(tried, 0);
                n_new += 1;
            }
        }
        assert_eq!(n_new, self.n_new);
        assert_eq!(n_tried, self.n_tried);

        for bucket in self.tried.iter() {
            assert!(bucket.len() <= TRIED_BUCKET_SIZE);
        }
        for bucket in self.new.iter() {
            assert!(bucket.len() <= NEW_BUCKET_SIZE);
        }
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Write the entire store to the given stream.
    ///
    /// Serialized format, top to bottom:
    ///
    /// * version byte (currently 0)
    /// * the secret key
    /// * `u32` number of new entries
    /// * `u32` number of tried entries
    /// * `u32` number of new buckets (for schema change tolerance)
    /// * all new entries, then all tried entries
    /// * for each new bucket: `u32` size, then for each element a `u32`
    ///   index into the new entries written above
    ///
    /// The random vector, the address index and the tried buckets are
    /// never written; they are reconstructed on load.
    pub fn encode<W: io::Write>(&self, mut w: W) -> Result<usize, Error> {
        let mut len = 0;

        len += FORMAT_VERSION.consensus_encode(&mut w)?;
        len += self.key.consensus_encode(&mut w)?;
        len += (self.n_new as u32).consensus_encode(&mut w)?;
        len += (self.n_tried as u32).consensus_encode(&mut w)?;
        len += (NEW_BUCKET_COUNT as u32).consensus_encode(&mut w)?;

        // New entries go out in random-vector order; the bucket section
        // below references them by position in this sequence.
        let mut indexes: std::collections::HashMap<Id, u32> = std::collections::HashMap::new();

        for id in self.random.iter() {
            let info = &self.infos[id];
            if info.ref_count > 0 {
                indexes.insert(*id, indexes.len() as u32);
                len += info.consensus_encode(&mut w)?;
            }
        }
        for id in self.random.iter() {
            let info = &self.infos[id];
            if info.in_tried {
                len += info.consensus_encode(&mut w)?;
            }
        }
        for bucket in self.new.iter() {
            len += (bucket.len() as u32).consensus_encode(&mut w)?;
            for id in bucket.iter() {
                len += indexes[id].consensus_encode(&mut w)?;
            }
        }
        Ok(len)
    }

    /// Replace the contents of this manager with a store read from the
    /// given stream.
    ///
    /// The persisted bucket assignments are only honored when the bucket
    /// count they were written under matches ours; otherwise every new
    /// entry is re-bucketed under its own source with a single
    /// reference. Tried entries whose bucket is already full on reload
    /// are dropped. Trailing bytes are not read.
    pub fn decode<D: io::Read>(&mut self, mut d: D) -> Result<(), Error> {
        let version = u8::consensus_decode(&mut d)?;
        if version != FORMAT_VERSION {
            return Err(encode::Error::ParseFailed("unknown address store version").into());
        }
        let key = Key::consensus_decode(&mut d)?;
        let n_new = u32::consensus_decode(&mut d)? as usize;
        let n_tried = u32::consensus_decode(&mut d)? as usize;
        let bucket_count = u32::consensus_decode(&mut d)? as usize;

        let rng = self.rng.clone();

        self.key = key;
        self.infos.clear();
        self.ids.clear();
        self.random.clear();
        self.tried = vec![Vec::new(); TRIED_BUCKET_COUNT];
        self.new = std::iter::repeat_with(|| HashSet::with_hasher(rng.clone().into()))
            .take(NEW_BUCKET_COUNT)
            .collect();
        self.n_tried = 0;
        self.n_new = 0;
        self.next_id = 0;

        // The new entries. When the bucket layout changed since the store
        // was written, they are re-bucketed here and the bucket section
        // below is discarded.
        let mut new_ids = Vec::with_capacity(n_new.min(NEW_BUCKET_COUNT * NEW_BUCKET_SIZE));

        for _ in 0..n_new {
            let mut info = AddrInfo::consensus_decode(&mut d)?;
            let id = self.next_id;
            self.next_id += 1;

            info.random_pos = self.random.len();

            self.random.push(id);
            if self.ids.insert(info.addr.socket_addr(), id).is_some() {
                return Err(encode::Error::ParseFailed("duplicate address in store").into());
            }
            self.infos.insert(id, info);
            new_ids.push(id);

            if bucket_count != NEW_BUCKET_COUNT {
                let bucket = {
                    let info = &self.infos[&id];
                    info.new_bucket(&self.key, &info.source)
                };
                if self.new[bucket].len() >= NEW_BUCKET_SIZE {
                    self.shrink_new(bucket);
                }
                self.new[bucket].insert(id);
                self.infos
                    .get_mut(&id)
                    .expect("entry was just inserted")
                    .ref_count = 1;
                self.n_new += 1;
            }
        }

        // The tried entries. Entries whose bucket filled up before they
        // were read are lost.
        let mut lost = 0;
        for _ in 0..n_tried {
            let mut info = AddrInfo::consensus_decode(&mut d)?;
            let bucket = info.tried_bucket(&self.key);

            if self.tried[bucket].len() >= TRIED_BUCKET_SIZE {
                lost += 1;
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;

            info.random_pos = self.random.len();
            info.in_tried = true;

            self.random.push(id);
            if self.ids.insert(info.addr.socket_addr(), id).is_some() {
                return Err(encode::Error::ParseFailed("duplicate address in store").into());
            }
            self.infos.insert(id, info);
            self.tried[bucket].push(id);
            self.n_tried += 1;
        }
        if lost > 0 {
            log::warn!(target: "addrmgr", "{} tried address(es) lost on reload", lost);
        }

        // The bucket section is always read, but only honored when the
        // bucket layout is unchanged.
        for bucket in 0..bucket_count {
            let size = u32::consensus_decode(&mut d)? as usize;

            for _ in 0..size {
                let index = u32::consensus_decode(&mut d)? as usize;

                if bucket_count != NEW_BUCKET_COUNT {
                    continue;
                }
                let id = match new_ids.get(index) {
                    Some(id) => *id,
                    None => {
                        return Err(
                            encode::Error::ParseFailed("bucket index out of range").into()
                        )
                    }
                };
                let refs = self.infos[&id].ref_count;

                if refs < NEW_BUCKETS_PER_ADDRESS
                    && self.new[bucket].len() < NEW_BUCKET_SIZE
                    && self.new[bucket].insert(id)
                {
                    self.infos
                        .get_mut(&id)
                        .expect("entry was just inserted")
                        .ref_count = refs + 1;
                    if refs == 0 {
                        self.n_new += 1;
                    }
                }
            }
        }

        // A new entry that ended up referenced by no bucket would be
        // unreachable; give it a fresh bucket under its own source.
        // Entries deleted by an eviction along the way stay deleted.
        for id in new_ids {
            match self.infos.get(&id) {
                Some(info) if info.ref_count == 0 => {}
                _ => continue,
            }
            let bucket = {
                let info = &self.infos[&id];
                info.new_bucket(&self.key, &info.source)
            };
            if self.new[bucket].len() >= NEW_BUCKET_SIZE {
                self.shrink_new(bucket);
            }
            self.new[bucket].insert(id);
            self.infos
                .get_mut(&id)
                .expect("entry was just inserted")
                .ref_count = 1;
            self.n_new += 1;
        }

        log::debug!(
            target: "addrmgr",
            "loaded address store ({} tried, {} new)",
            self.n_tried, self.n_new
        );
        self.check();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bitcoin::network::constants::ServiceFlags;
    use quickcheck_macros::quickcheck;

    use peerbook_common::time::RefClock;

    const BASE: u64 = 1_600_000_000;

    fn manager(seed: u64) -> (AddressManager<RefClock<LocalTime>>, RefClock<LocalTime>) {
        let clock = RefClock::from(LocalTime::from_secs(BASE));
        let rng = fastrand::Rng::with_seed(seed);
        let mut key = [0; 32];

        for byte in key.iter_mut() {
            *byte = rng.u8(..);
        }
        (AddressManager::new(key, rng, clock.clone()), clock)
    }

    fn addr(octets: [u8; 4], port: u16, time: Timestamp) -> Endpoint {
        Endpoint::new(net::Ipv4Addr::from(octets), port, ServiceFlags::NETWORK, time)
    }

    fn ip(octets: [u8; 4]) -> net::IpAddr {
        net::IpAddr::V4(net::Ipv4Addr::from(octets))
    }

    #[test]
    fn test_add_and_select() {
        let (mut addrmgr, _clock) = manager(1);
        let added = addr([33, 44, 55, 66], 8333, BASE as Timestamp);

        assert!(addrmgr.add(added.clone(), ip([33, 44, 55, 66]), LocalDuration::default()));
        assert_eq!(addrmgr.len(), 1);
        assert_eq!(addrmgr.n_new(), 1);

        // A fresh entry has a chance of 1 and is returned immediately.
        let selected = addrmgr.select(100).unwrap();
        assert_eq!(selected.addr.socket_addr(), added.socket_addr());

        assert!(
            !addrmgr.add(added.clone(), ip([9, 9, 9, 9]), LocalDuration::default()),
            "already known addresses are not counted as new"
        );
        assert_eq!(addrmgr.len(), 1);

        addrmgr.consistency_check();
    }

    #[test]
    fn test_unroutable_ignored() {
        let (mut addrmgr, _clock) = manager(2);

        for unroutable in &["127.0.0.1", "10.0.1.1", "192.168.1.44", "0.0.0.0"] {
            let e = Endpoint::new(
                unroutable.parse::<net::IpAddr>().unwrap(),
                8333,
                ServiceFlags::NONE,
                BASE as Timestamp,
            );
            assert!(!addrmgr.add(e, ip([88, 1, 1, 1]), LocalDuration::default()));
        }
        assert!(addrmgr.is_empty());
        assert!(addrmgr.select(50).is_none());
    }

    #[test]
    fn test_multiple_sources_single_entry() {
        let (mut addrmgr, _clock) = manager(3);
        let e = addr([9, 9, 9, 9], 8333, BASE as Timestamp);

        for i in 0..10 {
            addrmgr.add(e.clone(), ip([60 + i, 1, 1, 1]), LocalDuration::default());
        }
        assert_eq!(addrmgr.len(), 1, "one entry no matter how many sources");

        let info = addrmgr.get(&e.socket_addr()).unwrap();
        assert!(info.ref_count >= 1);
        assert!(info.ref_count <= NEW_BUCKETS_PER_ADDRESS);

        addrmgr.consistency_check();
    }

    #[test]
    fn test_new_bucket_overflow() {
        let (mut addrmgr, _clock) = manager(4);
        let source = ip([77, 1, 1, 1]);
        let stale = (BASE - HORIZON.as_secs() - 86_400) as Timestamp;

        // Same /16 and same source: all of these land in the same bucket.
        for i in 0..NEW_BUCKET_SIZE {
            let e = addr([55, 66, 1, i as u8 + 1], 8333, stale);
            assert!(addrmgr.add(e, source, LocalDuration::default()));
        }
        assert_eq!(addrmgr.len(), NEW_BUCKET_SIZE);

        // The bucket is full, so adding one more displaces a stale entry.
        let fresh = addr([55, 66, 200, 200], 8333, BASE as Timestamp);
        assert!(addrmgr.add(fresh.clone(), source, LocalDuration::default()));

        assert_eq!(addrmgr.len(), NEW_BUCKET_SIZE);
        assert!(addrmgr.get(&fresh.socket_addr()).is_some());

        addrmgr.consistency_check();
    }

    #[test]
    fn test_mark_good_promotes() {
        let (mut addrmgr, clock) = manager(5);
        let e = addr([33, 77, 1, 1], 8333, BASE as Timestamp);
        let sa = e.socket_addr();

        addrmgr.add(e, ip([44, 1, 1, 1]), LocalDuration::default());
        addrmgr.mark_attempt(&sa, clock.local_time());

        let info = addrmgr.get(&sa).unwrap();
        assert_eq!(info.attempts, 1);
        assert!(info.last_try.is_some());
        assert!(!info.is_tried());

        addrmgr.mark_good(&sa, clock.local_time());

        let info = addrmgr.get(&sa).unwrap();
        assert!(info.is_tried());
        assert_eq!(info.ref_count, 0);
        assert_eq!(info.attempts, 0);
        assert_eq!(info.last_success, Some(clock.local_time()));
        assert_eq!(addrmgr.n_tried(), 1);
        assert_eq!(addrmgr.n_new(), 0);

        // Marking it good again is idempotent.
        addrmgr.mark_good(&sa, clock.local_time());
        assert_eq!(addrmgr.n_tried(), 1);

        // Unknown addresses are a no-op.
        addrmgr.mark_good(&net::SocketAddr::from(([99, 99, 99, 99], 8333)), clock.local_time());
        assert_eq!(addrmgr.len(), 1);

        addrmgr.consistency_check();
    }

    #[test]
    fn test_tried_dispersion_and_collisions() {
        let (mut addrmgr, clock) = manager(6);

        // Promote more addresses from a single /16 than its four tried
        // buckets can hold.
        for i in 0..300u32 {
            let e = addr(
                [21, 12, (i / 250) as u8, (i % 250) as u8 + 1],
                8333,
                BASE as Timestamp,
            );
            let source = ip([40 + (i % 64) as u8, (i / 64) as u8 + 1, 1, 1]);

            assert!(addrmgr.add(e.clone(), source, LocalDuration::default()));
            addrmgr.mark_good(&e.socket_addr(), clock.local_time());
        }
        let occupied = addrmgr.tried.iter().filter(|b| !b.is_empty()).count();

        assert!(occupied <= TRIED_BUCKETS_PER_GROUP as usize);
        assert!(addrmgr.n_tried() <= TRIED_BUCKETS_PER_GROUP as usize * TRIED_BUCKET_SIZE);
        assert_eq!(
            addrmgr.n_tried() + addrmgr.n_new(),
            300,
            "displaced entries go back to new, nothing is deleted"
        );

        addrmgr.consistency_check();
    }

    #[test]
    fn test_new_dispersion() {
        let (mut addrmgr, _clock) = manager(7);
        let source = ip([99, 99, 2, 2]);

        for i in 0..1024u32 {
            let e = addr(
                [(i % 200) as u8 + 1, (i / 200) as u8 + 50, 7, 7],
                8333,
                BASE as Timestamp,
            );
            addrmgr.add(e, source, LocalDuration::default());
        }
        let occupied = addrmgr.new.iter().filter(|b| !b.is_empty()).count();

        assert!(occupied <= NEW_BUCKETS_PER_SOURCE_GROUP as usize);

        addrmgr.consistency_check();
    }

    #[test]
    fn test_select_bias() {
        let (mut addrmgr, clock) = manager(8);

        for i in 1..=16 {
            addrmgr.add(
                addr([37, i, 1, 1], 8333, BASE as Timestamp),
                ip([37, i, 1, 1]),
                LocalDuration::default(),
            );
        }
        let good = net::SocketAddr::from(([37, 1, 1, 1], 8333));
        addrmgr.mark_good(&good, clock.local_time());

        // Zero bias always picks the tried tier; full bias never does.
        for _ in 0..16 {
            assert_eq!(addrmgr.select(0).unwrap().addr.socket_addr(), good);
        }
        for _ in 0..16 {
            assert_ne!(addrmgr.select(100).unwrap().addr.socket_addr(), good);
        }
    }

    #[test]
    fn test_mark_connected() {
        let (mut addrmgr, clock) = manager(9);
        let e = addr([88, 11, 1, 1], 8333, BASE as Timestamp);
        let sa = e.socket_addr();

        addrmgr.add(e, ip([88, 11, 1, 1]), LocalDuration::default());

        // Within the heartbeat interval, nothing changes.
        addrmgr.mark_connected(&sa, clock.local_time());
        assert_eq!(addrmgr.get(&sa).unwrap().addr.time, BASE as Timestamp);

        clock.elapse(LocalDuration::from_mins(21));
        addrmgr.mark_connected(&sa, clock.local_time());
        assert_eq!(
            addrmgr.get(&sa).unwrap().addr.time,
            (BASE + 21 * 60) as Timestamp
        );
    }

    #[test]
    fn test_add_updates_known_entries() {
        let (mut addrmgr, _clock) = manager(10);
        let source = ip([70, 1, 1, 1]);
        let e = addr([51, 2, 3, 4], 8333, BASE as Timestamp);
        let sa = e.socket_addr();

        addrmgr.add(e.clone(), source, LocalDuration::default());

        // A slightly fresher advertisement is rate-limited away, but
        // services accumulate.
        let update = Endpoint {
            time: BASE as Timestamp + 100,
            services: ServiceFlags::WITNESS,
            ..e.clone()
        };
        assert!(!addrmgr.add(update, source, LocalDuration::default()));

        let info = addrmgr.get(&sa).unwrap();
        assert_eq!(info.addr.time, BASE as Timestamp);
        assert!(info.addr.services.has(ServiceFlags::NETWORK));
        assert!(info.addr.services.has(ServiceFlags::WITNESS));

        // An advertisement over an hour fresher is taken.
        let update = Endpoint {
            time: BASE as Timestamp + 3700,
            ..e
        };
        assert!(!addrmgr.add(update, source, LocalDuration::default()));
        assert_eq!(addrmgr.get(&sa).unwrap().addr.time, BASE as Timestamp + 3700);

        addrmgr.consistency_check();
    }

    #[test]
    fn test_time_penalty_and_clamp() {
        let (mut addrmgr, _clock) = manager(11);
        let source = ip([70, 1, 1, 1]);

        let e = addr([52, 2, 3, 4], 8333, BASE as Timestamp);
        addrmgr.add(e.clone(), source, LocalDuration::from_hours(2));
        assert_eq!(
            addrmgr.get(&e.socket_addr()).unwrap().addr.time,
            (BASE - 2 * 3600) as Timestamp
        );

        // Advertisements from the future are clamped to ten minutes.
        let e = addr([52, 2, 3, 5], 8333, (BASE + 86_400) as Timestamp);
        addrmgr.add(e.clone(), source, LocalDuration::default());
        assert_eq!(
            addrmgr.get(&e.socket_addr()).unwrap().addr.time,
            (BASE + 600) as Timestamp
        );
    }

    #[test]
    fn test_get_addr() {
        let (mut addrmgr, _clock) = manager(12);
        let stale = (BASE - HORIZON.as_secs() - 86_400) as Timestamp;

        for i in 0..100 {
            let e = addr([41, i + 1, 1, 1], 8333, BASE as Timestamp);
            addrmgr.add(e, ip([41, i + 1, 1, 1]), LocalDuration::default());
        }
        for i in 0..100 {
            let e = addr([42, i + 1, 1, 1], 8333, stale);
            addrmgr.add(e, ip([42, i + 1, 1, 1]), LocalDuration::default());
        }
        let addrs = addrmgr.get_addr();
        let quota = 200 * GETADDR_MAX_PCT / 100;

        assert!(addrs.len() <= quota);
        assert!(!addrs.is_empty());

        let mut unique = std::collections::HashSet::new();
        for a in addrs.iter() {
            assert_eq!(a.time, BASE as Timestamp, "terrible entries are never shared");
            assert!(unique.insert(a.socket_addr()));
        }
        addrmgr.consistency_check();
    }

    #[test]
    fn test_get_addr_empty() {
        let (mut addrmgr, _clock) = manager(13);
        assert!(addrmgr.get_addr().is_empty());
    }

    #[test]
    fn test_encode_decode() {
        let (mut addrmgr, clock) = manager(14);

        for i in 0..4000u32 {
            let e = addr(
                [
                    (i % 251) as u8 + 1,
                    (i / 251) as u8 + 1,
                    (i % 3) as u8,
                    (i % 250) as u8 + 1,
                ],
                8333,
                BASE as Timestamp,
            );
            let source = ip([(i % 200) as u8 + 1, (i / 200) as u8, 9, 9]);
            let sa = e.socket_addr();

            addrmgr.add(e, source, LocalDuration::default());
            if i % 5 == 0 {
                addrmgr.mark_good(&sa, clock.local_time());
            }
            if i % 7 == 0 {
                addrmgr.mark_attempt(&sa, clock.local_time());
            }
        }
        addrmgr.consistency_check();

        let mut bytes = Vec::new();
        addrmgr.encode(&mut bytes).unwrap();

        let (mut copy, _) = manager(999);
        let mut cursor = io::Cursor::new(&bytes);
        copy.decode(&mut cursor).unwrap();
        copy.consistency_check();

        assert_eq!(cursor.position() as usize, bytes.len(), "whole stream is read");
        assert_eq!(copy.len(), addrmgr.len());
        assert_eq!(copy.n_tried(), addrmgr.n_tried());
        assert_eq!(copy.n_new(), addrmgr.n_new());

        for id in addrmgr.random.iter() {
            let info = &addrmgr.infos[id];
            let other = copy
                .get(&info.addr.socket_addr())
                .expect("identical layout loses no address");

            assert_eq!(other.addr, info.addr);
            assert_eq!(other.source, info.source);
            assert_eq!(other.last_success, info.last_success);
            assert_eq!(other.attempts, info.attempts);
            assert_eq!(other.in_tried, info.in_tried);
            assert_eq!(other.ref_count, info.ref_count);
        }
    }

    #[test]
    fn test_decode_bucket_count_change() {
        let (mut addrmgr, _clock) = manager(15);

        for i in 0..100 {
            let e = addr([61, i + 1, 1, 1], 8333, BASE as Timestamp);
            for s in 0..8 {
                addrmgr.add(e.clone(), ip([70 + s, i + 1, 1, 1]), LocalDuration::default());
            }
        }
        let mut bytes = Vec::new();
        addrmgr.encode(&mut bytes).unwrap();

        // Pretend the store was written under a different bucket layout:
        // the persisted assignments are discarded, every entry is
        // re-bucketed with a single reference.
        let off = 1 + 32 + 4 + 4;
        bytes[off..off + 4].copy_from_slice(&64u32.to_le_bytes());

        let (mut copy, _) = manager(16);
        copy.decode(&bytes[..]).unwrap();
        copy.consistency_check();

        assert_eq!(copy.len(), addrmgr.len());
        for id in copy.random.iter() {
            assert_eq!(copy.infos[id].ref_count, 1);
        }
    }

    #[test]
    fn test_decode_bad_version() {
        let (mut addrmgr, _clock) = manager(17);
        addrmgr.add(
            addr([61, 1, 1, 1], 8333, BASE as Timestamp),
            ip([61, 1, 1, 1]),
            LocalDuration::default(),
        );
        let mut bytes = Vec::new();
        addrmgr.encode(&mut bytes).unwrap();
        bytes[0] = 3;

        let (mut copy, _) = manager(18);
        assert!(matches!(copy.decode(&bytes[..]), Err(Error::Encode(_))));
    }

    #[test]
    fn test_decode_truncated() {
        let (mut addrmgr, _clock) = manager(19);
        for i in 0..32 {
            addrmgr.add(
                addr([62, i + 1, 1, 1], 8333, BASE as Timestamp),
                ip([62, i + 1, 1, 1]),
                LocalDuration::default(),
            );
        }
        let mut bytes = Vec::new();
        addrmgr.encode(&mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);

        let (mut copy, _) = manager(20);
        assert!(copy.decode(&bytes[..]).is_err());
    }

    #[quickcheck]
    fn prop_consistency(ops: Vec<(u8, u8, u8, u8)>, seed: u64) -> bool {
        let (mut addrmgr, clock) = manager(seed);

        for (op, a, b, c) in ops {
            let sa = net::SocketAddr::from(([32 + a % 64, b, 1, c], 8333));

            match op % 6 {
                0 | 1 => {
                    addrmgr.add(
                        Endpoint::new(sa.ip(), sa.port(), ServiceFlags::NETWORK, clock.timestamp()),
                        ip([32 + b % 64, c, 1, 1]),
                        LocalDuration::from_secs(a as u64),
                    );
                }
                2 => addrmgr.mark_attempt(&sa, clock.local_time()),
                3 => addrmgr.mark_good(&sa, clock.local_time()),
                4 => {
                    addrmgr.select(c as u32 % 101);
                }
                _ => {
                    addrmgr.get_addr();
                }
            }
            clock.elapse(LocalDuration::from_secs(b as u64));
            addrmgr.consistency_check();
        }
        true
    }

    #[quickcheck]
    fn prop_encode_decode(ops: Vec<(u8, u8, u8)>, seed: u64) -> bool {
        let (mut addrmgr, clock) = manager(seed);

        for (a, b, c) in ops {
            let sa = net::SocketAddr::from(([32 + a % 64, b, 2, c], 8333));

            addrmgr.add(
                Endpoint::new(sa.ip(), sa.port(), ServiceFlags::NETWORK, clock.timestamp()),
                ip([32 + c % 64, b, 1, 1]),
                LocalDuration::default(),
            );
            if a % 3 == 0 {
                addrmgr.mark_good(&sa, clock.local_time());
            }
        }
        let mut bytes = Vec::new();
        addrmgr.encode(&mut bytes).unwrap();

        let (mut copy, _) = manager(seed.wrapping_add(1));
        copy.decode(&bytes[..]).unwrap();
        copy.consistency_check();

        copy.len() == addrmgr.len()
            && copy.n_tried() == addrmgr.n_tried()
            && copy.n_new() == addrmgr.n_new()
    }
}
