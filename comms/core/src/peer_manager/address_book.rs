// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use log::*;
use rand::{seq::SliceRandom, Rng};
use sable_storage::StoreHandle;
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    peer_manager::PeerManagerError,
    protocol::{NetAddress, TimestampedAddress},
};

const LOG_TARGET: &str = "comms::peer_manager::address_book";

/// Attempt-count weight when ranking candidates: each failed attempt ages an entry by this many seconds.
const ATTEMPT_AGE_PENALTY_SECS: u64 = 20 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSource {
    DnsSeed,
    SeedNode,
    Gossip,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEntry {
    pub address: SocketAddr,
    pub source: PeerSource,
    pub services: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_attempted: Option<u64>,
    pub last_connected: Option<u64>,
    pub attempts: u32,
    pub handshakes: u32,
}

impl BookEntry {
    /// Entries with a higher rank are preferred by the discovery connector: recently seen, rarely attempted.
    fn rank(&self) -> u64 {
        self.last_seen
            .saturating_sub(u64::from(self.attempts) * ATTEMPT_AGE_PENALTY_SECS)
    }
}

/// The persisted book of peer endpoints this node has heard of. Reads are concurrent; mutations serialize
/// behind the write lock, and the whole book is flushed to the engine on a timer and at shutdown.
pub struct PeerAddressBook {
    entries: RwLock<HashMap<SocketAddr, BookEntry>>,
    store: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl PeerAddressBook {
    pub fn new(store: StoreHandle, clock: Arc<dyn Clock>) -> Result<Self, PeerManagerError> {
        let mut entries = HashMap::new();
        for (key, value) in store.scan_prefix(&[])? {
            let entry: BookEntry = bincode::deserialize(&value)
                .map_err(|e| PeerManagerError::CorruptBookEntry(format!("{}: {}", String::from_utf8_lossy(&key), e)))?;
            entries.insert(entry.address, entry);
        }
        debug!(target: LOG_TARGET, "Loaded {} peer book entr(ies)", entries.len());
        Ok(Self {
            entries: RwLock::new(entries),
            store,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("peer book lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.entries.read().expect("peer book lock poisoned").contains_key(address)
    }

    /// Add a batch of gossiped or seeded endpoints. Invalid endpoints (port 0, unspecified host) are dropped.
    /// Returns the number of previously unknown endpoints.
    pub fn add_addresses(&self, addresses: &[TimestampedAddress], source: PeerSource) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("peer book lock poisoned");
        let mut added = 0;
        for ta in addresses {
            let address = ta.address.address;
            if !is_routable(&address) {
                continue;
            }
            // A peer may claim any last_seen; clamp into the past
            let last_seen = u64::from(ta.last_seen).min(now);
            match entries.get_mut(&address) {
                Some(entry) => {
                    entry.last_seen = entry.last_seen.max(last_seen);
                    entry.services |= ta.address.services;
                },
                None => {
                    entries.insert(address, BookEntry {
                        address,
                        source,
                        services: ta.address.services,
                        first_seen: now,
                        last_seen,
                        last_attempted: None,
                        last_connected: None,
                        attempts: 0,
                        handshakes: 0,
                    });
                    added += 1;
                },
            }
        }
        added
    }

    pub fn mark_attempted(&self, address: &SocketAddr) {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("peer book lock poisoned");
        if let Some(entry) = entries.get_mut(address) {
            entry.last_attempted = Some(now);
            entry.attempts = entry.attempts.saturating_add(1);
        }
    }

    pub fn mark_connected(&self, address: &SocketAddr) {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("peer book lock poisoned");
        let entry = entries.entry(*address).or_insert_with(|| BookEntry {
            address: *address,
            source: PeerSource::Manual,
            services: 0,
            first_seen: now,
            last_seen: now,
            last_attempted: None,
            last_connected: None,
            attempts: 0,
            handshakes: 0,
        });
        entry.last_connected = Some(now);
        entry.last_seen = now;
        entry.handshakes = entry.handshakes.saturating_add(1);
        entry.attempts = 0;
    }

    pub fn mark_seen(&self, address: &SocketAddr) {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("peer book lock poisoned");
        if let Some(entry) = entries.get_mut(address) {
            entry.last_seen = now;
        }
    }

    /// True when the book is cold: nothing in it, or everything has been attempted without a single
    /// successful connection. Triggers DNS/seed bootstrapping.
    pub fn needs_seeding(&self) -> bool {
        let entries = self.entries.read().expect("peer book lock poisoned");
        entries.is_empty() ||
            entries
                .values()
                .all(|e| e.last_attempted.is_some() && e.last_connected.is_none())
    }

    /// Candidates for the discovery connector, biased toward recently-seen, rarely-attempted entries.
    pub fn select_candidates<R: Rng>(
        &self,
        count: usize,
        exclude: &HashSet<SocketAddr>,
        rng: &mut R,
    ) -> Vec<SocketAddr> {
        let entries = self.entries.read().expect("peer book lock poisoned");
        let mut ranked = entries
            .values()
            .filter(|e| !exclude.contains(&e.address))
            .map(|e| (e.rank(), e.address))
            .collect::<Vec<_>>();
        ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        // Randomize within the preferred window so the same few peers are not hammered
        let window = (count * 4).min(ranked.len());
        let mut preferred = ranked[..window].to_vec();
        preferred.shuffle(rng);
        preferred.into_iter().take(count).map(|(_, addr)| addr).collect()
    }

    pub fn select_random<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<SocketAddr> {
        let entries = self.entries.read().expect("peer book lock poisoned");
        let mut all = entries.keys().copied().collect::<Vec<_>>();
        all.shuffle(rng);
        all.truncate(count);
        all
    }

    /// A sample of known endpoints for a `getaddr` reply.
    pub fn sample_for_gossip<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<TimestampedAddress> {
        let entries = self.entries.read().expect("peer book lock poisoned");
        let mut all = entries.values().cloned().collect::<Vec<_>>();
        all.shuffle(rng);
        all.into_iter()
            .take(count)
            .map(|e| TimestampedAddress {
                last_seen: e.last_seen.min(u64::from(u32::MAX)) as u32,
                address: NetAddress::new(e.services, e.address),
            })
            .collect()
    }

    /// Persist the whole book. Writes go through the engine one entry at a time; the entry count is bounded
    /// by the discovery target so this stays small.
    pub fn flush(&self) -> Result<(), PeerManagerError> {
        let snapshot = {
            let entries = self.entries.read().expect("peer book lock poisoned");
            entries.values().cloned().collect::<Vec<_>>()
        };
        for entry in &snapshot {
            let key = entry.address.to_string().into_bytes();
            let value = bincode::serialize(entry).map_err(|e| PeerManagerError::CorruptBookEntry(e.to_string()))?;
            self.store.insert(&key, &value)?;
        }
        trace!(target: LOG_TARGET, "Flushed {} peer book entr(ies)", snapshot.len());
        Ok(())
    }
}

fn is_routable(address: &SocketAddr) -> bool {
    if address.port() == 0 {
        return false;
    }
    !address.ip().is_unspecified()
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};
    use sable_storage::StoreBuilder;
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;

    fn book(dir: &TempDir, clock: Arc<ManualClock>) -> PeerAddressBook {
        let engine = StoreBuilder::new(dir.path()).add_store("peers").build().unwrap();
        PeerAddressBook::new(engine.get_handle("peers").unwrap(), clock).unwrap()
    }

    fn ta(addr: &str, last_seen: u32) -> TimestampedAddress {
        TimestampedAddress {
            last_seen,
            address: NetAddress::new(1, addr.parse().unwrap()),
        }
    }

    #[test]
    fn invalid_endpoints_are_dropped() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let book = book(&dir, clock);
        let added = book.add_addresses(
            &[ta("0.0.0.0:1234", 10), ta("10.0.0.1:0", 10), ta("10.0.0.1:8333", 10)],
            PeerSource::Gossip,
        );
        assert_eq!(added, 1);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn seeding_is_needed_until_a_connection_succeeds() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let book = book(&dir, clock);
        assert!(book.needs_seeding());

        let addr: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        book.add_addresses(&[ta("10.0.0.1:8333", 10)], PeerSource::DnsSeed);
        assert!(!book.needs_seeding());

        book.mark_attempted(&addr);
        assert!(book.needs_seeding());

        book.mark_connected(&addr);
        assert!(!book.needs_seeding());
    }

    #[test]
    fn selection_prefers_recent_and_unattempted_entries() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(100_000));
        let book = book(&dir, clock.clone());
        book.add_addresses(&[ta("10.0.0.1:8333", 99_000), ta("10.0.0.2:8333", 99_000)], PeerSource::Gossip);
        let stale: SocketAddr = "10.0.0.2:8333".parse().unwrap();
        for _ in 0..10 {
            book.mark_attempted(&stale);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let picked = book.select_candidates(1, &HashSet::new(), &mut rng);
        assert_eq!(picked, vec!["10.0.0.1:8333".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn book_survives_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        {
            let book = book(&dir, clock.clone());
            book.add_addresses(&[ta("10.0.0.9:8333", 500)], PeerSource::SeedNode);
            book.flush().unwrap();
        }
        let book = book(&dir, clock);
        assert_eq!(book.len(), 1);
        assert!(book.contains(&"10.0.0.9:8333".parse().unwrap()));
    }
}
