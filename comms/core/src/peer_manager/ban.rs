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
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use log::*;

use crate::clock::Clock;

const LOG_TARGET: &str = "comms::peer_manager::ban";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// Unix seconds at which the ban lapses.
    pub until: u64,
    pub reason: String,
}

/// Ban state keyed by remote IP. Bans expire by wall-clock time; expired entries are purged lazily on lookup.
pub struct BanRegistry {
    banned: RwLock<HashMap<IpAddr, BanEntry>>,
    clock: Arc<dyn Clock>,
}

impl BanRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            banned: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a ban and return its entry. An existing ban is extended only if the new expiry is later.
    pub fn ban(&self, ip: IpAddr, duration: Duration, reason: String) -> BanEntry {
        let until = self.clock.now().saturating_add(duration.as_secs());
        let mut banned = self.banned.write().expect("ban registry lock poisoned");
        let entry = banned
            .entry(ip)
            .and_modify(|existing| {
                if until > existing.until {
                    existing.until = until;
                    existing.reason = reason.clone();
                }
            })
            .or_insert_with(|| BanEntry {
                until,
                reason: reason.clone(),
            })
            .clone();
        warn!(target: LOG_TARGET, "Banned {} until {} because {}", ip, entry.until, entry.reason);
        entry
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let now = self.clock.now();
        {
            let banned = self.banned.read().expect("ban registry lock poisoned");
            match banned.get(ip) {
                Some(entry) if entry.until > now => return true,
                Some(_) => {},
                None => return false,
            }
        }
        // The entry has lapsed; purge it
        let mut banned = self.banned.write().expect("ban registry lock poisoned");
        if matches!(banned.get(ip), Some(entry) if entry.until <= now) {
            banned.remove(ip);
        }
        false
    }

    pub fn unban(&self, ip: &IpAddr) -> bool {
        self.banned
            .write()
            .expect("ban registry lock poisoned")
            .remove(ip)
            .is_some()
    }

    pub fn clear(&self) {
        self.banned.write().expect("ban registry lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.banned.read().expect("ban registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, BanRegistry) {
        let clock = Arc::new(ManualClock::new(1000));
        let registry = BanRegistry::new(clock.clone());
        (clock, registry)
    }

    #[test]
    fn banned_until_expiry() {
        let (clock, registry) = setup();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();

        registry.ban(ip, Duration::from_secs(60), "slow".to_string());
        assert!(registry.is_banned(&ip));

        clock.advance_secs(59);
        assert!(registry.is_banned(&ip));

        clock.advance_secs(1);
        assert!(!registry.is_banned(&ip));
        // Lapsed entries are purged
        assert!(registry.is_empty());
    }

    #[test]
    fn unban_lifts_an_active_ban() {
        let (_clock, registry) = setup();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        registry.ban(ip, Duration::from_secs(600), "test".to_string());
        assert!(registry.unban(&ip));
        assert!(!registry.is_banned(&ip));
        assert!(!registry.unban(&ip));
    }

    #[test]
    fn rebanning_never_shortens_an_existing_ban() {
        let (_clock, registry) = setup();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let long = registry.ban(ip, Duration::from_secs(600), "long".to_string());
        let unchanged = registry.ban(ip, Duration::from_secs(10), "short".to_string());
        assert_eq!(long, unchanged);
    }

    #[test]
    fn clear_removes_everything() {
        let (_clock, registry) = setup();
        registry.ban("10.0.0.1".parse().unwrap(), Duration::from_secs(60), "a".to_string());
        registry.ban("10.0.0.2".parse().unwrap(), Duration::from_secs(60), "b".to_string());
        registry.clear();
        assert!(registry.is_empty());
    }
}
