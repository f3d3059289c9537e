//! # Peer Roster and Name Resolution
//!
//! Maps cryptographic identities (public keys) to human display names and
//! accumulates per-peer state: last-heartbeat time, direct-message log,
//! display position, unread marker.
//!
//! ## Collision Policy
//!
//! Display names are canonicalized to at most eight characters at issuance
//! with no uniqueness check, so collisions are expected. The first key to
//! claim a name keeps it; later keys probe `name(2)`, `name(3)`, ... and
//! adopt the first unbound candidate for the rest of the session.
//! Resolution is local-only: two peers observing collisions in a different
//! order may assign different suffixes to the same remote identity. There
//! is no global naming authority, so that inconsistency is accepted.

use std::collections::HashMap;
use std::time::Instant;

use crate::identity::Identity;

/// Bound on collision-suffix probing. Exhausting it would require ten
/// thousand distinct keys claiming the same eight-character name, which is
/// treated as an unrecoverable invariant violation rather than a runtime
/// condition.
const MAX_NAME_PROBES: u32 = 10_000;

/// A stored chat message, kept exactly as accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostEntry {
    /// Unique token identifier of the originating claim.
    pub id: String,
    /// The sender's public key.
    pub from: Identity,
    /// Display name carried by the claim (render-time lookup may
    /// substitute the locally resolved name).
    pub claimed_name: String,
    /// Message body.
    pub text: String,
    /// Issue time (seconds since Unix epoch).
    pub at: u64,
}

/// Local derived state for one observed identity.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Locally resolved display name, unique within this roster.
    pub name: String,
    pub key: Identity,
    /// Accumulated direct-message log with this peer.
    pub posts: Vec<PostEntry>,
    /// Last valid heartbeat or first sighting.
    pub last_seen: Instant,
    /// Stable position for display ordering (assignment order).
    pub position: usize,
    /// Unread direct messages pending while another view is selected.
    pub unread: bool,
}

#[derive(Default)]
pub struct Roster {
    peers: HashMap<Identity, PeerRecord>,
    by_name: HashMap<String, Identity>,
    next_position: usize,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new identity under `proposed` name, resolving collisions.
    ///
    /// Returns the final display name. If the key is already present, its
    /// existing name is returned unchanged (names are stable for the
    /// session lifetime).
    ///
    /// # Panics
    ///
    /// Panics if the collision-probe bound is exhausted; see
    /// [`MAX_NAME_PROBES`].
    pub fn resolve(&mut self, key: Identity, proposed: &str) -> String {
        if let Some(existing) = self.peers.get(&key) {
            return existing.name.clone();
        }

        let name = self.disambiguate(key, proposed);
        let position = self.next_position;
        self.next_position += 1;

        self.by_name.insert(name.clone(), key);
        self.peers.insert(
            key,
            PeerRecord {
                name: name.clone(),
                key,
                posts: Vec::new(),
                last_seen: Instant::now(),
                position,
                unread: false,
            },
        );
        name
    }

    fn disambiguate(&self, key: Identity, proposed: &str) -> String {
        match self.by_name.get(proposed) {
            None => return proposed.to_string(),
            Some(bound) if *bound == key => return proposed.to_string(),
            Some(_) => {}
        }

        for i in 2..2 + MAX_NAME_PROBES {
            let candidate = format!("{proposed}({i})");
            if !self.by_name.contains_key(&candidate) {
                return candidate;
            }
        }
        panic!("name collision alternatives exhausted for {proposed:?}");
    }

    /// Look up the locally resolved display name for a key, falling back
    /// to the name embedded in the claim when the key is not yet known.
    /// Used for defensive rendering of claims from not-yet-synced peers.
    pub fn display_name<'a>(&'a self, key: &Identity, claimed: &'a str) -> &'a str {
        match self.peers.get(key) {
            Some(record) => &record.name,
            None => claimed,
        }
    }

    pub fn contains(&self, key: &Identity) -> bool {
        self.peers.contains_key(key)
    }

    pub fn get(&self, key: &Identity) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    pub fn get_mut(&mut self, key: &Identity) -> Option<&mut PeerRecord> {
        self.peers.get_mut(key)
    }

    pub fn key_for_name(&self, name: &str) -> Option<Identity> {
        self.by_name.get(name).copied()
    }

    pub fn mark_seen(&mut self, key: &Identity) {
        if let Some(record) = self.peers.get_mut(key) {
            record.last_seen = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in display order (assignment order).
    pub fn sorted(&self) -> Vec<&PeerRecord> {
        let mut peers: Vec<&PeerRecord> = self.peers.values().collect();
        peers.sort_by_key(|record| record.position);
        peers
    }

    /// Drop records not seen within `ttl`, freeing their display names.
    /// Returns the evicted names. `keep` is never evicted (the local user
    /// does not heartbeat to itself).
    pub fn evict_stale(&mut self, ttl: std::time::Duration, keep: &Identity) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<Identity> = self
            .peers
            .values()
            .filter(|record| record.key != *keep && now.duration_since(record.last_seen) >= ttl)
            .map(|record| record.key)
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(record) = self.peers.remove(&key) {
                self.by_name.remove(&record.name);
                evicted.push(record.name);
            }
        }
        evicted
    }
}
