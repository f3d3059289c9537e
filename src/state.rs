//! # Session State
//!
//! The single shared mutable state of a chat client: channel logs, the
//! peer roster, the seen-token set, and the current selection. One
//! `SessionState` lives behind one `parking_lot::Mutex`; inbound claim
//! handlers and the input loop all acquire that lock, mutate, snapshot
//! whatever rendering needs, and release before any rendering or
//! publishing happens. No per-field locks — contention is interactive
//! human-rate.
//!
//! All claims entering this module have already passed the validation
//! gate ([`crate::validate`]); handlers take [`ValidatedClaim`] and
//! nothing else.

use std::collections::HashMap;
use std::time::Duration;

use crate::claims::{ClaimBody, Claims};
use crate::dedup::{SeenTokens, DEFAULT_SEEN_CAPACITY};
use crate::identity::Identity;
use crate::roster::{PostEntry, Roster};
use crate::validate::ValidatedClaim;

/// The fixed channel set. Posts addressed to anything else are ignored.
pub const DEFAULT_CHANNELS: &[&str] = &["general", "random", "dev"];

/// Period between local heartbeat broadcasts.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Freshness expiry carried by each heartbeat: 2x the broadcast period,
/// so one dropped heartbeat does not flip receivers that track expiry.
pub const HEARTBEAT_FRESHNESS_SECS: u64 = 60;

/// What the user is currently looking at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Channel(String),
    /// Selected by locally resolved display name.
    Direct(String),
}

/// Tunables for a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub channels: Vec<String>,
    /// Peer records not refreshed within this window are evicted on the
    /// heartbeat tick. `None` (the default) keeps presence monotonic for
    /// the process lifetime, matching the original deployment's behavior.
    pub peer_ttl: Option<Duration>,
    pub seen_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            peer_ttl: None,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

/// Result of applying a heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceOutcome {
    /// Resolved display name of a newly observed peer.
    pub joined: Option<String>,
    /// The newcomer may not know about us yet; publish our own heartbeat
    /// out-of-cycle so mutual discovery completes within one round-trip.
    pub rebroadcast: bool,
}

/// Result of applying a channel post.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Not a post, or addressed to a channel outside the fixed set.
    Ignored,
    /// Already seen this token identifier; redelivery suppressed.
    Duplicate,
    Appended {
        channel: String,
        /// True when the post landed in the currently selected view.
        visible: bool,
    },
}

/// Result of applying a direct message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DmOutcome {
    /// Not a post claim at all.
    Ignored,
    /// Unsolicited DM from an identity with no peer record: dropped
    /// silently by policy, not an error.
    UnknownSender,
    /// Redelivery suppressed.
    Duplicate,
    Appended {
        from: String,
        visible: bool,
    },
}

/// Where an outbound message is headed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Channel(String),
    Peer(Identity),
}

pub struct SessionState {
    me: Identity,
    name: String,
    channels: Vec<String>,
    posts: HashMap<String, Vec<PostEntry>>,
    roster: Roster,
    seen: SeenTokens,
    cur: Selection,
    peer_ttl: Option<Duration>,
}

impl SessionState {
    /// Build session state for the local identity. The local user appears
    /// in its own roster (names resolve against it too), and the first
    /// channel starts selected.
    pub fn new(me: Identity, display_name: &str, config: SessionConfig) -> Self {
        let mut roster = Roster::new();
        let name = roster.resolve(me, display_name);

        let channels = config.channels;
        let posts = channels
            .iter()
            .map(|c| (c.clone(), Vec::new()))
            .collect::<HashMap<_, _>>();
        let cur = Selection::Channel(channels.first().cloned().unwrap_or_default());

        Self {
            me,
            name,
            channels,
            posts,
            roster,
            seen: SeenTokens::with_capacity(config.seen_capacity),
            cur,
            peer_ttl: config.peer_ttl,
        }
    }

    pub fn me(&self) -> Identity {
        self.me
    }

    /// The local display name (collision-resolved within this session).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn selection(&self) -> &Selection {
        &self.cur
    }

    // ------------------------------------------------------------------
    // Presence Tracker
    // ------------------------------------------------------------------

    /// Apply a validated heartbeat claim.
    pub fn apply_heartbeat(&mut self, claim: &ValidatedClaim) -> PresenceOutcome {
        let ClaimBody::Heartbeat { .. } = claim.claims.body else {
            return PresenceOutcome::default();
        };
        let key = claim.claims.iss;
        if key == self.me {
            return PresenceOutcome::default();
        }

        if self.roster.contains(&key) {
            self.roster.mark_seen(&key);
            return PresenceOutcome::default();
        }

        let proposed = proposed_name(&claim.claims);
        let resolved = self.roster.resolve(key, &proposed);
        PresenceOutcome {
            joined: Some(resolved),
            rebroadcast: true,
        }
    }

    /// Drop peers whose last heartbeat is older than the configured TTL.
    /// No-op unless eviction was enabled. Returns evicted display names.
    pub fn evict_stale_peers(&mut self) -> Vec<String> {
        match self.peer_ttl {
            Some(ttl) => self.roster.evict_stale(ttl, &self.me),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Channel posts
    // ------------------------------------------------------------------

    /// Apply a validated broadcast-channel post.
    pub fn apply_channel_post(&mut self, claim: &ValidatedClaim) -> PostOutcome {
        let ClaimBody::Post { text } = &claim.claims.body else {
            return PostOutcome::Ignored;
        };
        let channel = claim.claims.sub.clone();
        if !self.posts.contains_key(&channel) {
            return PostOutcome::Ignored;
        }
        if self.seen.observe(&claim.claims.jti) {
            return PostOutcome::Duplicate;
        }

        let entry = entry_from(&claim.claims, text);
        let visible = self.cur == Selection::Channel(channel.clone());
        if let Some(log) = self.posts.get_mut(&channel) {
            log.push(entry);
        }
        PostOutcome::Appended { channel, visible }
    }

    // ------------------------------------------------------------------
    // Direct messages
    // ------------------------------------------------------------------

    /// Apply a validated direct message. Senders without an existing peer
    /// record are dropped; redeliveries are suppressed by token id.
    pub fn apply_direct_message(&mut self, claim: &ValidatedClaim) -> DmOutcome {
        let ClaimBody::Post { text } = &claim.claims.body else {
            return DmOutcome::Ignored;
        };
        let sender = claim.claims.iss;
        if !self.roster.contains(&sender) {
            return DmOutcome::UnknownSender;
        }
        if self.seen.observe(&claim.claims.jti) {
            return DmOutcome::Duplicate;
        }

        let entry = entry_from(&claim.claims, text);
        let (from, visible) = {
            let record = match self.roster.get_mut(&sender) {
                Some(record) => record,
                None => return DmOutcome::UnknownSender,
            };
            record.posts.push(entry);
            let visible = self.cur == Selection::Direct(record.name.clone());
            if !visible {
                record.unread = true;
            }
            (record.name.clone(), visible)
        };
        DmOutcome::Appended { from, visible }
    }

    // ------------------------------------------------------------------
    // Outbound composition
    // ------------------------------------------------------------------

    /// Where a message composed right now would go.
    pub fn current_target(&self) -> Option<Target> {
        match &self.cur {
            Selection::Channel(name) => Some(Target::Channel(name.clone())),
            Selection::Direct(name) => self.roster.key_for_name(name).map(Target::Peer),
        }
    }

    /// Record our own outbound post locally. Registers the token id (the
    /// transport suppresses echo, but relays may still redeliver) and
    /// appends to the current view's log without round-tripping.
    pub fn append_own_post(&mut self, claims: &Claims) {
        let ClaimBody::Post { text } = &claims.body else {
            return;
        };
        self.seen.observe(&claims.jti);
        let entry = entry_from(claims, text);

        match &self.cur {
            Selection::Channel(name) => {
                if let Some(log) = self.posts.get_mut(name) {
                    log.push(entry);
                }
            }
            Selection::Direct(name) => {
                if let Some(key) = self.roster.key_for_name(name) {
                    if let Some(record) = self.roster.get_mut(&key) {
                        record.posts.push(entry);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Select a channel view. Returns the stored log for repopulating the
    /// display, or `None` for channels outside the fixed set. Never
    /// mutates stored messages.
    pub fn select_channel(&mut self, name: &str) -> Option<Vec<PostEntry>> {
        let log = self.posts.get(name)?.clone();
        self.cur = Selection::Channel(name.to_string());
        Some(log)
    }

    /// Select a direct-message view by display name. Clears the unread
    /// marker and returns the stored log.
    pub fn select_peer(&mut self, name: &str) -> Option<Vec<PostEntry>> {
        let key = self.roster.key_for_name(name)?;
        let record = self.roster.get_mut(&key)?;
        record.unread = false;
        let log = record.posts.clone();
        self.cur = Selection::Direct(name.to_string());
        Some(log)
    }

    // ------------------------------------------------------------------
    // Rendering helpers
    // ------------------------------------------------------------------

    /// Resolve the display name for a stored entry: the locally resolved
    /// name when the sender is known, otherwise the name the claim carried.
    pub fn render_name(&self, entry: &PostEntry) -> String {
        self.roster
            .display_name(&entry.from, &entry.claimed_name)
            .to_string()
    }

    /// Same resolution for a live claim.
    pub fn display_name_for(&self, claims: &Claims) -> String {
        self.roster
            .display_name(&claims.iss, &claims.name)
            .to_string()
    }

    /// Online peers in display order: (name, seconds since last seen,
    /// unread flag).
    pub fn who(&self) -> Vec<(String, u64, bool)> {
        self.roster
            .sorted()
            .into_iter()
            .map(|record| {
                (
                    record.name.clone(),
                    record.last_seen.elapsed().as_secs(),
                    record.unread,
                )
            })
            .collect()
    }
}

/// Name to propose to the roster for a claim: the carried display name,
/// or a key-prefix placeholder when the claim carried none (empty names
/// validate as a warning, not a rejection).
fn proposed_name(claims: &Claims) -> String {
    if claims.name.is_empty() {
        let hex = claims.iss.to_hex();
        hex[..8].to_string()
    } else {
        claims.name.clone()
    }
}

fn entry_from(claims: &Claims, text: &str) -> PostEntry {
    PostEntry {
        id: claims.jti.clone(),
        from: claims.iss,
        claimed_name: claims.name.clone(),
        text: text.to_string(),
        at: claims.iat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::encode_signed;
    use crate::identity::Keypair;
    use crate::validate::validate_claim;

    fn validated(claims: &Claims, keypair: &Keypair) -> ValidatedClaim {
        let raw = encode_signed(claims, keypair).expect("encode");
        validate_claim(raw.as_bytes()).expect("validate")
    }

    fn session() -> (SessionState, Keypair) {
        let me = Keypair::generate();
        let state = SessionState::new(me.identity(), "derek", SessionConfig::default());
        (state, me)
    }

    fn heartbeat_from(keypair: &Keypair, name: &str) -> ValidatedClaim {
        validated(
            &Claims::heartbeat(keypair.identity(), name, 60, false),
            keypair,
        )
    }

    #[test]
    fn first_heartbeat_joins_and_requests_rebroadcast() {
        let (mut state, _) = session();
        let peer = Keypair::generate();

        let outcome = state.apply_heartbeat(&heartbeat_from(&peer, "wally"));
        assert_eq!(outcome.joined, Some("wally".to_string()));
        assert!(outcome.rebroadcast);

        // Second heartbeat only refreshes.
        let outcome = state.apply_heartbeat(&heartbeat_from(&peer, "wally"));
        assert_eq!(outcome, PresenceOutcome::default());
    }

    #[test]
    fn own_heartbeat_is_ignored() {
        let (mut state, me) = session();
        let outcome = state.apply_heartbeat(&heartbeat_from(&me, "derek"));
        assert_eq!(outcome, PresenceOutcome::default());
    }

    #[test]
    fn colliding_heartbeats_get_suffixed_names() {
        let (mut state, _) = session();
        let a = Keypair::generate();
        let b = Keypair::generate();

        // Local user already holds "derek"; two peers claim it too.
        let first = state.apply_heartbeat(&heartbeat_from(&a, "derek"));
        let second = state.apply_heartbeat(&heartbeat_from(&b, "derek"));
        assert_eq!(first.joined, Some("derek(2)".to_string()));
        assert_eq!(second.joined, Some("derek(3)".to_string()));
    }

    #[test]
    fn channel_post_appends_once() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        let post = validated(
            &Claims::post(peer.identity(), "wally", "general", "Welcome to OSCON"),
            &peer,
        );

        assert_eq!(
            state.apply_channel_post(&post),
            PostOutcome::Appended {
                channel: "general".to_string(),
                visible: true,
            }
        );
        // Redelivery of the same claim is suppressed.
        assert_eq!(state.apply_channel_post(&post), PostOutcome::Duplicate);
    }

    #[test]
    fn posts_to_unknown_channels_are_ignored() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        let post = validated(
            &Claims::post(peer.identity(), "wally", "not-a-channel", "hi"),
            &peer,
        );
        assert_eq!(state.apply_channel_post(&post), PostOutcome::Ignored);
    }

    #[test]
    fn post_to_unselected_channel_is_not_visible() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        let post = validated(&Claims::post(peer.identity(), "wally", "dev", "hi"), &peer);

        match state.apply_channel_post(&post) {
            PostOutcome::Appended { channel, visible } => {
                assert_eq!(channel, "dev");
                assert!(!visible, "selection starts on the first channel");
            }
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn dm_from_unknown_sender_is_dropped() {
        let (mut state, me) = session();
        let stranger = Keypair::generate();
        let dm = validated(
            &Claims::post(stranger.identity(), "sneaky", &me.identity().to_hex(), "psst"),
            &stranger,
        );

        assert_eq!(state.apply_direct_message(&dm), DmOutcome::UnknownSender);
        // Nothing was stored anywhere.
        assert!(state.select_peer("sneaky").is_none());
    }

    #[test]
    fn dm_from_known_peer_appends_and_marks_unread() {
        let (mut state, me) = session();
        let peer = Keypair::generate();
        state.apply_heartbeat(&heartbeat_from(&peer, "wally"));

        let dm = validated(
            &Claims::post(peer.identity(), "wally", &me.identity().to_hex(), "hi derek"),
            &peer,
        );
        assert_eq!(
            state.apply_direct_message(&dm),
            DmOutcome::Appended {
                from: "wally".to_string(),
                visible: false,
            }
        );
        assert_eq!(state.apply_direct_message(&dm), DmOutcome::Duplicate);

        let who = state.who();
        let wally = who.iter().find(|(name, _, _)| name == "wally").expect("wally listed");
        assert!(wally.2, "unread flag set while another view is selected");

        // Selecting the peer surfaces the log and clears unread.
        let log = state.select_peer("wally").expect("peer view");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "hi derek");
        assert!(!state.who().iter().any(|(_, _, unread)| *unread));
    }

    #[test]
    fn selection_repopulates_without_mutating_logs() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        for text in ["one", "two"] {
            let post = validated(
                &Claims::post(peer.identity(), "wally", "general", text),
                &peer,
            );
            state.apply_channel_post(&post);
        }

        let log = state.select_channel("general").expect("channel view");
        assert_eq!(log.len(), 2);
        let again = state.select_channel("general").expect("channel view");
        assert_eq!(log, again, "selection never mutates stored messages");
        assert!(state.select_channel("nope").is_none());
    }

    #[test]
    fn own_posts_append_locally_and_dedup_future_echo() {
        let (mut state, me) = session();
        let claims = Claims::post(me.identity(), "derek", "general", "Hello Portland!");
        state.append_own_post(&claims);

        let log = state.select_channel("general").expect("channel view");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "Hello Portland!");

        // If the transport redelivers our own post anyway, it is a dup.
        let redelivered = validated(&claims, &me);
        assert_eq!(state.apply_channel_post(&redelivered), PostOutcome::Duplicate);
    }

    #[test]
    fn current_target_follows_selection() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        state.apply_heartbeat(&heartbeat_from(&peer, "wally"));

        assert_eq!(
            state.current_target(),
            Some(Target::Channel("general".to_string()))
        );
        state.select_peer("wally").expect("peer view");
        assert_eq!(state.current_target(), Some(Target::Peer(peer.identity())));
    }

    #[test]
    fn eviction_is_off_by_default_and_configurable() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        state.apply_heartbeat(&heartbeat_from(&peer, "wally"));
        assert!(state.evict_stale_peers().is_empty(), "monotonic by default");

        let mut config = SessionConfig::default();
        config.peer_ttl = Some(Duration::from_secs(0));
        let me = Keypair::generate();
        let mut state = SessionState::new(me.identity(), "derek", config);
        state.apply_heartbeat(&heartbeat_from(&peer, "wally"));
        assert_eq!(state.evict_stale_peers(), vec!["wally".to_string()]);
    }

    #[test]
    fn render_name_prefers_local_resolution() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        // Peer collides with the local "derek" and resolves to derek(2).
        state.apply_heartbeat(&heartbeat_from(&peer, "derek"));

        let entry = PostEntry {
            id: "t".to_string(),
            from: peer.identity(),
            claimed_name: "derek".to_string(),
            text: "hi".to_string(),
            at: 0,
        };
        assert_eq!(state.render_name(&entry), "derek(2)");

        let stranger = Keypair::generate();
        let entry = PostEntry {
            id: "t2".to_string(),
            from: stranger.identity(),
            claimed_name: "ghost".to_string(),
            text: "hi".to_string(),
            at: 0,
        };
        assert_eq!(state.render_name(&entry), "ghost", "fallback to claimed name");
    }

    #[test]
    fn heartbeat_without_name_gets_key_prefix() {
        let (mut state, _) = session();
        let peer = Keypair::generate();
        let hb = validated(&Claims::heartbeat(peer.identity(), "", 60, true), &peer);

        let outcome = state.apply_heartbeat(&hb);
        let expected = peer.identity().to_hex()[..8].to_string();
        assert_eq!(outcome.joined, Some(expected));
    }
}
