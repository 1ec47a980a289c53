//! Tests for Coordinator
//!
//! These tests verify:
//! - Party lifecycle (create, invite, accept, decline, leave, kick,
//!   transfer, disband, disconnect, open join)
//! - Leadership handover and invitation migration
//! - Invitation expiry
//! - Exactly-one-winner behavior under concurrent operations
//! - Invitations issued while a party is being swept are never orphaned
//! - Commits whose acknowledgement is lost complete exactly once
//! - Events published for committed changes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use partysync::bus::{EventBus, PARTY_EVENTS};
use partysync::clock::ManualClock;
use partysync::config::Config;
use partysync::coordinator::{Coordinator, LeaveOutcome};
use partysync::model::{keys, EventKind, PartyEvent, PlayerId};
use partysync::store::{CommitOutcome, MemoryStore, SharedStore, Subscription, Transaction, Versioned};
use partysync::{PartyError, Result};
use uuid::Uuid;

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    clock: ManualClock,
    memory: Arc<MemoryStore>,
    coord: Coordinator,
}

fn setup() -> Fixture {
    setup_with(Config::builder().node_id("node-a").invite_ttl_secs(30).build())
}

fn setup_with(config: Config) -> Fixture {
    let clock = ManualClock::default();
    let memory = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let store: Arc<dyn SharedStore> = memory.clone();
    let coord = Coordinator::new(Arc::clone(&store), &config)
        .with_bus(EventBus::new(store))
        .with_clock(Arc::new(clock.clone()));
    Fixture {
        clock,
        memory,
        coord,
    }
}

fn player() -> PlayerId {
    Uuid::new_v4()
}

/// Party led by the first player, with the others joined in order
fn party_of(coord: &Coordinator, players: &[PlayerId]) {
    coord.create_party(players[0]).unwrap();
    for member in &players[1..] {
        coord.invite(players[0], *member).unwrap();
        coord.accept_invite(*member, players[0]).unwrap();
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runs a hook once, right after the first scan of `prefix` returns
struct InterleavingStore {
    inner: Arc<MemoryStore>,
    prefix: String,
    hook: Mutex<Option<Hook>>,
}

impl InterleavingStore {
    fn new(inner: Arc<MemoryStore>, prefix: String, hook: Hook) -> Self {
        Self {
            inner,
            prefix,
            hook: Mutex::new(Some(hook)),
        }
    }
}

impl SharedStore for InterleavingStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.inner.get(key)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.inner.scan(prefix)?;
        if prefix == self.prefix {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(entries)
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        self.inner.commit(txn)
    }

    fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.inner.subscribe(channel)
    }

    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }
}

/// Fails commits on demand: `lost_acks` apply and then report an outage,
/// `refused` report an outage without applying. `on_refuse` runs once, after
/// the first refusal.
struct FlakyCommits {
    inner: Arc<MemoryStore>,
    lost_acks: AtomicUsize,
    refused: AtomicUsize,
    on_refuse: Mutex<Option<Hook>>,
}

impl FlakyCommits {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            lost_acks: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
            on_refuse: Mutex::new(None),
        }
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SharedStore for FlakyCommits {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.inner.get(key)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.inner.scan(prefix)
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        if Self::take(&self.refused) {
            let hook = self.on_refuse.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            return Err(PartyError::StoreUnavailable("connection reset".to_string()));
        }
        let outcome = self.inner.commit(txn)?;
        if Self::take(&self.lost_acks) {
            return Err(PartyError::StoreUnavailable("reply lost".to_string()));
        }
        Ok(outcome)
    }

    fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.inner.subscribe(channel)
    }

    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }
}

fn flaky_setup() -> (Arc<MemoryStore>, Arc<FlakyCommits>, Coordinator) {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyCommits::new(Arc::clone(&memory)));
    let store: Arc<dyn SharedStore> = flaky.clone();
    let config = Config::builder()
        .node_id("node-a")
        .store_retries(5)
        .backoff_ms(1, 5)
        .build();
    let coord = Coordinator::new(Arc::clone(&store), &config).with_bus(EventBus::new(store));
    (memory, flaky, coord)
}

fn drain_events(subscription: &Subscription) -> Vec<PartyEvent> {
    let mut events = Vec::new();
    while let Ok(message) = subscription.try_recv() {
        events.push(serde_json::from_slice(&message.payload).unwrap());
    }
    events
}

// =============================================================================
// Create Tests
// =============================================================================

#[test]
fn test_create_party() {
    let f = setup();
    let leader = player();

    let party = f.coord.create_party(leader).unwrap();

    assert_eq!(party.leader, leader);
    assert_eq!(party.members, vec![leader]);
    assert_eq!(f.coord.party(leader).unwrap(), Some(party.clone()));
    assert_eq!(f.coord.party_of(leader).unwrap(), Some(party));
}

#[test]
fn test_create_party_twice() {
    let f = setup();
    let leader = player();

    f.coord.create_party(leader).unwrap();
    let err = f.coord.create_party(leader).unwrap_err();

    assert!(matches!(err, PartyError::AlreadyInParty(p) if p == leader));
}

#[test]
fn test_create_party_while_member_elsewhere() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);

    let err = f.coord.create_party(b).unwrap_err();
    assert!(matches!(err, PartyError::AlreadyInParty(_)));
}

// =============================================================================
// Invite Tests
// =============================================================================

#[test]
fn test_invite_and_list() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();

    let invite = f.coord.invite(leader, invitee).unwrap();

    assert_eq!(invite.expires_at - invite.created_at, 30_000);
    assert_eq!(f.coord.invitations_for(invitee).unwrap(), vec![invite.clone()]);
    assert_eq!(f.coord.invitations_of(leader).unwrap(), vec![invite]);
}

#[test]
fn test_invite_requires_leader() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);

    assert!(matches!(
        f.coord.invite(b, c).unwrap_err(),
        PartyError::NotPartyLeader(p) if p == b
    ));
    assert!(matches!(
        f.coord.invite(player(), c).unwrap_err(),
        PartyError::NotPartyLeader(_)
    ));
}

#[test]
fn test_invite_validation() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);

    assert!(matches!(f.coord.invite(a, a).unwrap_err(), PartyError::CannotTargetSelf(_)));
    assert!(matches!(
        f.coord.invite(a, b).unwrap_err(),
        PartyError::InviteeAlreadyMember(p) if p == b
    ));

    f.coord.invite(a, c).unwrap();
    assert!(matches!(
        f.coord.invite(a, c).unwrap_err(),
        PartyError::AlreadyInvited { leader, invitee } if leader == a && invitee == c
    ));
}

#[test]
fn test_reinvite_after_expiry() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();

    f.coord.invite(leader, invitee).unwrap();
    f.clock.advance(Duration::from_secs(31));

    assert!(f.coord.invitations_for(invitee).unwrap().is_empty());
    f.coord.invite(leader, invitee).unwrap();
    assert_eq!(f.coord.invitations_for(invitee).unwrap().len(), 1);
}

// =============================================================================
// Accept / Decline Tests
// =============================================================================

#[test]
fn test_accept_invite() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();
    f.coord.invite(leader, invitee).unwrap();

    let party = f.coord.accept_invite(invitee, leader).unwrap();

    assert_eq!(party.members, vec![leader, invitee]);
    assert_eq!(f.coord.party_of(invitee).unwrap().unwrap().id, party.id);
    assert!(f.coord.invitations_for(invitee).unwrap().is_empty());
    assert!(f.coord.invitations_of(leader).unwrap().is_empty());
}

#[test]
fn test_accept_consumes_every_invitation() {
    let f = setup();
    let (l1, l2, invitee) = (player(), player(), player());
    f.coord.create_party(l1).unwrap();
    f.coord.create_party(l2).unwrap();
    f.coord.invite(l1, invitee).unwrap();
    f.coord.invite(l2, invitee).unwrap();

    f.coord.accept_invite(invitee, l1).unwrap();

    assert!(f.coord.invitations_for(invitee).unwrap().is_empty());
    assert!(f.coord.invitations_of(l2).unwrap().is_empty());
    assert!(matches!(
        f.coord.accept_invite(invitee, l2).unwrap_err(),
        PartyError::InviteExpiredOrMissing { .. }
    ));
}

#[test]
fn test_accept_expired_invite() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();
    f.coord.invite(leader, invitee).unwrap();

    f.clock.advance(Duration::from_secs(31));

    let err = f.coord.accept_invite(invitee, leader).unwrap_err();
    assert!(matches!(
        err,
        PartyError::InviteExpiredOrMissing { leader: l, invitee: i } if l == leader && i == invitee
    ));
    assert_eq!(f.coord.party(leader).unwrap().unwrap().members, vec![leader]);
}

#[test]
fn test_accept_just_before_expiry() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();
    f.coord.invite(leader, invitee).unwrap();

    f.clock.advance(Duration::from_millis(29_999));

    assert!(f.coord.accept_invite(invitee, leader).is_ok());
}

#[test]
fn test_accept_without_invite() {
    let f = setup();
    let (leader, stranger) = (player(), player());
    f.coord.create_party(leader).unwrap();

    assert!(matches!(
        f.coord.accept_invite(stranger, leader).unwrap_err(),
        PartyError::InviteExpiredOrMissing { .. }
    ));
}

#[test]
fn test_accept_while_in_larger_party() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);
    f.coord.create_party(c).unwrap();
    f.coord.invite(c, b).unwrap();

    let err = f.coord.accept_invite(b, c).unwrap_err();

    assert!(matches!(err, PartyError::InviteeAlreadyInOtherParty(p) if p == b));
    assert_eq!(f.coord.party_of(b).unwrap().unwrap().leader, a);
}

#[test]
fn test_accept_dissolves_solo_party() {
    let f = setup();
    let (a, b) = (player(), player());
    f.coord.create_party(a).unwrap();
    f.coord.create_party(b).unwrap();
    f.coord.invite(a, b).unwrap();

    let party = f.coord.accept_invite(b, a).unwrap();

    assert_eq!(party.members, vec![a, b]);
    assert!(f.coord.party(b).unwrap().is_none());
    assert_eq!(f.coord.party_of(b).unwrap().unwrap().leader, a);
}

#[test]
fn test_decline_invite() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();
    f.coord.invite(leader, invitee).unwrap();

    f.coord.decline_invite(invitee, leader).unwrap();

    assert!(f.coord.invitations_for(invitee).unwrap().is_empty());
    assert!(matches!(
        f.coord.accept_invite(invitee, leader).unwrap_err(),
        PartyError::InviteExpiredOrMissing { .. }
    ));
}

#[test]
fn test_decline_missing_invite_is_noop() {
    let f = setup();
    let events = f.memory.subscribe(PARTY_EVENTS).unwrap();

    f.coord.decline_invite(player(), player()).unwrap();

    assert!(drain_events(&events).is_empty());
}

// =============================================================================
// Leave Tests
// =============================================================================

#[test]
fn test_member_leaves() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b, c]);

    let outcome = f.coord.leave_party(c).unwrap();

    match outcome {
        LeaveOutcome::Left(party) => assert_eq!(party.members, vec![a, b]),
        other => panic!("Expected Left, got {:?}", other),
    }
    assert!(f.coord.party_of(c).unwrap().is_none());
}

#[test]
fn test_leader_leaves_hands_over_to_earliest_member() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b, c]);
    let before = f.coord.party(a).unwrap().unwrap();

    let outcome = f.coord.leave_party(a).unwrap();

    let party = match outcome {
        LeaveOutcome::LeaderChanged(party) => party,
        other => panic!("Expected LeaderChanged, got {:?}", other),
    };
    assert_eq!(party.leader, b);
    assert_eq!(party.members, vec![b, c]);
    assert_eq!(party.id, before.id);

    assert!(f.coord.party(a).unwrap().is_none());
    assert_eq!(f.coord.party(b).unwrap(), Some(party.clone()));
    assert_eq!(f.coord.party_of(c).unwrap(), Some(party));
    assert!(f.coord.party_of(a).unwrap().is_none());
}

#[test]
fn test_leader_leave_migrates_invitations() {
    let f = setup();
    let (a, b, d) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);
    let original = f.coord.invite(a, d).unwrap();

    f.clock.advance(Duration::from_secs(10));
    f.coord.leave_party(a).unwrap();

    let invites = f.coord.invitations_for(d).unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].leader, b);
    assert_eq!(invites[0].expires_at, original.expires_at);
    assert!(f.coord.invitations_of(a).unwrap().is_empty());

    // Remaining lifetime is kept, not restarted
    f.clock.advance(Duration::from_secs(21));
    assert!(matches!(
        f.coord.accept_invite(d, b).unwrap_err(),
        PartyError::InviteExpiredOrMissing { .. }
    ));
}

#[test]
fn test_migrated_invitation_can_be_accepted() {
    let f = setup();
    let (a, b, d) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);
    f.coord.invite(a, d).unwrap();
    f.coord.leave_party(a).unwrap();

    let party = f.coord.accept_invite(d, b).unwrap();
    assert_eq!(party.members, vec![b, d]);
}

#[test]
fn test_last_member_leaving_disbands() {
    let f = setup();
    let (leader, invitee) = (player(), player());
    f.coord.create_party(leader).unwrap();
    f.coord.invite(leader, invitee).unwrap();

    let outcome = f.coord.leave_party(leader).unwrap();

    assert!(matches!(outcome, LeaveOutcome::Disbanded(_)));
    assert!(outcome.party().is_none());
    assert!(f.coord.party(leader).unwrap().is_none());
    assert!(f.coord.invitations_for(invitee).unwrap().is_empty());
}

#[test]
fn test_leave_without_party() {
    let f = setup();
    let p = player();
    assert!(matches!(f.coord.leave_party(p).unwrap_err(), PartyError::NotInParty(x) if x == p));
}

// =============================================================================
// Kick / Transfer / Disband Tests
// =============================================================================

#[test]
fn test_kick() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b, c]);

    let party = f.coord.kick(a, b).unwrap();

    assert_eq!(party.members, vec![a, c]);
    assert!(f.coord.party_of(b).unwrap().is_none());
}

#[test]
fn test_kick_validation() {
    let f = setup();
    let (a, b, outsider) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);

    assert!(matches!(f.coord.kick(b, a).unwrap_err(), PartyError::NotPartyLeader(_)));
    assert!(matches!(f.coord.kick(a, a).unwrap_err(), PartyError::CannotTargetSelf(_)));
    assert!(matches!(
        f.coord.kick(a, outsider).unwrap_err(),
        PartyError::TargetNotMember(p) if p == outsider
    ));
}

#[test]
fn test_transfer_leadership() {
    let f = setup();
    let (a, b, c) = (player(), player(), player());
    party_of(&f.coord, &[a, b, c]);
    let before = f.coord.party(a).unwrap().unwrap();

    let party = f.coord.transfer_leadership(a, c).unwrap();

    assert_eq!(party.leader, c);
    assert_eq!(party.members, vec![a, b, c]);
    assert_eq!(party.id, before.id);
    assert!(party.revision > before.revision);
    assert!(f.coord.party(a).unwrap().is_none());
    for member in [a, b, c] {
        assert_eq!(f.coord.party_of(member).unwrap().unwrap().leader, c);
    }
}

#[test]
fn test_transfer_validation() {
    let f = setup();
    let (a, b, outsider) = (player(), player(), player());
    party_of(&f.coord, &[a, b]);

    assert!(matches!(
        f.coord.transfer_leadership(a, outsider).unwrap_err(),
        PartyError::TargetNotMember(_)
    ));
    assert!(matches!(
        f.coord.transfer_leadership(b, a).unwrap_err(),
        PartyError::NotPartyLeader(_)
    ));
    assert!(matches!(
        f.coord.transfer_leadership(a, a).unwrap_err(),
        PartyError::CannotTargetSelf(_)
    ));
}

#[test]
fn test_disband() {
    let f = setup();
    let (a, b, c, d) = (player(), player(), player(), player());
    party_of(&f.coord, &[a, b, c]);
    f.coord.invite(a, d).unwrap();

    let former = f.coord.disband(a).unwrap();

    assert_eq!(former.members, vec![a, b, c]);
    for member in [a, b, c] {
        assert!(f.coord.party_of(member).unwrap().is_none());
    }
    assert!(f.coord.invitations_for(d).unwrap().is_empty());

    // Only commit markers remain, and they expire
    let left: Vec<String> = f.memory.scan("").unwrap().into_iter().map(|(k, _)| k).collect();
    assert!(left.iter().all(|k| k.starts_with(keys::COMMIT_PREFIX)), "{:?}", left);
    f.clock.advance(Duration::from_secs(301));
    assert!(f.memory.is_empty());
}

#[test]
fn test_disband_requires_leader() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);

    assert!(matches!(f.coord.disband(b).unwrap_err(), PartyError::NotPartyLeader(_)));
    assert!(f.coord.party(a).unwrap().is_some());
}

// =============================================================================
// Disconnect Tests
// =============================================================================

#[test]
fn test_disconnect_leaves_party() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);

    let outcome = f.coord.disconnect(a).unwrap();

    assert!(matches!(outcome, Some(LeaveOutcome::LeaderChanged(ref p)) if p.leader == b));
}

#[test]
fn test_duplicate_disconnect_is_noop() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);
    let events = f.memory.subscribe(PARTY_EVENTS).unwrap();

    assert!(f.coord.disconnect(b).unwrap().is_some());
    assert_eq!(drain_events(&events).len(), 1);

    assert!(f.coord.disconnect(b).unwrap().is_none());
    assert!(drain_events(&events).is_empty());
    assert_eq!(f.coord.party(a).unwrap().unwrap().members, vec![a]);
}

// =============================================================================
// Open Party Tests
// =============================================================================

#[test]
fn test_join_open_party() {
    let f = setup();
    let (leader, joiner) = (player(), player());
    f.coord.create_party(leader).unwrap();

    assert!(matches!(
        f.coord.join_party(joiner, leader).unwrap_err(),
        PartyError::PartyClosed(_)
    ));

    let opened = f.coord.set_open(leader, true).unwrap();
    assert!(opened.open);

    let party = f.coord.join_party(joiner, leader).unwrap();
    assert_eq!(party.members, vec![leader, joiner]);
}

#[test]
fn test_join_missing_party() {
    let f = setup();
    assert!(matches!(
        f.coord.join_party(player(), player()).unwrap_err(),
        PartyError::PartyNotFound(_)
    ));
}

#[test]
fn test_set_open_unchanged_keeps_revision() {
    let f = setup();
    let leader = player();
    let created = f.coord.create_party(leader).unwrap();

    let same = f.coord.set_open(leader, false).unwrap();
    assert_eq!(same.revision, created.revision);
}

// =============================================================================
// Member Limit Tests
// =============================================================================

#[test]
fn test_member_limit() {
    let f = setup_with(Config::builder().member_limit(Some(2)).build());
    let (a, b, c) = (player(), player(), player());
    f.coord.create_party(a).unwrap();
    f.coord.invite(a, b).unwrap();
    f.coord.invite(a, c).unwrap();

    f.coord.accept_invite(b, a).unwrap();

    assert!(matches!(
        f.coord.accept_invite(c, a).unwrap_err(),
        PartyError::PartyFull { limit: 2, .. }
    ));
    assert!(matches!(
        f.coord.invite(a, player()).unwrap_err(),
        PartyError::PartyFull { .. }
    ));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_accepts_of_one_invitee() {
    let config = Config::builder().conflict_retries(20).build();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let coord = Arc::new(Coordinator::new(store, &config));

    let (l1, l2, invitee) = (player(), player(), player());
    coord.create_party(l1).unwrap();
    coord.create_party(l2).unwrap();
    coord.invite(l1, invitee).unwrap();
    coord.invite(l2, invitee).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [l1, l2]
        .into_iter()
        .map(|leader| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coord.accept_invite(invitee, leader)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let joined = coord.party_of(invitee).unwrap().unwrap();
    let other = if joined.leader == l1 { l2 } else { l1 };
    assert!(!coord.party(other).unwrap().unwrap().is_member(invitee));
}

#[test]
fn test_concurrent_joins_respect_member_limit() {
    let config = Config::builder()
        .member_limit(Some(3))
        .conflict_retries(50)
        .build();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let coord = Arc::new(Coordinator::new(store, &config));

    let leader = player();
    coord.create_party(leader).unwrap();
    coord.set_open(leader, true).unwrap();

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coord.join_party(player(), leader)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let joined = results.iter().filter(|r| r.is_ok()).count();
    let party = coord.party(leader).unwrap().unwrap();
    assert_eq!(party.size(), joined + 1);
    assert!(party.size() <= 3);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            result,
            PartyError::PartyFull { .. } | PartyError::ConcurrentModification { .. }
        ));
    }
}

#[test]
fn test_concurrent_leaves_keep_leader_a_member() {
    let config = Config::builder().conflict_retries(50).build();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let coord = Arc::new(Coordinator::new(store, &config));

    let players: Vec<PlayerId> = (0..5).map(|_| player()).collect();
    party_of(&coord, &players);

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = players[..3]
        .iter()
        .map(|p| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            let p = *p;
            thread::spawn(move || {
                barrier.wait();
                coord.leave_party(p)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let remaining = coord.party_of(players[4]).unwrap().unwrap();
    assert_eq!(remaining.members, players[3..].to_vec());
    assert!(remaining.is_member(remaining.leader));
    assert_eq!(remaining.leader, players[3]);
}

#[test]
fn test_concurrent_accepts_of_one_invitation() {
    let config = Config::builder().conflict_retries(20).build();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let coord = Arc::new(Coordinator::new(store, &config));

    let (leader, invitee) = (player(), player());
    coord.create_party(leader).unwrap();
    coord.invite(leader, invitee).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coord.accept_invite(invitee, leader)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err, PartyError::InviteExpiredOrMissing { leader: l, invitee: i } if *l == leader && *i == invitee),
            "unexpected {:?}",
            err
        );
    }
    assert_eq!(coord.party(leader).unwrap().unwrap().members, vec![leader, invitee]);
    assert!(coord.invitations_for(invitee).unwrap().is_empty());
}

// =============================================================================
// Interleaving Tests
// =============================================================================

#[test]
fn test_invite_during_disband_sweep_is_removed() {
    let memory = Arc::new(MemoryStore::new());
    let direct: Arc<dyn SharedStore> = memory.clone();
    let setup_coord = Coordinator::new(Arc::clone(&direct), &Config::default());
    let (a, b, late) = (player(), player(), player());
    party_of(&setup_coord, &[a, b]);

    let racer = Coordinator::new(Arc::clone(&direct), &Config::default());
    let racing: Hook = Box::new(move || {
        racer.invite(a, late).unwrap();
    });
    let store: Arc<dyn SharedStore> =
        Arc::new(InterleavingStore::new(Arc::clone(&memory), keys::invites_of(a), racing));
    let coord = Coordinator::new(store, &Config::default());

    coord.disband(a).unwrap();

    assert!(setup_coord.invitations_for(late).unwrap().is_empty());
    assert!(memory.scan(keys::INVITE_PREFIX).unwrap().is_empty());
    assert!(memory.scan(keys::INBOX_PREFIX).unwrap().is_empty());
    assert!(memory.scan(keys::OUTBOX_PREFIX).unwrap().is_empty());
}

#[test]
fn test_invite_during_leader_handover_is_migrated() {
    let memory = Arc::new(MemoryStore::new());
    let direct: Arc<dyn SharedStore> = memory.clone();
    let setup_coord = Coordinator::new(Arc::clone(&direct), &Config::default());
    let (a, b, late) = (player(), player(), player());
    party_of(&setup_coord, &[a, b]);

    let racer = Coordinator::new(Arc::clone(&direct), &Config::default());
    let racing: Hook = Box::new(move || {
        racer.invite(a, late).unwrap();
    });
    let store: Arc<dyn SharedStore> =
        Arc::new(InterleavingStore::new(Arc::clone(&memory), keys::invites_of(a), racing));
    let coord = Coordinator::new(store, &Config::default());

    let outcome = coord.leave_party(a).unwrap();
    assert!(matches!(outcome, LeaveOutcome::LeaderChanged(ref p) if p.leader == b));

    let pending = setup_coord.invitations_for(late).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].leader, b);
    assert!(memory.scan(&keys::invites_of(a)).unwrap().is_empty());
    setup_coord.accept_invite(late, b).unwrap();
}

// =============================================================================
// Lost Acknowledgement Tests
// =============================================================================

#[test]
fn test_create_party_with_lost_ack_completes_once() {
    let (memory, flaky, coord) = flaky_setup();
    let events = memory.subscribe(PARTY_EVENTS).unwrap();
    let leader = player();
    flaky.lost_acks.store(1, Ordering::SeqCst);

    let party = coord.create_party(leader).unwrap();

    assert_eq!(coord.party(leader).unwrap(), Some(party));
    let received = drain_events(&events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, EventKind::PartyCreated);
}

#[test]
fn test_invite_with_lost_ack_is_not_reported_as_duplicate() {
    let (_memory, flaky, coord) = flaky_setup();
    let (leader, invitee) = (player(), player());
    coord.create_party(leader).unwrap();
    flaky.lost_acks.store(2, Ordering::SeqCst);

    let invite = coord.invite(leader, invitee).unwrap();

    assert_eq!(coord.invitations_for(invitee).unwrap(), vec![invite]);
}

#[test]
fn test_accept_with_lost_ack_returns_joined_party() {
    let (_memory, flaky, coord) = flaky_setup();
    let (leader, invitee) = (player(), player());
    coord.create_party(leader).unwrap();
    coord.invite(leader, invitee).unwrap();
    flaky.lost_acks.store(1, Ordering::SeqCst);

    let party = coord.accept_invite(invitee, leader).unwrap();

    assert_eq!(party.members, vec![leader, invitee]);
    assert_eq!(coord.party_of(invitee).unwrap(), Some(party));
}

#[test]
fn test_refused_commit_is_resent() {
    let (memory, flaky, coord) = flaky_setup();
    let events = memory.subscribe(PARTY_EVENTS).unwrap();
    let leader = player();
    flaky.refused.store(2, Ordering::SeqCst);

    coord.create_party(leader).unwrap();

    assert!(coord.party(leader).unwrap().is_some());
    assert_eq!(drain_events(&events).len(), 1);
}

#[test]
fn test_resend_after_losing_race_replans() {
    let (memory, flaky, coord) = flaky_setup();
    let direct: Arc<dyn SharedStore> = memory.clone();
    let (a, b) = (player(), player());
    coord.create_party(a).unwrap();
    coord.invite(a, b).unwrap();

    // The refused send never applies, and another node accepts for b meanwhile
    let other = Coordinator::new(direct, &Config::default());
    let racing: Hook = Box::new(move || {
        other.accept_invite(b, a).unwrap();
    });
    *flaky.on_refuse.lock() = Some(racing);
    flaky.refused.store(1, Ordering::SeqCst);

    assert!(matches!(
        coord.accept_invite(b, a).unwrap_err(),
        PartyError::InviteExpiredOrMissing { .. }
    ));
    assert_eq!(coord.party(a).unwrap().unwrap().members, vec![a, b]);
}

#[test]
fn test_unconfirmed_commit_gives_up_after_store_retries() {
    let (_memory, flaky, coord) = flaky_setup();
    flaky.refused.store(usize::MAX, Ordering::SeqCst);

    assert!(matches!(
        coord.create_party(player()).unwrap_err(),
        PartyError::StoreUnavailable(_)
    ));
}

// =============================================================================
// Event Tests
// =============================================================================

#[test]
fn test_events_carry_origin_and_state() {
    let f = setup();
    let events = f.memory.subscribe(PARTY_EVENTS).unwrap();
    let (a, b) = (player(), player());

    party_of(&f.coord, &[a, b]);

    let received = drain_events(&events);
    let kinds: Vec<&EventKind> = received.iter().map(|e| &e.kind).collect();
    assert!(matches!(kinds[0], EventKind::PartyCreated));
    assert!(matches!(kinds[1], EventKind::InviteCreated { invitee, .. } if *invitee == b));
    assert!(matches!(kinds[2], EventKind::MemberJoined));

    let joined = &received[2];
    assert_eq!(joined.origin, "node-a");
    assert_eq!(joined.members, vec![a, b]);
    assert_eq!(joined.affected, vec![b]);
    assert!(received.windows(2).all(|w| w[0].revision <= w[1].revision));
}

#[test]
fn test_disband_event_has_no_members() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);
    let events = f.memory.subscribe(PARTY_EVENTS).unwrap();

    f.coord.disband(a).unwrap();

    let received = drain_events(&events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, EventKind::PartyDisbanded);
    assert!(received[0].summary().is_none());
    assert_eq!(received[0].affected, vec![a, b]);
}

#[test]
fn test_switch_server_publishes_only() {
    let f = setup();
    let (a, b) = (player(), player());
    party_of(&f.coord, &[a, b]);
    let events = f.memory.subscribe(PARTY_EVENTS).unwrap();
    let before = f.coord.party(a).unwrap().unwrap();

    f.coord.switch_server(a, "lobby-2").unwrap();

    let received = drain_events(&events);
    assert_eq!(
        received[0].kind,
        EventKind::ServerSwitch {
            server: "lobby-2".to_string()
        }
    );
    assert_eq!(f.coord.party(a).unwrap().unwrap(), before);
    assert!(matches!(
        f.coord.switch_server(b, "lobby-2").unwrap_err(),
        PartyError::NotPartyLeader(_)
    ));
}
