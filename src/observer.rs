//! The Session Observer (spec §4.4): builds the session's ordered list of
//! valid memberships from room state, detects changes, and drives
//! key-rotation hints.
//!
//! The re-scan loop reuses the Scheduler's `tokio::select!`-between-a-
//! channel-and-a-sleep shape (itself grounded in `duplex_log.rs`'s
//! background task), since the Observer's "timer set to the soonest
//! upcoming expiry, reset on every recomputation, raced against external
//! triggers" (spec §4.4, §5) is the same structural problem.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::membership::MembershipRecord;

/// One state event at the call-membership prefix, as read from room state.
#[derive(Clone, Debug)]
pub struct RawMemberEvent {
    pub sender: String,
    pub state_key: String,
    pub content: JsonValue,
    pub origin_server_ts_ms: i64,
}

/// What the Observer needs to read from room state and membership (spec §4.4
/// rules 1, 6). Kept separate from [`crate::facade::ClientFacade`] because
/// the Observer only ever reads, it never sends.
#[async_trait]
pub trait RoomStateSource: Send + Sync {
    /// All state events at the reserved call-membership prefix, across both
    /// the per-device-per-state-key shape and any legacy aggregated shape.
    async fn call_member_state_events(&self) -> eyre::Result<Vec<RawMemberEvent>>;

    /// Whether `sender` currently has `membership: join` in the room.
    fn is_joined(&self, sender: &str) -> bool;
}

/// Emitted whenever the ordered membership list changes (spec §4.4 "Change
/// detection").
#[derive(Clone, Debug)]
pub struct MembershipsChanged {
    pub old: Vec<MembershipRecord>,
    pub new: Vec<MembershipRecord>,
}

/// Notified on every recomputation, whether or not the list actually
/// changed. This is the hook the Manager uses to detect that its own
/// announcement disappeared and a re-join is needed (spec §4.3 "Re-join on
/// observed own-state loss").
pub trait SessionMemberHook: Send + Sync {
    fn on_session_member_update(&self, memberships: &[MembershipRecord]);
}

/// Notified on every recomputation, independent of [`MembershipsChanged`]
/// (spec §4.4: "Always calls ... the encryption hook ... even when the
/// membership list is equal"). The core only signals; key derivation itself
/// is an external collaborator's job (spec §1).
pub trait EncryptionHook: Send + Sync {
    fn on_memberships_observed(&self, memberships: &[MembershipRecord]);
}

/// Builds and maintains the ordered, valid membership list for one
/// `(room, call_id)` session.
pub struct SessionObserver<C: Clock> {
    call_id: String,
    clock: C,
    memberships: Vec<MembershipRecord>,
    changes_tx: broadcast::Sender<MembershipsChanged>,
}

impl<C: Clock> SessionObserver<C> {
    pub fn new(call_id: impl Into<String>, clock: C) -> Self {
        let (changes_tx, _) = broadcast::channel(16);
        SessionObserver {
            call_id: call_id.into(),
            clock,
            memberships: Vec::new(),
            changes_tx,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<MembershipsChanged> {
        self.changes_tx.subscribe()
    }

    /// The current ordered (oldest-first) list of valid memberships.
    pub fn memberships(&self) -> &[MembershipRecord] {
        &self.memberships
    }

    /// The membership that currently determines the focus, under the
    /// "oldest_membership" selection policy (spec §3 "Session").
    pub fn oldest(&self) -> Option<&MembershipRecord> {
        self.memberships.first()
    }

    /// The absolute time (ms since the Unix epoch) at which the soonest
    /// record expires, i.e. `min(expiry_absolute of all records)`, or
    /// `None` if there are none (spec §5 "Observer timer").
    pub fn next_expiry_ms(&self) -> Option<i64> {
        self.memberships
            .iter()
            .map(|m| m.expiry_absolute())
            .min()
    }

    /// Recomputes the membership list from a fresh read of room state (spec
    /// §4.4 rules 1-7), then notifies both hooks and, if the list changed,
    /// the `MembershipsChanged` subscribers.
    pub fn recompute(
        &mut self,
        events: &[RawMemberEvent],
        source: &dyn RoomStateSource,
        member_hook: &dyn SessionMemberHook,
        encryption_hook: &dyn EncryptionHook,
    ) {
        let now_ms = self.clock.now_ms();
        let mut new_memberships = Vec::new();

        for event in events {
            // Rule 1: ignore events with no content keys.
            if event.content.as_object().is_none_or(|o| o.is_empty()) {
                continue;
            }

            // Rule 2: recognise only the per-device shape (has `focus_active`).
            let is_session_shape = event
                .content
                .get("focus_active")
                .is_some();
            let looks_legacy = event.content.get("memberships").is_some();
            if !is_session_shape {
                if looks_legacy {
                    warn!(
                        sender = %event.sender,
                        state_key = %event.state_key,
                        "ignoring legacy aggregated call membership format"
                    );
                }
                continue;
            }

            // Rule 3: construct a Membership Record, dropping on validation failure.
            let record = match MembershipRecord::from_content(
                event.sender.clone(),
                &event.content,
                event.origin_server_ts_ms,
            ) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        sender = %event.sender,
                        state_key = %event.state_key,
                        errors = ?err.0,
                        "dropping invalid call membership announcement"
                    );
                    continue;
                }
            };

            // Rule 4: call_id / scope must match this session.
            if record.call_id != self.call_id {
                continue;
            }
            if record.scope != crate::membership::CallScope::Room {
                continue;
            }

            // Rule 5: drop if expired.
            if record.is_expired(now_ms) {
                continue;
            }

            // Rule 6: sender must currently be joined to the room.
            if !source.is_joined(&record.sender) {
                continue;
            }

            new_memberships.push(record);
        }

        // Uniqueness: at most one entry per (sender, device_id). A later
        // event for the same key (newer created_ts) wins; spec §3 says
        // created_ts is monotone per device, violators are logged and the
        // newer wins, so last-write-wins by created_ts is always correct
        // even if input ordering is unstable.
        new_memberships.sort_by(|a, b| a.created_ts().cmp(&b.created_ts()));
        let mut deduped: Vec<MembershipRecord> = Vec::with_capacity(new_memberships.len());
        for record in new_memberships {
            if let Some(existing) = deduped
                .iter_mut()
                .find(|r: &&mut MembershipRecord| r.sender == record.sender && r.device_id == record.device_id)
            {
                if record.created_ts() < existing.created_ts() {
                    warn!(
                        sender = %record.sender,
                        device_id = %record.device_id,
                        "created_ts went backwards for a device; ignoring the regression"
                    );
                } else {
                    *existing = record;
                }
            } else {
                deduped.push(record);
            }
        }

        // Rule 7: sort ascending by created_ts.
        deduped.sort_by(|a, b| a.created_ts().cmp(&b.created_ts()));

        let old = std::mem::replace(&mut self.memberships, deduped.clone());
        member_hook.on_session_member_update(&deduped);
        encryption_hook.on_memberships_observed(&deduped);

        if !lists_equal(&old, &deduped) {
            trace!(old_len = old.len(), new_len = deduped.len(), "session membership changed");
            let _ = self.changes_tx.send(MembershipsChanged { old, new: deduped });
        }
    }

    /// Runs the re-scan loop: recomputes on every external trigger, and
    /// also wakes itself up at the soonest upcoming expiry so records age
    /// out promptly even with no new events (spec §4.4, §5).
    pub async fn run(
        &mut self,
        source: &dyn RoomStateSource,
        member_hook: &dyn SessionMemberHook,
        encryption_hook: &dyn EncryptionHook,
        mut triggers: mpsc::Receiver<()>,
    ) -> eyre::Result<()> {
        loop {
            let events = source.call_member_state_events().await?;
            self.recompute(&events, source, member_hook, encryption_hook);

            match self.next_expiry_ms() {
                Some(expiry_ms) => {
                    let now_ms = self.clock.now_ms();
                    let delay = StdDuration::from_millis(expiry_ms.saturating_sub(now_ms).max(0) as u64);
                    debug!(delay_ms = delay.as_millis(), "observer sleeping until next expiry");
                    tokio::select! {
                        _ = tokio::time::sleep_until(Instant::now() + delay) => {}
                        trigger = triggers.recv() => {
                            if trigger.is_none() {
                                return Ok(());
                            }
                        }
                    }
                }
                None => {
                    let Some(()) = triggers.recv().await else {
                        return Ok(());
                    };
                }
            }
        }
    }
}

fn lists_equal(a: &[MembershipRecord], b: &[MembershipRecord]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeSource {
        joined: Vec<String>,
    }

    #[async_trait]
    impl RoomStateSource for FakeSource {
        async fn call_member_state_events(&self) -> eyre::Result<Vec<RawMemberEvent>> {
            Ok(Vec::new())
        }

        fn is_joined(&self, sender: &str) -> bool {
            self.joined.iter().any(|j| j == sender)
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<Vec<MembershipRecord>>>,
    }

    impl SessionMemberHook for RecordingHook {
        fn on_session_member_update(&self, memberships: &[MembershipRecord]) {
            self.calls.lock().unwrap().push(memberships.to_vec());
        }
    }

    impl EncryptionHook for RecordingHook {
        fn on_memberships_observed(&self, memberships: &[MembershipRecord]) {
            self.calls.lock().unwrap().push(memberships.to_vec());
        }
    }

    fn member_event(sender: &str, device: &str, created_ts: i64, expires: u64) -> RawMemberEvent {
        RawMemberEvent {
            sender: sender.to_owned(),
            state_key: format!("{sender}_{device}"),
            content: json!({
                "call_id": "",
                "scope": "m.room",
                "application": "m.call",
                "device_id": device,
                "expires": expires,
                "created_ts": created_ts,
                "focus_active": { "type": "livekit", "focus_selection": "oldest_membership" },
                "foci_preferred": [],
            }),
            origin_server_ts_ms: created_ts,
        }
    }

    #[test]
    fn orders_memberships_oldest_first() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned(), "@b:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![
            member_event("@b:x", "D2", 200, 1_000_000),
            member_event("@a:x", "D1", 100, 1_000_000),
        ];
        observer.recompute(&events, &source, &hook, &hook);
        let memberships = observer.memberships();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].sender, "@a:x");
        assert_eq!(memberships[1].sender, "@b:x");
    }

    #[test]
    fn drops_expired_memberships() {
        let mut observer = SessionObserver::new("", FakeClock::new(10_000));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![member_event("@a:x", "D1", 0, 1_000)];
        observer.recompute(&events, &source, &hook, &hook);
        assert!(observer.memberships().is_empty());
    }

    #[test]
    fn drops_memberships_from_senders_not_joined() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource { joined: vec![] };
        let hook = RecordingHook::default();
        let events = vec![member_event("@a:x", "D1", 0, 1_000_000)];
        observer.recompute(&events, &source, &hook, &hook);
        assert!(observer.memberships().is_empty());
    }

    #[test]
    fn deduplicates_by_sender_and_device_keeping_the_newest() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![
            member_event("@a:x", "D1", 100, 1_000_000),
            member_event("@a:x", "D1", 200, 1_000_000),
        ];
        observer.recompute(&events, &source, &hook, &hook);
        assert_eq!(observer.memberships().len(), 1);
        assert_eq!(observer.memberships()[0].created_ts(), 200);
    }

    #[test]
    fn emits_memberships_changed_only_when_the_list_differs() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let mut changes = observer.subscribe_changes();

        let events = vec![member_event("@a:x", "D1", 100, 1_000_000)];
        observer.recompute(&events, &source, &hook, &hook);
        assert!(changes.try_recv().is_ok());

        observer.recompute(&events, &source, &hook, &hook);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn hooks_always_fire_even_without_a_change() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource { joined: vec![] };
        let hook = RecordingHook::default();
        observer.recompute(&[], &source, &hook, &hook);
        observer.recompute(&[], &source, &hook, &hook);
        assert_eq!(hook.calls.lock().unwrap().len(), 4); // 2 recomputes * 2 hooks
    }

    #[test]
    fn ignores_events_with_no_content_keys() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![RawMemberEvent {
            sender: "@a:x".to_owned(),
            state_key: "@a:x_D1".to_owned(),
            content: json!({}),
            origin_server_ts_ms: 0,
        }];
        observer.recompute(&events, &source, &hook, &hook);
        assert!(observer.memberships().is_empty());
    }

    #[test]
    fn ignores_legacy_aggregated_format() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![RawMemberEvent {
            sender: "@a:x".to_owned(),
            state_key: "@a:x".to_owned(),
            content: json!({ "memberships": [{"device_id": "D1"}] }),
            origin_server_ts_ms: 0,
        }];
        observer.recompute(&events, &source, &hook, &hook);
        assert!(observer.memberships().is_empty());
    }

    #[test]
    fn next_expiry_is_the_minimum_across_records() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned(), "@b:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![
            member_event("@a:x", "D1", 0, 5_000),
            member_event("@b:x", "D2", 0, 1_000),
        ];
        observer.recompute(&events, &source, &hook, &hook);
        assert_eq!(observer.next_expiry_ms(), Some(1_000));
    }

    #[test]
    fn oldest_focus_is_stable_when_oldest_is_unchanged() {
        let mut observer = SessionObserver::new("", FakeClock::new(0));
        let source = FakeSource {
            joined: vec!["@a:x".to_owned(), "@b:x".to_owned()],
        };
        let hook = RecordingHook::default();
        let events = vec![
            member_event("@a:x", "D1", 0, 1_000_000),
            member_event("@b:x", "D2", 100, 1_000_000),
        ];
        observer.recompute(&events, &source, &hook, &hook);
        let first_selection = observer.oldest().and_then(|m| m.focus_selection());

        let more_events = vec![
            member_event("@a:x", "D1", 0, 1_000_000),
            member_event("@b:x", "D2", 100, 1_000_000),
            member_event("@c:x", "D3", 200, 1_000_000),
        ];
        let source = FakeSource {
            joined: vec!["@a:x".to_owned(), "@b:x".to_owned(), "@c:x".to_owned()],
        };
        observer.recompute(&more_events, &source, &hook, &hook);
        let second_selection = observer.oldest().and_then(|m| m.focus_selection());

        assert_eq!(first_selection, second_selection);
        assert_eq!(observer.oldest().unwrap().sender, "@a:x");
    }
}
