//! The Membership Manager (spec §4.3): drives the join/heartbeat/leave
//! protocol on top of the [`Scheduler`](crate::scheduler::Scheduler).
//!
//! Mirrors the teacher's split between a cheap, cloneable handle
//! (`auth::login`'s returned session object) and a background task doing the
//! actual work (`sync.rs`'s `SyncHelper` loop): [`Manager`] is the handle
//! callers hold and call `join`/`leave` on; [`ManagerHandler`] is the
//! exclusive owner of the protocol state and runs inside the task spawned by
//! [`Manager::spawn`], consuming the `Scheduler`'s action queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::warn;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::FacadeError;
use crate::facade::{ClientFacade, DelayedEventAction};
use crate::membership::{
    ActiveFocus, ActiveLivekitFocus, Application, CallApplicationContent, CallScope,
    EmptyMembershipContent, Focus, FocusSelection, MembershipRecord, SessionMembershipContent,
};
use crate::observer::SessionMemberHook;
use crate::scheduler::{Action, ActionHandler, ActionUpdate, Scheduler, WakeUp};
use crate::state_key::derive_state_key;

pub const EVENT_TYPE: &str = "m.call.member";

/// One unit of work the Scheduler runs (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionType {
    SendFirstDelayedEvent,
    SendJoinEvent,
    RestartDelayedEvent,
    UpdateExpiry,
    SendMainDelayedEvent,
    SendScheduledDelayedLeaveEvent,
    SendLeaveEvent,
}

/// Diagnostic classification of the Manager's current phase. Derived from
/// the shape of recent transitions, not by introspecting the Scheduler's
/// queue directly (spec §4.3's queue-shape table is the model this mirrors).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Reserved for a transition shape this crate's own state machine never
    /// actually produces; kept because the source model names it.
    Unknown,
}

#[derive(Clone, Debug)]
pub struct StatusChanged {
    pub from: ManagerStatus,
    pub to: ManagerStatus,
}

#[derive(Clone, Debug)]
pub struct UnrecoverableError {
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RetryKind {
    RateLimit,
    Network,
}

struct Shared {
    join_started: AtomicBool,
    leave_requested: AtomicBool,
    state_event_present: AtomicBool,
    rejoin_pending: AtomicBool,
    leave_outcome: Mutex<Option<bool>>,
    leave_tx: broadcast::Sender<bool>,
    fatal_tx: broadcast::Sender<()>,
    status: Mutex<ManagerStatus>,
    status_tx: broadcast::Sender<StatusChanged>,
    probably_left_tx: broadcast::Sender<()>,
    unrecoverable_tx: broadcast::Sender<UnrecoverableError>,
}

impl Shared {
    fn new() -> Self {
        let (leave_tx, _) = broadcast::channel(1);
        let (fatal_tx, _) = broadcast::channel(1);
        let (status_tx, _) = broadcast::channel(16);
        let (probably_left_tx, _) = broadcast::channel(16);
        let (unrecoverable_tx, _) = broadcast::channel(16);
        Shared {
            join_started: AtomicBool::new(false),
            leave_requested: AtomicBool::new(false),
            state_event_present: AtomicBool::new(false),
            rejoin_pending: AtomicBool::new(false),
            leave_outcome: Mutex::new(None),
            leave_tx,
            fatal_tx,
            status: Mutex::new(ManagerStatus::Disconnected),
            status_tx,
            probably_left_tx,
            unrecoverable_tx,
        }
    }

    fn set_status(&self, to: ManagerStatus) {
        let mut status = self.status.lock().unwrap();
        if *status != to {
            let from = *status;
            *status = to;
            let _ = self.status_tx.send(StatusChanged { from, to });
        }
    }

    fn finish_ok(&self) {
        *self.leave_outcome.lock().unwrap() = Some(true);
        let _ = self.leave_tx.send(true);
        self.set_status(ManagerStatus::Disconnected);
    }

    fn finish_fatal(&self, message: String) {
        let _ = self.unrecoverable_tx.send(UnrecoverableError { message });
        let _ = self.fatal_tx.send(());
    }
}

/// A cheap, cloneable handle to a running Manager (spec §3 "Ownership":
/// everything mutable lives in the background task; this holds only shared
/// signalling state and a way to inject wake-ups).
pub struct Manager<C: Clock> {
    wake: WakeUp<ActionType>,
    shared: Arc<Shared>,
    clock: Arc<C>,
    user_id: Arc<str>,
    device_id: Arc<str>,
    /// Carries the seed action to the background task. The Scheduler's loop
    /// terminates immediately on an empty queue (spec §4.2), so the initial
    /// action must be in place *before* `run` starts rather than delivered
    /// through the wake-up channel, which only pre-empts a loop already
    /// waiting on something.
    start: Arc<Mutex<Option<tokio::sync::oneshot::Sender<Vec<Action<ActionType>>>>>>,
}

impl<C: Clock> Clone for Manager<C> {
    fn clone(&self) -> Self {
        Manager {
            wake: self.wake.clone(),
            shared: self.shared.clone(),
            clock: self.clock.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            start: self.start.clone(),
        }
    }
}

impl<C: Clock> Manager<C> {
    /// Spawns the background task that runs the Scheduler loop and returns
    /// a handle plus the task's join handle (its result surfaces the Fatal
    /// error, if any, per spec §7).
    pub fn spawn<F>(
        facade: Arc<F>,
        clock: C,
        config: Config,
        user_id: String,
        device_id: String,
        room_version: String,
        call_id: String,
        foci_preferred: Vec<Focus>,
    ) -> (Manager<C>, tokio::task::JoinHandle<eyre::Result<()>>)
    where
        F: ClientFacade + 'static,
    {
        let clock = Arc::new(clock);
        let mut scheduler = Scheduler::new(clock.clone());
        let wake = scheduler.wake_up();
        let shared = Arc::new(Shared::new());
        let state_key = derive_state_key(&user_id, &device_id, &room_version);
        let active_delay_ms = config.delayed_leave_event_delay_ms;
        let (start_tx, start_rx) = tokio::sync::oneshot::channel();

        let handle = Manager {
            wake: wake.clone(),
            shared: shared.clone(),
            clock: clock.clone(),
            user_id: Arc::from(user_id.as_str()),
            device_id: Arc::from(device_id.as_str()),
            start: Arc::new(Mutex::new(Some(start_tx))),
        };

        let mut handler = ManagerHandler {
            facade,
            clock,
            config,
            shared,
            state_key,
            user_id: handle.user_id.clone(),
            device_id: handle.device_id.clone(),
            call_id,
            foci_preferred,
            delay_id: None,
            active_delay_ms,
            expire_iterations: 0,
            start_time_ms: 0,
            retries: HashMap::new(),
        };

        let task = tokio::spawn(async move {
            let Ok(initial) = start_rx.await else {
                // `join` was never called before the handle was dropped.
                return Ok(());
            };
            scheduler.replace_queue(initial);
            let result = scheduler.run(&mut handler).await;
            match &result {
                Ok(()) => handler.shared.finish_ok(),
                Err(err) => handler.shared.finish_fatal(err.to_string()),
            }
            result
        });

        (handle, task)
    }

    /// Starts the join protocol. A no-op if `join` was already called
    /// without an intervening `leave` (spec §8 idempotence).
    pub fn join(&self) {
        if self.shared.join_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_status(ManagerStatus::Connecting);
        if let Some(tx) = self.start.lock().unwrap().take() {
            let _ = tx.send(vec![Action::new(self.clock.now_ms(), ActionType::SendFirstDelayedEvent)]);
        }
    }

    /// Requests teardown. Resolves `true` once the queue drains
    /// successfully, `false` if `timeout_ms` elapses first (teardown keeps
    /// running in the background). Calling `leave` more than once returns
    /// the same eventual outcome (spec §8 idempotence).
    pub async fn leave(&self, timeout_ms: Option<u64>) -> bool {
        if let Some(outcome) = *self.shared.leave_outcome.lock().unwrap() {
            return outcome;
        }

        let mut leave_rx = self.shared.leave_tx.subscribe();
        let mut fatal_rx = self.shared.fatal_tx.subscribe();

        if !self.shared.leave_requested.swap(true, Ordering::SeqCst) {
            self.shared.set_status(ManagerStatus::Disconnecting);
            self.wake.send(ActionUpdate::Replace(vec![Action::new(
                self.clock.now_ms(),
                ActionType::SendScheduledDelayedLeaveEvent,
            )]));
        }

        if let Some(outcome) = *self.shared.leave_outcome.lock().unwrap() {
            return outcome;
        }

        let wait = async move {
            tokio::select! {
                res = leave_rx.recv() => res.unwrap_or(false),
                _ = fatal_rx.recv() => false,
            }
        };

        match timeout_ms {
            Some(ms) => tokio::time::timeout(StdDuration::from_millis(ms), wait)
                .await
                .unwrap_or(false),
            None => wait.await,
        }
    }

    pub fn status(&self) -> ManagerStatus {
        *self.shared.status.lock().unwrap()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChanged> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_probably_left(&self) -> broadcast::Receiver<()> {
        self.shared.probably_left_tx.subscribe()
    }

    pub fn subscribe_unrecoverable(&self) -> broadcast::Receiver<UnrecoverableError> {
        self.shared.unrecoverable_tx.subscribe()
    }
}

/// Hooked up to the Session Observer so the Manager learns when its own
/// announcement disappears from the session (spec §4.3 "Re-join on observed
/// own-state loss"). `rejoin_pending`/`state_event_present` stand in for the
/// spec's literal "queue does not already contain SendFirstDelayedEvent or
/// SendJoinEvent" check, since the handle side has no view into the
/// Scheduler's private queue; they track the same thing by construction.
impl<C: Clock> SessionMemberHook for Manager<C> {
    fn on_session_member_update(&self, memberships: &[MembershipRecord]) {
        if !self.shared.join_started.load(Ordering::SeqCst) || self.shared.leave_requested.load(Ordering::SeqCst) {
            return;
        }

        let present = memberships
            .iter()
            .any(|m| m.sender.as_str() == &*self.user_id && m.device_id.as_str() == &*self.device_id);
        if present {
            return;
        }

        if !self.shared.state_event_present.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.rejoin_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.state_event_present.store(false, Ordering::SeqCst);
        warn!(
            user_id = %self.user_id,
            device_id = %self.device_id,
            "own announcement missing from session, forcing re-join"
        );
        self.wake.send(ActionUpdate::Insert(vec![Action::new(
            self.clock.now_ms(),
            ActionType::SendFirstDelayedEvent,
        )]));
    }
}

/// Exclusive owner of the protocol state (spec §3): `delay_id`, retry
/// counters, and the current heartbeat/expiry schedule. Runs entirely
/// within the task spawned by [`Manager::spawn`]; never touched from
/// outside that task.
struct ManagerHandler<F: ClientFacade, C: Clock> {
    facade: Arc<F>,
    clock: Arc<C>,
    config: Config,
    shared: Arc<Shared>,
    state_key: String,
    user_id: Arc<str>,
    device_id: Arc<str>,
    call_id: String,
    foci_preferred: Vec<Focus>,
    delay_id: Option<String>,
    active_delay_ms: u64,
    expire_iterations: u64,
    start_time_ms: i64,
    retries: HashMap<(ActionType, RetryKind), u32>,
}

impl<F: ClientFacade, C: Clock> ManagerHandler<F, C> {
    fn join_content(&self, expires_ms: u64) -> JsonValue {
        let wire = SessionMembershipContent {
            application: Application::Call(CallApplicationContent {
                call_id: self.call_id.clone(),
                scope: CallScope::Room,
            }),
            device_id: self.device_id.to_string(),
            expires: expires_ms,
            created_ts: None,
            focus_active: ActiveFocus::Livekit(ActiveLivekitFocus {
                focus_selection: FocusSelection::OldestMembership,
            }),
            foci_preferred: self.foci_preferred.clone(),
        };
        serde_json::to_value(wire).expect("SessionMembershipContent always serializes")
    }

    fn empty_content(&self) -> JsonValue {
        serde_json::to_value(EmptyMembershipContent::default()).expect("EmptyMembershipContent always serializes")
    }

    fn bump_retry(&mut self, action: ActionType, kind: RetryKind, max: u32) -> eyre::Result<u32> {
        let count = self.retries.entry((action, kind)).or_insert(0);
        *count += 1;
        if *count > max {
            return Err(eyre::eyre!("{kind:?} retry budget exhausted for {action:?}"));
        }
        Ok(*count)
    }

    fn reset_retries(&mut self, action: ActionType) {
        self.retries.remove(&(action, RetryKind::RateLimit));
        self.retries.remove(&(action, RetryKind::Network));
    }

    /// Shared tail of most handlers: rate-limit and network errors retry
    /// within budget, anything else is unrecoverable (spec §7).
    fn retry_or_fatal(&mut self, action: ActionType, err: FacadeError) -> eyre::Result<ActionUpdate<ActionType>> {
        if !err.is_retryable() {
            return Err(eyre::eyre!("unrecoverable facade error on {action:?}: {err}"));
        }
        match err {
            FacadeError::RateLimited { retry_after_ms } => {
                self.bump_retry(action, RetryKind::RateLimit, self.config.max_rate_limit_retry_count)?;
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms() + retry_after_ms as i64,
                    action,
                )]))
            }
            FacadeError::NetworkTransient(_) => {
                self.bump_retry(action, RetryKind::Network, self.config.max_network_error_retry_count)?;
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms() + self.config.network_error_retry_ms as i64,
                    action,
                )]))
            }
            _ => unreachable!("is_retryable() only admits the two variants matched above"),
        }
    }

    async fn handle_send_first_delayed_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        if let Some(old_delay_id) = self.delay_id.take() {
            match self.facade.update_delayed_event(&old_delay_id, DelayedEventAction::Cancel).await {
                Ok(()) | Err(FacadeError::NotFound) => {}
                Err(err) => return self.retry_or_fatal(ActionType::SendFirstDelayedEvent, err),
            }
        }

        match self
            .facade
            .send_delayed_state_event(self.active_delay_ms, EVENT_TYPE, &self.state_key, self.empty_content())
            .await
        {
            Ok(delay_id) => {
                self.delay_id = Some(delay_id);
                self.reset_retries(ActionType::SendFirstDelayedEvent);
                self.shared.rejoin_pending.store(false, Ordering::SeqCst);
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendJoinEvent,
                )]))
            }
            Err(FacadeError::MaxDelayExceeded { max_allowed_ms }) => {
                self.active_delay_ms = max_allowed_ms;
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendFirstDelayedEvent,
                )]))
            }
            Err(FacadeError::UnsupportedDelayedEvents) => {
                warn!("homeserver does not support delayed events; operating in degraded mode");
                self.delay_id = None;
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendJoinEvent,
                )]))
            }
            Err(err) => self.retry_or_fatal(ActionType::SendFirstDelayedEvent, err),
        }
    }

    async fn handle_send_join_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        let expires_ms = self.config.membership_event_expiry_ms;
        match self
            .facade
            .send_state_event(EVENT_TYPE, &self.state_key, self.join_content(expires_ms))
            .await
        {
            Ok(()) => {
                self.reset_retries(ActionType::SendJoinEvent);
                self.start_time_ms = self.clock.now_ms();
                self.expire_iterations = 1;
                self.shared.state_event_present.store(true, Ordering::SeqCst);
                self.shared.set_status(ManagerStatus::Connected);
                let update_expiry_ts =
                    self.start_time_ms + expires_ms as i64 - self.config.membership_event_expiry_headroom_ms as i64;
                Ok(ActionUpdate::Replace(vec![
                    Action::new(self.clock.now_ms(), ActionType::RestartDelayedEvent),
                    Action::new(update_expiry_ts, ActionType::UpdateExpiry),
                ]))
            }
            Err(err) => self.retry_or_fatal(ActionType::SendJoinEvent, err),
        }
    }

    async fn handle_restart_delayed_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        let Some(delay_id) = self.delay_id.clone() else {
            let next = if self.shared.state_event_present.load(Ordering::SeqCst) {
                ActionType::SendMainDelayedEvent
            } else {
                ActionType::SendFirstDelayedEvent
            };
            return Ok(ActionUpdate::Insert(vec![Action::new(self.clock.now_ms(), next)]));
        };

        match self.facade.update_delayed_event(&delay_id, DelayedEventAction::Restart).await {
            Ok(()) => {
                self.reset_retries(ActionType::RestartDelayedEvent);
                Ok(ActionUpdate::Insert(vec![Action::new(
                    self.clock.now_ms() + self.config.delayed_leave_event_restart_ms as i64,
                    ActionType::RestartDelayedEvent,
                )]))
            }
            Err(FacadeError::NotFound) => {
                warn!("scheduled leave's delay_id was already consumed, the switch probably fired");
                let _ = self.shared.probably_left_tx.send(());
                self.delay_id = None;
                Ok(ActionUpdate::Insert(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendMainDelayedEvent,
                )]))
            }
            Err(err) => self.retry_or_fatal(ActionType::RestartDelayedEvent, err),
        }
    }

    async fn handle_update_expiry(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        let expires_ms = self.config.membership_event_expiry_ms * (self.expire_iterations + 1);
        match self
            .facade
            .send_state_event(EVENT_TYPE, &self.state_key, self.join_content(expires_ms))
            .await
        {
            Ok(()) => {
                self.reset_retries(ActionType::UpdateExpiry);
                self.expire_iterations += 1;
                let next_ts = self.start_time_ms
                    + self.config.membership_event_expiry_ms as i64 * self.expire_iterations as i64
                    - self.config.membership_event_expiry_headroom_ms as i64;
                Ok(ActionUpdate::Insert(vec![Action::new(next_ts, ActionType::UpdateExpiry)]))
            }
            Err(err) => self.retry_or_fatal(ActionType::UpdateExpiry, err),
        }
    }

    async fn handle_send_main_delayed_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        match self
            .facade
            .send_delayed_state_event(self.active_delay_ms, EVENT_TYPE, &self.state_key, self.empty_content())
            .await
        {
            Ok(delay_id) => {
                self.delay_id = Some(delay_id);
                self.reset_retries(ActionType::SendMainDelayedEvent);
                Ok(ActionUpdate::Insert(vec![Action::new(
                    self.clock.now_ms() + self.config.delayed_leave_event_restart_ms as i64,
                    ActionType::RestartDelayedEvent,
                )]))
            }
            Err(FacadeError::MaxDelayExceeded { max_allowed_ms }) => {
                self.active_delay_ms = max_allowed_ms;
                Ok(ActionUpdate::Insert(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendMainDelayedEvent,
                )]))
            }
            Err(FacadeError::UnsupportedDelayedEvents) => {
                warn!("homeserver stopped supporting delayed events mid-session; operating in degraded mode");
                Ok(ActionUpdate::None)
            }
            Err(err) => self.retry_or_fatal(ActionType::SendMainDelayedEvent, err),
        }
    }

    async fn handle_send_scheduled_delayed_leave_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        let Some(delay_id) = self.delay_id.clone() else {
            return Ok(ActionUpdate::Replace(vec![Action::new(
                self.clock.now_ms(),
                ActionType::SendLeaveEvent,
            )]));
        };

        match self.facade.update_delayed_event(&delay_id, DelayedEventAction::Send).await {
            Ok(()) => {
                self.shared.state_event_present.store(false, Ordering::SeqCst);
                self.delay_id = None;
                Ok(ActionUpdate::Replace(Vec::new()))
            }
            Err(_err) => {
                self.delay_id = None;
                Ok(ActionUpdate::Replace(vec![Action::new(
                    self.clock.now_ms(),
                    ActionType::SendLeaveEvent,
                )]))
            }
        }
    }

    async fn handle_send_leave_event(&mut self) -> eyre::Result<ActionUpdate<ActionType>> {
        match self.facade.send_state_event(EVENT_TYPE, &self.state_key, self.empty_content()).await {
            Ok(()) => {
                self.shared.state_event_present.store(false, Ordering::SeqCst);
                Ok(ActionUpdate::Replace(Vec::new()))
            }
            Err(err) => self.retry_or_fatal(ActionType::SendLeaveEvent, err),
        }
    }
}

#[async_trait::async_trait]
impl<F: ClientFacade, C: Clock> ActionHandler<ActionType> for ManagerHandler<F, C> {
    async fn handle(&mut self, action: &Action<ActionType>) -> eyre::Result<ActionUpdate<ActionType>> {
        match action.kind {
            ActionType::SendFirstDelayedEvent => self.handle_send_first_delayed_event().await,
            ActionType::SendJoinEvent => self.handle_send_join_event().await,
            ActionType::RestartDelayedEvent => self.handle_restart_delayed_event().await,
            ActionType::UpdateExpiry => self.handle_update_expiry().await,
            ActionType::SendMainDelayedEvent => self.handle_send_main_delayed_event().await,
            ActionType::SendScheduledDelayedLeaveEvent => self.handle_send_scheduled_delayed_leave_event().await,
            ActionType::SendLeaveEvent => self.handle_send_leave_event().await,
        }
    }
}
