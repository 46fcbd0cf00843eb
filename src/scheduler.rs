//! The Action Scheduler (spec §4.2): a single-threaded, cooperative, timed
//! queue of typed actions with external wake-up.
//!
//! The run loop generalizes the teacher's `duplex_log.rs` background-task
//! pattern of `tokio::select!`-ing between an external channel and a
//! suspending operation: there it was a prompt-request channel raced
//! against `readline()`; here it's a wake-up channel raced against sleeping
//! until the next action's `ts`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::clock::Clock;

/// One entry in the Scheduler's queue.
#[derive(Clone, Debug)]
pub struct Action<T> {
    /// Absolute time (milliseconds since the Unix epoch) this action should run at.
    pub ts: i64,
    pub kind: T,
}

impl<T> Action<T> {
    pub fn new(ts: i64, kind: T) -> Self {
        Action { ts, kind }
    }
}

/// What a handler (or an external wake-up) wants done to the queue.
#[derive(Debug)]
pub enum ActionUpdate<T> {
    /// Replace the entire queue with these actions.
    Replace(Vec<Action<T>>),
    /// Add these actions to whatever remains in the queue.
    Insert(Vec<Action<T>>),
    /// Leave the queue as-is (besides removing the action that just ran).
    None,
}

/// Implemented by whoever drives the protocol the Scheduler is executing
/// (the Membership Manager, in this crate). Kept as a trait rather than a
/// closure so `Scheduler<H>` can be parameterized over a fake in tests.
#[async_trait::async_trait]
pub trait ActionHandler<T>: Send {
    /// Errors here are unrecoverable: the loop stops and the error is
    /// surfaced to whoever called [`Scheduler::run`].
    async fn handle(&mut self, action: &Action<T>) -> eyre::Result<ActionUpdate<T>>;
}

/// A handle used to inject external wake-ups (queue replacements or
/// insertions that must pre-empt whatever the loop is currently waiting on).
#[derive(Clone)]
pub struct WakeUp<T> {
    tx: mpsc::UnboundedSender<ActionUpdate<T>>,
}

impl<T> WakeUp<T> {
    /// Injects an update. Per spec §4.2 step 3, an injected update is never
    /// executed as an action; it replaces/augments the queue and the loop
    /// restarts its selection. Per spec §5, the injected update always wins
    /// over any concurrent handler result for the action it pre-empted,
    /// which holds here because the wake-up is only ever observed between
    /// loop iterations, never concurrently with `handler.handle()`.
    pub fn send(&self, update: ActionUpdate<T>) {
        // The receiver only drops with the Scheduler itself; a send error
        // here means the loop already stopped, which the caller learns
        // about through `Scheduler::run`'s return value instead.
        let _ = self.tx.send(update);
    }
}

/// The single-threaded cooperative scheduler described in spec §4.2.
pub struct Scheduler<T, C: Clock> {
    queue: VecDeque<Action<T>>,
    wake_rx: mpsc::UnboundedReceiver<ActionUpdate<T>>,
    wake_tx: mpsc::UnboundedSender<ActionUpdate<T>>,
    clock: C,
}

impl<T, C: Clock> Scheduler<T, C>
where
    T: fmt::Debug + Send,
{
    pub fn new(clock: C) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Scheduler {
            queue: VecDeque::new(),
            wake_rx,
            wake_tx,
            clock,
        }
    }

    /// A cloneable handle other tasks (the public `join`/`leave` API) use to
    /// push updates into a running loop.
    pub fn wake_up(&self) -> WakeUp<T> {
        WakeUp {
            tx: self.wake_tx.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue(&self) -> &VecDeque<Action<T>> {
        &self.queue
    }

    /// Replaces the queue directly. Used to seed the loop before calling
    /// [`Scheduler::run`], and by callers that are not racing a live loop.
    pub fn replace_queue(&mut self, actions: Vec<Action<T>>) {
        self.queue = actions.into();
        sort_by_ts(&mut self.queue);
    }

    fn apply(&mut self, update: ActionUpdate<T>) {
        match update {
            ActionUpdate::Replace(actions) => {
                self.queue = actions.into();
            }
            ActionUpdate::Insert(actions) => {
                self.queue.extend(actions);
            }
            ActionUpdate::None => {}
        }
        sort_by_ts(&mut self.queue);
    }

    /// Runs the loop until the queue drains or the handler returns an error.
    pub async fn run(&mut self, handler: &mut dyn ActionHandler<T>) -> eyre::Result<()>
    where
        T: Clone,
    {
        loop {
            let Some(action) = self.queue.front().cloned() else {
                return Ok(());
            };

            let now_ms = self.clock.now_ms();
            if action.ts > now_ms {
                let delay = Duration::from_millis((action.ts - now_ms) as u64);
                trace!(?action, delay_ms = delay.as_millis(), "sleeping until next action");
                tokio::select! {
                    _ = tokio::time::sleep_until(Instant::now() + delay) => {}
                    update = self.wake_rx.recv() => {
                        let Some(update) = update else {
                            return Ok(());
                        };
                        debug!("woken up externally, not executing the pending action");
                        self.apply(update);
                        continue;
                    }
                }
            }

            // We may have been racing a wake-up that arrived exactly as the
            // sleep elapsed; drain any pending update non-blockingly so it
            // still wins over the action we're about to run.
            if let Ok(update) = self.wake_rx.try_recv() {
                self.apply(update);
                continue;
            }

            let action = self.queue.pop_front().expect("checked non-empty above");
            let update = handler.handle(&action).await?;
            self.apply(update);
        }
    }
}

fn sort_by_ts<T>(queue: &mut VecDeque<Action<T>>) {
    queue
        .make_contiguous()
        .sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap_or(CmpOrdering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestAction {
        A,
        B,
        C,
    }

    struct RecordingHandler {
        order: Arc<std::sync::Mutex<Vec<TestAction>>>,
        next: Vec<(TestAction, ActionUpdate<TestAction>)>,
    }

    #[async_trait::async_trait]
    impl ActionHandler<TestAction> for RecordingHandler {
        async fn handle(&mut self, action: &Action<TestAction>) -> eyre::Result<ActionUpdate<TestAction>> {
            self.order.lock().unwrap().push(action.kind.clone());
            if let Some(pos) = self.next.iter().position(|(k, _)| *k == action.kind) {
                let (_, update) = self.next.remove(pos);
                Ok(update)
            } else {
                Ok(ActionUpdate::None)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_actions_in_ts_order() {
        let clock = FakeClock::new(0);
        let mut scheduler = Scheduler::new(clock);
        scheduler.replace_queue(vec![
            Action::new(20, TestAction::B),
            Action::new(10, TestAction::A),
            Action::new(30, TestAction::C),
        ]);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handler = RecordingHandler {
            order: order.clone(),
            next: Vec::new(),
        };

        tokio::time::advance(Duration::from_millis(30)).await;
        scheduler.run(&mut handler).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![TestAction::A, TestAction::B, TestAction::C]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_up_replaces_pending_action_without_running_it() {
        let clock = FakeClock::new(0);
        let mut scheduler = Scheduler::new(clock);
        scheduler.replace_queue(vec![Action::new(1_000_000, TestAction::A)]);
        let wake = scheduler.wake_up();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handler = RecordingHandler {
            order: order.clone(),
            next: Vec::new(),
        };

        wake.send(ActionUpdate::Replace(vec![Action::new(0, TestAction::B)]));

        tokio::time::advance(Duration::from_millis(1)).await;
        scheduler.run(&mut handler).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![TestAction::B]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_update_is_applied_and_re_enqueued_action_runs() {
        let clock = FakeClock::new(0);
        let mut scheduler = Scheduler::new(clock);
        scheduler.replace_queue(vec![Action::new(0, TestAction::A)]);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handler = RecordingHandler {
            order: order.clone(),
            next: vec![(
                TestAction::A,
                ActionUpdate::Insert(vec![Action::new(5, TestAction::B)]),
            )],
        };

        tokio::time::advance(Duration::from_millis(10)).await;
        scheduler.run(&mut handler).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![TestAction::A, TestAction::B]);
    }

    #[tokio::test]
    async fn empty_queue_returns_immediately() {
        let clock = FakeClock::new(0);
        let mut scheduler: Scheduler<TestAction, _> = Scheduler::new(clock);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handler = RecordingHandler {
            order,
            next: Vec::new(),
        };
        scheduler.run(&mut handler).await.unwrap();
    }
}
