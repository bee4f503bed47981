use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::util;
use crate::{Error, Result};

/// Lifecycle state of an orchestrated task.
///
/// Transitions are monotonic within one run: `Idle → Running → Success` or
/// `Idle → Running → Error`. Only an explicit [`OrchestratedTask::reset`]
/// returns a terminal task to `Idle`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Idle,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

/// Handle for removing a registered state listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

/// Callback invoked on every `Running`/`Success`/`Error` transition.
pub type StateListener = Arc<dyn Fn(TaskState) + Send + Sync>;

type Job = Box<dyn FnOnce() + Send>;

/// Caller-facing surface shared by every switching task.
///
/// Listeners are invoked synchronously with the state transition, in
/// registration order, on whichever thread performs the transition, which
/// in practice is the task's own background worker. They are never invoked for
/// `Idle`. A listener runs inline with the orchestration sequence and must
/// not block.
pub trait OrchestratedTask {
    /// Stable registry tag of this task.
    fn tag(&self) -> &'static str;

    /// Current state. Safe to call from any thread.
    fn state(&self) -> TaskState;

    /// Failure detail of the most recent terminal `Error` state, cleared by
    /// `reset()`.
    fn last_error(&self) -> Option<Error>;

    fn add_listener(&self, listener: StateListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Return a terminal task to `Idle` and clear its last error. Fails
    /// with [`Error::InvalidState`] unless the task is in `Success` or
    /// `Error`.
    fn reset(&self) -> Result<()>;
}

/// State cell, listener list and dedicated worker backing one task.
///
/// Each task instance owns exactly one worker thread; `run()` never blocks
/// the caller, and all hardware waits happen on the worker.
pub(crate) struct TaskCore {
    tag: &'static str,
    cell: Mutex<StateCell>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener_id: AtomicU64,
    worker: Sender<Job>,
}

#[derive(Debug)]
struct StateCell {
    state: TaskState,
    last_error: Option<Error>,
}

impl TaskCore {
    pub(crate) fn new(tag: &'static str) -> Self {
        let (tx, rx) = channel::<Job>();
        let spawned = thread::Builder::new()
            .name(tag.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        if let Err(e) = spawned {
            tracing::error!(tag, error = %e, "task worker thread failed to start");
        }
        Self {
            tag,
            cell: Mutex::new(StateCell {
                state: TaskState::Idle,
                last_error: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            worker: tx,
        }
    }

    pub(crate) fn tag(&self) -> &'static str {
        self.tag
    }

    pub(crate) fn state(&self) -> TaskState {
        util::lock(&self.cell).state
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        util::lock(&self.cell).last_error.clone()
    }

    /// Claim the task for a new run. A task that is already `Running`
    /// rejects the claim: the second request is a logged no-op, never a
    /// cancel-and-restart.
    pub(crate) fn try_start(&self) -> bool {
        let mut cell = util::lock(&self.cell);
        if cell.state == TaskState::Running {
            tracing::warn!(tag = self.tag, "run requested while already running; ignoring");
            return false;
        }
        cell.state = TaskState::Running;
        cell.last_error = None;
        true
    }

    /// Enqueue work on the task's own worker. If the worker is gone the
    /// task is failed terminally so it cannot stay `Running` forever.
    pub(crate) fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        if self.worker.send(Box::new(job)).is_err() {
            tracing::error!(tag = self.tag, "task worker unavailable; failing task");
            self.finish(Err(Error::service("task worker unavailable")));
        }
    }

    /// Notify listeners of a transition. Never called with `Idle`.
    pub(crate) fn notify(&self, state: TaskState) {
        let snapshot: Vec<StateListener> = util::lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(state);
        }
    }

    /// Record the terminal outcome of a run and notify listeners.
    pub(crate) fn finish(&self, result: Result<()>) {
        let state = match result {
            Ok(()) => {
                let mut cell = util::lock(&self.cell);
                cell.state = TaskState::Success;
                cell.last_error = None;
                tracing::info!(tag = self.tag, "task succeeded");
                TaskState::Success
            }
            Err(e) => {
                tracing::error!(tag = self.tag, error = %e, "task failed");
                let mut cell = util::lock(&self.cell);
                cell.state = TaskState::Error;
                cell.last_error = Some(e);
                TaskState::Error
            }
        };
        self.notify(state);
    }

    pub(crate) fn reset(&self) -> Result<()> {
        let mut cell = util::lock(&self.cell);
        if !cell.state.is_terminal() {
            return Err(Error::InvalidState {
                tag: self.tag,
                action: "reset",
                state: cell.state,
            });
        }
        cell.state = TaskState::Idle;
        cell.last_error = None;
        Ok(())
    }

    pub(crate) fn add_listener(&self, listener: StateListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        util::lock(&self.listeners).push((id, listener));
        ListenerId(id)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        util::lock(&self.listeners).retain(|(lid, _)| *lid != id.0);
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn new_core_is_idle_with_no_error() {
        let core = TaskCore::new("test-task");
        assert_eq!(core.state(), TaskState::Idle);
        assert!(core.last_error().is_none());
    }

    #[test]
    fn try_start_claims_idle_and_rejects_running() {
        let core = TaskCore::new("test-task");
        assert!(core.try_start());
        assert_eq!(core.state(), TaskState::Running);
        assert!(!core.try_start());
    }

    #[test]
    fn try_start_reclaims_terminal_state_and_clears_error() {
        let core = TaskCore::new("test-task");
        assert!(core.try_start());
        core.finish(Err(Error::service("boom")));
        assert!(core.last_error().is_some());

        assert!(core.try_start());
        assert_eq!(core.state(), TaskState::Running);
        assert!(core.last_error().is_none());
    }

    #[test]
    fn finish_records_error_for_inspection() {
        let core = TaskCore::new("test-task");
        assert!(core.try_start());
        core.finish(Err(Error::service("boom")));

        assert_eq!(core.state(), TaskState::Error);
        let Some(Error::Service { context }) = core.last_error() else {
            panic!("expected service error");
        };
        assert_eq!(context, "boom");
    }

    #[test]
    fn reset_only_legal_from_terminal_states() {
        let core = TaskCore::new("test-task");
        let err = core.reset().expect_err("reset from idle must fail");
        let Error::InvalidState { state, .. } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(state, TaskState::Idle);

        assert!(core.try_start());
        assert!(core.reset().is_err());

        core.finish(Ok(()));
        core.reset().expect("reset from success");
        assert_eq!(core.state(), TaskState::Idle);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let core = TaskCore::new("test-task");
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        core.add_listener(Arc::new(move |s| {
            let _ = tx.send((1, s));
        }));
        core.add_listener(Arc::new(move |s| {
            let _ = tx2.send((2, s));
        }));

        core.notify(TaskState::Running);

        assert_eq!(rx.recv().unwrap(), (1, TaskState::Running));
        assert_eq!(rx.recv().unwrap(), (2, TaskState::Running));
    }

    #[test]
    fn removed_listener_no_longer_fires() {
        let core = TaskCore::new("test-task");
        let (tx, rx) = mpsc::channel();
        let id = core.add_listener(Arc::new(move |s| {
            let _ = tx.send(s);
        }));
        core.remove_listener(id);

        core.notify(TaskState::Success);
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn scheduled_jobs_run_on_the_dedicated_worker() {
        let core = TaskCore::new("test-task");
        let (tx, rx) = mpsc::channel();
        core.schedule(move || {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test-task"));
    }

    #[test]
    fn a_listener_may_remove_itself_without_deadlock() {
        let core = Arc::new(TaskCore::new("test-task"));
        let (tx, rx) = mpsc::channel();
        let core2 = Arc::clone(&core);
        let slot = Arc::new(Mutex::new(None::<ListenerId>));
        let slot2 = Arc::clone(&slot);
        let id = core.add_listener(Arc::new(move |s| {
            if let Some(id) = *util::lock(&slot2) {
                core2.remove_listener(id);
            }
            let _ = tx.send(s);
        }));
        *util::lock(&slot) = Some(id);

        core.notify(TaskState::Success);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), TaskState::Success);

        core.notify(TaskState::Success);
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    }
}
