use std::sync::{Arc, Mutex, Weak};

use crate::euicc_switch::EuiccProfileSwitcher;
use crate::slot_switch::{DEFAULT_PORT_INDEX, SlotSwitcher};
use crate::task::{ListenerId, OrchestratedTask, StateListener, TaskCore, TaskState};
use crate::types::command::SwitchCommand;
use crate::types::subscription::{INVALID_SUBSCRIPTION_ID, SubscriptionRef};
use crate::util;
use crate::{Error, Result, TaskContext};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Step {
    DisablingProfile,
    SwitchingSlot,
}

#[derive(Clone, Debug)]
struct PendingRestore {
    slot: Option<u32>,
    removed: Option<SubscriptionRef>,
    step: Step,
    child_listener: Option<ListenerId>,
}

/// Task restoring a physical/removable SIM to active service.
///
/// Single-SIM hardware can only carry one active identity, so any enabled
/// eSIM profile is deactivated first; multi-SIM MEP hardware deactivates
/// only the specific embedded profile named by the removal hint. The slot
/// remap itself is delegated to [`SlotSwitcher`]. Each delegated stage is
/// observed through the listener mechanism, consumed, and the sub-task
/// reset before the next stage starts.
pub struct RemovableSlotSwitcher {
    core: TaskCore,
    ctx: Arc<TaskContext>,
    profile_switcher: Arc<EuiccProfileSwitcher>,
    slot_switcher: Arc<SlotSwitcher>,
    weak: Weak<Self>,
    pending: Mutex<Option<PendingRestore>>,
}

impl RemovableSlotSwitcher {
    pub const TAG: &'static str = "removable-slot-switch";

    pub(crate) fn new(
        ctx: Arc<TaskContext>,
        profile_switcher: Arc<EuiccProfileSwitcher>,
        slot_switcher: Arc<SlotSwitcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: TaskCore::new(Self::TAG),
            ctx,
            profile_switcher,
            slot_switcher,
            weak: weak.clone(),
            pending: Mutex::new(None),
        })
    }

    /// Switch active service to the given removable slot (`None` selects
    /// the first inactive removable slot). `removed` names the subscription
    /// to vacate when every port is occupied. A second call while the task
    /// is running is a logged no-op.
    pub fn run(&self, slot: Option<u32>, removed: Option<SubscriptionRef>) -> Result<()> {
        if !self.core.try_start() {
            return Ok(());
        }
        let me = self.weak.clone();
        self.core.schedule(move || {
            let Some(task) = me.upgrade() else { return };
            task.core.notify(TaskState::Running);
            task.begin(slot, removed);
        });
        Ok(())
    }

    /// Runs on this task's worker: decide whether an eSIM profile has to go
    /// first, then start the appropriate stage.
    fn begin(&self, slot: Option<u32>, removed: Option<SubscriptionRef>) {
        let svc = &self.ctx.slots;
        let active = match svc.active_subscriptions() {
            Ok(a) => a,
            Err(e) => return self.core.finish(Err(e)),
        };
        let multi_sim = svc.is_multi_sim_enabled();
        let mep = svc.supports_multiple_enabled_profiles();

        *util::lock(&self.pending) = Some(PendingRestore {
            slot,
            removed: removed.clone(),
            step: Step::DisablingProfile,
            child_listener: None,
        });

        if !multi_sim && active.iter().any(|s| s.is_embedded) {
            tracing::info!(?slot, "single-SIM mode with an active eSIM profile; disabling it first");
            self.disable_profile(DEFAULT_PORT_INDEX);
        } else if multi_sim
            && mep
            && let Some(conflicting) = removed.as_ref().filter(|r| r.is_embedded)
        {
            tracing::info!(
                ?slot,
                subscription_id = conflicting.subscription_id,
                port = conflicting.port_index,
                "disabling the embedded profile being replaced"
            );
            self.disable_profile(conflicting.port_index);
        } else {
            self.switch_slot_stage();
        }
    }

    /// Delegate one profile deactivation to the eSIM switcher.
    fn disable_profile(&self, port: u32) {
        let me = self.weak.clone();
        let listener = self
            .profile_switcher
            .core()
            .add_listener(Arc::new(move |state| {
                if !state.is_terminal() {
                    return;
                }
                if let Some(task) = me.upgrade() {
                    task.on_profile_disabled(state);
                }
            }));
        if let Some(p) = util::lock(&self.pending).as_mut() {
            p.child_listener = Some(listener);
        }

        if let Err(e) = self
            .profile_switcher
            .run(INVALID_SUBSCRIPTION_ID, Some(port), None)
        {
            self.profile_switcher.core().remove_listener(listener);
            self.core.finish(Err(Error::chained("profile disable", e)));
        }
    }

    /// Listener reaction, inline on the profile switcher's notifier:
    /// consume its terminal state, reset it, then continue on our worker.
    fn on_profile_disabled(&self, state: TaskState) {
        let Some(listener) = self.take_child_listener() else {
            return;
        };
        let child = self.profile_switcher.core();
        child.remove_listener(listener);
        let child_error = child.last_error();
        if let Err(e) = child.reset() {
            tracing::warn!(error = %e, "could not reset profile switcher after consuming its state");
        }

        match state {
            TaskState::Success => {
                let me = self.weak.clone();
                self.core.schedule(move || {
                    if let Some(task) = me.upgrade() {
                        task.switch_slot_stage();
                    }
                });
            }
            _ => {
                let cause = child_error.unwrap_or_else(|| Error::service("profile disable failed"));
                self.core.finish(Err(Error::chained("profile disable", cause)));
            }
        }
    }

    /// Runs on this task's worker: delegate the actual slot remap.
    fn switch_slot_stage(&self) {
        let params = {
            let mut pending = util::lock(&self.pending);
            match pending.as_mut() {
                Some(p) => {
                    tracing::debug!(from = ?p.step, "advancing to the slot switch step");
                    p.step = Step::SwitchingSlot;
                    Some((p.slot, p.removed.clone()))
                }
                None => None,
            }
        };
        let Some((slot, removed)) = params else {
            return self
                .core
                .finish(Err(Error::service("restore chain state lost")));
        };

        let me = self.weak.clone();
        let listener = self.slot_switcher.core().add_listener(Arc::new(move |state| {
            if !state.is_terminal() {
                return;
            }
            if let Some(task) = me.upgrade() {
                task.on_slot_switched(state);
            }
        }));
        if let Some(p) = util::lock(&self.pending).as_mut() {
            p.child_listener = Some(listener);
        }

        if let Err(e) = self
            .slot_switcher
            .run(SwitchCommand::ToRemovable { slot, removed })
        {
            self.slot_switcher.core().remove_listener(listener);
            self.core.finish(Err(Error::chained("slot switch", e)));
        }
    }

    /// Listener reaction, inline on the slot switcher's notifier.
    fn on_slot_switched(&self, state: TaskState) {
        let Some(listener) = self.take_child_listener() else {
            return;
        };
        let child = self.slot_switcher.core();
        child.remove_listener(listener);
        let child_error = child.last_error();
        if let Err(e) = child.reset() {
            tracing::warn!(error = %e, "could not reset slot switcher after consuming its state");
        }

        match state {
            TaskState::Success => {
                *util::lock(&self.pending) = None;
                self.core.finish(Ok(()));
            }
            _ => {
                let cause = child_error.unwrap_or_else(|| Error::service("slot switch failed"));
                self.core.finish(Err(Error::chained("slot switch", cause)));
            }
        }
    }

    fn take_child_listener(&self) -> Option<ListenerId> {
        let listener = util::lock(&self.pending)
            .as_mut()
            .and_then(|p| p.child_listener.take());
        if listener.is_none() {
            tracing::warn!("sub-task completion without a pending chain; ignoring");
        }
        listener
    }
}

impl OrchestratedTask for RemovableSlotSwitcher {
    fn tag(&self) -> &'static str {
        self.core.tag()
    }

    fn state(&self) -> TaskState {
        self.core.state()
    }

    fn last_error(&self) -> Option<Error> {
        self.core.last_error()
    }

    fn add_listener(&self, listener: StateListener) -> ListenerId {
        self.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.core.remove_listener(id)
    }

    fn reset(&self) -> Result<()> {
        self.core.reset()
    }
}
