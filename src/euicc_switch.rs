use std::sync::{Arc, Mutex, Weak};

use crate::events::SlotEvent;
use crate::slot_switch::{SlotSwitcher, is_target_active};
use crate::task::{ListenerId, OrchestratedTask, StateListener, TaskCore, TaskState};
use crate::types::command::SwitchCommand;
use crate::types::slot::{SlotInfo, SlotMapping};
use crate::types::subscription::{INVALID_SUBSCRIPTION_ID, SubscriptionRef};
use crate::util;
use crate::waiter::CompletionWaiter;
use crate::{Error, Result, TaskContext};

/// Position within the switch chain.
///
/// Both profile waits observe the same completion event on the same
/// channel; the recorded phase is what tells a pre-disable completion
/// apart from the final one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    PreDisable,
    SlotRemap,
    FinalSwitch,
}

#[derive(Clone, Debug)]
struct PendingSwitch {
    subscription_id: i32,
    esim_slot: u32,
    port: u32,
    removed: Option<SubscriptionRef>,
    phase: Phase,
    child_listener: Option<ListenerId>,
}

/// Task enabling or disabling one eSIM profile.
///
/// The full chain is: deactivate a conflicting profile when multi-SIM MEP
/// hardware replaces an active embedded subscription, remap the eSIM slot
/// onto the computed port when it is not mapped yet (delegated to
/// [`SlotSwitcher`]), then issue the real profile switch. Each stage's
/// completion is fully observed before the next stage starts.
pub struct EuiccProfileSwitcher {
    core: TaskCore,
    ctx: Arc<TaskContext>,
    slot_switcher: Arc<SlotSwitcher>,
    weak: Weak<Self>,
    pending: Mutex<Option<PendingSwitch>>,
}

impl EuiccProfileSwitcher {
    pub const TAG: &'static str = "euicc-profile-switch";

    pub(crate) fn new(ctx: Arc<TaskContext>, slot_switcher: Arc<SlotSwitcher>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: TaskCore::new(Self::TAG),
            ctx,
            slot_switcher,
            weak: weak.clone(),
            pending: Mutex::new(None),
        })
    }

    /// Enable `subscription_id` on the eSIM (or deactivate a port when
    /// given [`INVALID_SUBSCRIPTION_ID`]).
    ///
    /// `port_override` pins the target port; without it the port is
    /// computed from hardware capability, the current mapping and the
    /// `removed` hint. A second call while the task is running is a logged
    /// no-op.
    pub fn run(
        &self,
        subscription_id: i32,
        port_override: Option<u32>,
        removed: Option<SubscriptionRef>,
    ) -> Result<()> {
        if !self.core.try_start() {
            return Ok(());
        }
        let me = self.weak.clone();
        self.core.schedule(move || {
            let Some(task) = me.upgrade() else { return };
            task.core.notify(TaskState::Running);
            task.begin(subscription_id, port_override, removed);
        });
        Ok(())
    }

    pub(crate) fn core(&self) -> &TaskCore {
        &self.core
    }

    /// Runs on this task's worker: resolve the target, run the pre-disable
    /// stage if needed, then hand over to the slot-ready stage.
    fn begin(
        &self,
        subscription_id: i32,
        port_override: Option<u32>,
        removed: Option<SubscriptionRef>,
    ) {
        let svc = &self.ctx.slots;
        let slot_infos = match svc.query_slot_infos() {
            Ok(v) => v,
            Err(e) => return self.core.finish(Err(e)),
        };
        let Some(esim_slot) = first_euicc_slot(&slot_infos) else {
            return self
                .core
                .finish(Err(Error::unsupported("no eUICC slot present")));
        };
        let (active, mappings) = match (svc.active_subscriptions(), svc.slot_mappings()) {
            (Ok(a), Ok(m)) => (a, m),
            (Err(e), _) | (_, Err(e)) => return self.core.finish(Err(e)),
        };

        let multi_sim = svc.is_multi_sim_enabled();
        let mep = svc.supports_multiple_enabled_profiles();
        let removed = validated_hint(&active, removed);
        let port = port_override.unwrap_or_else(|| {
            target_port(&mappings, esim_slot, multi_sim, mep, removed.as_ref())
        });
        tracing::info!(
            subscription_id,
            esim_slot,
            port,
            multi_sim,
            mep,
            "starting eSIM profile switch"
        );
        *util::lock(&self.pending) = Some(PendingSwitch {
            subscription_id,
            esim_slot,
            port,
            removed: removed.clone(),
            phase: Phase::PreDisable,
            child_listener: None,
        });

        if multi_sim
            && mep
            && let Some(conflicting) = removed.as_ref().filter(|r| r.is_embedded)
            && !self.pre_disable(conflicting)
        {
            return;
        }
        self.slot_ready_stage();
    }

    /// Deactivate the profile that currently occupies the target port.
    /// Returns false when the chain already finished with an error.
    fn pre_disable(&self, conflicting: &SubscriptionRef) -> bool {
        let timeout = self.ctx.opts.profile_switch_timeout;
        tracing::info!(
            subscription_id = conflicting.subscription_id,
            port = conflicting.port_index,
            "deactivating conflicting profile before switch"
        );
        let waiter = CompletionWaiter::arm(
            &self.ctx.events,
            "profile pre-disable",
            timeout,
            |event| matches!(event, SlotEvent::ProfileSwitchCompleted { .. }),
        );
        if let Err(e) = self
            .ctx
            .slots
            .set_active_profile(INVALID_SUBSCRIPTION_ID, conflicting.port_index)
        {
            self.core.finish(Err(e));
            return false;
        }
        match waiter.wait() {
            Ok(SlotEvent::ProfileSwitchCompleted { success: true }) => true,
            Ok(_) => {
                self.core.finish(Err(Error::SwitchRejected {
                    subscription_id: INVALID_SUBSCRIPTION_ID,
                    port_index: conflicting.port_index,
                }));
                false
            }
            Err(e) => {
                self.core
                    .finish(Err(e.into_error("profile pre-disable", timeout)));
                false
            }
        }
    }

    /// Ensure the eSIM slot is mapped onto the target port, delegating the
    /// remap to the slot switcher when it is not.
    fn slot_ready_stage(&self) {
        let Some((esim_slot, port, removed)) = self.with_pending(Phase::SlotRemap, |p| {
            (p.esim_slot, p.port, p.removed.clone())
        }) else {
            return;
        };

        let mappings = match self.ctx.slots.slot_mappings() {
            Ok(m) => m,
            Err(e) => return self.core.finish(Err(e)),
        };
        if is_target_active(&mappings, esim_slot, port) {
            tracing::debug!(esim_slot, port, "eSIM slot already mapped; skipping remap");
            return self.final_switch_stage();
        }

        let me = self.weak.clone();
        let listener = self.slot_switcher.core().add_listener(Arc::new(move |state| {
            if !state.is_terminal() {
                return;
            }
            if let Some(task) = me.upgrade() {
                task.on_slot_switch_done(state);
            }
        }));
        if let Some(p) = util::lock(&self.pending).as_mut() {
            p.child_listener = Some(listener);
        }

        if let Err(e) = self.slot_switcher.run(SwitchCommand::ToEuicc {
            slot: esim_slot,
            port,
            removed,
        }) {
            self.slot_switcher.core().remove_listener(listener);
            self.core.finish(Err(Error::chained("slot remap", e)));
        }
    }

    /// Listener reaction, inline on the slot switcher's worker: consume the
    /// child's terminal state, reset it for the next caller, and move the
    /// chain back onto this task's own worker.
    fn on_slot_switch_done(&self, state: TaskState) {
        let listener = util::lock(&self.pending)
            .as_mut()
            .and_then(|p| p.child_listener.take());
        let Some(listener) = listener else {
            tracing::warn!("slot switch completion without a pending chain; ignoring");
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
                let me = self.weak.clone();
                self.core.schedule(move || {
                    if let Some(task) = me.upgrade() {
                        task.final_switch_stage();
                    }
                });
            }
            _ => {
                let cause = child_error.unwrap_or_else(|| Error::service("slot switch failed"));
                self.core.finish(Err(Error::chained("slot remap", cause)));
            }
        }
    }

    /// Issue the real profile switch and wait for its completion event.
    fn final_switch_stage(&self) {
        let Some((subscription_id, port)) =
            self.with_pending(Phase::FinalSwitch, |p| (p.subscription_id, p.port))
        else {
            return;
        };

        let timeout = self.ctx.opts.profile_switch_timeout;
        let waiter = CompletionWaiter::arm(&self.ctx.events, "profile switch", timeout, |event| {
            matches!(event, SlotEvent::ProfileSwitchCompleted { .. })
        });
        tracing::info!(subscription_id, port, "issuing profile switch");
        if let Err(e) = self.ctx.slots.set_active_profile(subscription_id, port) {
            return self.core.finish(Err(e));
        }
        let result = match waiter.wait() {
            Ok(SlotEvent::ProfileSwitchCompleted { success: true }) => Ok(()),
            Ok(_) => Err(Error::SwitchRejected {
                subscription_id,
                port_index: port,
            }),
            Err(e) => Err(e.into_error("profile switch", timeout)),
        };
        *util::lock(&self.pending) = None;
        self.core.finish(result);
    }

    /// Advance the recorded phase and read chain parameters, failing the
    /// task if the chain state vanished underneath us.
    fn with_pending<T>(&self, phase: Phase, read: impl FnOnce(&PendingSwitch) -> T) -> Option<T> {
        let mut pending = util::lock(&self.pending);
        match pending.as_mut() {
            Some(p) => {
                tracing::debug!(from = ?p.phase, to = ?phase, "advancing switch chain");
                p.phase = phase;
                Some(read(p))
            }
            None => {
                drop(pending);
                self.core
                    .finish(Err(Error::service("switch chain state lost")));
                None
            }
        }
    }
}

impl OrchestratedTask for EuiccProfileSwitcher {
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

/// Drop a removal hint that no longer names an active subscription; the
/// port computation then falls back to the no-hint rule.
fn validated_hint(
    active: &[SubscriptionRef],
    removed: Option<SubscriptionRef>,
) -> Option<SubscriptionRef> {
    let removed = removed?;
    if active
        .iter()
        .any(|s| s.subscription_id == removed.subscription_id)
    {
        return Some(removed);
    }
    tracing::info!(
        subscription_id = removed.subscription_id,
        "removal hint is no longer active; ignoring it"
    );
    None
}

fn first_euicc_slot(slots: &[SlotInfo]) -> Option<u32> {
    slots
        .iter()
        .find(|s| s.is_euicc)
        .map(|s| s.physical_slot_index)
}

/// Port the profile switch targets.
///
/// Hardware without multiple enabled profiles, or not in multi-SIM mode,
/// only ever uses port 0. When the replaced subscription is itself
/// embedded its port is reused in place; otherwise the lowest port not yet
/// mapped on the eSIM slot is taken.
fn target_port(
    mappings: &[SlotMapping],
    esim_slot: u32,
    multi_sim_enabled: bool,
    mep_supported: bool,
    removed: Option<&SubscriptionRef>,
) -> u32 {
    if !mep_supported || !multi_sim_enabled {
        return 0;
    }
    if let Some(removed) = removed
        && removed.is_embedded
    {
        return removed.port_index;
    }
    let mut port = 0;
    while mappings
        .iter()
        .any(|m| m.physical_slot_index == esim_slot && m.port_index == port)
    {
        port += 1;
    }
    port
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::slot::{CardState, PortInfo};

    const ESIM_SLOT: u32 = 0;

    fn mapping(physical: u32, port: u32, logical: u32) -> SlotMapping {
        SlotMapping {
            physical_slot_index: physical,
            port_index: port,
            logical_slot_index: logical,
        }
    }

    fn embedded_sub(id: i32, logical: i32, port: u32) -> SubscriptionRef {
        SubscriptionRef {
            subscription_id: id,
            logical_slot_index: logical,
            port_index: port,
            is_embedded: true,
            is_removable: false,
        }
    }

    fn removable_sub(id: i32, logical: i32) -> SubscriptionRef {
        SubscriptionRef {
            subscription_id: id,
            logical_slot_index: logical,
            port_index: 0,
            is_embedded: false,
            is_removable: true,
        }
    }

    #[test]
    fn port_is_zero_without_multi_profile_support() {
        let mappings = vec![mapping(ESIM_SLOT, 0, 0)];
        assert_eq!(target_port(&mappings, ESIM_SLOT, true, false, None), 0);
    }

    #[test]
    fn port_is_zero_in_single_sim_mode() {
        let mappings = vec![mapping(ESIM_SLOT, 0, 0)];
        assert_eq!(target_port(&mappings, ESIM_SLOT, false, true, None), 0);
    }

    #[test]
    fn port_reuses_the_removed_embedded_subscriptions_port() {
        // Both ports occupied by embedded profiles; the hint on port 1 is
        // replaced in place.
        let mappings = vec![mapping(ESIM_SLOT, 0, 0), mapping(ESIM_SLOT, 1, 1)];
        let hint = embedded_sub(7, 1, 1);
        assert_eq!(
            target_port(&mappings, ESIM_SLOT, true, true, Some(&hint)),
            1
        );
    }

    #[test]
    fn port_scans_for_first_free_when_hint_is_not_embedded() {
        let mappings = vec![mapping(1, 0, 0), mapping(ESIM_SLOT, 0, 1)];
        let hint = removable_sub(3, 0);
        assert_eq!(
            target_port(&mappings, ESIM_SLOT, true, true, Some(&hint)),
            1
        );
    }

    #[test]
    fn port_scans_for_first_free_without_hint() {
        // Port 0 occupied on the eSIM slot, port 1 free.
        let mappings = vec![mapping(1, 0, 0), mapping(ESIM_SLOT, 0, 1)];
        assert_eq!(target_port(&mappings, ESIM_SLOT, true, true, None), 1);
    }

    #[test]
    fn port_zero_when_esim_slot_is_unmapped() {
        let mappings = vec![mapping(1, 0, 0)];
        assert_eq!(target_port(&mappings, ESIM_SLOT, true, true, None), 0);
    }

    #[test]
    fn stale_hint_is_dropped() {
        let active = vec![embedded_sub(1, 0, 0)];
        let stale = embedded_sub(9, 1, 1);
        assert_eq!(validated_hint(&active, Some(stale)), None);
    }

    #[test]
    fn live_hint_is_kept() {
        let active = vec![embedded_sub(9, 1, 1)];
        let hint = embedded_sub(9, 1, 1);
        assert_eq!(validated_hint(&active, Some(hint.clone())), Some(hint));
    }

    #[test]
    fn first_euicc_slot_skips_removable_trays() {
        let slots = vec![
            SlotInfo {
                physical_slot_index: 0,
                is_euicc: false,
                is_removable: true,
                card_state: CardState::Present,
                ports: vec![PortInfo {
                    port_index: 0,
                    active: true,
                }],
            },
            SlotInfo {
                physical_slot_index: 1,
                is_euicc: true,
                is_removable: false,
                card_state: CardState::Present,
                ports: vec![PortInfo {
                    port_index: 0,
                    active: false,
                }],
            },
        ];
        assert_eq!(first_euicc_slot(&slots), Some(1));
        assert_eq!(first_euicc_slot(&slots[..1]), None);
    }
}
