use std::sync::{Arc, Weak};

use crate::events::SlotEvent;
use crate::task::{ListenerId, OrchestratedTask, StateListener, TaskCore, TaskState};
use crate::types::slot::{CardState, SlotInfo};
use crate::waiter::CompletionWaiter;
use crate::{Error, Result, TaskContext};

/// Task switching the modem into a mode with N simultaneously active SIMs.
///
/// Preconditions are checked synchronously before any background work: a
/// request beyond modem capacity, or hardware that needs a reboot for the
/// mode change, fails immediately and the task never leaves `Idle`.
///
/// The mode change itself settles gradually (ports come up one by one),
/// so the completion wait re-queries the hardware on every event and only
/// succeeds once the active modem count and the number of active ports
/// with a present card both equal the requested count. Intermediate events
/// that do not yet satisfy the condition are logged and ignored.
pub struct MultiSimEnabler {
    core: TaskCore,
    ctx: Arc<TaskContext>,
    weak: Weak<Self>,
}

impl MultiSimEnabler {
    pub const TAG: &'static str = "multi-sim-enable";

    pub(crate) fn new(ctx: Arc<TaskContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: TaskCore::new(Self::TAG),
            ctx,
            weak: weak.clone(),
        })
    }

    /// Request `num_active_sims` simultaneously active SIMs. A second call
    /// while the task is running is a logged no-op.
    pub fn run(&self, num_active_sims: u32) -> Result<()> {
        let svc = &self.ctx.slots;
        let supported = svc.supported_modem_count();
        if num_active_sims > supported {
            return Err(Error::unsupported(format!(
                "requested {num_active_sims} active SIMs but the modem supports {supported}"
            )));
        }
        if svc.reboot_required_for_modem_config() {
            return Err(Error::unsupported(
                "changing the multi-SIM configuration requires a reboot on this hardware",
            ));
        }

        if !self.core.try_start() {
            return Ok(());
        }
        let me = self.weak.clone();
        self.core.schedule(move || {
            let Some(task) = me.upgrade() else { return };
            task.core.notify(TaskState::Running);
            let result = task.enable(num_active_sims);
            task.core.finish(result);
        });
        Ok(())
    }

    fn enable(&self, requested: u32) -> Result<()> {
        let svc = &self.ctx.slots;
        let timeout = self.ctx.opts.multi_sim_enable_timeout;

        let waiter =
            CompletionWaiter::arm(&self.ctx.events, "multi-SIM enable", timeout, |event| {
                match event {
                    SlotEvent::SlotStatusChanged
                    | SlotEvent::CarrierConfigChanged
                    | SlotEvent::ModemConfigChanged { .. } => {}
                    _ => return false,
                }
                let active_modems = svc.active_modem_count();
                if active_modems != requested {
                    tracing::debug!(active_modems, requested, "modem count not settled yet");
                    return false;
                }
                match svc.query_slot_infos() {
                    Ok(slots) => {
                        let ready = ready_active_port_count(&slots);
                        if ready != requested {
                            tracing::debug!(ready, requested, "ports not settled yet");
                        }
                        ready == requested
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "slot query failed while settling; ignoring event");
                        false
                    }
                }
            });

        tracing::info!(requested, "switching multi-SIM configuration");
        svc.switch_multi_sim_config(requested)?;

        waiter
            .wait()
            .map_err(|e| e.into_error("multi-SIM enable", timeout))?;
        Ok(())
    }
}

impl OrchestratedTask for MultiSimEnabler {
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

/// Count ports in active service whose slot holds a usable card.
fn ready_active_port_count(slots: &[SlotInfo]) -> u32 {
    slots
        .iter()
        .filter(|s| s.card_state == CardState::Present)
        .flat_map(|s| s.ports.iter())
        .filter(|p| p.active)
        .count() as u32
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::slot::PortInfo;

    fn slot(card: CardState, port_active: &[bool]) -> SlotInfo {
        SlotInfo {
            physical_slot_index: 0,
            is_euicc: false,
            is_removable: true,
            card_state: card,
            ports: port_active
                .iter()
                .enumerate()
                .map(|(i, active)| PortInfo {
                    port_index: i as u32,
                    active: *active,
                })
                .collect(),
        }
    }

    #[test]
    fn counts_active_ports_on_present_cards() {
        let slots = vec![
            slot(CardState::Present, &[true]),
            slot(CardState::Present, &[true, false]),
        ];
        assert_eq!(ready_active_port_count(&slots), 2);
    }

    #[test]
    fn ignores_ports_on_absent_or_broken_cards() {
        let slots = vec![
            slot(CardState::Absent, &[true]),
            slot(CardState::Error, &[true]),
            slot(CardState::Present, &[false]),
        ];
        assert_eq!(ready_active_port_count(&slots), 0);
    }
}
