use std::sync::{Arc, Weak};

use crate::events::SlotEvent;
use crate::task::{ListenerId, OrchestratedTask, StateListener, TaskCore, TaskState};
use crate::types::command::SwitchCommand;
use crate::types::slot::{CardState, SlotInfo, SlotMapping};
use crate::types::subscription::SubscriptionRef;
use crate::waiter::CompletionWaiter;
use crate::{Error, Result, TaskContext};

/// Removable cards always attach through their slot's first port.
pub const DEFAULT_PORT_INDEX: u32 = 0;

/// Task performing one raw slot-mapping change.
///
/// The executor computes the new mapping table, issues it, and blocks its
/// worker until the hardware confirms the remap or the configured deadline
/// elapses. A target that is already the active configuration completes
/// with `Success` without touching hardware.
///
/// No retries happen here; retry policy belongs to the caller.
pub struct SlotSwitcher {
    core: TaskCore,
    ctx: Arc<TaskContext>,
    weak: Weak<Self>,
}

impl SlotSwitcher {
    pub const TAG: &'static str = "slot-switch";

    pub(crate) fn new(ctx: Arc<TaskContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: TaskCore::new(Self::TAG),
            ctx,
            weak: weak.clone(),
        })
    }

    /// Start one slot remap on the background worker. A second call while
    /// the task is running is a logged no-op.
    pub fn run(&self, command: SwitchCommand) -> Result<()> {
        if !self.core.try_start() {
            return Ok(());
        }
        let me = self.weak.clone();
        self.core.schedule(move || {
            let Some(task) = me.upgrade() else { return };
            task.core.notify(TaskState::Running);
            let result = task.execute(&command);
            task.core.finish(result);
        });
        Ok(())
    }

    pub(crate) fn core(&self) -> &TaskCore {
        &self.core
    }

    fn execute(&self, command: &SwitchCommand) -> Result<()> {
        tracing::info!(?command, "executing slot switch");
        match command {
            SwitchCommand::ToEuicc {
                slot,
                port,
                removed,
            } => self.switch_to_euicc(*slot, *port, removed.as_ref()),
            SwitchCommand::ToRemovable { slot, removed } => {
                self.switch_to_removable(*slot, removed.as_ref())
            }
        }
    }

    fn switch_to_euicc(
        &self,
        slot: u32,
        port: u32,
        removed: Option<&SubscriptionRef>,
    ) -> Result<()> {
        let svc = &self.ctx.slots;
        let mappings = svc.slot_mappings()?;
        if is_target_active(&mappings, slot, port) {
            tracing::info!(slot, port, "target eSIM port already mapped; nothing to switch");
            return Ok(());
        }

        let active = svc.active_subscriptions()?;
        let excluded =
            excluded_logical_slot(&mappings, &active, removed, svc.is_multi_sim_enabled());
        let new_mappings = prepare_slot_mappings(&mappings, false, slot, port, excluded);
        self.perform_switch(slot, port, &new_mappings)
    }

    fn switch_to_removable(
        &self,
        slot: Option<u32>,
        removed: Option<&SubscriptionRef>,
    ) -> Result<()> {
        let svc = &self.ctx.slots;
        let slot_infos = svc.query_slot_infos()?;
        let Some(target) = inactive_removable_slot(&slot_infos, slot)? else {
            tracing::info!(?slot, "removable slot already active; nothing to switch");
            return Ok(());
        };

        let mappings = svc.slot_mappings()?;
        let active = svc.active_subscriptions()?;
        let excluded =
            excluded_logical_slot(&mappings, &active, removed, svc.is_multi_sim_enabled());
        let new_mappings =
            prepare_slot_mappings(&mappings, true, target, DEFAULT_PORT_INDEX, excluded);
        self.perform_switch(target, DEFAULT_PORT_INDEX, &new_mappings)
    }

    fn perform_switch(&self, slot: u32, port: u32, mappings: &[SlotMapping]) -> Result<()> {
        let svc = &self.ctx.slots;
        let timeout = self.ctx.opts.slot_remap_timeout;

        // MEP hardware reports a completed remap through slot status;
        // everything else through the carrier-config reload that follows.
        let mep = svc.supports_multiple_enabled_profiles();
        let waiter = CompletionWaiter::arm(&self.ctx.events, "slot remap", timeout, move |event| {
            if mep {
                matches!(event, SlotEvent::SlotStatusChanged)
            } else {
                matches!(event, SlotEvent::CarrierConfigChanged)
            }
        });

        tracing::info!(slot, port, ?mappings, "applying new slot mapping");
        svc.set_physical_slot_mapping(mappings)?;

        waiter
            .wait()
            .map_err(|e| e.into_error("slot remap", timeout))?;
        Ok(())
    }
}

impl OrchestratedTask for SlotSwitcher {
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

pub(crate) fn is_target_active(mappings: &[SlotMapping], slot: u32, port: u32) -> bool {
    mappings
        .iter()
        .any(|m| m.physical_slot_index == slot && m.port_index == port)
}

/// Resolve which removable slot actually needs activating.
///
/// An explicit `requested` slot must exist and be removable. A slot whose
/// first port is already active needs nothing and resolves to `None`.
/// Without a request, the first inactive non-eUICC removable slot with a
/// usable card wins.
fn inactive_removable_slot(slots: &[SlotInfo], requested: Option<u32>) -> Result<Option<u32>> {
    match requested {
        Some(id) => {
            let Some(slot) = slots.iter().find(|s| s.physical_slot_index == id) else {
                return Err(Error::invalid_input(format!("no such physical slot: {id}")));
            };
            if !slot.is_removable {
                return Err(Error::invalid_input(format!(
                    "slot {id} is not a removable slot"
                )));
            }
            let Some(first_port) = slot.ports.first() else {
                return Err(Error::invalid_input(format!("slot {id} reports no ports")));
            };
            if first_port.active {
                return Ok(None);
            }
            Ok(Some(id))
        }
        None => Ok(slots
            .iter()
            .find(|s| {
                s.is_removable
                    && !s.is_euicc
                    && s.ports.first().is_some_and(|p| !p.active)
                    && s.card_state != CardState::Error
                    && s.card_state != CardState::Restricted
            })
            .map(|s| s.physical_slot_index)),
    }
}

/// Pick the logical slot whose mapping the remap will replace.
///
/// Single-SIM hardware has only logical slot 0. With a removal hint, the
/// hinted subscription's stack is vacated. Otherwise the lowest logical
/// slot that carries no active subscription is free to take the new
/// mapping; `None` means every stack is occupied and the mapping is left
/// untouched.
fn excluded_logical_slot(
    mappings: &[SlotMapping],
    active_subscriptions: &[SubscriptionRef],
    removed: Option<&SubscriptionRef>,
    multi_sim_enabled: bool,
) -> Option<u32> {
    if !multi_sim_enabled {
        tracing::debug!("single-SIM mode; logical slot 0 is replaced");
        return Some(0);
    }
    if let Some(removed) = removed {
        tracing::debug!(
            subscription_id = removed.subscription_id,
            logical_slot = removed.logical_slot_index,
            "vacating the hinted subscription's stack"
        );
        return u32::try_from(removed.logical_slot_index).ok();
    }
    let mut free: Vec<u32> = mappings
        .iter()
        .filter(|m| {
            !active_subscriptions
                .iter()
                .any(|sub| u32::try_from(sub.logical_slot_index) == Ok(m.logical_slot_index))
        })
        .map(|m| m.logical_slot_index)
        .collect();
    free.sort_unstable();
    free.first().copied()
}

/// Build the new mapping table that replaces the excluded logical slot
/// with the requested physical slot/port.
///
/// A removable target always claims logical slot 0 and the surviving
/// mappings are renumbered behind it; an eSIM target replaces the excluded
/// mapping in place. With no excluded slot the current table is returned
/// unchanged.
fn prepare_slot_mappings(
    mappings: &[SlotMapping],
    is_removable_target: bool,
    physical_slot: u32,
    port: u32,
    excluded_logical_slot: Option<u32>,
) -> Vec<SlotMapping> {
    let Some(excluded) = excluded_logical_slot else {
        tracing::debug!("no logical slot to vacate; keeping current mapping");
        return mappings.to_vec();
    };
    tracing::debug!(
        excluded,
        physical_slot,
        port,
        "replacing logical slot mapping"
    );

    let mut sorted = mappings.to_vec();
    sorted.sort_by_key(|m| m.logical_slot_index);

    let mut out = Vec::with_capacity(sorted.len() + 1);
    let mut next_logical = 0u32;
    if is_removable_target {
        // The removable slot always takes the first logical stack.
        out.push(SlotMapping {
            physical_slot_index: physical_slot,
            port_index: port,
            logical_slot_index: next_logical,
        });
        next_logical += 1;
    }
    for mapping in sorted {
        if mapping.logical_slot_index == excluded {
            if !is_removable_target {
                out.push(SlotMapping {
                    physical_slot_index: physical_slot,
                    port_index: port,
                    logical_slot_index: mapping.logical_slot_index,
                });
            }
            continue;
        }
        if is_removable_target {
            out.push(SlotMapping {
                physical_slot_index: mapping.physical_slot_index,
                port_index: mapping.port_index,
                logical_slot_index: next_logical,
            });
            next_logical += 1;
        } else {
            out.push(mapping);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::slot::PortInfo;

    const ESIM_SLOT: u32 = 0;
    const PSIM_SLOT: u32 = 1;

    fn mapping(physical: u32, port: u32, logical: u32) -> SlotMapping {
        SlotMapping {
            physical_slot_index: physical,
            port_index: port,
            logical_slot_index: logical,
        }
    }

    fn sub(id: i32, logical: i32, port: u32, embedded: bool) -> SubscriptionRef {
        SubscriptionRef {
            subscription_id: id,
            logical_slot_index: logical,
            port_index: port,
            is_embedded: embedded,
            is_removable: !embedded,
        }
    }

    // Mapping fixtures named after the modem working states they describe:
    // single-SIM pSIM, single-SIM eSIM port 0, pSIM plus one eSIM port, and
    // the two dual-eSIM-port assignments.
    fn ss_psim_active() -> Vec<SlotMapping> {
        vec![mapping(PSIM_SLOT, 0, 0)]
    }

    fn ss_esim_port0_active() -> Vec<SlotMapping> {
        vec![mapping(ESIM_SLOT, 0, 0)]
    }

    fn psim_and_port0() -> Vec<SlotMapping> {
        vec![mapping(PSIM_SLOT, 0, 0), mapping(ESIM_SLOT, 0, 1)]
    }

    fn psim_and_port1() -> Vec<SlotMapping> {
        vec![mapping(PSIM_SLOT, 0, 0), mapping(ESIM_SLOT, 1, 1)]
    }

    fn dual_ports_a() -> Vec<SlotMapping> {
        vec![mapping(ESIM_SLOT, 0, 0), mapping(ESIM_SLOT, 1, 1)]
    }

    fn dual_ports_b() -> Vec<SlotMapping> {
        vec![mapping(ESIM_SLOT, 1, 0), mapping(ESIM_SLOT, 0, 1)]
    }

    #[test]
    fn prepare_from_psim_active_to_esim_port0_active() {
        let out = prepare_slot_mappings(&ss_psim_active(), false, ESIM_SLOT, 0, Some(0));
        assert_eq!(out, ss_esim_port0_active());
    }

    #[test]
    fn prepare_from_esim_port0_active_to_psim_active() {
        let out = prepare_slot_mappings(&ss_esim_port0_active(), true, PSIM_SLOT, 0, Some(0));
        assert_eq!(out, ss_psim_active());
    }

    #[test]
    fn prepare_from_psim_and_port0_to_psim_and_port1() {
        let out = prepare_slot_mappings(&psim_and_port0(), false, ESIM_SLOT, 1, Some(1));
        assert_eq!(out, psim_and_port1());
    }

    #[test]
    fn prepare_from_psim_and_port1_to_psim_and_port0() {
        let out = prepare_slot_mappings(&psim_and_port1(), false, ESIM_SLOT, 0, Some(1));
        assert_eq!(out, psim_and_port0());
    }

    #[test]
    fn prepare_from_psim_and_port0_to_dual_ports_b() {
        let out = prepare_slot_mappings(&psim_and_port0(), false, ESIM_SLOT, 1, Some(0));
        assert_eq!(out, dual_ports_b());
    }

    #[test]
    fn prepare_from_psim_and_port1_to_dual_ports_a() {
        let out = prepare_slot_mappings(&psim_and_port1(), false, ESIM_SLOT, 0, Some(0));
        assert_eq!(out, dual_ports_a());
    }

    #[test]
    fn prepare_from_dual_ports_a_to_psim_and_port1() {
        let out = prepare_slot_mappings(&dual_ports_a(), true, PSIM_SLOT, 0, Some(0));
        assert_eq!(out, psim_and_port1());
    }

    #[test]
    fn prepare_from_dual_ports_a_to_psim_and_port0() {
        let out = prepare_slot_mappings(&dual_ports_a(), true, PSIM_SLOT, 0, Some(1));
        assert_eq!(out, psim_and_port0());
    }

    #[test]
    fn prepare_from_dual_ports_b_to_psim_and_port1() {
        let out = prepare_slot_mappings(&dual_ports_b(), true, PSIM_SLOT, 0, Some(1));
        assert_eq!(out, psim_and_port1());
    }

    #[test]
    fn prepare_from_dual_ports_b_to_psim_and_port0() {
        let out = prepare_slot_mappings(&dual_ports_b(), true, PSIM_SLOT, 0, Some(0));
        assert_eq!(out, psim_and_port0());
    }

    #[test]
    fn prepare_without_excluded_slot_keeps_mappings() {
        let out = prepare_slot_mappings(&psim_and_port0(), false, ESIM_SLOT, 1, None);
        assert_eq!(out, psim_and_port0());
    }

    #[test]
    fn prepare_ignores_input_ordering() {
        let mut shuffled = dual_ports_b();
        shuffled.reverse();
        let out = prepare_slot_mappings(&shuffled, true, PSIM_SLOT, 0, Some(0));
        assert_eq!(out, psim_and_port0());
    }

    #[test]
    fn excluded_slot_in_single_sim_mode_is_zero() {
        let subs = vec![sub(1, 0, 0, false)];
        let out = excluded_logical_slot(&ss_psim_active(), &subs, None, false);
        assert_eq!(out, Some(0));
    }

    #[test]
    fn excluded_slot_uses_removal_hint() {
        let subs = vec![sub(1, 0, 0, false), sub(2, 1, 0, true)];
        let hint = sub(2, 1, 0, true);
        let out = excluded_logical_slot(&psim_and_port0(), &subs, Some(&hint), true);
        assert_eq!(out, Some(1));
    }

    #[test]
    fn excluded_slot_picks_lowest_empty_stack() {
        // Only logical slot 1 carries an active subscription.
        let subs = vec![sub(2, 1, 0, true)];
        let out = excluded_logical_slot(&psim_and_port0(), &subs, None, true);
        assert_eq!(out, Some(0));
    }

    #[test]
    fn excluded_slot_skips_occupied_stacks() {
        let subs = vec![sub(2, 0, 0, true)];
        let out = excluded_logical_slot(&dual_ports_a(), &subs, None, true);
        assert_eq!(out, Some(1));
    }

    #[test]
    fn excluded_slot_none_when_all_stacks_occupied() {
        let subs = vec![sub(1, 0, 0, false), sub(2, 1, 0, true)];
        let out = excluded_logical_slot(&psim_and_port0(), &subs, None, true);
        assert_eq!(out, None);
    }

    #[test]
    fn excluded_slot_with_no_active_subscriptions_is_lowest() {
        let out = excluded_logical_slot(&dual_ports_a(), &[], None, true);
        assert_eq!(out, Some(0));
    }

    fn slot(physical: u32, removable: bool, euicc: bool, active: bool, card: CardState) -> SlotInfo {
        SlotInfo {
            physical_slot_index: physical,
            is_euicc: euicc,
            is_removable: removable,
            card_state: card,
            ports: vec![PortInfo {
                port_index: 0,
                active,
            }],
        }
    }

    #[test]
    fn inactive_removable_slot_returns_requested_inactive_slot() {
        let slots = vec![
            slot(0, false, true, true, CardState::Present),
            slot(1, true, false, false, CardState::Present),
        ];
        let out = inactive_removable_slot(&slots, Some(1)).unwrap();
        assert_eq!(out, Some(1));
    }

    #[test]
    fn inactive_removable_slot_none_when_requested_slot_is_active() {
        let slots = vec![slot(1, true, false, true, CardState::Present)];
        let out = inactive_removable_slot(&slots, Some(1)).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn inactive_removable_slot_rejects_non_removable_request() {
        let slots = vec![slot(0, false, true, true, CardState::Present)];
        let err = inactive_removable_slot(&slots, Some(0)).unwrap_err();
        let Error::InvalidInput { .. } = err else {
            panic!("unexpected error: {err:?}");
        };
    }

    #[test]
    fn inactive_removable_slot_rejects_unknown_slot() {
        let err = inactive_removable_slot(&[], Some(3)).unwrap_err();
        let Error::InvalidInput { .. } = err else {
            panic!("unexpected error: {err:?}");
        };
    }

    #[test]
    fn inactive_removable_slot_scans_for_first_usable_candidate() {
        let slots = vec![
            slot(0, false, true, true, CardState::Present),
            slot(1, true, false, false, CardState::Error),
            slot(2, true, false, false, CardState::Present),
        ];
        let out = inactive_removable_slot(&slots, None).unwrap();
        assert_eq!(out, Some(2));
    }

    #[test]
    fn inactive_removable_slot_scan_can_come_up_empty() {
        let slots = vec![slot(1, true, false, true, CardState::Present)];
        let out = inactive_removable_slot(&slots, None).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn target_active_matches_slot_and_port() {
        assert!(is_target_active(&psim_and_port1(), ESIM_SLOT, 1));
        assert!(!is_target_active(&psim_and_port1(), ESIM_SLOT, 0));
        assert!(is_target_active(&psim_and_port1(), PSIM_SLOT, 0));
    }
}
