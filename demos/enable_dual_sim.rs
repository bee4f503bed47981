//! Enable dual-SIM operation against a simulated modem.
//!
//! Run with: `cargo run --example enable_dual_sim`

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use simswitch::{
    CardState, EventBus, OrchestratedTask, PortInfo, Result, SimSwitch, SlotEvent, SlotInfo,
    SlotInfoService, SlotMapping, SubscriptionRef, TaskState,
};

/// Minimal modem simulation: one eSIM slot with an enabled profile plus an
/// inactive pSIM tray, capable of two active SIMs. The mode switch brings
/// the pSIM port up and reports completion through the event bus.
struct SimulatedModem {
    slots: Mutex<Vec<SlotInfo>>,
    active_modem_count: Mutex<u32>,
    bus: Mutex<Option<EventBus>>,
}

impl SimulatedModem {
    fn new() -> Self {
        Self {
            slots: Mutex::new(vec![
                SlotInfo {
                    physical_slot_index: 0,
                    is_euicc: true,
                    is_removable: false,
                    card_state: CardState::Present,
                    ports: vec![PortInfo {
                        port_index: 0,
                        active: true,
                    }],
                },
                SlotInfo {
                    physical_slot_index: 1,
                    is_euicc: false,
                    is_removable: true,
                    card_state: CardState::Present,
                    ports: vec![PortInfo {
                        port_index: 0,
                        active: false,
                    }],
                },
            ]),
            active_modem_count: Mutex::new(1),
            bus: Mutex::new(None),
        }
    }

    fn attach(&self, bus: EventBus) {
        *self.bus.lock().unwrap() = Some(bus);
    }

    fn publish(&self, event: SlotEvent) {
        if let Some(bus) = self.bus.lock().unwrap().as_ref() {
            bus.publish(event);
        }
    }
}

impl SlotInfoService for SimulatedModem {
    fn query_slot_infos(&self) -> Result<Vec<SlotInfo>> {
        Ok(self.slots.lock().unwrap().clone())
    }

    fn slot_mappings(&self) -> Result<Vec<SlotMapping>> {
        Ok(vec![SlotMapping {
            physical_slot_index: 0,
            port_index: 0,
            logical_slot_index: 0,
        }])
    }

    fn active_subscriptions(&self) -> Result<Vec<SubscriptionRef>> {
        Ok(vec![SubscriptionRef {
            subscription_id: 10,
            logical_slot_index: 0,
            port_index: 0,
            is_embedded: true,
            is_removable: false,
        }])
    }

    fn set_physical_slot_mapping(&self, _mappings: &[SlotMapping]) -> Result<()> {
        self.publish(SlotEvent::SlotStatusChanged);
        Ok(())
    }

    fn set_active_profile(&self, _subscription_id: i32, _port_index: u32) -> Result<()> {
        self.publish(SlotEvent::ProfileSwitchCompleted { success: true });
        Ok(())
    }

    fn is_multi_sim_enabled(&self) -> bool {
        *self.active_modem_count.lock().unwrap() > 1
    }

    fn supports_multiple_enabled_profiles(&self) -> bool {
        false
    }

    fn supported_modem_count(&self) -> u32 {
        2
    }

    fn active_modem_count(&self) -> u32 {
        *self.active_modem_count.lock().unwrap()
    }

    fn switch_multi_sim_config(&self, active_modem_count: u32) -> Result<()> {
        println!("modem: switching to {active_modem_count} active SIMs");
        *self.active_modem_count.lock().unwrap() = active_modem_count;
        for slot in self.slots.lock().unwrap().iter_mut() {
            for port in slot.ports.iter_mut() {
                port.active = true;
            }
        }
        self.publish(SlotEvent::ModemConfigChanged { active_modem_count });
        self.publish(SlotEvent::SlotStatusChanged);
        Ok(())
    }

    fn reboot_required_for_modem_config(&self) -> bool {
        false
    }
}

fn main() {
    tracing_subscriber::fmt().with_ansi(true).init();

    let modem = Arc::new(SimulatedModem::new());
    let switch = SimSwitch::new(modem.clone());
    modem.attach(switch.events());

    let enabler = switch.multi_sim_enabler();
    let (tx, rx) = mpsc::channel();
    enabler.add_listener(Arc::new(move |state| {
        println!("multi-SIM enable: {state:?}");
        if state.is_terminal() {
            let _ = tx.send(state);
        }
    }));

    if let Err(e) = enabler.run(2) {
        eprintln!("rejected: {e}");
        std::process::exit(1);
    }

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(TaskState::Success) => println!("dual SIM enabled"),
        Ok(other) => {
            eprintln!("failed ({other:?}): {:?}", enabler.last_error());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("no terminal state: {e}");
            std::process::exit(1);
        }
    }
}
