//! Activate an eSIM profile on dual-SIM MEP hardware, including the slot
//! remap that maps the eSIM's second port before the profile can enable.
//!
//! Run with: `cargo run --example activate_profile`

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use simswitch::{
    CardState, EventBus, OrchestratedTask, PortInfo, Result, SimSwitch, SlotEvent, SlotInfo,
    SlotInfoService, SlotMapping, SubscriptionRef, TaskState,
};

/// Dual-SIM MEP modem running a pSIM plus eSIM port 0. Mutating primitives
/// apply their change and report completion through the event bus, the way
/// the real radio stack broadcasts it.
struct SimulatedModem {
    mappings: Mutex<Vec<SlotMapping>>,
    bus: Mutex<Option<EventBus>>,
}

impl SimulatedModem {
    fn new() -> Self {
        Self {
            mappings: Mutex::new(vec![
                SlotMapping {
                    physical_slot_index: 1,
                    port_index: 0,
                    logical_slot_index: 0,
                },
                SlotMapping {
                    physical_slot_index: 0,
                    port_index: 0,
                    logical_slot_index: 1,
                },
            ]),
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
        Ok(vec![
            SlotInfo {
                physical_slot_index: 0,
                is_euicc: true,
                is_removable: false,
                card_state: CardState::Present,
                ports: vec![
                    PortInfo {
                        port_index: 0,
                        active: true,
                    },
                    PortInfo {
                        port_index: 1,
                        active: false,
                    },
                ],
            },
            SlotInfo {
                physical_slot_index: 1,
                is_euicc: false,
                is_removable: true,
                card_state: CardState::Present,
                ports: vec![PortInfo {
                    port_index: 0,
                    active: true,
                }],
            },
        ])
    }

    fn slot_mappings(&self) -> Result<Vec<SlotMapping>> {
        Ok(self.mappings.lock().unwrap().clone())
    }

    fn active_subscriptions(&self) -> Result<Vec<SubscriptionRef>> {
        Ok(vec![SubscriptionRef {
            subscription_id: 1,
            logical_slot_index: 0,
            port_index: 0,
            is_embedded: false,
            is_removable: true,
        }])
    }

    fn set_physical_slot_mapping(&self, mappings: &[SlotMapping]) -> Result<()> {
        println!("modem: applying slot mapping {mappings:?}");
        *self.mappings.lock().unwrap() = mappings.to_vec();
        self.publish(SlotEvent::SlotStatusChanged);
        Ok(())
    }

    fn set_active_profile(&self, subscription_id: i32, port_index: u32) -> Result<()> {
        println!("modem: switching profile {subscription_id} on port {port_index}");
        self.publish(SlotEvent::ProfileSwitchCompleted { success: true });
        Ok(())
    }

    fn is_multi_sim_enabled(&self) -> bool {
        true
    }

    fn supports_multiple_enabled_profiles(&self) -> bool {
        true
    }

    fn supported_modem_count(&self) -> u32 {
        2
    }

    fn active_modem_count(&self) -> u32 {
        2
    }

    fn switch_multi_sim_config(&self, _active_modem_count: u32) -> Result<()> {
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

    let switcher = switch.profile_switcher();
    let (tx, rx) = mpsc::channel();
    switcher.add_listener(Arc::new(move |state| {
        println!("profile switch: {state:?}");
        if state.is_terminal() {
            let _ = tx.send(state);
        }
    }));

    if let Err(e) = switcher.run(7, None, None) {
        eprintln!("rejected: {e}");
        std::process::exit(1);
    }

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(TaskState::Success) => println!("profile 7 enabled"),
        Ok(other) => {
            eprintln!("failed ({other:?}): {:?}", switcher.last_error());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("no terminal state: {e}");
            std::process::exit(1);
        }
    }
}
