//! simswitch orchestrates which SIM (physical card or embedded profile) is
//! electrically active on which modem slot/port, and which eSIM profile is
//! enabled, on hardware where every reconfiguration step completes
//! asynchronously via a system broadcast.
//!
//! The hardware itself is an injected [`SlotInfoService`]; the orchestrator
//! sequences the multi-step reconfigurations on dedicated background
//! workers, bounds every hardware wait with a timeout, and reports progress
//! through a small task state machine (`Idle → Running → Success/Error`)
//! with synchronous listeners. Task instances live in a keyed registry so
//! an operation in flight survives the teardown of whatever caller context
//! started it.
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//! use simswitch::{SimSwitch, SlotInfoService, TaskState, OrchestratedTask};
//!
//! fn enable_dual_sim(service: Arc<dyn SlotInfoService>) -> Result<(), simswitch::Error> {
//!     let switch = SimSwitch::new(service);
//!     let enabler = switch.multi_sim_enabler();
//!     enabler.add_listener(Arc::new(|state| {
//!         if state == TaskState::Success {
//!             println!("dual SIM enabled");
//!         }
//!     }));
//!     enabler.run(2)
//! }
//! ```
//!
//! ## Concurrency model
//! - `run()` never blocks: the work is handed to the task's own worker.
//! - Listeners fire synchronously with each `Running`/`Success`/`Error`
//!   transition, in registration order, and must not block.
//! - A task that is already running rejects a second `run()` as a logged
//!   no-op; nothing is cancelled mid-flight. The only escape from a stuck
//!   hardware operation is the per-operation timeout.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::dbg_macro)]

mod error;
mod events;
mod euicc_switch;
mod multi_sim;
mod options;
mod registry;
mod removable_switch;
mod service;
mod slot_switch;
mod task;
mod types;
mod util;
mod waiter;

pub use crate::error::{Error, Result};
pub use crate::events::{EventBus, EventSubscription, SlotEvent};
pub use crate::euicc_switch::EuiccProfileSwitcher;
pub use crate::multi_sim::MultiSimEnabler;
pub use crate::options::SimSwitchOptions;
pub use crate::registry::TaskRegistry;
pub use crate::removable_switch::RemovableSlotSwitcher;
pub use crate::service::SlotInfoService;
pub use crate::slot_switch::{DEFAULT_PORT_INDEX, SlotSwitcher};
pub use crate::task::{ListenerId, OrchestratedTask, StateListener, TaskState};
pub use crate::types::command::SwitchCommand;
pub use crate::types::slot::{CardState, PortInfo, SlotInfo, SlotMapping};
pub use crate::types::subscription::{INVALID_SUBSCRIPTION_ID, SubscriptionRef};
pub use crate::waiter::{CompletionWaiter, WaitError};

use std::sync::Arc;

/// Primary entrypoint: owns the event bus, the task registry and the
/// handle to the slot service, and hands out the switching tasks.
#[derive(Clone, Debug)]
pub struct SimSwitch {
    ctx: Arc<TaskContext>,
    registry: TaskRegistry,
}

/// Shared state injected into every task.
pub(crate) struct TaskContext {
    pub(crate) opts: SimSwitchOptions,
    pub(crate) slots: Arc<dyn SlotInfoService>,
    pub(crate) events: EventBus,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("opts", &self.opts)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl SimSwitch {
    /// Build an orchestrator over the given slot service with default
    /// timeouts.
    pub fn new(slots: Arc<dyn SlotInfoService>) -> Self {
        Self::with_options(slots, SimSwitchOptions::default())
    }

    /// Build an orchestrator with custom timeouts.
    pub fn with_options(slots: Arc<dyn SlotInfoService>, opts: SimSwitchOptions) -> Self {
        Self {
            ctx: Arc::new(TaskContext {
                opts,
                slots,
                events: EventBus::new(),
            }),
            registry: TaskRegistry::new(),
        }
    }

    /// The event bus hardware completions are published into. The platform
    /// integration feeds real broadcasts here; tests publish directly.
    pub fn events(&self) -> EventBus {
        self.ctx.events.clone()
    }

    /// The keyed task registry. Exposed so callers embedding their own
    /// task types can share the single-instance-per-tag guarantee.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The raw slot remap task.
    pub fn slot_switcher(&self) -> Arc<SlotSwitcher> {
        let ctx = Arc::clone(&self.ctx);
        self.registry
            .obtain(SlotSwitcher::TAG, || SlotSwitcher::new(ctx))
    }

    /// The eSIM profile enable/disable task.
    pub fn profile_switcher(&self) -> Arc<EuiccProfileSwitcher> {
        let ctx = Arc::clone(&self.ctx);
        let slot_switcher = self.slot_switcher();
        self.registry.obtain(EuiccProfileSwitcher::TAG, || {
            EuiccProfileSwitcher::new(ctx, slot_switcher)
        })
    }

    /// The switch-back-to-removable-SIM task.
    pub fn removable_switcher(&self) -> Arc<RemovableSlotSwitcher> {
        let ctx = Arc::clone(&self.ctx);
        let profile_switcher = self.profile_switcher();
        let slot_switcher = self.slot_switcher();
        self.registry.obtain(RemovableSlotSwitcher::TAG, || {
            RemovableSlotSwitcher::new(ctx, profile_switcher, slot_switcher)
        })
    }

    /// The multi-SIM mode change task.
    pub fn multi_sim_enabler(&self) -> Arc<MultiSimEnabler> {
        let ctx = Arc::clone(&self.ctx);
        self.registry
            .obtain(MultiSimEnabler::TAG, || MultiSimEnabler::new(ctx))
    }
}

