use crate::Result;
use crate::types::slot::{SlotInfo, SlotMapping};
use crate::types::subscription::SubscriptionRef;

/// The opaque radio/eSIM capability the orchestrator drives.
///
/// Implementations wrap whatever platform surface actually talks to the
/// modem. The two mutating primitives (`set_physical_slot_mapping`,
/// `set_active_profile`) return as soon as the command is accepted; the
/// hardware reports completion later through the
/// [`EventBus`](crate::EventBus), which the implementation is responsible
/// for feeding. `switch_multi_sim_config` behaves the same way.
///
/// Query methods return snapshots; the orchestrator re-queries rather than
/// caching across waits.
pub trait SlotInfoService: Send + Sync {
    /// All physical slots with their card and port status.
    fn query_slot_infos(&self) -> Result<Vec<SlotInfo>>;

    /// The modem's current logical-to-physical slot mapping.
    fn slot_mappings(&self) -> Result<Vec<SlotMapping>>;

    /// Subscriptions currently in active service.
    fn active_subscriptions(&self) -> Result<Vec<SubscriptionRef>>;

    /// Apply a new slot mapping. Completion is reported via a
    /// [`SlotStatusChanged`](crate::SlotEvent::SlotStatusChanged) or
    /// [`CarrierConfigChanged`](crate::SlotEvent::CarrierConfigChanged)
    /// event depending on hardware capability.
    fn set_physical_slot_mapping(&self, mappings: &[SlotMapping]) -> Result<()>;

    /// Enable the given subscription's profile on `port_index`, or
    /// deactivate whatever is enabled there when `subscription_id` is
    /// [`INVALID_SUBSCRIPTION_ID`](crate::INVALID_SUBSCRIPTION_ID).
    /// Completion is reported via
    /// [`ProfileSwitchCompleted`](crate::SlotEvent::ProfileSwitchCompleted).
    fn set_active_profile(&self, subscription_id: i32, port_index: u32) -> Result<()>;

    /// Whether the modem currently runs more than one active logical slot.
    fn is_multi_sim_enabled(&self) -> bool;

    /// Whether any eUICC on the device can keep several profiles enabled
    /// simultaneously (one per port).
    fn supports_multiple_enabled_profiles(&self) -> bool;

    /// Maximum number of simultaneously active SIMs the modem supports.
    fn supported_modem_count(&self) -> u32;

    /// Number of logical modem stacks currently active.
    fn active_modem_count(&self) -> u32;

    /// Reconfigure the modem for `active_modem_count` simultaneously
    /// active SIMs. Completion is reported via
    /// [`ModemConfigChanged`](crate::SlotEvent::ModemConfigChanged) and the
    /// subsequent slot status churn.
    fn switch_multi_sim_config(&self, active_modem_count: u32) -> Result<()>;

    /// Whether changing the multi-SIM configuration requires a reboot on
    /// this hardware (in which case the orchestrator refuses to do it).
    fn reboot_required_for_modem_config(&self) -> bool;
}
