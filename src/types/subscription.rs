/// Sentinel accepted by the raw profile-switch primitive: deactivate
/// whatever profile is enabled on the addressed port.
pub const INVALID_SUBSCRIPTION_ID: i32 = -1;

/// The operable unit a switch command targets: one provisioned SIM
/// identity, physical or embedded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionRef {
    pub subscription_id: i32,
    /// Logical modem stack the subscription currently occupies, or `-1`
    /// when it is not mapped.
    pub logical_slot_index: i32,
    /// Port the subscription is enabled on. Meaningful for embedded
    /// profiles; removable cards always report their slot's first port.
    pub port_index: u32,
    pub is_embedded: bool,
    pub is_removable: bool,
}
