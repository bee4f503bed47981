use crate::types::subscription::SubscriptionRef;

/// Parameter object for one raw slot-mapping change.
///
/// `removed` is an optional hint naming the active subscription that must be
/// vacated when every logical slot is already occupied. Without the hint the
/// executor picks the first logical slot that carries no active
/// subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchCommand {
    /// Map a removable slot as active. `slot: None` selects the first
    /// detected inactive removable slot.
    ToRemovable {
        slot: Option<u32>,
        removed: Option<SubscriptionRef>,
    },
    /// Map the given eSIM slot/port pair as active.
    ToEuicc {
        slot: u32,
        port: u32,
        removed: Option<SubscriptionRef>,
    },
}
