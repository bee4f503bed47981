/// Card presence reported for a physical slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CardState {
    /// No card in the slot (an eUICC with no enabled profile also reports
    /// its provisioning state here as `Present`).
    Absent,
    Present,
    /// The card failed to initialize.
    Error,
    /// The card is present but blocked by carrier policy.
    Restricted,
}

/// One hardware-addressable channel within a physical slot.
///
/// Single-profile hardware reports exactly one port per slot; an eUICC with
/// multiple enabled profiles reports one per simultaneously enabled profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub port_index: u32,
    /// Whether this port currently carries an active logical modem stack.
    pub active: bool,
}

/// Snapshot of one physical slot as reported by the slot service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotInfo {
    pub physical_slot_index: u32,
    pub is_euicc: bool,
    /// Whether the slot is a tray that can hold a removable card.
    pub is_removable: bool,
    pub card_state: CardState,
    pub ports: Vec<PortInfo>,
}

/// One entry of the modem's slot mapping: the assignment of a logical modem
/// stack to a physical slot/port pair.
///
/// Obtained by querying the slot service; the orchestrator only constructs
/// values of this type as computed remap targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotMapping {
    pub physical_slot_index: u32,
    pub port_index: u32,
    pub logical_slot_index: u32,
}
