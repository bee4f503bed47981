use std::time::Duration;

/// Configuration options for `SimSwitch`.
///
/// Each field bounds one class of hardware wait. The defaults mirror the
/// platform settings the orchestrator would otherwise read; deployments with
/// slower modems override them at construction time.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SimSwitchOptions {
    /// How long to wait for the hardware to confirm a slot remap.
    pub slot_remap_timeout: Duration,

    /// How long to wait for a single eSIM profile enable/disable to
    /// complete.
    pub profile_switch_timeout: Duration,

    /// How long to wait for the modem to settle after a multi-SIM mode
    /// change.
    pub multi_sim_enable_timeout: Duration,
}

impl Default for SimSwitchOptions {
    fn default() -> Self {
        Self {
            slot_remap_timeout: Duration::from_secs(25),
            profile_switch_timeout: Duration::from_secs(15),
            multi_sim_enable_timeout: Duration::from_secs(40),
        }
    }
}
