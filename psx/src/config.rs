use r3000::CompilerConfig;

use crate::address_space::PollConfig;
use crate::vblank::NTSC_HZ;

/// How virtual time moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    /// Virtual time follows the host's clock and scheduled actions run on their own thread
    Realtime,
    /// Virtual time advances by a fixed amount per instruction and scheduled actions run on the
    /// execution thread between slices. Runs are repeatable.
    Deterministic { nanos_per_instruction: u64 },
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Offer calls to the threaded-code compiler
    pub compiler_enabled: bool,
    pub compiler: CompilerConfig,
    pub poll: PollConfig,
    /// Instructions between looks at the scheduler and control messages
    pub slice: u64,
    pub time: TimeMode,
    /// Granularity asked of the clock, in nanoseconds
    pub clock_granularity: u64,
    /// Field rate of the built-in vblank source, None to leave vblank to a GPU component
    pub vblank_hz: Option<f64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            compiler_enabled: true,
            compiler: CompilerConfig::default(),
            poll: PollConfig::default(),
            slice: 4096,
            time: TimeMode::Realtime,
            clock_granularity: timing::SYSTEM_RESOLUTION_NANOS,
            vblank_hz: Some(NTSC_HZ),
        }
    }
}

impl MachineConfig {
    /// Repeatable configuration: manual time at roughly two cycles of a 33.87MHz R3000 per
    /// instruction
    pub fn deterministic() -> Self {
        MachineConfig {
            time: TimeMode::Deterministic { nanos_per_instruction: 59 },
            clock_granularity: 1,
            ..Self::default()
        }
    }
}
