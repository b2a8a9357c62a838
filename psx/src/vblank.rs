use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use timing::{Action, ScheduledAction, Time};

use crate::interrupts::{Interrupt, InterruptController};
use crate::registry::{Device, Wiring};
use crate::ConfigError;

/// NTSC field rate
pub const NTSC_HZ: f64 = 59.94;

/// Raises the vblank interrupt once per field. Stands in for the GPU's timing until a GPU is
/// plugged in.
pub struct VBlank {
    period: u64,
    interrupts: Arc<InterruptController>,
    count: AtomicU64,
}

impl VBlank {
    pub fn new(hz: f64, interrupts: Arc<InterruptController>) -> Arc<Self> {
        let period = (1e9 / hz.max(1.0)) as u64;
        Arc::new(VBlank {
            period,
            interrupts,
            count: AtomicU64::new(0),
        })
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Fields so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl ScheduledAction for VBlank {
    fn run(&self, current_time: Time) -> Time {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.interrupts.raise_interrupt(Interrupt::VBlank);
        // Next field boundary after now, however late this one ran
        let next = (current_time.nanos() / self.period + 1) * self.period;
        Time::from_nanos(next)
    }
}

impl Device for VBlank {
    fn attach(self: Arc<Self>, wiring: &mut Wiring<'_>) -> Result<(), ConfigError> {
        wiring.interrupts.register_owner(Interrupt::VBlank, "vblank")?;
        let first = Time::from_nanos(wiring.scheduler.clock().now().nanos() + self.period);
        let action: Action = self;
        wiring.scheduler.schedule(first, action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use r3000::InterruptHandle;
    use timing::{Clock, ManualTimeSource, Rendezvous, Scheduler};

    use super::*;

    #[test]
    fn fires_on_field_boundaries_even_when_late() {
        let ic = InterruptController::new(Arc::new(Rendezvous::new()), InterruptHandle::new());
        let vblank = VBlank::new(50.0, ic.clone());
        assert_eq!(vblank.period(), 20_000_000);

        assert_eq!(vblank.run(Time::from_millis(20)), Time::from_millis(40));
        // Ran 7ms late, the next one still lands on the 20ms grid
        assert_eq!(vblank.run(Time::from_millis(47)), Time::from_millis(60));
        assert_eq!(vblank.count(), 2);
        assert_eq!(ic.stat(), Interrupt::VBlank.bit());
    }

    #[test]
    fn driven_by_the_scheduler() {
        let source = Arc::new(ManualTimeSource::new());
        let clock = Arc::new(Clock::new(source, 1).unwrap());
        let scheduler = Scheduler::new(clock);
        let ic = InterruptController::new(Arc::new(Rendezvous::new()), InterruptHandle::new());
        let vblank = VBlank::new(50.0, ic);
        scheduler.schedule(Time::from_millis(20), vblank.clone());

        assert_eq!(scheduler.run_until(Time::from_millis(100)), 5);
        assert_eq!(vblank.count(), 5);
        assert_eq!(scheduler.next_due(), Some(Time::from_millis(120)));
    }
}
