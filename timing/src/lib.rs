//! Virtual time for the emulated machine: a pausable nanosecond clock, a time-ordered queue of
//! callbacks and the rendezvous the execution thread parks on.

mod clock;
mod error;
mod rendezvous;
mod scheduler;
mod time;
mod time_queue;

pub use clock::{Clock, TimeSource, SystemTimeSource, ManualTimeSource, SYSTEM_RESOLUTION_NANOS};
pub use error::TimingError;
pub use rendezvous::{Rendezvous, CpuThread};
pub use scheduler::{Scheduler, ScheduledAction, Action, SchedulerThread};
pub use time::Time;
pub use time_queue::TimeQueue;
