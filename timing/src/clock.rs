use std::sync::{Arc, Mutex, atomic::{AtomicU64, Ordering}};
use std::time::{Duration, Instant};

use crate::{Time, TimingError};

/// What `Instant` is trusted to resolve on the hosts we run on
pub const SYSTEM_RESOLUTION_NANOS: u64 = 100;

/// A monotonic nanosecond counter the clock reads wall time from
pub trait TimeSource: Send + Sync {
    fn now_nanos(&self) -> u64;

    /// Finest step the source can tell apart
    fn resolution_nanos(&self) -> u64;
}

pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn resolution_nanos(&self) -> u64 {
        SYSTEM_RESOLUTION_NANOS
    }
}

/// Time source that only moves when told to. Used for deterministic runs and tests.
#[derive(Default)]
pub struct ManualTimeSource {
    nanos: AtomicU64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn resolution_nanos(&self) -> u64 {
        1
    }
}

struct ClockState {
    /// Wall time that corresponds to virtual time zero, pushed forward by every pause
    base: u64,
    paused_at: Option<u64>,
}

/// Virtual machine time. Freezes while paused, so elapsed virtual time never includes the
/// wall-clock time spent paused.
pub struct Clock {
    source: Arc<dyn TimeSource>,
    granularity: u64,
    state: Mutex<ClockState>,
}

impl Clock {
    /// Creates a running clock reading `source`, reporting time in multiples of `granularity` ns.
    ///
    /// Asking for a granularity finer than the source can resolve is an error. Coarser
    /// granularities are served by rounding down.
    pub fn new(source: Arc<dyn TimeSource>, granularity: u64) -> Result<Self, TimingError> {
        let available = source.resolution_nanos();
        if granularity < available || granularity == 0 {
            return Err(TimingError::GranularityTooFine { requested: granularity, available });
        }
        let base = source.now_nanos();
        Ok(Self {
            source,
            granularity,
            state: Mutex::new(ClockState { base, paused_at: None }),
        })
    }

    /// A clock on the host's monotonic time with the finest granularity it supports
    pub fn system() -> Self {
        let source = Arc::new(SystemTimeSource::new());
        Self {
            granularity: source.resolution_nanos(),
            state: Mutex::new(ClockState { base: source.now_nanos(), paused_at: None }),
            source,
        }
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn now(&self) -> Time {
        let state = self.lock();
        let wall = state.paused_at.unwrap_or_else(|| self.source.now_nanos());
        let elapsed = wall.saturating_sub(state.base);
        Time::from_nanos(elapsed - elapsed % self.granularity)
    }

    pub fn pause(&self) {
        let mut state = self.lock();
        if state.paused_at.is_none() {
            state.paused_at = Some(self.source.now_nanos());
            tracing::debug!("clock paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        if let Some(paused_at) = state.paused_at.take() {
            let paused_for = self.source.now_nanos().saturating_sub(paused_at);
            state.base = state.base.saturating_add(paused_for);
            tracing::debug!("clock resumed after {}ns", paused_for);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused_at.is_some()
    }

    /// Wall-clock wait until virtual time reaches `time`. None while paused, since virtual time
    /// is not advancing.
    pub fn wall_until(&self, time: Time) -> Option<Duration> {
        let state = self.lock();
        if state.paused_at.is_some() {
            return None;
        }
        let elapsed = self.source.now_nanos().saturating_sub(state.base);
        Some(Duration::from_nanos(time.nanos().saturating_sub(elapsed)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().expect("clock state poisoned")
    }
}
