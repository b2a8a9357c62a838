use std::time::Duration;

/// A point in virtual time, in nanoseconds since the machine's clock was created.
///
/// `Time::ZERO` doubles as "never" when returned from a scheduled action.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Time {
    pub(crate) nanos: u64
}

impl Time {
    pub const ZERO: Self = Time {
        nanos: 0
    };

    pub const MAX: Self = Time {
        nanos: u64::MAX
    };

    pub const fn from_nanos(nanos: u64) -> Self {
        Time { nanos }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Time { nanos: micros.saturating_mul(1_000) }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Time { nanos: millis.saturating_mul(1_000_000) }
    }

    pub const fn nanos(self) -> u64 {
        self.nanos
    }

    pub fn is_zero(self) -> bool {
        self.nanos == 0
    }

    pub fn add(self, nanos: u64) -> Self {
        Time {
            nanos: self.nanos.saturating_add(nanos)
        }
    }

    /// Nanoseconds from `earlier` to `self`, zero if `earlier` is later
    pub fn since(self, earlier: Time) -> u64 {
        self.nanos.saturating_sub(earlier.nanos)
    }

    pub fn take(&mut self) -> Self {
        let time = *self;
        *self = Time::default();
        time
    }
}

impl From<Time> for u64 {
    fn from(value: Time) -> Self {
        value.nanos
    }
}

impl From<u64> for Time {
    fn from(nanos: u64) -> Self {
        Time {
            nanos
        }
    }
}

impl From<Duration> for Time {
    fn from(duration: Duration) -> Self {
        Time {
            nanos: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
        }
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}s", self.nanos / 1_000_000_000, self.nanos % 1_000_000_000)
    }
}
