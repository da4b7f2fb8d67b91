#[cfg(not(test))]
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::time::Instant;

use bedjet_common::{config::parse_timezone, LocalTime};

/// Epoch seconds below which the system clock is treated as never synchronized.
const MIN_VALID_EPOCH: i64 = 1_700_000_000;

pub trait WallClock: Send + Sync {
    /// Local time of day, or `None` while the clock is not trustworthy.
    fn now(&self) -> Option<LocalTime>;
}

pub struct ZonedClock {
    timezone: RwLock<Tz>,
}

impl ZonedClock {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone: RwLock::new(timezone),
        }
    }

    pub fn timezone(&self) -> Tz {
        *self.timezone.read()
    }

    pub fn set_timezone(&self, name: &str) -> bool {
        match parse_timezone(name) {
            Some(tz) => {
                *self.timezone.write() = tz;
                true
            }
            None => false,
        }
    }

    pub fn now_local(&self) -> Option<DateTime<Tz>> {
        let now = Utc::now();
        if now.timestamp() <= MIN_VALID_EPOCH {
            return None;
        }
        Some(now.with_timezone(&self.timezone()))
    }
}

impl WallClock for ZonedClock {
    fn now(&self) -> Option<LocalTime> {
        self.now_local().map(|now| LocalTime::from_chrono(&now))
    }
}

/// Milliseconds since first use. Follows tokio's clock, so it pauses with the runtime in tests.
pub fn monotonic_ms() -> u64 {
    origin()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(not(test))]
fn origin() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

// Each test thread owns its paused runtime, so each gets its own origin.
#[cfg(test)]
fn origin() -> Instant {
    thread_local! {
        static START: Instant = Instant::now();
    }
    START.with(|start| *start)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoned_clock_switches_timezone() {
        let clock = ZonedClock::new(chrono_tz::UTC);
        assert!(clock.set_timezone("Asia/Tokyo"));
        assert_eq!(clock.timezone(), chrono_tz::Asia::Tokyo);
        assert!(!clock.set_timezone("Nowhere/Special"));
        assert_eq!(clock.timezone(), chrono_tz::Asia::Tokyo);
    }

    #[test]
    fn monotonic_time_never_goes_backwards() {
        let first = monotonic_ms();
        let second = monotonic_ms();
        assert!(second >= first);
    }
}
