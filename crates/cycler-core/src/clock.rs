use chrono::{DateTime, Local};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Source of time for the sampler and the cycle controllers.
///
/// `elapsed` is monotonic and drives every timeout; `now` is wall-clock and only
/// stamps measurements and log rows.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;

    /// Wall-clock time for timestamps.
    fn now(&self) -> DateTime<Local>;

    fn sleep(&self, duration: Duration);

    /// Real time that passes while this clock advances by `duration`.
    fn real_duration(&self, duration: Duration) -> Duration {
        duration
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Runs `scale` times faster than real time. Used with the simulated cell so a
/// multi-hour charge finishes in seconds.
#[derive(Debug, Clone, Copy)]
pub struct ScaledClock {
    start: Instant,
    origin: DateTime<Local>,
    scale: f64,
}

impl ScaledClock {
    pub fn new(scale: f64) -> Self {
        Self {
            start: Instant::now(),
            origin: Local::now(),
            scale: if scale.is_finite() && scale > 0.0 {
                scale
            } else {
                1.0
            },
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Clock for ScaledClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed().mul_f64(self.scale)
    }

    fn now(&self) -> DateTime<Local> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or_default();
        self.origin + offset
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(self.real_duration(duration));
    }

    fn real_duration(&self, duration: Duration) -> Duration {
        duration.div_f64(self.scale)
    }
}

/// Virtual time that only moves when someone sleeps or calls `advance`.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Local>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Local::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Local> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or_default();
        self.origin + offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn real_duration(&self, _duration: Duration) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_sleep() {
        let clock = ManualClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        clock.sleep(Duration::from_secs(10));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.elapsed(), Duration::from_millis(10_500));
        let stamped = clock.now() - clock.origin;
        assert_eq!(stamped.num_milliseconds(), 10_500);
    }

    #[test]
    fn scaled_clock_shrinks_real_sleeps() {
        let clock = ScaledClock::new(1000.0);
        assert_eq!(
            clock.real_duration(Duration::from_secs(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn scaled_clock_rejects_nonsense_scale() {
        assert_eq!(ScaledClock::new(0.0).scale(), 1.0);
        assert_eq!(ScaledClock::new(f64::NAN).scale(), 1.0);
    }
}
