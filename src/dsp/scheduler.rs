use std::time::Duration;

/// Adaptive tick cadence. Slows down when a tick is expensive; never drops
/// data, the source simply accumulates more between pulls.
#[derive(Clone, Debug)]
pub struct UpdateScheduler {
    base_ms: u64,
    current_ms: u64,
}

impl UpdateScheduler {
    pub fn new(fps: u32) -> Self {
        let base_ms = Self::base_interval_ms(fps);
        Self {
            base_ms,
            current_ms: base_ms,
        }
    }

    /// `1000 / fps` in whole milliseconds; fps below 1 counts as 1. Never
    /// below 1 ms, so the tick loop always sleeps.
    pub fn base_interval_ms(fps: u32) -> u64 {
        (1000 / u64::from(fps.max(1))).max(1)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Interval the load signals call for, without applying it.
    pub fn interval_for(&self, heavy: bool, many_channels: bool) -> Duration {
        let factor = match (heavy, many_channels) {
            (true, true) => 1.5,
            (true, false) | (false, true) => 1.2,
            (false, false) => 1.0,
        };
        Duration::from_millis((self.base_ms as f64 * factor) as u64)
    }

    /// Recomputes the next interval after a tick. Returns the new interval
    /// only when the timer actually needs reprogramming.
    pub fn update(&mut self, heavy: bool, many_channels: bool) -> Option<Duration> {
        let next = self.interval_for(heavy, many_channels);
        let next_ms = next.as_millis() as u64;
        if next_ms == self.current_ms {
            return None;
        }
        log::debug!("tick interval {} ms -> {} ms", self.current_ms, next_ms);
        self.current_ms = next_ms;
        Some(next)
    }

    /// Back to the base cadence, e.g. after an fps change or a reset.
    pub fn reset(&mut self, fps: u32) {
        self.base_ms = Self::base_interval_ms(fps);
        self.current_ms = self.base_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_policy_at_ten_fps() {
        let scheduler = UpdateScheduler::new(10);
        assert_eq!(scheduler.base_interval(), Duration::from_millis(100));
        assert_eq!(scheduler.interval_for(true, true), Duration::from_millis(150));
        assert_eq!(scheduler.interval_for(true, false), Duration::from_millis(120));
        assert_eq!(scheduler.interval_for(false, true), Duration::from_millis(120));
        assert_eq!(scheduler.interval_for(false, false), Duration::from_millis(100));
    }

    #[test]
    fn only_reprograms_on_change() {
        let mut scheduler = UpdateScheduler::new(10);
        assert_eq!(scheduler.update(false, false), None);
        assert_eq!(scheduler.update(true, true), Some(Duration::from_millis(150)));
        assert_eq!(scheduler.update(true, true), None);
        assert_eq!(scheduler.interval(), Duration::from_millis(150));
        assert_eq!(scheduler.update(false, true), Some(Duration::from_millis(120)));
    }

    #[test]
    fn integer_millisecond_base() {
        assert_eq!(UpdateScheduler::base_interval_ms(30), 33);
        assert_eq!(UpdateScheduler::base_interval_ms(0), 1000);
        assert_eq!(UpdateScheduler::base_interval_ms(5000), 1);
        assert!(UpdateScheduler::new(u32::MAX).interval() >= Duration::from_millis(1));
        let mut scheduler = UpdateScheduler::new(30);
        assert_eq!(scheduler.update(true, true), Some(Duration::from_millis(49)));
        scheduler.reset(5);
        assert_eq!(scheduler.interval(), Duration::from_millis(200));
    }
}
