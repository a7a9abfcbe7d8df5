use crate::sync::Mutex;

/// Monotonic kernel time, in timer-interrupt ticks.
pub type Timestamp = u64;

/// The system clock, advanced by the periodic timer interrupt.
///
/// The fault path only ever reads it; eviction ordering depends on the
/// value observed when a page is faulted in.
pub struct Clock {
    ticks: Mutex<Timestamp>,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            ticks: Mutex::new(0),
        }
    }

    /// Called from the timer interrupt.
    pub fn tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks = ticks.checked_add(1).expect("system clock overflowed");
    }

    pub fn now(&self) -> Timestamp {
        *self.ticks.lock()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_advance_monotonically() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        clock.tick();
        clock.tick();
        assert_eq!(clock.now(), 2);
    }
}
