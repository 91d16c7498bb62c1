// Copyright 2022 Oxide Computer Company

use std::time::Instant;

/// Monotonic millisecond time source. The core never sleeps on its own:
/// embedders read [`crate::core::Core::next_deadline`] and call
/// [`crate::core::Core::poll`] once that moment has come. Tests substitute
/// a manually advanced clock.
pub trait Clock {
    fn now(&self) -> u64;
}

/// Wall-runtime clock counting milliseconds since construction.
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
    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
