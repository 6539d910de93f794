//! Real-time pacing of simulation ticks.

/// Falling further behind than this skips ahead instead of catching up
/// one tick at a time.
pub const JANK_THRESHOLD_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct TickTime {
    timestep_ms: u64,
    last_tick_ms: u64,
}

impl TickTime {
    pub fn new(timestep_ms: u64, now_ms: u64) -> Self {
        Self {
            timestep_ms,
            last_tick_ms: now_ms,
        }
    }

    pub fn timestep(&self) -> u64 {
        self.timestep_ms
    }

    /// A zero timestep pauses the simulation.
    pub fn set_timestep(&mut self, timestep_ms: u64) {
        self.timestep_ms = timestep_ms;
    }

    pub fn should_advance(&self, now_ms: u64) -> bool {
        self.timestep_ms != 0 && now_ms.saturating_sub(self.last_tick_ms) >= self.timestep_ms
    }

    pub fn advance(&mut self, now_ms: u64) {
        if self.timestep_ms == 0 {
            self.last_tick_ms = now_ms;
            return;
        }

        let behind = now_ms.saturating_sub(self.last_tick_ms);
        let whole_steps = behind / self.timestep_ms * self.timestep_ms;
        self.last_tick_ms += if whole_steps >= JANK_THRESHOLD_MS {
            whole_steps
        } else {
            self.timestep_ms
        };
    }
}
