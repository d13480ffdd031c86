//! Fixed-timestep drivers for the physics and network loops.

/// Nanoseconds per second.
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// One fixed-rate tick loop.
///
/// Wall-clock deltas are banked in whole nanoseconds, so repeated fractional
/// frame times cannot compound float error into the tick period; every tick
/// released represents exactly `dt` of simulation time, which fixed-dt
/// stepping depends on for reproducibility. A stalled frame releases at most
/// `max_catch_up_ticks` and the rest of the backlog is discarded instead of
/// spiraling.
#[derive(Debug, Clone)]
pub struct TickLoop {
    period_nanos: u64,
    banked_nanos: u64,
    max_catch_up_ticks: u32,
    tick_rate: u32,
    dt: f32,
}

impl TickLoop {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        let period_nanos = NANOS_PER_SECOND / u64::from(tick_rate);
        Self {
            period_nanos,
            banked_nanos: 0,
            max_catch_up_ticks: 8,
            tick_rate,
            dt: period_nanos as f32 / NANOS_PER_SECOND as f32,
        }
    }

    pub fn with_max_catch_up(tick_rate: u32, max_catch_up_ticks: u32) -> Self {
        Self {
            max_catch_up_ticks: max_catch_up_ticks.max(1),
            ..Self::new(tick_rate)
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// The fixed step each released tick advances by.
    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Banks a frame delta and returns how many fixed ticks are now due.
    pub fn advance(&mut self, delta_seconds: f32) -> u32 {
        if delta_seconds > 0.0 {
            self.banked_nanos += (f64::from(delta_seconds) * NANOS_PER_SECOND as f64) as u64;
        }
        let due = self.banked_nanos / self.period_nanos;
        if due > u64::from(self.max_catch_up_ticks) {
            // A long stall: run the cap and forgive the remainder.
            self.banked_nanos = 0;
            return self.max_catch_up_ticks;
        }
        self.banked_nanos -= due * self.period_nanos;
        due as u32
    }

    /// Fraction of the way into the next tick, for render interpolation.
    pub fn alpha(&self) -> f32 {
        self.banked_nanos as f32 / self.period_nanos as f32
    }

    pub fn reset(&mut self) {
        self.banked_nanos = 0;
    }
}

/// Drives the physics space and the net peer at independent fixed rates
/// from one wall-clock update.
pub struct SimulationClock {
    pub physics: TickLoop,
    pub net: TickLoop,
}

impl SimulationClock {
    pub fn new(physics_rate: u32, net_rate: u32) -> Self {
        Self {
            physics: TickLoop::new(physics_rate),
            net: TickLoop::new(net_rate),
        }
    }

    /// Banks a frame delta and invokes the tick closures for every elapsed
    /// fixed step of each loop.
    pub fn update(
        &mut self,
        delta: f32,
        mut physics_tick: impl FnMut(f32),
        mut net_tick: impl FnMut(f32),
    ) -> (u32, u32) {
        let physics_ticks = self.physics.advance(delta);
        for _ in 0..physics_ticks {
            physics_tick(self.physics.dt());
        }
        let net_ticks = self.net.advance(delta);
        for _ in 0..net_ticks {
            net_tick(self.net.dt());
        }
        (physics_ticks, net_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banks_deltas_into_whole_ticks() {
        let mut ticks = TickLoop::new(60);
        assert_eq!(ticks.advance(1.0 / 30.0), 2);
        // The remainder carries over instead of being lost.
        assert_eq!(ticks.advance(0.0), 0);
        assert_eq!(ticks.advance(1.0 / 120.0), 0);
        assert_eq!(ticks.advance(1.0 / 120.0), 1);
    }

    #[test]
    fn stall_releases_the_cap_and_forgives_the_backlog() {
        let mut ticks = TickLoop::with_max_catch_up(60, 5);
        assert_eq!(ticks.advance(100.0), 5);
        // The backlog was dropped, not deferred.
        assert_eq!(ticks.advance(0.0), 0);
        assert_eq!(ticks.alpha(), 0.0);
    }

    #[test]
    fn alpha_tracks_the_partial_tick() {
        let mut ticks = TickLoop::new(50);
        ticks.advance(0.01);
        assert!((ticks.alpha() - 0.5).abs() < 1e-3);
        ticks.reset();
        assert_eq!(ticks.alpha(), 0.0);
    }

    #[test]
    fn clock_runs_loops_at_their_own_rates() {
        let mut clock = SimulationClock::new(60, 20);
        let mut physics = 0;
        let mut net = 0;
        clock.update(0.1, |_| physics += 1, |_| net += 1);
        assert_eq!(physics, 6);
        assert_eq!(net, 2);
    }
}
