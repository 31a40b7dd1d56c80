use std::time::Duration;

use enum_map::{Enum, EnumMap};

pub mod backtrace;
pub mod history;
pub mod sample;
pub mod sampler;

/// A power measurement, always in watts.
pub type Power = f64;
/// An energy measurement. Raw thread counters are in joules; the cumulative
/// per-process total reported by the sampler is in watt-hours.
pub type Energy = f64;

/// CPU core grouping on heterogeneous multi-core parts.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoreClass {
    /// Performance ("big") cores.
    Performance,
    /// Efficiency ("little") cores.
    Efficiency,
}

impl CoreClass {
    pub const ALL: [CoreClass; 2] = [CoreClass::Performance, CoreClass::Efficiency];
}

/// One point-in-time reading of a thread's cumulative energy counters.
///
/// The energy values are monotonically non-decreasing accumulators since
/// thread creation, one per core class. A decrease between two readings for
/// the same thread id means the counter was reset (thread id reuse), not a
/// negative consumption.
#[derive(Debug, Clone)]
pub struct ThreadCounters {
    /// OS identifier of the thread.
    pub thread_id: u64,
    /// The pthread name, if the thread has a non-empty one.
    pub pthread_name: Option<String>,
    /// Cumulative energy in joules, per core class.
    pub energy: EnumMap<CoreClass, Energy>,
    /// Captured call stack, outermost frame first. Only present when the
    /// probe was asked to collect backtraces.
    pub call_stack: Option<Vec<u64>>,
}

/// Source of raw per-thread counter readings for a process.
///
/// One call returns one [`ThreadCounters`] per live thread of the process.
/// An empty vec is a valid result (process exited, or no readable threads);
/// the sampler turns it into a zero-power sample.
pub trait ThreadCounterProbe: Send {
    fn sample(&mut self, pid: i32) -> anyhow::Result<Vec<ThreadCounters>>;
}

/// Power used in an interval, split by core class.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CombinedPower {
    pub per_class: EnumMap<CoreClass, Power>,
}

impl CombinedPower {
    pub fn zero() -> CombinedPower {
        CombinedPower::default()
    }

    pub fn performance(&self) -> Power {
        self.per_class[CoreClass::Performance]
    }

    pub fn efficiency(&self) -> Power {
        self.per_class[CoreClass::Efficiency]
    }

    /// Power used by all cores.
    pub fn total(&self) -> Power {
        self.per_class.values().sum()
    }

    pub fn add(&mut self, class: CoreClass, power: Power) {
        self.per_class[class] += power;
    }
}

/// Computes the power used by a thread between two counter readings,
/// for one core class.
///
/// The power over the interval is the consumed energy divided by the time
/// between the two readings. The *measured* elapsed time must be used, not
/// the nominal sampling period: anything that delays a tick (system load,
/// a debugger pause, app suspension) would otherwise inflate the result.
///
/// Edge cases, all returning zero rather than failing:
/// - an exactly-zero energy delta (idle thread);
/// - a zero elapsed time (two readings at the same instant);
/// - a negative delta, which means the counter was reset for this thread id
///   and there is no valid diff basis.
pub fn compute_power(
    previous: &ThreadCounters,
    current: &ThreadCounters,
    class: CoreClass,
    elapsed: Duration,
) -> Power {
    debug_assert_eq!(previous.thread_id, current.thread_id);

    let energy_delta = current.energy[class] - previous.energy[class];
    if energy_delta == 0.0 {
        return 0.0;
    }
    let elapsed_seconds = elapsed.as_secs_f64();
    if energy_delta < 0.0 || elapsed_seconds == 0.0 {
        return 0.0;
    }
    energy_delta / elapsed_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::enum_map;

    fn counters(thread_id: u64, perf_j: f64, eff_j: f64) -> ThreadCounters {
        ThreadCounters {
            thread_id,
            pthread_name: None,
            energy: enum_map! {
                CoreClass::Performance => perf_j,
                CoreClass::Efficiency => eff_j,
            },
            call_stack: None,
        }
    }

    #[test]
    fn unchanged_energy_is_exactly_zero_power() {
        let a = counters(1, 10.0, 4.0);
        let b = counters(1, 10.0, 4.0);
        let elapsed = Duration::from_millis(500);
        assert_eq!(compute_power(&a, &b, CoreClass::Performance, elapsed), 0.0);
        assert_eq!(compute_power(&a, &b, CoreClass::Efficiency, elapsed), 0.0);
    }

    #[test]
    fn power_is_delta_over_measured_elapsed_time() {
        let a = counters(1, 10.0, 2.0);
        let b = counters(1, 16.0, 3.0);
        // 6 J over 2 s = 3 W, regardless of any nominal period
        let elapsed = Duration::from_secs(2);
        assert_eq!(compute_power(&a, &b, CoreClass::Performance, elapsed), 3.0);
        assert_eq!(compute_power(&a, &b, CoreClass::Efficiency, elapsed), 0.5);
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let a = counters(1, 50.0, 50.0);
        let b = counters(1, 1.0, 50.0);
        let elapsed = Duration::from_secs(1);
        assert_eq!(compute_power(&a, &b, CoreClass::Performance, elapsed), 0.0);
    }

    #[test]
    fn zero_elapsed_time_is_zero_power_not_a_division() {
        let a = counters(1, 1.0, 0.0);
        let b = counters(1, 2.0, 0.0);
        assert_eq!(compute_power(&a, &b, CoreClass::Performance, Duration::ZERO), 0.0);
    }

    #[test]
    fn combined_power_totals_both_classes() {
        let mut p = CombinedPower::zero();
        p.add(CoreClass::Performance, 1.5);
        p.add(CoreClass::Efficiency, 0.25);
        p.add(CoreClass::Performance, 0.5);
        assert_eq!(p.performance(), 2.0);
        assert_eq!(p.efficiency(), 0.25);
        assert_eq!(p.total(), 2.25);
    }
}
