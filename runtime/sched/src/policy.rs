//! Time-slice policies

use alloc::vec::Vec;

use keel_drivers::sync::IrqSpinlock;
use keel_drivers::DriverType;

use crate::scheduler::SCHEDULER;

pub static WEIGHTED_SCHEDULER: DriverType =
    DriverType::new("cpuScheduler", "Weighted Round Robin Scheduler", Some(&SCHEDULER));
pub static FIXED_SCHEDULER: DriverType =
    DriverType::new("simpleScheduler", "Fixed Interval Scheduler", Some(&SCHEDULER));

/// Decides how long a thread may run before the next preemption
pub trait SchedulingPolicy: Send + Sync + 'static {
    /// Driver tag of a scheduler running this policy
    const TYPE: &'static DriverType;

    /// Slice in microseconds for a thread of `weight`, given `active`
    /// runnable threads whose weights sum to `total_weight`
    fn slice(&self, weight: u64, active: usize, total_weight: u64) -> u64;

    /// Timer period while there is nothing else to switch to
    fn backoff(&self) -> u64;
}

/// Interval bounds for [`WeightedRoundRobin`], in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedConfig {
    pub min_interval: u64,
    pub average_interval: u64,
    pub max_interval: u64,
}

impl Default for WeightedConfig {
    fn default() -> Self {
        Self {
            min_interval: 1_000,
            average_interval: 30_000,
            max_interval: 100_000,
        }
    }
}

/// Round robin where each slice is proportional to the thread's share of
/// the total active weight
#[derive(Debug, Clone, Default)]
pub struct WeightedRoundRobin {
    config: WeightedConfig,
}

impl WeightedRoundRobin {
    pub fn new(config: WeightedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WeightedConfig {
        &self.config
    }
}

impl SchedulingPolicy for WeightedRoundRobin {
    const TYPE: &'static DriverType = &WEIGHTED_SCHEDULER;

    fn slice(&self, weight: u64, active: usize, total_weight: u64) -> u64 {
        let WeightedConfig {
            min_interval,
            average_interval,
            max_interval,
        } = self.config;
        if total_weight == 0 {
            return max_interval;
        }
        let scaled = u128::from(average_interval)
            .saturating_mul(active as u128)
            .saturating_mul(u128::from(weight))
            / u128::from(total_weight);
        let scaled = u64::try_from(scaled).unwrap_or(u64::MAX);
        scaled.clamp(min_interval, max_interval)
    }

    fn backoff(&self) -> u64 {
        self.config.max_interval
    }
}

/// Constant slice for every thread, regardless of weight
///
/// Drivers that need a finer tick (for example a polled device) can push a
/// resolution requirement; the interval is the tightest requirement in force.
pub struct FixedInterval {
    interval: u64,
    requirements: IrqSpinlock<Vec<u64>>,
}

impl FixedInterval {
    pub const DEFAULT_INTERVAL: u64 = 15_000;
    const BACKOFF_FACTOR: u64 = 4;

    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            requirements: IrqSpinlock::new(Vec::new()),
        }
    }

    /// Current tick in microseconds
    pub fn interval(&self) -> u64 {
        self.requirements
            .lock()
            .iter()
            .copied()
            .fold(self.interval, u64::min)
    }

    pub fn push_resolution_requirement(&self, usecs: u64) {
        self.requirements.lock().push(usecs);
    }

    /// Withdraw one earlier requirement of `usecs`; false if none was pushed
    pub fn pop_resolution_requirement(&self, usecs: u64) -> bool {
        let mut requirements = self.requirements.lock();
        match requirements.iter().position(|existing| *existing == usecs) {
            Some(index) => {
                requirements.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

impl core::fmt::Debug for FixedInterval {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedInterval")
            .field("interval", &self.interval())
            .finish()
    }
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl SchedulingPolicy for FixedInterval {
    const TYPE: &'static DriverType = &FIXED_SCHEDULER;

    fn slice(&self, _weight: u64, _active: usize, _total_weight: u64) -> u64 {
        self.interval()
    }

    fn backoff(&self) -> u64 {
        self.interval().saturating_mul(Self::BACKOFF_FACTOR)
    }
}
