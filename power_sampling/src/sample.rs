use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use crate::CombinedPower;

/// The power used by a single thread over one sampling interval.
#[derive(Debug, Clone)]
pub struct ThreadPower {
    /// OS identifier of the thread.
    pub thread_id: u64,
    /// The pthread name of the thread, if it has a non-empty one.
    pub pthread_name: Option<String>,
    /// The combined power used by this thread across all core classes.
    pub power: CombinedPower,
}

impl ThreadPower {
    pub fn new(thread_id: u64, pthread_name: Option<String>, power: CombinedPower) -> ThreadPower {
        // An empty pthread name carries no information, treat it as absent.
        let pthread_name = pthread_name.filter(|name| !name.is_empty());
        ThreadPower {
            thread_id,
            pthread_name,
            power,
        }
    }

    /// Name to show for this thread: the pthread name when available,
    /// the decimal thread id otherwise.
    pub fn display_name(&self) -> String {
        match &self.pthread_name {
            Some(name) => name.clone(),
            None => self.thread_id.to_string(),
        }
    }
}

// Two samples of the same thread are the "same thread" even if the measured
// power differs, so identity is the thread id alone.
impl PartialEq for ThreadPower {
    fn eq(&self, other: &Self) -> bool {
        self.thread_id == other.thread_id
    }
}

impl Eq for ThreadPower {}

impl Hash for ThreadPower {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.thread_id.hash(state);
    }
}

/// The processed result of one sampling tick.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// The time at which the measurement was performed.
    pub time: SystemTime,
    /// The combined power used in the interval by all threads.
    pub all_threads_power: CombinedPower,
    /// Per-thread breakdown of the same interval.
    pub threads_power: Vec<ThreadPower>,
}

impl SampleResult {
    /// Empty sample with zero power.
    pub fn zero() -> SampleResult {
        SampleResult {
            time: SystemTime::now(),
            all_threads_power: CombinedPower::zero(),
            threads_power: Vec::new(),
        }
    }
}
