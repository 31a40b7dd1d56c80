use anyhow::Context;
use enum_map::enum_map;
use log::debug;
use power_sampling::{CoreClass, ThreadCounterProbe, ThreadCounters};

/// Nominal power of one busy core, in watts.
///
/// Linux exposes no per-thread energy counter, so this probe derives a
/// pseudo-energy accumulator from cumulative per-task CPU time: a thread
/// that ran for one second is charged `NOMINAL_CORE_POWER_W` joules. The
/// counter has the shape the engine needs (monotonic, per thread, resets
/// with the thread) even though the wattage is a constant approximation.
/// Platforms with real counters implement [`ThreadCounterProbe`] directly.
const NOMINAL_CORE_POWER_W: f64 = 5.0;

/// Counter probe reading `/proc/<pid>/task/*` through procfs.
pub struct CpuTimeProbe {
    /// Seconds per kernel clock tick (utime/stime unit).
    tick_seconds: f64,
}

impl CpuTimeProbe {
    pub fn new() -> anyhow::Result<CpuTimeProbe> {
        let ticks_per_second = procfs::ticks_per_second().context("reading the kernel clock tick rate")?;
        Ok(CpuTimeProbe {
            tick_seconds: 1.0 / ticks_per_second as f64,
        })
    }
}

impl ThreadCounterProbe for CpuTimeProbe {
    fn sample(&mut self, pid: i32) -> anyhow::Result<Vec<ThreadCounters>> {
        // A vanished process is a valid empty reading, not an error.
        let Ok(process) = procfs::process::Process::new(pid) else {
            debug!("process {pid} is gone");
            return Ok(Vec::new());
        };
        let Ok(tasks) = process.tasks() else {
            return Ok(Vec::new());
        };

        let mut counters = Vec::new();
        for task in tasks.flatten() {
            // a task can exit between the directory walk and the stat read
            let Ok(stat) = task.stat() else {
                continue;
            };
            let cpu_seconds = (stat.utime + stat.stime) as f64 * self.tick_seconds;
            counters.push(ThreadCounters {
                thread_id: task.tid as u64,
                pthread_name: Some(stat.comm).filter(|name| !name.is_empty()),
                energy: enum_map! {
                    CoreClass::Performance => cpu_seconds * NOMINAL_CORE_POWER_W,
                    CoreClass::Efficiency => 0.0,
                },
                call_stack: None,
            });
        }
        Ok(counters)
    }
}
