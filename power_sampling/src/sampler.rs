//! The sampling loop: drives counter acquisition at a fixed cadence and
//! turns raw readings into power samples, history and attributed stacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backtrace::{
    Backtrace, BacktraceGraph, BacktraceNode, FlatBacktraceEntry, FlatBacktraceIndex, NoSymbols,
    SymbolResolver,
};
use crate::history::SampledHistory;
use crate::sample::{SampleResult, ThreadPower};
use crate::{compute_power, CombinedPower, CoreClass, Energy, Power, ThreadCounterProbe, ThreadCounters};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Nominal time between two sampling ticks.
    pub sampling_period: Duration,
    /// Number of samples kept in the history.
    pub history_capacity: usize,
    /// Whether per-thread names are carried into the samples.
    pub thread_names: bool,
    /// Whether captured call stacks are aggregated. Disabling this skips
    /// the whole attribution path for lower overhead.
    pub backtraces: bool,
}

impl Default for SamplerConfig {
    fn default() -> SamplerConfig {
        SamplerConfig {
            sampling_period: Duration::from_millis(500),
            history_capacity: 60,
            thread_names: true,
            backtraces: false,
        }
    }
}

/// All mutable sampling state, owned by one lock.
///
/// The lock is the single-writer domain: the background task and one-shot
/// calls serialize on it, so a tick can never observe (or leave behind) a
/// half-updated snapshot map, and readers always get internally-consistent
/// copies.
struct SamplerInner {
    probe: Box<dyn ThreadCounterProbe>,
    resolver: Box<dyn SymbolResolver + Send>,
    /// Counter readings of the previous tick, by thread id. Replaced
    /// wholesale every tick, so exited threads never linger.
    previous_counters: HashMap<u64, ThreadCounters>,
    last_sample_time: Option<Instant>,
    history: SampledHistory,
    /// Cumulative energy of the process since start (or last reset), in
    /// watt-hours.
    total_energy: Energy,
    current_thread_count: usize,
    graph: BacktraceGraph,
    flat: FlatBacktraceIndex,
}

impl SamplerInner {
    /// One sampling tick: acquire counters and process them. An acquisition
    /// error is propagated; the loop turns it into a zero-power sample.
    fn tick(&mut self, pid: i32, config: &SamplerConfig, now: Instant) -> anyhow::Result<SampleResult> {
        let counters = self.probe.sample(pid)?;
        Ok(self.process(counters, config, now))
    }

    /// Diffs a raw reading against the previous snapshot and updates every
    /// piece of derived state. Infallible: an empty reading is a valid
    /// zero-power sample.
    fn process(&mut self, counters: Vec<ThreadCounters>, config: &SamplerConfig, now: Instant) -> SampleResult {
        let elapsed = self.last_sample_time.map(|last| now.duration_since(last));

        let mut all_threads_power = CombinedPower::zero();
        let mut threads_power = Vec::with_capacity(counters.len());
        let mut captured_stacks = Vec::new();

        for counter in &counters {
            let mut power = CombinedPower::zero();
            match (self.previous_counters.get(&counter.thread_id), elapsed) {
                (Some(previous), Some(elapsed)) => {
                    for class in CoreClass::ALL {
                        power.add(class, compute_power(previous, counter, class, elapsed));
                    }
                    if config.backtraces {
                        if let Some(stack) = &counter.call_stack {
                            // attribute this thread's energy delta to its stack
                            let delta: Energy = CoreClass::ALL
                                .iter()
                                .map(|&class| (counter.energy[class] - previous.energy[class]).max(0.0))
                                .sum();
                            captured_stacks.push(Backtrace {
                                addresses: stack.clone(),
                                energy: Some(delta),
                            });
                        }
                    }
                }
                _ => {
                    // First sight of this thread id (spawned since the last
                    // tick, or its counters were reset): no diff basis yet,
                    // it only establishes its baseline this tick. Its stack
                    // still shapes the call tree, with no energy attached.
                    if config.backtraces {
                        if let Some(stack) = &counter.call_stack {
                            captured_stacks.push(Backtrace {
                                addresses: stack.clone(),
                                energy: None,
                            });
                        }
                    }
                }
            }
            for class in CoreClass::ALL {
                all_threads_power.add(class, power.per_class[class]);
            }
            let pthread_name = if config.thread_names {
                counter.pthread_name.clone()
            } else {
                None
            };
            threads_power.push(ThreadPower::new(counter.thread_id, pthread_name, power));
        }

        self.current_thread_count = counters.len();
        self.previous_counters = counters.into_iter().map(|c| (c.thread_id, c)).collect();
        self.last_sample_time = Some(now);

        let sample = SampleResult {
            time: SystemTime::now(),
            all_threads_power,
            threads_power,
        };
        self.history.add_sample(sample.clone());
        self.total_energy += sample.all_threads_power.total() * config.sampling_period.as_secs_f64() / 3600.0;

        if !captured_stacks.is_empty() {
            self.graph.ingest(&captured_stacks, &*self.resolver);
            self.flat.ingest(&captured_stacks, &*self.resolver);
        }

        debug!(
            "tick: {} threads, {:.3} W total, {:.6} Wh cumulative",
            self.current_thread_count,
            sample.all_threads_power.total(),
            self.total_energy
        );
        sample
    }

    fn ingest_backtraces(&mut self, backtraces: &[Backtrace]) {
        self.graph.ingest(backtraces, &*self.resolver);
        self.flat.ingest(backtraces, &*self.resolver);
    }
}

/// Samples the CPU power used by a process, thread by thread.
///
/// One instance owns the whole sampling pipeline: the counter probe, the
/// prior-snapshot ledger, the bounded history and the stack-attribution
/// structures. Construct it once at startup and hand it (or an `Arc` of it)
/// to whoever needs readings; all methods take `&self`.
pub struct PowerSampler {
    config: SamplerConfig,
    inner: Arc<Mutex<SamplerInner>>,
    sampling_task: Mutex<Option<JoinHandle<()>>>,
    subscriber: Mutex<Option<mpsc::Sender<SampleResult>>>,
}

impl PowerSampler {
    pub fn new(probe: Box<dyn ThreadCounterProbe>, config: SamplerConfig) -> PowerSampler {
        PowerSampler::with_resolver(probe, Box::new(NoSymbols), config)
    }

    pub fn with_resolver(
        probe: Box<dyn ThreadCounterProbe>,
        resolver: Box<dyn SymbolResolver + Send>,
        config: SamplerConfig,
    ) -> PowerSampler {
        let inner = SamplerInner {
            probe,
            resolver,
            previous_counters: HashMap::new(),
            last_sample_time: None,
            history: SampledHistory::new(config.history_capacity),
            total_energy: 0.0,
            current_thread_count: 0,
            graph: BacktraceGraph::new(),
            flat: FlatBacktraceIndex::new(),
        };
        PowerSampler {
            config,
            inner: Arc::new(Mutex::new(inner)),
            sampling_task: Mutex::new(None),
            subscriber: Mutex::new(None),
        }
    }

    /// Registers a channel that will receive every sample produced by the
    /// background loop. Samples are dropped (not awaited) if the receiver
    /// does not keep up. Call before [`PowerSampler::start_sampling`].
    pub fn set_sample_sender(&self, sender: mpsc::Sender<SampleResult>) {
        *self.subscriber.lock().unwrap() = Some(sender);
    }

    /// Starts the background sampling loop for `pid`. A no-op if the loop
    /// is already running. Must be called within a tokio runtime.
    pub fn start_sampling(&self, pid: i32) {
        let mut task = self.sampling_task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let subscriber = self.subscriber.lock().unwrap().clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sampling_period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sample = {
                    let mut inner = inner.lock().unwrap();
                    match inner.tick(pid, &config, Instant::now()) {
                        Ok(sample) => sample,
                        Err(e) => {
                            // a failed acquisition is a zero-power tick, the
                            // loop stays on schedule
                            warn!("counter acquisition failed: {e:#}");
                            inner.process(Vec::new(), &config, Instant::now())
                        }
                    }
                };
                if let Some(tx) = &subscriber {
                    if tx.try_send(sample).is_err() {
                        debug!("sample subscriber is gone or full, dropping sample");
                    }
                }
            }
        }));
    }

    /// Stops the background loop. Safe to call when not sampling, and safe
    /// to call repeatedly. No tick is aborted mid-diff: the task only ends
    /// between ticks (the tick body holds the state lock).
    pub fn stop_sampling(&self) {
        if let Some(task) = self.sampling_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Whether the background loop is currently running.
    pub fn is_sampling(&self) -> bool {
        self.sampling_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Performs one synchronous sampling tick, outside of any loop cadence.
    /// The first call only establishes the counter baseline and reports
    /// zero power.
    pub fn sample_now(&self, pid: i32) -> anyhow::Result<SampleResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick(pid, &self.config, Instant::now())
    }

    /// Number of threads seen in the most recent reading.
    pub fn current_thread_count(&self) -> usize {
        self.inner.lock().unwrap().current_thread_count
    }

    /// Cumulative energy used by the process, in watt-hours, since sampling
    /// began or [`PowerSampler::reset_energy_used`] was last called.
    pub fn total_energy_usage(&self) -> Energy {
        self.inner.lock().unwrap().total_energy
    }

    /// Zeroes the cumulative energy counter. History is left untouched.
    pub fn reset_energy_used(&self) {
        self.inner.lock().unwrap().total_energy = 0.0;
    }

    /// The retained samples (ascending by time) and the maximum total power
    /// among them, as one consistent copy.
    pub fn history_snapshot(&self) -> (Vec<SampleResult>, Power) {
        let inner = self.inner.lock().unwrap();
        (inner.history.samples().to_vec(), inner.history.max_power())
    }

    /// Feeds externally captured backtraces into the call tree and the flat
    /// index.
    pub fn ingest_backtraces(&self, backtraces: &[Backtrace]) {
        self.inner.lock().unwrap().ingest_backtraces(backtraces);
    }

    /// Energy-ranked copy of the aggregated call tree.
    pub fn backtrace_graph_snapshot(&self) -> Vec<BacktraceNode> {
        self.inner.lock().unwrap().graph.ranked_snapshot()
    }

    /// Energy-ranked copy of the per-address totals.
    pub fn flat_backtraces_snapshot(&self) -> Vec<FlatBacktraceEntry> {
        self.inner.lock().unwrap().flat.ranked_snapshot()
    }

    /// Drops all aggregated stack data.
    pub fn reset_backtraces(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.graph.reset();
        inner.flat.reset();
    }
}

impl Drop for PowerSampler {
    fn drop(&mut self) {
        self.stop_sampling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::enum_map;
    use std::collections::VecDeque;

    /// Probe that replays a scripted sequence of readings.
    struct ScriptedProbe {
        readings: VecDeque<Vec<ThreadCounters>>,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<Vec<ThreadCounters>>) -> ScriptedProbe {
            ScriptedProbe {
                readings: readings.into(),
            }
        }
    }

    impl ThreadCounterProbe for ScriptedProbe {
        fn sample(&mut self, _pid: i32) -> anyhow::Result<Vec<ThreadCounters>> {
            self.readings
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

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

    fn with_stack(mut c: ThreadCounters, stack: &[u64]) -> ThreadCounters {
        c.call_stack = Some(stack.to_vec());
        c
    }

    /// Runs scripted ticks with hand-picked instants and returns the samples.
    fn run_ticks(sampler: &PowerSampler, pid: i32, instants: &[Instant]) -> Vec<SampleResult> {
        let mut inner = sampler.inner.lock().unwrap();
        instants
            .iter()
            .map(|&now| inner.tick(pid, &sampler.config, now).unwrap())
            .collect()
    }

    #[test]
    fn scripted_readings_produce_hand_computed_powers_and_energy() {
        let probe = ScriptedProbe::new(vec![
            vec![counters(1, 0.0, 0.0)],
            vec![counters(1, 10.0, 2.0)],
            vec![counters(1, 13.0, 2.0)],
        ]);
        let config = SamplerConfig {
            sampling_period: Duration::from_millis(500),
            ..SamplerConfig::default()
        };
        let sampler = PowerSampler::new(Box::new(probe), config);

        let t0 = Instant::now();
        let samples = run_ticks(&sampler, 1, &[t0, t0 + Duration::from_secs(2), t0 + Duration::from_secs(3)]);

        // first tick: baseline only
        assert_eq!(samples[0].all_threads_power.total(), 0.0);
        // 10 J perf + 2 J eff over 2 s
        assert_eq!(samples[1].all_threads_power.performance(), 5.0);
        assert_eq!(samples[1].all_threads_power.efficiency(), 1.0);
        // 3 J perf over 1 s
        assert_eq!(samples[2].all_threads_power.performance(), 3.0);
        assert_eq!(samples[2].all_threads_power.efficiency(), 0.0);

        // per-thread breakdown matches the combined figure
        assert_eq!(samples[1].threads_power.len(), 1);
        assert_eq!(samples[1].threads_power[0].power.total(), 6.0);

        // cumulative energy: (0 + 6 + 3) W * 0.5 s nominal / 3600
        let expected_wh = 9.0 * 0.5 / 3600.0;
        assert!((sampler.total_energy_usage() - expected_wh).abs() < 1e-12);

        let (history, max_power) = sampler.history_snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(max_power, 6.0);
        assert_eq!(sampler.current_thread_count(), 1);
    }

    #[test]
    fn reset_energy_zeroes_the_total_but_not_the_history() {
        let probe = ScriptedProbe::new(vec![
            vec![counters(1, 0.0, 0.0)],
            vec![counters(1, 5.0, 0.0)],
        ]);
        let sampler = PowerSampler::new(Box::new(probe), SamplerConfig::default());
        let t0 = Instant::now();
        run_ticks(&sampler, 1, &[t0, t0 + Duration::from_secs(1)]);

        assert!(sampler.total_energy_usage() > 0.0);
        let (history_before, max_before) = sampler.history_snapshot();

        sampler.reset_energy_used();
        assert_eq!(sampler.total_energy_usage(), 0.0);

        let (history_after, max_after) = sampler.history_snapshot();
        assert_eq!(history_after.len(), history_before.len());
        assert_eq!(max_after, max_before);
    }

    #[test]
    fn new_threads_skip_one_tick_and_exited_threads_are_dropped() {
        let probe = ScriptedProbe::new(vec![
            vec![counters(1, 0.0, 0.0)],
            // thread 2 appears: no diff basis this tick
            vec![counters(1, 2.0, 0.0), counters(2, 100.0, 0.0)],
            // thread 1 exits, thread 2 diffs normally
            vec![counters(2, 104.0, 0.0)],
            // thread 1 comes back with smaller counters: new incarnation
            vec![counters(2, 105.0, 0.0), counters(1, 1.0, 0.0)],
        ]);
        let sampler = PowerSampler::new(Box::new(probe), SamplerConfig::default());
        let t0 = Instant::now();
        let s = Duration::from_secs(1);
        let samples = run_ticks(&sampler, 1, &[t0, t0 + s, t0 + 2 * s, t0 + 3 * s]);

        // tick 1: only thread 1 contributes (2 J / 1 s)
        assert_eq!(samples[1].all_threads_power.total(), 2.0);
        assert_eq!(samples[1].threads_power.len(), 2);

        // tick 2: thread 2 contributes 4 W, thread 1 is gone
        assert_eq!(samples[2].all_threads_power.total(), 4.0);
        assert_eq!(samples[2].threads_power.len(), 1);
        assert_eq!(sampler.current_thread_count(), 2);

        // tick 3: thread 1 was dropped from the ledger when it exited, so
        // its return is a fresh baseline, not a negative diff
        assert_eq!(samples[3].all_threads_power.total(), 1.0);
    }

    #[test]
    fn empty_acquisition_is_a_zero_power_sample() {
        let probe = ScriptedProbe::new(vec![vec![counters(1, 0.0, 0.0)], vec![]]);
        let sampler = PowerSampler::new(Box::new(probe), SamplerConfig::default());
        let t0 = Instant::now();
        let samples = run_ticks(&sampler, 1, &[t0, t0 + Duration::from_secs(1)]);

        assert_eq!(samples[1].all_threads_power.total(), 0.0);
        assert!(samples[1].threads_power.is_empty());
        assert_eq!(sampler.current_thread_count(), 0);
        assert_eq!(sampler.history_snapshot().0.len(), 2);
    }

    #[test]
    fn captured_stacks_receive_the_thread_energy_delta() {
        let stack = [0xa, 0xb, 0xc];
        let probe = ScriptedProbe::new(vec![
            vec![with_stack(counters(1, 0.0, 0.0), &stack)],
            vec![with_stack(counters(1, 7.0, 1.0), &stack)],
        ]);
        let config = SamplerConfig {
            backtraces: true,
            ..SamplerConfig::default()
        };
        let sampler = PowerSampler::new(Box::new(probe), config);
        let t0 = Instant::now();
        run_ticks(&sampler, 1, &[t0, t0 + Duration::from_secs(1)]);

        let graph = sampler.backtrace_graph_snapshot();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].address, 0xa);
        // first tick shaped the tree with no energy, second attributed 8 J
        assert_eq!(graph[0].energy, 8.0);
        assert_eq!(graph[0].children[0].children[0].address, 0xc);

        let flat = sampler.flat_backtraces_snapshot();
        assert_eq!(flat.len(), 3);
        assert!(flat.iter().all(|e| e.energy == 8.0));
    }

    #[test]
    fn backtraces_disabled_skips_aggregation() {
        let stack = [0xa, 0xb];
        let probe = ScriptedProbe::new(vec![
            vec![with_stack(counters(1, 0.0, 0.0), &stack)],
            vec![with_stack(counters(1, 3.0, 0.0), &stack)],
        ]);
        let sampler = PowerSampler::new(Box::new(probe), SamplerConfig::default());
        let t0 = Instant::now();
        run_ticks(&sampler, 1, &[t0, t0 + Duration::from_secs(1)]);

        assert!(sampler.backtrace_graph_snapshot().is_empty());
        assert!(sampler.flat_backtraces_snapshot().is_empty());
    }
}
