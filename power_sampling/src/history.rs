use crate::sample::SampleResult;
use crate::Power;

/// Historic power figures for the sampled process.
///
/// A fixed-capacity ring buffer of the most recent samples. Each insert
/// refreshes a time-ordered snapshot of the live entries and the maximum
/// total power among them (used by consumers to scale their axes). The
/// recomputation is a full pass over the buffer, which is fine at the
/// default capacity of 60.
pub struct SampledHistory {
    ring: Vec<SampleResult>,
    capacity: usize,
    write_index: usize,
    /// Number of slots that hold a real sample. Slots beyond this count were
    /// never written; they must not be mistaken for measured zero power.
    written: usize,
    samples: Vec<SampleResult>,
    max_power: Power,
}

impl SampledHistory {
    /// Creates an empty history. The capacity is fixed for the lifetime of
    /// the buffer.
    pub fn new(capacity: usize) -> SampledHistory {
        assert!(capacity > 0, "history capacity must be non-zero");
        SampledHistory {
            ring: Vec::with_capacity(capacity),
            capacity,
            write_index: 0,
            written: 0,
            samples: Vec::new(),
            max_power: 0.0,
        }
    }

    /// Inserts a sample, overwriting the oldest entry once the buffer is
    /// full. Never fails.
    pub fn add_sample(&mut self, sample: SampleResult) {
        if self.ring.len() < self.capacity {
            self.ring.push(sample);
        } else {
            self.ring[self.write_index] = sample;
        }
        self.write_index = (self.write_index + 1) % self.capacity;
        self.written = self.ring.len();

        self.samples = self.ring.clone();
        self.samples.sort_by_key(|s| s.time);
        self.max_power = self
            .ring
            .iter()
            .map(|s| s.all_threads_power.total())
            .fold(0.0, Power::max);
    }

    /// The live samples, ascending by timestamp. Contains only samples that
    /// were actually inserted, at most `capacity` of them.
    pub fn samples(&self) -> &[SampleResult] {
        &self.samples
    }

    /// Maximum total power among the live samples.
    pub fn max_power(&self) -> Power {
        self.max_power
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }
}
