use crate::config::MAX_GENERATION;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const GENERATIONS: usize = MAX_GENERATION as usize + 1;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Total time spent in GC stop-the-world pauses (in microseconds)
    pub gc_pause_total_us: AtomicU64,
    /// Number of GC cycles performed, of any generation
    pub gc_pause_count: AtomicU64,
    /// Collections that covered each generation; a gen 2 collection counts for all three
    pub collection_counts: [AtomicU32; GENERATIONS],
    /// Start of the most recent collection of each generation, in microseconds since heap creation
    pub last_gc_start_us: [AtomicU64; GENERATIONS],
    pub last_gc_duration_us: [AtomicU64; GENERATIONS],
    /// Bytes held by live objects as of the last allocation or collection
    pub heap_bytes: AtomicU64,
    /// Collections requested by the memory-pressure controller
    pub pressure_collections: AtomicU64,
    pub finalizers_run: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gc_pause(&self, duration: Duration) {
        self.gc_pause_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.gc_pause_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished collection of `generation` and everything younger.
    pub fn record_collection(&self, generation: u8, started_at: Duration, duration: Duration) {
        self.record_gc_pause(duration);
        for gen in 0..=(generation as usize).min(GENERATIONS - 1) {
            self.collection_counts[gen].fetch_add(1, Ordering::Release);
            self.last_gc_start_us[gen].store(started_at.as_micros() as u64, Ordering::Relaxed);
            self.last_gc_duration_us[gen].store(duration.as_micros() as u64, Ordering::Relaxed);
        }
    }

    pub fn collection_count(&self, generation: u8) -> u32 {
        match self.collection_counts.get(generation as usize) {
            Some(count) => count.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn last_gc_start(&self, generation: u8) -> Duration {
        self.last_gc_start_us
            .get(generation as usize)
            .map_or(Duration::ZERO, |t| Duration::from_micros(t.load(Ordering::Relaxed)))
    }

    pub fn last_gc_duration(&self, generation: u8) -> Duration {
        self.last_gc_duration_us
            .get(generation as usize)
            .map_or(Duration::ZERO, |t| Duration::from_micros(t.load(Ordering::Relaxed)))
    }

    pub fn record_finalizer(&self) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
    }
}
