//! Unmanaged memory pressure accounting.
//!
//! Callers report unmanaged allocations and frees. The controller keeps four
//! buckets of added and removed bytes, one per gen 2 collection "epoch", and
//! asks for a background gen 2 collection once the current bucket outgrows a
//! budget derived from the history in the other three.
use super::{CollectionFlags, GcStatus};
use crate::{
    config::PressureConfig,
    error::{RuntimeError, RuntimeResult},
};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::debug;

pub const PRESSURE_COUNT: usize = 4;
const GEN2: u8 = 2;

#[derive(Debug)]
pub struct MemoryPressure {
    config: PressureConfig,
    gc_counts: [AtomicU32; 3],
    add_pressure: [AtomicI64; PRESSURE_COUNT],
    remove_pressure: [AtomicI64; PRESSURE_COUNT],
    iteration: AtomicU32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PressureSnapshot {
    pub iteration: u32,
    pub added: [i64; PRESSURE_COUNT],
    pub removed: [i64; PRESSURE_COUNT],
}

/// Saturates at `i64::MAX` instead of wrapping.
fn interlocked_add_saturating(target: &AtomicI64, addend: i64) -> i64 {
    let mut old = target.load(Ordering::Relaxed);
    loop {
        let new = old.saturating_add(addend);
        match target.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return new,
            Err(actual) => old = actual,
        }
    }
}

fn sum_excluding(buckets: &[AtomicI64; PRESSURE_COUNT], skip: usize) -> i64 {
    buckets
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != skip)
        .fold(0i64, |acc, (_, b)| acc.saturating_add(b.load(Ordering::Relaxed)))
}

fn validate(bytes: i64) -> RuntimeResult<()> {
    if bytes <= 0 {
        return Err(RuntimeError::out_of_range(
            "bytes_allocated",
            "Positive number required.",
        ));
    }
    if cfg!(target_pointer_width = "32") && bytes > i32::MAX as i64 {
        return Err(RuntimeError::out_of_range(
            "bytes_allocated",
            "Value must be non-negative and less than or equal to Int32.MaxValue.",
        ));
    }
    Ok(())
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::new(PressureConfig::default())
    }
}

impl MemoryPressure {
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            gc_counts: Default::default(),
            add_pressure: Default::default(),
            remove_pressure: Default::default(),
            iteration: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> PressureConfig {
        self.config
    }

    /// Starts a new epoch when a gen 2 collection happened since the last
    /// look, clearing the bucket the new epoch reuses.
    fn check_collection_count(&self, gc: &impl GcStatus) {
        let gen2 = gc.collection_count(GEN2);
        if self.gc_counts[2].load(Ordering::Relaxed) != gen2 {
            for (gen, count) in self.gc_counts.iter().enumerate() {
                count.store(gc.collection_count(gen as u8), Ordering::Relaxed);
            }
            let iteration = self.iteration.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            let p = iteration as usize % PRESSURE_COUNT;
            self.add_pressure[p].store(0, Ordering::Relaxed);
            self.remove_pressure[p].store(0, Ordering::Relaxed);
        }
    }

    pub fn add(&self, bytes_allocated: i64, gc: &impl GcStatus) -> RuntimeResult<()> {
        validate(bytes_allocated)?;
        self.check_collection_count(gc);

        let iteration = self.iteration.load(Ordering::Acquire);
        let p = iteration as usize % PRESSURE_COUNT;
        let new_value = interlocked_add_saturating(&self.add_pressure[p], bytes_allocated);

        let min_budget = self.config.min_budget as i64;
        if new_value < min_budget {
            return Ok(());
        }

        let add = sum_excluding(&self.add_pressure, p);
        let rem = sum_excluding(&self.remove_pressure, p);
        let mut budget = min_budget;

        // only trust the history once every bucket has seen a full epoch
        if iteration as usize >= PRESSURE_COUNT {
            let ratio = self.config.max_ratio as i64;
            if add >= rem.saturating_mul(ratio) {
                budget = min_budget.saturating_mul(ratio);
            } else if add > rem {
                let scaled = (add as i128 * 1024 / rem as i128) * budget as i128 / 1024;
                budget = scaled.min(i64::MAX as i128) as i64;
            }
        }

        if new_value < budget {
            return Ok(());
        }

        let heap_over_3 = (gc.current_object_size() / 3).min(i64::MAX as u64) as i64;
        budget = budget.max(heap_over_3);
        if new_value < budget {
            return Ok(());
        }

        // stay out of the way if gen 2 collections would take more than a fifth of the time
        let since_last = gc.now().saturating_sub(gc.last_gc_start(GEN2));
        if since_last > gc.last_gc_duration(GEN2) * 5 {
            debug!(
                pressure = new_value,
                budget,
                iteration,
                "memory pressure over budget, requesting gen 2 collection"
            );
            gc.request_collection(GEN2, CollectionFlags::NON_BLOCKING);
            self.check_collection_count(gc);
        }
        Ok(())
    }

    pub fn remove(&self, bytes_allocated: i64, gc: &impl GcStatus) -> RuntimeResult<()> {
        validate(bytes_allocated)?;
        self.check_collection_count(gc);
        let p = self.iteration.load(Ordering::Acquire) as usize % PRESSURE_COUNT;
        interlocked_add_saturating(&self.remove_pressure[p], bytes_allocated);
        Ok(())
    }

    pub fn snapshot(&self) -> PressureSnapshot {
        let load = |b: &[AtomicI64; PRESSURE_COUNT]| {
            let mut out = [0i64; PRESSURE_COUNT];
            for (o, v) in out.iter_mut().zip(b) {
                *o = v.load(Ordering::Relaxed);
            }
            out
        };
        PressureSnapshot {
            iteration: self.iteration.load(Ordering::Acquire),
            added: load(&self.add_pressure),
            removed: load(&self.remove_pressure),
        }
    }
}
