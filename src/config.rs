//! Tunables for the heap and the memory-pressure controller.

/// Smallest trigger budget the pressure controller will use.
#[cfg(target_pointer_width = "64")]
pub const MIN_PRESSURE_BUDGET: u64 = 4 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const MIN_PRESSURE_BUDGET: u64 = 3 * 1024 * 1024;

/// Cap on how far the add/remove ratio may stretch the trigger budget.
pub const MAX_PRESSURE_RATIO: u64 = 10;

pub const MAX_GENERATION: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PressureConfig {
    pub min_budget: u64,
    pub max_ratio: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            min_budget: MIN_PRESSURE_BUDGET,
            max_ratio: MAX_PRESSURE_RATIO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub pressure: PressureConfig,
    pub max_generation: u8,
    /// Run pending finalizers as soon as the collection that found them ends.
    pub run_finalizers_after_collect: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pressure: PressureConfig::default(),
            max_generation: MAX_GENERATION,
            run_finalizers_after_collect: true,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_pressure_budget(mut self, bytes: u64) -> Self {
        self.pressure.min_budget = bytes;
        self
    }

    pub fn with_max_pressure_ratio(mut self, ratio: u64) -> Self {
        self.pressure.max_ratio = ratio.max(1);
        self
    }

    /// Generations above [`MAX_GENERATION`] are not tracked.
    pub fn with_max_generation(mut self, generation: u8) -> Self {
        self.max_generation = generation.min(MAX_GENERATION);
        self
    }

    pub fn with_deferred_finalizers(mut self) -> Self {
        self.run_finalizers_after_collect = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_generation, 2);
        assert_eq!(config.pressure.max_ratio, 10);
        assert_eq!(config.pressure.min_budget, MIN_PRESSURE_BUDGET);
        assert!(config.run_finalizers_after_collect);
    }

    #[test]
    fn test_builder_setters() {
        let config = RuntimeConfig::new()
            .with_min_pressure_budget(1024)
            .with_max_pressure_ratio(0)
            .with_max_generation(9)
            .with_deferred_finalizers();
        assert_eq!(config.pressure.min_budget, 1024);
        assert_eq!(config.pressure.max_ratio, 1);
        assert_eq!(config.max_generation, MAX_GENERATION);
        assert!(!config.run_finalizers_after_collect);
    }
}
