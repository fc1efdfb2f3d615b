pub mod exceptions;
pub mod gc;
pub mod metrics;

pub use metrics::RuntimeMetrics;
