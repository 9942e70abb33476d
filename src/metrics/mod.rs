pub mod collector;
pub mod stats;

pub use collector::{
    ErrorRecord, LiveIndicators, MetricsCollector, ProcessProbe, ResourceProbe, SessionReport,
    ITEM_OPERATION,
};
pub use stats::{
    Bottleneck, CriticalPathEntry, LeakAssessment, OperationStats, OperationTiming, Percentiles,
    ResourceSnapshot, Severity, SpeedBucket,
};
