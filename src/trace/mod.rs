//! Append-only run trace
//!
//! One [`TraceCollector`] exists per run. Parallel task runners append to it
//! concurrently; entries are ordered by arrival and stamped with the run's
//! monotonic clock. [`TraceSummary`] is the aggregate view handed to
//! dashboards and tests; [`sink`] hands both to external consumers.

pub mod collector;
pub mod event;
pub mod replay;
pub mod sink;
pub mod summary;

pub use collector::TraceCollector;
pub use event::{TraceEntry, TraceEvent};
pub use replay::{check_transitions, replay, ReplayState, TransitionViolation};
pub use sink::{JsonLinesTraceSink, LogTraceSink, MemoryTraceSink, TraceReport, TraceSink};
pub use summary::{PhaseBreakdown, TaskTiming, TraceSummary};
