//! Concurrency-safe append log

use crate::clock::Clock;
use crate::observability::metrics;
use crate::trace::event::{TraceEntry, TraceEvent};
use crate::trace::summary::TraceSummary;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct TraceLog {
    entries: Vec<TraceEntry>,
    sealed: bool,
    dropped: u64,
}

/// Append-only event log for one run
///
/// Writers only hold the lock for the push itself, never across an await.
/// The timestamp is read under the lock, so arrival order and offset order
/// agree. After [`seal`](Self::seal) further appends are dropped and counted;
/// this is how late completions of abandoned attempts are kept out.
pub struct TraceCollector {
    run_id: Uuid,
    origin: Instant,
    clock: Arc<dyn Clock>,
    log: Mutex<TraceLog>,
}

impl TraceCollector {
    pub fn new(run_id: Uuid, clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self {
            run_id,
            origin,
            clock,
            log: Mutex::new(TraceLog::default()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Monotonic reading taken when the collector was created
    pub fn origin(&self) -> Instant {
        self.origin
    }

    fn lock(&self) -> MutexGuard<'_, TraceLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event; returns its sequence number, or `None` once sealed
    pub fn append(&self, event: TraceEvent) -> Option<u64> {
        let mut log = self.lock();
        self.push(&mut log, event)
    }

    /// Append a task-resolving event unless that task is already resolved
    ///
    /// The check and the push happen under one lock, so two writers racing
    /// to resolve the same task leave exactly one terminal entry. The loser
    /// gets the event already on record.
    pub fn append_resolution(&self, event: TraceEvent) -> Result<Option<u64>, TraceEvent> {
        let mut log = self.lock();
        let existing = log.entries.iter().find(|entry| {
            entry.event.is_task_terminal()
                && entry.event.phase_id() == event.phase_id()
                && entry.event.task_id() == event.task_id()
        });
        if let Some(entry) = existing {
            return Err(entry.event.clone());
        }
        Ok(self.push(&mut log, event))
    }

    fn push(&self, log: &mut TraceLog, event: TraceEvent) -> Option<u64> {
        if log.sealed {
            log.dropped += 1;
            metrics().late_trace_events(1);
            debug!(
                run_id = %self.run_id,
                event = event.name(),
                "Dropping trace event after run completion"
            );
            return None;
        }

        let seq = log.entries.len() as u64;
        let offset = self.clock.now().saturating_duration_since(self.origin);
        log.entries.push(TraceEntry {
            seq,
            run_id: self.run_id,
            offset,
            recorded_at: self.clock.wall(),
            event,
        });
        Some(seq)
    }

    /// Stop accepting events
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Events rejected after sealing
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in arrival order
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.lock().entries.clone()
    }

    pub fn summarize(&self) -> TraceSummary {
        TraceSummary::from_entries(self.run_id, &self.entries())
    }
}

impl fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.lock();
        f.debug_struct("TraceCollector")
            .field("run_id", &self.run_id)
            .field("entries", &log.entries.len())
            .field("sealed", &log.sealed)
            .field("dropped", &log.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::pipeline::execution::{RunStatus, TaskStatus};
    use std::time::Duration;

    fn collector() -> Arc<TraceCollector> {
        Arc::new(TraceCollector::new(Uuid::new_v4(), Arc::new(TokioClock)))
    }

    fn started(task_id: &str) -> TraceEvent {
        TraceEvent::TaskStarted {
            phase_id: "p".into(),
            task_id: task_id.into(),
            agent: "agent".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_are_stamped_with_offsets() {
        let trace = collector();
        trace.append(started("a"));
        tokio::time::sleep(Duration::from_millis(250)).await;
        trace.append(started("b"));

        let entries = trace.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(entries[1].offset, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_unique_sequence() {
        let trace = collector();
        let mut handles = Vec::new();

        for writer in 0..8 {
            let trace = Arc::clone(&trace);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    trace.append(started(&format!("t{writer}-{i}")));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = trace.entries();
        assert_eq!(entries.len(), 400);
        for (index, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, index as u64);
        }
        assert!(entries.windows(2).all(|w| w[0].offset <= w[1].offset));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolutions_leave_one_terminal_entry() {
        let trace = collector();
        let mut handles = Vec::new();

        for attempts in 1..=8u32 {
            let trace = Arc::clone(&trace);
            handles.push(tokio::spawn(async move {
                trace.append_resolution(TraceEvent::TaskCompleted {
                    phase_id: "p".into(),
                    task_id: "a".into(),
                    status: TaskStatus::Success,
                    attempts,
                    reason: None,
                })
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let terminal: Vec<_> = trace
            .entries()
            .into_iter()
            .filter(|e| e.event.is_task_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
    }

    #[test]
    fn test_resolution_of_another_task_is_not_blocked() {
        let trace = collector();
        let resolved = |task_id: &str| TraceEvent::TaskFellBack {
            phase_id: "p".into(),
            task_id: task_id.into(),
            attempts: 1,
            reason: "timed out after 1 attempt".into(),
        };

        assert_eq!(trace.append_resolution(resolved("a")), Ok(Some(0)));
        assert_eq!(trace.append_resolution(resolved("b")), Ok(Some(1)));
        assert_eq!(trace.append_resolution(resolved("a")), Err(resolved("a")));
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_sealed_collector_drops_late_events() {
        let trace = collector();
        trace.append(TraceEvent::PipelineCompleted {
            status: RunStatus::Completed,
        });
        trace.seal();

        assert_eq!(trace.append(started("late")), None);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.dropped(), 1);
        assert!(trace.is_sealed());
    }
}
