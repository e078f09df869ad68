use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared between a lane task and the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct LaneCounters {
    pub in_flight: AtomicBool,
    pub processed: AtomicU64,
    pub skipped: AtomicU64,
    pub retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub tracked_ids: AtomicU64,
}

impl LaneCounters {
    pub fn snapshot(&self, lane: usize, queue_depth: usize) -> LaneStats {
        LaneStats {
            lane,
            queue_depth,
            in_flight: usize::from(self.in_flight.load(Ordering::Relaxed)),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            tracked_ids: self.tracked_ids.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub lane: usize,
    /// Tasks waiting in the lane's queue.
    pub queue_depth: usize,
    /// 1 while the lane is running a handler, else 0.
    pub in_flight: usize,
    /// Events and reconciliations run to an outcome (applied or dead-lettered).
    pub processed: u64,
    /// Stale or duplicate events dropped by the version guard.
    pub skipped: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    /// Ids with a remembered version. Never shrinks while the process runs.
    pub tracked_ids: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub lanes: Vec<LaneStats>,
}

impl DispatcherStats {
    /// Sum over all lanes (`lane` is left at 0).
    pub fn totals(&self) -> LaneStats {
        self.lanes.iter().fold(LaneStats::default(), |mut acc, l| {
            acc.queue_depth += l.queue_depth;
            acc.in_flight += l.in_flight;
            acc.processed += l.processed;
            acc.skipped += l.skipped;
            acc.retries += l.retries;
            acc.dead_lettered += l.dead_lettered;
            acc.tracked_ids += l.tracked_ids;
            acc
        })
    }
}
