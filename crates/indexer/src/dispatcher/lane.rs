use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use toolhub_catalog::{ToolEnvelope, ToolId};

use super::stats::LaneCounters;
use crate::dead_letter::{DeadLetterRecord, RECONCILE_KIND};
use crate::handler::{Outcome, ToolEventHandler};

pub(crate) const SHUTDOWN_REASON: &str = "shutdown deadline exceeded";

#[derive(Debug)]
pub(crate) enum LaneTask {
    Event(ToolEnvelope),
    Reconcile(ToolId),
    /// Resolves once every task queued ahead of it has been handled.
    Barrier(oneshot::Sender<()>),
    /// Stop accepting tasks; drain what is queued, then exit.
    Close,
}

/// A task the lane never attempted because shutdown ran out of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedTask {
    pub lane: usize,
    pub tool_id: ToolId,
    pub kind: String,
    /// Zero for reconciliation tasks.
    pub sequence_number: u64,
}

pub(crate) struct Lane<H> {
    pub index: usize,
    pub handler: Arc<H>,
    pub counters: Arc<LaneCounters>,
    pub abandon: Arc<AtomicBool>,
}

impl<H> Lane<H>
where
    H: ToolEventHandler,
{
    /// Runs until the lane is closed and drained (or every sender is gone).
    pub async fn run(self, mut rx: mpsc::Receiver<LaneTask>) -> Vec<AbandonedTask> {
        info!(lane = self.index, "lane started");

        // Highest sequence applied per id. Ids are pinned to one lane, so this
        // needs no synchronization. One entry per id seen (tombstones too) for
        // the life of the process; dropping one would let a late stale event
        // through. Reported as `tracked_ids`.
        let mut last_applied: HashMap<ToolId, u64> = HashMap::new();
        let mut abandoned = Vec::new();

        while let Some(task) = rx.recv().await {
            match task {
                LaneTask::Close => {
                    debug!(lane = self.index, "lane closing; draining queue");
                    rx.close();
                }
                LaneTask::Barrier(done) => {
                    let _ = done.send(());
                }
                LaneTask::Event(envelope) => {
                    if self.abandon.load(Ordering::Acquire) {
                        abandoned.push(self.abandon_event(envelope).await);
                        continue;
                    }
                    self.run_event(envelope, &mut last_applied).await;
                }
                LaneTask::Reconcile(tool_id) => {
                    if self.abandon.load(Ordering::Acquire) {
                        abandoned.push(self.abandon_reconcile(tool_id).await);
                        continue;
                    }
                    self.run_reconcile(tool_id, &mut last_applied).await;
                }
            }
        }

        info!(
            lane = self.index,
            abandoned = abandoned.len(),
            "lane stopped"
        );
        abandoned
    }

    async fn run_event(&self, envelope: ToolEnvelope, last_applied: &mut HashMap<ToolId, u64>) {
        let tool_id = ToolId(envelope.aggregate_id());
        let sequence = envelope.sequence_number();

        let last = last_applied.get(&tool_id).copied();
        if !envelope.supersedes(last) {
            debug!(
                lane = self.index,
                tool_id = %tool_id,
                sequence,
                last_applied = ?last,
                "skipping stale or duplicate event"
            );
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters.in_flight.store(true, Ordering::Relaxed);
        let outcome = self.handler.handle_event(&envelope).await;
        self.counters.in_flight.store(false, Ordering::Relaxed);

        // Advance even when dead-lettered: the lane must not wedge on one id.
        last_applied.insert(tool_id, sequence);
        self.track(last_applied);
        self.record(outcome);
    }

    async fn run_reconcile(&self, tool_id: ToolId, last_applied: &mut HashMap<ToolId, u64>) {
        self.counters.in_flight.store(true, Ordering::Relaxed);
        let reconciled = self.handler.reconcile(tool_id).await;
        self.counters.in_flight.store(false, Ordering::Relaxed);

        if let Some(version) = reconciled.indexed_version {
            let last = last_applied.entry(tool_id).or_insert(0);
            *last = (*last).max(version);
            self.track(last_applied);
        }
        self.record(reconciled.outcome);
    }

    fn track(&self, last_applied: &HashMap<ToolId, u64>) {
        self.counters
            .tracked_ids
            .store(last_applied.len() as u64, Ordering::Relaxed);
    }

    fn record(&self, outcome: Outcome) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .retries
            .fetch_add(u64::from(outcome.retries()), Ordering::Relaxed);
        if matches!(outcome, Outcome::DeadLettered { .. }) {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn abandon_event(&self, envelope: ToolEnvelope) -> AbandonedTask {
        let task = AbandonedTask {
            lane: self.index,
            tool_id: ToolId(envelope.aggregate_id()),
            kind: envelope.payload().kind().to_string(),
            sequence_number: envelope.sequence_number(),
        };
        self.handler
            .dead_letter(DeadLetterRecord::for_event(envelope, SHUTDOWN_REASON, 0))
            .await;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        task
    }

    async fn abandon_reconcile(&self, tool_id: ToolId) -> AbandonedTask {
        self.handler
            .dead_letter(DeadLetterRecord::for_reconcile(tool_id, SHUTDOWN_REASON, 0))
            .await;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        AbandonedTask {
            lane: self.index,
            tool_id,
            kind: RECONCILE_KIND.to_string(),
            sequence_number: 0,
        }
    }
}

/// Jump consistent hash: maps `key` onto `buckets` lanes with minimal movement
/// when the lane count changes.
pub(crate) fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let buckets = buckets.max(1) as i64;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1_i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bucket_always_maps_to_zero() {
        for key in [0, 1, u64::MAX, 12345] {
            assert_eq!(jump_hash(key, 1), 0);
        }
    }

    #[test]
    fn keys_spread_over_all_buckets() {
        let mut seen = [0usize; 8];
        for key in 0..10_000u64 {
            seen[jump_hash(key.wrapping_mul(0x9E37_79B9_7F4A_7C15), 8)] += 1;
        }
        assert!(seen.iter().all(|&n| n > 800), "uneven spread: {seen:?}");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn bucket_is_in_range_and_stable(key in any::<u64>(), buckets in 1usize..64) {
                let b = jump_hash(key, buckets);
                prop_assert!(b < buckets);
                prop_assert_eq!(b, jump_hash(key, buckets));
            }

            /// Growing the lane count only ever moves a key to the new lane.
            #[test]
            fn growth_moves_keys_only_to_new_bucket(key in any::<u64>(), buckets in 1usize..64) {
                let before = jump_hash(key, buckets);
                let after = jump_hash(key, buckets + 1);
                prop_assert!(after == before || after == buckets);
            }
        }
    }
}
