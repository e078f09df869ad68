//! Lane dispatcher: the concurrency core of the indexer.
//!
//! ```text
//!   on_commit / submit ──► lane_for(id) ──► [bounded queue] ──► lane task ──► handler
//!                                              lane 0..N-1
//! ```
//!
//! - Every id is pinned to one lane by jump consistent hashing, so events for
//!   one id run strictly in submission order while distinct ids run in parallel.
//! - Lanes drop envelopes whose sequence number is not above the highest one
//!   already applied for that id, which makes redelivery and late out-of-order
//!   submissions harmless.
//! - Queues are bounded. `submit` waits at most `submit_timeout` for room and
//!   otherwise hands the envelope back; nothing is dropped silently.
//! - Shutdown stops intake, lets lanes drain until the deadline, then
//!   dead-letters whatever is still queued. Running handlers are never
//!   cancelled mid-flight.

mod lane;
mod stats;

pub use lane::AbandonedTask;
pub use stats::{DispatcherStats, LaneStats};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use toolhub_catalog::{TOOL_AGGREGATE_TYPE, ToolEnvelope, ToolId};
use toolhub_events::CommitListener;

use crate::config::IndexerConfig;
use crate::handler::ToolEventHandler;

use lane::{Lane, LaneTask, jump_hash};
use stats::LaneCounters;

/// Why an envelope was not accepted. The envelope is always handed back.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("lane {lane} is saturated")]
    Saturated {
        lane: usize,
        envelope: Box<ToolEnvelope>,
    },

    #[error("dispatcher is shut down")]
    Closed { envelope: Box<ToolEnvelope> },

    #[error("envelope rejected: {reason}")]
    Rejected {
        reason: String,
        envelope: Box<ToolEnvelope>,
    },
}

impl SubmitError {
    pub fn envelope(&self) -> &ToolEnvelope {
        match self {
            SubmitError::Saturated { envelope, .. }
            | SubmitError::Closed { envelope }
            | SubmitError::Rejected { envelope, .. } => envelope,
        }
    }

    pub fn into_envelope(self) -> ToolEnvelope {
        match self {
            SubmitError::Saturated { envelope, .. }
            | SubmitError::Closed { envelope }
            | SubmitError::Rejected { envelope, .. } => *envelope,
        }
    }
}

/// Errors for control tasks (reconcile, flush).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
}

/// What happened during [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Every lane drained before the deadline.
    pub drained: bool,
    /// Queued tasks dead-lettered because the deadline passed.
    pub abandoned: Vec<AbandonedTask>,
    pub stats: DispatcherStats,
}

struct LaneHandle {
    tx: mpsc::Sender<LaneTask>,
    counters: Arc<LaneCounters>,
    join: Mutex<Option<JoinHandle<Vec<AbandonedTask>>>>,
}

pub struct Dispatcher {
    lanes: Vec<LaneHandle>,
    submit_timeout: Duration,
    closing: AtomicBool,
    abandon: Arc<AtomicBool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lanes", &self.lanes.len())
            .field("submit_timeout", &self.submit_timeout)
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    /// Spawn `config.lanes` lane tasks on the current tokio runtime, all
    /// running `handler`.
    pub fn spawn<H>(config: &IndexerConfig, handler: H) -> Self
    where
        H: ToolEventHandler,
    {
        let handler = Arc::new(handler);
        let abandon = Arc::new(AtomicBool::new(false));
        let lane_count = config.lanes.max(1);
        let capacity = config.lane_capacity.max(1);

        let lanes = (0..lane_count)
            .map(|index| {
                let (tx, rx) = mpsc::channel(capacity);
                let counters = Arc::new(LaneCounters::default());
                let lane = Lane {
                    index,
                    handler: handler.clone(),
                    counters: counters.clone(),
                    abandon: abandon.clone(),
                };
                LaneHandle {
                    tx,
                    counters,
                    join: Mutex::new(Some(tokio::spawn(lane.run(rx)))),
                }
            })
            .collect();

        info!(lanes = lane_count, capacity, "dispatcher started");

        Self {
            lanes,
            submit_timeout: config.submit_timeout,
            closing: AtomicBool::new(false),
            abandon,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane that owns `tool_id`.
    pub fn lane_for(&self, tool_id: ToolId) -> usize {
        let mut hasher = DefaultHasher::new();
        tool_id.hash(&mut hasher);
        jump_hash(hasher.finish(), self.lanes.len())
    }

    /// Queue a committed event, waiting up to `submit_timeout` for lane capacity.
    pub async fn submit(&self, envelope: ToolEnvelope) -> Result<(), SubmitError> {
        let lane = self.admit(&envelope)?;
        let tx = &self.lanes[lane].tx;

        match tokio::time::timeout(self.submit_timeout, tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(LaneTask::Event(envelope));
                Ok(())
            }
            Ok(Err(_)) => Err(SubmitError::Closed {
                envelope: Box::new(envelope),
            }),
            Err(_) => {
                warn!(
                    lane,
                    tool_id = %envelope.aggregate_id(),
                    sequence = envelope.sequence_number(),
                    "lane saturated; returning event to caller"
                );
                Err(SubmitError::Saturated {
                    lane,
                    envelope: Box::new(envelope),
                })
            }
        }
    }

    /// Queue a committed event only if its lane has room right now.
    pub fn try_submit(&self, envelope: ToolEnvelope) -> Result<(), SubmitError> {
        let lane = self.admit(&envelope)?;

        match self.lanes[lane].tx.try_reserve() {
            Ok(permit) => {
                permit.send(LaneTask::Event(envelope));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(SubmitError::Saturated {
                lane,
                envelope: Box::new(envelope),
            }),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SubmitError::Closed {
                envelope: Box::new(envelope),
            }),
        }
    }

    /// Queue a re-derivation of `tool_id` on its lane, behind any events
    /// already queued for it. Waits for capacity.
    pub async fn reconcile(&self, tool_id: ToolId) -> Result<(), DispatchError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        let lane = self.lane_for(tool_id);
        self.lanes[lane]
            .tx
            .send(LaneTask::Reconcile(tool_id))
            .await
            .map_err(|_| DispatchError::Closed)
    }

    /// Resolve once every task queued before this call has been handled.
    pub async fn flush(&self) -> Result<(), DispatchError> {
        let mut waiters = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let (done_tx, done_rx) = oneshot::channel();
            lane.tx
                .send(LaneTask::Barrier(done_tx))
                .await
                .map_err(|_| DispatchError::Closed)?;
            waiters.push(done_rx);
        }
        for waiter in waiters {
            waiter.await.map_err(|_| DispatchError::Closed)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            lanes: self
                .lanes
                .iter()
                .enumerate()
                .map(|(index, lane)| {
                    let depth = lane.tx.max_capacity() - lane.tx.capacity();
                    lane.counters.snapshot(index, depth)
                })
                .collect(),
        }
    }

    /// Stop intake and drain the lanes.
    ///
    /// Lanes keep working through their queues until `deadline`. After that,
    /// every task still queued is dead-lettered and listed in the report; a
    /// handler already running is allowed to finish. Calling this twice
    /// returns an empty report the second time.
    #[instrument(skip(self), fields(lanes = self.lanes.len()))]
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        if self.closing.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                drained: true,
                abandoned: Vec::new(),
                stats: self.stats(),
            };
        }

        let deadline_at = Instant::now() + deadline;
        let joins: Vec<JoinHandle<Vec<AbandonedTask>>> = self
            .lanes
            .iter()
            .filter_map(|lane| lane.join.lock().ok().and_then(|mut j| j.take()))
            .collect();

        let mut unclosed = Vec::new();
        for (index, lane) in self.lanes.iter().enumerate() {
            if tokio::time::timeout_at(deadline_at, lane.tx.send(LaneTask::Close))
                .await
                .is_err()
            {
                unclosed.push(index);
            }
        }

        let mut drained = unclosed.is_empty();
        let mut abandoned = Vec::new();
        let mut pending = Vec::new();

        for mut join in joins {
            if !drained {
                pending.push(join);
                continue;
            }
            match tokio::time::timeout_at(deadline_at, &mut join).await {
                Ok(result) => collect_lane(result, &mut abandoned),
                Err(_) => {
                    drained = false;
                    pending.push(join);
                }
            }
        }

        if !drained {
            warn!(
                pending_lanes = pending.len(),
                "shutdown deadline exceeded; dead-lettering queued tasks"
            );
            self.abandon.store(true, Ordering::Release);
            for index in unclosed {
                let _ = self.lanes[index].tx.send(LaneTask::Close).await;
            }
            for join in pending {
                collect_lane(join.await, &mut abandoned);
            }
        }

        let report = ShutdownReport {
            drained,
            abandoned,
            stats: self.stats(),
        };
        info!(
            drained = report.drained,
            abandoned = report.abandoned.len(),
            processed = report.stats.totals().processed,
            "dispatcher stopped"
        );
        report
    }

    fn admit(&self, envelope: &ToolEnvelope) -> Result<usize, SubmitError> {
        if let Err(reason) = check_committed(envelope) {
            error!(
                tool_id = %envelope.aggregate_id(),
                sequence = envelope.sequence_number(),
                event_id = %envelope.event_id(),
                reason = %reason,
                "rejecting envelope that cannot come from a committed mutation"
            );
            return Err(SubmitError::Rejected {
                reason,
                envelope: Box::new(envelope.clone()),
            });
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(SubmitError::Closed {
                envelope: Box::new(envelope.clone()),
            });
        }
        Ok(self.lane_for(ToolId(envelope.aggregate_id())))
    }
}

fn collect_lane(
    result: Result<Vec<AbandonedTask>, tokio::task::JoinError>,
    abandoned: &mut Vec<AbandonedTask>,
) {
    match result {
        Ok(tasks) => abandoned.extend(tasks),
        Err(err) => error!(error = %err, "lane task failed"),
    }
}

/// Reject what a catalog commit could never have produced.
fn check_committed(envelope: &ToolEnvelope) -> Result<(), String> {
    if envelope.aggregate_type() != TOOL_AGGREGATE_TYPE {
        return Err(format!("unexpected aggregate type {:?}", envelope.aggregate_type()));
    }
    envelope.verify().map_err(|e| e.to_string())
}

#[async_trait]
impl CommitListener<ToolEnvelope> for Dispatcher {
    type Error = SubmitError;

    async fn on_commit(&self, envelope: ToolEnvelope) -> Result<(), Self::Error> {
        self.submit(envelope).await
    }
}
