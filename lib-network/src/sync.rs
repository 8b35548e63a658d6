//! Sync engine
//!
//! Couples local CRDT mutations to the peer transport: buffers operations
//! for broadcast, applies inbound batches, and exposes a small state
//! machine (`OK / PENDING / CONFLICT / ERROR`) that subscribers watch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use lib_crdt::{CrdtReplica, MergeReport, NodeId, Operation, VectorClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Ok,
    Pending,
    Conflict,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatsSnapshot {
    pub state: SyncState,
    pub pending: usize,
    pub conflicts_total: u64,
    pub broadcast_total: u64,
}

pub struct SyncEngine {
    replica: Arc<CrdtReplica>,
    pending: Mutex<VecDeque<Operation>>,
    state_tx: watch::Sender<SyncState>,
    /// A concurrent merge happened since the last clean tick.
    conflict_flag: AtomicBool,
    /// A transport failure happened since the last clean tick.
    error_flag: AtomicBool,
    conflicts_total: AtomicU64,
    broadcast_total: AtomicU64,
}

impl SyncEngine {
    pub fn new(replica: Arc<CrdtReplica>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SyncState::Ok);
        Arc::new(Self {
            replica,
            pending: Mutex::new(VecDeque::new()),
            state_tx,
            conflict_flag: AtomicBool::new(false),
            error_flag: AtomicBool::new(false),
            conflicts_total: AtomicU64::new(0),
            broadcast_total: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    pub fn replica(&self) -> &Arc<CrdtReplica> {
        &self.replica
    }

    /// Watch channel for state transitions. Subscribers see every change.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: SyncState) {
        self.state_tx.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Enqueue a local operation for broadcast.
    pub fn track_change(&self, op: Operation) {
        self.pending.lock().push_back(op);
        self.set_state(SyncState::Pending);
    }

    /// Drain the pending queue. The caller transmits the returned batch via
    /// the transport; state stays `PENDING` until the next clean tick.
    pub fn broadcast_changes(&self) -> Vec<Operation> {
        let drained: Vec<Operation> = self.pending.lock().drain(..).collect();
        self.broadcast_total.fetch_add(drained.len() as u64, Ordering::Relaxed);
        if !drained.is_empty() {
            debug!(count = drained.len(), "drained pending operations");
        }
        drained
    }

    /// Apply a batch from a peer. Concurrent merges flip the state to
    /// `CONFLICT` until a clean tick.
    pub fn apply_remote_changes(&self, ops: &[Operation], from: &NodeId) -> MergeReport {
        let report = self.replica.merge(ops);
        if report.conflicts > 0 {
            self.conflicts_total.fetch_add(report.conflicts as u64, Ordering::Relaxed);
            self.conflict_flag.store(true, Ordering::SeqCst);
            self.set_state(SyncState::Conflict);
            warn!(
                from = %from,
                conflicts = report.conflicts,
                "concurrent updates resolved during merge"
            );
        }
        report
    }

    pub fn changes_since(&self, since: &VectorClock) -> Vec<Operation> {
        self.replica.changes_since(since)
    }

    /// Everything in the log: an incremental sync from the empty clock.
    pub fn force_full_sync(&self) -> Vec<Operation> {
        self.replica.changes_since(&VectorClock::new())
    }

    /// Record a transport-level failure; surfaces as `ERROR` on the next
    /// evaluation while local mutations continue to be accepted.
    pub fn record_transport_error(&self) {
        self.error_flag.store(true, Ordering::SeqCst);
        self.set_state(SyncState::Error);
    }

    /// Periodic re-evaluation: an empty queue with no flags set settles
    /// back to `OK`; sticky flags are cleared so the next tick is clean.
    pub fn tick(&self) {
        let pending = self.pending.lock().len();
        if pending > 0 {
            self.set_state(SyncState::Pending);
            return;
        }

        if self.error_flag.swap(false, Ordering::SeqCst) {
            self.set_state(SyncState::Error);
            return;
        }
        if self.conflict_flag.swap(false, Ordering::SeqCst) {
            self.set_state(SyncState::Conflict);
            return;
        }
        self.set_state(SyncState::Ok);
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            state: self.state(),
            pending: self.pending.lock().len(),
            conflicts_total: self.conflicts_total.load(Ordering::Relaxed),
            broadcast_total: self.broadcast_total.load(Ordering::Relaxed),
        }
    }

    /// State re-evaluation timer (default 5 s in the node config).
    pub fn spawn_ticker(
        self: &Arc<Self>,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.tick();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
