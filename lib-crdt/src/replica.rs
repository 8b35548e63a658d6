//! The CRDT replica
//!
//! A keyed map under eventually-consistent semantics. Concurrent writes are
//! resolved deterministically: the higher originator Lamport component wins,
//! ties go to the lexicographically smaller node identity. Deletes leave
//! tombstones that a periodic GC reaps once they outlive the policy window.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{CausalOrdering, LamportClock, VectorClock};
use crate::error::CrdtError;
use crate::identity::NodeId;
use crate::operation::{OpKind, Operation};
use crate::now_millis;

/// Value stored at a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtEntry {
    /// Opaque payload; `None` when tombstoned.
    pub value: Option<Value>,
    /// Vector clock at last write.
    pub vector_clock: VectorClock,
    pub tombstone: bool,
    /// Wall-clock millis of the operation that last won conflict resolution.
    pub last_modified: u64,
    /// Identity of the last winning writer.
    pub modified_by: NodeId,
}

impl CrdtEntry {
    fn writer_lamport(&self) -> u64 {
        self.vector_clock.get(&self.modified_by)
    }
}

/// Replica limits, from the `crdt.*` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Operation-log cap; oldest entries are evicted first.
    pub max_operations: usize,
    /// How long a tombstone must survive before GC may reap it.
    pub tombstone_lifetime_ms: u64,
    /// Cadence of the background GC task.
    pub garbage_collection_interval_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000,
            tombstone_lifetime_ms: 24 * 60 * 60 * 1_000,
            garbage_collection_interval_ms: 60_000,
        }
    }
}

/// Outcome of a `merge` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Operations newly applied to the map and log.
    pub applied: usize,
    /// Operations skipped because their hash was already in the log.
    pub duplicates: usize,
    /// Operations dropped for hash mismatch.
    pub rejected: usize,
    /// Applied or discarded operations that were concurrent with a
    /// pre-existing entry at the same key.
    pub conflicts: usize,
}

/// Deep-copy view of the replica, also the serialization form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub node_id: NodeId,
    pub data: BTreeMap<String, CrdtEntry>,
    pub log: Vec<Operation>,
    pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStats {
    pub keys: usize,
    pub tombstones: usize,
    pub log_len: usize,
    pub lamport: u64,
    pub rejected_total: u64,
}

#[derive(Debug, Default)]
struct ReplicaState {
    data: HashMap<String, CrdtEntry>,
    log: VecDeque<Operation>,
    log_hashes: HashSet<String>,
    vector_clock: VectorClock,
}

/// The replica itself. Interior `RwLock` per the single-writer-lock policy:
/// mutations take the write lock, `get`/`snapshot`/`changes_since` read.
pub struct CrdtReplica {
    node_id: NodeId,
    lamport: LamportClock,
    state: RwLock<ReplicaState>,
    config: ReplicaConfig,
    rejected_total: AtomicU64,
}

impl CrdtReplica {
    pub fn new(node_id: NodeId, config: ReplicaConfig) -> Self {
        Self {
            node_id,
            lamport: LamportClock::default(),
            state: RwLock::new(ReplicaState::default()),
            config,
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Current value of the local vector clock, by copy.
    pub fn current_vector_clock(&self) -> VectorClock {
        self.state.read().vector_clock.clone()
    }

    /// Write a value. Emits the operation for the sync layer to broadcast.
    pub fn set(&self, key: &str, value: Value) -> Result<Operation, CrdtError> {
        self.local_op(key, OpKind::Set, Some(value))
    }

    /// Delete a key, leaving a tombstone. Emits the delete operation.
    pub fn delete(&self, key: &str) -> Result<Operation, CrdtError> {
        self.local_op(key, OpKind::Delete, None)
    }

    fn local_op(&self, key: &str, kind: OpKind, value: Option<Value>) -> Result<Operation, CrdtError> {
        if self.config.max_operations == 0 {
            return Err(CrdtError::LogOverflow { max: 0 });
        }

        let mut state = self.state.write();
        let lamport = self.lamport.tick();
        state.vector_clock.set(self.node_id.clone(), lamport);

        let op = Operation::new(
            self.node_id.clone(),
            now_millis(),
            lamport,
            kind,
            key.to_string(),
            value,
            state.vector_clock.clone(),
        );

        Self::apply_operation(&mut state, &op);
        Self::append_to_log(&mut state, op.clone(), self.config.max_operations);
        Ok(op)
    }

    /// Current value at `key`, or `None` if absent or tombstoned.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.state.read();
        state
            .data
            .get(key)
            .filter(|entry| !entry.tombstone)
            .and_then(|entry| entry.value.clone())
    }

    /// Merge remote operations. Tampered entries are dropped and counted;
    /// they never abort the merge. Idempotent by hash.
    pub fn merge(&self, ops: &[Operation]) -> MergeReport {
        let mut report = MergeReport::default();
        let mut state = self.state.write();

        for op in ops {
            if !op.verify_hash() {
                warn!(key = %op.key, origin = %op.node_id, "dropping operation with invalid hash");
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                report.rejected += 1;
                continue;
            }
            if state.log_hashes.contains(&op.hash) {
                report.duplicates += 1;
                continue;
            }

            if let Some(existing) = state.data.get(&op.key) {
                if op.vector_clock.compare(&existing.vector_clock) == CausalOrdering::Concurrent {
                    report.conflicts += 1;
                }
            }

            Self::apply_operation(&mut state, op);
            Self::append_to_log(&mut state, op.clone(), self.config.max_operations);
            report.applied += 1;

            let own = state.vector_clock.get(&self.node_id);
            self.lamport.observe(own);
        }

        debug!(
            applied = report.applied,
            duplicates = report.duplicates,
            rejected = report.rejected,
            conflicts = report.conflicts,
            "merge complete"
        );
        report
    }

    /// Apply a single verified operation. Step one merges the clocks; step
    /// two resolves against the current entry; step three stamps the winner.
    fn apply_operation(state: &mut ReplicaState, op: &Operation) {
        state.vector_clock.merge_max(&op.vector_clock);

        let wins = match state.data.get(&op.key) {
            None => true,
            Some(existing) => match op.vector_clock.compare(&existing.vector_clock) {
                CausalOrdering::After => true,
                CausalOrdering::Before | CausalOrdering::Equal => false,
                CausalOrdering::Concurrent => {
                    let (op_lamport, entry_lamport) = (op.writer_lamport(), existing.writer_lamport());
                    if op_lamport != entry_lamport {
                        op_lamport > entry_lamport
                    } else {
                        op.node_id < existing.modified_by
                    }
                }
            },
        };

        if !wins {
            return;
        }

        let entry = CrdtEntry {
            value: match op.kind {
                OpKind::Set => op.value.clone(),
                OpKind::Delete => None,
            },
            vector_clock: op.vector_clock.clone(),
            tombstone: op.kind == OpKind::Delete,
            last_modified: op.timestamp,
            modified_by: op.node_id.clone(),
        };
        state.data.insert(op.key.clone(), entry);
    }

    fn append_to_log(state: &mut ReplicaState, op: Operation, max_operations: usize) {
        state.log_hashes.insert(op.hash.clone());
        state.log.push_back(op);
        while state.log.len() > max_operations {
            if let Some(evicted) = state.log.pop_front() {
                state.log_hashes.remove(&evicted.hash);
            }
        }
    }

    /// Every logged operation not strictly before `since`: the incremental
    /// sync feed.
    pub fn changes_since(&self, since: &VectorClock) -> Vec<Operation> {
        let state = self.state.read();
        state
            .log
            .iter()
            .filter(|op| {
                matches!(
                    since.compare(&op.vector_clock),
                    CausalOrdering::Before | CausalOrdering::Concurrent
                )
            })
            .cloned()
            .collect()
    }

    /// Deep copy of map, log, and vector clock.
    pub fn snapshot(&self) -> ReplicaSnapshot {
        let state = self.state.read();
        ReplicaSnapshot {
            node_id: self.node_id.clone(),
            data: state.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            log: state.log.iter().cloned().collect(),
            vector_clock: state.vector_clock.clone(),
        }
    }

    pub fn serialize(&self) -> Result<String, CrdtError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Restore a replica from its serialized form. The Lamport counter is
    /// restored to the own-node component of the loaded vector clock.
    pub fn deserialize(serialized: &str, config: ReplicaConfig) -> Result<Self, CrdtError> {
        let snapshot: ReplicaSnapshot = serde_json::from_str(serialized)?;
        let replica = Self::new(snapshot.node_id.clone(), config);
        {
            let mut state = replica.state.write();
            state.log_hashes = snapshot.log.iter().map(|op| op.hash.clone()).collect();
            state.log = snapshot.log.into();
            state.data = snapshot.data.into_iter().collect();
            state.vector_clock = snapshot.vector_clock;
            replica.lamport.observe(state.vector_clock.get(&snapshot.node_id));
        }
        Ok(replica)
    }

    /// Reap tombstones older than the policy window. Returns reaped count.
    pub fn garbage_collect(&self, now_ms: u64) -> usize {
        let lifetime = self.config.tombstone_lifetime_ms;
        let mut state = self.state.write();
        let before = state.data.len();
        state
            .data
            .retain(|_, entry| !(entry.tombstone && now_ms.saturating_sub(entry.last_modified) > lifetime));
        let reaped = before - state.data.len();
        if reaped > 0 {
            info!(reaped, "tombstone garbage collection");
        }
        reaped
    }

    pub fn stats(&self) -> ReplicaStats {
        let state = self.state.read();
        ReplicaStats {
            keys: state.data.values().filter(|e| !e.tombstone).count(),
            tombstones: state.data.values().filter(|e| e.tombstone).count(),
            log_len: state.log.len(),
            lamport: self.lamport.current(),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }

    /// Background tombstone GC on the configured cadence. Stops when the
    /// shutdown signal flips.
    pub fn spawn_gc(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let replica = Arc::clone(self);
        let interval = Duration::from_millis(replica.config.garbage_collection_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        replica.garbage_collect(now_millis());
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

impl std::fmt::Debug for CrdtReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtReplica")
            .field("node_id", &self.node_id)
            .field("lamport", &self.lamport.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(c: char) -> NodeId {
        NodeId::normalize(&c.to_string().repeat(64)).unwrap()
    }

    fn replica(c: char) -> CrdtReplica {
        CrdtReplica::new(node(c), ReplicaConfig::default())
    }

    #[test]
    fn set_then_get() {
        let r = replica('a');
        r.set("k", json!("v")).unwrap();
        assert_eq!(r.get("k"), Some(json!("v")));
    }

    #[test]
    fn delete_tombstones_the_key() {
        let r = replica('a');
        r.set("k", json!("v")).unwrap();
        r.delete("k").unwrap();
        assert_eq!(r.get("k"), None);
        assert_eq!(r.stats().tombstones, 1);
    }

    #[test]
    fn concurrent_write_tie_break_prefers_smaller_node_id() {
        // Equal Lamport counters on both sides; "aaa..." is lexicographically
        // smaller than "bbb...", so its write must win on both replicas.
        let ra = replica('a');
        let rb = replica('b');

        let op_a = ra.set("k", json!("A")).unwrap();
        let op_b = rb.set("k", json!("B")).unwrap();
        assert_eq!(op_a.lamport_clock, 1);
        assert_eq!(op_b.lamport_clock, 1);

        ra.merge(&[op_b.clone()]);
        rb.merge(&[op_a.clone()]);

        assert_eq!(ra.get("k"), Some(json!("A")));
        assert_eq!(rb.get("k"), Some(json!("A")));
    }

    #[test]
    fn concurrent_write_tie_break_prefers_higher_lamport() {
        let ra = replica('a');
        let rb = replica('b');

        // b ends up at Lamport 2 for its write of "k"
        rb.set("warmup", json!(0)).unwrap();
        let op_a = ra.set("k", json!("A")).unwrap();
        let op_b = rb.set("k", json!("B")).unwrap();
        assert_eq!(op_b.lamport_clock, 2);

        ra.merge(&[op_b.clone()]);
        rb.merge(&[op_a.clone()]);

        assert_eq!(ra.get("k"), Some(json!("B")));
        assert_eq!(rb.get("k"), Some(json!("B")));
    }

    #[test]
    fn causal_delete_survives_reordering() {
        // Node X sets then deletes; node Y sees the delete first. The late
        // set must not resurrect the value.
        let rx = replica('a');
        let ry = replica('b');

        let set_op = rx.set("k", json!("v1")).unwrap();
        let del_op = rx.delete("k").unwrap();

        ry.merge(&[del_op]);
        ry.merge(&[set_op]);

        assert_eq!(ry.get("k"), None);
        let snapshot = ry.snapshot();
        assert!(snapshot.data.get("k").unwrap().tombstone);
    }

    #[test]
    fn tampered_operation_is_dropped_and_log_unchanged() {
        let ra = replica('a');
        let rb = replica('b');

        let mut op = ra.set("k", json!("honest")).unwrap();
        op.value = Some(json!("forged"));

        let report = rb.merge(&[op]);
        assert_eq!(report.applied, 0);
        assert_eq!(report.rejected, 1);
        assert_eq!(rb.get("k"), None);
        assert_eq!(rb.stats().log_len, 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let ra = replica('a');
        let rb = replica('b');

        let ops = vec![
            ra.set("k1", json!(1)).unwrap(),
            ra.set("k2", json!(2)).unwrap(),
        ];

        let first = rb.merge(&ops);
        let after_first = rb.snapshot();
        let second = rb.merge(&ops);
        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(rb.snapshot().data, after_first.data);
        assert_eq!(rb.snapshot().vector_clock, after_first.vector_clock);
    }

    #[test]
    fn replicas_converge_regardless_of_order() {
        let ra = replica('a');
        let rb = replica('b');
        let rc = replica('c');

        let mut ops = vec![
            ra.set("x", json!(1)).unwrap(),
            ra.set("y", json!(2)).unwrap(),
            ra.delete("x").unwrap(),
        ];

        rb.merge(&ops);
        ops.reverse();
        rc.merge(&ops);

        assert_eq!(rb.snapshot().data, rc.snapshot().data);
    }

    #[test]
    fn changes_since_returns_unseen_operations() {
        let ra = replica('a');
        let before = ra.current_vector_clock();

        ra.set("k1", json!(1)).unwrap();
        ra.set("k2", json!(2)).unwrap();
        let mid = ra.current_vector_clock();
        ra.set("k3", json!(3)).unwrap();

        assert_eq!(ra.changes_since(&before).len(), 3);
        assert_eq!(ra.changes_since(&mid).len(), 1);
        assert!(ra.changes_since(&ra.current_vector_clock()).is_empty());
    }

    #[test]
    fn log_truncates_oldest_first() {
        let config = ReplicaConfig {
            max_operations: 2,
            ..Default::default()
        };
        let r = CrdtReplica::new(node('a'), config);
        r.set("k1", json!(1)).unwrap();
        r.set("k2", json!(2)).unwrap();
        r.set("k3", json!(3)).unwrap();

        let log = r.snapshot().log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].key, "k2");
        assert_eq!(log[1].key, "k3");
    }

    #[test]
    fn zero_capacity_log_overflows() {
        let config = ReplicaConfig {
            max_operations: 0,
            ..Default::default()
        };
        let r = CrdtReplica::new(node('a'), config);
        assert!(matches!(
            r.set("k", json!(1)),
            Err(CrdtError::LogOverflow { .. })
        ));
    }

    #[test]
    fn gc_respects_tombstone_lifetime() {
        let config = ReplicaConfig {
            tombstone_lifetime_ms: 10_000,
            ..Default::default()
        };
        let r = CrdtReplica::new(node('a'), config);
        r.set("k", json!("v")).unwrap();
        let del = r.delete("k").unwrap();

        // Too young to reap
        assert_eq!(r.garbage_collect(del.timestamp + 5_000), 0);
        assert_eq!(r.stats().tombstones, 1);

        // Past the window
        assert_eq!(r.garbage_collect(del.timestamp + 10_001), 1);
        assert_eq!(r.stats().tombstones, 0);
    }

    #[test]
    fn serialize_roundtrip_restores_lamport_counter() {
        let r = replica('a');
        r.set("k1", json!(1)).unwrap();
        r.set("k2", json!(2)).unwrap();
        assert_eq!(r.stats().lamport, 2);

        let serialized = r.serialize().unwrap();
        let restored = CrdtReplica::deserialize(&serialized, ReplicaConfig::default()).unwrap();

        assert_eq!(restored.stats().lamport, 2);
        assert_eq!(restored.get("k1"), Some(json!(1)));
        assert_eq!(restored.snapshot().data, r.snapshot().data);

        // New writes continue past the restored counter
        let op = restored.set("k3", json!(3)).unwrap();
        assert_eq!(op.lamport_clock, 3);
    }

    #[test]
    fn causality_later_write_observed_after_both_merged() {
        let ra = replica('a');
        let rb = replica('b');

        let op1 = ra.set("k", json!("first")).unwrap();
        rb.merge(&[op1.clone()]);
        let op2 = rb.set("k", json!("second")).unwrap();

        // op2's clock dominates op1's; both orders converge on op2
        let rc = replica('c');
        rc.merge(&[op2.clone(), op1.clone()]);
        assert_eq!(rc.get("k"), Some(json!("second")));

        let rd = replica('d');
        rd.merge(&[op1, op2]);
        assert_eq!(rd.get("k"), Some(json!("second")));
    }
}
