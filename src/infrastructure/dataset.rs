use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::ContextConfig;
use crate::constraints::GraphState;
use crate::core::encoding::OperationEncoder;
use crate::core::gwc::Gwc;
use crate::core::operation::{CausalOperation, ReifiedTriple};
use crate::core::tree_clock::{Tid, TreeClock};
use crate::core::triples::{compact_subject, expand_subject, resolve_iri, Triple};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::journal::{Journal, JournalState};
use crate::infrastructure::kv_store::{KvBatch, KvStore};

const TRIPLE_PREFIX: &str = "triple:";
const TID_PREFIX: &str = "tid:";
const SPO_PREFIX: &str = "spo:";
const SNAPSHOT_BATCH_SIZE: usize = 100;

fn triple_key(hash: &str) -> String {
    format!("{}{}", TRIPLE_PREFIX, hash)
}

fn tid_index_key(tid: &Tid, hash: &str) -> String {
    format!("{}{}:{}", TID_PREFIX, tid, hash)
}

fn spo_key(subject: &str, hash: &str) -> String {
    format!("{}{}\u{0}{}", SPO_PREFIX, subject, hash)
}

fn spo_prefix(subject: &str) -> String {
    format!("{}{}\u{0}", SPO_PREFIX, subject)
}

/// A stored triple with the set of TIDs asserting it. The triple is visible
/// iff the set is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TripleRecord {
    triple: Triple,
    tids: Vec<Tid>,
}

/// A user write: patterns to delete and subjects to insert.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    pub delete: Vec<Value>,
    pub insert: Vec<Value>,
}

impl Patch {
    pub fn insert_subject(subject: Value) -> Self {
        Self {
            delete: vec![],
            insert: vec![subject],
        }
    }

    pub fn delete_subject(subject: Value) -> Self {
        Self {
            delete: vec![subject],
            insert: vec![],
        }
    }
}

/// A patch with its delete patterns resolved to concrete triples-with-TIDs
/// and its insert subjects expanded to triples.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPatch {
    pub deletes: Vec<(Triple, Vec<Tid>)>,
    pub inserts: Vec<Triple>,
}

impl ResolvedPatch {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}

/// The visible graph change produced by one committed operation, emitted to
/// update subscribers after the journal commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetUpdate {
    pub tid: Tid,
    pub deletes: Vec<Triple>,
    pub inserts: Vec<Triple>,
}

/// Snapshot payload: the producer's GWC and clock, reified triple batches,
/// and each live source's most recent operation (wire-encoded) so revving
/// peers can be served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub gwc: Gwc,
    pub batches: Vec<SnapshotBatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotBatch {
    Triples(Vec<ReifiedTriple>),
    Operation(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// The replicated graph store: a set-union CRDT of triples reified by the
/// TIDs asserting them. Applies local and remote operations so that all
/// clones of the domain converge.
pub struct SuSetDataset {
    store: Arc<dyn KvStore>,
    journal: Journal,
    encoder: OperationEncoder,
    ctx: ContextConfig,
    max_operation_size: Option<usize>,
}

impl SuSetDataset {
    pub fn new(
        store: Arc<dyn KvStore>,
        ctx: ContextConfig,
        max_operation_size: Option<usize>,
    ) -> Self {
        let encoder = OperationEncoder::new(ctx.clone());
        Self {
            journal: Journal::new(store.clone(), encoder.clone()),
            store,
            encoder,
            ctx,
            max_operation_size,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn encoder(&self) -> &OperationEncoder {
        &self.encoder
    }

    async fn record(&self, hash: &str) -> EngineResult<Option<TripleRecord>> {
        match self.store.get(&triple_key(hash)).await? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All visible triples with the given subject IRI.
    pub async fn subject_triples(&self, subject_iri: &str) -> EngineResult<Vec<Triple>> {
        let mut triples = Vec::new();
        for (key, _) in self.store.scan_prefix(&spo_prefix(subject_iri)).await? {
            let hash = key.rsplit('\u{0}').next().unwrap_or_default().to_string();
            if let Some(record) = self.record(&hash).await? {
                if !record.tids.is_empty() {
                    triples.push(record.triple);
                }
            }
        }
        Ok(triples)
    }

    /// Describe a subject as a compacted document; `None` when no triple
    /// with that subject is visible.
    pub async fn describe(&self, subject: &str) -> EngineResult<Option<Value>> {
        let iri = resolve_iri(subject, &self.ctx.base);
        let triples = self.subject_triples(&iri).await?;
        if triples.is_empty() {
            Ok(None)
        } else {
            Ok(Some(compact_subject(&iri, &triples, &self.ctx)))
        }
    }

    /// Resolve a user patch: delete patterns become concrete
    /// triples-with-TIDs against the current graph, insert subjects expand
    /// to triples. A delete subject with no properties deletes the whole
    /// subject.
    pub async fn resolve(&self, patch: &Patch) -> EngineResult<ResolvedPatch> {
        let mut deletes = Vec::new();
        for pattern in &patch.delete {
            let expanded = expand_subject(pattern, &self.ctx)?;
            if expanded.is_empty() {
                // Whole-subject delete
                let id = pattern
                    .get("@id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::BadUpdate("delete has no @id".to_string()))?;
                let iri = resolve_iri(id, &self.ctx.base);
                for triple in self.subject_triples(&iri).await? {
                    let record = self.record(&triple.hash()).await?;
                    if let Some(record) = record {
                        deletes.push((record.triple, record.tids));
                    }
                }
            } else {
                for triple in expanded {
                    if let Some(record) = self.record(&triple.hash()).await? {
                        if !record.tids.is_empty() {
                            deletes.push((record.triple, record.tids));
                        }
                    }
                }
            }
        }
        let mut inserts = Vec::new();
        for subject in &patch.insert {
            inserts.extend(expand_subject(subject, &self.ctx)?);
        }
        Ok(ResolvedPatch { deletes, inserts })
    }

    /// Commit a local transaction already stamped with the post-tick clock.
    /// Returns the published operation and the visible update. The store is
    /// left unchanged on any failure, including the operation size cap.
    pub async fn transact(
        &self,
        resolved: &ResolvedPatch,
        time: &TreeClock,
    ) -> EngineResult<(CausalOperation, DatasetUpdate)> {
        let tid = time.hash();
        let deletes: Vec<ReifiedTriple> = resolved
            .deletes
            .iter()
            .map(|(triple, tids)| ReifiedTriple {
                tids: tids.clone(),
                triple: triple.clone(),
            })
            .collect();
        let inserts: Vec<ReifiedTriple> = resolved
            .inserts
            .iter()
            .map(|triple| ReifiedTriple::new(triple.clone(), tid.clone()))
            .collect();
        let op = CausalOperation::new(time.clone(), deletes, inserts);

        if let Some(max) = self.max_operation_size {
            let size = self.encoder.encode(&op)?.len();
            if size > max {
                return Err(EngineError::OperationSizeExceeded { size, max });
            }
        }

        let (batch, update) = self.mutation_batch(&op).await?;
        self.journal.commit_with(&op, time, batch).await?;
        trace!(tid = %tid, "local transaction committed");
        Ok((op, update))
    }

    /// Apply a remote operation under the joined-and-ticked local clock.
    /// Returns `None` when the operation is already fully reflected (the
    /// clock join is still persisted). Fused operations overlapping already
    /// applied TIDs are stale-cut before application.
    pub async fn apply(
        &self,
        op: &CausalOperation,
        local_time: &TreeClock,
    ) -> EngineResult<Option<DatasetUpdate>> {
        let state = self.journal.state().await?;
        if state.gwc.is_reflected(&op.time) {
            debug!(tid = %op.tid(), "operation already reflected; joining time only");
            self.journal.update_time(local_time.clone()).await?;
            return Ok(None);
        }

        let op = self.stale_cut(&state, op).await?;
        if op.is_empty() {
            self.journal.update_time(local_time.clone()).await?;
            return Ok(None);
        }

        let (batch, update) = self.mutation_batch(&op).await?;
        self.journal.commit_with(&op, local_time, batch).await?;
        Ok(Some(update))
    }

    /// Withdraw any incoming insert reification whose TID the local store
    /// has already reflected: the prior operation recorded for the source
    /// carries every TID it has delivered us.
    async fn stale_cut(
        &self,
        state: &JournalState,
        op: &CausalOperation,
    ) -> EngineResult<CausalOperation> {
        if !op.is_fused() || op.from > state.gwc.get_ticks(&op.time) {
            return Ok(op.clone());
        }
        let mut seen: HashSet<Tid> = HashSet::new();
        if let Some((_, prior_tid)) = state.gwc.prev(&op.time) {
            seen.insert(prior_tid.clone());
            if let Some(prior) = self.journal.operation(&prior_tid).await? {
                seen.extend(prior.all_tids().into_iter().cloned());
            }
        }
        let cut = op.cut(|tid| seen.contains(tid));
        debug!(
            tid = %op.tid(),
            from = op.from,
            "stale-cut fused operation against seen TIDs"
        );
        Ok(cut)
    }

    /// Build the triple mutations for an operation: withdraw delete TIDs
    /// (dropping triples whose TID set empties), add insert TIDs (creating
    /// triples as needed). Returns the batch and the visible change.
    async fn mutation_batch(
        &self,
        op: &CausalOperation,
    ) -> EngineResult<(KvBatch, DatasetUpdate)> {
        let mut batch = KvBatch::new();
        let mut update = DatasetUpdate {
            tid: op.tid(),
            deletes: Vec::new(),
            inserts: Vec::new(),
        };

        for reified in &op.deletes {
            let hash = reified.triple.hash();
            let Some(mut record) = self.record(&hash).await? else {
                continue;
            };
            let before = record.tids.len();
            record.tids.retain(|tid| !reified.tids.contains(tid));
            if record.tids.len() == before {
                continue;
            }
            for tid in &reified.tids {
                batch.delete(tid_index_key(tid, &hash));
            }
            if record.tids.is_empty() {
                batch.delete(triple_key(&hash));
                batch.delete(spo_key(&record.triple.subject, &hash));
                update.deletes.push(record.triple);
            } else {
                batch.put(triple_key(&hash), rmp_serde::to_vec(&record)?);
            }
        }

        for reified in &op.inserts {
            let hash = reified.triple.hash();
            let mut record = self.record(&hash).await?.unwrap_or(TripleRecord {
                triple: reified.triple.clone(),
                tids: Vec::new(),
            });
            let was_visible = !record.tids.is_empty();
            let mut changed = false;
            for tid in &reified.tids {
                if !record.tids.contains(tid) {
                    record.tids.push(tid.clone());
                    batch.put(tid_index_key(tid, &hash), Vec::new());
                    changed = true;
                }
            }
            if !changed {
                continue;
            }
            batch.put(triple_key(&hash), rmp_serde::to_vec(&record)?);
            batch.put(spo_key(&record.triple.subject, &hash), Vec::new());
            if !was_visible {
                update.inserts.push(record.triple);
            }
        }

        Ok((batch, update))
    }

    /// Emit the current graph as a snapshot: the GWC, the reified triples
    /// in batches, and the most recent operation per live source.
    pub async fn take_snapshot(&self) -> EngineResult<SnapshotData> {
        let state = self.journal.state().await?;
        let mut batches = Vec::new();
        let mut current = Vec::new();
        for (_, bytes) in self.store.scan_prefix(TRIPLE_PREFIX).await? {
            let record: TripleRecord = rmp_serde::from_slice(&bytes)?;
            if record.tids.is_empty() {
                continue;
            }
            current.push(ReifiedTriple {
                tids: record.tids,
                triple: record.triple,
            });
            if current.len() == SNAPSHOT_BATCH_SIZE {
                batches.push(SnapshotBatch::Triples(std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            batches.push(SnapshotBatch::Triples(current));
        }
        for (_, _, tid) in state.gwc.entries() {
            if let Some(op) = self.journal.operation(tid).await? {
                batches.push(SnapshotBatch::Operation(self.encoder.encode(&op)?));
            }
        }
        Ok(SnapshotData {
            gwc: state.gwc,
            batches,
        })
    }

    /// Replace the local graph and journal from a snapshot, under the new
    /// forked local clock.
    pub async fn apply_snapshot(
        &self,
        snapshot: SnapshotData,
        new_local_time: TreeClock,
    ) -> EngineResult<()> {
        self.journal
            .init(new_local_time, snapshot.gwc.clone())
            .await?;
        let mut batch = KvBatch::new();
        for b in &snapshot.batches {
            match b {
                SnapshotBatch::Triples(triples) => {
                    for reified in triples {
                        let hash = reified.triple.hash();
                        let record = TripleRecord {
                            triple: reified.triple.clone(),
                            tids: reified.tids.clone(),
                        };
                        batch.put(triple_key(&hash), rmp_serde::to_vec(&record)?);
                        batch.put(spo_key(&record.triple.subject, &hash), Vec::new());
                        for tid in &reified.tids {
                            batch.put(tid_index_key(tid, &hash), Vec::new());
                        }
                    }
                }
                SnapshotBatch::Operation(bytes) => {
                    let op = self.encoder.decode(bytes)?;
                    self.journal.seed_operation(&op).await?;
                }
            }
        }
        self.store.commit(batch).await?;
        debug!("snapshot applied");
        Ok(())
    }

    /// Journal entries after `time` that are not dominated by it, fused
    /// along contiguous same-source runs. `None` iff `time` precedes the
    /// journal start, in which case the peer must take a snapshot instead.
    pub async fn operations_since(
        &self,
        time: &TreeClock,
    ) -> EngineResult<Option<Vec<CausalOperation>>> {
        let state = self.journal.state().await?;
        if state.start_gwc.any_ticks_gt(time) {
            return Ok(None);
        }
        let mut out: Vec<CausalOperation> = Vec::new();
        let mut tick = 0;
        while let Some(entry) = self.journal.entry_after(tick).await? {
            tick = entry.tick;
            let op = self.journal.operation_required(&entry.tid).await?;
            if !op.time.any_gt(time) {
                continue;
            }
            // Contiguous with the previously yielded op from the same
            // source: fold into one
            if let Some(last) = out.last_mut() {
                if last.time.process_path() == op.time.process_path()
                    && op.from == last.time.ticks() + 1
                {
                    *last = last.fuse(&op);
                    continue;
                }
            }
            out.push(op);
        }
        Ok(Some(out))
    }
}

#[async_trait]
impl GraphState for SuSetDataset {
    async fn read_subject(&self, iri: &str) -> EngineResult<Vec<Triple>> {
        self.subject_triples(iri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::kv_store::MemoryStore;
    use serde_json::json;

    fn dataset() -> SuSetDataset {
        SuSetDataset::new(
            Arc::new(MemoryStore::new()),
            ContextConfig::for_domain("test.example.org"),
            None,
        )
    }

    async fn genesis_dataset() -> (SuSetDataset, TreeClock) {
        let ds = dataset();
        let time = TreeClock::genesis();
        ds.journal().init(time.clone(), Gwc::new()).await.unwrap();
        (ds, time)
    }

    #[tokio::test]
    async fn insert_then_describe() {
        let (ds, time) = genesis_dataset().await;
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "fred", "name": "Fred" })))
            .await
            .unwrap();
        let (op, update) = ds.transact(&resolved, &t1).await.unwrap();
        assert_eq!(op.from, 1);
        assert_eq!(update.inserts.len(), 1);

        let doc = ds.describe("fred").await.unwrap().unwrap();
        assert_eq!(doc, json!({ "@id": "fred", "name": "Fred" }));
    }

    #[tokio::test]
    async fn delete_removes_visibility() {
        let (ds, time) = genesis_dataset().await;
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "fred", "name": "Fred" })))
            .await
            .unwrap();
        ds.transact(&resolved, &t1).await.unwrap();

        let t2 = t1.ticked();
        let resolved = ds
            .resolve(&Patch::delete_subject(json!({ "@id": "fred" })))
            .await
            .unwrap();
        assert_eq!(resolved.deletes.len(), 1);
        let (op, update) = ds.transact(&resolved, &t2).await.unwrap();
        // The delete reifies the withdrawn TID
        assert_eq!(op.deletes[0].tids, vec![t1.hash()]);
        assert_eq!(update.deletes.len(), 1);
        assert!(ds.describe("fred").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_remote_insert() {
        let (ds, time) = genesis_dataset().await;
        let (local, remote) = time.forked();
        let r1 = remote.ticked();
        let triple = Triple::new(
            "http://test.example.org/fred",
            "http://test.example.org/#name",
            crate::core::triples::Term::literal("Fred"),
        );
        let op = CausalOperation::new(
            r1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple, r1.hash())],
        );
        let local_time = local.update(&r1).ticked();
        let update = ds.apply(&op, &local_time).await.unwrap().unwrap();
        assert_eq!(update.inserts.len(), 1);
        assert!(ds.describe("fred").await.unwrap().is_some());

        // Re-applying is a duplicate: no update, time persisted
        let local_time = local_time.ticked();
        assert!(ds.apply(&op, &local_time).await.unwrap().is_none());
        assert_eq!(
            ds.journal().state().await.unwrap().time.ticks(),
            local_time.ticks()
        );
    }

    #[tokio::test]
    async fn remote_delete_by_tid() {
        let (ds, time) = genesis_dataset().await;
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "fred", "name": "Fred" })))
            .await
            .unwrap();
        let (op, _) = ds.transact(&resolved, &t1).await.unwrap();

        // A remote clone deletes citing our TID
        let (local, remote) = t1.forked();
        let r1 = remote.ticked();
        let delete = CausalOperation::new(
            r1.clone(),
            vec![ReifiedTriple {
                tids: vec![op.tid()],
                triple: op.inserts[0].triple.clone(),
            }],
            vec![],
        );
        let local_time = local.update(&r1).ticked();
        let update = ds.apply(&delete, &local_time).await.unwrap().unwrap();
        assert_eq!(update.deletes.len(), 1);
        assert!(ds.describe("fred").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_cut_on_fusion() {
        // A single-TID insert of wilma, then wilma deleted by TID, then a
        // fusion from the original source covering the seen insert plus a
        // new one: the seen insert must not resurrect.
        let (ds, time) = genesis_dataset().await;
        let (local, source) = time.forked();
        let wilma = Triple::new(
            "http://test.example.org/wilma",
            "http://test.example.org/#name",
            crate::core::triples::Term::literal("Wilma"),
        );
        let barney = Triple::new(
            "http://test.example.org/barney",
            "http://test.example.org/#name",
            crate::core::triples::Term::literal("Barney"),
        );

        let s1 = source.ticked();
        let w1 = s1.hash();
        let insert_wilma =
            CausalOperation::new(s1.clone(), vec![], vec![ReifiedTriple::new(wilma.clone(), w1.clone())]);
        let local = {
            let t = local.update(&s1).ticked();
            ds.apply(&insert_wilma, &t).await.unwrap();
            t
        };

        // Third clone deletes wilma using W1
        let (local, third) = local.forked();
        let c1 = third.update(&s1).ticked();
        let delete_wilma = CausalOperation::new(
            c1.clone(),
            vec![ReifiedTriple {
                tids: vec![w1.clone()],
                triple: wilma.clone(),
            }],
            vec![],
        );
        let local = {
            let t = local.update(&c1).ticked();
            ds.apply(&delete_wilma, &t).await.unwrap();
            t
        };
        assert!(ds.describe("wilma").await.unwrap().is_none());

        // The source now sends a fusion covering W1 plus a new tick
        let s2 = s1.ticked();
        let fused = insert_wilma.fuse(&CausalOperation::new(
            s2.clone(),
            vec![],
            vec![ReifiedTriple::new(barney.clone(), s2.hash())],
        ));
        assert_eq!(fused.from, 1);
        let t = local.update(&s2).ticked();
        let update = ds.apply(&fused, &t).await.unwrap().unwrap();

        assert!(ds.describe("wilma").await.unwrap().is_none());
        assert!(ds.describe("barney").await.unwrap().is_some());
        assert_eq!(update.inserts, vec![barney]);
    }

    #[tokio::test]
    async fn concurrent_insert_same_triple_survives_one_delete() {
        // Two sources assert the same triple under different TIDs; deleting
        // one TID leaves the triple visible.
        let (ds, time) = genesis_dataset().await;
        let (local, rest) = time.forked();
        let (a, b) = rest.forked();
        let triple = Triple::new(
            "http://test.example.org/fred",
            "http://test.example.org/#name",
            crate::core::triples::Term::literal("Fred"),
        );

        let a1 = a.ticked();
        let b1 = b.ticked();
        let op_a = CausalOperation::new(a1.clone(), vec![], vec![ReifiedTriple::new(triple.clone(), a1.hash())]);
        let op_b = CausalOperation::new(b1.clone(), vec![], vec![ReifiedTriple::new(triple.clone(), b1.hash())]);

        let t = local.update(&a1).ticked();
        ds.apply(&op_a, &t).await.unwrap();
        let t = t.update(&b1).ticked();
        ds.apply(&op_b, &t).await.unwrap();

        // Withdraw only a's TID
        let (t, c) = t.forked();
        let c1 = c.ticked();
        let delete_a = CausalOperation::new(
            c1.clone(),
            vec![ReifiedTriple {
                tids: vec![a1.hash()],
                triple: triple.clone(),
            }],
            vec![],
        );
        let t = t.update(&c1).ticked();
        ds.apply(&delete_a, &t).await.unwrap();
        assert!(ds.describe("fred").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delivery_order_does_not_change_the_graph() {
        // Three concurrent operations applied in two different orders
        // consistent with happened-before must leave identical graphs.
        let base = TreeClock::genesis();
        let (obs1_clock, rest) = base.forked();
        let (obs2_clock, rest) = rest.forked();
        let (a, b) = rest.forked();

        let a1 = a.ticked();
        let b1 = b.ticked();
        let b2 = b1.ticked();
        let mk = |name: &str, time: &TreeClock| {
            CausalOperation::new(
                time.clone(),
                vec![],
                vec![ReifiedTriple::new(
                    Triple::new(
                        format!("http://test.example.org/{}", name),
                        "http://test.example.org/#name",
                        crate::core::triples::Term::literal(name),
                    ),
                    time.hash(),
                )],
            )
        };
        let ops = [mk("fred", &a1), mk("wilma", &b1), mk("barney", &b2)];

        let obs1 = dataset();
        obs1.journal().init(obs1_clock.clone(), Gwc::new()).await.unwrap();
        let mut t = obs1_clock;
        for op in [&ops[0], &ops[1], &ops[2]] {
            t = t.update(&op.time).ticked();
            obs1.apply(op, &t).await.unwrap();
        }

        let obs2 = dataset();
        obs2.journal().init(obs2_clock.clone(), Gwc::new()).await.unwrap();
        let mut t = obs2_clock;
        // b's chain first, then a's concurrent op
        for op in [&ops[1], &ops[2], &ops[0]] {
            t = t.update(&op.time).ticked();
            obs2.apply(op, &t).await.unwrap();
        }

        for subject in ["fred", "wilma", "barney"] {
            assert_eq!(
                obs1.describe(subject).await.unwrap(),
                obs2.describe(subject).await.unwrap(),
                "graphs diverged at {}",
                subject
            );
        }
    }

    #[tokio::test]
    async fn empty_patch_resolves_empty() {
        let (ds, _) = genesis_dataset().await;
        let resolved = ds.resolve(&Patch::default()).await.unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn operation_size_cap() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ds = SuSetDataset::new(
            store,
            ContextConfig::for_domain("test.example.org"),
            Some(64),
        );
        let time = TreeClock::genesis();
        ds.journal().init(time.clone(), Gwc::new()).await.unwrap();
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(
                json!({ "@id": "fred", "name": "a long enough value to blow the configured cap" }),
            ))
            .await
            .unwrap();
        assert!(matches!(
            ds.transact(&resolved, &t1).await,
            Err(EngineError::OperationSizeExceeded { .. })
        ));
        // Store unchanged
        assert!(ds.describe("fred").await.unwrap().is_none());
        assert_eq!(ds.journal().state().await.unwrap().tail_tick, 0);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_yields_equal_graph() {
        let (ds, time) = genesis_dataset().await;
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "fred", "name": "Fred" })))
            .await
            .unwrap();
        ds.transact(&resolved, &t1).await.unwrap();
        let t2 = t1.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "wilma", "name": "Wilma" })))
            .await
            .unwrap();
        ds.transact(&resolved, &t2).await.unwrap();

        let snapshot = ds.take_snapshot().await.unwrap();
        let other = dataset();
        let (_, forked) = t2.forked();
        other.apply_snapshot(snapshot, forked).await.unwrap();

        for subject in ["fred", "wilma"] {
            assert_eq!(
                other.describe(subject).await.unwrap(),
                ds.describe(subject).await.unwrap(),
                "{} differs after snapshot",
                subject
            );
        }
    }

    #[tokio::test]
    async fn operations_since_fuses_contiguous_runs() {
        let (ds, time) = genesis_dataset().await;
        let (local, peer) = time.forked();
        let fork_time = peer.clone();

        let mut t = local;
        for name in ["fred", "wilma"] {
            t = t.ticked();
            let resolved = ds
                .resolve(&Patch::insert_subject(json!({ "@id": name, "name": name })))
                .await
                .unwrap();
            ds.transact(&resolved, &t).await.unwrap();
        }

        let ops = ds.operations_since(&fork_time).await.unwrap().unwrap();
        // Two local writes were contiguous: served as one fused operation
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].from, 1);
        assert_eq!(ops[0].time.ticks(), 2);
    }

    #[tokio::test]
    async fn operations_since_refuses_pre_start_times() {
        let (ds, time) = genesis_dataset().await;
        let t1 = time.ticked();
        let resolved = ds
            .resolve(&Patch::insert_subject(json!({ "@id": "fred", "name": "Fred" })))
            .await
            .unwrap();
        ds.transact(&resolved, &t1).await.unwrap();

        // A dataset started from this snapshot cannot serve a peer from
        // before the snapshot point
        let snapshot = ds.take_snapshot().await.unwrap();
        let (keep, given) = t1.forked();
        let other = dataset();
        other.apply_snapshot(snapshot, given).await.unwrap();

        let (_, stale) = TreeClock::genesis().forked();
        assert!(other.operations_since(&stale).await.unwrap().is_none());
        // But a peer at the snapshot point is servable
        assert!(other.operations_since(&keep).await.unwrap().is_some());
    }
}
