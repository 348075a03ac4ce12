use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::messages::TimedMessage;
use crate::core::tree_clock::{Tid, TreeClock};
use crate::core::triples::{Term, Triple};

pub const OPERATION_VERSION: u8 = 2;

/// A triple together with the transaction ids asserting (or withdrawing) it.
/// Serialised through [`ReifiedTripleWire`], whose field count is known up
/// front, so the same shape works for JSON and msgpack alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReifiedTripleWire", into = "ReifiedTripleWire")]
pub struct ReifiedTriple {
    pub tids: Vec<Tid>,
    pub triple: Triple,
}

/// Wire shape of a reification: `{tids, s, p, o}`.
#[derive(Serialize, Deserialize)]
struct ReifiedTripleWire {
    tids: Vec<Tid>,
    s: String,
    p: String,
    o: Term,
}

impl From<ReifiedTripleWire> for ReifiedTriple {
    fn from(wire: ReifiedTripleWire) -> Self {
        Self {
            tids: wire.tids,
            triple: Triple::new(wire.s, wire.p, wire.o),
        }
    }
}

impl From<ReifiedTriple> for ReifiedTripleWire {
    fn from(reified: ReifiedTriple) -> Self {
        Self {
            tids: reified.tids,
            s: reified.triple.subject,
            p: reified.triple.predicate,
            o: reified.triple.object,
        }
    }
}

impl ReifiedTriple {
    pub fn new(triple: Triple, tid: Tid) -> Self {
        Self {
            tids: vec![tid],
            triple,
        }
    }
}

/// A replicated graph operation: the unit of exchange between clones.
///
/// `from` is the first source tick the operation covers; it equals
/// `time.ticks()` for a single transaction and is lower for a fusion of
/// contiguous transactions from the same source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalOperation {
    pub version: u8,
    pub from: u64,
    pub time: TreeClock,
    pub deletes: Vec<ReifiedTriple>,
    pub inserts: Vec<ReifiedTriple>,
}

impl CausalOperation {
    pub fn new(
        time: TreeClock,
        deletes: Vec<ReifiedTriple>,
        inserts: Vec<ReifiedTriple>,
    ) -> Self {
        Self {
            version: OPERATION_VERSION,
            from: time.ticks(),
            time,
            deletes,
            inserts,
        }
    }

    /// The operation's transaction identity.
    pub fn tid(&self) -> Tid {
        self.time.hash()
    }

    pub fn is_fused(&self) -> bool {
        self.from < self.time.ticks()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }

    /// Fuse this operation with its causal successor from the same source.
    /// The caller is responsible for contiguity
    /// (`next.from == self.time.ticks() + 1`, same process).
    ///
    /// An insert of this operation that `next` deletes cancels out on both
    /// sides, so the fusion carries exactly the net effect while exposing
    /// every surviving constituent TID.
    pub fn fuse(&self, next: &CausalOperation) -> CausalOperation {
        let next_deletes: HashSet<(String, &Tid)> = next
            .deletes
            .iter()
            .flat_map(|d| {
                let hash = d.triple.hash();
                d.tids.iter().map(move |tid| (hash.clone(), tid))
            })
            .collect();
        let self_inserts: HashSet<(String, &Tid)> = self
            .inserts
            .iter()
            .flat_map(|i| {
                let hash = i.triple.hash();
                i.tids.iter().map(move |tid| (hash.clone(), tid))
            })
            .collect();

        let mut inserts: Vec<ReifiedTriple> = self
            .inserts
            .iter()
            .filter_map(|i| {
                let hash = i.triple.hash();
                let tids: Vec<Tid> = i
                    .tids
                    .iter()
                    .filter(|tid| !next_deletes.contains(&(hash.clone(), *tid)))
                    .cloned()
                    .collect();
                (!tids.is_empty()).then(|| ReifiedTriple {
                    tids,
                    triple: i.triple.clone(),
                })
            })
            .collect();
        inserts.extend(next.inserts.iter().cloned());

        let mut deletes: Vec<ReifiedTriple> = self.deletes.clone();
        deletes.extend(next.deletes.iter().filter_map(|d| {
            let hash = d.triple.hash();
            let tids: Vec<Tid> = d
                .tids
                .iter()
                .filter(|tid| !self_inserts.contains(&(hash.clone(), *tid)))
                .cloned()
                .collect();
            (!tids.is_empty()).then(|| ReifiedTriple {
                tids,
                triple: d.triple.clone(),
            })
        }));

        CausalOperation {
            version: OPERATION_VERSION,
            from: self.from,
            time: next.time.clone(),
            deletes,
            inserts,
        }
    }

    /// Stale-cut: remove from the inserts every reification whose TID the
    /// receiver has already reflected. Deletes are kept whole; withdrawing
    /// an absent TID is a no-op at the store.
    pub fn cut(&self, seen: impl Fn(&Tid) -> bool) -> CausalOperation {
        let inserts = self
            .inserts
            .iter()
            .filter_map(|i| {
                let tids: Vec<Tid> = i.tids.iter().filter(|tid| !seen(tid)).cloned().collect();
                (!tids.is_empty()).then(|| ReifiedTriple {
                    tids,
                    triple: i.triple.clone(),
                })
            })
            .collect();
        CausalOperation {
            version: self.version,
            from: self.from,
            time: self.time.clone(),
            deletes: self.deletes.clone(),
            inserts,
        }
    }

    /// Every TID this operation mentions, deletes and inserts combined.
    pub fn all_tids(&self) -> HashSet<&Tid> {
        self.deletes
            .iter()
            .chain(self.inserts.iter())
            .flat_map(|r| r.tids.iter())
            .collect()
    }
}

impl TimedMessage for CausalOperation {
    fn time(&self) -> &TreeClock {
        &self.time
    }

    fn from_tick(&self) -> u64 {
        self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triples::Term;

    fn triple(name: &str) -> Triple {
        Triple::new(format!("s-{}", name), "p", Term::literal(name))
    }

    fn ticked_twice() -> (TreeClock, TreeClock) {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        (t1, t2)
    }

    #[test]
    fn single_operation_covers_one_tick() {
        let (t1, _) = ticked_twice();
        let op = CausalOperation::new(
            t1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
        );
        assert_eq!(op.from, 1);
        assert!(!op.is_fused());
        assert_eq!(op.tid(), t1.hash());
    }

    #[test]
    fn fuse_combines_tick_range_and_tids() {
        let (t1, t2) = ticked_twice();
        let op1 = CausalOperation::new(
            t1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
        );
        let op2 = CausalOperation::new(
            t2.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("b"), t2.hash())],
        );
        let fused = op1.fuse(&op2);
        assert_eq!(fused.from, 1);
        assert_eq!(fused.time.ticks(), 2);
        assert!(fused.is_fused());
        assert_eq!(fused.inserts.len(), 2);
        let tids = fused.all_tids();
        assert!(tids.contains(&t1.hash()));
        assert!(tids.contains(&t2.hash()));
    }

    #[test]
    fn fuse_cancels_insert_then_delete() {
        let (t1, t2) = ticked_twice();
        let op1 = CausalOperation::new(
            t1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
        );
        let op2 = CausalOperation::new(
            t2.clone(),
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
            vec![],
        );
        let fused = op1.fuse(&op2);
        assert!(fused.is_empty(), "insert then delete is a net no-op");
    }

    #[test]
    fn fuse_keeps_foreign_deletes() {
        let (t1, t2) = ticked_twice();
        let foreign = Tid::from("someone-else");
        let op1 = CausalOperation::new(
            t1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
        );
        let op2 = CausalOperation::new(
            t2.clone(),
            vec![ReifiedTriple::new(triple("b"), foreign.clone())],
            vec![],
        );
        let fused = op1.fuse(&op2);
        assert_eq!(fused.inserts.len(), 1);
        assert_eq!(fused.deletes.len(), 1);
        assert_eq!(fused.deletes[0].tids, vec![foreign]);
    }

    #[test]
    fn cut_drops_only_seen_tids() {
        let (t1, t2) = ticked_twice();
        let op = CausalOperation::new(
            t1.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("a"), t1.hash())],
        )
        .fuse(&CausalOperation::new(
            t2.clone(),
            vec![],
            vec![ReifiedTriple::new(triple("b"), t2.hash())],
        ));
        let seen_tid = t1.hash();
        let cut = op.cut(|tid| *tid == seen_tid);
        assert_eq!(cut.inserts.len(), 1);
        assert_eq!(cut.inserts[0].tids, vec![t2.hash()]);
        assert_eq!(cut.from, op.from);
    }
}
