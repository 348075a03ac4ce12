use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::triples::{Term, Triple};
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::dataset::{DatasetUpdate, Patch, ResolvedPatch};

/// Read-only view of the graph offered to constraints.
#[async_trait]
pub trait GraphState: Send + Sync {
    async fn read_subject(&self, iri: &str) -> EngineResult<Vec<Triple>>;
}

/// The mutable in-flight transaction a constraint may amend during `check`.
#[derive(Debug, Default)]
pub struct InterimUpdate {
    pub resolved: ResolvedPatch,
}

impl InterimUpdate {
    pub fn new(resolved: ResolvedPatch) -> Self {
        Self { resolved }
    }

    /// Assert an additional insert, entering the same operation.
    pub fn assert_insert(&mut self, triple: Triple) {
        self.resolved.inserts.push(triple);
    }

    /// Withdraw a pending insert.
    pub fn remove_insert(&mut self, triple: &Triple) {
        self.resolved.inserts.retain(|t| t != triple);
    }
}

/// A declarative constraint on the domain's data: `check` guards local
/// writes before commit, `apply` reacts to remote operations, possibly with
/// a corrective local transaction of its own.
#[async_trait]
pub trait Constraint: Send + Sync {
    async fn check(&self, state: &dyn GraphState, interim: &mut InterimUpdate)
        -> EngineResult<()>;

    async fn apply(
        &self,
        state: &dyn GraphState,
        update: &DatasetUpdate,
    ) -> EngineResult<Option<Patch>>;
}

pub type ConstraintFactory = fn(&Value) -> EngineResult<Arc<dyn Constraint>>;

/// Process-wide registry of constraint factories, keyed by descriptor
/// `@type`. The only process-wide state in the crate.
static REGISTRY: Lazy<RwLock<HashMap<String, ConstraintFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, ConstraintFactory> = HashMap::new();
    map.insert("single-valued".to_string(), SingleValued::factory);
    RwLock::new(map)
});

pub fn register_constraint(name: &str, factory: ConstraintFactory) {
    REGISTRY
        .write()
        .expect("constraint registry poisoned")
        .insert(name.to_string(), factory);
}

/// Instantiate a constraint from a descriptor `{"@type": name, ...}`.
pub fn create_constraint(descriptor: &Value) -> EngineResult<Arc<dyn Constraint>> {
    let name = descriptor
        .get("@type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Configuration("constraint has no @type".to_string()))?;
    let registry = REGISTRY.read().expect("constraint registry poisoned");
    let factory = registry.get(name).ok_or_else(|| {
        EngineError::Configuration(format!("unknown constraint type '{}'", name))
    })?;
    factory(descriptor)
}

/// Enforces a single value per subject for one property. Local writes that
/// would produce a second value are rejected; on concurrent remote inserts
/// the lexically greatest value wins and the rest are deleted by a
/// corrective transaction, so all clones resolve identically.
pub struct SingleValued {
    property: String,
}

impl SingleValued {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }

    fn factory(descriptor: &Value) -> EngineResult<Arc<dyn Constraint>> {
        let property = descriptor
            .get("property")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Configuration("single-valued constraint needs a property".to_string())
            })?;
        Ok(Arc::new(SingleValued::new(property)))
    }

    fn value_key(term: &Term) -> String {
        serde_json::to_string(term).unwrap_or_default()
    }
}

#[async_trait]
impl Constraint for SingleValued {
    async fn check(
        &self,
        state: &dyn GraphState,
        interim: &mut InterimUpdate,
    ) -> EngineResult<()> {
        for triple in interim.resolved.inserts.clone() {
            if triple.predicate != self.property {
                continue;
            }
            let deleted: Vec<&Triple> = interim
                .resolved
                .deletes
                .iter()
                .map(|(t, _)| t)
                .collect();
            let existing = state
                .read_subject(&triple.subject)
                .await?
                .into_iter()
                .filter(|t| t.predicate == self.property)
                .filter(|t| !deleted.contains(&t))
                .filter(|t| t.object != triple.object)
                .count();
            let pending = interim
                .resolved
                .inserts
                .iter()
                .filter(|t| t.subject == triple.subject && t.predicate == self.property)
                .count();
            if existing > 0 || pending > 1 {
                return Err(EngineError::BadUpdate(format!(
                    "multiple values for single-valued {} on {}",
                    self.property, triple.subject
                )));
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        state: &dyn GraphState,
        update: &DatasetUpdate,
    ) -> EngineResult<Option<Patch>> {
        let mut corrective = Patch::default();
        let mut seen_subjects = Vec::new();
        for triple in &update.inserts {
            if triple.predicate != self.property || seen_subjects.contains(&triple.subject) {
                continue;
            }
            seen_subjects.push(triple.subject.clone());
            let mut values: Vec<Triple> = state
                .read_subject(&triple.subject)
                .await?
                .into_iter()
                .filter(|t| t.predicate == self.property)
                .collect();
            if values.len() < 2 {
                continue;
            }
            // Deterministic winner: greatest serialised value
            values.sort_by_key(|t| Self::value_key(&t.object));
            values.pop();
            for loser in values {
                let value = match &loser.object {
                    Term::Ref { id } => serde_json::json!({ "@id": id }),
                    Term::Literal(v) => v.clone(),
                };
                let mut doc = serde_json::Map::new();
                doc.insert("@id".to_string(), Value::String(loser.subject.clone()));
                doc.insert(loser.predicate.clone(), value);
                corrective.delete.push(Value::Object(doc));
            }
        }
        Ok((!corrective.delete.is_empty()).then_some(corrective))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triples::Term;

    struct FixedState(Vec<Triple>);

    #[async_trait]
    impl GraphState for FixedState {
        async fn read_subject(&self, iri: &str) -> EngineResult<Vec<Triple>> {
            Ok(self.0.iter().filter(|t| t.subject == iri).cloned().collect())
        }
    }

    fn name_triple(value: &str) -> Triple {
        Triple::new("fred", "#name", Term::literal(value))
    }

    #[tokio::test]
    async fn check_rejects_second_value() {
        let constraint = SingleValued::new("#name");
        let state = FixedState(vec![name_triple("Fred")]);
        let mut interim = InterimUpdate::new(ResolvedPatch {
            deletes: vec![],
            inserts: vec![name_triple("Frederick")],
        });
        assert!(matches!(
            constraint.check(&state, &mut interim).await,
            Err(EngineError::BadUpdate(_))
        ));
    }

    #[tokio::test]
    async fn check_allows_replacement() {
        let constraint = SingleValued::new("#name");
        let state = FixedState(vec![name_triple("Fred")]);
        let mut interim = InterimUpdate::new(ResolvedPatch {
            deletes: vec![(name_triple("Fred"), vec![])],
            inserts: vec![name_triple("Frederick")],
        });
        assert!(constraint.check(&state, &mut interim).await.is_ok());
    }

    #[tokio::test]
    async fn apply_emits_corrective_delete() {
        let constraint = SingleValued::new("#name");
        let state = FixedState(vec![name_triple("Fred"), name_triple("Frederick")]);
        let update = DatasetUpdate {
            tid: crate::core::tree_clock::Tid::from("t"),
            deletes: vec![],
            inserts: vec![name_triple("Frederick")],
        };
        let patch = constraint.apply(&state, &update).await.unwrap().unwrap();
        assert_eq!(patch.delete.len(), 1);
        // "Fred" sorts below "Frederick": it is the loser
        assert_eq!(patch.delete[0]["#name"], serde_json::json!("Fred"));
    }

    #[tokio::test]
    async fn registry_creates_by_descriptor() {
        let constraint = create_constraint(&serde_json::json!({
            "@type": "single-valued",
            "property": "#name",
        }));
        assert!(constraint.is_ok());
        assert!(matches!(
            create_constraint(&serde_json::json!({ "@type": "nope" })),
            Err(EngineError::Configuration(_))
        ));
    }
}
