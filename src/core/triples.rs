use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ContextConfig;
use crate::error::{EngineError, EngineResult};

/// Object position of a triple: a reference to another subject, or a JSON
/// literal (string, number or boolean).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Term {
    Ref { #[serde(rename = "@id")] id: String },
    Literal(Value),
}

impl Term {
    pub fn literal(value: impl Into<Value>) -> Term {
        Term::Literal(value.into())
    }

    pub fn reference(iri: impl Into<String>) -> Term {
        Term::Ref { id: iri.into() }
    }
}

/// An asserted statement `(subject IRI, predicate IRI, object)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    #[serde(rename = "s")]
    pub subject: String,
    #[serde(rename = "p")]
    pub predicate: String,
    #[serde(rename = "o")]
    pub object: Term,
}

impl Triple {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: Term) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
        }
    }

    /// Stable content hash, used as the triple's storage identity.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(&json!([
            self.subject,
            self.predicate,
            serde_json::to_value(&self.object).unwrap_or(Value::Null),
        ]))
        .unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        URL_SAFE_NO_PAD.encode(&digest[..16])
    }
}

/// Resolve a document-relative IRI against the context base.
pub fn resolve_iri(iri: &str, base: &str) -> String {
    if iri.contains("://") || iri.starts_with(base) {
        iri.to_string()
    } else {
        format!("{}{}", base, iri)
    }
}

/// Resolve a property name against the context vocabulary.
pub fn resolve_property(name: &str, vocab: &str) -> String {
    if name.contains("://") {
        name.to_string()
    } else {
        format!("{}{}", vocab, name)
    }
}

fn compact_iri(iri: &str, base: &str) -> String {
    iri.strip_prefix(base).unwrap_or(iri).to_string()
}

fn compact_property(iri: &str, vocab: &str) -> String {
    iri.strip_prefix(vocab).unwrap_or(iri).to_string()
}

/// Expand a JSON-LD subject document into triples against the context.
/// Nested subject objects are flattened into their own triples; references
/// (including self- and cyclic references) are kept as IRIs, never as owned
/// sub-documents.
pub fn expand_subject(subject: &Value, ctx: &ContextConfig) -> EngineResult<Vec<Triple>> {
    let mut triples = Vec::new();
    expand_into(subject, ctx, &mut triples)?;
    Ok(triples)
}

fn expand_into(subject: &Value, ctx: &ContextConfig, out: &mut Vec<Triple>) -> EngineResult<String> {
    let object = subject
        .as_object()
        .ok_or_else(|| EngineError::BadUpdate(format!("subject is not an object: {}", subject)))?;
    let id = object
        .get("@id")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::BadUpdate("subject has no @id".to_string()))?;
    let subject_iri = resolve_iri(id, &ctx.base);

    for (key, value) in object {
        if key.starts_with('@') {
            continue;
        }
        let predicate = resolve_property(key, &ctx.vocab);
        let values: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for v in values {
            let term = match v {
                Value::Object(map) => {
                    let term = Term::reference(reference_iri(map, ctx)?);
                    // A nested object with properties of its own is a
                    // subject in its own right.
                    if map.keys().any(|k| !k.starts_with('@')) {
                        expand_into(v, ctx, out)?;
                    }
                    term
                }
                Value::String(_) | Value::Number(_) | Value::Bool(_) => Term::Literal(v.clone()),
                other => {
                    return Err(EngineError::BadUpdate(format!(
                        "unsupported object value: {}",
                        other
                    )))
                }
            };
            out.push(Triple::new(subject_iri.clone(), predicate.clone(), term));
        }
    }
    Ok(subject_iri)
}

fn reference_iri(map: &Map<String, Value>, ctx: &ContextConfig) -> EngineResult<String> {
    map.get("@id")
        .and_then(Value::as_str)
        .map(|id| resolve_iri(id, &ctx.base))
        .ok_or_else(|| EngineError::BadUpdate("referenced subject has no @id".to_string()))
}

/// Re-assemble a subject document from its triples, compacted against the
/// context. The inverse of `expand_subject` for a single subject.
pub fn compact_subject(subject_iri: &str, triples: &[Triple], ctx: &ContextConfig) -> Value {
    let mut doc = Map::new();
    doc.insert(
        "@id".to_string(),
        json!(compact_iri(subject_iri, &ctx.base)),
    );
    for triple in triples {
        if triple.subject != subject_iri {
            continue;
        }
        let key = compact_property(&triple.predicate, &ctx.vocab);
        let value = match &triple.object {
            Term::Ref { id } => json!({ "@id": compact_iri(id, &ctx.base) }),
            Term::Literal(v) => v.clone(),
        };
        match doc.get_mut(&key) {
            None => {
                doc.insert(key, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                doc.insert(key, json!([first, value]));
            }
        }
    }
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextConfig {
        ContextConfig::for_domain("test.example.org")
    }

    #[test]
    fn expand_simple_subject() {
        let triples =
            expand_subject(&json!({ "@id": "fred", "name": "Fred" }), &ctx()).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].subject, "http://test.example.org/fred");
        assert_eq!(triples[0].predicate, "http://test.example.org/#name");
        assert_eq!(triples[0].object, Term::literal("Fred"));
    }

    #[test]
    fn expand_array_values() {
        let triples = expand_subject(
            &json!({ "@id": "fred", "name": ["Fred", "Freddy"] }),
            &ctx(),
        )
        .unwrap();
        assert_eq!(triples.len(), 2);
    }

    #[test]
    fn expand_nested_subject_and_reference() {
        let triples = expand_subject(
            &json!({ "@id": "fred", "wife": { "@id": "wilma", "name": "Wilma" } }),
            &ctx(),
        )
        .unwrap();
        assert_eq!(triples.len(), 2);
        assert!(triples.iter().any(|t| t.subject.ends_with("/wilma")
            && t.object == Term::literal("Wilma")));
        assert!(triples.iter().any(|t| t.subject.ends_with("/fred")
            && t.object == Term::reference("http://test.example.org/wilma")));
    }

    #[test]
    fn self_reference_does_not_recurse() {
        let triples = expand_subject(
            &json!({ "@id": "fred", "self": { "@id": "fred" } }),
            &ctx(),
        )
        .unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(
            triples[0].object,
            Term::reference("http://test.example.org/fred")
        );
    }

    #[test]
    fn expand_rejects_missing_id() {
        assert!(matches!(
            expand_subject(&json!({ "name": "Fred" }), &ctx()),
            Err(EngineError::BadUpdate(_))
        ));
    }

    #[test]
    fn compact_roundtrip() {
        let original = json!({ "@id": "fred", "name": "Fred" });
        let triples = expand_subject(&original, &ctx()).unwrap();
        let compacted = compact_subject("http://test.example.org/fred", &triples, &ctx());
        assert_eq!(compacted, original);
    }

    #[test]
    fn compact_groups_multi_values() {
        let triples = vec![
            Triple::new("http://test.example.org/fred", "http://test.example.org/#name", Term::literal("Fred")),
            Triple::new("http://test.example.org/fred", "http://test.example.org/#name", Term::literal("Freddy")),
        ];
        let doc = compact_subject("http://test.example.org/fred", &triples, &ctx());
        assert_eq!(doc["name"], json!(["Fred", "Freddy"]));
    }

    #[test]
    fn triple_hash_is_stable_and_distinct() {
        let a = Triple::new("s", "p", Term::literal("o"));
        let b = Triple::new("s", "p", Term::literal("o"));
        let c = Triple::new("s", "p", Term::literal("other"));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
