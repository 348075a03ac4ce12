use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

use crate::config::ContextConfig;
use crate::core::operation::{CausalOperation, ReifiedTriple, OPERATION_VERSION};
use crate::core::tree_clock::TreeClock;
use crate::core::triples::{compact_subject, expand_subject, Triple};
use crate::error::{EngineError, EngineResult};

/// Buffers above this size are packed and compressed instead of being
/// carried as inline JSON text.
pub const MAX_INLINE_JSON: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BufferEncoding {
    Json,
    MsgPack,
    Gzip,
}

/// A content buffer plus the chain of encodings applied to it, in
/// application order. Decoders apply the reverse chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncodedBuffer {
    encoding: Vec<BufferEncoding>,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// The operation wire form: a msgpack 5-tuple
/// `[version, from, time, deletes, inserts]`.
#[derive(Serialize, Deserialize)]
struct WireOperation(u8, u64, Value, EncodedBuffer, EncodedBuffer);

fn encode_buffer(content: &Value) -> EngineResult<EncodedBuffer> {
    let json = serde_json::to_vec(content)?;
    if json.len() > MAX_INLINE_JSON {
        let packed = rmp_serde::to_vec(content)?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&packed)?;
        Ok(EncodedBuffer {
            encoding: vec![BufferEncoding::MsgPack, BufferEncoding::Gzip],
            data: gz.finish()?,
        })
    } else {
        Ok(EncodedBuffer {
            encoding: vec![BufferEncoding::Json],
            data: json,
        })
    }
}

fn decode_buffer(buffer: &EncodedBuffer) -> EngineResult<Value> {
    let mut data = buffer.data.clone();
    for encoding in buffer.encoding.iter().rev() {
        data = match encoding {
            BufferEncoding::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(&data[..]).read_to_end(&mut out)?;
                out
            }
            // The innermost encodings produce the JSON value directly
            BufferEncoding::MsgPack => return Ok(rmp_serde::from_slice(&data)?),
            BufferEncoding::Json => return Ok(serde_json::from_slice(&data)?),
        };
    }
    Err(EngineError::Codec(
        "buffer encoding chain has no content encoding".to_string(),
    ))
}

/// Encodes operations for the wire and for the journal's `op:{tid}` keys.
///
/// Deletes are always reified (they withdraw specific TIDs). Inserts travel
/// as a JSON-LD subject graph for a single transaction, or reified like
/// deletes when the operation is a fusion across TIDs.
#[derive(Debug, Clone)]
pub struct OperationEncoder {
    ctx: ContextConfig,
}

impl OperationEncoder {
    pub fn new(ctx: ContextConfig) -> Self {
        Self { ctx }
    }

    pub fn encode(&self, op: &CausalOperation) -> EngineResult<Vec<u8>> {
        let deletes = serde_json::to_value(&op.deletes)?;
        let inserts = if op.is_fused() {
            serde_json::to_value(&op.inserts)?
        } else {
            Value::Array(self.subject_graph(&op.inserts))
        };
        let wire = WireOperation(
            op.version,
            op.from,
            op.time.to_json(),
            encode_buffer(&deletes)?,
            encode_buffer(&inserts)?,
        );
        Ok(rmp_serde::to_vec(&wire)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> EngineResult<CausalOperation> {
        let WireOperation(version, from, time, deletes, inserts) = rmp_serde::from_slice(bytes)?;
        if version != OPERATION_VERSION {
            return Err(EngineError::Codec(format!(
                "unsupported operation version {}",
                version
            )));
        }
        let time = TreeClock::from_json(&time)?;
        let deletes: Vec<ReifiedTriple> = serde_json::from_value(decode_buffer(&deletes)?)?;
        let inserts_value = decode_buffer(&inserts)?;
        let inserts: Vec<ReifiedTriple> = if from < time.ticks() {
            serde_json::from_value(inserts_value)?
        } else {
            let tid = time.hash();
            let mut reified = Vec::new();
            for subject in inserts_value
                .as_array()
                .ok_or_else(|| EngineError::Codec("inserts is not a subject array".to_string()))?
            {
                for triple in expand_subject(subject, &self.ctx)? {
                    reified.push(ReifiedTriple::new(triple, tid.clone()));
                }
            }
            reified
        };
        Ok(CausalOperation {
            version,
            from,
            time,
            deletes,
            inserts,
        })
    }

    /// Group insert triples into compacted subject documents.
    fn subject_graph(&self, inserts: &[ReifiedTriple]) -> Vec<Value> {
        let mut order: Vec<String> = Vec::new();
        let mut triples: Vec<Triple> = Vec::new();
        for reified in inserts {
            if !order.contains(&reified.triple.subject) {
                order.push(reified.triple.subject.clone());
            }
            triples.push(reified.triple.clone());
        }
        order
            .iter()
            .map(|subject| compact_subject(subject, &triples, &self.ctx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tree_clock::Tid;
    use crate::core::triples::Term;
    use serde_json::json;

    fn encoder() -> OperationEncoder {
        OperationEncoder::new(ContextConfig::for_domain("test.example.org"))
    }

    fn insert_op(time: TreeClock, subject: &str, name: &str) -> CausalOperation {
        let triple = Triple::new(
            format!("http://test.example.org/{}", subject),
            "http://test.example.org/#name",
            Term::literal(name),
        );
        let tid = time.hash();
        CausalOperation::new(time, vec![], vec![ReifiedTriple::new(triple, tid)])
    }

    #[test]
    fn roundtrip_single_insert() {
        let time = TreeClock::genesis().ticked();
        let op = insert_op(time, "fred", "Fred");
        let bytes = encoder().encode(&op).unwrap();
        let decoded = encoder().decode(&bytes).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn roundtrip_with_deletes() {
        let time = TreeClock::genesis().ticked();
        let tid = Tid::from("withdrawn");
        let op = CausalOperation::new(
            time,
            vec![ReifiedTriple {
                tids: vec![tid],
                triple: Triple::new(
                    "http://test.example.org/fred",
                    "http://test.example.org/#name",
                    Term::literal("Fred"),
                ),
            }],
            vec![],
        );
        let bytes = encoder().encode(&op).unwrap();
        assert_eq!(encoder().decode(&bytes).unwrap(), op);
    }

    #[test]
    fn roundtrip_fused_reified_inserts() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let fused = insert_op(t1.clone(), "fred", "Fred").fuse(&insert_op(t2, "wilma", "Wilma"));
        let bytes = encoder().encode(&fused).unwrap();
        let decoded = encoder().decode(&bytes).unwrap();
        assert_eq!(decoded, fused);
    }

    #[test]
    fn encode_decode_encode_is_identity() {
        let time = TreeClock::genesis().ticked();
        let op = insert_op(time, "fred", "Fred");
        let bytes = encoder().encode(&op).unwrap();
        let again = encoder().encode(&encoder().decode(&bytes).unwrap()).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn large_buffers_are_compressed() {
        let time = TreeClock::genesis().ticked();
        let tid = time.hash();
        let inserts = (0..100)
            .map(|i| {
                ReifiedTriple::new(
                    Triple::new(
                        "http://test.example.org/fred",
                        format!("http://test.example.org/#prop{}", i),
                        Term::literal(format!("value-{}", i)),
                    ),
                    tid.clone(),
                )
            })
            .collect();
        let op = CausalOperation::new(time, vec![], inserts);
        let bytes = encoder().encode(&op).unwrap();
        let decoded = encoder().decode(&bytes).unwrap();
        assert_eq!(decoded.inserts.len(), 100);
        // Compressed form beats the inline JSON it replaced
        let json_len = serde_json::to_vec(&json!([compact_subject(
            "http://test.example.org/fred",
            &decoded
                .inserts
                .iter()
                .map(|r| r.triple.clone())
                .collect::<Vec<_>>(),
            &ContextConfig::for_domain("test.example.org"),
        )]))
        .unwrap()
        .len();
        assert!(json_len > MAX_INLINE_JSON);
        assert!(bytes.len() < json_len);
    }

    #[test]
    fn rejects_unknown_version() {
        let time = TreeClock::genesis().ticked();
        let mut op = insert_op(time, "fred", "Fred");
        op.version = 9;
        let bytes = encoder().encode(&op).unwrap();
        assert!(matches!(
            encoder().decode(&bytes),
            Err(EngineError::Codec(_))
        ));
    }
}
