//! Persisted format of the action queue and the dead-letter list.
//!
//! Both are stored as a single JSON envelope:
//!
//! ```text
//! { "magic": "ADHQ", "schemaVersion": 1, "checksum": <hex blake3>, "payload": "<json array>" }
//! ```
//!
//! The checksum covers the payload text exactly as written, so any torn or
//! hand-edited blob is rejected as a whole. Records whose `kind` this build
//! does not know are set aside as raw JSON rather than treated as corruption,
//! and written back verbatim on every rewrite, which keeps the format readable
//! by older builds after new kinds are added without losing those records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use crate::capabilities::kv::MAX_VALUE_SIZE;
use crate::model::{ActionId, ActionKind, DeadLetter, PendingAction};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = MAX_VALUE_SIZE;
const MAX_PERSISTED_RECORDS: usize = 100_000;
const STORE_MAGIC: &str = "ADHQ";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many records: {count}, max {max}")]
    TooManyRecords { count: usize, max: usize },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StoreEnvelope {
    magic: String,
    schema_version: u32,
    checksum: String,
    payload: String,
}

/// Records recovered from a blob, plus the raw records of kinds this build
/// does not know. Callers hand `unknown` back to the encoder untouched.
#[derive(Debug)]
pub struct Decoded<T> {
    pub records: Vec<T>,
    pub unknown: Vec<Value>,
}

pub fn encode_actions(
    actions: &[PendingAction],
    unknown: &[Value],
) -> Result<Vec<u8>, StoreError> {
    encode_with_unknown(actions, unknown)
}

pub fn decode_actions(bytes: &[u8]) -> Result<Decoded<PendingAction>, StoreError> {
    let mut decoded = decode_records::<PendingAction>(bytes, Some("/kind"))?;

    let mut seen = HashSet::with_capacity(decoded.records.len());
    if !decoded.records.iter().all(|a| seen.insert(a.id.clone())) {
        return Err(StoreError::Corrupted {
            reason: "duplicate action id",
        });
    }

    decoded.records.sort_by(PendingAction::replay_order);
    Ok(decoded)
}

pub fn encode_dead_letters(
    letters: &[DeadLetter],
    unknown: &[Value],
) -> Result<Vec<u8>, StoreError> {
    encode_with_unknown(letters, unknown)
}

pub fn decode_dead_letters(bytes: &[u8]) -> Result<Decoded<DeadLetter>, StoreError> {
    decode_records(bytes, Some("/action/kind"))
}

/// Ids of captured actions that already left the queue.
pub fn encode_retired_ids(ids: &[ActionId]) -> Result<Vec<u8>, StoreError> {
    encode_records(ids)
}

pub fn decode_retired_ids(bytes: &[u8]) -> Result<Vec<ActionId>, StoreError> {
    Ok(decode_records(bytes, None)?.records)
}

fn encode_with_unknown<T: Serialize>(
    records: &[T],
    unknown: &[Value],
) -> Result<Vec<u8>, StoreError> {
    if unknown.is_empty() {
        return encode_records(records);
    }
    let mut raw = Vec::with_capacity(records.len() + unknown.len());
    for record in records {
        raw.push(serde_json::to_value(record)?);
    }
    raw.extend_from_slice(unknown);
    encode_records(&raw)
}

fn encode_records<T: Serialize>(records: &[T]) -> Result<Vec<u8>, StoreError> {
    let payload = serde_json::to_string(records)?;
    let checksum = blake3::hash(payload.as_bytes());

    let envelope = StoreEnvelope {
        magic: STORE_MAGIC.to_string(),
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: checksum.to_hex().to_string(),
        payload,
    };

    let bytes = serde_json::to_vec(&envelope)?;
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }
    Ok(bytes)
}

fn decode_records<T: DeserializeOwned>(
    bytes: &[u8],
    kind_pointer: Option<&str>,
) -> Result<Decoded<T>, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty blob",
        });
    }

    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = serde_json::from_slice(bytes)?;

    if envelope.magic != STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    if envelope.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(envelope.payload.as_bytes());
    let expected = hex::decode(&envelope.checksum).map_err(|_| StoreError::Corrupted {
        reason: "checksum is not hex",
    })?;
    if actual_checksum.as_bytes().as_slice() != expected.as_slice() {
        return Err(StoreError::IntegrityCheckFailed {
            expected: envelope.checksum,
            actual: actual_checksum.to_hex().to_string(),
        });
    }

    let raw: Vec<Value> = serde_json::from_str(&envelope.payload)?;

    if raw.len() > MAX_PERSISTED_RECORDS {
        return Err(StoreError::TooManyRecords {
            count: raw.len(),
            max: MAX_PERSISTED_RECORDS,
        });
    }

    let mut records = Vec::with_capacity(raw.len());
    let mut unknown = Vec::new();
    for record in raw {
        let kind = kind_pointer
            .and_then(|pointer| record.pointer(pointer))
            .and_then(Value::as_str);
        if let Some(kind) = kind {
            if ActionKind::from_str_checked(kind).is_none() {
                warn!("Keeping persisted record with unknown kind {:?} aside", kind);
                unknown.push(record);
                continue;
            }
        }
        records.push(serde_json::from_value(record)?);
    }

    Ok(Decoded { records, unknown })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, UnixTimeMs};
    use serde_json::json;

    fn sample_action(id: &str, at: u64) -> PendingAction {
        PendingAction {
            id: ActionId::new(id).unwrap(),
            kind: ActionKind::MarkTaken,
            entity: EntityKind::IntakeRecord,
            payload: json!({ "medicationId": "med-1" }),
            enqueued_at: UnixTimeMs(at),
            attempt: 0,
        }
    }

    fn ids(actions: &[PendingAction]) -> Vec<&str> {
        actions.iter().map(|a| a.id.as_str()).collect()
    }

    fn envelope_with_payload(payload: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "magic": STORE_MAGIC,
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "checksum": blake3::hash(payload.as_bytes()).to_hex().to_string(),
            "payload": payload,
        }))
        .unwrap()
    }

    #[test]
    fn roundtrip_with_data() {
        let actions = vec![sample_action("a", 1), sample_action("b", 2)];
        let bytes = encode_actions(&actions, &[]).unwrap();
        let decoded = decode_actions(&bytes).unwrap();

        assert_eq!(decoded.records, actions);
        assert!(decoded.unknown.is_empty());
    }

    #[test]
    fn envelope_is_readable_json() {
        let bytes = encode_actions(&[sample_action("a", 1)], &[]).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["magic"], "ADHQ");
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["checksum"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn empty_blob_is_error() {
        let result = decode_actions(b"");
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn garbage_is_error() {
        let result = decode_actions(b"\x00\xffnot json");
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn wrong_magic_is_error() {
        let mut value: Value =
            serde_json::from_slice(&encode_actions(&[sample_action("a", 1)], &[]).unwrap())
                .unwrap();
        value["magic"] = json!("NOPE");
        let result = decode_actions(&serde_json::to_vec(&value).unwrap());
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let mut value: Value =
            serde_json::from_slice(&encode_actions(&[sample_action("a", 1)], &[]).unwrap())
                .unwrap();
        let payload = value["payload"].as_str().unwrap().replace("med-1", "med-2");
        value["payload"] = json!(payload);

        let result = decode_actions(&serde_json::to_vec(&value).unwrap());
        assert!(matches!(result, Err(StoreError::IntegrityCheckFailed { .. })));
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut value: Value = serde_json::from_slice(&encode_actions(&[], &[]).unwrap()).unwrap();
        value["schemaVersion"] = json!(CURRENT_SCHEMA_VERSION + 1);
        let result = decode_actions(&serde_json::to_vec(&value).unwrap());
        assert!(matches!(result, Err(StoreError::FutureSchema { .. })));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![b' '; MAX_STORE_BYTES + 1];
        let result = decode_actions(&oversized);
        assert!(matches!(result, Err(StoreError::StoreTooLarge { .. })));
    }

    #[test]
    fn unknown_kind_is_set_aside_not_corrupt() {
        let payload = json!([
            {
                "id": "a", "kind": "mark-taken", "entity": "intake-record",
                "payload": {}, "enqueuedAt": 1, "attempt": 0
            },
            {
                "id": "b", "kind": "mark-forgotten", "entity": "intake-record",
                "payload": {}, "enqueuedAt": 2, "attempt": 0
            }
        ])
        .to_string();

        let decoded = decode_actions(&envelope_with_payload(&payload)).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.records[0].id.as_str(), "a");
        assert_eq!(decoded.unknown.len(), 1);
        assert_eq!(decoded.unknown[0]["kind"], "mark-forgotten");
    }

    #[test]
    fn unknown_records_are_written_back() {
        let future = json!({
            "id": "future", "kind": "mark-refilled", "entity": "intake-record",
            "payload": { "medicationId": "med-1" }, "enqueuedAt": 2, "attempt": 0
        });

        let bytes = encode_actions(&[sample_action("a", 1)], &[future.clone()]).unwrap();
        let decoded = decode_actions(&bytes).unwrap();

        assert_eq!(ids(&decoded.records), vec!["a"]);
        assert_eq!(decoded.unknown, vec![future]);
    }

    #[test]
    fn retired_ids_roundtrip() {
        let retired = vec![ActionId::derived("action-0000000000001-0000")];
        let decoded = decode_retired_ids(&encode_retired_ids(&retired).unwrap()).unwrap();
        assert_eq!(decoded, retired);
    }

    #[test]
    fn malformed_record_fails_whole_blob() {
        let payload = json!([
            {
                "id": "a", "kind": "mark-taken", "entity": "intake-record",
                "payload": {}, "enqueuedAt": 1
            },
            { "id": "b", "kind": "mark-taken" }
        ])
        .to_string();

        assert!(decode_actions(&envelope_with_payload(&payload)).is_err());
    }

    #[test]
    fn duplicate_ids_are_corrupt() {
        let payload =
            serde_json::to_string(&[sample_action("a", 1), sample_action("a", 2)]).unwrap();
        let result = decode_actions(&envelope_with_payload(&payload));
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn decode_restores_replay_order() {
        let payload =
            serde_json::to_string(&[sample_action("b", 5), sample_action("a", 5)]).unwrap();
        let decoded = decode_actions(&envelope_with_payload(&payload)).unwrap();
        assert_eq!(ids(&decoded.records), vec!["a", "b"]);
    }

    #[test]
    fn dead_letters_roundtrip() {
        let letters = vec![DeadLetter {
            action: sample_action("a", 1),
            reason: "rejected with status 422".into(),
            dead_lettered_at: UnixTimeMs(99),
        }];
        let decoded = decode_dead_letters(&encode_dead_letters(&letters, &[]).unwrap()).unwrap();
        assert_eq!(decoded.records, letters);
    }
}
