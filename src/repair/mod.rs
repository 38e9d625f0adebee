//! `repairIndexEntry` — reconcile one index entry with its owning document.
//!
//! Recovers from out-of-band corruption in either direction: a document whose
//! expected index entry is missing (`action: insert`), or an index entry
//! pointing at a record that no longer generates that key (`action: remove`).
//! Validation is strict; every structured failure surfaces a machine-readable
//! code in the response document, and dry-run mode reports the exact write it
//! would perform without committing anything.

use crate::catalog::{Catalog, ID_INDEX_NAME};
use crate::error::DocshardError;
use crate::extract::to_owned_raw;
use crate::shard_lock::ShardKeyLockManager;
use crate::storage::encoded_key::keys_equal;
use crate::storage::{with_write_conflict_retry, RecordId, ReplicaRole};
use bson::raw::RawBson;
use bson::{RawBsonRef, RawDocument, RawDocumentBuf};
use tracing::info;

pub const REPAIR_COMMAND_FIELD: &str = "repairIndexEntry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Insert,
    Remove,
}

/// Parsed wire request.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub namespace: String,
    pub action: RepairAction,
    pub index_name: String,
    pub id: Option<RawBson>,
    pub shard_key: Option<RawDocumentBuf>,
    pub index_key: Option<RawDocumentBuf>,
    pub record_id: Option<RecordId>,
    pub dry_run: bool,
}

impl RepairRequest {
    /// Parse and validate the command document.
    ///
    /// Wire shape:
    /// `{ repairIndexEntry: <collection>, action: "insert"|"remove",
    ///    indexName: <string>, _id?, shardKey?, indexKey?, recordId?, dryRun? }`
    pub fn parse(db_name: &str, cmd: &RawDocument) -> Result<Self, DocshardError> {
        let collection = match cmd.get(REPAIR_COMMAND_FIELD).ok().flatten() {
            Some(RawBsonRef::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(DocshardError::InvalidArgument(
                    "collection name is required".into(),
                ));
            }
        };
        let namespace = format!("{db_name}.{collection}");

        let action = match cmd.get("action").ok().flatten() {
            Some(RawBsonRef::String("insert")) => RepairAction::Insert,
            Some(RawBsonRef::String("remove")) => RepairAction::Remove,
            _ => {
                return Err(DocshardError::InvalidArgument(
                    "action must be 'insert' or 'remove'".into(),
                ));
            }
        };

        let index_name = match cmd.get("indexName").ok().flatten() {
            Some(RawBsonRef::String(name)) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(DocshardError::InvalidArgument(
                    "indexName is required".into(),
                ));
            }
        };

        let id = cmd.get("_id").ok().flatten().and_then(to_owned_raw);
        let shard_key = get_nonempty_document(cmd, "shardKey");
        let index_key = get_nonempty_document(cmd, "indexKey");

        let record_id = match cmd.get("recordId").ok().flatten() {
            None => None,
            Some(RawBsonRef::Int64(v)) => Some(RecordId(v)),
            Some(RawBsonRef::Int32(v)) => Some(RecordId(v as i64)),
            Some(_) => {
                return Err(DocshardError::InvalidArgument(
                    "recordId must be an integer".into(),
                ));
            }
        };

        let dry_run = matches!(
            cmd.get("dryRun").ok().flatten(),
            Some(RawBsonRef::Boolean(true))
        );

        if id.is_none() && index_key.is_none() {
            return Err(DocshardError::InvalidArgument(
                "must specify _id or indexKey".into(),
            ));
        }
        if action == RepairAction::Remove
            && index_key.is_some()
            && id.is_none()
            && record_id.is_none()
        {
            return Err(DocshardError::InvalidArgument(
                "recordId is required for remove with indexKey".into(),
            ));
        }

        Ok(Self {
            namespace,
            action,
            index_name,
            id,
            shard_key,
            index_key,
            record_id,
            dry_run,
        })
    }
}

fn get_nonempty_document(cmd: &RawDocument, field: &str) -> Option<RawDocumentBuf> {
    match cmd.get(field).ok().flatten() {
        Some(RawBsonRef::Document(doc)) if !doc.is_empty() => Some(doc.to_raw_document_buf()),
        _ => None,
    }
}

/// Everything the repair protocol needs from the server. The exclusive
/// catalog borrow stands in for the database and collection intent locks.
pub struct RepairContext<'a> {
    pub catalog: &'a mut Catalog,
    pub shard_locks: &'a ShardKeyLockManager,
    pub replica: &'a ReplicaRole,
}

/// Successful protocol outcome, before response encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    Inserted { keys_inserted: u64 },
    Removed { keys_removed: u64 },
    WouldInsert { key: RawDocumentBuf, record_id: RecordId },
    WouldRemove { key: RawDocumentBuf, record_id: RecordId },
}

/// Execute a parsed request against the catalog.
pub fn execute(ctx: RepairContext<'_>, request: &RepairRequest) -> Result<RepairOutcome, DocshardError> {
    let namespace = request.namespace.as_str();

    if !ctx.replica.can_accept_writes(namespace) {
        return Err(DocshardError::NotPrimary {
            namespace: namespace.to_string(),
        });
    }

    let collection =
        ctx.catalog
            .collection_mut(namespace)
            .ok_or_else(|| DocshardError::CollectionMissing {
                namespace: namespace.to_string(),
            })?;
    if collection.index_descriptor(&request.index_name).is_none() {
        return Err(DocshardError::IndexMissing {
            namespace: namespace.to_string(),
            index: request.index_name.clone(),
        });
    }

    // Serialize with other operations on the same shard-key value, when the
    // caller supplied one.
    let _shard_lock = request
        .shard_key
        .as_deref()
        .and_then(|key| ctx.shard_locks.acquire(namespace, key));

    // Locate the record and its document.
    let mut record_id = RecordId::NULL;
    let mut document: Option<RawDocumentBuf> = None;
    if let Some(id) = &request.id {
        let mut id_key = RawDocumentBuf::new();
        id_key.append("_id", id.clone());
        match collection.index_find_single(ID_INDEX_NAME, &id_key)? {
            Some(found) => {
                record_id = found;
                document = collection
                    .find_document(found)
                    .map(|d| d.to_raw_document_buf());
            }
            None => {
                if request.action == RepairAction::Insert {
                    return Err(DocshardError::DocumentMissing(format!(
                        "document not found with _id in '{namespace}'"
                    )));
                }
                // For remove, a missing document is the expected orphan case.
            }
        }
    } else if let Some(rid) = request.record_id {
        record_id = rid;
        document = collection
            .find_document(rid)
            .map(|d| d.to_raw_document_buf());
    }

    match request.action {
        RepairAction::Insert => {
            insert_entry(collection, request, document, record_id)
        }
        RepairAction::Remove => {
            remove_entry(collection, request, document, record_id)
        }
    }
}

fn insert_entry(
    collection: &mut crate::catalog::Collection,
    request: &RepairRequest,
    document: Option<RawDocumentBuf>,
    record_id: RecordId,
) -> Result<RepairOutcome, DocshardError> {
    let namespace = request.namespace.as_str();
    let Some(document) = document else {
        return Err(DocshardError::DocumentMissing(format!(
            "document does not exist in '{namespace}', cannot insert index entry"
        )));
    };

    let keys = collection.index_keys(&request.index_name, &document)?;
    if keys.is_empty() {
        return Err(DocshardError::InvalidArgument(
            "document generates no index keys".into(),
        ));
    }
    if keys.len() > 1 && request.index_key.is_none() {
        return Err(DocshardError::AmbiguousMatch {
            message: "document generates multiple index keys, please specify indexKey".into(),
            match_count: keys.len(),
        });
    }

    let key_to_insert = match &request.index_key {
        Some(user_key) => keys
            .iter()
            .find(|k| keys_equal(k, user_key))
            .cloned()
            .ok_or_else(|| {
                DocshardError::InvalidArgument(
                    "provided indexKey does not match any key generated from document".into(),
                )
            })?,
        None => keys[0].clone(),
    };

    let holders = collection.index_seek(&request.index_name, &key_to_insert)?;
    if holders.contains(&record_id) {
        return Err(DocshardError::AlreadyExists(
            "index entry already exists, no repair needed".into(),
        ));
    }

    if request.dry_run {
        return Ok(RepairOutcome::WouldInsert {
            key: key_to_insert,
            record_id,
        });
    }

    let keys_inserted = with_write_conflict_retry(namespace, REPAIR_COMMAND_FIELD, || {
        collection.index_insert(&request.index_name, &document, record_id)
    })?;
    info!(
        namespace,
        index = request.index_name.as_str(),
        keys_inserted,
        "repaired missing index entry"
    );
    Ok(RepairOutcome::Inserted { keys_inserted })
}

fn remove_entry(
    collection: &mut crate::catalog::Collection,
    request: &RepairRequest,
    document: Option<RawDocumentBuf>,
    record_id: RecordId,
) -> Result<RepairOutcome, DocshardError> {
    let namespace = request.namespace.as_str();

    // A live document keeps its index entries; refusing here stops a repair
    // from silently unindexing a healthy record.
    if request.index_key.is_some() && document.is_some() {
        return Err(DocshardError::DocumentStillExists(format!(
            "document still exists in '{namespace}', cannot remove as orphan index entry"
        )));
    }

    let (key_to_remove, location) = if let Some(user_key) = &request.index_key {
        let holders = collection.index_seek(&request.index_name, user_key)?;
        let match_count = holders.len();
        if match_count == 0 {
            return Err(DocshardError::NotFound("index entry not found".into()));
        }
        match request.record_id.filter(|rid| rid.is_normal()) {
            Some(rid) => {
                if !holders.contains(&rid) {
                    return Err(DocshardError::NotFound(
                        "index entry not found at specified recordId".into(),
                    ));
                }
                (user_key.clone(), rid)
            }
            None => {
                if match_count > 1 {
                    return Err(DocshardError::AmbiguousMatch {
                        message: "multiple index entries match, please provide recordId".into(),
                        match_count,
                    });
                }
                (user_key.clone(), holders[0])
            }
        }
    } else if let Some(document) = &document {
        let keys = collection.index_keys(&request.index_name, document)?;
        if keys.is_empty() {
            return Err(DocshardError::InvalidArgument(
                "document generates no index keys".into(),
            ));
        }
        if keys.len() > 1 {
            return Err(DocshardError::AmbiguousMatch {
                message: "document generates multiple index keys, please specify indexKey".into(),
                match_count: keys.len(),
            });
        }
        (keys[0].clone(), record_id)
    } else {
        return Err(DocshardError::InvalidArgument(
            "cannot determine index key to remove".into(),
        ));
    };

    if request.dry_run {
        return Ok(RepairOutcome::WouldRemove {
            key: key_to_remove,
            record_id: location,
        });
    }

    let removed = with_write_conflict_retry(namespace, REPAIR_COMMAND_FIELD, || {
        collection.index_remove_single(&request.index_name, &key_to_remove, location)
    })?;
    if !removed {
        return Err(DocshardError::NotFound("index entry not found".into()));
    }
    info!(
        namespace,
        index = request.index_name.as_str(),
        "removed orphan index entry"
    );
    Ok(RepairOutcome::Removed { keys_removed: 1 })
}

/// Parse, execute, and encode the wire response. Never fails: every error
/// becomes an `ok: 0` response carrying `errmsg` and the stable `code`.
pub fn run_command(ctx: RepairContext<'_>, db_name: &str, cmd: &RawDocument) -> RawDocumentBuf {
    let result = RepairRequest::parse(db_name, cmd).and_then(|request| execute(ctx, &request));
    match result {
        Ok(outcome) => encode_outcome(outcome),
        Err(err) => encode_error(&err),
    }
}

fn encode_outcome(outcome: RepairOutcome) -> RawDocumentBuf {
    let mut response = RawDocumentBuf::new();
    response.append("ok", 1i32);
    match outcome {
        RepairOutcome::Inserted { keys_inserted } => {
            response.append("keysInserted", keys_inserted as i64);
        }
        RepairOutcome::Removed { keys_removed } => {
            response.append("keysRemoved", keys_removed as i64);
        }
        RepairOutcome::WouldInsert { key, record_id } => {
            response.append("dryRun", true);
            response.append("wouldInsert", key);
            response.append("recordId", record_id.0);
        }
        RepairOutcome::WouldRemove { key, record_id } => {
            response.append("dryRun", true);
            response.append("wouldRemove", key);
            response.append("recordId", record_id.0);
        }
    }
    response
}

fn encode_error(err: &DocshardError) -> RawDocumentBuf {
    let mut response = RawDocumentBuf::new();
    response.append("ok", 0i32);
    response.append("errmsg", err.to_string());
    response.append("code", err.code_str());
    if let DocshardError::AmbiguousMatch { match_count, .. } = err {
        response.append("matchCount", *match_count as i64);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    #[test]
    fn parse_accepts_the_documented_shape() {
        let cmd = rawdoc! {
            "repairIndexEntry": "users",
            "action": "insert",
            "indexName": "idx_x",
            "_id": 7,
            "shardKey": { "region": "eu" },
            "indexKey": { "x": 42 },
            "recordId": 3_i64,
            "dryRun": true,
        };
        let request = RepairRequest::parse("db", &cmd).unwrap();
        assert_eq!(request.namespace, "db.users");
        assert_eq!(request.action, RepairAction::Insert);
        assert_eq!(request.index_name, "idx_x");
        assert!(request.id.is_some());
        assert!(request.shard_key.is_some());
        assert!(request.index_key.is_some());
        assert_eq!(request.record_id, Some(RecordId(3)));
        assert!(request.dry_run);
    }

    #[test]
    fn parse_rejects_missing_collection_action_and_index() {
        let no_coll = rawdoc! { "action": "insert", "indexName": "i", "_id": 1 };
        assert!(RepairRequest::parse("db", &no_coll).is_err());

        let bad_action = rawdoc! {
            "repairIndexEntry": "c", "action": "upsert", "indexName": "i", "_id": 1,
        };
        assert!(RepairRequest::parse("db", &bad_action).is_err());

        let no_index = rawdoc! { "repairIndexEntry": "c", "action": "insert", "_id": 1 };
        assert!(RepairRequest::parse("db", &no_index).is_err());
    }

    #[test]
    fn parse_requires_a_locator() {
        let cmd = rawdoc! { "repairIndexEntry": "c", "action": "insert", "indexName": "i" };
        let err = RepairRequest::parse("db", &cmd).unwrap_err();
        assert_eq!(err.code_str(), "invalid_argument");
    }

    #[test]
    fn parse_requires_record_id_for_keyed_remove() {
        let cmd = rawdoc! {
            "repairIndexEntry": "c",
            "action": "remove",
            "indexName": "i",
            "indexKey": { "x": 1 },
        };
        let err = RepairRequest::parse("db", &cmd).unwrap_err();
        assert_eq!(err.code_str(), "invalid_argument");

        let with_rid = rawdoc! {
            "repairIndexEntry": "c",
            "action": "remove",
            "indexName": "i",
            "indexKey": { "x": 1 },
            "recordId": 5_i64,
        };
        assert!(RepairRequest::parse("db", &with_rid).is_ok());
    }

    #[test]
    fn parse_ignores_empty_subdocuments() {
        let cmd = rawdoc! {
            "repairIndexEntry": "c",
            "action": "insert",
            "indexName": "i",
            "_id": 1,
            "shardKey": {},
            "indexKey": {},
        };
        let request = RepairRequest::parse("db", &cmd).unwrap();
        assert!(request.shard_key.is_none());
        assert!(request.index_key.is_none());
    }
}
