//! Document integrity hashing.
//!
//! Documents may carry a reserved `_$docHash` field holding the xxHash64 of
//! the document's byte form with that field removed. Drivers write the field
//! first, which enables a skip-ahead hash that never materializes a filtered
//! copy; documents rewritten by third-party clients can carry it anywhere and
//! fall back to a rebuild.

use crate::error::DocshardError;
use crate::extract::to_owned_raw;
use bson::{RawBsonRef, RawDocument, RawDocumentBuf};
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Reserved field name. Must hold a 64-bit integer.
pub const DOC_HASH_FIELD: &str = "_$docHash";

const HASH_SEED: u64 = 0;

// type byte + field name + NUL + 8-byte payload
const HASH_ELEMENT_LEN: usize = 1 + DOC_HASH_FIELD.len() + 1 + 8;

fn hash_field(doc: &RawDocument) -> Option<RawBsonRef<'_>> {
    doc.get(DOC_HASH_FIELD).ok().flatten()
}

/// Hash of the document's byte form with the reserved field excluded.
///
/// Fast paths: no reserved field hashes the whole byte range in one shot; a
/// leading `_$docHash` of the expected type skips the element and hashes the
/// remainder under an adjusted length header. Only a misplaced or mistyped
/// reserved field pays for a filtered rebuild. All three paths hash exactly
/// the byte image of [`strip_hash_field`]'s output.
pub fn compute_document_hash(doc: &RawDocument) -> u64 {
    if hash_field(doc).is_none() {
        return xxh64(doc.as_bytes(), HASH_SEED);
    }

    if let Some(Ok((name, RawBsonRef::Int64(_)))) = doc.iter().next() {
        if name == DOC_HASH_FIELD {
            let bytes = doc.as_bytes();
            let stripped_len = (bytes.len() - HASH_ELEMENT_LEN) as i32;
            let mut hasher = Xxh64::new(HASH_SEED);
            hasher.update(&stripped_len.to_le_bytes());
            hasher.update(&bytes[4 + HASH_ELEMENT_LEN..]);
            return hasher.digest();
        }
    }

    let stripped = strip_hash_field(doc);
    xxh64(stripped.as_bytes(), HASH_SEED)
}

/// The stored hash, when present with the required type.
///
/// Returns `None` both when the field is absent and when it is present with a
/// non-Int64 type; callers that need to tell the two apart check the field's
/// presence separately, as [`verify_document_integrity`] does.
pub fn extract_document_hash(doc: &RawDocument) -> Option<u64> {
    match hash_field(doc) {
        Some(RawBsonRef::Int64(v)) => Some(v as u64),
        _ => None,
    }
}

/// Check the stored hash against the document's content.
///
/// Absent field is success (nothing to verify); a present field of the wrong
/// type is a type mismatch; a present hash that disagrees with the content is
/// an integrity mismatch.
pub fn verify_document_integrity(doc: &RawDocument) -> Result<(), DocshardError> {
    let Some(expected) = extract_document_hash(doc) else {
        if hash_field(doc).is_some() {
            return Err(DocshardError::TypeMismatch {
                message: format!("{DOC_HASH_FIELD} is a reserved field and must be a 64-bit integer"),
            });
        }
        return Ok(());
    };

    let actual = compute_document_hash(doc);
    if actual != expected {
        return Err(DocshardError::IntegrityMismatch {
            message: format!("expected hash {expected}, actual hash {actual}"),
        });
    }
    Ok(())
}

/// Copy of `doc` with the reserved field removed. Idempotent.
pub fn strip_hash_field(doc: &RawDocument) -> RawDocumentBuf {
    if hash_field(doc).is_none() {
        return doc.to_raw_document_buf();
    }
    let mut out = RawDocumentBuf::new();
    for item in doc.iter().flatten() {
        let (name, value) = item;
        if name == DOC_HASH_FIELD {
            continue;
        }
        if let Some(owned) = to_owned_raw(value) {
            out.append(name, owned);
        }
    }
    out
}
