//! Canonical byte encoding of index-key documents.
//!
//! Index entries and probe keys are compared by bytes, so key documents are
//! canonicalized first: integral numerics collapse to Int64 regardless of
//! their wire type. Two keys that compare equal as values then share one byte
//! image, which makes a byte-ordered entry set seekable by any spelling of
//! the same key.

use crate::extract::to_owned_raw;
use bson::raw::{RawArrayBuf, RawBson};
use bson::{RawArray, RawBsonRef, RawDocument, RawDocumentBuf};
use smallvec::SmallVec;

/// Canonical bytes of a key document. Inline up to 64 bytes, which covers
/// typical single- and dual-field keys without an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn from_key_document(key: &RawDocument) -> Self {
        let canonical = canonicalize_key_document(key);
        Self {
            bytes: SmallVec::from_slice(canonical.as_bytes()),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Rebuild `key` with every numeric element in canonical form.
pub fn canonicalize_key_document(key: &RawDocument) -> RawDocumentBuf {
    let mut out = RawDocumentBuf::new();
    for (name, value) in key.iter().flatten() {
        if let Some(canonical) = canonical_value(value) {
            out.append(name, canonical);
        }
    }
    out
}

fn canonical_array(arr: &RawArray) -> RawArrayBuf {
    let mut out = RawArrayBuf::new();
    for item in arr.into_iter().flatten() {
        if let Some(canonical) = canonical_value(item) {
            out.push(canonical);
        }
    }
    out
}

fn canonical_value(value: RawBsonRef<'_>) -> Option<RawBson> {
    match value {
        RawBsonRef::Int32(v) => Some(RawBson::Int64(v as i64)),
        RawBsonRef::Int64(v) => Some(RawBson::Int64(v)),
        RawBsonRef::Double(d) if d.fract() == 0.0 && d.abs() < (i64::MAX as f64) => {
            Some(RawBson::Int64(d as i64))
        }
        RawBsonRef::Document(doc) => Some(RawBson::Document(canonicalize_key_document(doc))),
        RawBsonRef::Array(arr) => Some(RawBson::Array(canonical_array(arr))),
        other => to_owned_raw(other),
    }
}

/// Value equality of two key documents, via their canonical byte images.
pub fn keys_equal(a: &RawDocument, b: &RawDocument) -> bool {
    EncodedKey::from_key_document(a) == EncodedKey::from_key_document(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    #[test]
    fn numeric_spellings_share_one_encoding() {
        let int32 = rawdoc! { "x": 42_i32 };
        let int64 = rawdoc! { "x": 42_i64 };
        let double = rawdoc! { "x": 42.0 };
        let a = EncodedKey::from_key_document(&int32);
        let b = EncodedKey::from_key_document(&int64);
        let c = EncodedKey::from_key_document(&double);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn fractional_doubles_stay_doubles() {
        let frac = rawdoc! { "x": 2.5 };
        let whole = rawdoc! { "x": 2_i64 };
        assert!(!keys_equal(&frac, &whole));
    }

    #[test]
    fn distinct_values_encode_differently() {
        assert!(!keys_equal(&rawdoc! { "x": 1 }, &rawdoc! { "x": 2 }));
        assert!(!keys_equal(&rawdoc! { "x": 1 }, &rawdoc! { "y": 1 }));
    }

    #[test]
    fn canonicalization_descends_containers() {
        let a = rawdoc! { "k": { "inner": 7_i32 }, "arr": [1_i32, 2_i32] };
        let b = rawdoc! { "k": { "inner": 7_i64 }, "arr": [1_i64, 2_i64] };
        assert!(keys_equal(&a, &b));
    }

    #[test]
    fn non_numeric_values_pass_through() {
        let a = rawdoc! { "x": "name", "y": true };
        let b = rawdoc! { "x": "name", "y": true };
        assert!(keys_equal(&a, &b));
        assert_eq!(
            canonicalize_key_document(&a).as_bytes(),
            canonicalize_key_document(&b).as_bytes()
        );
    }

    #[test]
    fn small_keys_stay_inline() {
        let key = EncodedKey::from_key_document(&rawdoc! { "x": 1 });
        assert!(key.len() <= 64);
        assert!(!key.is_empty());
    }
}
