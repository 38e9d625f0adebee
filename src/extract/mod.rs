//! BSON field extraction: signature-indexed one-pass extraction plus the
//! dotted-path helpers it shares with index key generation.

pub mod dotted_path;
mod extractor;
mod signature;

pub use dotted_path::{
    element_at_path, element_at_path_or_array, extract_all_elements_along_path, PathCache,
    PathValue,
};
pub use extractor::{FieldExtractor, SlotTable, INVALID_SLOT, MAX_FIELDS};
pub use signature::field_signature;

use bson::raw::{RawArrayBuf, RawBson};
use bson::RawBsonRef;

/// Convert a borrowed element into its owned form for re-appending into a
/// built document. Returns `None` for deprecated element types this crate
/// never produces.
pub fn to_owned_raw(value: RawBsonRef<'_>) -> Option<RawBson> {
    match value {
        RawBsonRef::Double(v) => Some(RawBson::Double(v)),
        RawBsonRef::String(v) => Some(RawBson::String(v.to_string())),
        RawBsonRef::Document(doc) => Some(RawBson::Document(doc.to_raw_document_buf())),
        RawBsonRef::Array(arr) => {
            let mut out = RawArrayBuf::new();
            for item in arr {
                out.push(to_owned_raw(item.ok()?)?);
            }
            Some(RawBson::Array(out))
        }
        RawBsonRef::Boolean(v) => Some(RawBson::Boolean(v)),
        RawBsonRef::Null => Some(RawBson::Null),
        RawBsonRef::Int32(v) => Some(RawBson::Int32(v)),
        RawBsonRef::Int64(v) => Some(RawBson::Int64(v)),
        RawBsonRef::ObjectId(v) => Some(RawBson::ObjectId(v)),
        RawBsonRef::DateTime(v) => Some(RawBson::DateTime(v)),
        RawBsonRef::Timestamp(v) => Some(RawBson::Timestamp(v)),
        RawBsonRef::Decimal128(v) => Some(RawBson::Decimal128(v)),
        RawBsonRef::Binary(v) => Some(RawBson::Binary(bson::Binary {
            subtype: v.subtype,
            bytes: v.bytes.to_vec(),
        })),
        RawBsonRef::RegularExpression(v) => Some(RawBson::RegularExpression(
            bson::Regex {
                pattern: v.pattern.to_string(),
                options: v.options.to_string(),
            },
        )),
        RawBsonRef::JavaScriptCode(v) => Some(RawBson::JavaScriptCode(v.to_string())),
        RawBsonRef::Symbol(v) => Some(RawBson::Symbol(v.to_string())),
        RawBsonRef::MinKey => Some(RawBson::MinKey),
        RawBsonRef::MaxKey => Some(RawBson::MaxKey),
        RawBsonRef::Undefined => Some(RawBson::Undefined),
        _ => None,
    }
}
