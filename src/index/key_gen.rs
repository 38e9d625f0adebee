//! Index key generation.
//!
//! Projects a document under an index key pattern, expanding arrays on the
//! trailing path component (multikey). Strict about what the original engine
//! rejects: a document may fan out along at most one pattern field, since
//! parallel arrays have no meaningful key product.

use crate::error::DocshardError;
use crate::extract::dotted_path::{extract_all_elements_along_path, PathCache};
use crate::extract::to_owned_raw;
use crate::storage::encoded_key::EncodedKey;
use bson::raw::RawBson;
use bson::{RawBsonRef, RawDocument, RawDocumentBuf};
use std::collections::BTreeSet;

/// All keys `doc` produces under `key_pattern`, deduplicated by canonical
/// byte image, in first-occurrence order. Missing paths key as Null.
pub fn generate_index_keys<'a>(
    key_pattern: &RawDocument,
    doc: &'a RawDocument,
    cache: &mut PathCache<'a>,
) -> Result<Vec<RawDocumentBuf>, DocshardError> {
    let mut fields: Vec<(&str, Vec<Option<RawBson>>)> = Vec::new();
    let mut multi_field: Option<String> = None;

    for (name, _direction) in key_pattern.iter().flatten() {
        let probe = cache.element_at_path_or_array(name);
        let needs_expansion =
            probe.hit_array || matches!(probe.element, Some(RawBsonRef::Array(_)));

        let values: Vec<Option<RawBson>> = if needs_expansion {
            let mut elements = Vec::new();
            extract_all_elements_along_path(doc, name, true, &mut elements);
            if elements.is_empty() {
                vec![None]
            } else {
                elements.into_iter().map(to_owned_raw).collect()
            }
        } else {
            match probe.element {
                None => vec![None],
                Some(elem) => vec![to_owned_raw(elem)],
            }
        };

        if values.len() > 1 {
            if let Some(prior) = &multi_field {
                return Err(DocshardError::InvalidArgument(format!(
                    "cannot index parallel arrays: '{prior}' and '{name}'"
                )));
            }
            multi_field = Some(name.to_string());
        }
        fields.push((name, values));
    }

    let key_count = fields.iter().map(|(_, v)| v.len()).max().unwrap_or(1);
    let mut keys = Vec::new();
    let mut seen: BTreeSet<EncodedKey> = BTreeSet::new();
    for i in 0..key_count {
        let mut key = RawDocumentBuf::new();
        for (name, values) in &fields {
            let value = if values.len() == 1 { &values[0] } else { &values[i] };
            match value {
                Some(v) => key.append(*name, v.clone()),
                None => key.append(*name, RawBson::Null),
            }
        }
        if seen.insert(EncodedKey::from_key_document(&key)) {
            keys.push(key);
        }
    }
    Ok(keys)
}
