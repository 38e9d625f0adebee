//! Dot-separated path traversal over raw BSON documents.
//!
//! Shared by the field extractor and the index key generator. Intermediate
//! arrays terminate a traversal (the caller owns multikey expansion) unless
//! the next path component is a numeric position, in which case the traversal
//! descends into that array element directly.

use crate::util::DecimalCounter;
use bson::{RawArray, RawBsonRef, RawDocument};
use compact_str::CompactString;
use std::collections::HashMap;

/// Result of a path-or-array lookup.
#[derive(Debug, Clone, Copy)]
pub struct PathValue<'a> {
    /// The element at the path, the array that interrupted traversal, or
    /// `None` when the path does not resolve.
    pub element: Option<RawBsonRef<'a>>,
    /// True when traversal stopped at an array with path remaining; the
    /// caller must expand the array elements against the rest of the path.
    pub hit_array: bool,
}

impl<'a> PathValue<'a> {
    fn absent() -> Self {
        Self {
            element: None,
            hit_array: false,
        }
    }
}

fn get_field<'a>(doc: &'a RawDocument, name: &str) -> Option<RawBsonRef<'a>> {
    doc.get(name).ok().flatten()
}

fn split_first(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((head, tail)) => (head, tail),
        None => (path, ""),
    }
}

fn is_all_digits(component: &str) -> bool {
    !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit())
}

/// Element of `arr` at the decimal position spelled by `spelling`.
///
/// Walks the array against an incrementing [`DecimalCounter`], so spellings
/// with leading zeros never match a position (array keys carry none).
fn array_element_at<'a>(arr: &'a RawArray, spelling: &str) -> Option<RawBsonRef<'a>> {
    let mut counter = DecimalCounter::new();
    for item in arr {
        let item = item.ok()?;
        if counter.as_str() == spelling {
            return Some(item);
        }
        if counter.len() > spelling.len() {
            return None;
        }
        counter.incr();
    }
    None
}

/// Object-only traversal: resolve `path` descending through embedded
/// documents, with the literal whole-path field name checked first at every
/// level. Arrays never match.
pub fn element_at_path<'a>(doc: &'a RawDocument, path: &str) -> Option<RawBsonRef<'a>> {
    if let Some(direct) = get_field(doc, path) {
        return Some(direct);
    }
    let (left, right) = path.split_once('.')?;
    match get_field(doc, left)? {
        RawBsonRef::Document(sub) => element_at_path(sub, right),
        _ => None,
    }
}

/// Resolve `path`, treating an intermediate array as a terminal unless the
/// component that follows it is a numeric position.
pub fn element_at_path_or_array<'a>(doc: &'a RawDocument, path: &str) -> PathValue<'a> {
    let (head, tail) = split_first(path);
    match get_field(doc, head) {
        None => PathValue::absent(),
        Some(elem) => resolve(elem, tail),
    }
}

fn resolve<'a>(elem: RawBsonRef<'a>, rest: &str) -> PathValue<'a> {
    if rest.is_empty() {
        return PathValue {
            element: Some(elem),
            hit_array: false,
        };
    }
    match elem {
        RawBsonRef::Document(doc) => {
            let (head, tail) = split_first(rest);
            match get_field(doc, head) {
                None => PathValue::absent(),
                Some(child) => resolve(child, tail),
            }
        }
        RawBsonRef::Array(arr) => {
            let (head, tail) = split_first(rest);
            if !is_all_digits(head) {
                return PathValue {
                    element: Some(elem),
                    hit_array: true,
                };
            }
            match array_element_at(arr, head) {
                None => PathValue::absent(),
                Some(child) => resolve(child, tail),
            }
        }
        _ => PathValue::absent(),
    }
}

enum Node<'a> {
    Doc(&'a RawDocument),
    Arr(&'a RawArray),
}

fn node_get<'a>(node: &Node<'a>, name: &str) -> Option<RawBsonRef<'a>> {
    match node {
        Node::Doc(doc) => get_field(doc, name),
        Node::Arr(arr) => {
            if is_all_digits(name) {
                array_element_at(arr, name)
            } else {
                None
            }
        }
    }
}

/// Collect every element reachable along `path`, fanning out across arrays.
///
/// With `expand_trailing_array` set, an array at the final component
/// contributes its elements instead of itself. Returns true when any array
/// with more than one element was fanned out or expanded, which is the
/// multikey signal for index key generation.
pub fn extract_all_elements_along_path<'a>(
    doc: &'a RawDocument,
    path: &str,
    expand_trailing_array: bool,
    out: &mut Vec<RawBsonRef<'a>>,
) -> bool {
    let mut saw_array = false;
    walk(Node::Doc(doc), path, expand_trailing_array, out, &mut saw_array);
    saw_array
}

fn walk<'a>(
    node: Node<'a>,
    path: &str,
    expand: bool,
    out: &mut Vec<RawBsonRef<'a>>,
    saw_array: &mut bool,
) {
    // Literal whole-path field name wins at every level.
    if let Some(elem) = node_get(&node, path) {
        if let RawBsonRef::Array(arr) = elem {
            if expand {
                let mut n = 0usize;
                for item in arr.into_iter().flatten() {
                    out.push(item);
                    n += 1;
                }
                if n > 1 {
                    *saw_array = true;
                }
                return;
            }
        }
        out.push(elem);
        return;
    }

    let Some((left, next)) = path.split_once('.') else {
        return;
    };
    let Some(elem) = node_get(&node, left) else {
        return;
    };
    match elem {
        RawBsonRef::Document(sub) => walk(Node::Doc(sub), next, expand, out, saw_array),
        RawBsonRef::Array(arr) => {
            let (first, _) = split_first(next);
            if is_all_digits(first) {
                walk(Node::Arr(arr), next, expand, out, saw_array);
                return;
            }
            let mut n = 0usize;
            for item in arr.into_iter().flatten() {
                n += 1;
                match item {
                    RawBsonRef::Document(sub) => walk(Node::Doc(sub), next, expand, out, saw_array),
                    RawBsonRef::Array(sub) => walk(Node::Arr(sub), next, expand, out, saw_array),
                    _ => {}
                }
            }
            if n > 1 {
                *saw_array = true;
            }
        }
        _ => {}
    }
}

/// Per-document cache of nested-path lookups.
///
/// Amortizes the repeated path extraction a multi-index insert performs on
/// one document. Top-level paths bypass the cache; a direct field get is
/// already as cheap as the probe. The cache is bound to one document: build a
/// fresh one (or call [`PathCache::reset`]) when the document changes.
pub struct PathCache<'a> {
    doc: &'a RawDocument,
    entries: HashMap<CompactString, (Option<RawBsonRef<'a>>, bool)>,
}

impl<'a> PathCache<'a> {
    pub fn new(doc: &'a RawDocument) -> Self {
        Self {
            doc,
            entries: HashMap::new(),
        }
    }

    /// Swap in a different document, invalidating every entry.
    pub fn reset(&mut self, doc: &'a RawDocument) {
        if !std::ptr::eq(self.doc.as_bytes().as_ptr(), doc.as_bytes().as_ptr()) {
            self.doc = doc;
            self.entries.clear();
        }
    }

    pub fn element_at_path_or_array(&mut self, path: &str) -> PathValue<'a> {
        if !path.contains('.') {
            return element_at_path_or_array(self.doc, path);
        }
        if let Some(&(element, hit_array)) = self.entries.get(path) {
            return PathValue { element, hit_array };
        }
        let value = element_at_path_or_array(self.doc, path);
        self.entries
            .insert(CompactString::from(path), (value.element, value.hit_array));
        value
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    fn as_i32(v: RawBsonRef<'_>) -> i32 {
        match v {
            RawBsonRef::Int32(n) => n,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    #[test]
    fn object_only_traversal_descends_documents() {
        let doc = rawdoc! { "a": { "b": { "c": 7 } } };
        let elem = element_at_path(&doc, "a.b.c").unwrap();
        assert_eq!(as_i32(elem), 7);
        assert!(element_at_path(&doc, "a.b.d").is_none());
        assert!(element_at_path(&doc, "a.c").is_none());
    }

    #[test]
    fn literal_dotted_field_name_wins() {
        let doc = rawdoc! { "a.b": 1, "a": { "b": 2 } };
        let elem = element_at_path(&doc, "a.b").unwrap();
        assert_eq!(as_i32(elem), 1);
    }

    #[test]
    fn array_interrupts_traversal_with_flag() {
        let doc = rawdoc! { "a": { "b": [ { "c": 1 }, { "c": 2 } ] } };
        let value = element_at_path_or_array(&doc, "a.b.c");
        assert!(value.hit_array);
        assert!(matches!(value.element, Some(RawBsonRef::Array(_))));
    }

    #[test]
    fn trailing_component_returns_element_without_flag() {
        let doc = rawdoc! { "a": { "b": 5 } };
        let value = element_at_path_or_array(&doc, "a.b");
        assert!(!value.hit_array);
        assert_eq!(as_i32(value.element.unwrap()), 5);
    }

    #[test]
    fn numeric_component_indexes_into_array() {
        let doc = rawdoc! { "a": [ { "b": 10 }, { "b": 20 } ] };
        let value = element_at_path_or_array(&doc, "a.1.b");
        assert!(!value.hit_array);
        assert_eq!(as_i32(value.element.unwrap()), 20);

        let out_of_range = element_at_path_or_array(&doc, "a.5.b");
        assert!(out_of_range.element.is_none());
    }

    #[test]
    fn leading_zero_positions_never_match() {
        let doc = rawdoc! { "a": [ 1, 2, 3 ] };
        assert!(element_at_path_or_array(&doc, "a.01").element.is_none());
        assert_eq!(
            as_i32(element_at_path_or_array(&doc, "a.1").element.unwrap()),
            2
        );
    }

    #[test]
    fn missing_path_is_absent_not_error() {
        let doc = rawdoc! { "a": 1 };
        let value = element_at_path_or_array(&doc, "b.c");
        assert!(value.element.is_none());
        assert!(!value.hit_array);
    }

    #[test]
    fn scalar_mid_path_is_absent() {
        let doc = rawdoc! { "a": 3 };
        assert!(element_at_path_or_array(&doc, "a.b").element.is_none());
    }

    #[test]
    fn extract_all_fans_out_across_arrays() {
        let doc = rawdoc! { "a": [ { "b": 1 }, { "b": 2 }, { "c": 3 } ] };
        let mut out = Vec::new();
        let saw = extract_all_elements_along_path(&doc, "a.b", true, &mut out);
        assert!(saw);
        assert_eq!(out.len(), 2);
        assert_eq!(as_i32(out[0]), 1);
        assert_eq!(as_i32(out[1]), 2);
    }

    #[test]
    fn extract_all_expands_trailing_array() {
        let doc = rawdoc! { "a": { "b": [ 4, 5 ] } };
        let mut out = Vec::new();
        let saw = extract_all_elements_along_path(&doc, "a.b", true, &mut out);
        assert!(saw);
        assert_eq!(out.len(), 2);

        let mut unexpanded = Vec::new();
        let saw = extract_all_elements_along_path(&doc, "a.b", false, &mut unexpanded);
        assert!(!saw);
        assert_eq!(unexpanded.len(), 1);
        assert!(matches!(unexpanded[0], RawBsonRef::Array(_)));
    }

    #[test]
    fn extract_all_numeric_component_descends() {
        let doc = rawdoc! { "a": [ { "b": 1 }, { "b": 2 } ] };
        let mut out = Vec::new();
        extract_all_elements_along_path(&doc, "a.0.b", true, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(as_i32(out[0]), 1);
    }

    #[test]
    fn path_cache_reuses_nested_lookups() {
        let doc = rawdoc! { "a": { "b": { "c": 9 } }, "top": 1 };
        let mut cache = PathCache::new(&doc);
        let first = cache.element_at_path_or_array("a.b.c");
        let second = cache.element_at_path_or_array("a.b.c");
        assert_eq!(as_i32(first.element.unwrap()), 9);
        assert_eq!(as_i32(second.element.unwrap()), 9);
        assert_eq!(cache.cached_len(), 1);

        // Top-level lookups bypass the cache.
        cache.element_at_path_or_array("top");
        assert_eq!(cache.cached_len(), 1);
    }

    #[test]
    fn path_cache_reset_invalidates_on_new_document() {
        let first = rawdoc! { "a": { "b": 1 } };
        let second = rawdoc! { "a": { "b": 2 } };
        let mut cache = PathCache::new(&first);
        assert_eq!(
            as_i32(cache.element_at_path_or_array("a.b").element.unwrap()),
            1
        );
        cache.reset(&second);
        assert_eq!(
            as_i32(cache.element_at_path_or_array("a.b").element.unwrap()),
            2
        );
    }
}
