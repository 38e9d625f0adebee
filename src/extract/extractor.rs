//! One-pass field extraction over raw BSON documents.
//!
//! Callers register every path they will ever need (index fields, digest
//! fields), finalize the registry, then run `extract` once per document. Each
//! registered path gets a fixed slot; after the single traversal the value at
//! any slot is an O(1) read. Matching is driven by a 4-byte name signature
//! with full-name verification on hits, so signature collisions cost a spill
//! list probe instead of a wrong answer.

use super::dotted_path;
use super::signature::field_signature;
use bson::{RawBsonRef, RawDocument};
use compact_str::CompactString;
use std::collections::HashMap;

/// Hard cap on registered paths; slot ids fit a `u8` with one sentinel left.
pub const MAX_FIELDS: usize = 256;

/// Returned by registration when the registry is frozen or full.
pub const INVALID_SLOT: u8 = 255;

/// Field registry plus per-name slot lists. Not thread-safe; give each worker
/// thread its own instance and share nothing.
#[derive(Default)]
pub struct FieldExtractor {
    fields: Vec<CompactString>,
    is_nested: Vec<bool>,
    sig_to_slot: HashMap<u32, u8>,
    collision_slots: HashMap<u32, Vec<u8>>,
    top_level_slots: Vec<u8>,
    nested_slots: Vec<u8>,
    nested_prefixes: Vec<CompactString>,
    nested_prefix_sigs: HashMap<u32, Vec<u8>>,
    index_slots: HashMap<String, Vec<u8>>,
    digest_slots: HashMap<String, Vec<u8>>,
    finalized: bool,
}

/// Slot values extracted from one document. Borrows the document.
pub struct SlotTable<'a> {
    slots: Vec<Option<RawBsonRef<'a>>>,
    array_along_path: Vec<bool>,
    extracted: usize,
}

impl<'a> SlotTable<'a> {
    /// O(1) slot read; `None` when the path was absent from the document.
    pub fn get(&self, slot: u8) -> Option<RawBsonRef<'a>> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// True when the slot's path traversed an array, which means the stored
    /// element needs multikey expansion by the caller.
    pub fn has_array_along_path(&self, slot: u8) -> bool {
        self.array_along_path
            .get(slot as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Number of slots filled by the most recent extraction.
    pub fn extracted_count(&self) -> usize {
        self.extracted
    }
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single field path and return its slot.
    ///
    /// Duplicate registration returns the existing slot. After
    /// [`finalize`](Self::finalize), or once the registry is full, returns
    /// [`INVALID_SLOT`].
    pub fn register_field(&mut self, path: &str) -> u8 {
        if self.finalized {
            return INVALID_SLOT;
        }

        let sig = field_signature(path);
        if let Some(&slot) = self.sig_to_slot.get(&sig) {
            if self.fields[slot as usize].as_str() == path {
                return slot;
            }
            // Signature collision with the primary owner: the path may still
            // be registered somewhere, so fall back to a full scan.
            if let Some(pos) = self.fields.iter().position(|f| f.as_str() == path) {
                return pos as u8;
            }
        }
        if let Some(slots) = self.collision_slots.get(&sig) {
            for &slot in slots {
                if self.fields[slot as usize].as_str() == path {
                    return slot;
                }
            }
        }

        if self.fields.len() >= MAX_FIELDS - 1 {
            return INVALID_SLOT;
        }
        let slot = self.fields.len() as u8;
        self.fields.push(CompactString::from(path));

        if self.sig_to_slot.contains_key(&sig) {
            self.collision_slots.entry(sig).or_default().push(slot);
        } else {
            self.sig_to_slot.insert(sig, slot);
        }

        match path.split_once('.') {
            None => {
                self.top_level_slots.push(slot);
                self.is_nested.push(false);
            }
            Some((prefix, _)) => {
                self.nested_slots.push(slot);
                self.is_nested.push(true);
                self.nested_prefixes.push(CompactString::from(prefix));
            }
        }
        slot
    }

    /// Bulk-register an index's field paths and remember the slot list under
    /// the index name.
    pub fn register_index<I, S>(&mut self, index_name: &str, paths: I) -> Vec<u8>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slots = self.register_paths(paths);
        self.index_slots.insert(index_name.to_string(), slots.clone());
        slots
    }

    /// Bulk-register a digest's field paths and remember the slot list under
    /// the digest name.
    pub fn register_digest<I, S>(&mut self, digest_name: &str, paths: I) -> Vec<u8>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slots = self.register_paths(paths);
        self.digest_slots
            .insert(digest_name.to_string(), slots.clone());
        slots
    }

    fn register_paths<I, S>(&mut self, paths: I) -> Vec<u8>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut slots = Vec::new();
        for path in paths {
            let slot = self.register_field(path.as_ref());
            if slot != INVALID_SLOT {
                slots.push(slot);
            }
        }
        slots
    }

    /// Freeze the registry and build the nested-prefix dispatch table.
    /// Registration after this point returns [`INVALID_SLOT`].
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        for (i, &slot) in self.nested_slots.iter().enumerate() {
            let sig = field_signature(self.nested_prefixes[i].as_str());
            self.nested_prefix_sigs.entry(sig).or_default().push(slot);
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Extract every registered path from `doc` in a single pass over its
    /// top-level fields. Extraction before `finalize` yields an empty table.
    pub fn extract<'a>(&self, doc: &'a RawDocument) -> SlotTable<'a> {
        let mut table = SlotTable {
            slots: vec![None; self.fields.len()],
            array_along_path: vec![false; self.fields.len()],
            extracted: 0,
        };
        if !self.finalized {
            return table;
        }

        for item in doc.iter() {
            let Ok((name, value)) = item else {
                break;
            };
            let sig = field_signature(name);

            // Top-level fast path.
            if let Some(&slot) = self.sig_to_slot.get(&sig) {
                let s = slot as usize;
                if !self.is_nested[s] && self.fields[s].as_str() == name {
                    if table.slots[s].is_none() {
                        table.extracted += 1;
                    }
                    table.slots[s] = Some(value);
                }
            }

            // Collision spill list; only probed when a collision exists.
            if let Some(slots) = self.collision_slots.get(&sig) {
                for &slot in slots {
                    let s = slot as usize;
                    if !self.is_nested[s] && self.fields[s].as_str() == name {
                        if table.slots[s].is_none() {
                            table.extracted += 1;
                        }
                        table.slots[s] = Some(value);
                        break;
                    }
                }
            }

            // Nested paths rooted at this field.
            let is_container = matches!(
                value,
                RawBsonRef::Document(_) | RawBsonRef::Array(_)
            );
            if !is_container {
                continue;
            }
            let Some(slots) = self.nested_prefix_sigs.get(&sig) else {
                continue;
            };
            for &slot in slots {
                let s = slot as usize;
                if table.slots[s].is_some() {
                    continue;
                }
                let path = self.fields[s].as_str();
                let Some((prefix, rest)) = path.split_once('.') else {
                    continue;
                };
                if prefix != name {
                    continue;
                }
                match value {
                    RawBsonRef::Document(sub) => {
                        let found = dotted_path::element_at_path_or_array(sub, rest);
                        if let Some(elem) = found.element {
                            table.slots[s] = Some(elem);
                            table.extracted += 1;
                            if found.hit_array {
                                table.array_along_path[s] = true;
                            }
                        }
                    }
                    RawBsonRef::Array(_) => {
                        // Hand the array back whole; the caller performs
                        // multikey expansion against the remaining path.
                        table.slots[s] = Some(value);
                        table.array_along_path[s] = true;
                        table.extracted += 1;
                    }
                    _ => {}
                }
            }
        }
        table
    }

    pub fn field_path(&self, slot: u8) -> Option<&str> {
        self.fields.get(slot as usize).map(|f| f.as_str())
    }

    pub fn total_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn top_level_count(&self) -> usize {
        self.top_level_slots.len()
    }

    pub fn nested_count(&self) -> usize {
        self.nested_slots.len()
    }

    pub fn index_count(&self) -> usize {
        self.index_slots.len()
    }

    pub fn digest_count(&self) -> usize {
        self.digest_slots.len()
    }

    /// Number of slots living in collision spill lists.
    pub fn collision_count(&self) -> usize {
        self.collision_slots.values().map(Vec::len).sum()
    }

    pub fn index_slots(&self, index_name: &str) -> Option<&[u8]> {
        self.index_slots.get(index_name).map(Vec::as_slice)
    }

    pub fn digest_slots(&self, digest_name: &str) -> Option<&[u8]> {
        self.digest_slots.get(digest_name).map(Vec::as_slice)
    }

    /// Values for every slot of a registered index, in registration order.
    pub fn index_fields<'a>(
        &self,
        index_name: &str,
        table: &SlotTable<'a>,
    ) -> Option<Vec<Option<RawBsonRef<'a>>>> {
        self.index_slots
            .get(index_name)
            .map(|slots| slots.iter().map(|&s| table.get(s)).collect())
    }

    /// Values for every slot of a registered digest, in registration order.
    pub fn digest_fields<'a>(
        &self,
        digest_name: &str,
        table: &SlotTable<'a>,
    ) -> Option<Vec<Option<RawBsonRef<'a>>>> {
        self.digest_slots
            .get(digest_name)
            .map(|slots| slots.iter().map(|&s| table.get(s)).collect())
    }
}
