//! Index access methods over a collection's shared entry set.
//!
//! Every index entry is one byte string in a collection-wide ordered set:
//! `ident_prefix | canonical_key_bytes | record_id_be`. The ident prefix
//! namespaces indexes, the canonical key bytes make value-equal keys
//! byte-equal, and the record-id tail keeps entries unique per location.
//! Entry assembly runs through the thread-local key buffer pool, since the
//! multi-index insert path builds these in a tight loop.

pub mod key_gen;

use crate::catalog::Collection;
use crate::error::DocshardError;
use crate::extract::dotted_path::PathCache;
use crate::storage::encoded_key::EncodedKey;
use crate::storage::RecordId;
use crate::util::with_key_buffer;
use bson::{RawDocument, RawDocumentBuf};
use std::ops::Bound;

const RECORD_ID_TAIL: usize = 8;

fn push_probe(buf: &mut Vec<u8>, ordinal: u32, key: &EncodedKey) {
    buf.extend_from_slice(&ordinal.to_be_bytes());
    buf.extend_from_slice(key.as_slice());
}

fn record_id_of(entry: &[u8]) -> RecordId {
    let mut tail = [0u8; RECORD_ID_TAIL];
    tail.copy_from_slice(&entry[entry.len() - RECORD_ID_TAIL..]);
    RecordId::from_be_bytes(tail)
}

impl Collection {
    fn descriptor_or_err(
        &self,
        index_name: &str,
    ) -> Result<(u32, bool, &RawDocument), DocshardError> {
        match self.index_descriptor(index_name) {
            Some(descriptor) => Ok((
                descriptor.ordinal,
                descriptor.unique,
                &*descriptor.key_pattern,
            )),
            None => Err(DocshardError::IndexMissing {
                namespace: self.namespace().to_string(),
                index: index_name.to_string(),
            }),
        }
    }

    /// All keys `doc` generates for the named index, in strict mode.
    pub fn index_keys(
        &self,
        index_name: &str,
        doc: &RawDocument,
    ) -> Result<Vec<RawDocumentBuf>, DocshardError> {
        let mut cache = PathCache::new(doc);
        self.index_keys_with_cache(index_name, doc, &mut cache)
    }

    pub(crate) fn index_keys_with_cache<'a>(
        &self,
        index_name: &str,
        doc: &'a RawDocument,
        cache: &mut PathCache<'a>,
    ) -> Result<Vec<RawDocumentBuf>, DocshardError> {
        let (_, _, key_pattern) = self.descriptor_or_err(index_name)?;
        key_gen::generate_index_keys(key_pattern, doc, cache)
    }

    /// Insert every key `doc` generates into the index. Returns the number of
    /// entries that were actually new.
    pub fn index_insert(
        &mut self,
        index_name: &str,
        doc: &RawDocument,
        record_id: RecordId,
    ) -> Result<u64, DocshardError> {
        let mut cache = PathCache::new(doc);
        self.index_insert_with_cache(index_name, doc, record_id, &mut cache)
    }

    pub(crate) fn index_insert_with_cache<'a>(
        &mut self,
        index_name: &str,
        doc: &'a RawDocument,
        record_id: RecordId,
        cache: &mut PathCache<'a>,
    ) -> Result<u64, DocshardError> {
        let keys = self.index_keys_with_cache(index_name, doc, cache)?;
        let (ordinal, unique, _) = self.descriptor_or_err(index_name)?;

        let mut inserted = 0u64;
        for key in &keys {
            let encoded = EncodedKey::from_key_document(key);
            if unique {
                let holders = self.equal_key_record_ids(ordinal, &encoded);
                if holders.iter().any(|&rid| rid != record_id) {
                    return Err(DocshardError::Conflict(format!(
                        "duplicate key for unique index '{index_name}' on '{}'",
                        self.namespace()
                    )));
                }
            }
            let entry = with_key_buffer(|buf| {
                push_probe(buf, ordinal, &encoded);
                buf.extend_from_slice(&record_id.to_be_bytes());
                buf.clone()
            });
            if self.index_data.insert(entry) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Remove one `(key, record_id)` entry. Returns whether it existed.
    pub fn index_remove_single(
        &mut self,
        index_name: &str,
        key: &RawDocument,
        record_id: RecordId,
    ) -> Result<bool, DocshardError> {
        let (ordinal, _, _) = self.descriptor_or_err(index_name)?;
        let encoded = EncodedKey::from_key_document(key);
        let removed = with_key_buffer(|buf| {
            push_probe(buf, ordinal, &encoded);
            buf.extend_from_slice(&record_id.to_be_bytes());
            self.index_data.remove(buf.as_slice())
        });
        Ok(removed)
    }

    /// First record id holding an entry equal to `key`, if any.
    pub fn index_find_single(
        &self,
        index_name: &str,
        key: &RawDocument,
    ) -> Result<Option<RecordId>, DocshardError> {
        Ok(self.index_seek(index_name, key)?.into_iter().next())
    }

    /// All record ids holding entries equal to `key`, in entry order.
    pub fn index_seek(
        &self,
        index_name: &str,
        key: &RawDocument,
    ) -> Result<Vec<RecordId>, DocshardError> {
        let (ordinal, _, _) = self.descriptor_or_err(index_name)?;
        let encoded = EncodedKey::from_key_document(key);
        Ok(self.equal_key_record_ids(ordinal, &encoded))
    }

    /// Insert a raw `(key, record_id)` entry without generating keys from a
    /// document. This is how tests manufacture orphan entries.
    pub fn index_insert_entry(
        &mut self,
        index_name: &str,
        key: &RawDocument,
        record_id: RecordId,
    ) -> Result<bool, DocshardError> {
        let (ordinal, _, _) = self.descriptor_or_err(index_name)?;
        let encoded = EncodedKey::from_key_document(key);
        let entry = with_key_buffer(|buf| {
            push_probe(buf, ordinal, &encoded);
            buf.extend_from_slice(&record_id.to_be_bytes());
            buf.clone()
        });
        Ok(self.index_data.insert(entry))
    }

    /// Remove every entry `doc` generates for the index.
    pub(crate) fn index_remove_document(
        &mut self,
        index_name: &str,
        doc: &RawDocument,
        record_id: RecordId,
    ) -> Result<(), DocshardError> {
        let keys = self.index_keys(index_name, doc)?;
        for key in &keys {
            self.index_remove_single(index_name, key, record_id)?;
        }
        Ok(())
    }

    /// Count of entries for one index (diagnostics and tests).
    pub fn index_entry_count(&self, index_name: &str) -> Result<usize, DocshardError> {
        let (ordinal, _, _) = self.descriptor_or_err(index_name)?;
        let prefix = ordinal.to_be_bytes();
        Ok(self
            .index_data
            .range::<[u8], _>((Bound::Included(prefix.as_slice()), Bound::Unbounded))
            .take_while(|entry| entry.starts_with(&prefix))
            .count())
    }

    fn equal_key_record_ids(&self, ordinal: u32, key: &EncodedKey) -> Vec<RecordId> {
        with_key_buffer(|probe| {
            push_probe(probe, ordinal, key);
            self.index_data
                .range::<[u8], _>((Bound::Included(probe.as_slice()), Bound::Unbounded))
                .take_while(|entry| entry.starts_with(probe.as_slice()))
                .filter(|entry| entry.len() == probe.len() + RECORD_ID_TAIL)
                .map(|entry| record_id_of(entry))
                .collect()
        })
    }
}
