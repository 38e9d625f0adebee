//! Collection catalog for the in-memory storage engine.
//!
//! A collection owns its documents, its index descriptors, and a single
//! byte-ordered entry set shared by every index (entries are namespaced by a
//! per-index ident prefix). The index access methods live in
//! [`crate::index`].

use crate::error::DocshardError;
use crate::storage::RecordId;
use bson::{RawDocument, RawDocumentBuf};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const ID_INDEX_NAME: &str = "_id_";

/// Definition of one index over a collection.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    /// Key pattern document, e.g. `{x: 1}`; field order defines key order.
    pub key_pattern: RawDocumentBuf,
    pub unique: bool,
    /// Ident prefix namespacing this index's entries in the shared entry set.
    pub(crate) ordinal: u32,
}

pub struct Collection {
    namespace: String,
    next_record_id: i64,
    next_index_ordinal: u32,
    pub(crate) documents: BTreeMap<RecordId, RawDocumentBuf>,
    pub(crate) index_data: BTreeSet<Vec<u8>>,
    pub(crate) indexes: Vec<IndexDescriptor>,
}

impl Collection {
    fn new(namespace: &str) -> Result<Self, DocshardError> {
        let mut collection = Self {
            namespace: namespace.to_string(),
            next_record_id: 0,
            next_index_ordinal: 0,
            documents: BTreeMap::new(),
            index_data: BTreeSet::new(),
            indexes: Vec::new(),
        };
        collection.create_index(ID_INDEX_NAME, bson::rawdoc! { "_id": 1 }, true)?;
        Ok(collection)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn record_count(&self) -> usize {
        self.documents.len()
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.iter().map(|d| d.name.as_str())
    }

    pub fn index_descriptor(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|d| d.name == name)
    }

    /// Create an index and backfill entries for existing documents.
    pub fn create_index(
        &mut self,
        name: &str,
        key_pattern: RawDocumentBuf,
        unique: bool,
    ) -> Result<(), DocshardError> {
        if self.index_descriptor(name).is_some() {
            return Err(DocshardError::AlreadyExists(format!(
                "index '{name}' on '{}'",
                self.namespace
            )));
        }
        let descriptor = IndexDescriptor {
            name: name.to_string(),
            key_pattern,
            unique,
            ordinal: self.next_index_ordinal,
        };
        self.next_index_ordinal += 1;
        self.indexes.push(descriptor);

        let existing: Vec<(RecordId, RawDocumentBuf)> = self
            .documents
            .iter()
            .map(|(id, doc)| (*id, doc.clone()))
            .collect();
        for (record_id, doc) in existing {
            self.index_insert(name, &doc, record_id)?;
        }
        Ok(())
    }

    /// Insert a document, assign its record id, and maintain every index.
    pub fn insert_document(&mut self, doc: &RawDocument) -> Result<RecordId, DocshardError> {
        if doc.get("_id").ok().flatten().is_none() {
            return Err(DocshardError::InvalidArgument(format!(
                "document inserted into '{}' must carry _id",
                self.namespace
            )));
        }
        self.next_record_id += 1;
        let record_id = RecordId(self.next_record_id);
        let owned = doc.to_raw_document_buf();
        let index_names: Vec<String> = self.indexes.iter().map(|d| d.name.clone()).collect();
        {
            // One path cache amortizes key generation across all indexes.
            let mut cache = crate::extract::PathCache::new(&owned);
            for name in &index_names {
                if let Err(err) = self.index_insert_with_cache(name, &owned, record_id, &mut cache)
                {
                    // Roll the partially indexed document back out.
                    for cleanup in &index_names {
                        let _ = self.index_remove_document(cleanup, &owned, record_id);
                    }
                    return Err(err);
                }
            }
        }
        self.documents.insert(record_id, owned);
        Ok(record_id)
    }

    pub fn find_document(&self, record_id: RecordId) -> Option<&RawDocument> {
        self.documents.get(&record_id).map(|d| d.as_ref())
    }

    /// Remove a document and all of its index entries.
    pub fn remove_document(&mut self, record_id: RecordId) -> Result<bool, DocshardError> {
        let Some(doc) = self.documents.remove(&record_id) else {
            return Ok(false);
        };
        let index_names: Vec<String> = self.indexes.iter().map(|d| d.name.clone()).collect();
        for name in &index_names {
            self.index_remove_document(name, &doc, record_id)?;
        }
        Ok(true)
    }
}

/// Process-wide collection registry. The embedder decides locking; an
/// exclusive borrow of the catalog stands in for database and collection
/// intent-exclusive locks.
#[derive(Default)]
pub struct Catalog {
    collections: HashMap<String, Collection>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_collection(&mut self, namespace: &str) -> Result<&mut Collection, DocshardError> {
        if self.collections.contains_key(namespace) {
            return Err(DocshardError::AlreadyExists(format!(
                "collection '{namespace}'"
            )));
        }
        let collection = Collection::new(namespace)?;
        Ok(self
            .collections
            .entry(namespace.to_string())
            .or_insert(collection))
    }

    pub fn collection(&self, namespace: &str) -> Option<&Collection> {
        self.collections.get(namespace)
    }

    pub fn collection_mut(&mut self, namespace: &str) -> Option<&mut Collection> {
        self.collections.get_mut(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    #[test]
    fn collections_are_created_with_id_index() {
        let mut catalog = Catalog::new();
        let coll = catalog.create_collection("db.users").unwrap();
        assert!(coll.index_descriptor(ID_INDEX_NAME).is_some());
        assert!(catalog.create_collection("db.users").is_err());
    }

    #[test]
    fn documents_require_an_id() {
        let mut catalog = Catalog::new();
        let coll = catalog.create_collection("db.users").unwrap();
        let err = coll.insert_document(&rawdoc! { "x": 1 }).unwrap_err();
        assert_eq!(err.code_str(), "invalid_argument");
    }

    #[test]
    fn insert_find_remove_round_trip() {
        let mut catalog = Catalog::new();
        let coll = catalog.create_collection("db.users").unwrap();
        let doc = rawdoc! { "_id": 1, "name": "ada" };
        let record_id = coll.insert_document(&doc).unwrap();
        assert!(record_id.is_normal());
        assert_eq!(
            coll.find_document(record_id).unwrap().as_bytes(),
            doc.as_bytes()
        );
        assert!(coll.remove_document(record_id).unwrap());
        assert!(coll.find_document(record_id).is_none());
        assert!(!coll.remove_document(record_id).unwrap());
        assert!(coll.index_data.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected_and_rolled_back() {
        let mut catalog = Catalog::new();
        let coll = catalog.create_collection("db.users").unwrap();
        coll.insert_document(&rawdoc! { "_id": 1 }).unwrap();
        let entries_before = coll.index_data.len();
        let err = coll.insert_document(&rawdoc! { "_id": 1 }).unwrap_err();
        assert_eq!(err.code_str(), "conflict");
        assert_eq!(coll.index_data.len(), entries_before);
        assert_eq!(coll.record_count(), 1);
    }

    #[test]
    fn create_index_backfills_existing_documents() {
        let mut catalog = Catalog::new();
        let coll = catalog.create_collection("db.users").unwrap();
        coll.insert_document(&rawdoc! { "_id": 1, "x": 10 }).unwrap();
        coll.insert_document(&rawdoc! { "_id": 2, "x": 20 }).unwrap();
        coll.create_index("idx_x", rawdoc! { "x": 1 }, false).unwrap();
        let found = coll
            .index_find_single("idx_x", &rawdoc! { "x": 20 })
            .unwrap();
        assert!(found.is_some());
    }
}
