//! In-process store, used by tests and by the relay when no data
//! directory is configured.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use syncgraph_core::{Operation, PersistedDocument};

use super::{DocumentStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, PersistedDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(doc_id).cloned())
    }

    fn save(&self, doc: &PersistedDocument) -> Result<(), StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    fn append(&self, doc_id: &str, operations: &[Operation]) -> Result<usize, StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let doc = docs
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        doc.history.extend_from_slice(operations);
        Ok(doc.history.len())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.keys().cloned().collect())
    }

    fn delete(&self, doc_id: &str) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.remove(doc_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncgraph_core::ObjectId;

    fn doc(id: &str) -> PersistedDocument {
        PersistedDocument {
            id: id.to_string(),
            doc_type: "vr".to_string(),
            history: vec![Operation::create_object(ObjectId::new("root_1"))],
        }
    }

    #[test]
    fn test_save_load_replace() {
        let store = MemoryStore::new();
        assert_eq!(store.load("doc_a").unwrap(), None);

        store.save(&doc("doc_a")).unwrap();
        assert_eq!(store.load("doc_a").unwrap(), Some(doc("doc_a")));

        let mut replaced = doc("doc_a");
        replaced.history.clear();
        store.save(&replaced).unwrap();
        assert!(store.load("doc_a").unwrap().unwrap().history.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_requires_saved_document() {
        let store = MemoryStore::new();
        let ops = [Operation::create_array(ObjectId::new("arr_1"))];
        assert_eq!(
            store.append("doc_a", &ops),
            Err(StoreError::NotFound("doc_a".into()))
        );

        store.save(&doc("doc_a")).unwrap();
        assert_eq!(store.append("doc_a", &ops).unwrap(), 2);
    }

    #[test]
    fn test_list_and_delete() {
        let store = MemoryStore::new();
        store.save(&doc("doc_b")).unwrap();
        store.save(&doc("doc_a")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["doc_a", "doc_b"]);
        assert!(store.delete("doc_a").unwrap());
        assert!(!store.delete("doc_a").unwrap());
        assert!(!store.is_empty());
    }
}
