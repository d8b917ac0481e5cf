//! Redb-backed index store.
//!
//! Uses [redb](https://github.com/cberner/redb) - a pure Rust,
//! ACID-compliant, embedded B-tree database.
//!
//! # Tables
//!
//! - `entities`: entity id (u64) -> IndexedEntityRecord (JSON)
//! - `embedding_meta`: "entity/model" (string) -> EmbeddingRecord sans
//!   vector (JSON)
//! - `embedding_vectors`: "entity/model" (string) -> raw f32 bytes,
//!   little-endian
//! - `superseded`: "entity/model/seq" (string) -> superseded record sans
//!   vector (JSON)
//! - `categories`: category id (u64) -> Category (JSON)
//!
//! Vectors are stored as packed little-endian f32 rather than JSON - at
//! hundreds of dimensions the text encoding would triple the footprint of
//! the largest table.

use super::index_store::{IndexStore, IndexedEntityRecord, StoreError};
use crate::embedding::{EmbeddingRecord, ModelId};
use crate::search::EntityId;
use crate::taxonomy::{Category, CategoryId};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const ENTITIES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("entities");
const EMBEDDING_META_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("embedding_meta");
const EMBEDDING_VECTORS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("embedding_vectors");
const SUPERSEDED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("superseded");
const CATEGORIES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("categories");

/// Redb-backed index store for native deployments.
///
/// All operations are ACID; the category batch write and the
/// active-to-superseded swap each commit as a single transaction.
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    /// Opens or creates a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())
            .map_err(|e| StoreError::DatabaseError(format!("failed to open database: {e}")))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        write_txn
            .open_table(ENTITIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to create table: {e}")))?;
        write_txn
            .open_table(EMBEDDING_META_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to create table: {e}")))?;
        write_txn
            .open_table(EMBEDDING_VECTORS_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to create table: {e}")))?;
        write_txn
            .open_table(SUPERSEDED_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to create table: {e}")))?;
        write_txn
            .open_table(CATEGORIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to create table: {e}")))?;
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn embedding_key(entity_id: EntityId, model: &ModelId) -> String {
        format!("{}/{}", entity_id.as_u64(), model.key())
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value)
            .map_err(|e| StoreError::SerializationError(format!("serialize failed: {e}")))
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::SerializationError(format!("deserialize failed: {e}")))
    }

    /// Packs f32 values as little-endian bytes. Must match
    /// `deserialize_vector`.
    fn serialize_vector(vector: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for &value in vector {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// A record with its vector stripped for the metadata tables.
    fn strip_vector(record: &EmbeddingRecord) -> EmbeddingRecord {
        EmbeddingRecord {
            vector: Vec::new(),
            ..record.clone()
        }
    }
}

#[async_trait::async_trait]
impl IndexStore for RedbIndexStore {
    async fn get_active_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let key = Self::embedding_key(entity_id, model);
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;

        let meta_table = read_txn
            .open_table(EMBEDDING_META_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let Some(meta_guard) = meta_table
            .get(key.as_str())
            .map_err(|e| StoreError::DatabaseError(format!("failed to get meta: {e}")))?
        else {
            return Ok(None);
        };
        let mut record: EmbeddingRecord = Self::deserialize(meta_guard.value())?;

        let vector_table = read_txn
            .open_table(EMBEDDING_VECTORS_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let Some(vector_guard) = vector_table
            .get(key.as_str())
            .map_err(|e| StoreError::DatabaseError(format!("failed to get vector: {e}")))?
        else {
            return Err(StoreError::DatabaseError(format!(
                "embedding meta for {key} has no vector row"
            )));
        };
        record.vector = Self::deserialize_vector(vector_guard.value());

        Ok(Some(record))
    }

    async fn put_active_embedding(&self, record: &EmbeddingRecord) -> Result<(), StoreError> {
        let key = Self::embedding_key(record.entity_id, &record.model_id);
        let meta_bytes = Self::serialize(&Self::strip_vector(record))?;
        let vector_bytes = Self::serialize_vector(&record.vector);

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut meta_table = write_txn
                .open_table(EMBEDDING_META_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            let mut superseded_table = write_txn
                .open_table(SUPERSEDED_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;

            // Demote the previous active record, if any, inside the same
            // transaction - the active slot is never ambiguous.
            let previous = meta_table
                .get(key.as_str())
                .map_err(|e| StoreError::DatabaseError(format!("failed to get meta: {e}")))?
                .map(|g| g.value().to_vec());
            if let Some(previous_bytes) = previous {
                let count = superseded_table
                    .iter()
                    .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?
                    .filter_map(|r| r.ok())
                    .filter(|(k, _)| k.value().starts_with(&format!("{key}/")))
                    .count();
                let superseded_key = format!("{key}/{count}");
                superseded_table
                    .insert(superseded_key.as_str(), previous_bytes.as_slice())
                    .map_err(|e| {
                        StoreError::DatabaseError(format!("failed to insert superseded: {e}"))
                    })?;
            }

            meta_table
                .insert(key.as_str(), meta_bytes.as_slice())
                .map_err(|e| StoreError::DatabaseError(format!("failed to insert meta: {e}")))?;

            let mut vector_table = write_txn
                .open_table(EMBEDDING_VECTORS_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            vector_table
                .insert(key.as_str(), vector_bytes.as_slice())
                .map_err(|e| {
                    StoreError::DatabaseError(format!("failed to insert vector: {e}"))
                })?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn supersede_embedding(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<(), StoreError> {
        let key = Self::embedding_key(entity_id, model);
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut meta_table = write_txn
                .open_table(EMBEDDING_META_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            let mut superseded_table = write_txn
                .open_table(SUPERSEDED_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            let mut vector_table = write_txn
                .open_table(EMBEDDING_VECTORS_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;

            let removed = meta_table
                .remove(key.as_str())
                .map_err(|e| StoreError::DatabaseError(format!("failed to remove meta: {e}")))?
                .map(|g| g.value().to_vec());
            if let Some(previous_bytes) = removed {
                let count = superseded_table
                    .iter()
                    .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?
                    .filter_map(|r| r.ok())
                    .filter(|(k, _)| k.value().starts_with(&format!("{key}/")))
                    .count();
                let superseded_key = format!("{key}/{count}");
                superseded_table
                    .insert(superseded_key.as_str(), previous_bytes.as_slice())
                    .map_err(|e| {
                        StoreError::DatabaseError(format!("failed to insert superseded: {e}"))
                    })?;
            }
            vector_table
                .remove(key.as_str())
                .map_err(|e| StoreError::DatabaseError(format!("failed to remove vector: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn iter_active_embeddings(
        &self,
        model: &ModelId,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let meta_table = read_txn
            .open_table(EMBEDDING_META_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let vector_table = read_txn
            .open_table(EMBEDDING_VECTORS_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;

        let mut records = Vec::new();
        let iter = meta_table
            .iter()
            .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?;
        for result in iter {
            let (key, value) = result
                .map_err(|e| StoreError::DatabaseError(format!("failed to read entry: {e}")))?;
            let mut record: EmbeddingRecord = Self::deserialize(value.value())?;
            if record.model_id != *model {
                continue;
            }
            if let Some(vector_guard) = vector_table
                .get(key.value())
                .map_err(|e| StoreError::DatabaseError(format!("failed to get vector: {e}")))?
            {
                record.vector = Self::deserialize_vector(vector_guard.value());
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn superseded_count(
        &self,
        entity_id: EntityId,
        model: &ModelId,
    ) -> Result<usize, StoreError> {
        let prefix = format!("{}/", Self::embedding_key(entity_id, model));
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let table = read_txn
            .open_table(SUPERSEDED_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let count = table
            .iter()
            .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .count();
        Ok(count)
    }

    async fn get_entity_record(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<IndexedEntityRecord>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let table = read_txn
            .open_table(ENTITIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        match table
            .get(entity_id.as_u64())
            .map_err(|e| StoreError::DatabaseError(format!("failed to get entity: {e}")))?
        {
            Some(guard) => Ok(Some(Self::deserialize(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn put_entity_record(&self, record: &IndexedEntityRecord) -> Result<(), StoreError> {
        let bytes = Self::serialize(record)?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut table = write_txn
                .open_table(ENTITIES_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            table
                .insert(record.entity.id.as_u64(), bytes.as_slice())
                .map_err(|e| StoreError::DatabaseError(format!("failed to insert: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn delete_entity_record(&self, entity_id: EntityId) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut table = write_txn
                .open_table(ENTITIES_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            table
                .remove(entity_id.as_u64())
                .map_err(|e| StoreError::DatabaseError(format!("failed to remove: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn iter_entity_records(&self) -> Result<Vec<IndexedEntityRecord>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let table = read_txn
            .open_table(ENTITIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let mut records = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?;
        for result in iter {
            let (_, value) = result
                .map_err(|e| StoreError::DatabaseError(format!("failed to read entry: {e}")))?;
            records.push(Self::deserialize(value.value())?);
        }
        Ok(records)
    }

    async fn entity_count(&self) -> Result<usize, StoreError> {
        use redb::ReadableTableMetadata;
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let table = read_txn
            .open_table(ENTITIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let count = table
            .len()
            .map_err(|e| StoreError::DatabaseError(format!("failed to count: {e}")))?;
        Ok(count as usize)
    }

    async fn put_categories(&self, categories: &[Category]) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut table = write_txn
                .open_table(CATEGORIES_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            // One transaction for the whole batch: a subtree re-path is
            // never partially visible.
            for category in categories {
                let bytes = Self::serialize(category)?;
                table
                    .insert(category.id.as_u64(), bytes.as_slice())
                    .map_err(|e| StoreError::DatabaseError(format!("failed to insert: {e}")))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;
        {
            let mut table = write_txn
                .open_table(CATEGORIES_TABLE)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            table
                .remove(id.as_u64())
                .map_err(|e| StoreError::DatabaseError(format!("failed to remove: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin read: {e}")))?;
        let table = read_txn
            .open_table(CATEGORIES_TABLE)
            .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
        let mut categories = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?;
        for result in iter {
            let (_, value) = result
                .map_err(|e| StoreError::DatabaseError(format!("failed to read entry: {e}")))?;
            categories.push(Self::deserialize(value.value())?);
        }
        Ok(categories)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(format!("failed to begin write: {e}")))?;

        fn clear_u64_table<V: redb::Value>(
            write_txn: &redb::WriteTransaction,
            table_def: TableDefinition<u64, V>,
        ) -> Result<(), StoreError> {
            let mut table = write_txn
                .open_table(table_def)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            let keys: Vec<u64> = table
                .iter()
                .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?
                .filter_map(|r| r.ok().map(|(k, _)| k.value()))
                .collect();
            for key in keys {
                table
                    .remove(key)
                    .map_err(|e| StoreError::DatabaseError(format!("failed to remove: {e}")))?;
            }
            Ok(())
        }

        fn clear_str_table<V: redb::Value>(
            write_txn: &redb::WriteTransaction,
            table_def: TableDefinition<&str, V>,
        ) -> Result<(), StoreError> {
            let mut table = write_txn
                .open_table(table_def)
                .map_err(|e| StoreError::DatabaseError(format!("failed to open table: {e}")))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(|e| StoreError::DatabaseError(format!("failed to iterate: {e}")))?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| StoreError::DatabaseError(format!("failed to remove: {e}")))?;
            }
            Ok(())
        }

        clear_u64_table(&write_txn, ENTITIES_TABLE)?;
        clear_u64_table(&write_txn, CATEGORIES_TABLE)?;
        clear_str_table(&write_txn, EMBEDDING_META_TABLE)?;
        clear_str_table(&write_txn, EMBEDDING_VECTORS_TABLE)?;
        clear_str_table(&write_txn, SUPERSEDED_TABLE)?;

        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(format!("failed to commit: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ContentFingerprint;
    use crate::search::Entity;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn create_test_store() -> (RedbIndexStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let store = RedbIndexStore::open(&db_path).unwrap();
        (store, temp_dir)
    }

    fn test_entity(id: u64, text: &str) -> Entity {
        Entity {
            id: EntityId::from_u64(id),
            text_fields: vec![("name".to_string(), text.to_string())],
            category_ids: BTreeSet::new(),
            updated_at: 1,
        }
    }

    fn test_record(id: u64, vector: Vec<f32>) -> EmbeddingRecord {
        let entity = test_entity(id, "steel");
        EmbeddingRecord {
            entity_id: EntityId::from_u64(id),
            model_id: ModelId::new("m", "v1"),
            dimension: vector.len(),
            vector,
            fingerprint: ContentFingerprint::of_entity(&entity),
            quality_score: Some(0.8),
            created_at: 42,
        }
    }

    #[tokio::test]
    async fn embedding_roundtrip_preserves_vector() {
        let (store, _temp) = create_test_store();
        let model = ModelId::new("m", "v1");
        let record = test_record(1, vec![0.25, -0.5, 0.75]);

        store.put_active_embedding(&record).await.unwrap();
        let loaded = store
            .get_active_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.vector, vec![0.25, -0.5, 0.75]);
        assert_eq!(loaded.quality_score, Some(0.8));
        assert_eq!(loaded.fingerprint, record.fingerprint);
    }

    #[tokio::test]
    async fn put_supersedes_previous_active() {
        let (store, _temp) = create_test_store();
        let model = ModelId::new("m", "v1");

        store
            .put_active_embedding(&test_record(1, vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .put_active_embedding(&test_record(1, vec![0.0, 1.0]))
            .await
            .unwrap();

        let active = store
            .get_active_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.vector, vec![0.0, 1.0]);
        assert_eq!(
            store
                .superseded_count(EntityId::from_u64(1), &model)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.iter_active_embeddings(&model).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn supersede_removes_active() {
        let (store, _temp) = create_test_store();
        let model = ModelId::new("m", "v1");

        store
            .put_active_embedding(&test_record(1, vec![1.0]))
            .await
            .unwrap();
        store
            .supersede_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap();
        // Idempotent
        store
            .supersede_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap();

        assert!(store
            .get_active_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .superseded_count(EntityId::from_u64(1), &model)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn entity_record_crud() {
        let (store, _temp) = create_test_store();
        let entity = test_entity(7, "copper wire");
        let record = IndexedEntityRecord {
            applied_fingerprint: ContentFingerprint::of_entity(&entity),
            entity,
        };

        assert!(store
            .get_entity_record(EntityId::from_u64(7))
            .await
            .unwrap()
            .is_none());

        store.put_entity_record(&record).await.unwrap();
        let loaded = store
            .get_entity_record(EntityId::from_u64(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.entity.text_fields[0].1, "copper wire");
        assert_eq!(store.entity_count().await.unwrap(), 1);

        store
            .delete_entity_record(EntityId::from_u64(7))
            .await
            .unwrap();
        assert_eq!(store.entity_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn category_batch_roundtrip() {
        let (store, _temp) = create_test_store();
        let categories = vec![
            Category {
                id: CategoryId::from_u64(1),
                parent_id: None,
                path: "/1/".to_string(),
                level: 1,
            },
            Category {
                id: CategoryId::from_u64(2),
                parent_id: Some(CategoryId::from_u64(1)),
                path: "/1/2/".to_string(),
                level: 2,
            },
        ];

        store.put_categories(&categories).await.unwrap();
        let mut loaded = store.list_categories().await.unwrap();
        loaded.sort_by_key(|c| c.id.as_u64());
        assert_eq!(loaded, categories);

        store.delete_category(CategoryId::from_u64(2)).await.unwrap();
        assert_eq!(store.list_categories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("persist.redb");
        let model = ModelId::new("m", "v1");

        {
            let store = RedbIndexStore::open(&db_path).unwrap();
            store
                .put_active_embedding(&test_record(42, vec![1.0, 2.0, 3.0]))
                .await
                .unwrap();
        }

        {
            let store = RedbIndexStore::open(&db_path).unwrap();
            let record = store
                .get_active_embedding(EntityId::from_u64(42), &model)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.vector, vec![1.0, 2.0, 3.0]);
        }
    }

    #[tokio::test]
    async fn clear_empties_all_tables() {
        let (store, _temp) = create_test_store();
        let model = ModelId::new("m", "v1");

        store
            .put_active_embedding(&test_record(1, vec![1.0]))
            .await
            .unwrap();
        let entity = test_entity(1, "steel");
        store
            .put_entity_record(&IndexedEntityRecord {
                applied_fingerprint: ContentFingerprint::of_entity(&entity),
                entity,
            })
            .await
            .unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.entity_count().await.unwrap(), 0);
        assert!(store
            .get_active_embedding(EntityId::from_u64(1), &model)
            .await
            .unwrap()
            .is_none());
        assert!(store.iter_active_embeddings(&model).await.unwrap().is_empty());
    }
}
