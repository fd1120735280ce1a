use crate::error::StoreError;
use crate::model::{DetectedObjectGroup, ImageRecord, ImageStatus, OwnerId};
use crate::query::ImageFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Persistence for image records
///
/// Every method is a single atomic operation. Status updates only apply to
/// records that are still pending; anything else is an
/// [`StoreError::InvalidTransition`].
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError>;

    /// Fetch a record by id
    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError>;

    /// One owner's records matching `filter`, in the filter's order
    async fn list(&self, owner: OwnerId, filter: &ImageFilter)
        -> Result<Vec<ImageRecord>, StoreError>;

    /// Records among `ids` that belong to `owner`, each at most once
    async fn find_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<Vec<ImageRecord>, StoreError>;

    /// Change a record's display name
    async fn rename(&self, id: Uuid, display_name: &str) -> Result<(), StoreError>;

    /// Move a pending record to success with its detections
    async fn complete(
        &self,
        id: Uuid,
        detected_path: &Path,
        detections: &[DetectedObjectGroup],
    ) -> Result<(), StoreError>;

    /// Move a pending record to fail
    async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError>;

    /// Delete a record; false if it did not exist
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Delete the records among `ids` that belong to `owner`
    async fn delete_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<u64, StoreError>;

    /// Records still pending that were created before `before`
    async fn stale_pending(&self, before: DateTime<Utc>) -> Result<Vec<ImageRecord>, StoreError>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-process store, used for tests and local runs without a database
#[derive(Default)]
pub struct MemoryImageStore {
    records: RwLock<HashMap<Uuid, ImageRecord>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn transition(
        &self,
        id: Uuid,
        to: ImageStatus,
        apply: impl FnOnce(&mut ImageRecord),
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !record.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }

        record.status = to;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn list(
        &self,
        owner: OwnerId,
        filter: &ImageFilter,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let owned: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.is_owned_by(owner))
            .cloned()
            .collect();
        Ok(filter.apply(owned))
    }

    async fn find_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<Vec<ImageRecord>, StoreError> {
        let records = self.records.read();
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| records.get(id))
            .filter(|r| r.is_owned_by(owner))
            .cloned()
            .collect())
    }

    async fn rename(&self, id: Uuid, display_name: &str) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.display_name = display_name.to_string();
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        detected_path: &Path,
        detections: &[DetectedObjectGroup],
    ) -> Result<(), StoreError> {
        self.transition(id, ImageStatus::Success, |record| {
            record.detected_path = Some(detected_path.to_path_buf());
            record.detections = detections.to_vec();
        })
    }

    async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError> {
        self.transition(id, ImageStatus::Fail, |_| {})
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&id).is_some())
    }

    async fn delete_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let mut deleted = 0;
        for id in ids {
            if records.get(id).is_some_and(|r| r.is_owned_by(owner)) {
                records.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.status == ImageStatus::Pending && r.created_at < before)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BoundingBox;
    use std::path::PathBuf;

    fn owner() -> OwnerId {
        OwnerId(Uuid::new_v4())
    }

    fn groups() -> Vec<DetectedObjectGroup> {
        vec![DetectedObjectGroup {
            class_name: "cat".to_string(),
            boxes: vec![BoundingBox {
                id: Uuid::new_v4(),
                confidence: 0.9,
                x_min: 0,
                x_max: 10,
                y_min: 0,
                y_max: 10,
            }],
        }]
    }

    #[tokio::test]
    async fn test_complete_only_from_pending() {
        let store = MemoryImageStore::new();
        let record = ImageRecord::pending(owner(), "cat", PathBuf::from("a.jpg"));
        store.insert(&record).await.unwrap();

        store
            .complete(record.id, Path::new("b.jpg"), &groups())
            .await
            .unwrap();

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ImageStatus::Success);
        assert_eq!(stored.detected_path, Some(PathBuf::from("b.jpg")));
        assert_eq!(stored.detections.len(), 1);

        let err = store.mark_failed(record.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: ImageStatus::Success,
                to: ImageStatus::Fail,
                ..
            }
        ));
        let err = store
            .complete(record.id, Path::new("c.jpg"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // Rejected transitions leave the record untouched
        assert_eq!(store.get(record.id).await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_failed_record_stays_failed() {
        let store = MemoryImageStore::new();
        let record = ImageRecord::pending(owner(), "cat", PathBuf::from("a.jpg"));
        store.insert(&record).await.unwrap();

        store.mark_failed(record.id).await.unwrap();
        assert!(store
            .complete(record.id, Path::new("b.jpg"), &groups())
            .await
            .is_err());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ImageStatus::Fail);
        assert!(stored.detected_path.is_none());
        assert!(stored.detections.is_empty());
    }

    #[tokio::test]
    async fn test_updates_on_missing_record_are_not_found() {
        let store = MemoryImageStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.mark_failed(id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.rename(id, "x").await, Err(StoreError::NotFound(_))));
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_owned_queries_are_scoped() {
        let store = MemoryImageStore::new();
        let alice = owner();
        let bob = owner();

        let a = ImageRecord::pending(alice, "a", PathBuf::from("a.jpg"));
        let b = ImageRecord::pending(bob, "b", PathBuf::from("b.jpg"));
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let found = store.find_owned(alice, &[a.id, b.id]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        let repeated = store.find_owned(alice, &[a.id, a.id, b.id, a.id]).await.unwrap();
        assert_eq!(repeated.len(), 1);

        let listed = store.list(bob, &ImageFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);

        assert_eq!(store.delete_owned(alice, &[a.id, b.id]).await.unwrap(), 1);
        assert!(store.get(b.id).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_pending() {
        let store = MemoryImageStore::new();
        let mut old = ImageRecord::pending(owner(), "old", PathBuf::from("a.jpg"));
        old.created_at = Utc::now() - chrono::Duration::hours(1);
        let fresh = ImageRecord::pending(owner(), "fresh", PathBuf::from("b.jpg"));
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let stale = store.stale_pending(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }
}
