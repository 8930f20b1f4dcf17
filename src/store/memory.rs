//! In-memory result store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ResultStore, is_expired};
use crate::error::Result;
use crate::model::{TaskId, TaskRecord};

pub struct MemoryResultStore {
    records: DashMap<TaskId, TaskRecord>,
    ttl: Duration,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Number of records held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, record: &TaskRecord) -> Result<()> {
        match self.records.entry(record.task_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().updated_at <= record.updated_at {
                    existing.insert(record.clone());
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self
            .records
            .get(&task_id)
            .filter(|r| !is_expired(r.updated_at, self.ttl))
            .map(|r| r.value().clone()))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let before = self.records.len();
        self.records
            .retain(|_, record| !is_expired(record.updated_at, self.ttl));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
