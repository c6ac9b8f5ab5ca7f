//! In-memory task and run repositories.
//!
//! Records are kept in insertion order. Every successful update stamps
//! `updated_at`; readers always receive clones, never references into the
//! store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::types::{Run, Task};

/// A record the repository can index and timestamp.
pub trait Record: Clone + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn touch(&mut self, now: DateTime<Utc>);
}

impl Record for Task {
    const KIND: &'static str = "task";

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Record for Run {
    const KIND: &'static str = "run";

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

struct Entries<T> {
    order: Vec<String>,
    by_id: HashMap<String, T>,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            by_id: HashMap::new(),
        }
    }
}

pub struct Repository<T: Record> {
    entries: RwLock<Entries<T>>,
}

pub type TaskRepository = Repository<Task>;
pub type RunRepository = Repository<Run>;

impl<T: Record> Default for Repository<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Ids are unique.
    pub fn create(&self, record: T) -> Result<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = record.id().to_string();
        if entries.by_id.contains_key(&id) {
            return Err(anyhow!("{} '{}' already exists", T::KIND, id));
        }
        entries.order.push(id.clone());
        entries.by_id.insert(id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.by_id.get(id).cloned()
    }

    /// Apply `mutate` to the record under the write lock and return the result.
    ///
    /// Returns `None` when no record has this id.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut T)) -> Option<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let record = entries.by_id.get_mut(id)?;
        mutate(record);
        record.touch(Utc::now());
        Some(record.clone())
    }

    /// Like [`Repository::update`], but an unknown id is an error.
    pub fn require_update(&self, id: &str, mutate: impl FnOnce(&mut T)) -> Result<T> {
        self.update(id, mutate)
            .ok_or_else(|| anyhow!("{} '{}' not found", T::KIND, id))
    }

    pub fn require(&self, id: &str) -> Result<T> {
        self.get(id)
            .ok_or_else(|| anyhow!("{} '{}' not found", T::KIND, id))
    }

    /// All records in insertion order.
    pub fn list(&self) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
