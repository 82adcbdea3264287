//! The per-kind collection of task records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::TaskRecord;

/// Mapping from task ID to [`TaskRecord`], persisted as one JSON object.
///
/// Backed by a `BTreeMap` so the serialized form is canonical: an
/// unchanged collection always encodes to the same bytes.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::domain::{DocumentLocator, TaskCollection, TaskRecord};
///
/// let mut tasks = TaskCollection::new();
/// let record = TaskRecord::new("abc", DocumentLocator::default());
/// let id = record.task_id.clone();
/// tasks.insert(record);
///
/// assert_eq!(tasks.find_by_doc_hash("abc").unwrap().task_id, id);
/// assert!(tasks.find_by_doc_hash("other").is_none());
///
/// let json = serde_json::to_value(&tasks).unwrap();
/// assert_eq!(json[&id]["docHash"], "abc");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskCollection {
    tasks: BTreeMap<String, TaskRecord>,
}

impl TaskCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if there are no records.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Looks up a record by task ID.
    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    /// Mutable lookup by task ID.
    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(task_id)
    }

    /// Inserts a record keyed by its task ID, returning any record it replaced.
    pub fn insert(&mut self, record: TaskRecord) -> Option<TaskRecord> {
        self.tasks.insert(record.task_id.clone(), record)
    }

    /// Removes a record by task ID.
    pub fn remove(&mut self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.remove(task_id)
    }

    /// Finds the record for a document.
    ///
    /// Linear scan. Normally at most one record exists per document; if
    /// older data holds several, the most recently created one wins.
    pub fn find_by_doc_hash(&self, doc_hash: &str) -> Option<&TaskRecord> {
        self.tasks
            .values()
            .filter(|r| r.doc_hash == doc_hash)
            .max_by_key(|r| r.created_at)
    }

    /// Records in a non-terminal status, oldest first.
    pub fn active(&self) -> Vec<&TaskRecord> {
        let mut active: Vec<&TaskRecord> =
            self.tasks.values().filter(|r| r.status.is_active()).collect();
        active.sort_by_key(|r| r.created_at);
        active
    }

    /// Iterates over all records in task-ID order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }
}

impl FromIterator<TaskRecord> for TaskCollection {
    fn from_iter<I: IntoIterator<Item = TaskRecord>>(iter: I) -> Self {
        let mut collection = Self::new();
        for record in iter {
            collection.insert(record);
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DocumentLocator;
    use crate::types::task::TaskStatus;

    fn record(doc_hash: &str, status: TaskStatus, created_at: i64) -> TaskRecord {
        let mut r = TaskRecord::new(doc_hash, DocumentLocator::default());
        r.status = status;
        r.created_at = created_at;
        r.updated_at = created_at;
        r
    }

    #[test]
    fn find_prefers_newest_duplicate() {
        let old = record("abc", TaskStatus::Failed, 10);
        let new = record("abc", TaskStatus::Pending, 20);
        let new_id = new.task_id.clone();
        let tasks: TaskCollection = vec![old, new].into_iter().collect();
        assert_eq!(tasks.find_by_doc_hash("abc").unwrap().task_id, new_id);
    }

    #[test]
    fn active_is_sorted_oldest_first_and_skips_terminal() {
        let tasks: TaskCollection = vec![
            record("c", TaskStatus::Processing, 30),
            record("a", TaskStatus::Pending, 10),
            record("b", TaskStatus::Completed, 20),
            record("d", TaskStatus::Failed, 5),
        ]
        .into_iter()
        .collect();
        let active: Vec<&str> = tasks.active().iter().map(|r| r.doc_hash.as_str()).collect();
        assert_eq!(active, vec!["a", "c"]);
    }

    #[test]
    fn serialization_is_canonical() {
        let tasks: TaskCollection = (0..5)
            .map(|i| record(&format!("doc-{i}"), TaskStatus::Pending, i))
            .collect();
        let first = serde_json::to_vec(&tasks).unwrap();
        let reloaded: TaskCollection = serde_json::from_slice(&first).unwrap();
        assert_eq!(reloaded, tasks);
        assert_eq!(serde_json::to_vec(&reloaded).unwrap(), first);
    }

    #[test]
    fn empty_object_is_empty_collection() {
        let tasks: TaskCollection = serde_json::from_str("{}").unwrap();
        assert!(tasks.is_empty());
    }
}
