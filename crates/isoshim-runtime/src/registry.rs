//! Registry of a task's additional execs.
//!
//! Each operation is individually atomic. Sequences that must be atomic as
//! a whole (check-then-insert on create) are serialized by the task, not
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use isoshim_common::types::ExecState;
use parking_lot::RwLock;

use crate::exec::Exec;

/// Concurrency-safe map from exec id to exec, excluding the init exec.
#[derive(Default)]
pub struct ExecRegistry {
    execs: RwLock<HashMap<String, Arc<dyn Exec>>>,
}

impl ExecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an exec by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Exec>> {
        self.execs.read().get(id).cloned()
    }

    /// Returns `true` if an exec with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.execs.read().contains_key(id)
    }

    /// Inserts an exec unless its id is already taken.
    ///
    /// Returns `false`, leaving the registry unchanged, on a duplicate.
    pub fn insert(&self, exec: Arc<dyn Exec>) -> bool {
        let mut execs = self.execs.write();
        if execs.contains_key(exec.id()) {
            return false;
        }
        let _ = execs.insert(exec.id().to_owned(), exec);
        true
    }

    /// Removes and returns an exec.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn Exec>> {
        self.execs.write().remove(id)
    }

    /// Returns a consistent snapshot of all execs, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<dyn Exec>> {
        let mut execs: Vec<_> = self.execs.read().values().cloned().collect();
        execs.sort_by(|a, b| a.id().cmp(b.id()));
        execs
    }

    /// Returns `true` when every registered exec has exited.
    pub fn all_exited(&self) -> bool {
        self.execs
            .read()
            .values()
            .all(|e| e.state() == ExecState::Exited)
    }

    /// Number of registered execs.
    pub fn len(&self) -> usize {
        self.execs.read().len()
    }

    /// Returns `true` when no exec is registered.
    pub fn is_empty(&self) -> bool {
        self.execs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use isoshim_common::types::TaskId;

    use super::*;
    use crate::testing::TestExec;

    fn exec(id: &str, pid: u32) -> Arc<dyn Exec> {
        Arc::new(TestExec::new(TaskId::new("t1"), id, pid))
    }

    #[test]
    fn insert_rejects_duplicates_without_replacing() {
        let reg = ExecRegistry::new();
        let first = exec("e1", 101);
        assert!(reg.insert(Arc::clone(&first)));
        assert!(!reg.insert(exec("e1", 999)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("e1").unwrap().pid(), 101);
    }

    #[test]
    fn remove_returns_entry_once() {
        let reg = ExecRegistry::new();
        let _ = reg.insert(exec("e1", 101));
        assert!(reg.remove("e1").is_some());
        assert!(reg.remove("e1").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let reg = ExecRegistry::new();
        let _ = reg.insert(exec("b", 2));
        let _ = reg.insert(exec("a", 1));
        let _ = reg.insert(exec("c", 3));
        let ids: Vec<_> = reg.snapshot().iter().map(|e| e.id().to_owned()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn all_exited_tracks_states() {
        let reg = ExecRegistry::new();
        assert!(reg.all_exited());

        let e1 = exec("e1", 101);
        let _ = reg.insert(Arc::clone(&e1));
        assert!(!reg.all_exited());

        e1.start().await.unwrap();
        e1.kill(15).await.unwrap();
        assert!(reg.all_exited());
    }
}
