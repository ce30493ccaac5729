//! In-memory cache of dependency values.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::dependency::{DepKey, DepValue};

/// The brain maps a dependency's hash key to the last value the watch layer
/// delivered for it. Entries are appended as data arrives and removed only
/// when the runner retires the dependency.
///
/// The lock makes the brain safe to hand to a dedup implementation; within
/// the runner itself all mutation happens on the runner task.
#[derive(Debug, Default)]
pub struct Brain {
    data: RwLock<HashMap<DepKey, DepValue>>,
}

impl Brain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as the current data for `key`.
    pub fn remember(&self, key: DepKey, value: DepValue) {
        self.data
            .write()
            .expect("brain lock poisoned")
            .insert(key, value);
    }

    /// The last remembered value for `key`, if any.
    pub fn recall(&self, key: &DepKey) -> Option<DepValue> {
        self.data
            .read()
            .expect("brain lock poisoned")
            .get(key)
            .cloned()
    }

    /// Drop the entry for `key`. Missing entries are ignored.
    pub fn forget(&self, key: &DepKey) {
        self.data.write().expect("brain lock poisoned").remove(key);
    }

    /// Whether `key` currently has a value.
    pub fn knows(&self, key: &DepKey) -> bool {
        self.data
            .read()
            .expect("brain lock poisoned")
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().expect("brain lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remember_recall_forget() {
        let brain = Brain::new();
        let key = DepKey::from("kv(app/port)");
        assert!(brain.recall(&key).is_none());

        brain.remember(key.clone(), json!("8080"));
        assert_eq!(brain.recall(&key), Some(json!("8080")));
        assert!(brain.knows(&key));

        brain.remember(key.clone(), json!("9090"));
        assert_eq!(brain.recall(&key), Some(json!("9090")));

        brain.forget(&key);
        assert!(!brain.knows(&key));
        assert!(brain.is_empty());
    }

    #[test]
    fn forget_unknown_key_is_noop() {
        let brain = Brain::new();
        brain.forget(&DepKey::from("kv(missing)"));
        assert!(brain.is_empty());
    }
}
