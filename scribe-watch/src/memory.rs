//! In-memory dependency source.
//!
//! [`MemorySource`] is the [`DependencySource`] used by tests and by the CLI's
//! local catalog mode: a versioned map of dependency data with blocking-query
//! semantics. [`Catalog`] is the YAML document the CLI loads into it.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;

use scribe_core::dependency::{DepKey, DepValue, Dependency, FetchError};

use crate::error::CatalogError;
use crate::source::{DependencySource, FetchOutcome};

// ---------------------------------------------------------------------------
// Catalog file
// ---------------------------------------------------------------------------

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A local stand-in for the coordination services: service instances, KV
/// pairs, and secrets, loaded from one YAML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Catalog {
    #[serde(default)]
    pub services: HashMap<String, Vec<ServiceInstance>>,
    #[serde(default)]
    pub kv: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, Value>,
}

impl Catalog {
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| CatalogError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Flatten into dependency-keyed entries: one per KV pair and secret,
    /// one per service, and one per (service, tag) pair.
    fn entries(&self) -> Vec<(Dependency, DepValue)> {
        let mut out = Vec::new();

        for (key, value) in &self.kv {
            out.push((
                Dependency::KvKey { key: key.clone() },
                Value::String(value.clone()),
            ));
        }

        for (path, value) in &self.secrets {
            out.push((Dependency::Secret { path: path.clone() }, value.clone()));
        }

        for (name, instances) in &self.services {
            out.push((
                Dependency::Service {
                    name: name.clone(),
                    tag: None,
                },
                instances_value(instances),
            ));

            let mut tags: Vec<&String> = instances.iter().flat_map(|i| &i.tags).collect();
            tags.sort();
            tags.dedup();
            for tag in tags {
                let tagged: Vec<&ServiceInstance> = instances
                    .iter()
                    .filter(|i| i.tags.contains(tag))
                    .collect();
                out.push((
                    Dependency::Service {
                        name: name.clone(),
                        tag: Some(tag.clone()),
                    },
                    json!(tagged),
                ));
            }
        }

        out
    }
}

fn instances_value(instances: &[ServiceInstance]) -> DepValue {
    json!(instances)
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

struct Entry {
    index: u64,
    value: DepValue,
}

struct Inner {
    /// Monotonic version counter; bumped on every mutation.
    version: u64,
    /// Index reported for dependencies with no entry, so first fetches
    /// observe "no data" instead of blocking forever.
    absent_floor: u64,
    entries: HashMap<DepKey, Entry>,
    errors: HashMap<DepKey, VecDeque<FetchError>>,
}

/// Versioned in-memory dependency data with blocking-query fetches.
pub struct MemorySource {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                version: 1,
                absent_floor: 1,
                entries: HashMap::new(),
                errors: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Store `value` for `dep`, waking blocked fetches. Re-setting an equal
    /// value is a no-op and wakes nobody.
    pub fn set(&self, dep: &Dependency, value: DepValue) {
        {
            let mut inner = self.inner.lock().expect("memory source lock poisoned");
            if inner
                .entries
                .get(&dep.key())
                .is_some_and(|entry| entry.value == value)
            {
                return;
            }
            inner.version += 1;
            let index = inner.version;
            inner.entries.insert(dep.key(), Entry { index, value });
        }
        self.notify.notify_waiters();
    }

    pub fn set_kv(&self, key: &str, value: &str) {
        self.set(
            &Dependency::KvKey { key: key.into() },
            Value::String(value.into()),
        );
    }

    pub fn set_service(&self, name: &str, instances: Vec<ServiceInstance>) {
        self.set(
            &Dependency::Service {
                name: name.into(),
                tag: None,
            },
            instances_value(&instances),
        );
    }

    pub fn set_secret(&self, path: &str, value: Value) {
        self.set(&Dependency::Secret { path: path.into() }, value);
    }

    /// Remove the entry for `dep`; blocked fetches observe the zero value.
    pub fn remove(&self, dep: &Dependency) {
        {
            let mut inner = self.inner.lock().expect("memory source lock poisoned");
            if inner.entries.remove(&dep.key()).is_none() {
                return;
            }
            inner.version += 1;
            inner.absent_floor = inner.version;
        }
        self.notify.notify_waiters();
    }

    /// Queue an error; the next fetch for `dep` returns it instead of data.
    pub fn push_error(&self, dep: &Dependency, error: FetchError) {
        {
            let mut inner = self.inner.lock().expect("memory source lock poisoned");
            inner
                .errors
                .entry(dep.key())
                .or_default()
                .push_back(error);
        }
        self.notify.notify_waiters();
    }

    /// Replace the current data with `catalog`, retiring entries the catalog
    /// no longer names.
    pub fn apply_catalog(&self, catalog: &Catalog) {
        let fresh = catalog.entries();
        let retired: Vec<DepKey> = {
            let inner = self.inner.lock().expect("memory source lock poisoned");
            let keep: Vec<DepKey> = fresh.iter().map(|(dep, _)| dep.key()).collect();
            inner
                .entries
                .keys()
                .filter(|key| !keep.contains(*key))
                .cloned()
                .collect()
        };

        for (dep, value) in fresh {
            self.set(&dep, value);
        }
        // set/remove handle their own notifications
        for key in retired {
            let mut inner = self.inner.lock().expect("memory source lock poisoned");
            if inner.entries.remove(&key).is_some() {
                inner.version += 1;
                inner.absent_floor = inner.version;
                drop(inner);
                self.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl DependencySource for MemorySource {
    async fn fetch(
        &self,
        dep: &Dependency,
        last_index: u64,
    ) -> Result<FetchOutcome, FetchError> {
        loop {
            // Register with the notifier before inspecting state, so a
            // mutation between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("memory source lock poisoned");
                if let Some(err) = inner
                    .errors
                    .get_mut(&dep.key())
                    .and_then(|queue| queue.pop_front())
                {
                    return Err(err);
                }

                let (index, value) = match inner.entries.get(&dep.key()) {
                    Some(entry) => (entry.index, entry.value.clone()),
                    None => (inner.absent_floor, dep.zero_value()),
                };
                if index > last_index {
                    return Ok(FetchOutcome { value, index });
                }
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::dependency::FetchErrorKind;

    fn kv(key: &str) -> Dependency {
        Dependency::KvKey { key: key.into() }
    }

    #[tokio::test]
    async fn first_fetch_observes_absence_as_zero_value() {
        let source = MemorySource::new();
        let outcome = source.fetch(&kv("nope"), 0).await.unwrap();
        assert_eq!(outcome.value, Value::String(String::new()));
        assert!(outcome.index > 0);
    }

    #[tokio::test]
    async fn fetch_blocks_until_data_changes() {
        let source = std::sync::Arc::new(MemorySource::new());
        source.set_kv("app/port", "8080");
        let first = source.fetch(&kv("app/port"), 0).await.unwrap();
        assert_eq!(first.value, Value::String("8080".into()));

        let waiter = {
            let source = source.clone();
            let index = first.index;
            tokio::spawn(async move { source.fetch(&kv("app/port"), index).await })
        };
        tokio::task::yield_now().await;
        source.set_kv("app/port", "9090");

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.value, Value::String("9090".into()));
        assert!(second.index > first.index);
    }

    #[tokio::test]
    async fn equal_value_does_not_bump_index() {
        let source = MemorySource::new();
        source.set_kv("k", "v");
        let first = source.fetch(&kv("k"), 0).await.unwrap();
        source.set_kv("k", "v");
        let again = source.fetch(&kv("k"), 0).await.unwrap();
        assert_eq!(first.index, again.index);
    }

    #[tokio::test]
    async fn queued_errors_surface_before_data() {
        let source = MemorySource::new();
        let dep = kv("k");
        source.set_kv("k", "v");
        source.push_error(
            &dep,
            FetchError::new(dep.key(), FetchErrorKind::Unreachable, "refused"),
        );

        let err = source.fetch(&dep, 0).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Unreachable);

        let outcome = source.fetch(&dep, 0).await.unwrap();
        assert_eq!(outcome.value, Value::String("v".into()));
    }

    #[test]
    fn catalog_parses_and_flattens_tags() {
        let yaml = r#"
services:
  web:
    - address: 10.0.0.1
      port: 80
      tags: [v2]
    - address: 10.0.0.2
      port: 81
kv:
  app/port: "8080"
secrets:
  kv/db:
    password: hunter2
"#;
        let catalog: Catalog = serde_yaml::from_str(yaml).unwrap();
        let entries = catalog.entries();

        let keys: Vec<String> = entries.iter().map(|(d, _)| d.key().0).collect();
        assert!(keys.contains(&"service(web)".to_string()));
        assert!(keys.contains(&"service(web.v2)".to_string()));
        assert!(keys.contains(&"kv(app/port)".to_string()));
        assert!(keys.contains(&"secret(kv/db)".to_string()));

        let tagged = entries
            .iter()
            .find(|(d, _)| d.key().0 == "service(web.v2)")
            .unwrap();
        assert_eq!(tagged.1.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_catalog_retires_dropped_entries() {
        let source = MemorySource::new();
        source.set_kv("old", "1");

        let mut catalog = Catalog::default();
        catalog.kv.insert("new".into(), "2".into());
        source.apply_catalog(&catalog);

        let new = source.fetch(&kv("new"), 0).await.unwrap();
        assert_eq!(new.value, Value::String("2".into()));

        let old = source.fetch(&kv("old"), 0).await.unwrap();
        assert_eq!(old.value, Value::String(String::new()), "retired entry reads as absent");
    }

    #[test]
    fn catalog_from_path_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(&path, "services: [not a map]").unwrap();
        assert!(matches!(
            Catalog::from_path(&path),
            Err(CatalogError::Parse { .. })
        ));
    }
}
