//! Named store of pre-configured policies.
//!
//! Policies are registered under logical names and fetched back with their
//! concrete type; a lookup with the wrong type is an error that names both
//! types. A registry constructed with a namespace prefixes its keys
//! internally, so registries with different namespaces are fully isolated
//! even when they share a process; accessors only ever see logical names.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a policy named '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("no policy registered under '{0}'")]
    NotFound(String),
    #[error("policy '{name}' is registered as {stored}, not {requested}")]
    TypeMismatch { name: String, stored: &'static str, requested: &'static str },
}

#[derive(Clone)]
struct Entry {
    policy: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Mapping from logical name to policy, optionally namespaced.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    namespace: Option<String>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

static GLOBAL_POLICIES: OnceLock<PolicyRegistry> = OnceLock::new();

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose keys are prefixed with `namespace` internally.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// The process-wide default registry. Lazily created; call
    /// [`PolicyRegistry::clear`] on it between tests.
    pub fn global() -> &'static PolicyRegistry {
        GLOBAL_POLICIES.get_or_init(PolicyRegistry::new)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn key(&self, name: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, name),
            None => name.to_string(),
        }
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        match &self.namespace {
            Some(namespace) => {
                key.strip_prefix(namespace.as_str()).and_then(|k| k.strip_prefix(':')).unwrap_or(key)
            }
            None => key,
        }
    }

    /// Register a policy under a new name; fails if the name exists.
    pub fn add<P>(&self, name: &str, policy: P) -> Result<(), RegistryError>
    where
        P: Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let key = self.key(name);
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        entries.insert(
            key,
            Entry { policy: Arc::new(policy), type_name: std::any::type_name::<P>() },
        );
        Ok(())
    }

    /// Register a policy, replacing any previous entry.
    pub fn add_or_replace<P>(&self, name: &str, policy: P)
    where
        P: Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            self.key(name),
            Entry { policy: Arc::new(policy), type_name: std::any::type_name::<P>() },
        );
    }

    /// Replace an existing policy; fails if the name is absent.
    pub fn replace<P>(&self, name: &str, policy: P) -> Result<(), RegistryError>
    where
        P: Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let key = self.key(name);
        if !entries.contains_key(&key) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        entries.insert(
            key,
            Entry { policy: Arc::new(policy), type_name: std::any::type_name::<P>() },
        );
        Ok(())
    }

    /// Fetch a policy with its concrete type.
    pub fn get<P>(&self, name: &str) -> Result<Arc<P>, RegistryError>
    where
        P: Send + Sync + 'static,
    {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries
            .get(&self.key(name))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Arc::clone(&entry.policy).downcast::<P>().map_err(|_| RegistryError::TypeMismatch {
            name: name.to_string(),
            stored: entry.type_name,
            requested: std::any::type_name::<P>(),
        })
    }

    /// Like [`PolicyRegistry::get`], but `None` on a missing name or a type
    /// mismatch.
    pub fn try_get<P>(&self, name: &str) -> Option<Arc<P>>
    where
        P: Send + Sync + 'static,
    {
        self.get(name).ok()
    }

    /// Remove a policy; returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key(name))
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).contains_key(&self.key(name))
    }

    /// Logical names of every registered policy, sorted.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = entries.keys().map(|key| self.strip(key).to_string()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of logical name to stored type name.
    pub fn to_map(&self) -> HashMap<String, &'static str> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .map(|(key, entry)| (self.strip(key).to_string(), entry.type_name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("namespace", &self.namespace)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backoff, RetryPolicy, TimeoutPolicy};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn retry() -> RetryPolicy<i32, TestError> {
        RetryPolicy::builder().max_retries(2).backoff(Backoff::none()).build()
    }

    #[test]
    fn add_then_get_round_trips_with_type() {
        let registry = PolicyRegistry::new();
        registry.add("orders", retry()).unwrap();

        let fetched = registry.get::<RetryPolicy<i32, TestError>>("orders").unwrap();
        assert_eq!(format!("{:?}", fetched).contains("RetryPolicy"), true);
    }

    #[test]
    fn add_refuses_duplicates_but_add_or_replace_overwrites() {
        let registry = PolicyRegistry::new();
        registry.add("orders", retry()).unwrap();

        let err = registry.add("orders", retry()).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("orders".to_string()));

        registry.add_or_replace("orders", TimeoutPolicy::new(Duration::from_secs(1)).unwrap());
        assert!(registry.get::<TimeoutPolicy>("orders").is_ok());
    }

    #[test]
    fn replace_requires_existence() {
        let registry = PolicyRegistry::new();
        let err = registry.replace("missing", retry()).unwrap_err();
        assert_eq!(err, RegistryError::NotFound("missing".to_string()));

        registry.add("present", retry()).unwrap();
        registry.replace("present", retry()).unwrap();
    }

    #[test]
    fn get_with_wrong_type_names_both_types() {
        let registry = PolicyRegistry::new();
        registry.add("orders", retry()).unwrap();

        let err = registry.get::<TimeoutPolicy>("orders").unwrap_err();
        match err {
            RegistryError::TypeMismatch { name, stored, requested } => {
                assert_eq!(name, "orders");
                assert!(stored.contains("RetryPolicy"));
                assert!(requested.contains("TimeoutPolicy"));
            }
            e => panic!("expected TypeMismatch, got {:?}", e),
        }
    }

    #[test]
    fn try_get_returns_none_on_miss_or_mismatch() {
        let registry = PolicyRegistry::new();
        assert!(registry.try_get::<TimeoutPolicy>("missing").is_none());

        registry.add("orders", retry()).unwrap();
        assert!(registry.try_get::<TimeoutPolicy>("orders").is_none());
        assert!(registry.try_get::<RetryPolicy<i32, TestError>>("orders").is_some());
    }

    #[test]
    fn remove_contains_len_clear() {
        let registry = PolicyRegistry::new();
        registry.add("a", retry()).unwrap();
        registry.add("b", retry()).unwrap();

        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(!registry.contains("a"));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn namespaces_prefix_keys_invisibly() {
        let tenant_a = PolicyRegistry::with_namespace("tenant-a");
        let tenant_b = PolicyRegistry::with_namespace("tenant-b");

        tenant_a.add("orders", retry()).unwrap();

        // Accessors speak logical names only.
        assert!(tenant_a.contains("orders"));
        assert_eq!(tenant_a.keys(), vec!["orders".to_string()]);
        assert!(tenant_a.to_map().contains_key("orders"));

        // Registries with different namespaces are isolated.
        assert!(!tenant_b.contains("orders"));
        assert!(tenant_b.try_get::<RetryPolicy<i32, TestError>>("orders").is_none());
    }

    #[test]
    fn keys_are_sorted_logical_names() {
        let registry = PolicyRegistry::with_namespace("ns");
        registry.add("zeta", retry()).unwrap();
        registry.add("alpha", retry()).unwrap();
        assert_eq!(registry.keys(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn global_registry_is_shared_and_resettable() {
        let registry = PolicyRegistry::global();
        registry.clear();
        registry.add("global-test-entry", retry()).unwrap();
        assert!(PolicyRegistry::global().contains("global-test-entry"));
        registry.clear();
        assert!(PolicyRegistry::global().is_empty());
    }
}
