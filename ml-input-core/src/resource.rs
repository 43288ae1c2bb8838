//! Stateful resources captured by pipeline functions
//!
//! Resources are owned by the caller, not the pipeline. A stage that
//! captures a resource only requires it to be initialized before the
//! first record is pulled. Implementations must be safe to use from
//! several parallel map workers at once.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// A handle-bearing stateful value referenced from a pipeline function
pub trait Resource: Send + Sync {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// Whether the resource's initializer has run
    fn is_initialized(&self) -> bool;
}

fn not_initialized(name: &str) -> Error {
    Error::failed_precondition(format!("resource `{name}` has not been initialized"))
}

fn poisoned(name: &str) -> Error {
    Error::internal(format!("lock on resource `{name}` is poisoned"))
}

/// A read-only lookup table from byte strings to int64 values
pub struct HashTable {
    /// Resource name
    name: String,

    /// Value returned for missing keys
    default_value: i64,

    /// Table contents, `None` until initialized
    entries: RwLock<Option<HashMap<Vec<u8>, i64>>>,
}

impl HashTable {
    /// Create an uninitialized table
    pub fn new(name: impl Into<String>, default_value: i64) -> Self {
        Self {
            name: name.into(),
            default_value,
            entries: RwLock::new(None),
        }
    }

    /// Run the table's initializer, replacing any previous contents
    pub fn initialize<K: AsRef<[u8]>>(&self, entries: impl IntoIterator<Item = (K, i64)>) -> Result<()> {
        let table = entries
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_vec(), v))
            .collect();
        let mut guard = self.entries.write().map_err(|_| poisoned(&self.name))?;
        *guard = Some(table);
        Ok(())
    }

    /// Look up a key, returning the default value when it is absent
    pub fn lookup(&self, key: &[u8]) -> Result<i64> {
        let guard = self.entries.read().map_err(|_| poisoned(&self.name))?;
        let table = guard.as_ref().ok_or_else(|| not_initialized(&self.name))?;
        Ok(table.get(key).copied().unwrap_or(self.default_value))
    }

    /// Number of entries
    pub fn size(&self) -> Result<usize> {
        let guard = self.entries.read().map_err(|_| poisoned(&self.name))?;
        guard
            .as_ref()
            .map(HashMap::len)
            .ok_or_else(|| not_initialized(&self.name))
    }
}

impl Resource for HashTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.entries.read().map(|g| g.is_some()).unwrap_or(false)
    }
}

/// A mutable int64 counter
pub struct Variable {
    /// Resource name
    name: String,

    /// Current value, `None` until initialized
    value: Mutex<Option<i64>>,
}

impl Variable {
    /// Create an uninitialized variable
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(None),
        }
    }

    /// Run the variable's initializer
    pub fn initialize(&self, value: i64) -> Result<()> {
        *self.value.lock().map_err(|_| poisoned(&self.name))? = Some(value);
        Ok(())
    }

    /// Read the current value
    pub fn read(&self) -> Result<i64> {
        let guard = self.value.lock().map_err(|_| poisoned(&self.name))?;
        guard.ok_or_else(|| not_initialized(&self.name))
    }

    /// Add `delta` and return the value before the update
    pub fn assign_add(&self, delta: i64) -> Result<i64> {
        let mut guard = self.value.lock().map_err(|_| poisoned(&self.name))?;
        let current = guard.as_mut().ok_or_else(|| not_initialized(&self.name))?;
        let previous = *current;
        *current = previous.checked_add(delta).ok_or_else(|| {
            Error::evaluation(format!("variable {} overflowed adding {delta} to {previous}", self.name))
        })?;
        Ok(previous)
    }
}

impl Resource for Variable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.value.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_table() {
        let table = HashTable::new("vocab", -1);
        assert!(!table.is_initialized());
        assert!(table.lookup(b"a").unwrap_err().is_failed_precondition());

        table.initialize([("a", 0), ("b", 1)]).unwrap();
        assert!(table.is_initialized());
        assert_eq!(table.lookup(b"b").unwrap(), 1);
        assert_eq!(table.lookup(b"z").unwrap(), -1);
        assert_eq!(table.size().unwrap(), 2);
    }

    #[test]
    fn test_variable() {
        let counter = Variable::new("counter");
        assert!(counter.assign_add(1).is_err());
        counter.initialize(10).unwrap();
        assert_eq!(counter.assign_add(1).unwrap(), 10);
        assert_eq!(counter.read().unwrap(), 11);
    }

    #[test]
    fn test_variable_overflow_is_evaluation_error() {
        let counter = Variable::new("counter");
        counter.initialize(i64::MAX - 1).unwrap();
        assert_eq!(counter.assign_add(1).unwrap(), i64::MAX - 1);
        assert!(matches!(counter.assign_add(1), Err(Error::Evaluation(_))));
        assert_eq!(counter.read().unwrap(), i64::MAX);
    }
}
