use std::collections::HashMap;

use crate::{
    error::{LockError, Result},
    models::LockQueue,
};

/// Type name reported for lock values.
pub const LOCK_TYPE_NAME: &str = "blocklock";

/// A value held under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Lock(LockQueue),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Lock(_) => LOCK_TYPE_NAME,
            Value::Str(_) => "string",
        }
    }
}

/// In-memory keyspace. Owns every value exclusively.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Value>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Stores `value` under `key`, returning whatever was there before.
    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.entries.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn type_name(&self, key: &str) -> Option<&'static str> {
        self.entries.get(key).map(Value::type_name)
    }

    pub fn lock_queue(&self, key: &str) -> Result<Option<&LockQueue>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Lock(queue)) => Ok(Some(queue)),
            Some(_) => Err(LockError::WrongType),
        }
    }

    pub fn lock_queue_mut(&mut self, key: &str) -> Result<Option<&mut LockQueue>> {
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Value::Lock(queue)) => Ok(Some(queue)),
            Some(_) => Err(LockError::WrongType),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lock_count(&self) -> usize {
        self.entries
            .values()
            .filter(|value| matches!(value, Value::Lock(_)))
            .count()
    }
}
