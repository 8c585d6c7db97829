//! Table object
//!
//! The one aggregate type of the language: an associative container with
//! two keyed portions, an integer-keyed array part and a string-keyed
//! hash part. The key's runtime type selects the portion. Tables are
//! allocated through the memory manager; values stored in slots hold
//! references per its refcount rules.

use crate::vm::value::Value;
use rustc_hash::FxHashMap;

/// Dual array/hash associative container
#[derive(Debug, Default)]
pub struct Table {
    array: FxHashMap<i32, Value>,
    hash: FxHashMap<String, Value>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Table {
            array: FxHashMap::default(),
            hash: FxHashMap::default(),
        }
    }

    /// Read an array slot. Absent slots read as `Void`.
    pub fn get_array(&self, index: i32) -> Value {
        self.array.get(&index).copied().unwrap_or(Value::Void)
    }

    /// Write an array slot, returning the displaced value.
    pub fn set_array(&mut self, index: i32, value: Value) -> Option<Value> {
        self.array.insert(index, value)
    }

    /// Read a hash slot. Absent slots read as `Void`.
    pub fn get_hash(&self, key: &str) -> Value {
        self.hash.get(key).copied().unwrap_or(Value::Void)
    }

    /// Write a hash slot, returning the displaced value.
    pub fn set_hash(&mut self, key: String, value: Value) -> Option<Value> {
        self.hash.insert(key, value)
    }

    /// Number of occupied slots across both portions.
    pub fn len(&self) -> usize {
        self.array.len() + self.hash.len()
    }

    /// Whether both portions are empty.
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Iterate every stored value, both portions.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.array.values().chain(self.hash.values())
    }
}
