//! Per-type id tables

use std::collections::BTreeMap;

use crate::error::{C2cError, Result};

/// Reference-counted registry entry
#[derive(Debug)]
pub(crate) struct MappedObject<P> {
    pub id: u32,
    /// Application maps plus engine and export references
    pub refcount: u32,
    /// Application maps not yet unmapped
    pub live: u32,
    /// Every application map is gone but references remain
    pub marked_for_deletion: bool,
    pub payload: P,
}

impl<P> MappedObject<P> {
    pub fn new(id: u32, payload: P) -> Self {
        Self { id, refcount: 1, live: 1, marked_for_deletion: false, payload }
    }

    /// Another application map of an existing object
    pub fn adopt(&mut self) {
        self.refcount += 1;
        self.live += 1;
        self.marked_for_deletion = false;
    }
}

/// Id allocator plus storage; hands out the lowest free id in `[start, end)`
#[derive(Debug)]
pub(crate) struct IdTable<T> {
    start: u32,
    end: u32,
    entries: BTreeMap<u32, T>,
}

impl<T> IdTable<T> {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end, entries: BTreeMap::new() }
    }

    /// Allocate an id and store `make(id)` under it
    pub fn insert_with(&mut self, make: impl FnOnce(u32) -> T) -> Result<u32> {
        let mut candidate = self.start;
        for &id in self.entries.range(self.start..self.end).map(|(id, _)| id) {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= self.end {
            return Err(C2cError::ResourceExhausted("object ids"));
        }
        self.entries.insert(candidate, make(candidate));
        Ok(candidate)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.entries.values_mut().find(|v| pred(v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry
    pub fn take_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
