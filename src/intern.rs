// SPDX-License-Identifier: BSD-3-Clause
//! Interning tables. Every equivalence class is stored at most once and is
//! addressed by a dense `u32` that stays stable for the lifetime of the
//! table.

use std::hash::Hash;

use rustc_hash::FxHashMap;

#[derive(Clone, Debug)]
pub struct Interner<T> {
    items: Vec<T>,
    index: FxHashMap<T, u32>,
}

impl<T: Clone + Eq + Hash> Interner<T> {
    pub fn new() -> Self {
        Interner {
            items: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Returns the index of `value`, inserting it if it has not been seen
    /// before. Interning the same value twice returns the same index.
    pub fn intern(&mut self, value: T) -> u32 {
        if let Some(&i) = self.index.get(&value) {
            return i;
        }
        let i = u32::try_from(self.items.len()).expect("interning table overflow");
        self.items.push(value.clone());
        self.index.insert(value, i);
        i
    }

    pub fn lookup(&self, value: &T) -> Option<u32> {
        self.index.get(value).copied()
    }

    pub fn get(&self, id: u32) -> &T {
        &self.items[id as usize]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone + Eq + Hash> Default for Interner<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Interner;

    #[test]
    fn interning_is_canonical() {
        let mut table = Interner::new();
        let a = table.intern(vec![1u32, 2, 3]);
        let b = table.intern(vec![4u32]);
        let c = table.intern(vec![1u32, 2, 3]);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), &vec![1, 2, 3]);
    }

    #[test]
    fn clear_resets_indices() {
        let mut table = Interner::new();
        table.intern("x".to_string());
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.intern("y".to_string()), 0);
    }
}
