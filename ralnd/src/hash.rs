/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixed-size chained hash table used for the peer and connection
//! directories. The bucket count never changes after creation; keys hash
//! by modulus.

/// A hash table with a fixed number of chained buckets.
#[derive(Debug)]
pub struct HashTable<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    len: usize,
}

impl<K, V> HashTable<K, V>
where
    K: Copy + Eq + Into<u64>,
{
    pub fn new(nbuckets: usize) -> Self {
        assert!(nbuckets > 0, "hash table needs at least one bucket");
        Self {
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bucket(&self, key: K) -> usize {
        (key.into() % self.buckets.len() as u64) as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.buckets[self.bucket(key)]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let b = self.bucket(key);
        self.buckets[b]
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Insert, returning the value previously stored under `key`.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let b = self.bucket(key);
        let chain = &mut self.buckets[b];
        if let Some((_, v)) = chain.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(v, value));
        }
        chain.push((key, value));
        self.len += 1;
        None
    }

    /// The value under `key`, inserting `make()` first if there is none.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &mut V {
        let b = self.bucket(key);
        let chain = &mut self.buckets[b];
        let pos = match chain.iter().position(|(k, _)| *k == key) {
            Some(pos) => pos,
            None => {
                chain.push((key, make()));
                self.len += 1;
                chain.len() - 1
            }
        };
        &mut chain[pos].1
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let b = self.bucket(key);
        let chain = &mut self.buckets[b];
        let pos = chain.iter().position(|(k, _)| *k == key)?;
        self.len -= 1;
        Some(chain.swap_remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.buckets.iter().flatten().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.buckets.iter_mut().flatten().map(|(_, v)| v)
    }
}
