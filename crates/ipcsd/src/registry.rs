// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Generic identifier-keyed service registry.
//!
//! A thin layer over a hash map that adds wildcard-aware lookup via the
//! [`Matchable`] seam. Wildcard matching is a linear scan; the expected scale
//! is tens to low hundreds of active instances per binding plane, so no
//! specialised index is kept.

use std::collections::HashMap;
use std::hash::Hash;

use crate::instance::Matchable;

/// Availability state of a provided registry entry.
///
/// `NotProvided` entries are retained to tell "currently off" apart from
/// "never seen".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvidedState {
    Provided,
    #[default]
    NotProvided,
}

/// Subscription state of a required registry entry.
///
/// `NotRequired` entries are retained to tell "currently off" apart from
/// "never seen".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredState {
    Required,
    #[default]
    NotRequired,
}

/// Registry mapping service instance identifiers to entry values.
#[derive(Debug)]
pub struct ServiceRegistry<K, V> {
    map: HashMap<K, V>,
}

impl<K, V> Default for ServiceRegistry<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<K, V> ServiceRegistry<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Exact lookup.
    pub fn find(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Exact lookup, mutable.
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or overwrite.
    pub fn insert(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    /// Precondition-checked accessor for use after a prior positive lookup.
    ///
    /// # Panics
    ///
    /// Panics if no entry exists for `key`.
    pub fn at(&self, key: &K) -> &V {
        self.map
            .get(key)
            .expect("service registry has no such entry")
    }

    /// Mutable variant of [`ServiceRegistry::at`].
    ///
    /// # Panics
    ///
    /// Panics if no entry exists for `key`.
    pub fn at_mut(&mut self, key: &K) -> &mut V {
        self.map
            .get_mut(key)
            .expect("service registry has no such entry")
    }

    /// Keys whose identifier matches the query.
    pub fn matches<Q>(&self, query: &Q) -> Vec<K>
    where
        K: Matchable<Q>,
    {
        self.map
            .keys()
            .filter(|key| key.is_matching(query))
            .copied()
            .collect()
    }

    /// Matching entries with references to the stored values.
    pub fn match_and_get<Q>(&self, query: &Q) -> Vec<(K, &V)>
    where
        K: Matchable<Q>,
    {
        self.map
            .iter()
            .filter(|(key, _)| key.is_matching(query))
            .map(|(key, value)| (*key, value))
            .collect()
    }

    /// Matching entries with mutable references to the stored values.
    pub fn match_and_get_mut<Q>(&mut self, query: &Q) -> Vec<(K, &mut V)>
    where
        K: Matchable<Q>,
    {
        self.map
            .iter_mut()
            .filter(|(key, _)| key.is_matching(query))
            .map(|(key, value)| (*key, value))
            .collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.map.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
