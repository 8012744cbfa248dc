//! Generally useful container data structures

use unordered::UnorderedMap;

/// A set of values of type `T` that remembers the order in which values were first inserted.
/// Each value is given a dense index (its insertion position), which is stable for the lifetime
/// of the set.
#[derive(Debug, Clone)]
pub struct InsertionOrderedSet<T: Eq + std::hash::Hash + Ord + Clone> {
    data: Vec<T>,
    revmap: UnorderedMap<T, usize>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> InsertionOrderedSet<T> {
    /// A new, empty set
    pub fn new() -> Self {
        Self {
            data: Default::default(),
            revmap: Default::default(),
        }
    }

    /// Insert `v` if absent. Returns its index along with whether it was freshly inserted.
    pub fn insert_full(&mut self, v: T) -> (usize, bool) {
        if let Some(&idx) = self.revmap.get(&v) {
            (idx, false)
        } else {
            let idx = self.data.len();
            self.data.push(v.clone());
            self.revmap.insert(v, idx);
            (idx, true)
        }
    }

    /// Insert `v` if absent, returning its index either way.
    pub fn insert(&mut self, v: T) -> usize {
        self.insert_full(v).0
    }

    /// Get the member of the set at index `idx`.
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.data.get(idx)
    }

    /// Get the index of `v` if it exists in the set
    pub fn get_index(&self, v: &T) -> Option<usize> {
        self.revmap.get(v).cloned()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over the members in the order of insertion
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    /// Convert into a vec, in the order of insertion
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Default for InsertionOrderedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub mod unordered {
    //! Map and set types that state the _intention_ of unorderedness. The
    //! `deterministic_containers` feature (on by default) backs them with B-trees so that runs
    //! are reproducible and debug output is stable; without it they use hashing.
    //!
    //! Code must not rely on iteration order of these containers for anything observable.

    use std::ops::{Deref, DerefMut};

    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    type BaseSet<T> = std::collections::BTreeSet<T>;

    /// An unordered map; see the [module documentation](self).
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V>(BaseMap<K, V>);

    /// An unordered set; see the [module documentation](self).
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedSet<T: std::hash::Hash + Ord + Eq>(BaseSet<T>);

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        pub fn new() -> Self {
            Self(Default::default())
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> UnorderedSet<T> {
        pub fn new() -> Self {
            Self(Default::default())
        }

        /// The members in sorted order, for when order is observable
        pub fn sorted(&self) -> Vec<&T> {
            let mut v: Vec<&T> = self.0.iter().collect();
            v.sort();
            v
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Deref for UnorderedMap<K, V> {
        type Target = BaseMap<K, V>;
        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
    impl<K: std::hash::Hash + Ord + Eq, V> DerefMut for UnorderedMap<K, V> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }
    impl<T: std::hash::Hash + Ord + Eq> Deref for UnorderedSet<T> {
        type Target = BaseSet<T>;
        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
    impl<T: std::hash::Hash + Ord + Eq> DerefMut for UnorderedSet<T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }
    impl<T: std::hash::Hash + Ord + Eq> Default for UnorderedSet<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
        for UnorderedMap<K, V>
    {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_map()
                .entries(
                    self.0
                        .iter()
                        .collect::<std::collections::BTreeMap<_, _>>(),
                )
                .finish()
        }
    }
    impl<T: std::hash::Hash + Ord + Eq + std::fmt::Debug> std::fmt::Debug for UnorderedSet<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_set().entries(self.sorted()).finish()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
            Self(BaseMap::from_iter(iter))
        }
    }
    impl<T: std::hash::Hash + Ord + Eq> FromIterator<T> for UnorderedSet<T> {
        fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
            Self(BaseSet::from_iter(iter))
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Extend<T> for UnorderedSet<T> {
        fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
            self.0.extend(iter);
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> IntoIterator for UnorderedSet<T> {
        type Item = T;
        type IntoIter = <BaseSet<T> as IntoIterator>::IntoIter;
        fn into_iter(self) -> Self::IntoIter {
            self.0.into_iter()
        }
    }
    impl<'a, T: std::hash::Hash + Ord + Eq> IntoIterator for &'a UnorderedSet<T> {
        type Item = &'a T;
        type IntoIter = <&'a BaseSet<T> as IntoIterator>::IntoIter;
        fn into_iter(self) -> Self::IntoIter {
            self.0.iter()
        }
    }
    impl<'a, K: std::hash::Hash + Ord + Eq, V> IntoIterator for &'a UnorderedMap<K, V> {
        type Item = (&'a K, &'a V);
        type IntoIter = <&'a BaseMap<K, V> as IntoIterator>::IntoIter;
        fn into_iter(self) -> Self::IntoIter {
            self.0.iter()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq + Clone> std::ops::Sub for &UnorderedSet<T> {
        type Output = UnorderedSet<T>;
        fn sub(self, other: Self) -> Self::Output {
            UnorderedSet(self.0.difference(&other.0).cloned().collect())
        }
    }
}
