use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use equivalent::Equivalent;
use seize::{Guard, LocalGuard, OwnedGuard};

use crate::raw::{self, InsertResult};

/// A concurrent hash table.
///
/// Most hash table operations require a [`Guard`], which can be acquired
/// through [`HashMap::guard`] or using the [`HashMap::pin`] API. See the
/// [crate-level documentation](crate) for details.
pub struct HashMap<K, V, S = RandomState> {
    raw: raw::HashMap<K, V, S>,
}

impl<K, V> HashMap<K, V> {
    /// Creates an empty `HashMap`.
    ///
    /// The table is lazily allocated, so this does not allocate until
    /// the first insert.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(0, RandomState::new())
    }

    /// Creates an empty `HashMap` that can hold at least `capacity`
    /// entries without resizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map: HashMap<&str, i32> = HashMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        HashMap::with_capacity_and_hasher(0, S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` which will use the given hash builder.
    pub fn with_hasher(hasher: S) -> HashMap<K, V, S> {
        HashMap::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty `HashMap` with at least the given capacity,
    /// using `hasher` to hash the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::hash_map::RandomState;
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::with_capacity_and_hasher(10, RandomState::new());
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> HashMap<K, V, S> {
        HashMap {
            raw: raw::HashMap::new(capacity, hasher),
        }
    }

    /// Returns a guard for this table.
    ///
    /// Holding on to a guard pins the current thread, preventing memory
    /// reclamation for entries that are removed while it is active. See
    /// the [crate-level documentation](crate) for details.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.guard()
    }

    /// Returns an owned guard for this table.
    ///
    /// Owned guards implement `Send` and `Sync`, at a performance cost
    /// over [`HashMap::guard`].
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.owned_guard()
    }

    /// Returns a pinned reference to the map.
    ///
    /// The returned reference manages a guard internally, so operations
    /// on it do not take an explicit guard argument.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert('a', 1);
    /// assert_eq!(map.pin().len(), 1);
    /// ```
    #[inline]
    pub fn pin(&self) -> HashMapRef<'_, K, V, S, LocalGuard<'_>> {
        HashMapRef {
            guard: self.guard(),
            map: self,
        }
    }

    /// Returns a pinned reference to the map holding an owned guard,
    /// which can be sent or shared across threads.
    #[inline]
    pub fn pin_owned(&self) -> HashMapRef<'_, K, V, S, OwnedGuard<'_>> {
        HashMapRef {
            guard: self.owned_guard(),
            map: self,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is maintained on striped counters; it is exact when
    /// the map is quiescent and a recent approximation under
    /// concurrent updates.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// map.pin().insert(2, "b");
    /// assert_eq!(map.len(), 2);
    /// ```
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns `true` if the map contains the given key.
    ///
    /// The key may be any borrowed form of the map's key type, using
    /// the [`Equivalent`] trait.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert!(map.pin().contains_key(&1));
    /// assert!(!map.pin().contains_key(&2));
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q, guard: &impl Guard) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value for the given key.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert_eq!(map.pin().get(&1), Some(&"a"));
    /// assert_eq!(map.pin().get(&2), None);
    /// ```
    #[inline]
    pub fn get<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: 'g,
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.check_guard(guard);
        self.raw.get(key, guard).map(|(_, v)| v)
    }

    /// Returns the key-value pair for the given key.
    #[inline]
    pub fn get_key_value<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<(&'g K, &'g V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.check_guard(guard);
        self.raw.get(key, guard)
    }

    /// Returns an iterator over the entries of the map.
    ///
    /// The iterator is weakly consistent: it reflects the state of the
    /// map at some point during its lifetime, and never yields the same
    /// key twice, but updates made while iterating may or may not be
    /// observed.
    pub fn iter<'g, G: Guard>(&self, guard: &'g G) -> Iter<'g, K, V, G> {
        self.raw.check_guard(guard);
        Iter {
            raw: self.raw.iter(guard),
        }
    }

    /// Returns an iterator over the keys of the map.
    pub fn keys<'g, G: Guard>(&self, guard: &'g G) -> Keys<'g, K, V, G> {
        Keys {
            iter: self.iter(guard),
        }
    }

    /// Returns an iterator over the values of the map.
    pub fn values<'g, G: Guard>(&self, guard: &'g G) -> Values<'g, K, V, G> {
        Values {
            iter: self.iter(guard),
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Ord + Clone,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map, returning the value that
    /// was replaced, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().insert(37, "a"), None);
    /// assert_eq!(map.pin().insert(37, "b"), Some(&"a"));
    /// assert_eq!(map.pin().get(&37), Some(&"b"));
    /// ```
    #[inline]
    pub fn insert<'g>(&self, key: K, value: V, guard: &'g impl Guard) -> Option<&'g V> {
        self.raw.check_guard(guard);
        match self.raw.insert(key, value, true, guard) {
            InsertResult::Inserted(_) => None,
            InsertResult::Replaced(old) => Some(old),
            InsertResult::Error { .. } => unreachable!(),
        }
    }

    /// Inserts a key-value pair only if the key is not already present.
    ///
    /// Returns the inserted value, or an [`OccupiedError`] carrying the
    /// current value and the value that was not inserted.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().try_insert(37, "a"), Ok(&"a"));
    ///
    /// let guard = map.pin();
    /// let err = guard.try_insert(37, "b").unwrap_err();
    /// assert_eq!(err.current, &"a");
    /// assert_eq!(err.not_inserted, "b");
    /// ```
    #[inline]
    pub fn try_insert<'g>(
        &self,
        key: K,
        value: V,
        guard: &'g impl Guard,
    ) -> Result<&'g V, OccupiedError<'g, V>> {
        self.raw.check_guard(guard);
        match self.raw.insert(key, value, false, guard) {
            InsertResult::Inserted(value) => Ok(value),
            InsertResult::Error {
                current,
                not_inserted,
            } => Err(OccupiedError {
                current,
                not_inserted,
            }),
            InsertResult::Replaced(_) => unreachable!(),
        }
    }

    /// Returns the value for the given key, inserting the result of
    /// `f` if it is not present.
    ///
    /// `f` runs while the key's bucket is locked, so it should be
    /// cheap and must not access the map reentrantly.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().get_or_insert_with("a", || 1), &1);
    /// assert_eq!(map.pin().get_or_insert_with("a", || 2), &1);
    /// ```
    #[inline]
    pub fn get_or_insert_with<'g, F>(&self, key: K, f: F, guard: &'g impl Guard) -> &'g V
    where
        K: 'g,
        F: FnOnce() -> V,
    {
        let mut f = Some(f);
        let compute = self.compute(
            key,
            |entry| match entry {
                Some((_, current)) => Operation::Abort(current),
                // The closure runs at most once for a given bucket claim.
                None => Operation::Insert((f.take().unwrap())()),
            },
            guard,
        );

        match compute {
            Compute::Inserted(_, value) => value,
            Compute::Aborted(current) => current,
            _ => unreachable!(),
        }
    }

    /// Returns the value for the given key, inserting `value` if it is
    /// not present.
    #[inline]
    pub fn get_or_insert<'g>(&self, key: K, value: V, guard: &'g impl Guard) -> &'g V
    where
        K: 'g,
    {
        self.get_or_insert_with(key, || value, guard)
    }

    /// Updates an existing entry by applying `update` to its value,
    /// returning the new value.
    ///
    /// Returns `None` if the key is not present. `update` runs while
    /// the key's bucket is locked, so it should be cheap and must not
    /// access the map reentrantly.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert("a", 1);
    /// assert_eq!(map.pin().update("a", |v| v + 1), Some(&2));
    /// assert_eq!(map.pin().update("b", |v| v + 1), None);
    /// ```
    #[inline]
    pub fn update<'g, F>(&self, key: K, update: F, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: 'g,
        F: Fn(&V) -> V,
    {
        let compute = self.compute(
            key,
            |entry| match entry {
                Some((_, value)) => Operation::Insert(update(value)),
                None => Operation::Abort(()),
            },
            guard,
        );

        match compute {
            Compute::Updated { new: (_, value), .. } => Some(value),
            Compute::Aborted(()) => None,
            _ => unreachable!(),
        }
    }

    /// Updates an existing entry, or inserts the result of `f` if the
    /// key is not present. Returns the value after the call.
    #[inline]
    pub fn update_or_insert_with<'g, U, F>(
        &self,
        key: K,
        update: U,
        f: F,
        guard: &'g impl Guard,
    ) -> &'g V
    where
        K: 'g,
        U: Fn(&V) -> V,
        F: FnOnce() -> V,
    {
        let mut f = Some(f);
        let compute = self.compute::<_, ()>(
            key,
            |entry| match entry {
                Some((_, value)) => Operation::Insert(update(value)),
                // The closure runs at most once for a given bucket claim.
                None => Operation::Insert((f.take().unwrap())()),
            },
            guard,
        );

        match compute {
            Compute::Inserted(_, value) => value,
            Compute::Updated { new: (_, value), .. } => value,
            _ => unreachable!(),
        }
    }

    /// Updates an existing entry, or inserts `value` if the key is not
    /// present. Returns the value after the call.
    #[inline]
    pub fn update_or_insert<'g, U>(
        &self,
        key: K,
        update: U,
        value: V,
        guard: &'g impl Guard,
    ) -> &'g V
    where
        K: 'g,
        U: Fn(&V) -> V,
    {
        self.update_or_insert_with(key, update, || value, guard)
    }

    /// Updates an entry with a remapping closure.
    ///
    /// `remap` is called with the current entry, if any, and decides
    /// the [`Operation`] to perform. It runs while the key's bucket is
    /// locked, so it should be cheap and must not access the map
    /// reentrantly.
    ///
    /// # Panics
    ///
    /// Panics if `remap` returns [`Operation::Remove`] for a key that
    /// is not in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::{HashMap, Operation, Compute};
    ///
    /// let map = HashMap::new();
    /// map.pin().insert("a", 1);
    ///
    /// let guard = map.pin();
    /// let compute = guard.compute("a", |entry| match entry {
    ///     Some((_, v)) if *v < 10 => Operation::Insert(v + 1),
    ///     Some(_) => Operation::Remove,
    ///     None => Operation::Abort(()),
    /// });
    /// assert_eq!(compute, Compute::Updated {
    ///     old: (&"a", &1),
    ///     new: (&"a", &2),
    /// });
    /// ```
    #[inline]
    pub fn compute<'g, F, T>(
        &self,
        key: K,
        remap: F,
        guard: &'g impl Guard,
    ) -> Compute<'g, K, V, T>
    where
        F: FnMut(Option<(&'g K, &'g V)>) -> Operation<V, T>,
    {
        self.raw.check_guard(guard);
        self.raw.compute(key, remap, guard)
    }

    /// Removes the entry for the given key, returning its value.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert_eq!(map.pin().remove(&1), Some(&"a"));
    /// assert_eq!(map.pin().remove(&1), None);
    /// ```
    #[inline]
    pub fn remove<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: 'g,
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.check_guard(guard);
        self.raw
            .replace_entry(key, None, |_| true, guard)
            .map(|(_, v)| v)
    }

    /// Removes the entry for the given key if its value satisfies
    /// `should_remove`, returning the removed entry.
    #[inline]
    pub fn remove_if<'g, Q, F>(
        &self,
        key: &Q,
        should_remove: F,
        guard: &'g impl Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
        F: Fn(&V) -> bool,
    {
        self.raw.check_guard(guard);
        self.raw.replace_entry(key, None, should_remove, guard)
    }

    /// Replaces the value for an existing key, returning the previous
    /// value. The map is unchanged if the key is not present.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert_eq!(map.pin().replace(&1, "b"), Some(&"a"));
    /// assert_eq!(map.pin().replace(&2, "c"), None);
    /// assert_eq!(map.pin().get(&2), None);
    /// ```
    #[inline]
    pub fn replace<'g, Q>(&self, key: &Q, value: V, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: 'g,
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.check_guard(guard);
        self.raw
            .replace_entry(key, Some(value), |_| true, guard)
            .map(|(_, v)| v)
    }

    /// Removes all entries from the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// map.pin().clear();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self, guard: &impl Guard) {
        self.raw.check_guard(guard);
        self.raw.clear(guard)
    }
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.raw.iter(&guard)).finish()
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let (guard, other_guard) = (self.guard(), other.guard());
        self.raw
            .iter(&guard)
            .all(|(key, value)| other.get(key, &other_guard) == Some(value))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: Hash + Ord + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = HashMap::with_capacity_and_hasher(self.len(), self.raw.hasher.clone());
        {
            let (guard, cloned_guard) = (self.guard(), cloned.guard());
            for (key, value) in self.iter(&guard) {
                cloned.insert(key.clone(), value.clone(), &cloned_guard);
            }
        }
        cloned
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: Hash + Ord + Clone,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = self.guard();
        for (key, value) in iter {
            self.insert(key, value, &guard);
        }
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &HashMap<K, V, S>
where
    K: Hash + Ord + Copy,
    V: Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        let guard = self.guard();
        for (&key, &value) in iter {
            self.insert(key, value, &guard);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Ord + Clone,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();

        let (lower, _) = iter.size_hint();
        let map = HashMap::with_capacity_and_hasher(lower, S::default());
        {
            let guard = map.guard();
            for (key, value) in &mut iter {
                map.insert(key, value, &guard);
            }
        }

        map
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for HashMap<K, V>
where
    K: Hash + Ord + Clone,
{
    fn from(entries: [(K, V); N]) -> Self {
        HashMap::from_iter(entries)
    }
}

/// An error returned by [`HashMap::try_insert`] when the key already
/// exists.
#[derive(Debug, PartialEq, Eq)]
pub struct OccupiedError<'a, V> {
    /// The value in the map that was already present.
    pub current: &'a V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

/// An operation to perform on an entry, returned by a
/// [`compute`](HashMap::compute) closure.
#[derive(Debug, PartialEq, Eq)]
pub enum Operation<V, T> {
    /// Insert or replace the entry's value.
    Insert(V),

    /// Remove the entry from the map.
    Remove,

    /// Leave the entry untouched, aborting with the given value.
    Abort(T),
}

/// The state of an entry after a [`compute`](HashMap::compute)
/// operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Compute<'g, K, V, T> {
    /// The entry was inserted.
    Inserted(&'g K, &'g V),

    /// The entry was updated.
    Updated {
        /// The entry that was replaced.
        old: (&'g K, &'g V),
        /// The entry that now resides in the map.
        new: (&'g K, &'g V),
    },

    /// The entry was removed.
    Removed(&'g K, &'g V),

    /// The operation was aborted.
    Aborted(T),
}

/// A pinned reference to a [`HashMap`].
///
/// The reference manages a guard internally, so operations on it do
/// not take an explicit guard. Keeping a `HashMapRef` active for long
/// periods delays memory reclamation; see the [crate-level
/// documentation](crate) for details.
pub struct HashMapRef<'map, K, V, S, G> {
    guard: G,
    map: &'map HashMap<K, V, S>,
}

impl<'map, K, V, S, G> HashMapRef<'map, K, V, S, G>
where
    G: Guard,
{
    /// Returns a reference to the underlying map.
    pub fn map(&self) -> &'map HashMap<K, V, S> {
        self.map
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'map, K, V, S, G> HashMapRef<'map, K, V, S, G>
where
    K: Hash + Eq,
    S: BuildHasher,
    G: Guard,
{
    /// Returns `true` if the map contains the given key.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.map.contains_key(key, &self.guard)
    }

    /// Returns a reference to the value for the given key.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.map.get(key, &self.guard)
    }

    /// Returns the key-value pair for the given key.
    #[inline]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.map.get_key_value(key, &self.guard)
    }

    /// Returns an iterator over the entries of the map.
    pub fn iter(&self) -> Iter<'_, K, V, G> {
        self.map.iter(&self.guard)
    }

    /// Returns an iterator over the keys of the map.
    pub fn keys(&self) -> Keys<'_, K, V, G> {
        self.map.keys(&self.guard)
    }

    /// Returns an iterator over the values of the map.
    pub fn values(&self) -> Values<'_, K, V, G> {
        self.map.values(&self.guard)
    }
}

impl<'map, K, V, S, G> HashMapRef<'map, K, V, S, G>
where
    K: Hash + Ord + Clone,
    S: BuildHasher,
    G: Guard,
{
    /// Inserts a key-value pair into the map, returning the value that
    /// was replaced, if any.
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Option<&V> {
        self.map.insert(key, value, &self.guard)
    }

    /// Inserts a key-value pair only if the key is not already present.
    #[inline]
    pub fn try_insert(&self, key: K, value: V) -> Result<&V, OccupiedError<'_, V>> {
        self.map.try_insert(key, value, &self.guard)
    }

    /// Returns the value for the given key, inserting the result of
    /// `f` if it is not present.
    #[inline]
    pub fn get_or_insert_with<F>(&self, key: K, f: F) -> &V
    where
        F: FnOnce() -> V,
    {
        self.map.get_or_insert_with(key, f, &self.guard)
    }

    /// Returns the value for the given key, inserting `value` if it is
    /// not present.
    #[inline]
    pub fn get_or_insert(&self, key: K, value: V) -> &V {
        self.map.get_or_insert(key, value, &self.guard)
    }

    /// Updates an existing entry by applying `update` to its value,
    /// returning the new value.
    #[inline]
    pub fn update<F>(&self, key: K, update: F) -> Option<&V>
    where
        F: Fn(&V) -> V,
    {
        self.map.update(key, update, &self.guard)
    }

    /// Updates an existing entry, or inserts the result of `f` if the
    /// key is not present.
    #[inline]
    pub fn update_or_insert_with<U, F>(&self, key: K, update: U, f: F) -> &V
    where
        U: Fn(&V) -> V,
        F: FnOnce() -> V,
    {
        self.map.update_or_insert_with(key, update, f, &self.guard)
    }

    /// Updates an existing entry, or inserts `value` if the key is not
    /// present.
    #[inline]
    pub fn update_or_insert<U>(&self, key: K, update: U, value: V) -> &V
    where
        U: Fn(&V) -> V,
    {
        self.map.update_or_insert(key, update, value, &self.guard)
    }

    /// Updates an entry with a remapping closure. See
    /// [`HashMap::compute`] for details.
    #[inline]
    pub fn compute<F, T>(&self, key: K, remap: F) -> Compute<'_, K, V, T>
    where
        F: FnMut(Option<(&K, &V)>) -> Operation<V, T>,
    {
        self.map.compute(key, remap, &self.guard)
    }

    /// Removes the entry for the given key, returning its value.
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.map.remove(key, &self.guard)
    }

    /// Removes the entry for the given key if its value satisfies
    /// `should_remove`, returning the removed entry.
    #[inline]
    pub fn remove_if<Q, F>(&self, key: &Q, should_remove: F) -> Option<(&K, &V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
        F: Fn(&V) -> bool,
    {
        self.map.remove_if(key, should_remove, &self.guard)
    }

    /// Replaces the value for an existing key, returning the previous
    /// value.
    #[inline]
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<&V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.map.replace(key, value, &self.guard)
    }

    /// Removes all entries from the map.
    #[inline]
    pub fn clear(&self) {
        self.map.clear(&self.guard)
    }
}

impl<K, V, S, G> fmt::Debug for HashMapRef<'_, K, V, S, G>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.map.fmt(f)
    }
}

/// An iterator over the entries of a [`HashMap`].
pub struct Iter<'g, K, V, G> {
    raw: raw::Iter<'g, K, V, G>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Iter<'g, K, V, G>
where
    G: Guard,
{
    type Item = (&'g K, &'g V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next()
    }
}

impl<K, V, G> Clone for Iter<'_, K, V, G> {
    fn clone(&self) -> Self {
        Iter {
            raw: self.raw.clone(),
        }
    }
}

impl<'g, K, V, G> fmt::Debug for Iter<'g, K, V, G>
where
    K: fmt::Debug + 'g,
    V: fmt::Debug + 'g,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}

/// An iterator over the keys of a [`HashMap`].
pub struct Keys<'g, K, V, G> {
    iter: Iter<'g, K, V, G>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Keys<'g, K, V, G>
where
    G: Guard,
{
    type Item = &'g K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(key, _)| key)
    }
}

impl<'g, K, V, G> fmt::Debug for Keys<'g, K, V, G>
where
    K: fmt::Debug + 'g,
    V: fmt::Debug + 'g,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter.clone().map(|(key, _)| key))
            .finish()
    }
}

/// An iterator over the values of a [`HashMap`].
pub struct Values<'g, K, V, G> {
    iter: Iter<'g, K, V, G>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Values<'g, K, V, G>
where
    G: Guard,
{
    type Item = &'g V;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_, value)| value)
    }
}

impl<'g, K, V, G> fmt::Debug for Values<'g, K, V, G>
where
    K: fmt::Debug + 'g,
    V: fmt::Debug + 'g,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter.clone().map(|(_, value)| value))
            .finish()
    }
}
