mod alloc;
mod node;
mod tree;
pub mod utils;

use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::OnceLock;
use std::{ptr, thread};

use equivalent::Equivalent;
use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use self::alloc::{RawTable, Table};
use self::node::{BinEntry, Node, Reservation, TreeNode};
use self::tree::TreeBin;
use self::utils::{Backoff, Counter};

use crate::map::{Compute, Operation};

/// The capacity of a table allocated on the first insert.
const DEFAULT_CAPACITY: usize = 16;

/// The largest table length. Growth saturates here.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The chain length at which a bucket escalates to a tree bin.
const TREEIFY_THRESHOLD: usize = 8;

/// The bin size at which a tree bin de-escalates to a chain,
/// observed during removal or a resize split.
const UNTREEIFY_THRESHOLD: usize = 6;

/// The smallest table length at which bins may be treeified.
/// A smaller table is grown instead to shorten the chains.
const MIN_TREEIFY_CAPACITY: usize = 64;

/// The minimum number of buckets claimed per transfer stride.
const MIN_TRANSFER_STRIDE: usize = 16;

// The occupancy threshold for a table of length `n` (3/4).
#[inline]
fn threshold(n: usize) -> i64 {
    (n - (n >> 2)) as i64
}

// The number of CPUs, cached as `available_parallelism` is quite slow.
fn cpus() -> usize {
    static CPUS: OnceLock<usize> = OnceLock::new();
    *CPUS.get_or_init(|| {
        thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
    })
}

// The state of the map, packed into a single atomic control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctl {
    // Before the table is allocated: the requested capacity (0 for default).
    // After: the occupancy that triggers the next resize, or `DISABLED`
    // once the table reached the maximum capacity.
    Threshold(i64),
    // The initial table is being allocated.
    Initializing,
    // A resize is in progress.
    //
    // The stamp identifies the generation (derived from the capacity
    // being resized), so stale helpers fail to join. The helper count
    // includes the initiator; the last helper out commits the resize.
    Resizing { stamp: u32, helpers: u32 },
}

// Bits of the packed helper count.
const HELPER_BITS: u32 = 20;
const MAX_HELPERS: u32 = (1 << HELPER_BITS) - 1;

impl Ctl {
    const DISABLED: i64 = i64::MAX;

    fn pack(self) -> i64 {
        match self {
            Ctl::Threshold(t) => {
                debug_assert!(t >= 0);
                t
            }
            Ctl::Initializing => -1,
            Ctl::Resizing { stamp, helpers } => {
                debug_assert!(helpers <= MAX_HELPERS);
                i64::MIN | ((stamp as i64) << HELPER_BITS) | helpers as i64
            }
        }
    }

    fn unpack(raw: i64) -> Ctl {
        if raw >= 0 {
            return Ctl::Threshold(raw);
        }

        if raw == -1 {
            return Ctl::Initializing;
        }

        let bits = raw & i64::MAX;
        Ctl::Resizing {
            stamp: (bits >> HELPER_BITS) as u32,
            helpers: (bits as u32) & MAX_HELPERS,
        }
    }
}

// The resize generation stamp for a table of length `n`.
#[inline]
fn resize_stamp(n: usize) -> u32 {
    n.trailing_zeros()
}

/// A concurrent hash table with chained buckets.
pub struct HashMap<K, V, S> {
    // The root bucket array.
    table: AtomicPtr<RawTable<BinEntry<K, V>>>,
    // Collector for memory reclamation.
    collector: Collector,
    // The number of entries in the map.
    count: Counter,
    // The control word (see `Ctl`).
    size_ctl: AtomicI64,
    // The hasher for keys.
    pub hasher: S,
}

// Safety: entries are owned by the map and all access to shared
// pointers goes through the collector.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for HashMap<K, V, S> {}

/// The result of an insert operation.
pub enum InsertResult<'g, V> {
    /// Inserted the given value.
    Inserted(&'g V),

    /// Replaced the given value.
    Replaced(&'g V),

    /// The entry already exists and was not updated.
    Error { current: &'g V, not_inserted: V },
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates a map with the given pre-sized capacity and hasher.
    pub fn new(capacity: usize, hasher: S) -> HashMap<K, V, S> {
        // Pre-size so `capacity` insertions do not trigger a resize.
        let requested = match capacity {
            0 => 0,
            n => (n + (n >> 1) + 1)
                .next_power_of_two()
                .min(MAXIMUM_CAPACITY) as i64,
        };

        HashMap {
            table: AtomicPtr::new(ptr::null_mut()),
            collector: Collector::new(),
            count: Counter::default(),
            size_ctl: AtomicI64::new(Ctl::Threshold(requested).pack()),
            hasher,
        }
    }

    /// Returns a guard for this map's collector.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Returns an owned guard for this map's collector.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.collector.enter_owned()
    }

    /// Verify that a guard is valid to use with this map.
    #[inline]
    pub fn check_guard(&self, guard: &impl Guard) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "accessed map with incorrect guard"
        );
    }

    /// Returns the number of entries in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.sum()
    }

    // Loads the root table.
    #[inline]
    fn root(&self, guard: &impl Guard) -> Table<BinEntry<K, V>> {
        // Safety: the root table is only retired after it is unlinked.
        unsafe { Table::from_raw(guard.protect(&self.table, Ordering::Acquire)) }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    S: BuildHasher,
{
    // The spread hash for a key.
    //
    // The high half is folded into the low half so high bits
    // participate in bucket selection, and keys split consistently
    // as the table doubles.
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let h = self.hasher.hash_one(key);
        h ^ (h >> 32)
    }

    /// Returns the key and value for `key`, if present.
    #[inline]
    pub fn get<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<(&'g K, &'g V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.hash(key);
        let mut table = self.root(guard);

        loop {
            if table.raw.is_null() {
                return None;
            }

            let i = hash as usize & table.mask;
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);
            if bin.is_null() {
                return None;
            }

            match unsafe { &*bin } {
                BinEntry::Node(head) => {
                    let mut node = head;
                    loop {
                        if node.hash == hash && key.equivalent(&node.key) {
                            let value = guard.protect(&node.value, Ordering::Acquire);
                            // Safety: values are retired through the guard.
                            return Some((&node.key, unsafe { &*value }));
                        }

                        let next = guard.protect(&node.next, Ordering::Acquire);
                        if next.is_null() {
                            return None;
                        }

                        node = unsafe { (*next).as_node() };
                    }
                }
                BinEntry::Tree(bin) => {
                    let p = bin.find(hash, key, guard);
                    if p.is_null() {
                        return None;
                    }

                    let node = unsafe { (*p).as_node() };
                    let value = guard.protect(&node.value, Ordering::Acquire);
                    // Safety: values are retired through the guard.
                    return Some((&node.key, unsafe { &*value }));
                }
                // The bucket moved to the next table, keep looking there.
                BinEntry::Moved(next) => {
                    // Safety: the next table is retired strictly after this one.
                    table = unsafe { Table::from_raw(*next) };
                }
                // A pending `compute`: the key is not present yet.
                BinEntry::Reserved(_) => return None,
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Clone + Ord,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map.
    ///
    /// If `replace` is false and the key already exists, the insertion
    /// fails and the current value is returned.
    pub fn insert<'g>(
        &self,
        key: K,
        value: V,
        replace: bool,
        guard: &'g impl Guard,
    ) -> InsertResult<'g, V> {
        let hash = self.hash(&key);
        let value = Box::into_raw(Box::new(value));
        let mut key = Some(key);

        let mut table = self.root(guard);
        loop {
            if table.raw.is_null() {
                table = self.init_table(guard);
            }

            let i = hash as usize & table.mask;
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);

            if bin.is_null() {
                // The bucket is empty: try to claim it without locking.
                let node = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                    hash,
                    key.take().unwrap(),
                    value,
                ))));

                match unsafe { table.bin(i) }.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.add_count(1, guard);
                        // Safety: the value was just published under this guard.
                        return InsertResult::Inserted(unsafe { &*value });
                    }
                    Err(_) => {
                        // Lost the race: take the key back and retry.
                        // Safety: our node was never published.
                        match *unsafe { Box::from_raw(node) } {
                            BinEntry::Node(node) => key = Some(node.key),
                            _ => unreachable!(),
                        }
                        continue;
                    }
                }
            }

            match unsafe { &*bin } {
                BinEntry::Moved(next) => table = self.help_transfer(table, *next, guard),
                BinEntry::Reserved(reservation) => self.block_on_reservation(reservation),
                BinEntry::Node(head) => {
                    let lock = node::lock(&head.lock);

                    // The head changed under us, retry.
                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut node = head;
                    loop {
                        if node.hash == hash && Some(&node.key) == key.as_ref() {
                            if !replace {
                                let current = node.value.load(Ordering::Acquire);
                                drop(lock);
                                // Safety: our value was never published.
                                let not_inserted = unsafe { *Box::from_raw(value) };
                                // Safety: values are retired through the guard.
                                return InsertResult::Error {
                                    current: unsafe { &*current },
                                    not_inserted,
                                };
                            }

                            // Replace the value in place.
                            let old = node.value.swap(value, Ordering::AcqRel);
                            drop(lock);

                            // Safety: the old value is unreachable from this bucket.
                            unsafe { guard.defer_retire(old, node::reclaim_value) };
                            return InsertResult::Replaced(unsafe { &*old });
                        }

                        let next = node.next.load(Ordering::Acquire);
                        if next.is_null() {
                            // Append to the tail.
                            let new = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                                hash,
                                key.take().unwrap(),
                                value,
                            ))));
                            node.next.store(new, Ordering::Release);
                            break;
                        }

                        node = unsafe { (*next).as_node() };
                        bin_count += 1;
                    }
                    drop(lock);

                    if bin_count + 1 >= TREEIFY_THRESHOLD {
                        self.treeify_bin(table, i, guard);
                    }

                    self.add_count(1, guard);
                    // Safety: the value was just published under this guard.
                    return InsertResult::Inserted(unsafe { &*value });
                }
                BinEntry::Tree(tree_bin) => {
                    let lock = node::lock(&tree_bin.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    // Safety: the bin lock is held.
                    let existing =
                        unsafe { tree_bin.put_tree_node(hash, key.take().unwrap(), value) };

                    if existing.is_null() {
                        drop(lock);
                        self.add_count(1, guard);
                        // Safety: the value was just published under this guard.
                        return InsertResult::Inserted(unsafe { &*value });
                    }

                    let node = unsafe { (*existing).as_node() };
                    if !replace {
                        let current = node.value.load(Ordering::Acquire);
                        drop(lock);
                        // Safety: our value was never published.
                        let not_inserted = unsafe { *Box::from_raw(value) };
                        return InsertResult::Error {
                            current: unsafe { &*current },
                            not_inserted,
                        };
                    }

                    let old = node.value.swap(value, Ordering::AcqRel);
                    drop(lock);

                    // Safety: the old value is unreachable from this bucket.
                    unsafe { guard.defer_retire(old, node::reclaim_value) };
                    return InsertResult::Replaced(unsafe { &*old });
                }
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        }
    }

    /// Removes the entry for `key` if `should` accepts the current value,
    /// or replaces its value with `new` if one is provided.
    pub fn replace_entry<'g, Q>(
        &self,
        key: &Q,
        new: Option<V>,
        should: impl Fn(&V) -> bool,
        guard: &'g impl Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.hash(key);
        let mut new = new.map(|v| Box::into_raw(Box::new(v)));

        let mut table = self.root(guard);
        let result = loop {
            if table.raw.is_null() {
                break None;
            }

            let i = hash as usize & table.mask;
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);
            if bin.is_null() {
                break None;
            }

            match unsafe { &*bin } {
                BinEntry::Moved(next) => table = self.help_transfer(table, *next, guard),
                BinEntry::Reserved(reservation) => self.block_on_reservation(reservation),
                BinEntry::Node(_) => {
                    let head = unsafe { (*bin).as_node() };
                    let lock = node::lock(&head.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    let mut pred: *mut BinEntry<K, V> = ptr::null_mut();
                    let mut e = bin;
                    break loop {
                        if e.is_null() {
                            drop(lock);
                            break None;
                        }

                        let node = unsafe { (*e).as_node() };
                        if node.hash == hash && key.equivalent(&node.key) {
                            let current = node.value.load(Ordering::Acquire);
                            // Safety: the value is stable under the bin lock.
                            if !should(unsafe { &*current }) {
                                drop(lock);
                                break None;
                            }

                            if let Some(value) = new.take() {
                                // Replace the value in place.
                                let old = node.value.swap(value, Ordering::AcqRel);
                                drop(lock);

                                // Safety: the old value is unreachable from this bucket.
                                unsafe { guard.defer_retire(old, node::reclaim_value) };
                                break Some((&node.key, unsafe { &*old }));
                            }

                            // Unlink the node.
                            let next = node.next.load(Ordering::Acquire);
                            if pred.is_null() {
                                unsafe { table.bin(i) }.store(next, Ordering::Release);
                            } else {
                                unsafe { (*pred).as_node() }.next.store(next, Ordering::Release);
                            }
                            drop(lock);

                            // Safety: the node is unreachable and owns its value.
                            unsafe { guard.defer_retire(e, node::reclaim_entry) };
                            self.add_count(-1, guard);
                            break Some((&node.key, unsafe { &*current }));
                        }

                        pred = e;
                        e = node.next.load(Ordering::Acquire);
                    };
                }
                BinEntry::Tree(tree_bin) => {
                    let lock = node::lock(&tree_bin.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::Acquire);
                    let p = match root.is_null() {
                        true => ptr::null_mut(),
                        // Safety: the bin lock excludes structural writers.
                        false => unsafe { tree::find_tree_node(root, hash, key) },
                    };

                    if p.is_null() {
                        drop(lock);
                        break None;
                    }

                    let node = unsafe { (*p).as_node() };
                    let current = node.value.load(Ordering::Acquire);
                    if !should(unsafe { &*current }) {
                        drop(lock);
                        break None;
                    }

                    if let Some(value) = new.take() {
                        let old = node.value.swap(value, Ordering::AcqRel);
                        drop(lock);

                        // Safety: the old value is unreachable from this bucket.
                        unsafe { guard.defer_retire(old, node::reclaim_value) };
                        break Some((&node.key, unsafe { &*old }));
                    }

                    // Safety: the bin lock is held and `p` belongs to this bin.
                    let too_small = unsafe { tree_bin.remove_tree_node(p) };
                    if too_small {
                        // Replace the bin with a plain chain.
                        let chain = unsafe { self.untreeify(tree_bin) };
                        unsafe { table.bin(i) }.store(chain, Ordering::Release);
                        // Safety: the chain is published, so the old list
                        // and its container are unreachable to new readers.
                        unsafe { self.retire_tree_nodes(tree_bin, guard) };
                        unsafe { guard.defer_retire(bin, node::reclaim_node) };
                    }
                    drop(lock);

                    // Safety: the node is unreachable and owns its value.
                    unsafe { guard.defer_retire(p, node::reclaim_entry) };
                    self.add_count(-1, guard);
                    break Some((&node.key, unsafe { &*current }));
                }
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        };

        if let Some(unused) = new {
            // Safety: the replacement was never published.
            let _ = unsafe { Box::from_raw(unused) };
        }

        result
    }

    /// Updates an entry with a remapping closure.
    ///
    /// The closure may be called multiple times if the bucket is
    /// contended, and runs under the bucket lock (or a reservation
    /// for an absent key), so it must not access this bucket
    /// reentrantly.
    pub fn compute<'g, F, T>(
        &self,
        key: K,
        mut remap: F,
        guard: &'g impl Guard,
    ) -> Compute<'g, K, V, T>
    where
        F: FnMut(Option<(&'g K, &'g V)>) -> Operation<V, T>,
    {
        let hash = self.hash(&key);
        let mut key = Some(key);

        let mut table = self.root(guard);
        loop {
            if table.raw.is_null() {
                table = self.init_table(guard);
            }

            let i = hash as usize & table.mask;
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);

            if bin.is_null() {
                // Claim the bucket with a reservation while the
                // closure decides what to do.
                let reserved = Box::into_raw(Box::new(BinEntry::Reserved(Reservation::new())));
                let reservation = match unsafe { &*reserved } {
                    BinEntry::Reserved(reservation) => reservation,
                    _ => unreachable!(),
                };

                // Acquire the reservation lock before publishing it.
                let lock = node::lock(&reservation.lock);

                if unsafe { table.bin(i) }
                    .compare_exchange(
                        ptr::null_mut(),
                        reserved,
                        Ordering::Release,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    drop(lock);
                    // Safety: our reservation was never published.
                    let _ = unsafe { Box::from_raw(reserved) };
                    continue;
                }

                // Run the closure, rolling the reservation back if it unwinds.
                let operation = match panic::catch_unwind(AssertUnwindSafe(|| remap(None))) {
                    Ok(operation) => operation,
                    Err(unwind) => {
                        unsafe { table.bin(i) }.store(ptr::null_mut(), Ordering::Release);
                        drop(lock);
                        // Safety: the reservation is unreachable and owns no value.
                        unsafe { guard.defer_retire(reserved, node::reclaim_node) };
                        panic::resume_unwind(unwind);
                    }
                };

                match operation {
                    Operation::Insert(value) => {
                        let value = Box::into_raw(Box::new(value));
                        let new = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                            hash,
                            key.take().unwrap(),
                            value,
                        ))));

                        unsafe { table.bin(i) }.store(new, Ordering::Release);
                        drop(lock);

                        // Safety: the reservation is unreachable and owns no value.
                        unsafe { guard.defer_retire(reserved, node::reclaim_node) };
                        self.add_count(1, guard);

                        // Safety: the entry was just published under this guard.
                        let node = unsafe { (*new).as_node() };
                        return Compute::Inserted(&node.key, unsafe { &*value });
                    }
                    Operation::Remove => panic!("cannot remove an entry that does not exist"),
                    Operation::Abort(value) => {
                        unsafe { table.bin(i) }.store(ptr::null_mut(), Ordering::Release);
                        drop(lock);
                        // Safety: the reservation is unreachable and owns no value.
                        unsafe { guard.defer_retire(reserved, node::reclaim_node) };
                        return Compute::Aborted(value);
                    }
                }
            }

            match unsafe { &*bin } {
                BinEntry::Moved(next) => table = self.help_transfer(table, *next, guard),
                BinEntry::Reserved(reservation) => self.block_on_reservation(reservation),
                BinEntry::Node(_) => {
                    let head = unsafe { (*bin).as_node() };
                    let lock = node::lock(&head.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut pred: *mut BinEntry<K, V> = ptr::null_mut();
                    let mut e = bin;
                    loop {
                        if e.is_null() {
                            // The key is absent from this chain.
                            match remap(None) {
                                Operation::Insert(value) => {
                                    let value = Box::into_raw(Box::new(value));
                                    let new = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                                        hash,
                                        key.take().unwrap(),
                                        value,
                                    ))));
                                    unsafe { (*pred).as_node() }
                                        .next
                                        .store(new, Ordering::Release);
                                    drop(lock);

                                    if bin_count + 1 >= TREEIFY_THRESHOLD {
                                        self.treeify_bin(table, i, guard);
                                    }
                                    self.add_count(1, guard);

                                    let node = unsafe { (*new).as_node() };
                                    return Compute::Inserted(&node.key, unsafe { &*value });
                                }
                                Operation::Remove => {
                                    panic!("cannot remove an entry that does not exist")
                                }
                                Operation::Abort(value) => {
                                    drop(lock);
                                    return Compute::Aborted(value);
                                }
                            }
                        }

                        let node = unsafe { (*e).as_node() };
                        if node.hash == hash && Some(&node.key) == key.as_ref() {
                            let current = node.value.load(Ordering::Acquire);
                            // Safety: the value is stable under the bin lock.
                            let entry = (&node.key, unsafe { &*current });

                            match remap(Some(entry)) {
                                Operation::Insert(value) => {
                                    let value = Box::into_raw(Box::new(value));
                                    let old = node.value.swap(value, Ordering::AcqRel);
                                    drop(lock);

                                    // Safety: the old value is unreachable from this bucket.
                                    unsafe { guard.defer_retire(old, node::reclaim_value) };
                                    return Compute::Updated {
                                        old: entry,
                                        new: (&node.key, unsafe { &*value }),
                                    };
                                }
                                Operation::Remove => {
                                    let next = node.next.load(Ordering::Acquire);
                                    if pred.is_null() {
                                        unsafe { table.bin(i) }.store(next, Ordering::Release);
                                    } else {
                                        unsafe { (*pred).as_node() }
                                            .next
                                            .store(next, Ordering::Release);
                                    }
                                    drop(lock);

                                    // Safety: the node is unreachable and owns its value.
                                    unsafe { guard.defer_retire(e, node::reclaim_entry) };
                                    self.add_count(-1, guard);
                                    return Compute::Removed(entry.0, entry.1);
                                }
                                Operation::Abort(value) => {
                                    drop(lock);
                                    return Compute::Aborted(value);
                                }
                            }
                        }

                        pred = e;
                        e = node.next.load(Ordering::Acquire);
                        bin_count += 1;
                    }
                }
                BinEntry::Tree(tree_bin) => {
                    let lock = node::lock(&tree_bin.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::Acquire);
                    let p = match root.is_null() {
                        true => ptr::null_mut(),
                        // Safety: the bin lock excludes structural writers.
                        false => unsafe {
                            tree::find_tree_node(root, hash, key.as_ref().unwrap())
                        },
                    };

                    if p.is_null() {
                        match remap(None) {
                            Operation::Insert(value) => {
                                let value = Box::into_raw(Box::new(value));
                                // Safety: the bin lock is held.
                                let existing = unsafe {
                                    tree_bin.put_tree_node(hash, key.take().unwrap(), value)
                                };
                                debug_assert!(existing.is_null());

                                // New tree nodes are prepended to the traversal list.
                                let new = tree_bin.first.load(Ordering::Acquire);
                                drop(lock);
                                self.add_count(1, guard);

                                // Safety: the entry was just published under this guard.
                                let node = unsafe { (*new).as_node() };
                                return Compute::Inserted(&node.key, unsafe { &*value });
                            }
                            Operation::Remove => {
                                panic!("cannot remove an entry that does not exist")
                            }
                            Operation::Abort(value) => {
                                drop(lock);
                                return Compute::Aborted(value);
                            }
                        }
                    }

                    let node = unsafe { (*p).as_node() };
                    let current = node.value.load(Ordering::Acquire);
                    let entry = (&node.key, unsafe { &*current });

                    match remap(Some(entry)) {
                        Operation::Insert(value) => {
                            let value = Box::into_raw(Box::new(value));
                            let old = node.value.swap(value, Ordering::AcqRel);
                            drop(lock);

                            // Safety: the old value is unreachable from this bucket.
                            unsafe { guard.defer_retire(old, node::reclaim_value) };
                            return Compute::Updated {
                                old: entry,
                                new: (&node.key, unsafe { &*value }),
                            };
                        }
                        Operation::Remove => {
                            // Safety: the bin lock is held and `p` belongs to this bin.
                            let too_small = unsafe { tree_bin.remove_tree_node(p) };
                            if too_small {
                                let chain = unsafe { self.untreeify(tree_bin) };
                                unsafe { table.bin(i) }.store(chain, Ordering::Release);
                                // Safety: the chain is published, so the old
                                // list and its container are unreachable to
                                // new readers.
                                unsafe { self.retire_tree_nodes(tree_bin, guard) };
                                unsafe { guard.defer_retire(bin, node::reclaim_node) };
                            }
                            drop(lock);

                            // Safety: the node is unreachable and owns its value.
                            unsafe { guard.defer_retire(p, node::reclaim_entry) };
                            self.add_count(-1, guard);
                            return Compute::Removed(entry.0, entry.1);
                        }
                        Operation::Abort(value) => {
                            drop(lock);
                            return Compute::Aborted(value);
                        }
                    }
                }
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        }
    }

    /// Removes all entries from the map.
    pub fn clear(&self, guard: &impl Guard) {
        let mut table = self.root(guard);
        let mut i = 0;

        while !table.raw.is_null() && i < table.len() {
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);
            if bin.is_null() {
                i += 1;
                continue;
            }

            match unsafe { &*bin } {
                BinEntry::Moved(next) => {
                    // Restart in the next table.
                    table = self.help_transfer(table, *next, guard);
                    i = 0;
                }
                BinEntry::Reserved(reservation) => self.block_on_reservation(reservation),
                BinEntry::Node(head) => {
                    let lock = node::lock(&head.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    unsafe { table.bin(i) }.store(ptr::null_mut(), Ordering::Release);

                    let mut removed = 0;
                    let mut e = bin;
                    while !e.is_null() {
                        let next = unsafe { (*e).as_node() }.next.load(Ordering::Acquire);
                        // Safety: the chain is unreachable and each node owns its value.
                        unsafe { guard.defer_retire(e, node::reclaim_entry) };
                        removed += 1;
                        e = next;
                    }
                    drop(lock);

                    self.count.add(-removed, guard);
                    i += 1;
                }
                BinEntry::Tree(tree_bin) => {
                    let lock = node::lock(&tree_bin.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    unsafe { table.bin(i) }.store(ptr::null_mut(), Ordering::Release);

                    let mut removed = 0;
                    let mut e = tree_bin.first.load(Ordering::Acquire);
                    while !e.is_null() {
                        let next = unsafe { (*e).as_node() }.next.load(Ordering::Acquire);
                        // Safety: the bin is unreachable and each node owns its value.
                        unsafe { guard.defer_retire(e, node::reclaim_entry) };
                        removed += 1;
                        e = next;
                    }
                    drop(lock);

                    // Safety: the bin container is unreachable and owns no value.
                    unsafe { guard.defer_retire(bin, node::reclaim_node) };
                    self.count.add(-removed, guard);
                    i += 1;
                }
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        }
    }

    // Blocks until a pending `compute` on the bucket completes.
    //
    // Meeting a reservation owned by the current thread means a
    // remapping closure re-entered the map, which would deadlock.
    #[cold]
    fn block_on_reservation(&self, reservation: &Reservation) {
        assert!(
            reservation.owner != thread::current().id(),
            "recursive update: remapping closure re-entered the map"
        );

        drop(node::lock(&reservation.lock));
    }

    // Allocates the initial table.
    #[cold]
    fn init_table(&self, guard: &impl Guard) -> Table<BinEntry<K, V>> {
        let mut backoff = Backoff::new();

        loop {
            let raw = guard.protect(&self.table, Ordering::Acquire);
            if !raw.is_null() {
                // Safety: the root table is only retired after it is unlinked.
                return unsafe { Table::from_raw(raw) };
            }

            let ctl = self.size_ctl.load(Ordering::Acquire);
            match Ctl::unpack(ctl) {
                // Another thread is allocating, wait for the table to appear.
                Ctl::Initializing => backoff.spin(),
                Ctl::Threshold(requested) => {
                    if self
                        .size_ctl
                        .compare_exchange(
                            ctl,
                            Ctl::Initializing.pack(),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        continue;
                    }

                    let capacity = match requested {
                        0 => DEFAULT_CAPACITY,
                        n => n as usize,
                    };

                    let table = Table::alloc(capacity);
                    self.table.store(table.raw, Ordering::Release);
                    self.size_ctl.store(
                        Ctl::Threshold(threshold(capacity)).pack(),
                        Ordering::Release,
                    );

                    return table;
                }
                Ctl::Resizing { .. } => unreachable!("resizing an unallocated table"),
            }
        }
    }

    // Adjusts the entry count, initiating or helping a resize if the
    // occupancy threshold was crossed.
    fn add_count(&self, delta: isize, guard: &impl Guard) {
        self.count.add(delta, guard);

        if delta < 0 {
            return;
        }

        loop {
            let ctl = self.size_ctl.load(Ordering::Acquire);
            match Ctl::unpack(ctl) {
                Ctl::Threshold(t) => {
                    if t == Ctl::DISABLED || (self.count.sum() as i64) < t {
                        return;
                    }

                    let table = self.root(guard);
                    if table.raw.is_null() {
                        return;
                    }

                    let n = table.len();
                    if n >= MAXIMUM_CAPACITY {
                        // Saturate: the table never grows again.
                        let _ = self.size_ctl.compare_exchange(
                            ctl,
                            Ctl::Threshold(Ctl::DISABLED).pack(),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                        return;
                    }

                    let resizing = Ctl::Resizing {
                        stamp: resize_stamp(n),
                        helpers: 1,
                    };

                    if self
                        .size_ctl
                        .compare_exchange(ctl, resizing.pack(), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        // We initiate the resize: allocate the next table and
                        // seed the transfer cursor before publishing it.
                        let next = Table::alloc(n << 1);
                        table
                            .state()
                            .transfer_index
                            .store(n as isize, Ordering::Release);
                        table.state().next.store(next.raw, Ordering::Release);

                        self.transfer(table, next, guard);
                    }
                }
                Ctl::Resizing { stamp, helpers } => {
                    let table = self.root(guard);
                    if table.raw.is_null() {
                        return;
                    }

                    // Only help a resize of the current generation.
                    if stamp != resize_stamp(table.len()) || helpers == MAX_HELPERS {
                        return;
                    }

                    let next = guard.protect(&table.state().next, Ordering::Acquire);
                    if next.is_null() {
                        // The initiator is still allocating.
                        return;
                    }

                    if table.state().transfer_index.load(Ordering::Acquire) <= 0 {
                        return;
                    }

                    let joined = Ctl::Resizing {
                        stamp,
                        helpers: helpers + 1,
                    };

                    if self
                        .size_ctl
                        .compare_exchange(ctl, joined.pack(), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        // Safety: the next table is protected by the guard.
                        self.transfer(table, unsafe { Table::from_raw(next) }, guard);
                    }
                }
                Ctl::Initializing => return,
            }
        }
    }

    // Helps complete the resize a forwarded bucket points into,
    // returning the next table.
    fn help_transfer(
        &self,
        table: Table<BinEntry<K, V>>,
        next: *mut RawTable<BinEntry<K, V>>,
        guard: &impl Guard,
    ) -> Table<BinEntry<K, V>> {
        // Safety: the next table is reachable from a live forwarding marker.
        let next = unsafe { Table::from_raw(next) };
        let stamp = resize_stamp(table.len());

        loop {
            let ctl = self.size_ctl.load(Ordering::Acquire);
            let Ctl::Resizing { stamp: s, helpers } = Ctl::unpack(ctl) else {
                break;
            };

            // The resize is committed, or is not this table's.
            if s != stamp || helpers == MAX_HELPERS {
                break;
            }

            if table.state().transfer_index.load(Ordering::Acquire) <= 0 {
                break;
            }

            let joined = Ctl::Resizing {
                stamp,
                helpers: helpers + 1,
            };

            if self
                .size_ctl
                .compare_exchange(ctl, joined.pack(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, next, guard);
                break;
            }
        }

        next
    }

    // Transfers buckets into the next table in cooperative strides.
    fn transfer(
        &self,
        table: Table<BinEntry<K, V>>,
        next: Table<BinEntry<K, V>>,
        guard: &impl Guard,
    ) {
        let n = table.len();
        let stride = (n / (8 * cpus())).max(MIN_TRANSFER_STRIDE);

        loop {
            // Claim a stride of buckets.
            let claim = table.state().transfer_index.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |i| (i > 0).then(|| (i - stride as isize).max(0)),
            );

            let Ok(hi) = claim else { break };
            // The final stride may be short if the table length is not a
            // multiple of the stride.
            let lo = hi.saturating_sub(stride as isize).max(0);

            for i in (lo..hi).rev() {
                self.transfer_bin(i as usize, table, next, guard);
            }
        }

        self.finish_transfer(table, next, guard);
    }

    // Transfers a single bucket, leaving a forwarding marker behind.
    fn transfer_bin(
        &self,
        i: usize,
        table: Table<BinEntry<K, V>>,
        next: Table<BinEntry<K, V>>,
        guard: &impl Guard,
    ) {
        let n = table.len();

        loop {
            // Safety: `i` is in-bounds and bucket heads are protected by the guard.
            let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);

            if bin.is_null() {
                let moved = Box::into_raw(Box::new(BinEntry::Moved(next.raw)));
                match unsafe { table.bin(i) }.compare_exchange(
                    ptr::null_mut(),
                    moved,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(_) => {
                        // Safety: our marker was never published.
                        let _ = unsafe { Box::from_raw(moved) };
                        continue;
                    }
                }
            }

            match unsafe { &*bin } {
                BinEntry::Moved(_) => return,
                BinEntry::Reserved(reservation) => self.block_on_reservation(reservation),
                BinEntry::Node(head) => {
                    let lock = node::lock(&head.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    // Split the chain into its low and high halves. The old
                    // chain is never mutated, so concurrent readers can keep
                    // traversing it until it is retired.
                    let mut lo: (*mut BinEntry<K, V>, *mut BinEntry<K, V>) =
                        (ptr::null_mut(), ptr::null_mut());
                    let mut hi = lo;

                    let mut e = bin;
                    while !e.is_null() {
                        let node = unsafe { (*e).as_node() };
                        let clone = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                            node.hash,
                            node.key.clone(),
                            node.value.load(Ordering::Acquire),
                        ))));

                        let half = match node.hash as usize & n {
                            0 => &mut lo,
                            _ => &mut hi,
                        };
                        match half.1.is_null() {
                            true => half.0 = clone,
                            false => unsafe { (*half.1).as_node() }
                                .next
                                .store(clone, Ordering::Relaxed),
                        }
                        half.1 = clone;

                        e = node.next.load(Ordering::Acquire);
                    }

                    self.publish_split(i, bin, lo.0, hi.0, table, next, guard);
                    drop(lock);
                    return;
                }
                BinEntry::Tree(tree_bin) => {
                    let lock = node::lock(&tree_bin.lock);

                    if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
                        drop(lock);
                        continue;
                    }

                    // Count each half first to decide its representation.
                    let mut lo_count = 0;
                    let mut hi_count = 0;
                    let mut e = tree_bin.first.load(Ordering::Acquire);
                    while !e.is_null() {
                        let node = unsafe { (*e).as_node() };
                        match node.hash as usize & n {
                            0 => lo_count += 1,
                            _ => hi_count += 1,
                        }
                        e = node.next.load(Ordering::Acquire);
                    }

                    let first = tree_bin.first.load(Ordering::Acquire);
                    // Safety: the bin lock is held.
                    let lo = unsafe { self.split_half(first, n, 0, lo_count) };
                    let hi = unsafe { self.split_half(first, n, n, hi_count) };

                    self.publish_split(i, bin, lo, hi, table, next, guard);
                    drop(lock);
                    return;
                }
                BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
            }
        }
    }

    // Builds the bucket for one half of a split tree bin: a chain if
    // small enough, otherwise a new tree bin.
    //
    // Safety: must be called with the bin lock held; the list at `first`
    // must be stable.
    unsafe fn split_half(
        &self,
        first: *mut BinEntry<K, V>,
        n: usize,
        half: usize,
        count: usize,
    ) -> *mut BinEntry<K, V> {
        if count == 0 {
            return ptr::null_mut();
        }

        let treeify = count > UNTREEIFY_THRESHOLD;
        let mut head: *mut BinEntry<K, V> = ptr::null_mut();
        let mut tail: *mut BinEntry<K, V> = ptr::null_mut();

        let mut e = first;
        while !e.is_null() {
            let node = unsafe { (*e).as_node() };
            if node.hash as usize & n == half {
                let clone = match treeify {
                    true => {
                        let clone = Box::into_raw(Box::new(BinEntry::TreeNode(TreeNode::new(
                            node.hash,
                            node.key.clone(),
                            node.value.load(Ordering::Acquire),
                            ptr::null_mut(),
                        ))));
                        unsafe { (*clone).as_tree_node() }
                            .prev
                            .store(tail, Ordering::Relaxed);
                        clone
                    }
                    false => Box::into_raw(Box::new(BinEntry::Node(Node::new(
                        node.hash,
                        node.key.clone(),
                        node.value.load(Ordering::Acquire),
                    )))),
                };

                match tail.is_null() {
                    true => head = clone,
                    false => unsafe { (*tail).as_node() }.next.store(clone, Ordering::Relaxed),
                }
                tail = clone;
            }
            e = node.next.load(Ordering::Acquire);
        }

        if !treeify {
            return head;
        }

        // Safety: the cloned list is private to us.
        let bin = unsafe { TreeBin::new(head) };
        Box::into_raw(Box::new(BinEntry::Tree(bin)))
    }

    // Publishes the two halves of a split bucket into the next table,
    // forwards the old bucket, and retires its entries.
    //
    // The split targets in the next table are unreachable to other
    // writers until the forwarding marker below is published.
    fn publish_split(
        &self,
        i: usize,
        bin: *mut BinEntry<K, V>,
        lo: *mut BinEntry<K, V>,
        hi: *mut BinEntry<K, V>,
        table: Table<BinEntry<K, V>>,
        next: Table<BinEntry<K, V>>,
        guard: &impl Guard,
    ) {
        let n = table.len();

        // Safety: both indices are in-bounds for the doubled table.
        unsafe {
            next.bin(i).store(lo, Ordering::Release);
            next.bin(i + n).store(hi, Ordering::Release);
            table.bin(i).store(
                Box::into_raw(Box::new(BinEntry::Moved(next.raw))),
                Ordering::Release,
            );
        }

        // Retire the old entries; their values moved into the clones.
        let (mut e, tree) = match unsafe { &*bin } {
            BinEntry::Tree(tree_bin) => (tree_bin.first.load(Ordering::Acquire), true),
            _ => (bin, false),
        };
        while !e.is_null() {
            let next_e = unsafe { (*e).as_node() }.next.load(Ordering::Acquire);
            // Safety: the old bucket is forwarded, so its entries are
            // unreachable to new readers; values were moved out.
            unsafe { guard.defer_retire(e, node::reclaim_node) };
            e = next_e;
        }
        if tree {
            // Safety: the bin container is unreachable and owns no value.
            unsafe { guard.defer_retire(bin, node::reclaim_node) };
        }
    }

    // Leaves the resize, committing it if we are the last helper out.
    fn finish_transfer(
        &self,
        table: Table<BinEntry<K, V>>,
        next: Table<BinEntry<K, V>>,
        guard: &impl Guard,
    ) {
        let stamp = resize_stamp(table.len());

        loop {
            let ctl = self.size_ctl.load(Ordering::Acquire);
            let Ctl::Resizing { stamp: s, helpers } = Ctl::unpack(ctl) else {
                return;
            };

            if s != stamp {
                return;
            }

            if helpers > 1 {
                let left = Ctl::Resizing {
                    stamp,
                    helpers: helpers - 1,
                };
                if self
                    .size_ctl
                    .compare_exchange(ctl, left.pack(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            // We are the last helper: every stride was claimed and completed,
            // so every bucket is forwarded. Commit the resize.
            debug_assert!(table.state().transfer_index.load(Ordering::Acquire) <= 0);

            if self
                .table
                .compare_exchange(table.raw, next.raw, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the old table is unlinked from the root; its buckets
                // hold only forwarding markers.
                unsafe { guard.defer_retire(table.raw, reclaim_table::<K, V>) };
            }

            let new_threshold = match next.len() >= MAXIMUM_CAPACITY {
                true => Ctl::DISABLED,
                false => threshold(next.len()),
            };

            if self
                .size_ctl
                .compare_exchange(
                    ctl,
                    Ctl::Threshold(new_threshold).pack(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    // Escalates a bucket to a tree bin, or grows the table if it is
    // still small enough for a resize to shorten the chain instead.
    #[cold]
    fn treeify_bin(&self, table: Table<BinEntry<K, V>>, i: usize, guard: &impl Guard) {
        if table.len() < MIN_TREEIFY_CAPACITY {
            self.force_grow(table, guard);
            return;
        }

        // Safety: `i` is in-bounds and bucket heads are protected by the guard.
        let bin = guard.protect(unsafe { table.bin(i) }, Ordering::Acquire);
        if bin.is_null() {
            return;
        }

        let BinEntry::Node(head) = (unsafe { &*bin }) else {
            // Already treeified, forwarded, or reserved.
            return;
        };

        let lock = node::lock(&head.lock);
        if unsafe { table.bin(i) }.load(Ordering::Acquire) != bin {
            drop(lock);
            return;
        }

        // Clone the chain into a tree node list; values move by pointer.
        let mut first: *mut BinEntry<K, V> = ptr::null_mut();
        let mut tail: *mut BinEntry<K, V> = ptr::null_mut();

        let mut e = bin;
        while !e.is_null() {
            let node = unsafe { (*e).as_node() };
            let tree_node = Box::into_raw(Box::new(BinEntry::TreeNode(TreeNode::new(
                node.hash,
                node.key.clone(),
                node.value.load(Ordering::Acquire),
                ptr::null_mut(),
            ))));

            unsafe { (*tree_node).as_tree_node() }
                .prev
                .store(tail, Ordering::Relaxed);
            match tail.is_null() {
                true => first = tree_node,
                false => unsafe { (*tail).as_node() }
                    .next
                    .store(tree_node, Ordering::Relaxed),
            }
            tail = tree_node;

            e = node.next.load(Ordering::Acquire);
        }

        // Safety: the cloned list is private to us.
        let tree = Box::into_raw(Box::new(BinEntry::Tree(unsafe { TreeBin::new(first) })));
        unsafe { table.bin(i) }.store(tree, Ordering::Release);

        // Retire the old chain; values moved into the tree nodes.
        let mut e = bin;
        while !e.is_null() {
            let next = unsafe { (*e).as_node() }.next.load(Ordering::Acquire);
            // Safety: the chain is unreachable from the bucket.
            unsafe { guard.defer_retire(e, node::reclaim_node) };
            e = next;
        }

        drop(lock);
    }

    // Doubles the table to spread out an overlong chain, initiating a
    // resize if one is not already running.
    fn force_grow(&self, table: Table<BinEntry<K, V>>, guard: &impl Guard) {
        let n = table.len();
        if n >= MAXIMUM_CAPACITY {
            return;
        }

        loop {
            let ctl = self.size_ctl.load(Ordering::Acquire);
            match Ctl::unpack(ctl) {
                Ctl::Threshold(t) => {
                    if t == Ctl::DISABLED || self.root(guard).raw != table.raw {
                        return;
                    }

                    let resizing = Ctl::Resizing {
                        stamp: resize_stamp(n),
                        helpers: 1,
                    };

                    if self
                        .size_ctl
                        .compare_exchange(ctl, resizing.pack(), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        let next = Table::alloc(n << 1);
                        table
                            .state()
                            .transfer_index
                            .store(n as isize, Ordering::Release);
                        table.state().next.store(next.raw, Ordering::Release);

                        self.transfer(table, next, guard);
                        return;
                    }
                }
                Ctl::Resizing { stamp, .. } if stamp == resize_stamp(n) => {
                    // A resize of this table is already underway and will
                    // split the overlong chain.
                    return;
                }
                _ => return,
            }
        }
    }

    // Rebuilds a too-small tree bin as a chain of plain nodes.
    //
    // Safety: must be called with the bin lock held.
    // The clones share value pointers with the tree nodes, so the old
    // list must be retired with `retire_tree_nodes`, and only after the
    // chain is published. Until then the tree stays reachable as the
    // bucket head and readers may still be walking it.
    unsafe fn untreeify(&self, tree_bin: &TreeBin<K, V>) -> *mut BinEntry<K, V> {
        let mut head: *mut BinEntry<K, V> = ptr::null_mut();
        let mut tail: *mut BinEntry<K, V> = ptr::null_mut();

        let mut e = tree_bin.first.load(Ordering::Acquire);
        while !e.is_null() {
            let node = unsafe { (*e).as_node() };
            let clone = Box::into_raw(Box::new(BinEntry::Node(Node::new(
                node.hash,
                node.key.clone(),
                node.value.load(Ordering::Acquire),
            ))));

            match tail.is_null() {
                true => head = clone,
                false => unsafe { (*tail).as_node() }.next.store(clone, Ordering::Relaxed),
            }
            tail = clone;

            e = node.next.load(Ordering::Acquire);
        }

        head
    }

    // Retires the node list of a replaced tree bin. Values moved into
    // the replacement chain, so the nodes are retired without them.
    //
    // Safety: the bucket must no longer point at the tree bin.
    unsafe fn retire_tree_nodes(&self, tree_bin: &TreeBin<K, V>, guard: &impl Guard) {
        let mut e = tree_bin.first.load(Ordering::Acquire);
        while !e.is_null() {
            let next = unsafe { (*e).as_node() }.next.load(Ordering::Acquire);
            // Safety: unreachable to new readers per the caller contract.
            unsafe { guard.defer_retire(e, node::reclaim_node) };
            e = next;
        }
    }
}

// Reclaims a fully transferred table: every bucket holds a forwarding
// marker at this point.
//
// Safety: the table must be unlinked from the root.
unsafe fn reclaim_table<K, V>(raw: *mut RawTable<BinEntry<K, V>>, _collector: &Collector) {
    // Safety: the raw pointer originates from `Table::alloc`.
    let table = unsafe { Table::from_raw(raw) };
    for i in 0..table.len() {
        let bin = unsafe { table.bin(i) }.load(Ordering::Relaxed);
        if !bin.is_null() {
            debug_assert!(matches!(unsafe { &*bin }, BinEntry::Moved(_)));
            let _ = unsafe { Box::from_raw(bin) };
        }
    }
    unsafe { Table::dealloc(table) };
}

impl<K, V, S> HashMap<K, V, S> {
    /// Returns an iterator over the entries of the map.
    pub fn iter<'g, G: Guard>(&self, guard: &'g G) -> Iter<'g, K, V, G> {
        let table = self.root(guard);
        let base_size = table.len();

        Iter {
            guard,
            table,
            stack: Vec::new(),
            base_size,
            base_index: 0,
            index: 0,
            entry: ptr::null_mut(),
        }
    }
}

// Saved traversal position, restored after walking a forwarded bucket's
// split targets in the next table.
struct Frame<K, V> {
    table: Table<BinEntry<K, V>>,
    index: usize,
    length: usize,
}

impl<K, V> Copy for Frame<K, V> {}
impl<K, V> Clone for Frame<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

/// A weakly-consistent iterator over the entries of the map.
///
/// Entries are yielded lazily, bucket by bucket. A forwarded bucket is
/// followed into the next table, visiting exactly its two split
/// targets, so no key is ever yielded twice.
pub struct Iter<'g, K, V, G> {
    guard: &'g G,
    table: Table<BinEntry<K, V>>,
    stack: Vec<Frame<K, V>>,
    base_size: usize,
    base_index: usize,
    index: usize,
    entry: *mut BinEntry<K, V>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Iter<'g, K, V, G>
where
    G: Guard,
{
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.entry.is_null() {
            // Safety: interior entries are protected by the guard.
            let node = unsafe { (*self.entry).as_node() };
            self.entry = self.guard.protect(&node.next, Ordering::Acquire);
        }

        loop {
            if !self.entry.is_null() {
                let node = unsafe { (*self.entry).as_node() };
                let value = self.guard.protect(&node.value, Ordering::Acquire);
                // Safety: values are retired through the guard.
                return Some((&node.key, unsafe { &*value }));
            }

            if self.base_index >= self.base_size
                || self.table.raw.is_null()
                || self.table.len() <= self.index
            {
                return None;
            }

            // Safety: `index` is in-bounds and bucket heads are protected.
            let bin = self
                .guard
                .protect(unsafe { self.table.bin(self.index) }, Ordering::Acquire);

            if !bin.is_null() {
                match unsafe { &*bin } {
                    BinEntry::Moved(next) => {
                        // Descend into the next table, revisiting this index.
                        self.stack.push(Frame {
                            table: self.table,
                            index: self.index,
                            length: self.table.len(),
                        });
                        // Safety: the next table is retired strictly after this one.
                        self.table = unsafe { Table::from_raw(*next) };
                        self.entry = ptr::null_mut();
                        continue;
                    }
                    BinEntry::Node(_) => self.entry = bin,
                    BinEntry::Tree(tree_bin) => {
                        self.entry = self.guard.protect(&tree_bin.first, Ordering::Acquire)
                    }
                    BinEntry::Reserved(_) => self.entry = ptr::null_mut(),
                    BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
                }
            }

            if self.stack.is_empty() {
                self.index += self.base_size;
                if self.index >= self.table.len() {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            } else {
                self.recover();
            }
        }
    }
}

impl<K, V, G> Iter<'_, K, V, G> {
    // Pops traversal frames after finishing a forwarded bucket's
    // split targets.
    fn recover(&mut self) {
        let mut n = self.table.len();

        while let Some(&frame) = self.stack.last() {
            self.index += frame.length;
            if self.index < n {
                return;
            }

            n = frame.length;
            self.index = frame.index;
            self.table = frame.table;
            self.stack.pop();
        }

        self.index += self.base_size;
        if self.index >= n {
            self.base_index += 1;
            self.index = self.base_index;
        }
    }
}

impl<K, V, G> Clone for Iter<'_, K, V, G> {
    fn clone(&self) -> Self {
        Iter {
            guard: self.guard,
            table: self.table,
            stack: self.stack.clone(),
            base_size: self.base_size,
            base_index: self.base_index,
            index: self.index,
            entry: self.entry,
        }
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // Safety: we have unique access to the map.
        unsafe { self.collector.reclaim_all() };

        let mut raw = *self.table.get_mut();
        while !raw.is_null() {
            // Safety: the table chain is private to us now.
            let table = unsafe { Table::from_raw(raw) };
            let next = table.state().next.load(Ordering::Relaxed);
            unsafe { drop_table(table) };
            raw = next;
        }
    }
}

// Frees a table and every entry still reachable from its buckets.
//
// Tables in the forwarding chain own disjoint entries: a forwarded
// bucket holds only a marker, and split clones live in the next table.
//
// Safety: requires unique access to the table.
unsafe fn drop_table<K, V>(table: Table<BinEntry<K, V>>) {
    for i in 0..table.len() {
        let bin = unsafe { table.bin(i) }.load(Ordering::Relaxed);
        if bin.is_null() {
            continue;
        }

        match unsafe { &*bin } {
            BinEntry::Moved(_) | BinEntry::Reserved(_) => {
                let _ = unsafe { Box::from_raw(bin) };
            }
            BinEntry::Node(_) => {
                let mut e = bin;
                while !e.is_null() {
                    let node = unsafe { (*e).as_node() };
                    let next = node.next.load(Ordering::Relaxed);
                    let value = node.value.load(Ordering::Relaxed);
                    let _ = unsafe { Box::from_raw(value) };
                    let _ = unsafe { Box::from_raw(e) };
                    e = next;
                }
            }
            BinEntry::Tree(tree_bin) => {
                let mut e = tree_bin.first.load(Ordering::Relaxed);
                while !e.is_null() {
                    let node = unsafe { (*e).as_node() };
                    let next = node.next.load(Ordering::Relaxed);
                    let value = node.value.load(Ordering::Relaxed);
                    let _ = unsafe { Box::from_raw(value) };
                    let _ = unsafe { Box::from_raw(e) };
                    e = next;
                }
                let _ = unsafe { Box::from_raw(bin) };
            }
            BinEntry::TreeNode(_) => unreachable!("tree node at bucket head"),
        }
    }

    unsafe { Table::dealloc(table) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_roundtrip() {
        for ctl in [
            Ctl::Threshold(0),
            Ctl::Threshold(12),
            Ctl::Threshold(Ctl::DISABLED),
            Ctl::Initializing,
            Ctl::Resizing {
                stamp: resize_stamp(16),
                helpers: 1,
            },
            Ctl::Resizing {
                stamp: resize_stamp(1 << 29),
                helpers: MAX_HELPERS,
            },
        ] {
            assert_eq!(Ctl::unpack(ctl.pack()), ctl);
        }
    }

    #[test]
    fn resizing_is_distinct() {
        // No `Resizing` encoding collides with the other states.
        for n in [16, 32, 1 << 20] {
            let raw = Ctl::Resizing {
                stamp: resize_stamp(n),
                helpers: 1,
            }
            .pack();
            assert!(raw < -1);
        }
    }

    #[test]
    fn stamps_differ_per_generation() {
        assert_ne!(resize_stamp(16), resize_stamp(32));
        assert_ne!(resize_stamp(32), resize_stamp(64));
    }

    #[test]
    fn thresholds() {
        assert_eq!(threshold(16), 12);
        assert_eq!(threshold(64), 48);
    }
}
