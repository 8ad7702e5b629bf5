use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

use seize::Collector;

use super::alloc::RawTable;
use super::tree::TreeBin;

// A bucket entry.
//
// The variant of the bucket head determines how the entire bucket
// is interpreted. Interior links only ever point at `Node` or
// `TreeNode` entries.
pub enum BinEntry<K, V> {
    // The head of a chain of nodes.
    Node(Node<K, V>),
    // A red-black tree bin.
    Tree(TreeBin<K, V>),
    // An interior tree node, never a bucket head.
    TreeNode(TreeNode<K, V>),
    // The bucket was transferred to the next table.
    Moved(*mut RawTable<BinEntry<K, V>>),
    // The bucket is claimed by an in-flight `compute`.
    Reserved(Reservation),
}

// An entry in a chain.
pub struct Node<K, V> {
    // The spread hash of the key.
    pub hash: u64,
    pub key: K,
    // The value, replaced in place so concurrent readers
    // always see a fully initialized allocation.
    pub value: AtomicPtr<V>,
    // The next entry in the chain or traversal list.
    pub next: AtomicPtr<BinEntry<K, V>>,
    // The bucket lock, used only while this entry is a bucket head.
    pub lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub fn new(hash: u64, key: K, value: *mut V) -> Node<K, V> {
        Node {
            hash,
            key,
            value: AtomicPtr::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
            lock: Mutex::new(()),
        }
    }

    pub fn with_next(hash: u64, key: K, value: *mut V, next: *mut BinEntry<K, V>) -> Node<K, V> {
        Node {
            hash,
            key,
            value: AtomicPtr::new(value),
            next: AtomicPtr::new(next),
            lock: Mutex::new(()),
        }
    }
}

// A node in a red-black tree bin.
//
// Tree nodes are threaded through the same `next` links as chain
// nodes, forming the in-order traversal list that readers fall back
// to while the tree is being rebalanced.
pub struct TreeNode<K, V> {
    pub node: Node<K, V>,
    pub parent: AtomicPtr<BinEntry<K, V>>,
    pub left: AtomicPtr<BinEntry<K, V>>,
    pub right: AtomicPtr<BinEntry<K, V>>,
    // The previous entry in the traversal list, for unlinking.
    pub prev: AtomicPtr<BinEntry<K, V>>,
    pub red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub fn new(hash: u64, key: K, value: *mut V, next: *mut BinEntry<K, V>) -> TreeNode<K, V> {
        TreeNode {
            node: Node::with_next(hash, key, value, next),
            parent: AtomicPtr::new(ptr::null_mut()),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            red: AtomicBool::new(true),
        }
    }
}

// A placeholder installed in an empty bucket while a `compute`
// callback runs. Writers meeting a reservation block on its lock
// and retry; readers treat the key as absent.
pub struct Reservation {
    pub lock: Mutex<()>,
    // The reserving thread, for best-effort detection of
    // recursive updates that would otherwise deadlock.
    pub owner: ThreadId,
}

impl Reservation {
    pub fn new() -> Reservation {
        Reservation {
            lock: Mutex::new(()),
            owner: std::thread::current().id(),
        }
    }
}

impl<K, V> BinEntry<K, V> {
    // Returns the inner node of a `Node` or `TreeNode` entry.
    #[inline]
    pub fn as_node(&self) -> &Node<K, V> {
        match self {
            BinEntry::Node(node) => node,
            BinEntry::TreeNode(tree_node) => &tree_node.node,
            _ => unreachable!("bin entry is not a node"),
        }
    }

    // Returns the inner `TreeNode` of this entry.
    #[inline]
    pub fn as_tree_node(&self) -> &TreeNode<K, V> {
        match self {
            BinEntry::TreeNode(tree_node) => tree_node,
            _ => unreachable!("bin entry is not a tree node"),
        }
    }
}

// Locks a mutex, recovering from poisoning.
//
// A user callback can unwind while a bucket lock is held, but all
// structural mutation happens only after the callback returns, so
// the bucket is always left consistent.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Reclaims a bin entry along with the value it owns.
//
// Safety: the entry must be unreachable and must still own its value.
pub unsafe fn reclaim_entry<K, V>(ptr: *mut BinEntry<K, V>, _collector: &Collector) {
    let entry = unsafe { Box::from_raw(ptr) };

    let value = match &*entry {
        BinEntry::Node(node) => node.value.load(Ordering::Relaxed),
        BinEntry::TreeNode(tree_node) => tree_node.node.value.load(Ordering::Relaxed),
        _ => unreachable!("reclaimed bin entry does not own a value"),
    };

    // Safety: guaranteed by the caller to be the sole owner of the value.
    let _ = unsafe { Box::from_raw(value) };
}

// Reclaims a bin entry alone, leaving the value allocation to
// whichever entry it was moved into.
//
// Safety: the entry must be unreachable.
pub unsafe fn reclaim_node<K, V>(ptr: *mut BinEntry<K, V>, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(ptr) };
}

// Reclaims a replaced value.
//
// Safety: the value must be unreachable.
pub unsafe fn reclaim_value<V>(ptr: *mut V, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(ptr) };
}
