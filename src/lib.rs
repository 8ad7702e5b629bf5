//! A concurrent hash table with lock-free reads and per-bucket locked
//! writes.
//!
//! The table is an array of buckets, each holding a short chain of
//! entries that escalates to a red-black tree under heavy hash
//! collisions. Reads never block. Writes lock only the bucket they
//! touch, and the table grows incrementally: every writer that notices
//! a resize in progress transfers a stride of buckets before
//! continuing.
//!
//! # Guards
//!
//! Because reads are lock-free, removed entries cannot be freed until
//! all threads that might hold a reference to them are done. Most map
//! operations therefore take a [`Guard`], acquired with
//! [`HashMap::guard`], which pins the current thread and keeps any
//! entry it can reach alive:
//!
//! ```
//! use canopy::HashMap;
//!
//! let map = HashMap::new();
//! let guard = map.guard();
//! map.insert('a', 1, &guard);
//! assert_eq!(map.get(&'a', &guard), Some(&1));
//! ```
//!
//! References returned by map operations are tied to the guard they
//! were loaded with. Dropping the guard unpins the thread, so guards
//! should not be held across long-running or blocking code. The
//! [`HashMap::pin`] API manages a guard for you:
//!
//! ```
//! use canopy::HashMap;
//!
//! let map = HashMap::new();
//! map.pin().insert('a', 1);
//! assert_eq!(map.pin().get(&'a'), Some(&1));
//! ```
//!
//! # Consistency
//!
//! Individual operations are atomic and [`iter`](HashMap::iter) is
//! weakly consistent: it never yields a key twice, but concurrent
//! updates may or may not be observed. [`len`](HashMap::len) is an
//! approximation under concurrent updates and exact when the map is
//! quiescent.

mod map;
mod raw;

#[cfg(feature = "serde")]
mod serde_impls;

pub use map::{
    Compute, HashMap, HashMapRef, Iter, Keys, OccupiedError, Operation, Values,
};

pub use equivalent::Equivalent;
pub use seize::{Guard, LocalGuard, OwnedGuard};
