use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::Mutex;

use equivalent::Equivalent;

use super::node::{BinEntry, TreeNode};
use super::utils::Backoff;

// A bucket that holds its entries in a red-black tree, ordered by
// `(hash, key)`, with the entries additionally threaded through a
// `next`/`prev` list in insertion order.
//
// Structural mutation happens under the bin lock. Rotations and
// rebalances that move the root or rewrite links additionally take
// the write latch; readers either acquire reader units on the latch
// for a tree search, or fall back to walking the linear list while
// a writer holds it, so lookups never block.
pub struct TreeBin<K, V> {
    pub root: AtomicPtr<BinEntry<K, V>>,
    pub first: AtomicPtr<BinEntry<K, V>>,
    // The bucket lock.
    pub lock: Mutex<()>,
    // The root latch: a writer bit, a waiter bit, and reader units.
    lock_state: AtomicIsize,
}

// A writer holds the latch.
const WRITER: isize = 1;
// A writer is waiting for readers to drain.
const WAITER: isize = 2;
// A single reader unit.
const READER: isize = 4;

// Shorthand for the tree node behind a bin entry pointer.
//
// Safety: the pointer must reference a live `BinEntry::TreeNode`.
#[inline]
unsafe fn tree_node<'a, K, V>(entry: *mut BinEntry<K, V>) -> &'a TreeNode<K, V> {
    unsafe { (*entry).as_tree_node() }
}

#[inline]
unsafe fn left<K, V>(p: *mut BinEntry<K, V>) -> *mut BinEntry<K, V> {
    unsafe { tree_node(p).left.load(Ordering::Acquire) }
}

#[inline]
unsafe fn right<K, V>(p: *mut BinEntry<K, V>) -> *mut BinEntry<K, V> {
    unsafe { tree_node(p).right.load(Ordering::Acquire) }
}

#[inline]
unsafe fn parent<K, V>(p: *mut BinEntry<K, V>) -> *mut BinEntry<K, V> {
    unsafe { tree_node(p).parent.load(Ordering::Acquire) }
}

// Returns whether the node is red. Null nodes are black.
#[inline]
unsafe fn is_red<K, V>(p: *mut BinEntry<K, V>) -> bool {
    !p.is_null() && unsafe { tree_node(p).red.load(Ordering::Acquire) }
}

#[inline]
unsafe fn set_red<K, V>(p: *mut BinEntry<K, V>, red: bool) {
    unsafe { tree_node(p).red.store(red, Ordering::Release) }
}

impl<K, V> TreeBin<K, V> {
    // Builds a tree bin from a `next`/`prev`-linked list of tree nodes.
    //
    // Safety: every entry in the list must be a live `BinEntry::TreeNode`
    // not shared with any other bin.
    pub unsafe fn new(first: *mut BinEntry<K, V>) -> TreeBin<K, V>
    where
        K: Ord,
    {
        let mut root: *mut BinEntry<K, V> = ptr::null_mut();

        let mut x = first;
        while !x.is_null() {
            let node = unsafe { tree_node(x) };
            let next = node.node.next.load(Ordering::Relaxed);
            node.left.store(ptr::null_mut(), Ordering::Relaxed);
            node.right.store(ptr::null_mut(), Ordering::Relaxed);

            if root.is_null() {
                node.parent.store(ptr::null_mut(), Ordering::Relaxed);
                node.red.store(false, Ordering::Relaxed);
                root = x;
                x = next;
                continue;
            }

            let hash = node.node.hash;
            let mut p = root;
            loop {
                let p_node = unsafe { tree_node(p) };
                let dir = match hash.cmp(&p_node.node.hash) {
                    std::cmp::Ordering::Equal => node.node.key.cmp(&p_node.node.key),
                    hash_order => hash_order,
                };

                let xp = p;
                p = match dir {
                    std::cmp::Ordering::Less | std::cmp::Ordering::Equal => unsafe { left(p) },
                    std::cmp::Ordering::Greater => unsafe { right(p) },
                };

                if p.is_null() {
                    node.parent.store(xp, Ordering::Relaxed);
                    let xp_node = unsafe { tree_node(xp) };
                    match dir {
                        std::cmp::Ordering::Less | std::cmp::Ordering::Equal => {
                            xp_node.left.store(x, Ordering::Relaxed)
                        }
                        std::cmp::Ordering::Greater => xp_node.right.store(x, Ordering::Relaxed),
                    }
                    root = unsafe { balance_insertion(root, x) };
                    break;
                }
            }

            x = next;
        }

        debug_assert!(root.is_null() || unsafe { check_invariants(root) });

        TreeBin {
            root: AtomicPtr::new(root),
            first: AtomicPtr::new(first),
            lock: Mutex::new(()),
            lock_state: AtomicIsize::new(0),
        }
    }

    // Acquires the write latch on the root.
    fn lock_root(&self) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.contended_lock();
        }
    }

    // Spins until all readers drain.
    #[cold]
    fn contended_lock(&self) {
        let mut backoff = Backoff::new();

        loop {
            let state = self.lock_state.load(Ordering::Relaxed);

            if state & !WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & WAITER == 0 {
                let _ = self.lock_state.compare_exchange(
                    state,
                    state | WAITER,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            } else {
                backoff.spin();
            }
        }
    }

    // Releases the write latch.
    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::Release);
    }

    // Finds the entry for `key`, without blocking on the latch.
    pub fn find<Q>(&self, hash: u64, key: &Q, guard: &impl seize::Guard) -> *mut BinEntry<K, V>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let mut element = guard.protect(&self.first, Ordering::Acquire);

        while !element.is_null() {
            let state = self.lock_state.load(Ordering::Acquire);

            if state & (WRITER | WAITER) != 0 {
                // A writer holds or awaits the latch: walk the list instead.
                // Safety: interior entries are protected by the guard.
                let node = unsafe { (*element).as_node() };
                if node.hash == hash && key.equivalent(&node.key) {
                    return element;
                }

                element = guard.protect(&node.next, Ordering::Acquire);
            } else if self
                .lock_state
                .compare_exchange(state, state + READER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Search the tree while holding a reader unit.
                let root = guard.protect(&self.root, Ordering::Acquire);
                let result = if root.is_null() {
                    ptr::null_mut()
                } else {
                    // Safety: retired tree nodes are unreclaimable while the
                    // guard is held, and the latch keeps the structure stable.
                    unsafe { find_tree_node(root, hash, key) }
                };

                self.lock_state.fetch_sub(READER, Ordering::Release);
                return result;
            }
        }

        ptr::null_mut()
    }

    // Finds or adds a node for `key`.
    //
    // Returns the existing matching entry, or null if a new node was
    // inserted.
    //
    // Safety: must be called with the bin lock held.
    pub unsafe fn put_tree_node(&self, hash: u64, key: K, value: *mut V) -> *mut BinEntry<K, V>
    where
        K: Ord,
    {
        let mut p = self.root.load(Ordering::Acquire);

        if p.is_null() {
            let entry = Box::into_raw(Box::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                value,
                ptr::null_mut(),
            ))));

            unsafe { tree_node(entry).red.store(false, Ordering::Relaxed) };
            self.root.store(entry, Ordering::Release);
            self.first.store(entry, Ordering::Release);
            return ptr::null_mut();
        }

        loop {
            let p_node = unsafe { tree_node(p) };
            let dir = match hash.cmp(&p_node.node.hash) {
                std::cmp::Ordering::Equal => match key.cmp(&p_node.node.key) {
                    // `Ord` is total, so an equal ordering is a key match.
                    std::cmp::Ordering::Equal => return p,
                    key_order => key_order,
                },
                hash_order => hash_order,
            };

            let xp = p;
            p = match dir {
                std::cmp::Ordering::Less => unsafe { left(p) },
                _ => unsafe { right(p) },
            };

            if p.is_null() {
                let first = self.first.load(Ordering::Acquire);
                let entry = Box::into_raw(Box::new(BinEntry::TreeNode(TreeNode::new(
                    hash, key, value, first,
                ))));

                let node = unsafe { tree_node(entry) };
                self.first.store(entry, Ordering::Release);
                if !first.is_null() {
                    unsafe { tree_node(first).prev.store(entry, Ordering::Release) };
                }

                node.parent.store(xp, Ordering::Release);
                let xp_node = unsafe { tree_node(xp) };
                match dir {
                    std::cmp::Ordering::Less => xp_node.left.store(entry, Ordering::Release),
                    _ => xp_node.right.store(entry, Ordering::Release),
                }

                if !xp_node.red.load(Ordering::Acquire) {
                    // The parent is black, no rebalance is needed.
                    node.red.store(true, Ordering::Release);
                } else {
                    self.lock_root();
                    let root = self.root.load(Ordering::Acquire);
                    self.root
                        .store(unsafe { balance_insertion(root, entry) }, Ordering::Release);
                    self.unlock_root();
                }

                debug_assert!(unsafe { check_invariants(self.root.load(Ordering::Relaxed)) });
                return ptr::null_mut();
            }
        }
    }

    // Unlinks the given entry from the list and the tree.
    //
    // Returns true if the bin is now too small and should be
    // converted back to a chain by the caller.
    //
    // Safety: must be called with the bin lock held, with `p` a live
    // `BinEntry::TreeNode` belonging to this bin.
    pub unsafe fn remove_tree_node(&self, p: *mut BinEntry<K, V>) -> bool {
        let p_node = unsafe { tree_node(p) };
        let next = p_node.node.next.load(Ordering::Acquire);
        let pred = p_node.prev.load(Ordering::Acquire);

        // Unlink from the traversal list.
        if pred.is_null() {
            self.first.store(next, Ordering::Release);
        } else {
            unsafe { tree_node(pred).node.next.store(next, Ordering::Release) };
        }
        if !next.is_null() {
            unsafe { tree_node(next).prev.store(pred, Ordering::Release) };
        }

        if self.first.load(Ordering::Acquire).is_null() {
            self.root.store(ptr::null_mut(), Ordering::Release);
            return true;
        }

        // The tree is too small to be worth maintaining.
        let mut r = self.root.load(Ordering::Acquire);
        if r.is_null() || unsafe { right(r) }.is_null() {
            return true;
        }
        let rl = unsafe { left(r) };
        if rl.is_null() || unsafe { left(rl) }.is_null() {
            return true;
        }

        self.lock_root();

        let pl = unsafe { left(p) };
        let pr = unsafe { right(p) };

        let replacement;
        if !pl.is_null() && !pr.is_null() {
            // Two children: splice in the in-order successor.
            let mut s = pr;
            loop {
                let sl = unsafe { left(s) };
                if sl.is_null() {
                    break;
                }
                s = sl;
            }

            // Swap the colors and positions of `s` and `p`.
            let color = unsafe { is_red(s) };
            unsafe { set_red(s, is_red(p)) };
            unsafe { set_red(p, color) };

            let sr = unsafe { right(s) };
            let pp = unsafe { parent(p) };

            if s == pr {
                unsafe {
                    tree_node(p).parent.store(s, Ordering::Release);
                    tree_node(s).right.store(p, Ordering::Release);
                }
            } else {
                let sp = unsafe { parent(s) };
                unsafe { tree_node(p).parent.store(sp, Ordering::Release) };
                if !sp.is_null() {
                    let sp_node = unsafe { tree_node(sp) };
                    if s == sp_node.left.load(Ordering::Acquire) {
                        sp_node.left.store(p, Ordering::Release);
                    } else {
                        sp_node.right.store(p, Ordering::Release);
                    }
                }
                unsafe { tree_node(s).right.store(pr, Ordering::Release) };
                if !pr.is_null() {
                    unsafe { tree_node(pr).parent.store(s, Ordering::Release) };
                }
            }

            unsafe {
                tree_node(p).left.store(ptr::null_mut(), Ordering::Release);
                tree_node(p).right.store(sr, Ordering::Release);
            }
            if !sr.is_null() {
                unsafe { tree_node(sr).parent.store(p, Ordering::Release) };
            }
            unsafe { tree_node(s).left.store(pl, Ordering::Release) };
            if !pl.is_null() {
                unsafe { tree_node(pl).parent.store(s, Ordering::Release) };
            }
            unsafe { tree_node(s).parent.store(pp, Ordering::Release) };
            if pp.is_null() {
                r = s;
            } else {
                let pp_node = unsafe { tree_node(pp) };
                if p == pp_node.left.load(Ordering::Acquire) {
                    pp_node.left.store(s, Ordering::Release);
                } else {
                    pp_node.right.store(s, Ordering::Release);
                }
            }

            replacement = if sr.is_null() { p } else { sr };
        } else if !pl.is_null() {
            replacement = pl;
        } else if !pr.is_null() {
            replacement = pr;
        } else {
            replacement = p;
        }

        if replacement != p {
            let pp = unsafe { parent(p) };
            unsafe { tree_node(replacement).parent.store(pp, Ordering::Release) };
            if pp.is_null() {
                r = replacement;
            } else {
                let pp_node = unsafe { tree_node(pp) };
                if p == pp_node.left.load(Ordering::Acquire) {
                    pp_node.left.store(replacement, Ordering::Release);
                } else {
                    pp_node.right.store(replacement, Ordering::Release);
                }
            }
            unsafe {
                let p_node = tree_node(p);
                p_node.left.store(ptr::null_mut(), Ordering::Release);
                p_node.right.store(ptr::null_mut(), Ordering::Release);
                p_node.parent.store(ptr::null_mut(), Ordering::Release);
            }
        }

        let root = if unsafe { is_red(p) } {
            r
        } else {
            unsafe { balance_deletion(r, replacement) }
        };
        self.root.store(root, Ordering::Release);

        if p == replacement {
            // Detach the removed leaf.
            let pp = unsafe { parent(p) };
            if !pp.is_null() {
                let pp_node = unsafe { tree_node(pp) };
                if p == pp_node.left.load(Ordering::Acquire) {
                    pp_node.left.store(ptr::null_mut(), Ordering::Release);
                } else if p == pp_node.right.load(Ordering::Acquire) {
                    pp_node.right.store(ptr::null_mut(), Ordering::Release);
                }
                unsafe { tree_node(p).parent.store(ptr::null_mut(), Ordering::Release) };
            }
        }

        self.unlock_root();

        debug_assert!(unsafe { check_invariants(self.root.load(Ordering::Relaxed)) });
        false
    }
}

// Searches the subtree rooted at `p` for `key`.
//
// Navigation is by hash; on a full hash tie with no match, both
// subtrees are searched.
//
// Safety: the structure must be stable (reader latch or bin lock held)
// and all entries live.
pub(crate) unsafe fn find_tree_node<K, V, Q>(
    mut p: *mut BinEntry<K, V>,
    hash: u64,
    key: &Q,
) -> *mut BinEntry<K, V>
where
    Q: Equivalent<K> + ?Sized,
{
    while !p.is_null() {
        let node = unsafe { tree_node(p) };
        let p_hash = node.node.hash;

        if hash < p_hash {
            p = unsafe { left(p) };
        } else if hash > p_hash {
            p = unsafe { right(p) };
        } else if key.equivalent(&node.node.key) {
            return p;
        } else {
            // Hash tie: check the right subtree, then continue left.
            let pr = unsafe { right(p) };
            if !pr.is_null() {
                let q = unsafe { find_tree_node(pr, hash, key) };
                if !q.is_null() {
                    return q;
                }
            }
            p = unsafe { left(p) };
        }
    }

    ptr::null_mut()
}

unsafe fn rotate_left<K, V>(
    mut root: *mut BinEntry<K, V>,
    p: *mut BinEntry<K, V>,
) -> *mut BinEntry<K, V> {
    if p.is_null() {
        return root;
    }

    let r = unsafe { right(p) };
    if r.is_null() {
        return root;
    }

    unsafe {
        let rl = left(r);
        tree_node(p).right.store(rl, Ordering::Release);
        if !rl.is_null() {
            tree_node(rl).parent.store(p, Ordering::Release);
        }

        let pp = parent(p);
        tree_node(r).parent.store(pp, Ordering::Release);
        if pp.is_null() {
            root = r;
            set_red(r, false);
        } else {
            let pp_node = tree_node(pp);
            if pp_node.left.load(Ordering::Acquire) == p {
                pp_node.left.store(r, Ordering::Release);
            } else {
                pp_node.right.store(r, Ordering::Release);
            }
        }

        tree_node(r).left.store(p, Ordering::Release);
        tree_node(p).parent.store(r, Ordering::Release);
    }

    root
}

unsafe fn rotate_right<K, V>(
    mut root: *mut BinEntry<K, V>,
    p: *mut BinEntry<K, V>,
) -> *mut BinEntry<K, V> {
    if p.is_null() {
        return root;
    }

    let l = unsafe { left(p) };
    if l.is_null() {
        return root;
    }

    unsafe {
        let lr = right(l);
        tree_node(p).left.store(lr, Ordering::Release);
        if !lr.is_null() {
            tree_node(lr).parent.store(p, Ordering::Release);
        }

        let pp = parent(p);
        tree_node(l).parent.store(pp, Ordering::Release);
        if pp.is_null() {
            root = l;
            set_red(l, false);
        } else {
            let pp_node = tree_node(pp);
            if pp_node.right.load(Ordering::Acquire) == p {
                pp_node.right.store(l, Ordering::Release);
            } else {
                pp_node.left.store(l, Ordering::Release);
            }
        }

        tree_node(l).right.store(p, Ordering::Release);
        tree_node(p).parent.store(l, Ordering::Release);
    }

    root
}

unsafe fn balance_insertion<K, V>(
    mut root: *mut BinEntry<K, V>,
    mut x: *mut BinEntry<K, V>,
) -> *mut BinEntry<K, V> {
    unsafe { set_red(x, true) };

    loop {
        let mut xp = unsafe { parent(x) };
        if xp.is_null() {
            unsafe { set_red(x, false) };
            return x;
        }

        let mut xpp = unsafe { parent(xp) };
        if !unsafe { is_red(xp) } || xpp.is_null() {
            return root;
        }

        let xppl = unsafe { left(xpp) };
        if xp == xppl {
            let xppr = unsafe { right(xpp) };
            if unsafe { is_red(xppr) } {
                unsafe {
                    set_red(xppr, false);
                    set_red(xp, false);
                    set_red(xpp, true);
                }
                x = xpp;
            } else {
                if x == unsafe { right(xp) } {
                    x = xp;
                    root = unsafe { rotate_left(root, x) };
                    xp = unsafe { parent(x) };
                    xpp = if xp.is_null() { ptr::null_mut() } else { unsafe { parent(xp) } };
                }
                if !xp.is_null() {
                    unsafe { set_red(xp, false) };
                    if !xpp.is_null() {
                        unsafe { set_red(xpp, true) };
                        root = unsafe { rotate_right(root, xpp) };
                    }
                }
            }
        } else if !xppl.is_null() && unsafe { is_red(xppl) } {
            unsafe {
                set_red(xppl, false);
                set_red(xp, false);
                set_red(xpp, true);
            }
            x = xpp;
        } else {
            if x == unsafe { left(xp) } {
                x = xp;
                root = unsafe { rotate_right(root, x) };
                xp = unsafe { parent(x) };
                xpp = if xp.is_null() { ptr::null_mut() } else { unsafe { parent(xp) } };
            }
            if !xp.is_null() {
                unsafe { set_red(xp, false) };
                if !xpp.is_null() {
                    unsafe { set_red(xpp, true) };
                    root = unsafe { rotate_left(root, xpp) };
                }
            }
        }
    }
}

unsafe fn balance_deletion<K, V>(
    mut root: *mut BinEntry<K, V>,
    mut x: *mut BinEntry<K, V>,
) -> *mut BinEntry<K, V> {
    loop {
        if x.is_null() || x == root {
            return root;
        }

        let mut xp = unsafe { parent(x) };
        if xp.is_null() {
            unsafe { set_red(x, false) };
            return x;
        }

        if unsafe { is_red(x) } {
            unsafe { set_red(x, false) };
            return root;
        }

        let xpl = unsafe { left(xp) };
        if xpl == x {
            let mut xpr = unsafe { right(xp) };
            if unsafe { is_red(xpr) } {
                unsafe {
                    set_red(xpr, false);
                    set_red(xp, true);
                }
                root = unsafe { rotate_left(root, xp) };
                xp = unsafe { parent(x) };
                xpr = if xp.is_null() { ptr::null_mut() } else { unsafe { right(xp) } };
            }

            if xpr.is_null() {
                x = xp;
                continue;
            }

            let sl = unsafe { left(xpr) };
            let sr = unsafe { right(xpr) };
            if !unsafe { is_red(sr) } && !unsafe { is_red(sl) } {
                unsafe { set_red(xpr, true) };
                x = xp;
                continue;
            }

            if !unsafe { is_red(sr) } {
                if !sl.is_null() {
                    unsafe { set_red(sl, false) };
                }
                unsafe { set_red(xpr, true) };
                root = unsafe { rotate_right(root, xpr) };
                xp = unsafe { parent(x) };
                xpr = if xp.is_null() { ptr::null_mut() } else { unsafe { right(xp) } };
            }

            if !xpr.is_null() {
                unsafe { set_red(xpr, if xp.is_null() { false } else { is_red(xp) }) };
                let sr = unsafe { right(xpr) };
                if !sr.is_null() {
                    unsafe { set_red(sr, false) };
                }
            }
            if !xp.is_null() {
                unsafe { set_red(xp, false) };
                root = unsafe { rotate_left(root, xp) };
            }
            x = root;
        } else {
            // Symmetric.
            if !xpl.is_null() && unsafe { is_red(xpl) } {
                unsafe {
                    set_red(xpl, false);
                    set_red(xp, true);
                }
                root = unsafe { rotate_right(root, xp) };
                xp = unsafe { parent(x) };
            }

            let mut xpl = if xp.is_null() { ptr::null_mut() } else { unsafe { left(xp) } };
            if xpl.is_null() {
                x = xp;
                continue;
            }

            let sl = unsafe { left(xpl) };
            let sr = unsafe { right(xpl) };
            if !unsafe { is_red(sl) } && !unsafe { is_red(sr) } {
                unsafe { set_red(xpl, true) };
                x = xp;
                continue;
            }

            if !unsafe { is_red(sl) } {
                if !sr.is_null() {
                    unsafe { set_red(sr, false) };
                }
                unsafe { set_red(xpl, true) };
                root = unsafe { rotate_left(root, xpl) };
                xp = unsafe { parent(x) };
                xpl = if xp.is_null() { ptr::null_mut() } else { unsafe { left(xp) } };
            }

            if !xpl.is_null() {
                unsafe { set_red(xpl, if xp.is_null() { false } else { is_red(xp) }) };
                let sl = unsafe { left(xpl) };
                if !sl.is_null() {
                    unsafe { set_red(sl, false) };
                }
            }
            if !xp.is_null() {
                unsafe { set_red(xp, false) };
                root = unsafe { rotate_right(root, xp) };
            }
            x = root;
        }
    }
}

// Validates the red-black and list invariants of the subtree at `t`.
//
// Safety: the structure must be stable and all entries live.
#[allow(dead_code)]
pub unsafe fn check_invariants<K, V>(t: *mut BinEntry<K, V>) -> bool {
    if t.is_null() {
        return true;
    }

    unsafe {
        let node = tree_node(t);
        let tp = parent(t);
        let tl = left(t);
        let tr = right(t);
        let tb = node.prev.load(Ordering::Relaxed);
        let tn = node.node.next.load(Ordering::Relaxed);

        if !tb.is_null() && tree_node(tb).node.next.load(Ordering::Relaxed) != t {
            return false;
        }
        if !tn.is_null() && tree_node(tn).prev.load(Ordering::Relaxed) != t {
            return false;
        }
        if !tp.is_null() && t != left(tp) && t != right(tp) {
            return false;
        }
        if !tl.is_null() && (parent(tl) != t || tree_node(tl).node.hash > node.node.hash) {
            return false;
        }
        if !tr.is_null() && (parent(tr) != t || tree_node(tr).node.hash < node.node.hash) {
            return false;
        }
        if is_red(t) && is_red(tl) && is_red(tr) {
            return false;
        }

        check_invariants(tl) && check_invariants(tr)
    }
}
