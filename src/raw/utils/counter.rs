use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::OnceLock;

use super::CachePadded;

// A scalable atomic counter.
//
// Sharding the length counter of `HashMap` is extremely important,
// as a single point of contention for insertions/deletions significantly
// degrades concurrent performance.
//
// Uncontended updates go directly to a base cell. The first failed
// update installs an array of padded cells indexed by the guard's
// thread ID, growing under further contention up to the number of CPUs.
pub struct Counter {
    base: CachePadded<AtomicIsize>,
    cells: AtomicPtr<Cells>,
}

// A generation of counter cells.
//
// Superseded generations stay linked through `prev` instead of having
// their values copied forward, so an update through a stale pointer
// is still visible to `sum`.
struct Cells {
    prev: *mut Cells,
    slots: Box<[CachePadded<AtomicIsize>]>,
}

// The maximum number of cells, rounded up to a power-of-two for fast modulo.
//
// available_parallelism is quite slow (microseconds), so the value is cached.
fn max_cells() -> usize {
    static CPUS: OnceLock<usize> = OnceLock::new();
    *CPUS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .next_power_of_two()
    })
}

impl Default for Counter {
    fn default() -> Counter {
        Counter {
            base: CachePadded::from(AtomicIsize::new(0)),
            cells: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Counter {
    // Add to the counter.
    //
    // Guard thread IDs are essentially perfectly sharded due to the
    // internal thread ID allocator, which makes cell contention very
    // unlikely once the cell array covers the active threads.
    #[inline]
    pub fn add(&self, delta: isize, guard: &impl seize::Guard) {
        let base = self.base.value.load(Ordering::Relaxed);

        if self.cells.load(Ordering::Relaxed).is_null()
            && self
                .base
                .value
                .compare_exchange(base, base + delta, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }

        self.add_slow(delta, guard.thread_id());
    }

    #[cold]
    #[inline(never)]
    fn add_slow(&self, delta: isize, thread: usize) {
        loop {
            let cells = self.cells.load(Ordering::Acquire);

            // Install the first generation of cells.
            if cells.is_null() {
                self.try_grow(cells);
                continue;
            }

            // Safety: `Cells` are only deallocated with unique access to the counter.
            let slots = unsafe { &(*cells).slots };
            let slot = &slots[thread & (slots.len() - 1)].value;

            let value = slot.load(Ordering::Relaxed);
            if slot
                .compare_exchange(value, value + delta, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            // The cell is contended, try to grow the array. Either way the
            // unconditional add below cannot be lost, as this cell is summed
            // through the generation chain even once superseded.
            if slots.len() < max_cells() {
                self.try_grow(cells);
            }

            slot.fetch_add(delta, Ordering::Relaxed);
            return;
        }
    }

    // Install a new cell array, doubling the current one.
    fn try_grow(&self, current: *mut Cells) {
        let len = match current.is_null() {
            true => max_cells().min(2),
            // Safety: `Cells` are only deallocated with unique access to the counter.
            false => (unsafe { &(*current).slots }.len() * 2).min(max_cells()),
        };

        let cells = Box::into_raw(Box::new(Cells {
            prev: current,
            slots: (0..len).map(|_| Default::default()).collect(),
        }));

        if self
            .cells
            .compare_exchange(current, cells, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race, another thread grew the array.
            let _ = unsafe { Box::from_raw(cells) };
        }
    }

    // Returns the sum of the base cell and every cell of every generation.
    #[inline]
    pub fn sum(&self) -> usize {
        let mut sum = self.base.value.load(Ordering::Relaxed);

        let mut cells = self.cells.load(Ordering::Acquire);
        while !cells.is_null() {
            // Safety: `Cells` are only deallocated with unique access to the counter.
            let cells_ref = unsafe { &*cells };
            sum += cells_ref
                .slots
                .iter()
                .map(|x| x.value.load(Ordering::Relaxed))
                .sum::<isize>();

            cells = cells_ref.prev;
        }

        // Depending on the order of deletion/insertions this might be negative,
        // in which case we assume the map is empty.
        sum.try_into().unwrap_or(0)
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        let mut cells = *self.cells.get_mut();
        while !cells.is_null() {
            // Safety: we have unique access to the counter.
            let boxed = unsafe { Box::from_raw(cells) };
            cells = boxed.prev;
        }
    }
}

unsafe impl Send for Counter {}
unsafe impl Sync for Counter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_sum() {
        let collector = seize::Collector::new();
        let guard = collector.enter();

        let counter = Counter::default();
        for _ in 0..100 {
            counter.add(1, &guard);
        }
        for _ in 0..40 {
            counter.add(-1, &guard);
        }

        assert_eq!(counter.sum(), 60);
    }

    #[test]
    fn negative_sum_is_empty() {
        let collector = seize::Collector::new();
        let guard = collector.enter();

        let counter = Counter::default();
        counter.add(-1, &guard);
        assert_eq!(counter.sum(), 0);
    }
}
