use std::alloc::Layout;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, AtomicPtr};
use std::{alloc, mem, ptr};

// A bucket array laid out in a single allocation.
#[repr(transparent)]
pub struct RawTable<T>(u8, PhantomData<T>);

// Resize coordination state, embedded in the table allocation.
pub struct State<T> {
    // The next table being resized into, if any.
    pub next: AtomicPtr<RawTable<T>>,
    // The shared transfer cursor. Bucket strides are claimed by
    // decrementing this, starting at the table length.
    pub transfer_index: AtomicIsize,
}

impl<T> Default for State<T> {
    fn default() -> State<T> {
        State {
            next: AtomicPtr::new(ptr::null_mut()),
            transfer_index: AtomicIsize::new(0),
        }
    }
}

// The layout of the table allocation.
#[repr(C)]
struct TableLayout<T> {
    mask: usize,
    state: State<T>,
    bins: [AtomicPtr<T>; 0],
}

// Manages a table allocation.
#[repr(C)]
pub struct Table<T> {
    // Mask for the table length.
    pub mask: usize,
    // The raw table pointer.
    pub raw: *mut RawTable<T>,
}

impl<T> Copy for Table<T> {}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Table<T> {
    // Allocate a table with the provided length.
    pub fn alloc(len: usize) -> Table<T> {
        assert!(len.is_power_of_two());

        let mask = len - 1;

        unsafe {
            let layout = Self::layout(len);

            // Allocate the table, zeroing the bins.
            let ptr = alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }

            // Write the table header.
            ptr.cast::<TableLayout<T>>().write(TableLayout {
                mask,
                state: State::default(),
                bins: [],
            });

            Table {
                mask,
                raw: ptr.cast::<RawTable<T>>(),
            }
        }
    }

    // Creates a `Table` from a raw pointer.
    //
    // Safety: the pointer must be null, or have been returned from `Table::alloc`
    // and not yet deallocated.
    #[inline]
    pub unsafe fn from_raw(raw: *mut RawTable<T>) -> Table<T> {
        if raw.is_null() {
            return Table { raw, mask: 0 };
        }

        let layout = unsafe { &*raw.cast::<TableLayout<T>>() };

        Table {
            raw,
            mask: layout.mask,
        }
    }

    // Returns the bin at the given index.
    #[inline]
    pub unsafe fn bin(&self, i: usize) -> &AtomicPtr<T> {
        debug_assert!(i <= self.mask);

        let offset = mem::size_of::<TableLayout<T>>() + i * mem::size_of::<AtomicPtr<T>>();
        &*self.raw.cast::<u8>().add(offset).cast::<AtomicPtr<T>>()
    }

    /// Returns the length of the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.mask + 1
    }

    // Returns a reference to the table state.
    #[inline]
    pub fn state(&self) -> &State<T> {
        unsafe { &(*self.raw.cast::<TableLayout<T>>()).state }
    }

    // Deallocate the table.
    //
    // Safety: the table must not be accessed again, and any entries
    // in its bins must have already been freed.
    pub unsafe fn dealloc(table: Table<T>) {
        let layout = Self::layout(table.len());
        ptr::drop_in_place(table.raw.cast::<TableLayout<T>>());
        unsafe { alloc::dealloc(table.raw.cast::<u8>(), layout) }
    }

    // The table layout used for allocation.
    fn layout(len: usize) -> Layout {
        let size = mem::size_of::<TableLayout<T>>() + len * mem::size_of::<AtomicPtr<T>>();
        Layout::from_size_align(size, mem::align_of::<TableLayout<T>>()).unwrap()
    }
}

#[test]
fn layout() {
    unsafe {
        let table: Table<u8> = Table::alloc(4);
        let table: Table<u8> = Table::from_raw(table.raw);
        assert_eq!(table.mask, 3);
        assert_eq!(table.len(), 4);

        for i in 0..4 {
            assert!(table.bin(i).load(std::sync::atomic::Ordering::Relaxed).is_null());
        }

        Table::dealloc(table);
    }
}
