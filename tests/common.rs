#![allow(dead_code)]

use canopy::HashMap;

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>)) {
    // A lazily allocated table.
    test(&HashMap::new);

    // A tiny table, so early inserts go through the resize path.
    test(&(|| HashMap::with_capacity(1)));

    // A table past the treeify minimum, so colliding bins escalate
    // instead of forcing growth.
    test(&(|| HashMap::with_capacity(64)));
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}
