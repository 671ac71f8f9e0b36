#![allow(dead_code)]

use heap::{Heap, HeapProxy, HeapSettings, RootProvider, rc};
use object::{Value, scan_object};

pub const BLOCK: usize = 4096;

#[derive(Debug, Default)]
pub struct TestRoots {
    pub roots: Vec<Value>,
}

impl RootProvider for TestRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for root in &mut self.roots {
            visitor(root);
        }
    }
}

/// Settings that never trigger a collection on their own.
pub fn settings() -> HeapSettings {
    HeapSettings {
        counted_size: 256 * BLOCK,
        traced_size: 64 * BLOCK,
        block_size: BLOCK,
        refill_batch: 16,
        bytes_before_gc: usize::MAX / 2,
        zct_buffer_limit: usize::MAX / 2,
        ..Default::default()
    }
}

pub fn create_test_env(settings: HeapSettings) -> (Heap, HeapProxy, TestRoots) {
    let _ = env_logger::builder().is_test(true).try_init();
    let heap = Heap::new(settings, scan_object);
    let proxy = heap.proxy();
    (heap, proxy, TestRoots::default())
}

pub fn rc_of(value: Value) -> u32 {
    // SAFETY: tests only ask for allocated objects
    unsafe { rc::get_rc(value.as_ptr()) }
}

/// Deterministic LCG step, returns a number below `bound`.
pub fn next_rand(seed: &mut u64, bound: usize) -> usize {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    ((*seed >> 32) % bound as u64) as usize
}
