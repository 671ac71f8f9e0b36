//! Workloads that drive the heap from the command line and the benches.

use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

use heap::{
    BridgePolicy, CollectionStats, CountMismatch, Heap, HeapProxy,
    HeapSettings, InitialCount, RootProvider, SettingsError, SpaceUsage,
};
use log::{debug, info};
use object::{Value, scan_object};
use parking_lot::Mutex;

/// Root set of one mutator: plain values the host holds on its "stack".
#[derive(Debug, Default)]
pub struct Roots {
    pub values: Vec<Value>,
}

impl RootProvider for Roots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.values {
            visitor(value);
        }
    }
}

pub fn create_heap(settings: HeapSettings) -> Result<Heap, SettingsError> {
    Heap::try_new(settings, scan_object)
}

fn count_of(value: Value) -> u32 {
    // SAFETY: only called on objects the workload keeps allocated
    unsafe { heap::rc::get_rc(value.as_ptr()) }
}

/// Gives up the allocation reference once `obj` is stored somewhere.
fn settle(proxy: &mut HeapProxy, obj: Value) {
    if proxy.heap.settings.initial_count == InitialCount::One {
        proxy.release(obj);
    }
}

// ── Scenario ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Count of `A` after each step.
    pub steps: Vec<(&'static str, u32)>,
    pub a_freed: bool,
    pub child_freed: bool,
    pub stats: CollectionStats,
}

/// Object `A` is stored into two slots of a rooted `R`, both slots are
/// cleared again and a cycle runs with no root referencing `A`.
pub fn run_scenario(
    settings: HeapSettings,
) -> Result<ScenarioReport, SettingsError> {
    let heap = create_heap(settings)?;
    let mut proxy = heap.proxy();
    let mut roots = Roots::default();
    let mut steps = Vec::new();

    let r = proxy.allocate_tuple(2, &mut roots);
    roots.values.push(r);
    let a = proxy.allocate_tuple(1, &mut roots);
    let child = proxy.allocate_bytes(b"child of A", &mut roots);
    proxy.write_field(a, 0, child);
    settle(&mut proxy, child);
    steps.push(("allocate A", count_of(a)));

    proxy.write_field(r, 0, a);
    settle(&mut proxy, a);
    steps.push(("store A into S1", count_of(a)));
    proxy.write_field(r, 1, a);
    steps.push(("store A into S2", count_of(a)));
    proxy.write_field(r, 0, Value::NIL);
    steps.push(("clear S1", count_of(a)));

    proxy.write_field(r, 1, Value::NIL);
    if heap.is_allocated(a) {
        steps.push(("clear S2", count_of(a)));
    } else {
        debug!("A at {:p} freed by the barrier", a.as_ptr());
    }

    proxy.collect(&mut roots);

    Ok(ScenarioReport {
        steps,
        a_freed: !heap.is_allocated(a),
        child_freed: !heap.is_allocated(child),
        stats: heap.stats(),
    })
}

// ── Stress ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StressConfig {
    pub threads: usize,
    pub iterations: usize,
    /// Slots of each mutator's rooted holder tuple.
    pub slots: usize,
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 100_000,
            slots: 64,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StressReport {
    pub elapsed: Duration,
    pub allocations: usize,
    pub stats: CollectionStats,
    /// Counted space after the final unrooted cycle.
    pub counted: SpaceUsage,
    pub traced: Option<SpaceUsage>,
    /// Mismatches found before the final cycle.
    pub mismatches: Vec<CountMismatch>,
}

/// Mutators randomly allocate, link and unlink objects below a rooted
/// holder. A final cycle without roots reclaims everything they built.
pub fn run_stress(
    settings: HeapSettings,
    config: StressConfig,
) -> Result<StressReport, SettingsError> {
    let heap = create_heap(settings)?;
    let start_barrier = Arc::new(Barrier::new(config.threads));
    let allocations = Arc::new(Mutex::new(0usize));
    let started = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let heap = heap.clone();
            let barrier = start_barrier.clone();
            let allocations = allocations.clone();
            thread::spawn(move || {
                let mut proxy = heap.proxy();
                barrier.wait();
                let seed = config.seed.wrapping_add(t as u64);
                let count = mutate(&mut proxy, config, seed);
                *allocations.lock() += count;
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            panic!("stress mutator panicked");
        }
    }
    let elapsed = started.elapsed();

    let mismatches = heap.verify_counts();
    let mut proxy = heap.proxy();
    // each cycle may only uncover the next counted/traced layer
    loop {
        proxy.collect(&mut Roots::default());
        let last = heap.stats().last;
        if last.freed_cells == 0
            && last.traced_swept == 0
            && last.carried == 0
        {
            break;
        }
    }
    drop(proxy);

    let report = StressReport {
        elapsed,
        allocations: *allocations.lock(),
        stats: heap.stats(),
        counted: heap.counted_usage(),
        traced: heap.traced_usage(),
        mismatches,
    };
    info!(
        "stress: {} allocations in {:?}, {} cycles",
        report.allocations, report.elapsed, report.stats.cycles
    );
    Ok(report)
}

/// Objects only ever point at objects older than themselves: a fresh
/// object takes its fields from the holder before it is stored there.
/// The graph stays acyclic, which reference counting relies on.
fn mutate(proxy: &mut HeapProxy, config: StressConfig, mut seed: u64) -> usize {
    let mut next_rand = |bound: usize| -> usize {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((seed >> 32) % bound as u64) as usize
    };

    // traced objects held only by counted ones need the remembered set
    let traced = proxy.heap.traced.is_some()
        && proxy.heap.settings.bridge_policy == BridgePolicy::Remembered;
    let mut roots = Roots::default();
    let holder = proxy.allocate_tuple(config.slots, &mut roots);
    roots.values.push(holder);
    let mut allocations = 1;

    for _ in 0..config.iterations {
        let slot = next_rand(config.slots);
        match next_rand(10) {
            0..=5 => {
                let len = 1 + next_rand(4);
                let obj = if traced && next_rand(4) == 0 {
                    proxy.allocate_traced_tuple(len, &mut roots)
                } else {
                    proxy.allocate_tuple(len, &mut roots)
                };
                allocations += 1;
                for field in 0..len {
                    let from = next_rand(config.slots);
                    let older = proxy.read_field(holder, from);
                    proxy.write_field(obj, field, older);
                }
                proxy.write_field(holder, slot, obj);
                if proxy.heap.is_counted(obj) {
                    settle(proxy, obj);
                }
            }
            6..=8 => proxy.write_field(holder, slot, Value::NIL),
            _ => proxy.write_field(holder, slot, Value::from_i64(slot as i64)),
        }
    }

    settle(proxy, holder);
    allocations
}

// ── Chain ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChainReport {
    pub length: usize,
    pub freed_cells: usize,
    pub elapsed: Duration,
}

/// Builds a singly linked chain of `length` tuples below a rooted anchor,
/// cuts it at the head and times the cascade.
pub fn run_chain(
    settings: HeapSettings,
    length: usize,
) -> Result<ChainReport, SettingsError> {
    let heap = create_heap(settings)?;
    let mut proxy = heap.proxy();
    let mut roots = Roots::default();

    let anchor = proxy.allocate_tuple(1, &mut roots);
    roots.values.push(anchor);
    settle(&mut proxy, anchor);

    let mut tail = anchor;
    for _ in 0..length {
        let next = proxy.allocate_tuple(1, &mut roots);
        proxy.write_field(tail, 0, next);
        settle(&mut proxy, next);
        tail = next;
    }
    proxy.collect(&mut roots);

    let started = Instant::now();
    proxy.write_field(anchor, 0, Value::NIL);
    proxy.collect(&mut roots);
    let elapsed = started.elapsed();

    Ok(ChainReport {
        length,
        freed_cells: heap.stats().last.freed_cells + heap.stats().eager_freed,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use heap::DeleteStrategy;

    use super::*;

    fn small() -> HeapSettings {
        HeapSettings {
            counted_size: 8 * 1024 * 1024,
            traced_size: 2 * 1024 * 1024,
            block_size: 4096,
            bytes_before_gc: 256 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn scenario_frees_a_and_its_child() {
        let report = run_scenario(small()).expect("valid settings");
        let counts: Vec<u32> =
            report.steps.iter().map(|&(_, count)| count).collect();
        assert_eq!(counts, vec![0, 1, 2, 1, 0]);
        assert!(report.a_freed);
        assert!(report.child_freed);
    }

    #[test]
    fn scenario_under_eager_and_counted_allocation() {
        let settings = HeapSettings {
            initial_count: InitialCount::One,
            delete_strategy: DeleteStrategy::Eager,
            ..small()
        };
        let report = run_scenario(settings).expect("valid settings");
        let counts: Vec<u32> =
            report.steps.iter().map(|&(_, count)| count).collect();
        assert_eq!(counts, vec![1, 1, 2, 1]);
        assert!(report.a_freed);
        assert!(report.child_freed);
        assert_eq!(report.stats.eager_freed, 2);
    }

    #[test]
    fn stress_leaves_an_empty_heap() {
        let config = StressConfig {
            threads: 3,
            iterations: 5_000,
            slots: 16,
            seed: 7,
        };
        let report = run_stress(small(), config).expect("valid settings");
        assert!(report.mismatches.is_empty());
        assert_eq!(report.counted.cells, 0);
        assert_eq!(report.traced.map(|usage| usage.cells), Some(0));
    }

    #[test]
    fn stress_with_counted_allocation_and_eager_frees() {
        let settings = HeapSettings {
            initial_count: InitialCount::One,
            delete_strategy: DeleteStrategy::Eager,
            traced_size: 0,
            ..small()
        };
        let config = StressConfig {
            threads: 1,
            iterations: 5_000,
            slots: 16,
            seed: 3,
        };
        let report = run_stress(settings, config).expect("valid settings");
        assert!(report.mismatches.is_empty());
        assert_eq!(report.counted.cells, 0);
        assert!(report.stats.eager_freed > 0);
        assert!(report.traced.is_none());
    }

    #[test]
    fn chain_cascade_frees_every_link() {
        let report = run_chain(small(), 10_000).expect("valid settings");
        assert_eq!(report.freed_cells, 10_000);
    }

    #[test]
    fn invalid_settings_surface() {
        let settings = HeapSettings {
            block_size: 100,
            ..small()
        };
        assert!(matches!(
            run_chain(settings, 1),
            Err(SettingsError::BlockAlignment)
        ));
    }
}
