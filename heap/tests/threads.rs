mod common;

use std::{
    sync::{Arc, Barrier},
    thread,
};

use common::{TestRoots, create_test_env, next_rand, rc_of, settings};
use heap::{HeapSettings, NonHeapPolicy};
use object::Value;

const THREADS: usize = 8;

#[test]
fn concurrent_link_unlink_keeps_counts_exact() {
    let (heap, mut proxy, mut roots) = create_test_env(settings());
    let shared = proxy.allocate_tuple(32, &mut roots);
    let targets: Vec<Value> =
        (0..16).map(|_| proxy.allocate_tuple(0, &mut roots)).collect();
    roots.roots.push(shared);
    roots.roots.extend(&targets);

    let start_barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            let targets = targets.clone();
            let barrier = start_barrier.clone();
            thread::spawn(move || {
                let mut proxy = heap.proxy();
                let mut roots = TestRoots::default();
                let local = proxy.allocate_tuple(8, &mut roots);
                roots.roots.push(local);

                barrier.wait();

                let mut seed = t as u64 + 1;
                for _ in 0..5_000 {
                    let value = if next_rand(&mut seed, 3) == 0 {
                        Value::NIL
                    } else {
                        targets[next_rand(&mut seed, targets.len())]
                    };
                    let (holder, slots) = if next_rand(&mut seed, 2) == 0 {
                        (shared, 32)
                    } else {
                        (local, 8)
                    };
                    let slot = next_rand(&mut seed, slots);
                    proxy.write_field(holder, slot, value);
                }
                // hand the local holder's slots over to the shared count check
                (0..8).map(|i| proxy.read_field(local, i)).collect::<Vec<_>>()
            })
        })
        .collect();

    let mut local_slots = Vec::new();
    for handle in handles {
        local_slots.extend(handle.join().expect("mutator panicked"));
    }

    for &target in &targets {
        let in_shared = (0..32)
            .filter(|&i| proxy.read_field(shared, i) == target)
            .count();
        let in_locals = local_slots.iter().filter(|&&v| v == target).count();
        assert_eq!(rc_of(target) as usize, in_shared + in_locals);
    }
    assert!(heap.verify_counts().is_empty());
}

#[test]
fn mutators_rendezvous_for_collection() {
    let settings = HeapSettings {
        bytes_before_gc: 64 * 1024,
        non_heap_policy: NonHeapPolicy::Counted,
        ..settings()
    };
    let (heap, proxy, _roots) = create_test_env(settings);
    drop(proxy);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = heap.clone();
            thread::spawn(move || {
                let mut proxy = heap.proxy();
                let mut roots = TestRoots::default();
                let keep = proxy.allocate_tuple(1, &mut roots);
                // a counted global outlives this thread's roots
                let mut global = Box::new(Value::NIL);
                // SAFETY: the box is a valid aligned slot, keep is allocated
                unsafe { proxy.write_barrier_non_heap(&mut *global, keep) };
                roots.roots.push(keep);

                for i in 0..20_000 {
                    let obj = proxy.allocate_tuple(2, &mut roots);
                    if i % 1_000 == 0 {
                        proxy.write_field(keep, 0, obj);
                    }
                }
                proxy.collect(&mut roots);
                let held = proxy.read_field(keep, 0);
                (global, held)
            })
        })
        .collect();

    let mut survivors = Vec::new();
    for handle in handles {
        survivors.push(handle.join().expect("mutator panicked"));
    }

    let stats = heap.stats();
    assert!(stats.cycles > 0);
    assert!(stats.total.freed_cells > 0);
    for (global, held) in &survivors {
        assert!(heap.is_allocated(**global));
        assert!(heap.is_allocated(*held));
        assert_eq!(rc_of(**global), 1);
        assert_eq!(rc_of(*held), 1);
    }

    // only the globals' references are invisible to the heap scan
    let mut mismatched: Vec<usize> =
        heap.verify_counts().iter().map(|m| m.object).collect();
    let mut globals: Vec<usize> = survivors
        .iter()
        .map(|(global, _)| global.as_ptr() as usize)
        .collect();
    mismatched.sort_unstable();
    globals.sort_unstable();
    assert_eq!(mismatched, globals);
}
