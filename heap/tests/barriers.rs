mod common;

use common::{create_test_env, next_rand, rc_of, settings};
use heap::{DeleteStrategy, HeapSettings, InitialCount, NonHeapPolicy, rc};
use object::{Header, Value};

#[test]
fn count_matches_installed_slots() {
    let (heap, mut proxy, mut roots) = create_test_env(settings());
    let holders: Vec<Value> =
        (0..4).map(|_| proxy.allocate_tuple(8, &mut roots)).collect();
    let targets: Vec<Value> =
        (0..6).map(|_| proxy.allocate_tuple(1, &mut roots)).collect();

    let mut seed = 1;
    for _ in 0..2_000 {
        let holder = holders[next_rand(&mut seed, holders.len())];
        let index = next_rand(&mut seed, 8);
        let value = match next_rand(&mut seed, 4) {
            0 => Value::NIL,
            1 => Value::from_i64(next_rand(&mut seed, 100) as i64),
            _ => targets[next_rand(&mut seed, targets.len())],
        };
        proxy.write_field(holder, index, value);
    }

    for &target in &targets {
        let installed = holders
            .iter()
            .flat_map(|&holder| (0..8).map(move |i| (holder, i)))
            .filter(|&(holder, i)| proxy.read_field(holder, i) == target)
            .count();
        assert_eq!(rc_of(target) as usize, installed);
    }
    assert!(heap.verify_counts().is_empty());
}

#[test]
fn self_store_keeps_the_count() {
    let (_heap, mut proxy, mut roots) = create_test_env(settings());
    let holder = proxy.allocate_tuple(1, &mut roots);
    let target = proxy.allocate_tuple(0, &mut roots);
    proxy.write_field(holder, 0, target);
    let buffered = proxy.buffered_zero_counts();

    for _ in 0..10 {
        proxy.write_field(holder, 0, target);
        assert_eq!(rc_of(target), 1);
    }
    // never touched zero on the way
    assert_eq!(proxy.buffered_zero_counts(), buffered);
}

#[test]
fn nulling_the_last_slot_buffers_the_object() {
    let (_heap, mut proxy, mut roots) = create_test_env(settings());
    let holder = proxy.allocate_tuple(1, &mut roots);
    let target = proxy.allocate_tuple(0, &mut roots);
    proxy.write_field(holder, 0, target);
    let buffered = proxy.buffered_zero_counts();

    proxy.write_field(holder, 0, Value::NIL);
    assert_eq!(rc_of(target), 0);
    assert_eq!(proxy.buffered_zero_counts(), buffered + 1);
}

#[test]
#[should_panic(expected = "reference count overflow")]
fn overflow_is_fatal() {
    let (_heap, mut proxy, mut roots) = create_test_env(settings());
    let holder = proxy.allocate_tuple(1, &mut roots);
    let target = proxy.allocate_tuple(0, &mut roots);
    // SAFETY: target is allocated
    let header = unsafe { target.as_ref::<Header>() };
    header
        .rc_word()
        .store(
            rc::RC_LIMIT << rc::COLOR_BITS,
            std::sync::atomic::Ordering::Relaxed,
        );

    proxy.write_field(holder, 0, target);
}

#[test]
fn compare_and_swap_counts_only_on_success() {
    let (heap, mut proxy, mut roots) = create_test_env(settings());
    let holder = proxy.allocate_tuple(1, &mut roots);
    let a = proxy.allocate_tuple(0, &mut roots);
    let b = proxy.allocate_tuple(0, &mut roots);

    assert!(proxy.compare_and_swap_field(holder, 0, Value::NIL, a));
    assert_eq!(rc_of(a), 1);

    let buffered = proxy.buffered_zero_counts();
    assert!(!proxy.compare_and_swap_field(holder, 0, Value::NIL, b));
    assert_eq!(rc_of(b), 0);
    assert_eq!(proxy.read_field(holder, 0), a);
    // the undone increment hands b back to the table
    assert_eq!(proxy.buffered_zero_counts(), buffered + 1);

    assert!(proxy.compare_and_swap_field(holder, 0, a, b));
    assert_eq!(rc_of(a), 0);
    assert_eq!(rc_of(b), 1);
    assert!(heap.verify_counts().is_empty());
}

#[test]
fn overlapping_copies_behave_like_memmove() {
    let (heap, mut proxy, mut roots) = create_test_env(settings());
    let tuple = proxy.allocate_tuple(5, &mut roots);
    let items: Vec<Value> =
        (0..4).map(|_| proxy.allocate_tuple(0, &mut roots)).collect();
    for (i, &item) in items.iter().enumerate() {
        proxy.write_field(tuple, i, item);
    }

    proxy.copy_fields(tuple, 0, tuple, 1, 4);
    let fields: Vec<Value> =
        (0..5).map(|i| proxy.read_field(tuple, i)).collect();
    assert_eq!(fields, vec![items[0], items[0], items[1], items[2], items[3]]);
    assert_eq!(rc_of(items[0]), 2);
    assert_eq!(rc_of(items[3]), 1);

    proxy.copy_fields(tuple, 1, tuple, 0, 4);
    let fields: Vec<Value> =
        (0..5).map(|i| proxy.read_field(tuple, i)).collect();
    assert_eq!(fields, vec![items[0], items[1], items[2], items[3], items[3]]);
    assert_eq!(rc_of(items[0]), 1);
    assert_eq!(rc_of(items[3]), 2);
    assert!(heap.verify_counts().is_empty());
}

#[test]
fn copies_between_tuples() {
    let (heap, mut proxy, mut roots) = create_test_env(settings());
    let src = proxy.allocate_tuple(3, &mut roots);
    let dst = proxy.allocate_tuple(3, &mut roots);
    let item = proxy.allocate_tuple(0, &mut roots);
    proxy.write_field(src, 0, item);
    proxy.write_field(src, 2, Value::from_i64(9));

    proxy.copy_fields(src, 0, dst, 0, 3);
    assert_eq!(rc_of(item), 2);
    assert_eq!(proxy.read_field(dst, 2), Value::from_i64(9));
    assert!(heap.verify_counts().is_empty());
}

#[test]
fn non_heap_stores_follow_the_policy() {
    let (_heap, mut proxy, mut roots) = create_test_env(settings());
    let target = proxy.allocate_tuple(0, &mut roots);
    let mut global = Value::NIL;
    // SAFETY: global is a valid aligned slot, target allocated
    unsafe { proxy.write_barrier_non_heap(&mut global, target) };
    assert_eq!(global, target);
    assert_eq!(rc_of(target), 0);

    let counted = HeapSettings {
        non_heap_policy: NonHeapPolicy::Counted,
        ..settings()
    };
    let (_heap, mut proxy, mut roots) = create_test_env(counted);
    let target = proxy.allocate_tuple(0, &mut roots);
    let mut global = Value::NIL;
    unsafe { proxy.write_barrier_non_heap(&mut global, target) };
    assert_eq!(rc_of(target), 1);
    unsafe { proxy.write_barrier_non_heap(&mut global, Value::NIL) };
    assert_eq!(rc_of(target), 0);
}

#[test]
fn eager_deletion_frees_on_the_spot() {
    let eager = HeapSettings {
        delete_strategy: DeleteStrategy::Eager,
        ..settings()
    };
    let (heap, mut proxy, mut roots) = create_test_env(eager);
    let holder = proxy.allocate_tuple(1, &mut roots);
    let child = proxy.allocate_tuple(1, &mut roots);
    let grandchild = proxy.allocate_tuple(0, &mut roots);
    proxy.write_field(holder, 0, child);
    proxy.write_field(child, 0, grandchild);

    proxy.write_field(holder, 0, Value::NIL);
    assert!(!heap.is_allocated(child));
    assert!(!heap.is_allocated(grandchild));
    assert_eq!(heap.stats().eager_freed, 2);

    // the stale allocation entries are skipped by the next cycle
    roots.roots.push(holder);
    proxy.collect(&mut roots);
    assert!(heap.is_allocated(holder));
}

#[test]
fn released_objects_start_counted() {
    let one = HeapSettings {
        initial_count: InitialCount::One,
        ..settings()
    };
    let (heap, mut proxy, mut roots) = create_test_env(one);
    let holder = proxy.allocate_tuple(1, &mut roots);
    let child = proxy.allocate_tuple(0, &mut roots);
    proxy.write_field(holder, 0, child);
    assert_eq!(rc_of(child), 2);
    proxy.release(child);
    assert_eq!(rc_of(child), 1);

    // the holder's allocation reference is still outstanding
    let mismatches = heap.verify_counts();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].object, holder.as_ptr() as usize);
    assert_eq!((mismatches[0].expected, mismatches[0].actual), (0, 1));
}
