// Collector tests: cycles, finalizers, weak tables, accounting
use std::cell::Cell;
use std::rc::Rc;

use crate::mem::Allocator;
use crate::test::{new_vm, rooted_table};
use crate::*;

fn set_field(vm: &mut VelaVM, t: VelaValue, name: &str, v: VelaValue) {
    let k = vm.new_string(name).unwrap();
    vm.table_set(t, k, v).unwrap();
}

fn get_field(vm: &mut VelaVM, t: VelaValue, name: &str) -> VelaValue {
    let k = vm.new_string(name).unwrap();
    vm.table_get(t, k).unwrap()
}

#[test]
fn test_unreachable_cycle_is_collected() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let baseline = vm.pool.tables.len();

    let t1 = rooted_table(&mut vm);
    let t2 = rooted_table(&mut vm);
    set_field(&mut vm, t1, "other", t2);
    set_field(&mut vm, t2, "other", t1);
    assert_eq!(vm.pool.tables.len(), baseline + 2);

    // drop both roots; the pure cycle must not keep itself alive
    vm.pop(main);
    vm.pop(main);
    vm.gc_collect();
    assert_eq!(vm.pool.tables.len(), baseline);
}

#[test]
fn test_reachable_objects_survive_incremental_cycles() {
    let mut vm = new_vm();
    let t = rooted_table(&mut vm);
    // lots of allocation so collection steps interleave with writes;
    // the back barrier must keep every stored child alive
    for i in 0..2000 {
        let child = vm.new_table().unwrap();
        vm.table_set_int(t, i, child).unwrap();
        if i % 3 == 0 {
            let _garbage = vm.new_table().unwrap();
        }
    }
    vm.gc_collect();
    for i in 0..2000 {
        let child = vm.table_get_int(t, i).unwrap();
        let tid = child.as_table_id().expect("child must still be a table");
        assert!(vm.pool.tables.get(tid.0).is_some(), "child {} was freed", i);
    }
}

fn finalizer_bump(vm: &mut VelaVM, _th: ThreadId) -> VelaResult<usize> {
    let g = vm.globals()?;
    let prev = get_field(vm, g, "fin_count").as_integer().unwrap_or(0);
    set_field(vm, g, "fin_count", VelaValue::integer(prev + 1));
    Ok(0)
}

#[test]
fn test_finalizer_runs_exactly_once_then_cycle_freed() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let baseline = vm.pool.tables.len();

    let mt = rooted_table(&mut vm);
    set_field(&mut vm, mt, "__gc", VelaValue::light_fn(finalizer_bump));

    let t1 = rooted_table(&mut vm);
    let t2 = rooted_table(&mut vm);
    set_field(&mut vm, t1, "other", t2);
    set_field(&mut vm, t2, "other", t1);
    vm.set_metatable(t1, Some(mt)).unwrap();

    vm.pop(main); // t2
    vm.pop(main); // t1
    vm.gc_collect();
    let g = vm.globals().unwrap();
    assert_eq!(get_field(&mut vm, g, "fin_count").as_integer(), Some(1));
    // resurrected for the finalizer: freed only by the next cycle
    vm.gc_collect();
    assert_eq!(get_field(&mut vm, g, "fin_count").as_integer(), Some(1));
    assert_eq!(vm.pool.tables.len(), baseline + 1); // only mt remains
}

fn finalizer_order(vm: &mut VelaVM, th: ThreadId) -> VelaResult<usize> {
    let obj = vm.stack_get(th, -1);
    let name = get_field(vm, obj, "name");
    let name = vm.get_str(name).unwrap_or("?").to_string();
    let g = vm.globals()?;
    let prev = get_field(vm, g, "order");
    let mut s = vm.get_str(prev).unwrap_or("").to_string();
    s.push_str(&name);
    let sv = vm.new_string(&s)?;
    set_field(vm, g, "order", sv);
    Ok(0)
}

#[test]
fn test_finalizers_run_in_reverse_attachment_order() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let mt = rooted_table(&mut vm);
    set_field(&mut vm, mt, "__gc", VelaValue::light_fn(finalizer_order));

    let a = rooted_table(&mut vm);
    let name_a = vm.new_string("a").unwrap();
    set_field(&mut vm, a, "name", name_a);
    vm.set_metatable(a, Some(mt)).unwrap();
    let b = rooted_table(&mut vm);
    let name_b = vm.new_string("b").unwrap();
    set_field(&mut vm, b, "name", name_b);
    vm.set_metatable(b, Some(mt)).unwrap();

    vm.pop(main); // b
    vm.pop(main); // a
    vm.gc_collect();
    let g = vm.globals().unwrap();
    let order = get_field(&mut vm, g, "order");
    assert_eq!(vm.get_str(order), Some("ba"));
}

#[test]
fn test_value_weak_table() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let mt = rooted_table(&mut vm);
    let mode = vm.new_string("v").unwrap();
    set_field(&mut vm, mt, "__mode", mode);

    let w = rooted_table(&mut vm);
    vm.set_metatable(w, Some(mt)).unwrap();

    let strong = rooted_table(&mut vm); // stays reachable
    let weak1 = vm.new_table().unwrap();
    vm.push(main, weak1).unwrap();
    vm.table_set_int(w, 1, weak1).unwrap(); // array part
    let k = vm.new_string("entry").unwrap();
    vm.table_set(w, k, weak1).unwrap(); // hash part
    let k2 = vm.new_string("strong-entry").unwrap();
    vm.table_set(w, k2, strong).unwrap();

    vm.pop(main); // weak1 loses its root
    vm.gc_collect();

    assert!(vm.table_get_int(w, 1).unwrap().is_nil());
    assert!(get_field(&mut vm, w, "entry").is_nil());
    // reachable values stay
    assert!(get_field(&mut vm, w, "strong-entry").is_table());
}

#[test]
fn test_ephemeron_table() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let baseline = vm.pool.tables.len();

    let mt = rooted_table(&mut vm);
    let mode = vm.new_string("k").unwrap();
    set_field(&mut vm, mt, "__mode", mode);
    let w = rooted_table(&mut vm);
    vm.set_metatable(w, Some(mt)).unwrap();

    let k1 = rooted_table(&mut vm);
    let v1 = vm.new_table().unwrap();
    vm.push(main, v1).unwrap();
    vm.table_set(w, k1, v1).unwrap();
    vm.table_set(w, v1, k1).unwrap();
    vm.pop(main); // v1 kept alive only through k1

    vm.gc_collect();
    // k1 is rooted, so both entries survive
    assert!(vm.table_get(w, k1).unwrap().is_table());
    assert_eq!(vm.pool.tables.len(), baseline + 4);

    vm.pop(main); // drop k1: the k1 -> v1 -> k1 chain dies together
    vm.gc_collect();
    assert!(vm.table_next(w, VelaValue::nil()).unwrap().is_none());
    assert_eq!(vm.pool.tables.len(), baseline + 2); // mt and w remain
}

#[test]
fn test_all_weak_table() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let mt = rooted_table(&mut vm);
    let mode = vm.new_string("kv").unwrap();
    set_field(&mut vm, mt, "__mode", mode);
    let w = rooted_table(&mut vm);
    vm.set_metatable(w, Some(mt)).unwrap();

    let k = vm.new_table().unwrap();
    vm.push(main, k).unwrap();
    let v = vm.new_table().unwrap();
    vm.push(main, v).unwrap();
    vm.table_set(w, k, v).unwrap();

    vm.gc_collect();
    assert!(vm.table_get(w, k).unwrap().is_table()); // both rooted

    vm.pop(main); // v
    vm.gc_collect();
    assert!(vm.table_get(w, k).unwrap().is_nil()); // value died
}

#[test]
fn test_automatic_collection_bounds_garbage() {
    let mut vm = new_vm();
    for _ in 0..5000 {
        let _garbage = vm.new_table().unwrap();
    }
    assert!(vm.gc_stats().cycles >= 1, "debt should have driven cycles");
    assert!(
        vm.pool.tables.len() < 5000,
        "live tables: {}",
        vm.pool.tables.len()
    );
}

#[test]
fn test_stop_and_restart() {
    let mut vm = new_vm();
    vm.gc_stop();
    let cycles_before = vm.gc_stats().cycles;
    for _ in 0..2000 {
        let _garbage = vm.new_table().unwrap();
    }
    assert_eq!(vm.gc_stats().cycles, cycles_before);
    let live = vm.pool.tables.len();
    assert!(live >= 2000);
    vm.gc_restart();
    vm.gc_collect();
    assert!(vm.pool.tables.len() < live);
}

struct Ledger {
    live: Rc<Cell<i64>>,
}

impl Allocator for Ledger {
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool {
        self.live
            .set(self.live.get() - old_size as i64 + new_size as i64);
        true
    }
}

#[test]
fn test_allocator_accounting() {
    let live = Rc::new(Cell::new(0i64));
    let mut vm = VelaVM::with_allocator(
        VelaOptions::default(),
        Box::new(Ledger { live: live.clone() }),
    )
    .unwrap();
    assert_eq!(vm.total_bytes() as i64, live.get());

    let t = rooted_table(&mut vm);
    for i in 0..500 {
        let s = vm.new_string(&format!("acct-{}", i)).unwrap();
        vm.table_set(t, s, VelaValue::integer(i)).unwrap();
    }
    assert_eq!(vm.total_bytes() as i64, live.get());
    vm.gc_collect();
    assert_eq!(vm.total_bytes() as i64, live.get());
}

struct Budget {
    live: usize,
    limit: Rc<Cell<usize>>,
}

impl Allocator for Budget {
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool {
        if new_size > old_size && self.live + (new_size - old_size) > self.limit.get() {
            return false;
        }
        self.live = self.live + new_size - old_size;
        true
    }
}

#[test]
fn test_emergency_collection_recovers_memory() {
    let limit = Rc::new(Cell::new(usize::MAX));
    let mut vm = VelaVM::with_allocator(
        VelaOptions::default(),
        Box::new(Budget { live: 0, limit: limit.clone() }),
    )
    .unwrap();
    vm.gc_stop();
    for _ in 0..200 {
        let _garbage = vm.new_table().unwrap();
    }
    vm.gc_restart();
    // barely above the current live size: the next allocation must be
    // satisfied by an emergency collection of the garbage
    limit.set(vm.total_bytes() + 32);
    let t = vm.new_table();
    assert!(t.is_ok(), "emergency collection should have made room");
    assert!(vm.gc_stats().emergency_collections >= 1);
}

#[test]
fn test_out_of_memory_is_reported() {
    let limit = Rc::new(Cell::new(usize::MAX));
    let mut vm = VelaVM::with_allocator(
        VelaOptions::default(),
        Box::new(Budget { live: 0, limit: limit.clone() }),
    )
    .unwrap();
    limit.set(vm.total_bytes() + 4096);
    let main = vm.main_thread();
    let mut saw_oom = false;
    for _ in 0..100_000 {
        // everything rooted: an emergency collection cannot help
        match vm.new_table().and_then(|t| vm.push(main, t)) {
            Ok(()) => {}
            Err(VelaError::OutOfMemory) => {
                saw_oom = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(saw_oom);
}

#[test]
fn test_register_finalizable_without_gc_method_is_noop() {
    let mut vm = new_vm();
    let t = rooted_table(&mut vm);
    vm.register_finalizable(t).unwrap();
    let tid = t.as_table_id().unwrap();
    assert!(!vm.pool.tables.get(tid.0).unwrap().header.is_finalized());
}

#[test]
fn test_pause_and_stepmul_accessors() {
    let mut vm = new_vm();
    let old = vm.set_gc_pause(300);
    assert_eq!(old, 200);
    let old = vm.set_gc_stepmul(400);
    assert_eq!(old, 200);
    // still collects correctly with the new pacing
    for _ in 0..1000 {
        let _garbage = vm.new_table().unwrap();
    }
    vm.gc_collect();
}
