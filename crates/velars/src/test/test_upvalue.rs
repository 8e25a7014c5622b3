// Upvalue manager tests
use std::rc::Rc;

use crate::test::new_vm;
use crate::value::Proto;
use crate::*;

#[test]
fn test_find_upval_is_unique_per_slot() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    for i in 0..3 {
        vm.push(main, VelaValue::integer(i)).unwrap();
    }
    let a = vm.find_upval(main, 0).unwrap();
    let b = vm.find_upval(main, 0).unwrap();
    assert_eq!(a, b);
    assert_eq!(vm.upval_refcount(a), 2);

    let c = vm.find_upval(main, 2).unwrap();
    assert_ne!(a, c);

    // at most one open upvalue per slot
    let levels: Vec<usize> = {
        let th = vm.pool.threads.get(main.0).unwrap();
        th.data
            .open_upvals
            .iter()
            .filter_map(|uid| vm.pool.upvals.get(uid.0).and_then(|u| u.data.level()))
            .collect()
    };
    assert_eq!(levels, vec![2, 0]); // sorted by descending level
}

#[test]
fn test_open_list_insertion_order() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    for i in 0..4 {
        vm.push(main, VelaValue::integer(i)).unwrap();
    }
    vm.find_upval(main, 1).unwrap();
    vm.find_upval(main, 3).unwrap();
    vm.find_upval(main, 0).unwrap();
    vm.find_upval(main, 2).unwrap();
    let levels: Vec<usize> = {
        let th = vm.pool.threads.get(main.0).unwrap();
        th.data
            .open_upvals
            .iter()
            .filter_map(|uid| vm.pool.upvals.get(uid.0).and_then(|u| u.data.level()))
            .collect()
    };
    assert_eq!(levels, vec![3, 2, 1, 0]);
}

#[test]
fn test_close_at_level() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    for i in 0..4 {
        vm.push(main, VelaValue::integer(i * 100)).unwrap();
    }
    let u0 = vm.find_upval(main, 0).unwrap();
    let u1 = vm.find_upval(main, 1).unwrap();
    let u3 = vm.find_upval(main, 3).unwrap();
    vm.close_upvals(main, 1).unwrap();
    assert!(vm.upval_is_open(u0));
    assert!(!vm.upval_is_open(u1));
    assert!(!vm.upval_is_open(u3));
    // closed upvalues carry the value that was on the stack
    assert_eq!(vm.upval_get(u1).as_integer(), Some(100));
    assert_eq!(vm.upval_get(u3).as_integer(), Some(300));
    // the open one still reads through the stack
    assert_eq!(vm.upval_get(u0).as_integer(), Some(0));
    vm.stack_set(main, 1, VelaValue::integer(7)).unwrap();
    assert_eq!(vm.upval_get(u0).as_integer(), Some(7));
}

#[test]
fn test_shared_capture_and_close() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    // local x at slot 0
    vm.push(main, VelaValue::integer(10)).unwrap();

    let proto = Rc::new(Proto::new(0, 1));
    let c1 = vm.new_script_closure(proto.clone()).unwrap();
    vm.push(main, c1).unwrap();
    vm.init_upvals(c1).unwrap();
    let u1 = vm.capture_upval(c1, 0, main, 0).unwrap();

    let c2 = vm.new_script_closure(proto).unwrap();
    vm.push(main, c2).unwrap();
    vm.init_upvals(c2).unwrap();
    let u2 = vm.capture_upval(c2, 0, main, 0).unwrap();

    // both closures share one upvalue
    assert_eq!(u1, u2);
    assert_eq!(vm.upval_refcount(u1), 2);

    // last store wins, visible through both after scope exit
    vm.upval_set(u1, VelaValue::integer(42)).unwrap();
    assert_eq!(vm.stack_get(main, 1).as_integer(), Some(42));
    vm.close_upvals(main, 0).unwrap();
    assert!(!vm.upval_is_open(u1));
    assert_eq!(vm.upval_get(u1).as_integer(), Some(42));
    assert_eq!(vm.upval_get(u2).as_integer(), Some(42));
}

#[test]
fn test_init_upvals_closed_nil() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let proto = Rc::new(Proto::new(0, 3));
    let c = vm.new_script_closure(proto).unwrap();
    vm.push(main, c).unwrap();
    vm.init_upvals(c).unwrap();
    let cid = c.as_closure_id().unwrap();
    let upvals: Vec<UpvalId> = vm
        .pool
        .closures
        .get(cid.0)
        .unwrap()
        .data
        .script_upvals()
        .to_vec();
    assert_eq!(upvals.len(), 3);
    for uid in upvals {
        assert!(!vm.upval_is_open(uid));
        assert!(vm.upval_get(uid).is_nil());
        assert_eq!(vm.upval_refcount(uid), 1);
    }
}

#[test]
fn test_upvalue_write_through_stack() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    vm.push(main, VelaValue::integer(1)).unwrap();
    let u = vm.find_upval(main, 0).unwrap();
    vm.upval_set(u, VelaValue::integer(5)).unwrap();
    assert_eq!(vm.stack_get(main, 1).as_integer(), Some(5));
}
