// Test module organization
pub mod test_gc;
pub mod test_table;
pub mod test_upvalue;
pub mod test_value;

use crate::*;

pub(crate) fn new_vm() -> VelaVM {
    VelaVM::new(VelaOptions::default())
}

/// Create a table and anchor it on the main thread's stack so
/// interleaved collections cannot reclaim it.
pub(crate) fn rooted_table(vm: &mut VelaVM) -> VelaValue {
    let t = vm.new_table().unwrap();
    let main = vm.main_thread();
    vm.push(main, t).unwrap();
    t
}
