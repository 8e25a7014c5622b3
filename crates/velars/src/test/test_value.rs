// Tagged value representation tests
use crate::value::*;
use crate::*;

#[test]
fn test_basic_tags() {
    assert!(VelaValue::nil().is_nil());
    assert!(VelaValue::boolean(true).is_boolean());
    assert_eq!(VelaValue::boolean(true).as_boolean(), Some(true));
    assert_eq!(VelaValue::boolean(false).as_boolean(), Some(false));
    assert_eq!(VelaValue::integer(42).as_integer(), Some(42));
    assert_eq!(VelaValue::float(0.5).as_float(), Some(0.5));
    assert!(VelaValue::integer(1).is_number());
    assert!(VelaValue::float(1.0).is_number());
    assert!(!VelaValue::nil().is_collectable());
    assert!(!VelaValue::integer(0).is_collectable());
}

#[test]
fn test_truthiness() {
    assert!(!VelaValue::nil().truthy());
    assert!(!VelaValue::boolean(false).truthy());
    assert!(VelaValue::boolean(true).truthy());
    assert!(VelaValue::integer(0).truthy());
    assert!(VelaValue::float(0.0).truthy());
}

#[test]
fn test_float_to_int_exact() {
    assert_eq!(VelaValue::float_to_int_exact(3.0), Some(3));
    assert_eq!(VelaValue::float_to_int_exact(-7.0), Some(-7));
    assert_eq!(VelaValue::float_to_int_exact(3.5), None);
    assert_eq!(VelaValue::float_to_int_exact(f64::NAN), None);
    assert_eq!(VelaValue::float_to_int_exact(f64::INFINITY), None);
    assert_eq!(VelaValue::float_to_int_exact(9.3e18), None);
    assert_eq!(
        VelaValue::float_to_int_exact(-9_223_372_036_854_775_808.0),
        Some(i64::MIN)
    );
}

#[test]
fn test_key_normalization() {
    let k = VelaValue::float(3.0).normalize_key();
    assert!(k.is_integer());
    assert_eq!(k.as_integer(), Some(3));
    let k = VelaValue::float(3.25).normalize_key();
    assert!(k.is_float());
}

#[test]
fn test_light_fn_roundtrip() {
    fn probe(_vm: &mut VelaVM, _th: ThreadId) -> VelaResult<usize> {
        Ok(0)
    }
    let v = VelaValue::light_fn(probe);
    let back = v.as_light_fn().unwrap();
    assert_eq!(back as usize, probe as usize);
}

#[test]
fn test_raw_equality() {
    let vm = super::new_vm();
    assert!(vm.raw_equals(VelaValue::integer(3), VelaValue::float(3.0)));
    assert!(!vm.raw_equals(VelaValue::integer(3), VelaValue::float(3.5)));
    assert!(!vm.raw_equals(VelaValue::float(f64::NAN), VelaValue::float(f64::NAN)));
    assert!(!vm.raw_equals(VelaValue::nil(), VelaValue::boolean(false)));
}

#[test]
fn test_string_equality_by_content() {
    let mut vm = super::new_vm();
    let a = vm.new_string("hello").unwrap();
    let b = vm.new_string("hello").unwrap();
    // short strings are interned: same id
    assert_eq!(a.as_str_id(), b.as_str_id());
    assert!(vm.raw_equals(a, b));

    let long = "x".repeat(100);
    let la = vm.new_string(&long).unwrap();
    let main = vm.main_thread();
    vm.push(main, la).unwrap();
    let lb = vm.new_string(&long).unwrap();
    vm.push(main, lb).unwrap();
    // long strings are separate objects but compare by content
    assert_ne!(la.as_str_id(), lb.as_str_id());
    assert!(vm.raw_equals(la, lb));
}
