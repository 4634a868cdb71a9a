//! Assignment-engine scenarios: error modes at the array surface, the
//! lossless-assignment predicate, scalar round trips, and the type-of-type
//! string bridge.

use dynarr::{
  Array, AssignErrorMode, Error, StringEncoding, Type, is_lossless_assignment,
  make_categorical, make_string, make_type, make_type_of_type,
};

#[test]
fn scalar_round_trips_are_exact() {
  assert_eq!(Array::from(-7i8).as_scalar::<i8>().unwrap(), -7);
  assert_eq!(Array::from(40_000u16).as_scalar::<u16>().unwrap(), 40_000);
  assert_eq!(Array::from(1u64 << 60).as_scalar::<u64>().unwrap(), 1 << 60);
  assert_eq!(Array::from(0.1f32).as_scalar::<f32>().unwrap(), 0.1);
  assert_eq!(Array::from(f64::MIN).as_scalar::<f64>().unwrap(), f64::MIN);
  assert!(!Array::from(false).as_scalar::<bool>().unwrap());
  let c = num::complex::Complex64::new(1.0, -2.0);
  assert_eq!(Array::from(c).as_scalar::<num::complex::Complex64>().unwrap(), c);
}

#[test]
fn error_modes_at_the_array_surface() {
  let dst = Array::empty(&[], make_type::<i8>()).unwrap();
  let big = Array::from(300i32);
  assert!(matches!(
    dst.val_assign_with(&big, AssignErrorMode::Overflow),
    Err(Error::OutOfRange { .. })
  ));
  dst.val_assign_with(&big, AssignErrorMode::None).unwrap();

  let frac = Array::from(2.5f64);
  let idst = Array::empty(&[], make_type::<i32>()).unwrap();
  assert!(idst.val_assign_with(&frac, AssignErrorMode::Fractional).is_err());
  idst.val_assign_with(&frac, AssignErrorMode::Overflow).unwrap();
  assert_eq!(idst.as_scalar::<i32>().unwrap(), 2);
}

#[test]
fn broadcast_assignment() {
  let a = Array::empty(&[2, 3], make_type::<f64>()).unwrap();
  a.val_assign(&Array::from(&[1.0f64, 2.0, 3.0])).unwrap();
  assert_eq!(a.at(0).unwrap().at(2).unwrap().as_scalar::<f64>().unwrap(), 3.0);
  assert_eq!(a.at(1).unwrap().at(0).unwrap().as_scalar::<f64>().unwrap(), 1.0);

  // Conflicting shapes are a broadcast error.
  let bad = Array::from(&[1.0f64, 2.0]);
  assert!(matches!(a.val_assign(&bad), Err(Error::BroadcastMismatch { .. })));
}

#[test]
fn lossless_predicate_forces_string_validation() {
  let cd = make_categorical(&Array::from(&["foo", "bar"])).unwrap();
  let sd = make_string(StringEncoding::Utf8);
  // String conversions report false both ways, so encodings get validated
  // on every assignment.
  assert!(!is_lossless_assignment(&sd, &cd));
  assert!(!is_lossless_assignment(&cd, &sd));
}

#[test]
fn string_transcoding_assignment() {
  let wide = Array::empty(&[], make_string(StringEncoding::Utf16)).unwrap();
  wide.val_assign(&Array::from("caf\u{e9}")).unwrap();
  assert_eq!(wide.as_scalar::<String>().unwrap(), "caf\u{e9}");

  // An ASCII destination rejects it above the unchecked mode.
  let narrow = Array::empty(&[], make_string(StringEncoding::Ascii)).unwrap();
  assert!(narrow.val_assign(&wide).is_err());
  narrow.val_assign_with(&wide, AssignErrorMode::None).unwrap();
  assert_eq!(narrow.as_scalar::<String>().unwrap(), "caf?");
}

#[test]
fn numbers_format_into_strings_and_parse_back() {
  let s = Array::empty(&[], make_string(StringEncoding::Utf8)).unwrap();
  s.val_assign(&Array::from(1234i32)).unwrap();
  assert_eq!(s.as_scalar::<String>().unwrap(), "1234");

  let n = Array::empty(&[], make_type::<f64>()).unwrap();
  n.val_assign(&Array::from("2.5")).unwrap();
  assert_eq!(n.as_scalar::<f64>().unwrap(), 2.5);

  let bad = Array::from("pelican");
  assert!(matches!(n.val_assign(&bad), Err(Error::Parse { .. })));
}

#[test]
fn type_of_type_string_bridge() {
  let dst = Array::empty(&[], make_type_of_type()).unwrap();
  dst.val_assign(&Array::from("int32")).unwrap();
  assert_eq!(dst.as_scalar::<Type>().unwrap(), make_type::<i32>());

  let s = Array::empty(&[], make_string(StringEncoding::Utf8)).unwrap();
  s.val_assign(&dst).unwrap();
  assert_eq!(s.as_scalar::<String>().unwrap(), "int32");

  // Handles copy between type values, refcounts managed by the kernel.
  let other = Array::empty(&[], make_type_of_type()).unwrap();
  other.val_assign(&dst).unwrap();
  assert_eq!(other.as_scalar::<Type>().unwrap(), make_type::<i32>());

  // Text that is not a type is a parse error.
  assert!(matches!(
    dst.val_assign(&Array::from("gibberish")),
    Err(Error::Parse { .. })
  ));
}

#[test]
fn immutable_views_reject_writes() {
  let a = Array::from(3.5f64);
  assert!(matches!(
    a.val_assign(&Array::from(1.0f64)),
    Err(Error::InvariantViolation(_))
  ));
}

#[test]
fn assignment_between_casts_goes_through_values() {
  // Source is an int array presented as float64; destination is plain i64.
  let src = Array::from(&[1i32, 2, 3]).ucast(make_type::<f64>()).unwrap();
  let dst = Array::empty(&[3], make_type::<i64>()).unwrap();
  dst.val_assign(&src).unwrap();
  assert_eq!(dst.at(2).unwrap().as_scalar::<i64>().unwrap(), 3);
}
