//! Slicing semantics: clamping, empty results, reversed ranges, axis
//! removal, struct field selection, and the negative-index policy.

use dynarr::{
  Array, Error, IRange, StringEncoding, make_fixedstring, make_struct, make_type,
};

fn iota(n: i32) -> Array {
  let vals: Vec<i32> = (0..n).collect();
  Array::from(vals.as_slice())
}

#[test]
fn single_index_removes_the_axis() {
  let a = iota(6);
  let v = a.at(4).unwrap();
  assert_eq!(v.ndim(), 0);
  assert_eq!(v.as_scalar::<i32>().unwrap(), 4);
}

#[test]
fn out_of_range_finish_is_clamped() {
  let a = iota(6);
  let v = a.index(&[IRange::from(2..100)]).unwrap();
  assert_eq!(v.dim_size(0).unwrap(), 4);
  assert_eq!(v.at(3).unwrap().as_scalar::<i32>().unwrap(), 5);
}

#[test]
fn out_of_range_start_is_empty() {
  let a = iota(6);
  let v = a.index(&[IRange::from(9..12)]).unwrap();
  assert_eq!(v.dim_size(0).unwrap(), 0);
}

#[test]
fn stepped_and_reversed_ranges() {
  let a = iota(10);
  let v = a.index(&[IRange::from(3..10).by(2)]).unwrap();
  assert_eq!(v.dim_size(0).unwrap(), 4);
  for (i, want) in [3, 5, 7, 9].iter().enumerate() {
    assert_eq!(v.at(i as isize).unwrap().as_scalar::<i32>().unwrap(), *want);
  }

  // When the step is negative, the finish is exclusive below the start.
  let r = a.index(&[IRange::new(4, 1, -1)]).unwrap();
  assert_eq!(r.dim_size(0).unwrap(), 3);
  for (i, want) in [4, 3, 2].iter().enumerate() {
    assert_eq!(r.at(i as isize).unwrap().as_scalar::<i32>().unwrap(), *want);
  }

  let whole = a.index(&[IRange::full().by(-1)]).unwrap();
  assert_eq!(whole.dim_size(0).unwrap(), 10);
  assert_eq!(whole.at(0).unwrap().as_scalar::<i32>().unwrap(), 9);
  assert_eq!(whole.at(9).unwrap().as_scalar::<i32>().unwrap(), 0);
}

#[test]
fn slicing_shares_data() {
  let a = iota(6);
  let v = a.index(&[IRange::from(2..5)]).unwrap();
  a.at(3).unwrap().val_assign(&Array::from(99i32)).unwrap();
  assert_eq!(v.at(1).unwrap().as_scalar::<i32>().unwrap(), 99);
}

#[test]
fn multidimensional_slices() {
  let a = Array::empty(&[3, 4], make_type::<i32>()).unwrap();
  for i in 0..3 {
    let row: Vec<i32> = (0..4).map(|j| (i * 10 + j) as i32).collect();
    a.at(i as isize).unwrap().val_assign(&Array::from(row.as_slice())).unwrap();
  }
  let v = a.index(&[IRange::from(1..3), IRange::from(2)]).unwrap();
  assert_eq!(v.ndim(), 1);
  assert_eq!(v.dim_size(0).unwrap(), 2);
  assert_eq!(v.at(0).unwrap().as_scalar::<i32>().unwrap(), 12);
  assert_eq!(v.at(1).unwrap().as_scalar::<i32>().unwrap(), 22);
}

#[test]
fn negative_indices_are_rejected() {
  let a = iota(6);
  assert!(matches!(a.at(-1), Err(Error::IndexOutOfBounds { .. })));
  assert!(matches!(
    a.index(&[IRange::from(-3..2)]),
    Err(Error::IndexOutOfBounds { .. })
  ));
  assert!(matches!(
    a.index(&[IRange::from(0..-1)]),
    Err(Error::IndexOutOfBounds { .. })
  ));
}

#[test]
fn single_index_bounds_are_checked() {
  let a = iota(6);
  assert!(matches!(a.at(6), Err(Error::IndexOutOfBounds { index: 6, axis: 0, size: 6 })));
}

#[test]
fn too_many_indices_fail() {
  let a = iota(6);
  assert!(matches!(
    a.index(&[IRange::from(0), IRange::from(0)]),
    Err(Error::TypeMismatch(_))
  ));
}

#[test]
fn outer_iteration_yields_element_views() {
  let a = iota(4);
  let values: Vec<i32> =
    a.iter_outer().unwrap().map(|v| v.as_scalar::<i32>().unwrap()).collect();
  assert_eq!(values, [0, 1, 2, 3]);
  assert!(a.at(0).unwrap().iter_outer().is_err());
}

#[test]
fn struct_field_selection() {
  let point = make_struct(&[
    (make_type::<i32>(), "x"),
    (make_type::<f64>(), "y"),
    (make_fixedstring(4, StringEncoding::Ascii).unwrap(), "tag"),
  ]).unwrap();
  let a = Array::empty(&[], point).unwrap();
  a.index(&[IRange::from(0)]).unwrap().val_assign(&Array::from(7i32)).unwrap();
  a.index(&[IRange::from(1)]).unwrap().val_assign(&Array::from(2.5f64)).unwrap();
  a.index(&[IRange::from(2)]).unwrap().val_assign(&Array::from("ok")).unwrap();

  assert_eq!(a.index(&[IRange::from(0)]).unwrap().as_scalar::<i32>().unwrap(), 7);
  assert_eq!(a.index(&[IRange::from(1)]).unwrap().as_scalar::<f64>().unwrap(), 2.5);
  assert_eq!(a.index(&[IRange::from(2)]).unwrap().as_scalar::<String>().unwrap(), "ok");

  // A strided index projects a sub-struct viewing the same data.
  let sub = a.index(&[IRange::from(0..2)]).unwrap();
  assert_eq!(sub.to_string(), "[7, 2.5]");
}

#[test]
fn struct_fields_inside_arrays() {
  let point = make_struct(&[(make_type::<i32>(), "x"), (make_type::<f64>(), "y")]).unwrap();
  let a = Array::empty(&[3], point).unwrap();
  for i in 0..3 {
    a.index(&[IRange::from(i), IRange::from(1)]).unwrap()
      .val_assign(&Array::from(f64::from(i) * 0.5)).unwrap();
  }
  let v = a.index(&[IRange::from(2), IRange::from(1)]).unwrap();
  assert_eq!(v.as_scalar::<f64>().unwrap(), 1.0);
}
