//! Rolling-window reduction scenarios.

use dynarr::gfunc::{make_builtin_max_reduce_kernel, make_builtin_sum_reduce_kernel};
use dynarr::types::BuiltinId;
use dynarr::{Array, make_rolling_arrfunc, make_type};

#[test]
fn builtin_sum_kernel() {
  let sum_1d = make_builtin_sum_reduce_kernel(BuiltinId::Float64).unwrap();
  let rolling_sum = make_rolling_arrfunc(sum_1d, 4).unwrap();

  let adata = [1.0f64, 3.0, 7.0, 2.0, 9.0, 4.0, -5.0, 100.0, 2.0, -20.0, 3.0, 9.0, 18.0];
  let a = Array::from(&adata);
  let b = rolling_sum.call(&[&a]).unwrap();
  assert_eq!(b.ndim(), 1);
  assert_eq!(b.dim_size(0).unwrap(), adata.len());
  assert_eq!(b.element_type(), make_type::<f64>());
  for i in 0..3 {
    assert!(b.at(i).unwrap().as_scalar::<f64>().unwrap().is_nan());
  }
  for i in 3..adata.len() {
    let expected: f64 = adata[i - 3..=i].iter().sum();
    assert_eq!(b.at(i as isize).unwrap().as_scalar::<f64>().unwrap(), expected);
  }
}

#[test]
fn spot_values() {
  let sum_1d = make_builtin_sum_reduce_kernel(BuiltinId::Float64).unwrap();
  let rolling_sum = make_rolling_arrfunc(sum_1d, 4).unwrap();
  let a = Array::from(&[1.0f64, 3.0, 7.0, 2.0, 9.0, 4.0, -5.0, 100.0, 2.0, -20.0, 3.0, 9.0,
    18.0]);
  let b = rolling_sum.call(&[&a]).unwrap();
  assert_eq!(b.at(3).unwrap().as_scalar::<f64>().unwrap(), 13.0);
  assert_eq!(b.at(4).unwrap().as_scalar::<f64>().unwrap(), 21.0);
  assert_eq!(b.at(6).unwrap().as_scalar::<f64>().unwrap(), 10.0);
  assert_eq!(b.at(12).unwrap().as_scalar::<f64>().unwrap(), 10.0);
}

#[test]
fn integer_sum_uses_the_identity_prefix() {
  let sum_1d = make_builtin_sum_reduce_kernel(BuiltinId::Int32).unwrap();
  let rolling_sum = make_rolling_arrfunc(sum_1d, 3).unwrap();
  let a = Array::from(&[1i32, 2, 3, 4]);
  let b = rolling_sum.call(&[&a]).unwrap();
  // Integer results have no NaN; the identity fills the prefix.
  assert_eq!(b.at(0).unwrap().as_scalar::<i32>().unwrap(), 0);
  assert_eq!(b.at(1).unwrap().as_scalar::<i32>().unwrap(), 0);
  assert_eq!(b.at(2).unwrap().as_scalar::<i32>().unwrap(), 6);
  assert_eq!(b.at(3).unwrap().as_scalar::<i32>().unwrap(), 9);
}

#[test]
fn max_seeds_each_window_from_its_first_element() {
  let max_1d = make_builtin_max_reduce_kernel(BuiltinId::Int32).unwrap();
  let rolling_max = make_rolling_arrfunc(max_1d, 2).unwrap();
  let a = Array::from(&[5i32, 1, 7, 3]);
  let b = rolling_max.call(&[&a]).unwrap();
  assert_eq!(b.at(1).unwrap().as_scalar::<i32>().unwrap(), 5);
  assert_eq!(b.at(2).unwrap().as_scalar::<i32>().unwrap(), 7);
  assert_eq!(b.at(3).unwrap().as_scalar::<i32>().unwrap(), 7);
}

#[test]
fn rejects_multidimensional_input() {
  let sum_1d = make_builtin_sum_reduce_kernel(BuiltinId::Float64).unwrap();
  let rolling_sum = make_rolling_arrfunc(sum_1d, 2).unwrap();
  let a = Array::empty(&[2, 3], make_type::<f64>()).unwrap();
  assert!(rolling_sum.call(&[&a]).is_err());
}
