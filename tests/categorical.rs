//! Categorical type scenarios: construction, storage sizing, uniqueness,
//! factoring, encode/decode assignment, and typed properties.

use dynarr::types::CategoricalType;
use dynarr::{
  Array, Error, IRange, StringEncoding, Type, TypeId, TypeKind, factor_categorical,
  make_categorical, make_fixedstring, make_type,
};

fn fixedstring_array(vals: &[&str]) -> Array {
  let a = Array::empty(&[vals.len()], make_fixedstring(3, StringEncoding::Ascii).unwrap())
    .unwrap();
  a.val_assign(&Array::from(vals)).unwrap();
  a
}

fn int_range(n: i32) -> Array {
  let vals: Vec<i32> = (0..n).collect();
  Array::from(vals.as_slice())
}

#[test]
fn create() {
  let a = fixedstring_array(&["foo", "bar", "baz"]);
  let d = make_categorical(&a).unwrap();
  assert_eq!(d.type_id(), TypeId::Categorical);
  assert_eq!(d.kind(), TypeKind::Custom);
  assert_eq!(d.alignment(), 1);
  assert_eq!(d.element_size(), 1);
  assert!(!d.is_expression());
  assert_eq!(d.property("storage_type").unwrap().as_scalar::<Type>().unwrap(),
    make_type::<u8>());
  assert_eq!(d.property("category_type").unwrap().as_scalar::<Type>().unwrap(),
    a.element_type());
}

#[test]
fn storage_sizing() {
  // With <= 256 categories, storage is a uint8.
  let d = make_categorical(&int_range(256)).unwrap();
  assert_eq!(d.element_size(), 1);
  assert_eq!(d.alignment(), 1);
  assert_eq!(d.property("storage_type").unwrap().as_scalar::<Type>().unwrap(),
    make_type::<u8>());
  assert_eq!(d.property("category_type").unwrap().as_scalar::<Type>().unwrap(),
    make_type::<i32>());

  // With <= 65536 categories, storage is a uint16.
  for n in [257, 65536] {
    let d = make_categorical(&int_range(n)).unwrap();
    assert_eq!(d.element_size(), 2);
    assert_eq!(d.alignment(), 2);
    assert_eq!(d.property("storage_type").unwrap().as_scalar::<Type>().unwrap(),
      make_type::<u16>());
    assert_eq!(d.property("category_type").unwrap().as_scalar::<Type>().unwrap(),
      make_type::<i32>());
  }

  // Otherwise, storage is a uint32.
  let d = make_categorical(&int_range(65537)).unwrap();
  assert_eq!(d.element_size(), 4);
  assert_eq!(d.alignment(), 4);
  assert_eq!(d.property("storage_type").unwrap().as_scalar::<Type>().unwrap(),
    make_type::<u32>());
  assert_eq!(d.property("category_type").unwrap().as_scalar::<Type>().unwrap(),
    make_type::<i32>());
}

#[test]
fn compare() {
  let a = fixedstring_array(&["foo", "bar", "baz"]);
  let b = fixedstring_array(&["foo", "bar"]);
  let da = make_categorical(&a).unwrap();
  let da2 = make_categorical(&a).unwrap();
  let db = make_categorical(&b).unwrap();
  assert_eq!(da, da);
  assert_eq!(da, da2);
  assert_ne!(da, db);

  let di = make_categorical(&Array::from(&[0i32, 10, 100])).unwrap();
  assert_ne!(da, di);
}

#[test]
fn unique() {
  let a = fixedstring_array(&["foo", "bar", "foo"]);
  assert!(matches!(make_categorical(&a), Err(Error::TypeMismatch(_))));
  let i = Array::from(&[0i32, 10, 10]);
  assert!(matches!(make_categorical(&i), Err(Error::TypeMismatch(_))));
}

#[test]
fn factor_fixedstring() {
  let cats = fixedstring_array(&["bar", "foo"]);
  let a = fixedstring_array(&["foo", "bar", "foo"]);
  assert_eq!(factor_categorical(&a).unwrap(), make_categorical(&cats).unwrap());
}

#[test]
fn factor_string() {
  let a = Array::from(&["foo", "bar", "foot", "foo", "bar"]);
  let cats = Array::from(&["bar", "foo", "foot"]);
  assert_eq!(factor_categorical(&a).unwrap(), make_categorical(&cats).unwrap());
}

#[test]
fn factor_int() {
  let i = Array::from(&[10i32, 10, 0]);
  let cats = Array::from(&[0i32, 10]);
  assert_eq!(factor_categorical(&i).unwrap(), make_categorical(&cats).unwrap());
}

#[test]
fn values() {
  let a = fixedstring_array(&["foo", "bar", "baz"]);
  let dt = make_categorical(&a).unwrap();
  let cat = dt.downcast::<CategoricalType>().unwrap();
  for (i, name) in ["foo", "bar", "baz"].iter().enumerate() {
    assert_eq!(cat.value_from_category(&a.at(i as isize).unwrap()).unwrap(), i as u32);
    assert_eq!(cat.value_from_category_str(name).unwrap(), i as u32);
  }
  for missing in ["aaa", "ddd", "zzz"] {
    assert!(matches!(cat.value_from_category_str(missing), Err(Error::TypeMismatch(_))));
  }
}

#[test]
fn assign_fixedstring() {
  let cat = fixedstring_array(&["foo", "bar", "baz"]);
  let dt = make_categorical(&cat).unwrap();

  let a = Array::empty(&[3], dt).unwrap();
  a.val_assign(&cat).unwrap();
  assert_eq!(a.at(0).unwrap().as_scalar::<String>().unwrap(), "foo");
  assert_eq!(a.at(1).unwrap().as_scalar::<String>().unwrap(), "bar");
  assert_eq!(a.at(2).unwrap().as_scalar::<String>().unwrap(), "baz");
  a.at(0).unwrap().val_assign(&cat.at(2).unwrap()).unwrap();
  assert_eq!(a.at(0).unwrap().as_scalar::<String>().unwrap(), "baz");

  // A value outside the category set is a type mismatch.
  cat.at(0).unwrap().val_assign(&Array::from("zzz")).unwrap();
  assert!(matches!(
    a.at(0).unwrap().val_assign(&cat.at(0).unwrap()),
    Err(Error::TypeMismatch(_))
  ));

  // Decoding back out into plain strings.
  let tmp = Array::empty(&[3], make_fixedstring(3, StringEncoding::Ascii).unwrap()).unwrap();
  tmp.val_assign(&a).unwrap();
  assert_eq!(tmp.at(0).unwrap().as_scalar::<String>().unwrap(), "baz");
  assert_eq!(tmp.at(1).unwrap().as_scalar::<String>().unwrap(), "bar");
  assert_eq!(tmp.at(2).unwrap().as_scalar::<String>().unwrap(), "baz");
  tmp.at(0).unwrap().val_assign(&a.at(1).unwrap()).unwrap();
  assert_eq!(tmp.at(0).unwrap().as_scalar::<String>().unwrap(), "bar");
  tmp.at(0).unwrap().val_assign(&Array::from("foo")).unwrap();
  assert_eq!(tmp.at(0).unwrap().as_scalar::<String>().unwrap(), "foo");
}

#[test]
fn assign_int() {
  let cat = Array::from(&[10i32, 100, 1000]);
  let dt = make_categorical(&cat).unwrap();

  let a = Array::empty(&[3], dt).unwrap();
  a.val_assign(&cat).unwrap();
  assert_eq!(a.at(0).unwrap().as_scalar::<i32>().unwrap(), 10);
  assert_eq!(a.at(1).unwrap().as_scalar::<i32>().unwrap(), 100);
  assert_eq!(a.at(2).unwrap().as_scalar::<i32>().unwrap(), 1000);
  a.at(0).unwrap().val_assign(&cat.at(2).unwrap()).unwrap();
  assert_eq!(a.at(0).unwrap().as_scalar::<i32>().unwrap(), 1000);

  let tmp = Array::empty(&[3], make_type::<i32>()).unwrap();
  tmp.val_assign(&a).unwrap();
  assert_eq!(tmp.at(0).unwrap().as_scalar::<i32>().unwrap(), 1000);
  assert_eq!(tmp.at(1).unwrap().as_scalar::<i32>().unwrap(), 100);
  assert_eq!(tmp.at(2).unwrap().as_scalar::<i32>().unwrap(), 1000);
  tmp.at(0).unwrap().val_assign(&a.at(1).unwrap()).unwrap();
  assert_eq!(tmp.at(0).unwrap().as_scalar::<i32>().unwrap(), 100);
}

#[test]
fn assign_range() {
  let cat = fixedstring_array(&["foo", "bar", "baz"]);
  let dt = make_categorical(&cat).unwrap();

  let a = Array::empty(&[9], dt).unwrap();
  a.index(&[IRange::from(0..3)]).unwrap().val_assign(&cat).unwrap();
  a.index(&[IRange::from(3..6)]).unwrap().val_assign(&cat.at(0).unwrap()).unwrap();
  a.index(&[IRange::from(6..9).by(2)]).unwrap().val_assign(&cat.at(1).unwrap()).unwrap();
  a.at(7).unwrap().val_assign(&cat.at(2).unwrap()).unwrap();

  let expected = ["foo", "bar", "baz", "foo", "foo", "foo", "bar", "baz", "bar"];
  for (i, want) in expected.iter().enumerate() {
    assert_eq!(a.at(i as isize).unwrap().as_scalar::<String>().unwrap(), *want);
  }
}

#[test]
fn categories_property() {
  let cats = Array::from(&["this", "is", "a", "test"]);
  let cd = make_categorical(&cats).unwrap();
  assert_eq!(cd.property("categories").unwrap().to_string(), cats.to_string());
}

#[test]
fn assign_from_other() {
  let cd = make_categorical(&Array::from(&[3i32, 6, 100, 1000])).unwrap();
  let values = Array::from(&[6i16, 3, 100, 3, 1000, 100, 6, 1000]);
  let a = values.ucast(cd.clone()).unwrap();
  assert_eq!(*a.get_type(),
    dynarr::make_strided_of(dynarr::make_convert(cd.clone(), make_type::<i16>())));
  let a = a.eval().unwrap();
  assert_eq!(a.element_type(), cd);
  for (i, want) in [6, 3, 100, 3, 1000, 100, 6, 1000].iter().enumerate() {
    assert_eq!(a.at(i as isize).unwrap().as_scalar::<i32>().unwrap(), *want);
  }

  // Assignments from a few different input types.
  a.at(3).unwrap().val_assign(&Array::from("1000")).unwrap();
  assert_eq!(a.at(3).unwrap().as_scalar::<i32>().unwrap(), 1000);
  a.at(4).unwrap().val_assign(&Array::from(6.0f64)).unwrap();
  assert_eq!(a.at(4).unwrap().as_scalar::<i32>().unwrap(), 6);
  a.at(5).unwrap().val_assign(&Array::from(3u16)).unwrap();
  assert_eq!(a.at(5).unwrap().as_scalar::<i32>().unwrap(), 3);
}
