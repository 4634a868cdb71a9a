//! The categorical type: values drawn from a fixed set of categories,
//! stored as the smallest unsigned integer that indexes them all.
//!
//! Encoding (category value to storage index) validates membership and
//! fails with a type mismatch for values outside the set; decoding copies
//! the category value back out. `factor_categorical` builds the type from
//! observed values by uniquing and sorting them.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use hashbrown::HashMap;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::kernels::assign::{AssignErrorMode, Num, read_num, write_num};
use crate::kernels::chain::make_chained_unary_kernel;
use crate::kernels::UnaryKernel;

use super::builtin::BuiltinId;
use super::string::{FixedStringType, StringType, read_ptr_pair};
use super::{MemoryManagement, Metadata, Type, TypeFlags, TypeId, TypeImpl, TypeKind};

/// An integer-coded value from a fixed category set.
#[derive(Debug)]
pub struct CategoricalType {
  /// The category values, a 1-d immutable array of `category_type`.
  categories: Array,
  category_type: Type,
  storage: BuiltinId,
  /// Canonical byte key of each category, in category order.
  keys: Vec<Vec<u8>>,
  lookup: HashMap<Vec<u8>, u32>,
}

/// Computes the canonical byte key of one category-typed value, used for
/// uniqueness and encode lookups.
///
/// # Safety
/// `data` must point at a live element of `tp`.
pub(crate) unsafe fn category_key(tp: &Type, data: *const u8) -> Result<Vec<u8>> {
  if let Some(fs) = tp.downcast::<FixedStringType>() {
    return Ok(unsafe { fs.content_bytes(data) }.to_vec());
  }
  if tp.downcast::<StringType>().is_some() {
    let (begin, end) = unsafe { read_ptr_pair(data) };
    if begin.is_null() {
      return Ok(Vec::new());
    }
    return Ok(unsafe {
      std::slice::from_raw_parts(begin, end.offset_from(begin) as usize).to_vec()
    });
  }
  if tp.element_size() > 0 && tp.memory_management() == MemoryManagement::Pod {
    return Ok(unsafe { std::slice::from_raw_parts(data, tp.element_size()).to_vec() });
  }
  Err(Error::TypeMismatch(format!("{tp} cannot be a category type")))
}

/// The strided parts of a 1-d array: `(size, stride, element metadata)`.
fn one_dim_parts(a: &Array) -> Result<(usize, isize, &Metadata)> {
  if a.ndim() != 1 {
    return Err(Error::TypeMismatch(format!(
      "categories must form a one-dimensional array, not {} dimensions", a.ndim())));
  }
  let m = a.meta().strided();
  Ok((m.size, m.stride, &m.element))
}

/// A categorical type over the given unique category values. The values
/// are copied into the type, so later writes to the source array do not
/// change the category set.
pub fn make_categorical(categories: &Array) -> Result<Type> {
  let source = categories.eval()?;
  let (n, _, _) = one_dim_parts(&source)?;
  let category_type = source.element_type();
  let categories = Array::empty(&[n], category_type.clone())?;
  categories.val_assign(&source)?;
  let categories = categories.into_immutable();
  let (n, stride, _elem_meta) = one_dim_parts(&categories)?;
  let storage = if n <= 1 << 8 {
    BuiltinId::UInt8
  } else if n <= 1 << 16 {
    BuiltinId::UInt16
  } else {
    BuiltinId::UInt32
  };
  let mut keys = Vec::with_capacity(n);
  let mut lookup = HashMap::with_capacity(n);
  let origin = categories.data_ptr();
  #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
  for i in 0..n {
    // Safety: the evaluated array owns `n` live elements at this stride.
    let key =
      unsafe { category_key(&category_type, origin.offset(stride * i as isize))? };
    if lookup.insert(key.clone(), i as u32).is_some() {
      return Err(Error::TypeMismatch(format!(
        "categories must be unique, {} appears more than once", categories.at(i as isize)?)));
    }
    keys.push(key);
  }
  Ok(Type::from_impl(CategoricalType { categories, category_type, storage, keys, lookup }))
}

/// Builds a categorical type from observed values: the categories are the
/// sorted set of unique values.
pub fn factor_categorical(values: &Array) -> Result<Type> {
  let values = values.eval()?;
  let (n, stride, elem_meta) = one_dim_parts(&values)?;
  let tp = values.element_type();
  let cmp = tp.make_comparison_kernel(elem_meta)?;
  let origin = values.data_ptr();
  let mut seen: HashMap<Vec<u8>, ()> = HashMap::new();
  let mut unique: Vec<usize> = Vec::new();
  #[allow(clippy::cast_possible_wrap)]
  for i in 0..n {
    // Safety: the evaluated array owns `n` live elements at this stride.
    let key = unsafe { category_key(&tp, origin.offset(stride * i as isize))? };
    if seen.insert(key, ()).is_none() {
      unique.push(i);
    }
  }
  #[allow(clippy::cast_possible_wrap)]
  unique.sort_by(|&a, &b| {
    // Safety: both indices address live elements. The comparison kernels
    // for category-capable types never fail at runtime.
    unsafe {
      cmp.call(origin.offset(stride * a as isize), origin.offset(stride * b as isize))
        .unwrap_or(std::cmp::Ordering::Equal)
    }
  });
  let categories = Array::empty(&[unique.len()], tp)?;
  #[allow(clippy::cast_possible_wrap)]
  for (j, &i) in unique.iter().enumerate() {
    categories.at(j as isize)?.val_assign(&values.at(i as isize)?)?;
  }
  make_categorical(&categories)
}

impl CategoricalType {
  /// The number of categories.
  #[must_use] pub fn category_count(&self) -> usize { self.keys.len() }

  /// The type of the category values.
  #[must_use] pub fn category_type(&self) -> &Type { &self.category_type }

  /// The builtin id of the storage integer.
  #[must_use] pub fn storage_id(&self) -> BuiltinId { self.storage }

  /// The category values array.
  #[must_use] pub fn categories(&self) -> &Array { &self.categories }

  /// The storage index of a category value held in a scalar array. The
  /// value is converted to the category type first, so e.g. a float can
  /// select an integer category.
  pub fn value_from_category(&self, category: &Array) -> Result<u32> {
    let tmp = Array::empty(&[], self.category_type.clone())?;
    tmp.val_assign(category)?;
    // Safety: the scalar was just constructed and assigned.
    let key = unsafe { category_key(&self.category_type, tmp.data_ptr())? };
    self.index_of_key(&key, || format!("{category}"))
  }

  /// The storage index of a textual category, for string category types.
  pub fn value_from_category_str(&self, category: &str) -> Result<u32> {
    if self.category_type.kind() != TypeKind::String {
      return self.value_from_category(&Array::from(category));
    }
    self.index_of_key(category.as_bytes(), || format!("{category:?}"))
  }

  fn index_of_key(&self, key: &[u8], render: impl Fn() -> String) -> Result<u32> {
    self.lookup.get(key).copied().ok_or_else(|| Error::TypeMismatch(format!(
      "{} is not one of the categories of this type", render())))
  }

  /// The encode kernel: category-typed values in, storage indices out.
  /// `handle` must be the handle wrapping `self`.
  fn make_encode_kernel(&self, handle: &Type) -> UnaryKernel {
    let handle = handle.clone();
    let storage = self.storage;
    UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
      let cat = handle.downcast::<CategoricalType>().expect("encode kernel on a categorical");
      let mut d = dp;
      let mut s = sp;
      for _ in 0..count {
        // Safety: the caller guarantees `count` live elements on both sides.
        unsafe {
          let key = category_key(&cat.category_type, s)?;
          let idx = cat.lookup.get(key.as_slice()).copied().ok_or_else(|| {
            Error::TypeMismatch(format!(
              "{} is not one of the categories of this type",
              String::from_utf8_lossy(&key)))
          })?;
          write_num(storage, d, Num::Int(i128::from(idx)), AssignErrorMode::None)?;
          d = d.offset(dst_stride);
          s = s.offset(src_stride);
        }
      }
      Ok(())
    })
  }

  /// The decode kernel: storage indices in, `dst`-typed values out, going
  /// through the per-category assignment `category_type -> dst`.
  fn make_decode_kernel(&self, dst: &Type, dst_meta: &Metadata, errmode: AssignErrorMode)
      -> Result<UnaryKernel> {
    let (n, stride, elem_meta) = one_dim_parts(&self.categories)?;
    let inner = crate::kernels::assign::make_assignment_kernel(dst, dst_meta,
      &self.category_type, elem_meta, errmode)?;
    let categories = self.categories.clone();
    let storage = self.storage;
    Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
      let origin = categories.data_ptr();
      let mut d = dp;
      let mut s = sp;
      for _ in 0..count {
        // Safety: the caller guarantees `count` live elements; the index is
        // bounds-checked against the category count.
        unsafe {
          let idx = match read_num(storage, s) {
            Num::Int(i) => i,
            _ => unreachable!("storage is an unsigned integer"),
          };
          if idx < 0 || idx as usize >= n {
            return Err(Error::TypeMismatch(format!(
              "storage value {idx} is out of range of the {n} categories")));
          }
          inner.call(d, 0, origin.offset(stride * idx as isize), 0, 1)?;
          d = d.offset(dst_stride);
          s = s.offset(src_stride);
        }
      }
      Ok(())
    }))
  }
}

impl TypeImpl for CategoricalType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Categorical }
  fn kind(&self) -> TypeKind { TypeKind::Custom }
  fn element_size(&self) -> usize { self.storage.element_size() }
  fn alignment(&self) -> usize { self.storage.alignment() }
  fn flags(&self) -> TypeFlags { TypeFlags::SCALAR | TypeFlags::ZEROINIT }

  fn metadata_default_construct(&self, _ndim: usize, _shape: &[usize]) -> Result<Metadata> {
    Ok(Metadata::None)
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, _meta: &Metadata, data: *const u8)
      -> fmt::Result {
    let idx = match unsafe { read_num(self.storage, data) } {
      Num::Int(i) => i,
      _ => return f.write_str("<invalid category>"),
    };
    let Ok((n, stride, elem_meta)) = one_dim_parts(&self.categories) else {
      return f.write_str("<invalid category>");
    };
    if idx < 0 || idx as usize >= n {
      return f.write_str("<invalid category>");
    }
    let p = self.categories.data_ptr().wrapping_offset(stride * idx as isize);
    unsafe { self.category_type.print_data(f, elem_meta, p) }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "categorical[type={}, storage={}]", self.category_type, self.storage.name())
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>()
      .is_some_and(|o| self.category_type == o.category_type && self.keys == o.keys)
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
    if dst.type_id() == TypeId::Categorical {
      // Encoding into the categorical. Values already of the category type
      // encode directly; anything else converts to the category type
      // through an intermediate, then encodes.
      let encode = self.make_encode_kernel(dst);
      if *src == self.category_type {
        return Ok(encode);
      }
      let tmp_meta = self.category_type.metadata_default_construct(0, &[])?;
      let pre = crate::kernels::assign::make_assignment_kernel(&self.category_type, &tmp_meta,
        src, src_meta, errmode)?;
      let mut kernels = VecDeque::from_iter([pre, encode]);
      let mut sizes = VecDeque::from_iter([self.category_type.element_size()]);
      return make_chained_unary_kernel(&mut kernels, &mut sizes);
    }
    if src.type_id() == TypeId::Categorical {
      return self.make_decode_kernel(dst, dst_meta, errmode);
    }
    Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
  }

  fn property(&self, name: &str) -> Result<Array> {
    match name {
      "storage_type" => Array::from_type(Type::Builtin(self.storage)),
      "category_type" => Array::from_type(self.category_type.clone()),
      "categories" => Ok(self.categories.clone()),
      _ => Err(Error::TypeMismatch(format!("categorical type has no property {name:?}"))),
    }
  }
}
