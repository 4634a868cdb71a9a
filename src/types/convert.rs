//! Expression-kind types: `convert`, which adapts between a value type and
//! a storage type, and `view`, which reinterprets the bytes of a same-sized
//! type.
//!
//! Values of these types are stored in the storage representation; any use
//! lowers through the storage-to-value kernel chain assembled by
//! [`crate::kernels::chain`].

use std::any::Any;
use std::fmt;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::kernels::UnaryKernel;
use crate::kernels::assign::{AssignErrorMode, make_assignment_kernel};

use super::{MemoryManagement, Metadata, Type, TypeFlags, TypeId, TypeImpl, TypeKind};

/// An expression type whose values are stored as `storage` and presented as
/// `value`, converting under a fixed error mode.
#[derive(Debug)]
pub struct ConvertType {
  value: Type,
  storage: Type,
  errmode: AssignErrorMode,
}

/// A conversion type presenting `storage` data as `value`, checked with the
/// default error mode.
#[must_use] pub fn make_convert(value: Type, storage: Type) -> Type {
  make_convert_with_errmode(value, storage, AssignErrorMode::default())
}

/// A conversion type with an explicit error mode.
#[must_use] pub fn make_convert_with_errmode(value: Type, storage: Type,
    errmode: AssignErrorMode) -> Type {
  Type::from_impl(ConvertType { value, storage, errmode })
}

impl ConvertType {
  /// The error mode the conversion is checked with.
  #[must_use] pub fn errmode(&self) -> AssignErrorMode { self.errmode }
}

impl TypeImpl for ConvertType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Convert }
  fn kind(&self) -> TypeKind { TypeKind::Expression }
  fn element_size(&self) -> usize { self.storage.element_size() }
  fn alignment(&self) -> usize { self.storage.alignment() }
  fn flags(&self) -> TypeFlags { self.storage.flags() }
  fn memory_management(&self) -> MemoryManagement { self.storage.memory_management() }
  fn value_type(&self) -> Option<Type> { Some(self.value.clone()) }
  fn storage_type(&self) -> Option<Type> { Some(self.storage.clone()) }

  fn default_data_size(&self, ndim: usize, shape: &[usize]) -> Result<usize> {
    self.storage.default_data_size(ndim, shape)
  }

  // The instance state is the storage type's, so the whole metadata
  // lifecycle delegates.
  fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata> {
    self.storage.metadata_default_construct(ndim, shape)
  }

  fn metadata_copy_construct(&self, src: &Metadata) -> Metadata {
    self.storage.metadata_copy_construct(src)
  }

  fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    self.storage.metadata_reset_buffers(meta)
  }

  fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    self.storage.metadata_finalize_buffers(meta)
  }

  unsafe fn data_destruct(&self, meta: &Metadata, data: *mut u8) {
    unsafe { self.storage.data_destruct_strided(meta, data, 0, 1) }
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
      -> fmt::Result {
    // Print the storage representation; user-visible values only exist
    // after evaluation.
    unsafe { self.storage.print_data(f, meta, data) }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "convert[to={}, from={}]", self.value, self.storage)
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>().is_some_and(|o| {
      self.value == o.value && self.storage == o.storage && self.errmode == o.errmode
    })
  }

  fn make_storage_to_value_kernel(&self, meta: &Metadata) -> Result<UnaryKernel> {
    let src = self.storage.value_type();
    let src_meta = if self.storage.is_expression() { Metadata::None } else { meta.clone() };
    let value_meta = self.value.metadata_default_construct(0, &[])?;
    make_assignment_kernel(&self.value, &value_meta, &src, &src_meta, self.errmode)
  }

  fn make_value_to_storage_kernel(&self, meta: &Metadata) -> Result<UnaryKernel> {
    let dst = self.storage.value_type();
    let dst_meta_owned;
    let dst_meta = if self.storage.is_expression() {
      dst_meta_owned = dst.metadata_default_construct(0, &[])?;
      &dst_meta_owned
    } else {
      meta
    };
    make_assignment_kernel(&dst, dst_meta, &self.value, &Metadata::None, self.errmode)
  }

  fn property(&self, name: &str) -> Result<Array> {
    match name {
      "value_type" => Array::from_type(self.value.clone()),
      "storage_type" => Array::from_type(self.storage.clone()),
      _ => Err(Error::TypeMismatch(format!("convert type has no property {name:?}"))),
    }
  }
}

/// An expression type reinterpreting the bytes of `operand` as `value`.
#[derive(Debug)]
pub struct ViewType {
  value: Type,
  operand: Type,
}

/// A view type presenting the bytes of `operand` as `value`. Both sides
/// must be fixed-size pod types of the same size.
pub fn make_view(value: Type, operand: Type) -> Result<Type> {
  if value.element_size() == 0 || value.element_size() != operand.element_size() {
    return Err(Error::TypeMismatch(format!(
      "cannot view {operand} (size {}) as {value} (size {})",
      operand.element_size(), value.element_size())));
  }
  if value.memory_management() != MemoryManagement::Pod
      || operand.memory_management() != MemoryManagement::Pod {
    return Err(Error::TypeMismatch(format!(
      "view requires pod types, not {operand} as {value}")));
  }
  Ok(Type::from_impl(ViewType { value, operand }))
}

impl TypeImpl for ViewType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::View }
  fn kind(&self) -> TypeKind { TypeKind::Expression }
  fn element_size(&self) -> usize { self.operand.element_size() }
  fn alignment(&self) -> usize { self.operand.alignment().max(self.value.alignment()) }
  fn flags(&self) -> TypeFlags { self.operand.flags() }
  fn value_type(&self) -> Option<Type> { Some(self.value.clone()) }
  fn storage_type(&self) -> Option<Type> { Some(self.operand.clone()) }

  fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata> {
    self.operand.metadata_default_construct(ndim, shape)
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
      -> fmt::Result {
    unsafe { self.operand.print_data(f, meta, data) }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "view[as={}, of={}]", self.value, self.operand)
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>()
      .is_some_and(|o| self.value == o.value && self.operand == o.operand)
  }

  fn make_storage_to_value_kernel(&self, _meta: &Metadata) -> Result<UnaryKernel> {
    Ok(crate::kernels::make_pod_copy_kernel(self.value.element_size()))
  }

  fn make_value_to_storage_kernel(&self, _meta: &Metadata) -> Result<UnaryKernel> {
    Ok(crate::kernels::make_pod_copy_kernel(self.value.element_size()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::make_type;

  #[test]
  fn convert_carries_value_and_storage() {
    let tp = make_convert(make_type::<f64>(), make_type::<i32>());
    assert!(tp.is_expression());
    assert_eq!(tp.value_type(), make_type::<f64>());
    assert_eq!(tp.storage_type(), make_type::<i32>());
    assert_eq!(tp.element_size(), 4);
  }

  #[test]
  fn convert_equality_includes_the_error_mode() {
    let a = make_convert(make_type::<f64>(), make_type::<i32>());
    let b = make_convert(make_type::<f64>(), make_type::<i32>());
    let c = make_convert_with_errmode(make_type::<f64>(), make_type::<i32>(),
      AssignErrorMode::None);
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn view_requires_matching_sizes() {
    assert!(make_view(make_type::<f32>(), make_type::<u32>()).is_ok());
    assert!(make_view(make_type::<f64>(), make_type::<u32>()).is_err());
  }
}
