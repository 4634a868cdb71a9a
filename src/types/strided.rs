//! The strided dimension type: one axis of elements spaced by a byte
//! stride, with the axis size and stride kept in metadata so slicing never
//! touches the data.

use std::any::Any;
use std::fmt;

use crate::error::{Error, Result};

use super::{
  Metadata, MemoryManagement, StridedMeta, Type, TypeFlags, TypeId, TypeImpl, TypeKind,
};

/// A strided dimension over an element type.
#[derive(Debug)]
pub struct StridedDimType {
  element: Type,
}

impl StridedDimType {
  /// The element type of this dimension.
  #[must_use] pub fn element_type(&self) -> &Type { &self.element }
}

/// A strided dimension wrapping `element`.
#[must_use] pub fn make_strided_of(element: Type) -> Type {
  Type::from_impl(StridedDimType { element })
}

impl TypeImpl for StridedDimType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Strided }
  fn kind(&self) -> TypeKind { TypeKind::Dim }

  // The data size depends on the per-instance shape.
  fn element_size(&self) -> usize { 0 }
  fn alignment(&self) -> usize { self.element.alignment() }

  fn flags(&self) -> TypeFlags {
    self.element.flags() & (TypeFlags::ZEROINIT | TypeFlags::DESTRUCTOR)
  }

  fn memory_management(&self) -> MemoryManagement { self.element.memory_management() }

  fn default_data_size(&self, ndim: usize, shape: &[usize]) -> Result<usize> {
    if ndim == 0 || shape.is_empty() {
      return Err(Error::TypeMismatch(format!(
        "strided dimension of {} requires a shape", self.element)));
    }
    Ok(shape[0] * self.element.default_data_size(ndim - 1, &shape[1..])?)
  }

  #[allow(clippy::cast_possible_wrap)]
  fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata> {
    if ndim == 0 || shape.is_empty() {
      return Err(Error::TypeMismatch(format!(
        "strided dimension of {} requires a shape", self.element)));
    }
    let stride = self.element.default_data_size(ndim - 1, &shape[1..])? as isize;
    let element = self.element.metadata_default_construct(ndim - 1, &shape[1..])?;
    Ok(Metadata::Strided(StridedMeta { size: shape[0], stride, element: Box::new(element) }))
  }

  fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    self.element.metadata_reset_buffers(&meta.strided().element)
  }

  fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    self.element.metadata_finalize_buffers(&meta.strided().element)
  }

  unsafe fn data_destruct(&self, meta: &Metadata, data: *mut u8) {
    let m = meta.strided();
    unsafe { self.element.data_destruct_strided(&m.element, data, m.stride, m.size) }
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
      -> fmt::Result {
    let m = meta.strided();
    f.write_str("[")?;
    let mut p = data;
    for i in 0..m.size {
      if i != 0 {
        f.write_str(", ")?;
      }
      unsafe {
        self.element.print_data(f, &m.element, p)?;
        p = p.offset(m.stride);
      }
    }
    f.write_str("]")
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "strided * {}", self.element)
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>().is_some_and(|o| self.element == o.element)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::make_type;

  #[test]
  fn metadata_lays_out_c_order() {
    let tp = make_strided_of(make_strided_of(make_type::<i32>()));
    let meta = tp.metadata_default_construct(2, &[3, 4]).unwrap();
    let outer = meta.strided();
    assert_eq!(outer.size, 3);
    assert_eq!(outer.stride, 16);
    let inner = outer.element.strided();
    assert_eq!(inner.size, 4);
    assert_eq!(inner.stride, 4);
    assert_eq!(tp.default_data_size(2, &[3, 4]).unwrap(), 48);
  }

  #[test]
  fn equality_follows_the_element() {
    let a = make_strided_of(make_type::<i32>());
    let b = make_strided_of(make_type::<i32>());
    let c = make_strided_of(make_type::<i64>());
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn shape_is_required() {
    let tp = make_strided_of(make_type::<i32>());
    assert!(tp.metadata_default_construct(0, &[]).is_err());
  }
}
