//! The type-of-type: a scalar whose element is another type handle.
//!
//! The data is a single owned pointer to a boxed [`Type`] handle; all-zero
//! bytes mean "no value yet", and the data destructor drops the stored
//! handle. Assignment between type values copies the handle; assignment
//! from a string parses the text to a type; assignment to a string formats
//! the type.

use std::any::Any;
use std::fmt;
use std::mem::{align_of, size_of};

use crate::error::{Error, Result};
use crate::kernels::UnaryKernel;
use crate::kernels::assign::AssignErrorMode;

use super::string::{string_kind_get_utf8, string_kind_set_utf8};
use super::{MemoryManagement, Metadata, Type, TypeFlags, TypeId, TypeImpl, TypeKind};

/// A value which is itself a type handle.
#[derive(Debug)]
pub struct TypeType;

/// The type-of-type handle.
#[must_use] pub fn make_type_of_type() -> Type {
  Type::from_impl(TypeType)
}

/// Reads the stored handle, if any.
///
/// # Safety
/// `data` must point at a live type-of-type element.
pub(crate) unsafe fn read_type_value(data: *const u8) -> Option<Type> {
  let ptr = unsafe { data.cast::<*mut Type>().read_unaligned() };
  if ptr.is_null() { None } else { Some(unsafe { (*ptr).clone() }) }
}

/// Replaces the stored handle, dropping any previous one.
///
/// # Safety
/// `data` must point at a writable type-of-type element.
pub(crate) unsafe fn write_type_value(data: *mut u8, tp: Type) {
  unsafe {
    let old = data.cast::<*mut Type>().read_unaligned();
    if !old.is_null() {
      drop(Box::from_raw(old));
    }
    data.cast::<*mut Type>().write_unaligned(Box::into_raw(Box::new(tp)));
  }
}

impl TypeImpl for TypeType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Type }
  fn kind(&self) -> TypeKind { TypeKind::Custom }
  fn element_size(&self) -> usize { size_of::<*mut Type>() }
  fn alignment(&self) -> usize { align_of::<*mut Type>() }

  fn flags(&self) -> TypeFlags {
    TypeFlags::SCALAR | TypeFlags::ZEROINIT | TypeFlags::DESTRUCTOR
  }

  fn memory_management(&self) -> MemoryManagement { MemoryManagement::Object }

  fn metadata_default_construct(&self, _ndim: usize, _shape: &[usize]) -> Result<Metadata> {
    Ok(Metadata::None)
  }

  unsafe fn data_destruct(&self, _meta: &Metadata, data: *mut u8) {
    unsafe {
      let ptr = data.cast::<*mut Type>().read_unaligned();
      if !ptr.is_null() {
        drop(Box::from_raw(ptr));
      }
    }
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, _meta: &Metadata, data: *const u8)
      -> fmt::Result {
    match unsafe { read_type_value(data) } {
      Some(tp) => write!(f, "{tp}"),
      None => f.write_str("<uninitialized type>"),
    }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("type")
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.type_id() == TypeId::Type
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
    if dst.type_id() == TypeId::Type {
      if src.type_id() == TypeId::Type {
        // Copy the handle across, managing the refcounts.
        return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
          let mut d = dp;
          let mut s = sp;
          for _ in 0..count {
            // Safety: the caller guarantees `count` live elements.
            unsafe {
              match read_type_value(s) {
                Some(tp) => write_type_value(d, tp),
                None => return Err(Error::InvariantViolation(
                  "assignment from an uninitialized type value".into())),
              }
              d = d.offset(dst_stride);
              s = s.offset(src_stride);
            }
          }
          Ok(())
        }));
      }
      if src.kind() == TypeKind::String {
        // Parse the text into a type handle.
        let src = src.clone();
        let src_meta = src_meta.clone();
        return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
          let mut d = dp;
          let mut s = sp;
          for _ in 0..count {
            unsafe {
              let text = string_kind_get_utf8(&src, &src_meta, s)?;
              write_type_value(d, text.parse::<Type>()?);
              d = d.offset(dst_stride);
              s = s.offset(src_stride);
            }
          }
          Ok(())
        }));
      }
    } else if dst.kind() == TypeKind::String && src.type_id() == TypeId::Type {
      // Format the handle into the destination string.
      let dst = dst.clone();
      let dst_meta = dst_meta.clone();
      return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
        let mut d = dp;
        let mut s = sp;
        for _ in 0..count {
          unsafe {
            let tp = read_type_value(s).ok_or_else(|| Error::InvariantViolation(
              "assignment from an uninitialized type value".into()))?;
            string_kind_set_utf8(&dst, &dst_meta, d, errmode, &tp.to_string())?;
            d = d.offset(dst_stride);
            s = s.offset(src_stride);
          }
        }
        Ok(())
      }));
    }
    Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::make_type;

  #[test]
  fn data_round_trip_and_destruct() {
    let tp = make_type_of_type();
    let mut data = [0u8; 8];
    unsafe {
      assert!(read_type_value(data.as_ptr()).is_none());
      write_type_value(data.as_mut_ptr(), make_type::<i32>());
      assert_eq!(read_type_value(data.as_ptr()), Some(make_type::<i32>()));
      // Overwrite drops the old handle.
      write_type_value(data.as_mut_ptr(), make_type::<f64>());
      assert_eq!(read_type_value(data.as_ptr()), Some(make_type::<f64>()));
      if let Type::Heap(imp) = &tp {
        imp.data_destruct(&Metadata::None, data.as_mut_ptr());
      }
    }
  }

  #[test]
  fn all_type_of_type_handles_are_equal() {
    assert_eq!(make_type_of_type(), make_type_of_type());
  }
}
