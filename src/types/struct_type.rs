//! The struct type: a record of named, typed fields with metadata-driven
//! field offsets.

use std::any::Any;
use std::fmt;

use crate::error::{Error, Result};
use crate::kernels::UnaryKernel;
use crate::kernels::assign::AssignErrorMode;

use super::{
  MemoryManagement, Metadata, StructMeta, Type, TypeFlags, TypeId, TypeImpl, TypeKind,
};

/// Rounds `offset` up to a multiple of `alignment`.
pub(crate) const fn inc_to_alignment(offset: usize, alignment: usize) -> usize {
  (offset + alignment - 1) & !(alignment - 1)
}

/// A record of named, typed fields.
///
/// Two struct types compare equal iff their alignment, memory management
/// and field-type vectors match; field names are deliberately not part of
/// the identity.
#[derive(Debug)]
pub struct StructType {
  fields: Vec<Type>,
  names: Vec<String>,
  data_size: usize,
  alignment: usize,
  memory_management: MemoryManagement,
  flags: TypeFlags,
}

/// A struct type over `(type, name)` field pairs.
pub fn make_struct(fields: &[(Type, &str)]) -> Result<Type> {
  let (types, names): (Vec<Type>, Vec<String>) =
    fields.iter().map(|(t, n)| (t.clone(), (*n).to_owned())).collect();
  Ok(Type::from_impl(StructType::new(types, names)?))
}

impl StructType {
  fn new(fields: Vec<Type>, names: Vec<String>) -> Result<Self> {
    if fields.len() != names.len() {
      return Err(Error::InvariantViolation(
        "struct field names must match the field types in number".into()));
    }
    let mut alignment = 1;
    let mut memory_management = MemoryManagement::Pod;
    let mut flags = TypeFlags::ZEROINIT;
    let mut size = 0;
    for field in &fields {
      if field.element_size() == 0 {
        return Err(Error::TypeMismatch(format!(
          "struct field of type {field} has no fixed size")));
      }
      alignment = alignment.max(field.alignment());
      match field.memory_management() {
        MemoryManagement::Object => memory_management = MemoryManagement::Object,
        MemoryManagement::Blockref if memory_management != MemoryManagement::Object =>
          memory_management = MemoryManagement::Blockref,
        _ => {}
      }
      if !field.flags().contains(TypeFlags::ZEROINIT) {
        flags.remove(TypeFlags::ZEROINIT);
      }
      if field.flags().contains(TypeFlags::DESTRUCTOR) {
        flags.insert(TypeFlags::DESTRUCTOR);
      }
      size = inc_to_alignment(size, field.alignment()) + field.element_size();
    }
    let data_size = inc_to_alignment(size, alignment);
    Ok(Self { fields, names, data_size, alignment, memory_management, flags })
  }

  /// The field types, in declaration order.
  #[must_use] pub fn field_types(&self) -> &[Type] { &self.fields }

  /// The field names, in declaration order.
  #[must_use] pub fn field_names(&self) -> &[String] { &self.names }

  /// The number of fields.
  #[must_use] pub fn field_count(&self) -> usize { self.fields.len() }

  /// A new struct type over a projected subset of the fields. The caller
  /// pairs it with metadata carrying the original field offsets, so the
  /// projection never moves data.
  pub(crate) fn project(&self, indices: impl Iterator<Item = usize>) -> Result<Self> {
    let mut fields = Vec::new();
    let mut names = Vec::new();
    for i in indices {
      fields.push(self.fields[i].clone());
      names.push(self.names[i].clone());
    }
    Self::new(fields, names)
  }
}

impl TypeImpl for StructType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Struct }
  fn kind(&self) -> TypeKind { TypeKind::Struct }
  fn element_size(&self) -> usize { self.data_size }
  fn alignment(&self) -> usize { self.alignment }
  fn flags(&self) -> TypeFlags { self.flags }
  fn memory_management(&self) -> MemoryManagement { self.memory_management }

  fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata> {
    if ndim > 0 && !shape.is_empty() && shape[0] != self.fields.len() {
      return Err(Error::TypeMismatch(format!(
        "cannot construct {self:?} with dimension size {}, the size must be {}",
        shape[0], self.fields.len())));
    }
    let mut offsets = Vec::with_capacity(self.fields.len());
    let mut metas = Vec::with_capacity(self.fields.len());
    let mut offset = 0;
    for field in &self.fields {
      offset = inc_to_alignment(offset, field.alignment());
      offsets.push(offset);
      offset += field.element_size();
      // A failure here drops the already-built field metadata before the
      // error propagates, leaving the struct metadata unconstructed.
      metas.push(field.metadata_default_construct(0, &[])?);
    }
    Ok(Metadata::Struct(StructMeta { offsets, fields: metas }))
  }

  fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    let m = meta.struct_();
    for (field, fm) in self.fields.iter().zip(&m.fields) {
      field.metadata_reset_buffers(fm)?;
    }
    Ok(())
  }

  fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    let m = meta.struct_();
    for (field, fm) in self.fields.iter().zip(&m.fields) {
      field.metadata_finalize_buffers(fm)?;
    }
    Ok(())
  }

  unsafe fn data_destruct(&self, meta: &Metadata, data: *mut u8) {
    let m = meta.struct_();
    for (i, field) in self.fields.iter().enumerate() {
      if field.flags().contains(TypeFlags::DESTRUCTOR) {
        unsafe {
          field.data_destruct_strided(&m.fields[i], data.add(m.offsets[i]), 0, 1);
        }
      }
    }
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
      -> fmt::Result {
    let m = meta.struct_();
    f.write_str("[")?;
    for (i, field) in self.fields.iter().enumerate() {
      if i != 0 {
        f.write_str(", ")?;
      }
      unsafe { field.print_data(f, &m.fields[i], data.add(m.offsets[i]))? }
    }
    f.write_str("]")
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("{")?;
    for (i, (field, name)) in self.fields.iter().zip(&self.names).enumerate() {
      if i != 0 {
        f.write_str(", ")?;
      }
      write!(f, "{name} : {field}")?;
    }
    f.write_str("}")
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>().is_some_and(|o| {
      self.alignment == o.alignment
        && self.memory_management == o.memory_management
        && self.fields == o.fields
    })
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
    // Field-wise assignment between structurally equal struct types; other
    // struct conversions are not defined.
    if_chain::if_chain! {
      if let Some(d) = dst.downcast::<StructType>();
      if let Some(s) = src.downcast::<StructType>();
      if d.fields == s.fields;
      then {
        let dm = dst_meta.struct_();
        let sm = src_meta.struct_();
        let mut per_field = Vec::with_capacity(d.fields.len());
        for (i, field) in d.fields.iter().enumerate() {
          let kernel = crate::kernels::assign::make_assignment_kernel(field, &dm.fields[i],
            &s.fields[i], &sm.fields[i], errmode)?;
          per_field.push((dm.offsets[i], sm.offsets[i], kernel));
        }
        return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
          let mut d = dp;
          let mut s = sp;
          for _ in 0..count {
            for (doff, soff, kernel) in &per_field {
              // Safety: the caller guarantees `count` live struct elements;
              // the offsets address fields inside them.
              unsafe { kernel.call(d.add(*doff), 0, s.add(*soff), 0, 1)? }
            }
            // Safety: strides within the caller's extents.
            unsafe {
              d = d.offset(dst_stride);
              s = s.offset(src_stride);
            }
          }
          Ok(())
        }));
      }
    }
    Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::make_type;

  fn point() -> Type {
    make_struct(&[(make_type::<i32>(), "x"), (make_type::<f64>(), "y")]).unwrap()
  }

  #[test]
  fn layout_follows_field_alignment() {
    let tp = point();
    assert_eq!(tp.alignment(), 8);
    assert_eq!(tp.element_size(), 16);
    let meta = tp.metadata_default_construct(0, &[]).unwrap();
    assert_eq!(meta.struct_().offsets, [0, 8]);
  }

  #[test]
  fn equality_ignores_field_names() {
    let a = point();
    let b = make_struct(&[(make_type::<i32>(), "u"), (make_type::<f64>(), "v")]).unwrap();
    let c = make_struct(&[(make_type::<i32>(), "x"), (make_type::<f32>(), "y")]).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn variable_sized_fields_are_rejected() {
    use crate::types::make_strided_of;
    let dim = make_strided_of(make_type::<i32>());
    assert!(make_struct(&[(dim, "xs")]).is_err());
  }

  #[test]
  fn fieldwise_assignment_between_equal_structs() {
    let tp = point();
    let meta = tp.metadata_default_construct(0, &[]).unwrap();
    let kernel = tp.extended().unwrap()
      .make_assignment_kernel(&tp, &meta, &tp, &meta, AssignErrorMode::Fractional)
      .unwrap();
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    unsafe {
      src.as_mut_ptr().cast::<i32>().write_unaligned(7);
      src.as_mut_ptr().add(8).cast::<f64>().write_unaligned(2.5);
      kernel.call(dst.as_mut_ptr(), 0, src.as_ptr(), 0, 1).unwrap();
      assert_eq!(dst.as_ptr().cast::<i32>().read_unaligned(), 7);
      assert_eq!(dst.as_ptr().add(8).cast::<f64>().read_unaligned(), 2.5);
    }
  }
}
