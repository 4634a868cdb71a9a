//! The open type system.
//!
//! A [`Type`] handle is a small tagged value: builtin scalar ids are encoded
//! inline with no heap allocation, while composite types are heap objects
//! behind a reference-counted [`TypeImpl`] trait object. Handles are cheap
//! to clone and compare structurally; composite types are produced on
//! demand and never interned.
//!
//! Alongside the type tree lives the per-instance [`Metadata`] tree: stride
//! tables for strided dimensions, field offsets for structs, and sub-block
//! references for variable-sized data. Every metadata lifecycle operation
//! of the engine (`default_construct`, `copy_construct`, `destruct`,
//! `reset_buffers`, `finalize_buffers`) is a [`TypeImpl`] operation over
//! that tree.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::kernels::assign::AssignErrorMode;
use crate::kernels::{CompareKernel, UnaryKernel};
use crate::memblock::MemBlockRef;

pub mod builtin;
pub mod categorical;
pub mod convert;
pub mod datetime;
pub mod string;
pub mod strided;
pub mod struct_type;
pub mod type_type;

pub use builtin::{BuiltinId, BuiltinScalar, make_type};
pub use categorical::{CategoricalType, factor_categorical, make_categorical};
pub use convert::{ConvertType, ViewType, make_convert, make_convert_with_errmode, make_view};
pub use datetime::{DatetimeStruct, datetime_struct_type};
pub use string::{
  BytesType, FixedStringType, StringEncoding, StringType, make_bytes, make_fixedstring,
  make_string,
};
pub use strided::{StridedDimType, make_strided_of};
pub use struct_type::{StructType, make_struct};
pub use type_type::{TypeType, make_type_of_type};

/// Identifies the layout family of a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeId {
  /// Boolean stored as one byte, 0 or 1.
  Bool,
  /// Signed integers.
  Int8,
  /// 16-bit signed integer.
  Int16,
  /// 32-bit signed integer.
  Int32,
  /// 64-bit signed integer.
  Int64,
  /// Unsigned integers.
  UInt8,
  /// 16-bit unsigned integer.
  UInt16,
  /// 32-bit unsigned integer.
  UInt32,
  /// 64-bit unsigned integer.
  UInt64,
  /// 32-bit float.
  Float32,
  /// 64-bit float.
  Float64,
  /// Complex of two 32-bit floats.
  Complex64,
  /// Complex of two 64-bit floats.
  Complex128,
  /// A strided dimension over an element type.
  Strided,
  /// Variable-sized string referencing a memory block.
  String,
  /// Fixed-size string stored inline.
  FixedString,
  /// Variable-sized raw bytes referencing a memory block.
  Bytes,
  /// A record of named, typed fields.
  Struct,
  /// An integer-coded value from a fixed category set.
  Categorical,
  /// An expression type converting between a value and a storage type.
  Convert,
  /// An expression type reinterpreting the bytes of a same-sized type.
  View,
  /// A value which is itself a type handle.
  Type,
}

/// The broad behavioral kind of a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
  /// The boolean type.
  Bool,
  /// Signed integer scalars.
  Int,
  /// Unsigned integer scalars.
  UInt,
  /// Floating-point scalars.
  Real,
  /// Complex floating-point scalars.
  Complex,
  /// String-like data.
  String,
  /// Raw byte data.
  Bytes,
  /// Record types.
  Struct,
  /// Dimension types wrapping an element type.
  Dim,
  /// Expression types requiring a storage-to-value kernel chain.
  Expression,
  /// Everything else with its own virtual behavior.
  Custom,
}

/// How the data of a type is managed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryManagement {
  /// Plain bytes, copied with memcpy.
  Pod,
  /// Plain bytes whose zero pattern is a valid value.
  Zeroinit,
  /// The data references a separate memory block named by the metadata.
  Blockref,
  /// The data owns a resource with a destructor.
  Object,
}

bitflags! {
  /// Per-type behavior flags.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct TypeFlags: u32 {
    /// The type is a scalar.
    const SCALAR = 0x1;
    /// All-zero bytes are a valid default value.
    const ZEROINIT = 0x2;
    /// Elements own resources and need `data_destruct`.
    const DESTRUCTOR = 0x4;
  }
}

/// The virtual operations of a composite type.
///
/// The raw-data operations take pointers into array storage; they are
/// `unsafe` because the caller must guarantee the pointer refers to a live
/// element laid out according to this type and the supplied metadata.
pub trait TypeImpl: fmt::Debug + Send + Sync {
  /// Downcast support for type-specific surfaces.
  fn as_any(&self) -> &dyn Any;

  /// The id of this type.
  fn type_id(&self) -> TypeId;

  /// The behavioral kind of this type.
  fn kind(&self) -> TypeKind;

  /// The fixed size of one element in bytes, or 0 when the size depends on
  /// per-instance metadata.
  fn element_size(&self) -> usize;

  /// The required data alignment of one element.
  fn alignment(&self) -> usize;

  /// Behavior flags.
  fn flags(&self) -> TypeFlags;

  /// How the data of this type is managed.
  fn memory_management(&self) -> MemoryManagement { MemoryManagement::Pod }

  /// For expression kinds, the user-visible value type.
  fn value_type(&self) -> Option<Type> { None }

  /// For expression kinds, the underlying storage type.
  fn storage_type(&self) -> Option<Type> { None }

  /// The data size of a default-constructed instance with the given shape.
  fn default_data_size(&self, _ndim: usize, _shape: &[usize]) -> Result<usize> {
    Ok(self.element_size())
  }

  /// Builds the per-instance metadata for the given shape. On failure every
  /// partially constructed sub-field is torn down before the error returns.
  fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata>;

  /// Copies metadata, sharing any embedded block references.
  fn metadata_copy_construct(&self, src: &Metadata) -> Metadata { src.clone() }

  /// Rewinds any sub-blocks named by the metadata for reuse.
  fn metadata_reset_buffers(&self, _meta: &Metadata) -> Result<()> { Ok(()) }

  /// Freezes any sub-blocks named by the metadata against further growth.
  fn metadata_finalize_buffers(&self, _meta: &Metadata) -> Result<()> { Ok(()) }

  /// Tears down metadata. Dropping the value releases its block references;
  /// types with extra bookkeeping hook in here.
  fn metadata_destruct(&self, _meta: &mut Metadata) {}

  /// Destroys the resources owned by one element.
  ///
  /// # Safety
  /// `data` must point at a live element of this type under `meta`.
  unsafe fn data_destruct(&self, _meta: &Metadata, _data: *mut u8) {}

  /// Destroys the resources owned by a strided run of elements.
  ///
  /// # Safety
  /// `data` must point at `count` live elements spaced by `stride` bytes.
  unsafe fn data_destruct_strided(&self, meta: &Metadata, data: *mut u8, stride: isize,
      count: usize) {
    let mut p = data;
    for _ in 0..count {
      unsafe {
        self.data_destruct(meta, p);
        p = p.offset(stride);
      }
    }
  }

  /// Formats one element of data.
  ///
  /// # Safety
  /// `data` must point at a live element of this type under `meta`.
  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
    -> fmt::Result;

  /// Formats the type itself.
  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;

  /// Deep structural equality against another composite type.
  fn eq_impl(&self, other: &dyn TypeImpl) -> bool;

  /// Produces the kernel assigning `src` elements into `dst` elements,
  /// where this type is one of the two sides. The default knows no
  /// conversions.
  fn make_assignment_kernel(&self, dst: &Type, _dst_meta: &Metadata, src: &Type,
      _src_meta: &Metadata, _errmode: AssignErrorMode) -> Result<UnaryKernel> {
    Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
  }

  /// For expression kinds, the single chain link turning storage values
  /// (of `storage_type().value_type()`) into this type's values. The chain
  /// composers assemble these links into one kernel.
  fn make_storage_to_value_kernel(&self, _meta: &Metadata) -> Result<UnaryKernel> {
    Err(Error::Unsupported(format!("{:?} has no storage-to-value kernel", self.type_id())))
  }

  /// For expression kinds, the single chain link turning this type's values
  /// back into storage values.
  fn make_value_to_storage_kernel(&self, _meta: &Metadata) -> Result<UnaryKernel> {
    Err(Error::Unsupported(format!("{:?} has no value-to-storage kernel", self.type_id())))
  }

  /// Produces a total-order comparison kernel over elements of this type.
  fn make_comparison_kernel(&self, _meta: &Metadata) -> Result<CompareKernel> {
    Err(Error::Unsupported(format!("no comparison kernel for {:?}", self.type_id())))
  }

  /// Whether assignment from `src` into `dst` can never lose information.
  fn is_lossless_assignment(&self, _dst: &Type, _src: &Type) -> bool { false }

  /// Typed metadata properties, e.g. a categorical's `storage_type`.
  fn property(&self, name: &str) -> Result<Array> {
    Err(Error::TypeMismatch(format!("type has no property {name:?}")))
  }
}

/// Per-instance side data kept alongside the raw bytes of an array.
#[derive(Clone, Debug, Default)]
pub enum Metadata {
  /// The type needs no per-instance state.
  #[default]
  None,
  /// A strided dimension.
  Strided(StridedMeta),
  /// A struct's field offsets and field metadata.
  Struct(StructMeta),
  /// A reference to the block holding variable-sized data.
  Blockref(BlockrefMeta),
}

/// Metadata of one strided dimension.
#[derive(Clone, Debug)]
pub struct StridedMeta {
  /// Number of elements along this axis.
  pub size: usize,
  /// Byte stride between consecutive elements.
  pub stride: isize,
  /// Metadata of the element type.
  pub element: Box<Metadata>,
}

/// Metadata of a struct instance.
#[derive(Clone, Debug)]
pub struct StructMeta {
  /// Byte offset of each field's data from the struct origin.
  pub offsets: Vec<usize>,
  /// Metadata of each field.
  pub fields: Vec<Metadata>,
}

/// Metadata naming the block that holds variable-sized data.
#[derive(Clone, Debug)]
pub struct BlockrefMeta {
  /// The referenced block.
  pub block: MemBlockRef,
}

impl Metadata {
  /// The strided payload; panics if this metadata is of a different shape.
  pub(crate) fn strided(&self) -> &StridedMeta {
    match self {
      Metadata::Strided(m) => m,
      _ => panic!("expected strided metadata, found {self:?}"),
    }
  }

  /// The struct payload; panics if this metadata is of a different shape.
  pub(crate) fn struct_(&self) -> &StructMeta {
    match self {
      Metadata::Struct(m) => m,
      _ => panic!("expected struct metadata, found {self:?}"),
    }
  }

  /// The blockref payload; panics if this metadata is of a different shape.
  pub(crate) fn blockref(&self) -> &BlockrefMeta {
    match self {
      Metadata::Blockref(m) => m,
      _ => panic!("expected blockref metadata, found {self:?}"),
    }
  }
}

/// A type handle: a builtin scalar id, or a shared composite type object.
#[derive(Clone, Debug)]
pub enum Type {
  /// A builtin scalar, identified inline.
  Builtin(BuiltinId),
  /// A composite type behind a shared pointer.
  Heap(Arc<dyn TypeImpl>),
}

impl Type {
  /// Wraps a composite type implementation in a handle.
  pub fn from_impl(imp: impl TypeImpl + 'static) -> Self {
    Type::Heap(Arc::new(imp))
  }

  /// The id of this type.
  #[must_use] pub fn type_id(&self) -> TypeId {
    match self {
      Type::Builtin(id) => BuiltinId::type_id(*id),
      Type::Heap(t) => TypeImpl::type_id(&**t),
    }
  }

  /// The behavioral kind of this type.
  #[must_use] pub fn kind(&self) -> TypeKind {
    match self {
      Type::Builtin(id) => id.kind(),
      Type::Heap(t) => t.kind(),
    }
  }

  /// Whether this is a builtin scalar handle.
  #[must_use] pub fn is_builtin(&self) -> bool { matches!(self, Type::Builtin(_)) }

  /// Whether values of this type must be lowered through a storage-to-value
  /// kernel chain before use.
  #[must_use] pub fn is_expression(&self) -> bool { self.kind() == TypeKind::Expression }

  /// The fixed size of one element in bytes, or 0 when the size depends on
  /// per-instance metadata.
  #[must_use] pub fn element_size(&self) -> usize {
    match self {
      Type::Builtin(id) => id.element_size(),
      Type::Heap(t) => t.element_size(),
    }
  }

  /// The required data alignment of one element.
  #[must_use] pub fn alignment(&self) -> usize {
    match self {
      Type::Builtin(id) => id.alignment(),
      Type::Heap(t) => t.alignment(),
    }
  }

  /// Behavior flags.
  #[must_use] pub fn flags(&self) -> TypeFlags {
    match self {
      Type::Builtin(_) => TypeFlags::SCALAR | TypeFlags::ZEROINIT,
      Type::Heap(t) => t.flags(),
    }
  }

  /// How the data of this type is managed.
  #[must_use] pub fn memory_management(&self) -> MemoryManagement {
    match self {
      Type::Builtin(_) => MemoryManagement::Pod,
      Type::Heap(t) => t.memory_management(),
    }
  }

  /// The user-visible value type: the expression value type for expression
  /// kinds, otherwise the type itself.
  #[must_use] pub fn value_type(&self) -> Type {
    match self {
      Type::Heap(t) => t.value_type().unwrap_or_else(|| self.clone()),
      Type::Builtin(_) => self.clone(),
    }
  }

  /// The storage type: the expression storage type for expression kinds,
  /// otherwise the type itself.
  #[must_use] pub fn storage_type(&self) -> Type {
    match self {
      Type::Heap(t) => t.storage_type().unwrap_or_else(|| self.clone()),
      Type::Builtin(_) => self.clone(),
    }
  }

  /// The composite implementation, if this is a heap type.
  #[must_use] pub fn extended(&self) -> Option<&dyn TypeImpl> {
    match self {
      Type::Builtin(_) => None,
      Type::Heap(t) => Some(&**t),
    }
  }

  /// Downcasts the composite implementation to a concrete type.
  #[must_use] pub fn downcast<T: TypeImpl + 'static>(&self) -> Option<&T> {
    self.extended().and_then(|t| t.as_any().downcast_ref::<T>())
  }

  /// The data size of a default-constructed instance with the given shape.
  pub fn default_data_size(&self, ndim: usize, shape: &[usize]) -> Result<usize> {
    match self {
      Type::Builtin(id) => Ok(id.element_size()),
      Type::Heap(t) => t.default_data_size(ndim, shape),
    }
  }

  /// Builds per-instance metadata for the given shape.
  pub fn metadata_default_construct(&self, ndim: usize, shape: &[usize]) -> Result<Metadata> {
    match self {
      Type::Builtin(_) => Ok(Metadata::None),
      Type::Heap(t) => t.metadata_default_construct(ndim, shape),
    }
  }

  /// Copies metadata, sharing embedded block references.
  #[must_use] pub fn metadata_copy_construct(&self, src: &Metadata) -> Metadata {
    match self {
      Type::Builtin(_) => Metadata::None,
      Type::Heap(t) => t.metadata_copy_construct(src),
    }
  }

  /// Rewinds any sub-blocks named by the metadata for reuse.
  pub fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    match self {
      Type::Builtin(_) => Ok(()),
      Type::Heap(t) => t.metadata_reset_buffers(meta),
    }
  }

  /// Freezes any sub-blocks named by the metadata against further growth.
  pub fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    match self {
      Type::Builtin(_) => Ok(()),
      Type::Heap(t) => t.metadata_finalize_buffers(meta),
    }
  }

  /// Tears down metadata.
  pub fn metadata_destruct(&self, meta: &mut Metadata) {
    if let Type::Heap(t) = self {
      t.metadata_destruct(meta);
    }
  }

  /// Destroys the resources owned by a strided run of elements.
  ///
  /// # Safety
  /// `data` must point at `count` live elements spaced by `stride` bytes.
  pub unsafe fn data_destruct_strided(&self, meta: &Metadata, data: *mut u8, stride: isize,
      count: usize) {
    if let Type::Heap(t) = self {
      unsafe { t.data_destruct_strided(meta, data, stride, count) }
    }
  }

  /// Produces the kernel assigning elements of `src` into elements of this
  /// type. See [`crate::kernels::assign::make_assignment_kernel`].
  pub fn make_assignment_kernel(&self, dst_meta: &Metadata, src: &Type, src_meta: &Metadata,
      errmode: AssignErrorMode) -> Result<UnaryKernel> {
    crate::kernels::assign::make_assignment_kernel(self, dst_meta, src, src_meta, errmode)
  }

  /// Produces a total-order comparison kernel over elements of this type.
  pub fn make_comparison_kernel(&self, meta: &Metadata) -> Result<CompareKernel> {
    match self {
      Type::Builtin(id) => crate::kernels::assign::builtin_comparison_kernel(*id),
      Type::Heap(t) => t.make_comparison_kernel(meta),
    }
  }

  /// Typed metadata properties, e.g. a categorical's `storage_type`.
  pub fn property(&self, name: &str) -> Result<Array> {
    match self {
      Type::Builtin(_) => Err(Error::TypeMismatch(format!("type has no property {name:?}"))),
      Type::Heap(t) => t.property(name),
    }
  }

  /// Formats one element of data governed by this type.
  ///
  /// # Safety
  /// `data` must point at a live element of this type under `meta`.
  pub unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata,
      data: *const u8) -> fmt::Result {
    match self {
      Type::Builtin(id) => unsafe { builtin::print_builtin_scalar(*id, f, data) },
      Type::Heap(t) => unsafe { t.print_data(f, meta, data) },
    }
  }
}

impl PartialEq for Type {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Type::Builtin(a), Type::Builtin(b)) => a == b,
      (Type::Heap(a), Type::Heap(b)) => Arc::ptr_eq(a, b) || a.eq_impl(&**b),
      _ => false,
    }
  }
}

impl Eq for Type {}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Type::Builtin(id) => f.write_str(id.name()),
      Type::Heap(t) => t.print_type(f),
    }
  }
}

impl FromStr for Type {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    if let Some(id) = BuiltinId::from_name(s) {
      return Ok(Type::Builtin(id));
    }
    match s {
      "string" => Ok(make_string(StringEncoding::Utf8)),
      "type" => Ok(make_type_of_type()),
      _ => Err(Error::Parse { input: s.into(), expected: "a type" }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtin_handles_compare_by_id() {
    assert_eq!(make_type::<i32>(), make_type::<i32>());
    assert_ne!(make_type::<i32>(), make_type::<u32>());
    assert_ne!(make_type::<i32>(), make_string(StringEncoding::Utf8));
  }

  #[test]
  fn composite_equality_is_structural() {
    let a = make_fixedstring(3, StringEncoding::Ascii).unwrap();
    let b = make_fixedstring(3, StringEncoding::Ascii).unwrap();
    let c = make_fixedstring(4, StringEncoding::Ascii).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn display_and_parse_round_trip_builtins() {
    for name in ["bool", "int8", "int32", "uint64", "float32", "float64", "complex128"] {
      let tp: Type = name.parse().unwrap();
      assert_eq!(tp.to_string(), name);
    }
    assert!("gibberish".parse::<Type>().is_err());
  }

  #[test]
  fn value_and_storage_of_plain_types_are_identity() {
    let tp = make_type::<f64>();
    assert_eq!(tp.value_type(), tp);
    assert_eq!(tp.storage_type(), tp);
    assert!(!tp.is_expression());
  }
}
