//! The array value: a typed, possibly strided n-dimensional view over a
//! memory block.
//!
//! An array is the triple `(type, metadata, data)` held in an array
//! preamble, itself a kind of memory block; views produced by slicing
//! share the data block and carry adjusted metadata. Assignment, casting
//! and evaluation all lower through the kernel machinery.

use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;
use bitflags::bitflags;
use num::complex::{Complex32, Complex64};

use crate::error::{Error, Result};
use crate::irange::IRange;
use crate::kernels::assign::{AssignErrorMode, make_assignment_kernel};
use crate::kernels::unary_strided_loop;
use crate::memblock::{MemBlockRef, MemoryBlock, make_fixed_memory_block};
use crate::nodes::{ExprNode, broadcast_strides, evaluate};
use crate::types::string::StringType;
use crate::types::struct_type::StructType;
use crate::types::type_type::{read_type_value, write_type_value};
use crate::types::{
  BuiltinScalar, Metadata, StridedDimType, StridedMeta, Type, TypeFlags, make_convert,
  make_strided_of, make_string, make_type, make_type_of_type, StringEncoding,
};
use crate::{Shape, Strides};

bitflags! {
  /// Access flags shared by arrays and expression nodes.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct AccessFlags: u32 {
    /// The data may be read.
    const READ = 0x1;
    /// The data may be written.
    const WRITE = 0x2;
    /// Nobody else will write the data either, permitting aggressive
    /// reuse.
    const IMMUTABLE = 0x4;
  }
}

/// The array-preamble payload of a memory block: the root type, metadata,
/// data pointer and flags of one array.
pub struct ArrayPreamble {
  tp: Type,
  meta: Metadata,
  flags: AccessFlags,
  data_ptr: *mut u8,
  data_ref: MemBlockRef,
  /// Whether this preamble is responsible for destructing element data.
  /// Views over the same data leave that to the owning preamble.
  owns_data: bool,
}

impl Drop for ArrayPreamble {
  fn drop(&mut self) {
    if self.owns_data && self.tp.flags().contains(TypeFlags::DESTRUCTOR) {
      // Safety: the owning preamble constructed this data and the data
      // block is still alive while the preamble drops.
      unsafe { self.tp.data_destruct_strided(&self.meta, self.data_ptr, 0, 1) }
    }
  }
}

impl fmt::Debug for ArrayPreamble {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ArrayPreamble")
      .field("type", &self.tp)
      .field("flags", &self.flags)
      .field("owns_data", &self.owns_data)
      .field("data_in", &self.data_ref.kind())
      .finish_non_exhaustive()
  }
}

/// A typed, possibly strided n-dimensional view over a memory block.
///
/// Cloning an array clones the handle; the data is shared.
#[derive(Clone, Debug)]
pub struct Array {
  block: MemBlockRef,
}

impl Array {
  fn from_preamble(tp: Type, meta: Metadata, flags: AccessFlags, data_ptr: *mut u8,
      data_ref: MemBlockRef, owns_data: bool) -> Array {
    Array {
      block: Arc::new(MemoryBlock::ArrayData(ArrayPreamble {
        tp, meta, flags, data_ptr, data_ref, owns_data,
      })),
    }
  }

  fn preamble(&self) -> &ArrayPreamble {
    match &*self.block {
      MemoryBlock::ArrayData(p) => p,
      _ => unreachable!("an array handle always wraps an array preamble"),
    }
  }

  /// An uninitialized (zeroed) array of the given shape and element type.
  pub fn empty(shape: &[usize], tp: Type) -> Result<Array> {
    let mut full = tp;
    for _ in 0..shape.len() {
      full = make_strided_of(full);
    }
    let meta = full.metadata_default_construct(shape.len(), shape)?;
    let size = full.default_data_size(shape.len(), shape)?;
    let (block, ptr) = make_fixed_memory_block(size, full.alignment().max(1))?;
    let owns = full.flags().contains(TypeFlags::DESTRUCTOR);
    Ok(Array::from_preamble(full, meta, AccessFlags::READ | AccessFlags::WRITE, ptr, block,
      owns))
  }

  /// A view over raw strided data: `dtype` is the element type, `meta` its
  /// metadata, and `owner` keeps the data alive.
  pub(crate) fn from_raw_view(dtype: Type, meta: Metadata, shape: &[usize], strides: &[isize],
      origin: *mut u8, owner: MemBlockRef, flags: AccessFlags) -> Result<Array> {
    let mut full = dtype;
    let mut full_meta = meta;
    for i in (0..shape.len()).rev() {
      full = make_strided_of(full);
      full_meta = Metadata::Strided(StridedMeta {
        size: shape[i],
        stride: strides[i],
        element: Box::new(full_meta),
      });
    }
    Ok(Array::from_preamble(full, full_meta, flags | AccessFlags::READ, origin, owner, false))
  }

  /// An immutable scalar holding a type handle.
  pub fn from_type(tp: Type) -> Result<Array> {
    let a = Array::empty(&[], make_type_of_type())?;
    // Safety: the scalar was just constructed with zeroed (null) data.
    unsafe { write_type_value(a.data_ptr(), tp) }
    Ok(a.into_immutable())
  }

  /// The full type of the array, dimensions included.
  #[must_use] pub fn get_type(&self) -> &Type { &self.preamble().tp }

  /// The element type after peeling the strided dimensions.
  #[must_use] pub fn element_type(&self) -> Type {
    let mut tp = self.preamble().tp.clone();
    while let Some(sd) = tp.downcast::<StridedDimType>() {
      let element = sd.element_type().clone();
      tp = element;
    }
    tp
  }

  /// The access flags of this view.
  #[must_use] pub fn access_flags(&self) -> AccessFlags { self.preamble().flags }

  /// Number of strided dimensions.
  #[must_use] pub fn ndim(&self) -> usize { self.shape().len() }

  /// The shape vector.
  #[must_use] pub fn shape(&self) -> Shape {
    let mut shape = Shape::new();
    let mut tp = self.preamble().tp.clone();
    let mut meta = &self.preamble().meta;
    while tp.downcast::<StridedDimType>().is_some() {
      let m = meta.strided();
      shape.push(m.size);
      let element = tp.downcast::<StridedDimType>().expect("checked above")
        .element_type().clone();
      meta = &m.element;
      tp = element;
    }
    shape
  }

  /// The size of dimension `i`.
  pub fn dim_size(&self, i: usize) -> Result<usize> {
    self.shape().get(i).copied().ok_or_else(|| Error::InvariantViolation(format!(
      "array of {} dimensions has no dimension {i}", self.ndim())))
  }

  pub(crate) fn data_ptr(&self) -> *mut u8 { self.preamble().data_ptr }

  /// The block a view must hold to keep this array's data alive: the
  /// preamble itself, so element destructors cannot run under a live view.
  pub(crate) fn data_owner(&self) -> MemBlockRef { self.block.clone() }

  pub(crate) fn meta(&self) -> &Metadata { &self.preamble().meta }

  /// The shape, strides, and element metadata of the strided dimensions.
  pub(crate) fn strided_parts(&self) -> (Shape, Strides, Metadata) {
    let mut shape = Shape::new();
    let mut strides = Strides::new();
    let mut tp = self.preamble().tp.clone();
    let mut meta = &self.preamble().meta;
    while let Some(sd) = tp.downcast::<StridedDimType>() {
      let m = meta.strided();
      shape.push(m.size);
      strides.push(m.stride);
      let element = sd.element_type().clone();
      meta = &m.element;
      tp = element;
    }
    (shape, strides, meta.clone())
  }

  /// The readable origin and strides broadcast to `out_shape`.
  pub(crate) fn readable_parts(&self, out_shape: &[usize]) -> Result<(*const u8, Strides)> {
    if !self.access_flags().contains(AccessFlags::READ) {
      return Err(Error::InvariantViolation("array data is not readable".into()));
    }
    let (shape, strides, _) = self.strided_parts();
    Ok((self.data_ptr().cast_const(), broadcast_strides(out_shape, &shape, &strides)?))
  }

  /// The writable origin and natural strides.
  pub(crate) fn writable_parts(&self) -> Result<(*mut u8, Strides)> {
    if !self.access_flags().contains(AccessFlags::WRITE) {
      return Err(Error::InvariantViolation("array data is not writable".into()));
    }
    let (_, strides, _) = self.strided_parts();
    Ok((self.data_ptr(), strides))
  }

  /// Downgrades a freshly built array to read-only immutable.
  pub(crate) fn into_immutable(mut self) -> Array {
    if let Some(MemoryBlock::ArrayData(p)) = Arc::get_mut(&mut self.block) {
      p.flags = AccessFlags::READ | AccessFlags::IMMUTABLE;
    }
    self
  }

  /// Whether this handle is the only one to its preamble, which permits
  /// in-place reuse.
  #[must_use] pub fn is_unique(&self) -> bool {
    Arc::strong_count(&self.block) == 1
  }

  /// Selects a single index along the first dimension, removing the axis.
  pub fn at(&self, idx: isize) -> Result<Array> {
    self.index(&[IRange::index(idx)])
  }

  /// Applies a slice spec, one [`IRange`] per leading axis. Slicing is a
  /// pure transformation: it produces new metadata over the same data.
  pub fn index(&self, indices: &[IRange]) -> Result<Array> {
    let p = self.preamble();
    let (tp, meta, origin) = apply_index_walk(&p.tp, &p.meta, p.data_ptr, indices, 0)?;
    Ok(Array::from_preamble(tp, meta, p.flags, origin, self.data_owner(), false))
  }

  /// Assigns the broadcast values of `rhs` into this view under the
  /// default error mode.
  pub fn val_assign(&self, rhs: &Array) -> Result<()> {
    self.val_assign_with(rhs, AssignErrorMode::default())
  }

  /// Assigns the broadcast values of `rhs` into this view.
  pub fn val_assign_with(&self, rhs: &Array, errmode: AssignErrorMode) -> Result<()> {
    if !self.access_flags().contains(AccessFlags::WRITE) {
      return Err(Error::InvariantViolation("assignment through a non-writable view".into()));
    }
    let (dshape, dstrides, dmeta) = self.strided_parts();
    let (sshape, sstrides, smeta) = rhs.strided_parts();
    let kernel = make_assignment_kernel(&self.element_type(), &dmeta, &rhs.element_type(),
      &smeta, errmode)?;
    let sstrides = broadcast_strides(&dshape, &sshape, &sstrides)?;
    // Safety: both sides cover their strided extents, and the assignment
    // kernel was built for exactly these element types and metadata.
    unsafe {
      unary_strided_loop(&dshape, self.data_ptr(), &dstrides, rhs.data_ptr().cast_const(),
        &sstrides, &kernel)
    }
  }

  /// A view of this array with its elements cast to `tp`, deferred through
  /// a conversion type. Evaluating the result materializes the values.
  pub fn ucast(&self, tp: Type) -> Result<Array> {
    let leaf = self.element_type();
    if leaf == tp {
      return Ok(self.clone());
    }
    let (shape, strides, elem_meta) = self.strided_parts();
    Array::from_raw_view(make_convert(tp, leaf), elem_meta, &shape, &strides, self.data_ptr(),
      self.data_owner(), self.access_flags() & (AccessFlags::READ | AccessFlags::IMMUTABLE))
  }

  /// Evaluates the array to one whose element type is not expression-kind.
  /// Arrays already in value form evaluate to themselves.
  pub fn eval(&self) -> Result<Array> {
    if !self.element_type().is_expression() {
      return Ok(self.clone());
    }
    evaluate(&ExprNode::strided_from_array(self))
  }

  /// Extracts a scalar value, converting unchecked from the element type.
  pub fn as_scalar<T: ScalarValue>(&self) -> Result<T> {
    T::from_array(self)
  }

  /// A typed metadata property of the element type, e.g. a categorical's
  /// `storage_type`, `category_type` or `categories`.
  pub fn p(&self, name: &str) -> Result<Array> {
    self.element_type().property(name)
  }

  /// Iterates over the first axis, yielding element views.
  pub fn iter_outer(&self) -> Result<impl Iterator<Item = Array> + '_> {
    let n = self.dim_size(0)?;
    #[allow(clippy::cast_possible_wrap)]
    Ok((0..n).map(move |i| self.at(i as isize).expect("index within the axis size")))
  }
}

impl fmt::Display for Array {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let p = self.preamble();
    // Safety: the preamble's data pointer addresses a live value of its
    // type for as long as the handle exists.
    unsafe { p.tp.print_data(f, &p.meta, p.data_ptr.cast_const()) }
  }
}

/// Walks the type tree and the metadata in lockstep, applying one index
/// range per axis. Strided axes adjust origin and stride; struct axes
/// select fields; single-index ranges remove the axis.
fn apply_index_walk(tp: &Type, meta: &Metadata, origin: *mut u8, indices: &[IRange],
    axis: usize) -> Result<(Type, Metadata, *mut u8)> {
  let Some(ir) = indices.first() else {
    return Ok((tp.clone(), tp.metadata_copy_construct(meta), origin));
  };
  reject_negative(ir, axis)?;
  if let Some(sd) = tp.downcast::<StridedDimType>() {
    let m = meta.strided();
    if ir.is_single_index() {
      let idx = ir.start();
      #[allow(clippy::cast_sign_loss)]
      if idx < 0 || idx as usize >= m.size {
        return Err(Error::IndexOutOfBounds { index: idx, axis, size: m.size });
      }
      let origin = origin.wrapping_offset(m.stride * idx);
      return apply_index_walk(sd.element_type(), &m.element, origin, &indices[1..], axis + 1);
    }
    let r = ir.resolve(m.size);
    let origin = origin.wrapping_offset(m.stride * r.start);
    let (sub_tp, sub_meta, origin) =
      apply_index_walk(sd.element_type(), &m.element, origin, &indices[1..], axis + 1)?;
    return Ok((
      make_strided_of(sub_tp),
      Metadata::Strided(StridedMeta {
        size: r.size,
        stride: m.stride * r.step,
        element: Box::new(sub_meta),
      }),
      origin,
    ));
  }
  if let Some(st) = tp.downcast::<StructType>() {
    let m = meta.struct_();
    if ir.is_single_index() {
      let idx = ir.start();
      #[allow(clippy::cast_sign_loss)]
      if idx < 0 || idx as usize >= st.field_count() {
        return Err(Error::IndexOutOfBounds { index: idx, axis, size: st.field_count() });
      }
      let idx = idx as usize;
      let origin = origin.wrapping_add(m.offsets[idx]);
      return apply_index_walk(&st.field_types()[idx], &m.fields[idx], origin, &indices[1..],
        axis + 1);
    }
    if indices.len() > 1 {
      return Err(Error::Unsupported(
        "a range over struct fields must be the last index".into()));
    }
    let r = ir.resolve(st.field_count());
    #[allow(clippy::cast_sign_loss)]
    let selected: Vec<usize> =
      (0..r.size).map(|k| (r.start + k as isize * r.step) as usize).collect();
    let projected = st.project(selected.iter().copied())?;
    let sub_meta = Metadata::Struct(crate::types::StructMeta {
      offsets: selected.iter().map(|&i| m.offsets[i]).collect(),
      fields: selected.iter().map(|&i| m.fields[i].clone()).collect(),
    });
    return Ok((Type::from_impl(projected), sub_meta, origin));
  }
  Err(Error::TypeMismatch(format!("too many indices: {tp} has no dimension to index")))
}

/// Negative indices are rejected rather than wrapped Python-style.
fn reject_negative(ir: &IRange, axis: usize) -> Result<()> {
  if ir.is_single_index() {
    return Ok(()); // bounds-checked by the caller
  }
  for bound in [ir.start(), ir.finish()] {
    if bound < 0 && bound != IRange::OPEN_START && bound != IRange::OPEN_FINISH {
      return Err(Error::IndexOutOfBounds { index: bound, axis, size: 0 });
    }
  }
  Ok(())
}

/// Builds the remove-axis mask of a slice spec, for pushing the index
/// operation through an expression tree.
#[must_use] pub fn remove_axis_mask(indices: &[IRange]) -> BitVec {
  let mut mask = BitVec::from_elem(indices.len(), false);
  for (i, ir) in indices.iter().enumerate() {
    if ir.is_single_index() {
      mask.set(i, true);
    }
  }
  mask
}

/// A Rust value extractable from a scalar array.
pub trait ScalarValue: Sized {
  /// Extracts the value from a zero-dimensional array.
  fn from_array(a: &Array) -> Result<Self>;
}

fn check_scalar(a: &Array) -> Result<()> {
  if a.ndim() != 0 {
    return Err(Error::TypeMismatch(format!(
      "cannot extract a scalar from an array of {} dimensions", a.ndim())));
  }
  Ok(())
}

macro_rules! impl_scalar_value {
  ($($ty:ty),*) => {$(
    impl ScalarValue for $ty {
      fn from_array(a: &Array) -> Result<Self> {
        check_scalar(a)?;
        let (_, _, meta) = a.strided_parts();
        let kernel = make_assignment_kernel(&make_type::<$ty>(), &Metadata::None,
          &a.element_type(), &meta, AssignErrorMode::None)?;
        let mut buf = [0u8; 16];
        // Safety: the buffer is large enough for any builtin scalar, and
        // the array data is a live element of its type.
        unsafe {
          kernel.call(buf.as_mut_ptr(), 0, a.data_ptr().cast_const(), 0, 1)?;
          Ok(<$ty>::read_scalar(buf.as_ptr()))
        }
      }
    }
  )*}
}

impl_scalar_value! {
  bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, Complex32, Complex64
}

impl ScalarValue for String {
  fn from_array(a: &Array) -> Result<Self> {
    check_scalar(a)?;
    let tmp = Array::empty(&[], make_string(StringEncoding::Utf8))?;
    tmp.val_assign_with(a, AssignErrorMode::None)?;
    let st = tmp.element_type();
    let st = st.downcast::<StringType>().expect("built as a string scalar");
    // Safety: the scalar was just assigned.
    unsafe { st.get_utf8_string(tmp.meta(), tmp.data_ptr().cast_const()) }
  }
}

impl ScalarValue for Type {
  fn from_array(a: &Array) -> Result<Self> {
    check_scalar(a)?;
    let tmp = Array::empty(&[], make_type_of_type())?;
    tmp.val_assign_with(a, AssignErrorMode::None)?;
    // Safety: the scalar was just assigned.
    unsafe { read_type_value(tmp.data_ptr().cast_const()) }
      .ok_or_else(|| Error::InvariantViolation("the type value is uninitialized".into()))
  }
}

macro_rules! impl_from_scalar {
  ($($ty:ty),*) => {$(
    impl From<$ty> for Array {
      fn from(v: $ty) -> Array {
        let a = Array::empty(&[], make_type::<$ty>()).expect("scalar allocation");
        // Safety: the scalar was just constructed with this element size.
        unsafe { <$ty>::write_scalar(a.data_ptr(), v) }
        a.into_immutable()
      }
    }

    impl From<&[$ty]> for Array {
      fn from(vals: &[$ty]) -> Array {
        let a = Array::empty(&[vals.len()], make_type::<$ty>()).expect("array allocation");
        let size = make_type::<$ty>().element_size();
        for (i, &v) in vals.iter().enumerate() {
          // Safety: the array was sized for vals.len() contiguous elements.
          unsafe { <$ty>::write_scalar(a.data_ptr().add(i * size), v) }
        }
        a
      }
    }

    impl<const N: usize> From<&[$ty; N]> for Array {
      fn from(vals: &[$ty; N]) -> Array { Array::from(&vals[..]) }
    }
  )*}
}

impl_from_scalar! {
  bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, Complex32, Complex64
}

impl From<&str> for Array {
  fn from(s: &str) -> Array {
    let a = Array::empty(&[], make_string(StringEncoding::Utf8)).expect("scalar allocation");
    let tp = a.element_type();
    let st = tp.downcast::<StringType>().expect("built as a string scalar");
    // Safety: the scalar was just constructed with zeroed data.
    unsafe {
      st.set_utf8_string(a.meta(), a.data_ptr(), AssignErrorMode::None, s)
        .expect("string body allocation");
    }
    // The literal is immutable; freeze its body block.
    tp.metadata_finalize_buffers(a.meta()).expect("block was just created");
    a.into_immutable()
  }
}

impl From<&[&str]> for Array {
  fn from(vals: &[&str]) -> Array {
    let a = Array::empty(&[vals.len()], make_string(StringEncoding::Utf8))
      .expect("array allocation");
    let tp = a.element_type();
    let st = tp.downcast::<StringType>().expect("built as a string array");
    let (_, strides, meta) = a.strided_parts();
    for (i, s) in vals.iter().enumerate() {
      // Safety: the array was sized for vals.len() string elements.
      unsafe {
        st.set_utf8_string(&meta, a.data_ptr().wrapping_offset(strides[0] * i as isize),
          AssignErrorMode::None, s).expect("string body allocation");
      }
    }
    a
  }
}

impl<const N: usize> From<&[&str; N]> for Array {
  fn from(vals: &[&str; N]) -> Array { Array::from(&vals[..]) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_round_trips() {
    assert_eq!(Array::from(42i32).as_scalar::<i32>().unwrap(), 42);
    assert_eq!(Array::from(2.5f64).as_scalar::<f64>().unwrap(), 2.5);
    assert!(Array::from(true).as_scalar::<bool>().unwrap());
    assert_eq!(Array::from("pelican").as_scalar::<String>().unwrap(), "pelican");
  }

  #[test]
  fn empty_builds_c_order_views() {
    let a = Array::empty(&[2, 3], make_type::<i32>()).unwrap();
    assert_eq!(a.ndim(), 2);
    assert_eq!(a.shape().as_slice(), &[2, 3]);
    assert_eq!(a.dim_size(1).unwrap(), 3);
    let (_, strides, _) = a.strided_parts();
    assert_eq!(strides.as_slice(), &[12, 4]);
  }

  #[test]
  fn from_slice_and_display() {
    let a = Array::from(&[1i32, 2, 3]);
    assert_eq!(a.to_string(), "[1, 2, 3]");
    assert_eq!(a.at(1).unwrap().as_scalar::<i32>().unwrap(), 2);
  }

  #[test]
  fn immutable_scalars_reject_assignment() {
    let a = Array::from(5i32);
    assert!(a.val_assign(&Array::from(6i32)).is_err());
  }

  #[test]
  fn type_scalars_round_trip() {
    let a = Array::from_type(make_type::<i32>()).unwrap();
    assert_eq!(a.as_scalar::<Type>().unwrap(), make_type::<i32>());
  }
}
