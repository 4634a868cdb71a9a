//! General functions: keyed dispatch tables of kernels over
//! parameter-type tuples, element-wise and reducing, plus rolling/window
//! evaluation.
//!
//! Kernels are registered by move into a deque (kernel instances are never
//! copied) and found by exact structural match of the parameter types.
//! Reduce kernels declare associativity, commutativity, an identity, and a
//! left-associating kernel `dst <- op(dst, src)`; the right-associating
//! twin `dst <- op(src, dst)` may be absent only when the kernel is
//! commutative. Multidimensional reductions are rejected unless
//! commutative.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use num::Zero;
use num::complex::{Complex32, Complex64};
use smallvec::smallvec;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::kernels::{BinaryKernel, UnaryKernel, unary_strided_loop};
use crate::nodes::{ExprNode, evaluate};
use crate::types::builtin::{BuiltinId, BuiltinScalar};
use crate::types::{Type, TypeKind, make_type};
use crate::Strides;

macro_rules! fmt_gfunc_debug {
  ($name:literal) => {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct($name)
        .field("name", &self.name)
        .field("kernels", &self.kernels.len())
        .finish()
    }
  }
}

/// The operation of an element-wise kernel, by arity.
pub enum ElwiseOp {
  /// One operand.
  Unary(Arc<UnaryKernel>),
  /// Two operands.
  Binary(Arc<BinaryKernel>),
}

/// One registered element-wise kernel: the parameter types it matches and
/// the operation it performs.
pub struct ElwiseKernel {
  /// The element type of the result.
  pub return_type: Type,
  /// The operand element types, matched exactly.
  pub paramtypes: Vec<Type>,
  /// The kernel itself.
  pub op: ElwiseOp,
}

/// An element-wise general function: a named dispatch table of kernels.
pub struct ElwiseGfunc {
  name: String,
  kernels: VecDeque<Arc<ElwiseKernel>>,
}

impl ElwiseGfunc {
  /// An empty gfunc with the given name.
  #[must_use] pub fn new(name: &str) -> Self {
    Self { name: name.to_owned(), kernels: VecDeque::new() }
  }

  /// The gfunc's name.
  #[must_use] pub fn name(&self) -> &str { &self.name }

  /// Registers a kernel, moving it into the table.
  pub fn add_kernel(&mut self, kernel: ElwiseKernel) {
    self.kernels.push_back(Arc::new(kernel));
  }

  /// The first registered kernel whose parameter types equal `paramtypes`.
  #[must_use] pub fn find_matching_kernel(&self, paramtypes: &[Type])
      -> Option<&Arc<ElwiseKernel>> {
    self.kernels.iter().find(|k| k.paramtypes == paramtypes)
  }

  /// Applies the gfunc to the arguments with broadcasting, dispatching on
  /// the arguments' value types.
  pub fn apply(&self, args: &[&Array]) -> Result<Array> {
    let paramtypes: Vec<Type> =
      args.iter().map(|a| a.element_type().value_type()).collect();
    let kernel = self.find_matching_kernel(&paramtypes).ok_or_else(|| {
      Error::TypeMismatch(format!(
        "gfunc {} has no kernel matching ({})", self.name,
        paramtypes.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")))
    })?;
    let node = match (&kernel.op, args) {
      (ElwiseOp::Unary(k), [a]) => {
        ExprNode::elementwise_unary(kernel.return_type.clone(), k.clone(),
          ExprNode::strided_from_array(a))
      }
      (ElwiseOp::Binary(k), [a, b]) => {
        ExprNode::elementwise_binary(kernel.return_type.clone(), k.clone(),
          ExprNode::strided_from_array(a), ExprNode::strided_from_array(b))?
      }
      _ => {
        return Err(Error::InvariantViolation(format!(
          "gfunc {} kernel arity does not match {} arguments", self.name, args.len())));
      }
    };
    evaluate(&node)
  }
}

impl fmt::Debug for ElwiseGfunc {
  fmt_gfunc_debug!{"ElwiseGfunc"}
}

/// A typed helper building a unary element-wise kernel from a plain
/// function over builtin scalars.
pub fn make_unary_map_kernel<S: BuiltinScalar, D: BuiltinScalar>(
    f: impl Fn(S) -> D + Send + Sync + 'static) -> ElwiseKernel {
  let op = UnaryKernel::new(move |dst, dst_stride, src, src_stride, count| {
    let mut d = dst;
    let mut s = src;
    for _ in 0..count {
      // Safety: the caller guarantees `count` elements on both sides.
      unsafe {
        D::write_scalar(d, f(S::read_scalar(s)));
        d = d.offset(dst_stride);
        s = s.offset(src_stride);
      }
    }
    Ok(())
  });
  ElwiseKernel {
    return_type: make_type::<D>(),
    paramtypes: vec![make_type::<S>()],
    op: ElwiseOp::Unary(Arc::new(op)),
  }
}

/// A typed helper building a binary element-wise kernel from a plain
/// function over builtin scalars.
pub fn make_binary_map_kernel<A: BuiltinScalar, B: BuiltinScalar, D: BuiltinScalar>(
    f: impl Fn(A, B) -> D + Send + Sync + 'static) -> ElwiseKernel {
  let op = BinaryKernel::new(move |dst, dst_stride, s0, s0_stride, s1, s1_stride, count| {
    let mut d = dst;
    let mut a = s0;
    let mut b = s1;
    for _ in 0..count {
      // Safety: the caller guarantees `count` elements on all sides.
      unsafe {
        D::write_scalar(d, f(A::read_scalar(a), B::read_scalar(b)));
        d = d.offset(dst_stride);
        a = a.offset(s0_stride);
        b = b.offset(s1_stride);
      }
    }
    Ok(())
  });
  ElwiseKernel {
    return_type: make_type::<D>(),
    paramtypes: vec![make_type::<A>(), make_type::<B>()],
    op: ElwiseOp::Binary(Arc::new(op)),
  }
}

/// One registered reduction kernel.
pub struct ElwiseReduceKernel {
  /// Right-to-left and left-to-right evaluation are equivalent.
  pub associative: bool,
  /// Multidimensional reduction is permitted, and the left kernel serves
  /// both directions.
  pub commutative: bool,
  /// The element type of the accumulator and result.
  pub return_type: Type,
  /// The operand element types, matched exactly.
  pub paramtypes: Vec<Type>,
  /// Seed for the accumulator and for empty windows.
  pub identity: Option<Array>,
  /// `dst <- op(dst, src)`, used when iterating 0..N-1.
  pub left_assoc_kernel: Arc<UnaryKernel>,
  /// `dst <- op(src, dst)`, used when iterating N-1..0. May be absent iff
  /// the kernel is commutative.
  pub right_assoc_kernel: Option<Arc<UnaryKernel>>,
}

/// A reducing general function: a named dispatch table of reduce kernels.
pub struct ElwiseReduceGfunc {
  name: String,
  kernels: VecDeque<Arc<ElwiseReduceKernel>>,
}

impl ElwiseReduceGfunc {
  /// An empty reduce gfunc with the given name.
  #[must_use] pub fn new(name: &str) -> Self {
    Self { name: name.to_owned(), kernels: VecDeque::new() }
  }

  /// The gfunc's name.
  #[must_use] pub fn name(&self) -> &str { &self.name }

  /// Registers a reduce kernel, moving it into the table.
  pub fn add_kernel(&mut self, kernel: ElwiseReduceKernel) -> Result<()> {
    if kernel.right_assoc_kernel.is_none() && !kernel.commutative {
      return Err(Error::InvariantViolation(
        "a non-commutative reduce kernel needs a right-associating kernel".into()));
    }
    self.kernels.push_back(Arc::new(kernel));
    Ok(())
  }

  /// The first registered kernel whose parameter types equal `paramtypes`.
  #[must_use] pub fn find_matching_kernel(&self, paramtypes: &[Type])
      -> Option<&Arc<ElwiseReduceKernel>> {
    self.kernels.iter().find(|k| k.paramtypes == paramtypes)
  }

  /// Reduces the whole array to a scalar, dispatching on its value type.
  pub fn apply(&self, a: &Array) -> Result<Array> {
    let paramtypes = [a.element_type().value_type()];
    let kernel = self.find_matching_kernel(&paramtypes).ok_or_else(|| {
      Error::TypeMismatch(format!(
        "reduce gfunc {} has no kernel matching ({})", self.name, paramtypes[0]))
    })?;
    reduce(kernel, a)
  }
}

impl fmt::Debug for ElwiseReduceGfunc {
  fmt_gfunc_debug!{"ElwiseReduceGfunc"}
}

/// Reduces every element of the array into one scalar using the kernel's
/// left-associating operation. Multidimensional input requires the kernel
/// to be commutative.
pub fn reduce(kernel: &ElwiseReduceKernel, a: &Array) -> Result<Array> {
  let a = a.eval()?;
  let shape = a.shape();
  if shape.len() > 1 && !kernel.commutative {
    return Err(Error::Unsupported(
      "multidimensional reduction requires a commutative kernel".into()));
  }
  let out = Array::empty(&[], kernel.return_type.clone())?;
  let (src, src_strides) = a.readable_parts(&shape)?;
  let dst = out.data_ptr();
  match &kernel.identity {
    Some(identity) => {
      out.val_assign(identity)?;
      let dst_strides: Strides = smallvec![0; shape.len()];
      // Safety: the source covers its own shape; the destination is one
      // scalar addressed with zero strides.
      unsafe {
        unary_strided_loop(&shape, dst, &dst_strides, src, &src_strides,
          &kernel.left_assoc_kernel)?;
      }
    }
    None => {
      // Without an identity, seed the accumulator from the first element.
      if shape.len() != 1 || shape[0] == 0 {
        return Err(Error::Unsupported(
          "reduction without an identity needs a nonempty one-dimensional input".into()));
      }
      let seed = crate::kernels::assign::make_assignment_kernel(&kernel.return_type,
        &crate::types::Metadata::None, &a.element_type(), &crate::types::Metadata::None,
        crate::kernels::assign::AssignErrorMode::None)?;
      // Safety: the array owns shape[0] live elements at this stride.
      unsafe {
        seed.call(dst, 0, src, 0, 1)?;
        kernel.left_assoc_kernel.call(dst, 0, src.offset(src_strides[0]), src_strides[0],
          shape[0] - 1)?;
      }
    }
  }
  Ok(out)
}

/// Reduces a one-dimensional array iterating from the last element to the
/// first. A commutative kernel reuses its left-associating operation;
/// otherwise the right-associating kernel `dst <- op(src, dst)` drives the
/// fold.
pub fn reduce_reversed(kernel: &ElwiseReduceKernel, a: &Array) -> Result<Array> {
  let a = a.eval()?;
  if a.ndim() != 1 {
    return Err(Error::Unsupported("reversed reduction applies to one dimension".into()));
  }
  let op = if kernel.commutative {
    &kernel.left_assoc_kernel
  } else {
    kernel.right_assoc_kernel.as_ref().ok_or_else(|| Error::InvariantViolation(
      "a non-commutative reduction iterated in reverse needs a right-associating kernel"
        .into()))?
  };
  let n = a.dim_size(0)?;
  let out = Array::empty(&[], kernel.return_type.clone())?;
  let shape = a.shape();
  let (src, src_strides) = a.readable_parts(&shape)?;
  let dst = out.data_ptr();
  let stride = src_strides[0];
  #[allow(clippy::cast_possible_wrap)]
  let last = src.wrapping_offset(stride * (n.max(1) - 1) as isize);
  match &kernel.identity {
    Some(identity) => {
      out.val_assign(identity)?;
      // Safety: the array owns n live elements; iteration walks them
      // backwards from the last.
      unsafe { op.call(dst, 0, last, -stride, n)? }
    }
    None => {
      if n == 0 {
        return Err(Error::Unsupported(
          "reduction without an identity needs a nonempty input".into()));
      }
      let seed = crate::kernels::assign::make_assignment_kernel(&kernel.return_type,
        &crate::types::Metadata::None, &a.element_type(), &crate::types::Metadata::None,
        crate::kernels::assign::AssignErrorMode::None)?;
      // Safety: as above.
      unsafe {
        seed.call(dst, 0, last, 0, 1)?;
        op.call(dst, 0, last.wrapping_offset(-stride), -stride, n - 1)?;
      }
    }
  }
  Ok(out)
}

/// A general function value: apply it to arrays, get an array.
pub struct ArrFunc(Box<dyn Fn(&[&Array]) -> Result<Array> + Send + Sync>);

impl ArrFunc {
  /// Wraps a function as an arrfunc.
  pub fn new(f: impl Fn(&[&Array]) -> Result<Array> + Send + Sync + 'static) -> Self {
    Self(Box::new(f))
  }

  /// Applies the arrfunc.
  pub fn call(&self, args: &[&Array]) -> Result<Array> {
    (self.0)(args)
  }
}

impl fmt::Debug for ArrFunc {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("ArrFunc(..)")
  }
}

/// Lifts a reduce kernel into a rolling-window arrfunc of the given width.
///
/// The first `window - 1` outputs are the sentinel: NaN for float results,
/// the kernel's identity otherwise. Every later output `i` reduces
/// `input[i-window+1 ..= i]`.
pub fn make_rolling_arrfunc(kernel: ElwiseReduceKernel, window: usize) -> Result<ArrFunc> {
  if window == 0 {
    return Err(Error::InvariantViolation("a rolling window must have a positive width".into()));
  }
  let kernel = Arc::new(kernel);
  Ok(ArrFunc::new(move |args: &[&Array]| {
    let [a] = args else {
      return Err(Error::InvariantViolation(format!(
        "a rolling arrfunc takes one argument, got {}", args.len())));
    };
    let a = a.eval()?;
    if a.ndim() != 1 {
      return Err(Error::Unsupported(
        "rolling evaluation applies to one-dimensional arrays".into()));
    }
    if a.element_type() != kernel.paramtypes[0] {
      return Err(Error::TypeMismatch(format!(
        "rolling kernel over {} cannot apply to {}", kernel.paramtypes[0], a.element_type())));
    }
    let n = a.dim_size(0)?;
    let out = Array::empty(&[n], kernel.return_type.clone())?;
    let (dst, dst_strides) = out.writable_parts()?;
    let shape = a.shape();
    let (src, src_strides) = a.readable_parts(&shape)?;
    let (dstride, sstride) = (dst_strides[0], src_strides[0]);
    let sentinel = make_sentinel(&kernel)?;
    let element_size = kernel.return_type.element_size();
    // Without an identity, each window seeds from its first element.
    let seed_kernel = match kernel.identity {
      Some(_) => None,
      None => Some(crate::kernels::assign::make_assignment_kernel(&kernel.return_type,
        &crate::types::Metadata::None, &kernel.paramtypes[0], &crate::types::Metadata::None,
        crate::kernels::assign::AssignErrorMode::None)?),
    };
    #[allow(clippy::cast_possible_wrap)]
    for i in 0..n.min(window - 1) {
      // Safety: the output owns n elements; the sentinel is one scalar of
      // the pod return type.
      unsafe {
        std::ptr::copy_nonoverlapping(sentinel.data_ptr().cast_const(),
          dst.offset(dstride * i as isize), element_size);
      }
    }
    #[allow(clippy::cast_possible_wrap)]
    for i in (window - 1)..n {
      let d = dst.wrapping_offset(dstride * i as isize);
      let s = src.wrapping_offset(sstride * (i + 1 - window) as isize);
      // Safety: the window [i+1-window, i] is in bounds, and d addresses
      // one live output element.
      unsafe {
        match (&kernel.identity, &seed_kernel) {
          (Some(identity), _) => {
            std::ptr::copy_nonoverlapping(identity.data_ptr().cast_const(), d, element_size);
            kernel.left_assoc_kernel.call(d, 0, s, sstride, window)?;
          }
          (None, Some(seed)) => {
            seed.call(d, 0, s, 0, 1)?;
            kernel.left_assoc_kernel.call(d, 0, s.offset(sstride), sstride, window - 1)?;
          }
          (None, None) => unreachable!("seed kernel built when there is no identity"),
        }
      }
    }
    Ok(out)
  }))
}

/// The prefix sentinel of a rolling reduction: NaN for float results, the
/// identity (or zero bytes) otherwise.
fn make_sentinel(kernel: &ElwiseReduceKernel) -> Result<Array> {
  if kernel.return_type.kind() == TypeKind::Real {
    let out = Array::empty(&[], kernel.return_type.clone())?;
    // Safety: the scalar was just constructed with the float's size.
    unsafe {
      crate::kernels::assign::write_num(
        match kernel.return_type { Type::Builtin(id) => id, _ => BuiltinId::Float64 },
        out.data_ptr(), crate::kernels::assign::Num::Real(f64::NAN),
        crate::kernels::assign::AssignErrorMode::None)?;
    }
    return Ok(out);
  }
  match &kernel.identity {
    Some(identity) => Ok(identity.clone()),
    None => Array::empty(&[], kernel.return_type.clone()),
  }
}

macro_rules! sum_kernel_arm {
  ($ty:ty) => {{
    let left = UnaryKernel::new(|dst: *mut u8, dst_stride, src: *const u8, src_stride, count| {
      let mut d = dst;
      let mut s = src;
      for _ in 0..count {
        // Safety: the caller guarantees `count` elements on both sides.
        unsafe {
          let acc = <$ty>::read_scalar(d) + <$ty>::read_scalar(s);
          <$ty>::write_scalar(d, acc);
          d = d.offset(dst_stride);
          s = s.offset(src_stride);
        }
      }
      Ok(())
    });
    Ok(ElwiseReduceKernel {
      associative: true,
      commutative: true,
      return_type: make_type::<$ty>(),
      paramtypes: vec![make_type::<$ty>()],
      identity: Some(Array::from(<$ty as Zero>::zero())),
      left_assoc_kernel: Arc::new(left),
      right_assoc_kernel: None,
    })
  }};
}

/// The builtin elementwise sum reduction over one numeric scalar type.
pub fn make_builtin_sum_reduce_kernel(id: BuiltinId) -> Result<ElwiseReduceKernel> {
  match id {
    BuiltinId::Int8 => sum_kernel_arm!(i8),
    BuiltinId::Int16 => sum_kernel_arm!(i16),
    BuiltinId::Int32 => sum_kernel_arm!(i32),
    BuiltinId::Int64 => sum_kernel_arm!(i64),
    BuiltinId::UInt8 => sum_kernel_arm!(u8),
    BuiltinId::UInt16 => sum_kernel_arm!(u16),
    BuiltinId::UInt32 => sum_kernel_arm!(u32),
    BuiltinId::UInt64 => sum_kernel_arm!(u64),
    BuiltinId::Float32 => sum_kernel_arm!(f32),
    BuiltinId::Float64 => sum_kernel_arm!(f64),
    BuiltinId::Complex64 => sum_kernel_arm!(Complex32),
    BuiltinId::Complex128 => sum_kernel_arm!(Complex64),
    BuiltinId::Bool => Err(Error::Unsupported("no sum reduction over bool".into())),
  }
}

macro_rules! max_kernel_arm {
  ($ty:ty) => {{
    let left = UnaryKernel::new(|dst: *mut u8, dst_stride, src: *const u8, src_stride, count| {
      let mut d = dst;
      let mut s = src;
      for _ in 0..count {
        // Safety: the caller guarantees `count` elements on both sides.
        unsafe {
          let v = <$ty>::read_scalar(s);
          if v > <$ty>::read_scalar(d) {
            <$ty>::write_scalar(d, v);
          }
          d = d.offset(dst_stride);
          s = s.offset(src_stride);
        }
      }
      Ok(())
    });
    Ok(ElwiseReduceKernel {
      associative: true,
      commutative: true,
      return_type: make_type::<$ty>(),
      paramtypes: vec![make_type::<$ty>()],
      identity: None,
      left_assoc_kernel: Arc::new(left),
      right_assoc_kernel: None,
    })
  }};
}

/// The builtin elementwise max reduction over one ordered scalar type.
pub fn make_builtin_max_reduce_kernel(id: BuiltinId) -> Result<ElwiseReduceKernel> {
  match id {
    BuiltinId::Int8 => max_kernel_arm!(i8),
    BuiltinId::Int16 => max_kernel_arm!(i16),
    BuiltinId::Int32 => max_kernel_arm!(i32),
    BuiltinId::Int64 => max_kernel_arm!(i64),
    BuiltinId::UInt8 => max_kernel_arm!(u8),
    BuiltinId::UInt16 => max_kernel_arm!(u16),
    BuiltinId::UInt32 => max_kernel_arm!(u32),
    BuiltinId::UInt64 => max_kernel_arm!(u64),
    BuiltinId::Float32 => max_kernel_arm!(f32),
    BuiltinId::Float64 => max_kernel_arm!(f64),
    _ => Err(Error::Unsupported(format!("no max reduction over {}", id.name()))),
  }
}
