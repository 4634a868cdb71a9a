//! The assignment engine: type-pair dispatch producing unary kernels for
//! `dst <- src` under one of four error modes.
//!
//! Resolution order: identical pod types get a memcpy kernel; builtin pairs
//! get a numeric conversion kernel honoring the error mode; expression
//! kinds decompose into the chain `src.storage -> src.value -> dst.value ->
//! dst.storage`; everything else goes through the virtual dispatch of the
//! composite types on either side. When no path exists the assignment fails
//! with the types involved.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use num::complex::Complex64 as C64;

use crate::error::{Error, Result};
use crate::types::builtin::{BuiltinId, BuiltinScalar};
use crate::types::{MemoryManagement, Metadata, Type, TypeFlags, TypeKind};

use super::chain::{make_chained_unary_kernel, push_back_value_to_storage,
  push_front_storage_to_value};
use super::{CompareKernel, UnaryKernel, make_pod_copy_kernel};

/// How strictly a numeric assignment checks for information loss. The
/// variants are ordered by monotone strictness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssignErrorMode {
  /// No checking: casts truncate and saturate silently.
  None,
  /// Values outside the destination's range are errors.
  Overflow,
  /// Overflow checking, plus losing a fractional part is an error.
  #[default]
  Fractional,
  /// Any difference between source and converted value is an error.
  Inexact,
}

impl fmt::Display for AssignErrorMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      AssignErrorMode::None => "none",
      AssignErrorMode::Overflow => "overflow",
      AssignErrorMode::Fractional => "fractional",
      AssignErrorMode::Inexact => "inexact",
    })
  }
}

/// A builtin scalar read into its widest exact representation, so one
/// conversion routine serves every builtin pair.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Num {
  /// Any integer or boolean value.
  Int(i128),
  /// Any float value.
  Real(f64),
  /// Any complex value.
  Complex(C64),
}

impl fmt::Display for Num {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Num::Int(v) => write!(f, "{v}"),
      Num::Real(v) => write!(f, "{v}"),
      Num::Complex(v) => write!(f, "{v}"),
    }
  }
}

/// Reads one builtin element into a [`Num`]. All reads are exact.
///
/// # Safety
/// `p` must point at a live element of the builtin type `id`.
pub(crate) unsafe fn read_num(id: BuiltinId, p: *const u8) -> Num {
  unsafe {
    match id {
      BuiltinId::Bool => Num::Int(i128::from(bool::read_scalar(p))),
      BuiltinId::Int8 => Num::Int(i128::from(i8::read_scalar(p))),
      BuiltinId::Int16 => Num::Int(i128::from(i16::read_scalar(p))),
      BuiltinId::Int32 => Num::Int(i128::from(i32::read_scalar(p))),
      BuiltinId::Int64 => Num::Int(i128::from(i64::read_scalar(p))),
      BuiltinId::UInt8 => Num::Int(i128::from(u8::read_scalar(p))),
      BuiltinId::UInt16 => Num::Int(i128::from(u16::read_scalar(p))),
      BuiltinId::UInt32 => Num::Int(i128::from(u32::read_scalar(p))),
      BuiltinId::UInt64 => Num::Int(i128::from(u64::read_scalar(p))),
      BuiltinId::Float32 => Num::Real(f64::from(f32::read_scalar(p))),
      BuiltinId::Float64 => Num::Real(f64::read_scalar(p)),
      BuiltinId::Complex64 => {
        let c = num::complex::Complex32::read_scalar(p);
        Num::Complex(C64::new(f64::from(c.re), f64::from(c.im)))
      }
      BuiltinId::Complex128 => Num::Complex(C64::read_scalar(p)),
    }
  }
}

fn out_of_range(v: impl fmt::Display, dst: BuiltinId, mode: AssignErrorMode) -> Error {
  Error::OutOfRange { value: v.to_string(), dst: Type::Builtin(dst), mode }
}

/// Collapses a complex down to its real part per the error mode.
fn demote_complex(v: Num, dst: BuiltinId, mode: AssignErrorMode) -> Result<Num> {
  match v {
    Num::Complex(c) => {
      if mode != AssignErrorMode::None && c.im != 0.0 {
        return Err(out_of_range(c, dst, mode));
      }
      Ok(Num::Real(c.re))
    }
    other => Ok(other),
  }
}

macro_rules! write_int_arm {
  ($ty:ty, $p:expr, $v:expr, $mode:expr, $id:expr) => {{
    let p = $p;
    let mode = $mode;
    match demote_complex($v, $id, mode)? {
      Num::Int(i) => match <$ty>::try_from(i) {
        Ok(x) => unsafe { <$ty>::write_scalar(p, x) },
        Err(_) if mode == AssignErrorMode::None =>
          unsafe { <$ty>::write_scalar(p, i as $ty) },
        Err(_) => return Err(out_of_range(i, $id, mode)),
      },
      Num::Real(r) => {
        if mode >= AssignErrorMode::Fractional && r.fract() != 0.0 {
          return Err(out_of_range(r, $id, mode));
        }
        let t = r.trunc();
        if mode == AssignErrorMode::None {
          // Float-to-int `as` casts saturate, matching unchecked semantics.
          unsafe { <$ty>::write_scalar(p, t as $ty) }
        } else if t >= <$ty>::MIN as f64 && t <= <$ty>::MAX as f64 && !t.is_nan() {
          unsafe { <$ty>::write_scalar(p, t as $ty) }
        } else {
          return Err(out_of_range(r, $id, mode));
        }
      }
      Num::Complex(_) => unreachable!("demoted above"),
    }
  }};
}

fn real_to_f32(r: f64, mode: AssignErrorMode) -> Result<f32> {
  let narrowed = r as f32;
  if mode >= AssignErrorMode::Overflow && r.is_finite() && narrowed.is_infinite() {
    return Err(out_of_range(r, BuiltinId::Float32, mode));
  }
  if mode == AssignErrorMode::Inexact && f64::from(narrowed) != r && !r.is_nan() {
    return Err(out_of_range(r, BuiltinId::Float32, mode));
  }
  Ok(narrowed)
}

#[allow(clippy::cast_precision_loss)]
fn int_to_real(i: i128, mode: AssignErrorMode, dst: BuiltinId) -> Result<f64> {
  let r = i as f64;
  if mode == AssignErrorMode::Inexact && r as i128 != i {
    return Err(out_of_range(i, dst, mode));
  }
  Ok(r)
}

/// Writes a [`Num`] into one builtin element, honoring the error mode.
///
/// # Safety
/// `p` must point at a writable element of the builtin type `id`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) unsafe fn write_num(id: BuiltinId, p: *mut u8, v: Num, mode: AssignErrorMode)
    -> Result<()> {
  match id {
    BuiltinId::Bool => {
      let truth = match demote_complex(v, id, mode)? {
        Num::Int(i) => {
          if mode != AssignErrorMode::None && i != 0 && i != 1 {
            return Err(out_of_range(i, id, mode));
          }
          i != 0
        }
        Num::Real(r) => {
          if mode != AssignErrorMode::None && r != 0.0 && r != 1.0 {
            return Err(out_of_range(r, id, mode));
          }
          r != 0.0
        }
        Num::Complex(_) => unreachable!("demoted above"),
      };
      unsafe { bool::write_scalar(p, truth) }
    }
    BuiltinId::Int8 => write_int_arm!(i8, p, v, mode, id),
    BuiltinId::Int16 => write_int_arm!(i16, p, v, mode, id),
    BuiltinId::Int32 => write_int_arm!(i32, p, v, mode, id),
    BuiltinId::Int64 => write_int_arm!(i64, p, v, mode, id),
    BuiltinId::UInt8 => write_int_arm!(u8, p, v, mode, id),
    BuiltinId::UInt16 => write_int_arm!(u16, p, v, mode, id),
    BuiltinId::UInt32 => write_int_arm!(u32, p, v, mode, id),
    BuiltinId::UInt64 => write_int_arm!(u64, p, v, mode, id),
    BuiltinId::Float32 => {
      let r = match demote_complex(v, id, mode)? {
        Num::Int(i) => int_to_real(i, mode, id)?,
        Num::Real(r) => r,
        Num::Complex(_) => unreachable!("demoted above"),
      };
      unsafe { f32::write_scalar(p, real_to_f32(r, mode)?) }
    }
    BuiltinId::Float64 => {
      let r = match demote_complex(v, id, mode)? {
        Num::Int(i) => int_to_real(i, mode, id)?,
        Num::Real(r) => r,
        Num::Complex(_) => unreachable!("demoted above"),
      };
      unsafe { f64::write_scalar(p, r) }
    }
    BuiltinId::Complex64 => {
      let c = match v {
        Num::Int(i) => C64::new(int_to_real(i, mode, id)?, 0.0),
        Num::Real(r) => C64::new(r, 0.0),
        Num::Complex(c) => c,
      };
      let narrowed =
        num::complex::Complex32::new(real_to_f32(c.re, mode)?, real_to_f32(c.im, mode)?);
      unsafe { num::complex::Complex32::write_scalar(p, narrowed) }
    }
    BuiltinId::Complex128 => {
      let c = match v {
        Num::Int(i) => C64::new(int_to_real(i, mode, id)?, 0.0),
        Num::Real(r) => C64::new(r, 0.0),
        Num::Complex(c) => c,
      };
      unsafe { C64::write_scalar(p, c) }
    }
  }
  Ok(())
}

/// Parses numeric text into a [`Num`]: an integer when it looks integral,
/// a float otherwise, or `true`/`false` for booleans.
pub(crate) fn parse_num(text: &str) -> Result<Num> {
  let t = text.trim();
  match t {
    "true" => return Ok(Num::Int(1)),
    "false" => return Ok(Num::Int(0)),
    _ => {}
  }
  if let Ok(i) = t.parse::<i128>() {
    return Ok(Num::Int(i));
  }
  if let Ok(r) = t.parse::<f64>() {
    return Ok(Num::Real(r));
  }
  Err(Error::Parse { input: text.into(), expected: "a number" })
}

/// The conversion kernel between two builtin scalar types.
pub fn builtin_assignment_kernel(dst: BuiltinId, src: BuiltinId, errmode: AssignErrorMode)
    -> Result<UnaryKernel> {
  if dst == src {
    return Ok(make_pod_copy_kernel(dst.element_size()));
  }
  Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
    let mut d = dp;
    let mut s = sp;
    for _ in 0..count {
      // Safety: the caller guarantees `count` elements on both sides.
      unsafe {
        write_num(dst, d, read_num(src, s), errmode)?;
        d = d.offset(dst_stride);
        s = s.offset(src_stride);
      }
    }
    Ok(())
  }))
}

/// A total-order comparison kernel for a builtin scalar type. Floats use
/// IEEE total ordering; complex values have no order.
pub fn builtin_comparison_kernel(id: BuiltinId) -> Result<CompareKernel> {
  match id.kind() {
    TypeKind::Bool | TypeKind::Int | TypeKind::UInt => {
      Ok(CompareKernel::new(move |a, b| {
        // Safety: the caller guarantees both pointers address live elements.
        let (x, y) = unsafe { (read_num(id, a), read_num(id, b)) };
        match (x, y) {
          (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
          _ => unreachable!("integer kinds read as Num::Int"),
        }
      }))
    }
    TypeKind::Real => {
      Ok(CompareKernel::new(move |a, b| {
        let (x, y) = unsafe { (read_num(id, a), read_num(id, b)) };
        match (x, y) {
          (Num::Real(x), Num::Real(y)) => Ok(x.total_cmp(&y)),
          _ => unreachable!("real kinds read as Num::Real"),
        }
      }))
    }
    _ => Err(Error::Unsupported(format!("no ordering for {}", id.name()))),
  }
}

/// Produces the kernel assigning `src` elements into `dst` elements under
/// the given error mode, or fails with a taxonomied error when no
/// conversion path exists.
pub fn make_assignment_kernel(dst: &Type, dst_meta: &Metadata, src: &Type, src_meta: &Metadata,
    errmode: AssignErrorMode) -> Result<UnaryKernel> {
  // Identical pod types copy bytes.
  if dst == src && dst.memory_management() == MemoryManagement::Pod
      && !dst.flags().contains(TypeFlags::DESTRUCTOR) && dst.element_size() > 0 {
    return Ok(make_pod_copy_kernel(dst.element_size()));
  }
  if let (Type::Builtin(d), Type::Builtin(s)) = (dst, src) {
    return builtin_assignment_kernel(*d, *s, errmode);
  }
  if dst.is_expression() || src.is_expression() {
    return make_expression_assignment_kernel(dst, dst_meta, src, src_meta, errmode);
  }
  // Virtual dispatch: destination side first, then source side. A
  // destination that merely does not know the source falls through.
  if let Type::Heap(t) = dst {
    match t.make_assignment_kernel(dst, dst_meta, src, src_meta, errmode) {
      Err(Error::CannotAssign { .. }) if src.extended().is_some() => {}
      r => return r,
    }
  }
  if let Type::Heap(t) = src {
    return t.make_assignment_kernel(dst, dst_meta, src, src_meta, errmode);
  }
  Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
}

/// Builds the chain `src.storage -> src.value -> dst.value -> dst.storage`
/// for assignments with an expression kind on either side.
fn make_expression_assignment_kernel(dst: &Type, dst_meta: &Metadata, src: &Type,
    src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
  let mut kernels = VecDeque::new();
  let mut sizes = VecDeque::new();
  if src.is_expression() {
    push_front_storage_to_value(src, src_meta, &mut kernels, &mut sizes)?;
  }
  let src_value = src.value_type();
  let dst_value = dst.value_type();
  if src_value != dst_value {
    // The bridge writes straight into the destination unless the
    // destination is itself an expression, in which case it feeds the
    // value-to-storage chain through an intermediate with fresh metadata.
    let bridge_meta_owned;
    let bridge_dst_meta = if dst.is_expression() {
      bridge_meta_owned = dst_value.metadata_default_construct(0, &[])?;
      &bridge_meta_owned
    } else {
      dst_meta
    };
    let bridge_src_meta = if src.is_expression() { &Metadata::None } else { src_meta };
    let bridge =
      make_assignment_kernel(&dst_value, bridge_dst_meta, &src_value, bridge_src_meta, errmode)?;
    if !kernels.is_empty() {
      sizes.push_back(src_value.element_size());
    }
    kernels.push_back(bridge);
  }
  if dst.is_expression() {
    push_back_value_to_storage(dst, dst_meta, &mut kernels, &mut sizes)?;
  }
  make_chained_unary_kernel(&mut kernels, &mut sizes)
}

/// Whether assignment from `src` into `dst` can never lose information.
///
/// String and categorical pairs deliberately report false in both
/// directions so every such assignment validates its values.
#[must_use] pub fn is_lossless_assignment(dst: &Type, src: &Type) -> bool {
  if let (Type::Builtin(d), Type::Builtin(s)) = (dst, src) {
    return builtin_lossless(*d, *s);
  }
  if dst == src && !dst.is_expression()
      && dst.memory_management() == MemoryManagement::Pod {
    return true;
  }
  if let Type::Heap(t) = dst {
    if t.is_lossless_assignment(dst, src) {
      return true;
    }
  }
  if let Type::Heap(t) = src {
    return t.is_lossless_assignment(dst, src);
  }
  false
}

/// Mantissa width of a float type, the largest integer size it can hold
/// exactly.
fn mantissa_bits(id: BuiltinId) -> u32 {
  match id {
    BuiltinId::Float32 | BuiltinId::Complex64 => 24,
    _ => 53,
  }
}

fn builtin_lossless(dst: BuiltinId, src: BuiltinId) -> bool {
  use TypeKind::*;
  if dst == src {
    return true;
  }
  let (dk, sk) = (dst.kind(), src.kind());
  let (dsz, ssz) = (dst.element_size(), src.element_size());
  match (dk, sk) {
    (_, Bool) => true,
    (Bool, _) => false,
    (Int, Int) | (UInt, UInt) => dsz >= ssz,
    (Int, UInt) => dsz > ssz,
    (UInt, Int) => false,
    (Real, Int | UInt) | (Complex, Int | UInt) =>
      (ssz as u32) * 8 <= mantissa_bits(dst) + u32::from(sk == Int),
    (Real, Real) => dsz >= ssz,
    (Complex, Real) => mantissa_bits(dst) >= mantissa_bits(src),
    (Complex, Complex) => dsz >= ssz,
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  unsafe fn convert<S: BuiltinScalar, D: BuiltinScalar>(v: S, mode: AssignErrorMode)
      -> Result<D> {
    let k = builtin_assignment_kernel(D::ID, S::ID, mode)?;
    let mut out = [0u8; 16];
    let mut inp = [0u8; 16];
    unsafe {
      S::write_scalar(inp.as_mut_ptr(), v);
      k.call(out.as_mut_ptr(), 0, inp.as_ptr(), 0, 1)?;
      Ok(D::read_scalar(out.as_ptr()))
    }
  }

  #[test]
  fn widening_is_exact() {
    unsafe {
      assert_eq!(convert::<i8, i64>(-5, AssignErrorMode::Inexact).unwrap(), -5);
      assert_eq!(convert::<u16, f64>(40000, AssignErrorMode::Inexact).unwrap(), 40000.0);
      assert_eq!(convert::<f32, f64>(0.5, AssignErrorMode::Inexact).unwrap(), 0.5);
    }
  }

  #[test]
  fn overflow_mode_rejects_narrowing_overflow() {
    unsafe {
      assert!(convert::<i32, i8>(300, AssignErrorMode::Overflow).is_err());
      assert!(convert::<i32, u8>(-1, AssignErrorMode::Overflow).is_err());
      // Unchecked mode wraps instead.
      assert_eq!(convert::<i32, i8>(300, AssignErrorMode::None).unwrap(), 44);
      // In-range narrowing is fine.
      assert_eq!(convert::<i32, i8>(-100, AssignErrorMode::Overflow).unwrap(), -100);
    }
  }

  #[test]
  fn fractional_mode_rejects_truncation() {
    unsafe {
      assert!(convert::<f64, i32>(2.5, AssignErrorMode::Fractional).is_err());
      assert_eq!(convert::<f64, i32>(2.0, AssignErrorMode::Fractional).unwrap(), 2);
      // Overflow mode permits truncation.
      assert_eq!(convert::<f64, i32>(2.5, AssignErrorMode::Overflow).unwrap(), 2);
      // Unchecked mode saturates.
      assert_eq!(convert::<f64, i32>(1e300, AssignErrorMode::None).unwrap(), i32::MAX);
    }
  }

  #[test]
  fn inexact_mode_rejects_precision_loss() {
    unsafe {
      assert!(convert::<i64, f64>((1 << 53) + 1, AssignErrorMode::Inexact).is_err());
      assert_eq!(convert::<i64, f64>(1 << 53, AssignErrorMode::Inexact).unwrap(),
        9007199254740992.0);
      assert!(convert::<f64, f32>(1e-300, AssignErrorMode::Inexact).is_err());
      assert!(convert::<f64, f32>(1e300, AssignErrorMode::Overflow).is_err());
      assert_eq!(convert::<f64, f32>(0.25, AssignErrorMode::Inexact).unwrap(), 0.25);
    }
  }

  #[test]
  fn bool_is_strict_above_none() {
    unsafe {
      assert!(convert::<i32, bool>(2, AssignErrorMode::Overflow).is_err());
      assert!(convert::<i32, bool>(1, AssignErrorMode::Overflow).unwrap());
      assert!(!convert::<i32, bool>(0, AssignErrorMode::Inexact).unwrap());
      assert!(convert::<i32, bool>(2, AssignErrorMode::None).unwrap());
    }
  }

  #[test]
  fn complex_to_real_requires_zero_imaginary() {
    use num::complex::Complex32;
    unsafe {
      let c = Complex32::new(1.5, 0.0);
      assert_eq!(convert::<Complex32, f64>(c, AssignErrorMode::Inexact).unwrap(), 1.5);
      let c = Complex32::new(1.5, 2.0);
      assert!(convert::<Complex32, f64>(c, AssignErrorMode::Overflow).is_err());
      assert_eq!(convert::<Complex32, f64>(c, AssignErrorMode::None).unwrap(), 1.5);
    }
  }

  #[test]
  fn lossless_table_spot_checks() {
    use crate::types::make_type;
    assert!(is_lossless_assignment(&make_type::<i64>(), &make_type::<i32>()));
    assert!(!is_lossless_assignment(&make_type::<i32>(), &make_type::<i64>()));
    assert!(is_lossless_assignment(&make_type::<i32>(), &make_type::<u16>()));
    assert!(!is_lossless_assignment(&make_type::<u32>(), &make_type::<i32>()));
    assert!(is_lossless_assignment(&make_type::<f64>(), &make_type::<i32>()));
    assert!(!is_lossless_assignment(&make_type::<f32>(), &make_type::<i32>()));
    assert!(is_lossless_assignment(&make_type::<f64>(), &make_type::<f32>()));
    assert!(!is_lossless_assignment(&make_type::<f32>(), &make_type::<f64>()));
  }

  #[test]
  fn parse_num_forms() {
    assert!(matches!(parse_num("42"), Ok(Num::Int(42))));
    assert!(matches!(parse_num(" -7 "), Ok(Num::Int(-7))));
    assert!(matches!(parse_num("2.5"), Ok(Num::Real(_))));
    assert!(matches!(parse_num("true"), Ok(Num::Int(1))));
    assert!(parse_num("pelican").is_err());
  }
}
