//! The builtin scalar types.
//!
//! Builtin scalars are identified by a small integer id carried inline in
//! the [`Type`](super::Type) handle; element size, alignment and kind are
//! all derived from the id with no heap allocation.

use std::fmt;

use num::complex::{Complex32, Complex64};

use super::{Type, TypeId, TypeKind};

macro_rules! make_builtins {
  {$($(#[$attr:meta])* $x:ident($ty:ty): $name:literal, $size:expr, $align:expr, $kind:ident;)*} => {
    /// The id of a builtin scalar type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum BuiltinId { $($(#[$attr])* $x),* }

    impl BuiltinId {
      /// Every builtin id, in id order.
      pub const ALL: &'static [BuiltinId] = &[$(BuiltinId::$x),*];

      /// The size of one element in bytes.
      #[must_use] pub const fn element_size(self) -> usize {
        match self { $(BuiltinId::$x => $size),* }
      }

      /// The required data alignment.
      #[must_use] pub const fn alignment(self) -> usize {
        match self { $(BuiltinId::$x => $align),* }
      }

      /// The behavioral kind.
      #[must_use] pub const fn kind(self) -> TypeKind {
        match self { $(BuiltinId::$x => TypeKind::$kind),* }
      }

      /// The flat type id.
      #[must_use] pub const fn type_id(self) -> TypeId {
        match self { $(BuiltinId::$x => TypeId::$x),* }
      }

      /// The canonical name, as printed and parsed.
      #[must_use] pub const fn name(self) -> &'static str {
        match self { $(BuiltinId::$x => $name),* }
      }

      /// Looks up an id from its canonical name.
      #[must_use] pub fn from_name(s: &str) -> Option<Self> {
        match s {
          $($name => Some(BuiltinId::$x),)*
          _ => None,
        }
      }
    }
  }
}

make_builtins! {
  /// One-byte boolean, 0 or 1.
  Bool(bool): "bool", 1, 1, Bool;
  /// 8-bit signed integer.
  Int8(i8): "int8", 1, 1, Int;
  /// 16-bit signed integer.
  Int16(i16): "int16", 2, 2, Int;
  /// 32-bit signed integer.
  Int32(i32): "int32", 4, 4, Int;
  /// 64-bit signed integer.
  Int64(i64): "int64", 8, 8, Int;
  /// 8-bit unsigned integer.
  UInt8(u8): "uint8", 1, 1, UInt;
  /// 16-bit unsigned integer.
  UInt16(u16): "uint16", 2, 2, UInt;
  /// 32-bit unsigned integer.
  UInt32(u32): "uint32", 4, 4, UInt;
  /// 64-bit unsigned integer.
  UInt64(u64): "uint64", 8, 8, UInt;
  /// 32-bit float.
  Float32(f32): "float32", 4, 4, Real;
  /// 64-bit float.
  Float64(f64): "float64", 8, 8, Real;
  /// Complex of two 32-bit floats.
  Complex64(Complex32): "complex64", 8, 4, Complex;
  /// Complex of two 64-bit floats.
  Complex128(Complex64): "complex128", 16, 8, Complex;
}

/// A Rust scalar with a builtin array type.
///
/// The read/write operations use unaligned accesses so they remain correct
/// for elements packed inside structs or intermediate chain buffers.
pub trait BuiltinScalar: Copy + 'static {
  /// The id of the corresponding builtin type.
  const ID: BuiltinId;

  /// Reads one element.
  ///
  /// # Safety
  /// `p` must point at `element_size` readable bytes holding this scalar.
  unsafe fn read_scalar(p: *const u8) -> Self;

  /// Writes one element.
  ///
  /// # Safety
  /// `p` must point at `element_size` writable bytes.
  unsafe fn write_scalar(p: *mut u8, v: Self);
}

macro_rules! impl_builtin_scalar {
  ($($ty:ty => $id:ident,)*) => {$(
    impl BuiltinScalar for $ty {
      const ID: BuiltinId = BuiltinId::$id;
      unsafe fn read_scalar(p: *const u8) -> Self {
        unsafe { p.cast::<$ty>().read_unaligned() }
      }
      unsafe fn write_scalar(p: *mut u8, v: Self) {
        unsafe { p.cast::<$ty>().write_unaligned(v) }
      }
    }
  )*}
}

impl_builtin_scalar! {
  i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
  u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
  f32 => Float32, f64 => Float64,
  Complex32 => Complex64, Complex64 => Complex128,
}

impl BuiltinScalar for bool {
  const ID: BuiltinId = BuiltinId::Bool;
  unsafe fn read_scalar(p: *const u8) -> Self {
    unsafe { p.read() != 0 }
  }
  unsafe fn write_scalar(p: *mut u8, v: Self) {
    unsafe { p.write(u8::from(v)) }
  }
}

/// The type handle of a builtin scalar.
#[must_use] pub fn make_type<T: BuiltinScalar>() -> Type {
  Type::Builtin(T::ID)
}

/// Formats one builtin scalar element.
///
/// # Safety
/// `data` must point at a live element of the builtin type `id`.
pub(crate) unsafe fn print_builtin_scalar(id: BuiltinId, f: &mut fmt::Formatter<'_>,
    data: *const u8) -> fmt::Result {
  unsafe {
    match id {
      BuiltinId::Bool => write!(f, "{}", bool::read_scalar(data)),
      BuiltinId::Int8 => write!(f, "{}", i8::read_scalar(data)),
      BuiltinId::Int16 => write!(f, "{}", i16::read_scalar(data)),
      BuiltinId::Int32 => write!(f, "{}", i32::read_scalar(data)),
      BuiltinId::Int64 => write!(f, "{}", i64::read_scalar(data)),
      BuiltinId::UInt8 => write!(f, "{}", u8::read_scalar(data)),
      BuiltinId::UInt16 => write!(f, "{}", u16::read_scalar(data)),
      BuiltinId::UInt32 => write!(f, "{}", u32::read_scalar(data)),
      BuiltinId::UInt64 => write!(f, "{}", u64::read_scalar(data)),
      BuiltinId::Float32 => write!(f, "{}", f32::read_scalar(data)),
      BuiltinId::Float64 => write!(f, "{}", f64::read_scalar(data)),
      BuiltinId::Complex64 => write!(f, "{}", Complex32::read_scalar(data)),
      BuiltinId::Complex128 => write!(f, "{}", Complex64::read_scalar(data)),
    }
  }
}

/// Renders one builtin scalar element as text, the same way assignment
/// into a string type formats it.
///
/// # Safety
/// `data` must point at a live element of the builtin type `id`.
pub(crate) unsafe fn builtin_scalar_to_string(id: BuiltinId, data: *const u8) -> String {
  unsafe {
    match id {
      BuiltinId::Bool => bool::read_scalar(data).to_string(),
      BuiltinId::Int8 => i8::read_scalar(data).to_string(),
      BuiltinId::Int16 => i16::read_scalar(data).to_string(),
      BuiltinId::Int32 => i32::read_scalar(data).to_string(),
      BuiltinId::Int64 => i64::read_scalar(data).to_string(),
      BuiltinId::UInt8 => u8::read_scalar(data).to_string(),
      BuiltinId::UInt16 => u16::read_scalar(data).to_string(),
      BuiltinId::UInt32 => u32::read_scalar(data).to_string(),
      BuiltinId::UInt64 => u64::read_scalar(data).to_string(),
      BuiltinId::Float32 => f32::read_scalar(data).to_string(),
      BuiltinId::Float64 => f64::read_scalar(data).to_string(),
      BuiltinId::Complex64 => Complex32::read_scalar(data).to_string(),
      BuiltinId::Complex128 => Complex64::read_scalar(data).to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sizes_and_alignments() {
    assert_eq!(BuiltinId::Bool.element_size(), 1);
    assert_eq!(BuiltinId::Int64.element_size(), 8);
    assert_eq!(BuiltinId::Complex64.element_size(), 8);
    assert_eq!(BuiltinId::Complex64.alignment(), 4);
    assert_eq!(BuiltinId::Complex128.element_size(), 16);
    assert_eq!(BuiltinId::Complex128.alignment(), 8);
  }

  #[test]
  fn names_round_trip() {
    for &id in BuiltinId::ALL {
      assert_eq!(BuiltinId::from_name(id.name()), Some(id));
    }
    assert_eq!(BuiltinId::from_name("int128"), None);
  }

  #[test]
  fn unaligned_read_write() {
    let mut buf = [0u8; 17];
    unsafe {
      f64::write_scalar(buf.as_mut_ptr().add(1), 2.5);
      assert_eq!(f64::read_scalar(buf.as_ptr().add(1)), 2.5);
      bool::write_scalar(buf.as_mut_ptr(), true);
      assert!(bool::read_scalar(buf.as_ptr()));
    }
  }
}
