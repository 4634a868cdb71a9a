//! A dynamically typed n-dimensional array engine.
//!
//! An array value is a triple of (type descriptor, metadata instance, raw
//! byte buffer) whose lifetimes are tracked by reference-counted memory
//! blocks. Storage is decoupled from type, and type is decoupled from the
//! expression being evaluated: expression-kind types carry implicit
//! storage-to-value conversions which are lowered to chains of unary
//! kernels with intermediate buffers.
//!
//! The subsystems, leaves first:
//!
//! * [`memblock`] — reference-counted buffer descriptors with fixed, pod
//!   bump, zeroinit bump, and array-preamble disciplines.
//! * [`types`] — the open type system: inline builtin scalar ids plus
//!   reference-counted composite types with virtual operations.
//! * [`irange`] — the declarative slicing value.
//! * [`kernels`] — kernel instances, chained unary kernels, and the
//!   assignment engine with its four error modes.
//! * [`nodes`] — the expression-node graph transformed under slicing and
//!   casting and lowered for evaluation.
//! * [`gfunc`] — element-wise and reducing general functions, and
//!   rolling-window evaluation.
//! * [`array`] — the user-facing array value.
//!
//! Everything evaluates synchronously on the calling thread; types and
//! blocks may be shared across threads, while data access requires
//! external synchronization.

#![warn(missing_docs)]
#![warn(unused_qualifications)]

pub mod array;
pub mod error;
pub mod gfunc;
pub mod irange;
pub mod kernels;
pub mod memblock;
pub mod nodes;
pub mod types;

/// Shape vector, small enough to avoid allocation for typical ranks.
pub(crate) type Shape = smallvec::SmallVec<[usize; 4]>;
/// Stride vector, in bytes.
pub(crate) type Strides = smallvec::SmallVec<[isize; 4]>;

pub use array::{AccessFlags, Array, ScalarValue};
pub use error::{Error, Result};
pub use gfunc::{
  ArrFunc, ElwiseGfunc, ElwiseKernel, ElwiseReduceGfunc, ElwiseReduceKernel,
  make_rolling_arrfunc,
};
pub use irange::IRange;
pub use kernels::assign::{AssignErrorMode, is_lossless_assignment};
pub use types::{
  BuiltinId, Metadata, StringEncoding, Type, TypeFlags, TypeId, TypeKind, datetime_struct_type,
  factor_categorical, make_bytes, make_categorical, make_convert, make_fixedstring,
  make_string, make_strided_of, make_struct, make_type, make_type_of_type, make_view,
};
