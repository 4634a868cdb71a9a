//! The crate-wide error taxonomy.
//!
//! Every fallible operation in the engine reports through [`Error`]; failures
//! propagate synchronously to the outermost call with no retries or fallbacks.
//! Partially constructed metadata and data are unwound before an error leaves
//! the constructing function.

use thiserror::Error;
use crate::kernels::assign::AssignErrorMode;
use crate::types::Type;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the array engine.
#[derive(Debug, Error)]
pub enum Error {
  /// No conversion path exists between the two types.
  #[error("cannot assign from {src} to {dst}")]
  CannotAssign {
    /// The destination type of the attempted assignment.
    dst: Type,
    /// The source type of the attempted assignment.
    src: Type,
  },
  /// A type-level disagreement: a kernel lookup found no match, a value was
  /// outside a categorical's category set, or a slice dimension disagreed
  /// with the type's declared dimension size.
  #[error("type mismatch: {0}")]
  TypeMismatch(String),
  /// A numeric value would lose information above the threshold permitted
  /// by the active error mode.
  #[error("value {value} is out of range for assignment to {dst} with error mode {mode}")]
  OutOfRange {
    /// Rendering of the offending value.
    value: String,
    /// The destination type.
    dst: Type,
    /// The error mode that was in effect.
    mode: AssignErrorMode,
  },
  /// A memory-block page could not be acquired. Block bookkeeping is
  /// reverted before this propagates.
  #[error("memory block allocation of {size} bytes failed")]
  AllocationFailure {
    /// The requested allocation size in bytes.
    size: usize,
  },
  /// Misuse of an engine protocol: resize of a non-most-recent allocation,
  /// use of a finalized block, operand arity mismatch, or a write through a
  /// view without write access.
  #[error("invariant violation: {0}")]
  InvariantViolation(String),
  /// A single index or range start fell outside the axis. Negative indices
  /// are rejected rather than wrapped.
  #[error("index {index} is out of bounds for axis {axis} with size {size}")]
  IndexOutOfBounds {
    /// The offending index value.
    index: isize,
    /// Which axis it was applied to.
    axis: usize,
    /// The size of that axis.
    size: usize,
  },
  /// Two shapes could not be brought together under the broadcasting rules.
  #[error("shapes {lhs:?} and {rhs:?} are not broadcast-compatible")]
  BroadcastMismatch {
    /// The left/destination shape.
    lhs: Vec<usize>,
    /// The right/source shape.
    rhs: Vec<usize>,
  },
  /// Text did not match the grammar it was parsed against.
  #[error("cannot parse {input:?} as {expected}")]
  Parse {
    /// The input text.
    input: String,
    /// What the text was expected to be.
    expected: &'static str,
  },
  /// The operation is declared by the interface but not implemented for the
  /// participating types.
  #[error("unsupported operation: {0}")]
  Unsupported(String),
}
