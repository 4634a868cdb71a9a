//! The index-range value used to describe slicing declaratively.
//!
//! An [`IRange`] is either a single index (step 0, removes the axis it
//! indexes) or the set of indices `{start, start + step, ...}` bounded by
//! `finish`: exclusive above when the step is positive, exclusive below when
//! the step is negative. Open ends are expressed with sentinels so that a
//! default-constructed range means "the whole axis" regardless of the axis
//! size or iteration direction.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// A range of indices, or a single index.
///
/// Typical ways to construct ranges:
///
/// ```
/// use dynarr::IRange;
///
/// IRange::full();                // the full index range
/// IRange::from(3);               // the single index 3 (removes the axis)
/// IRange::from(2..10);           // the index range [2, 10)
/// IRange::from(3..).by(2);       // the indices {3, 5, 7, ...}
/// IRange::full().by(-1);         // the whole axis, reversed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IRange {
  start: isize,
  finish: isize,
  step: isize,
}

impl IRange {
  /// Sentinel for an open lower end.
  pub const OPEN_START: isize = isize::MIN;
  /// Sentinel for an open upper end.
  pub const OPEN_FINISH: isize = isize::MAX;

  /// The full index range over an axis.
  #[must_use] pub const fn full() -> Self {
    Self { start: Self::OPEN_START, finish: Self::OPEN_FINISH, step: 1 }
  }

  /// A single index. Selecting with this removes the axis.
  #[must_use] pub const fn index(idx: isize) -> Self {
    Self { start: idx, finish: idx, step: 0 }
  }

  /// An explicit `(start, finish, step)` range.
  #[must_use] pub const fn new(start: isize, finish: isize, step: isize) -> Self {
    Self { start, finish, step }
  }

  /// The start of the range, or the selected index when the step is 0.
  #[must_use] pub const fn start(&self) -> isize { self.start }

  /// The exclusive bound of the range.
  #[must_use] pub const fn finish(&self) -> isize { self.finish }

  /// The step between selected indices. 0 means single-index selection.
  #[must_use] pub const fn step(&self) -> isize { self.step }

  /// Replaces the step of the range. Think of it as the word "by":
  /// `IRange::from(3..10).by(2)` selects `{3, 5, 7, 9}`.
  #[must_use] pub const fn by(self, step: isize) -> Self {
    Self { start: self.start, finish: self.finish, step }
  }

  /// Whether this is a single-index selection.
  #[must_use] pub const fn is_single_index(&self) -> bool { self.step == 0 }
}

impl Default for IRange {
  fn default() -> Self { Self::full() }
}

impl From<isize> for IRange {
  fn from(idx: isize) -> Self { Self::index(idx) }
}

impl From<usize> for IRange {
  #[allow(clippy::cast_possible_wrap)]
  fn from(idx: usize) -> Self { Self::index(idx as isize) }
}

impl From<i32> for IRange {
  fn from(idx: i32) -> Self { Self::index(idx as isize) }
}

impl From<RangeFull> for IRange {
  fn from(_: RangeFull) -> Self { Self::full() }
}

impl From<Range<isize>> for IRange {
  fn from(r: Range<isize>) -> Self { Self::new(r.start, r.end, 1) }
}

impl From<Range<i32>> for IRange {
  fn from(r: Range<i32>) -> Self { Self::new(r.start as isize, r.end as isize, 1) }
}

impl From<RangeFrom<isize>> for IRange {
  fn from(r: RangeFrom<isize>) -> Self { Self::new(r.start, Self::OPEN_FINISH, 1) }
}

impl From<RangeFrom<i32>> for IRange {
  fn from(r: RangeFrom<i32>) -> Self { Self::new(r.start as isize, Self::OPEN_FINISH, 1) }
}

impl From<RangeTo<isize>> for IRange {
  fn from(r: RangeTo<isize>) -> Self { Self::new(Self::OPEN_START, r.end, 1) }
}

impl From<RangeTo<i32>> for IRange {
  fn from(r: RangeTo<i32>) -> Self { Self::new(Self::OPEN_START, r.end as isize, 1) }
}

/// The result of resolving an [`IRange`] against a concrete axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedRange {
  /// First selected index.
  pub start: isize,
  /// Number of selected indices.
  pub size: usize,
  /// Step between selected indices (nonzero).
  pub step: isize,
}

impl IRange {
  /// Resolves the range against an axis of the given size, applying the
  /// clamping rules: an out-of-range finish is clamped to the axis size, an
  /// out-of-range start yields an empty result, and when the step is
  /// negative the finish is exclusive below the start. Negative
  /// (non-sentinel) bounds are rejected by the caller before this runs.
  #[allow(clippy::cast_sign_loss)]
  pub(crate) fn resolve(&self, size: usize) -> ResolvedRange {
    debug_assert!(self.step != 0, "single indices are resolved by the caller");
    let n = size as isize;
    if self.step > 0 {
      let start = if self.start == Self::OPEN_START { 0 } else { self.start.min(n) };
      let finish = if self.finish == Self::OPEN_FINISH { n } else { self.finish.min(n) };
      let count = if start >= finish { 0 } else { (finish - start + self.step - 1) / self.step };
      ResolvedRange { start, size: count as usize, step: self.step }
    } else {
      // Reversed iteration: an open start means the last element, and the
      // finish bound is exclusive below.
      let start = if self.start == Self::OPEN_START || self.start == Self::OPEN_FINISH {
        n - 1
      } else {
        self.start.min(n - 1)
      };
      let finish = if self.finish == Self::OPEN_FINISH || self.finish == Self::OPEN_START {
        -1
      } else {
        self.finish.max(-1)
      };
      let count = if start <= finish { 0 } else { (start - finish - self.step - 1) / -self.step };
      ResolvedRange { start, size: count as usize, step: self.step }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn construction_forms() {
    assert_eq!(IRange::from(3), IRange::new(3, 3, 0));
    assert!(IRange::from(3).is_single_index());
    assert_eq!(IRange::from(2..10), IRange::new(2, 10, 1));
    assert_eq!(IRange::from(3..10).by(2), IRange::new(3, 10, 2));
    assert_eq!(IRange::full().step(), 1);
    assert_eq!(IRange::from(..5), IRange::new(IRange::OPEN_START, 5, 1));
    assert_eq!(IRange::from(5..), IRange::new(5, IRange::OPEN_FINISH, 1));
  }

  #[test]
  fn resolve_forward() {
    let r = IRange::from(2..10).resolve(6);
    assert_eq!(r, ResolvedRange { start: 2, size: 4, step: 1 });
    // Out-of-range finish clamps to the axis size.
    let r = IRange::from(0..100).resolve(6);
    assert_eq!(r.size, 6);
    // Out-of-range start yields an empty result.
    let r = IRange::from(9..12).resolve(6);
    assert_eq!(r.size, 0);
    // Stepped count rounds up.
    let r = IRange::from(3..10).by(2).resolve(10);
    assert_eq!(r, ResolvedRange { start: 3, size: 4, step: 2 });
  }

  #[test]
  fn resolve_reversed() {
    let r = IRange::full().by(-1).resolve(5);
    assert_eq!(r, ResolvedRange { start: 4, size: 5, step: -1 });
    // Finish is exclusive below the start.
    let r = IRange::new(4, 1, -1).resolve(5);
    assert_eq!(r, ResolvedRange { start: 4, size: 3, step: -1 });
    let r = IRange::new(4, 1, -2).resolve(5);
    assert_eq!(r.size, 2);
  }
}
