//! Kernel instances: the callables that actually move bytes.
//!
//! A kernel instance pairs a stride-aware inner-loop function with whatever
//! auxiliary state it owns (conversion tables, sub-kernels, scratch
//! buffers). Instances are move-only: composers consume them from a FIFO
//! and install them in the composed kernel, so kernel state is never
//! cloned. The auxiliary state is torn down when the instance drops, even
//! if the kernel was never invoked.
//!
//! Kernels report conversion failures through [`Result`] and propagate them
//! to the outermost evaluation call.

use std::cmp::Ordering;

use crate::error::{Error, Result};

pub mod assign;
pub mod chain;

/// The inner-loop signature of a nullary kernel: fill `count` elements.
pub type NullaryFn = dyn Fn(*mut u8, isize, usize) -> Result<()> + Send + Sync;

/// The inner-loop signature of a unary kernel: `dst[i] <- op(src[i])`.
pub type UnaryFn = dyn Fn(*mut u8, isize, *const u8, isize, usize) -> Result<()> + Send + Sync;

/// The inner-loop signature of a binary kernel:
/// `dst[i] <- op(src0[i], src1[i])`.
pub type BinaryFn =
  dyn Fn(*mut u8, isize, *const u8, isize, *const u8, isize, usize) -> Result<()> + Send + Sync;

/// The signature of a single-element total-order comparison.
pub type CompareFn = dyn Fn(*const u8, *const u8) -> Result<Ordering> + Send + Sync;

macro_rules! kernel_instance {
  ($(#[$attr:meta])* $name:ident, $fnty:ty,
      ($($arg:ident: $argty:ty),*) -> $ret:ty) => {
    $(#[$attr])*
    pub struct $name {
      op: Box<$fnty>,
    }

    impl $name {
      /// Wraps an inner-loop function in a kernel instance.
      pub fn new(op: impl Fn($($argty),*) -> $ret + Send + Sync + 'static) -> Self {
        Self { op: Box::new(op) }
      }

      /// Invokes the kernel.
      ///
      /// # Safety
      /// Every data pointer must be valid for `count` elements at its
      /// stride, with the element layout the kernel was constructed for;
      /// the destination must not overlap any source.
      pub unsafe fn call(&self, $($arg: $argty),*) -> $ret {
        (self.op)($($arg),*)
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(concat!(stringify!($name), "(..)"))
      }
    }
  }
}

kernel_instance! {
  /// A move-only nullary kernel instance.
  NullaryKernel, NullaryFn,
  (dst: *mut u8, dst_stride: isize, count: usize) -> Result<()>
}

kernel_instance! {
  /// A move-only unary kernel instance.
  UnaryKernel, UnaryFn,
  (dst: *mut u8, dst_stride: isize, src: *const u8, src_stride: isize, count: usize)
    -> Result<()>
}

kernel_instance! {
  /// A move-only binary kernel instance.
  BinaryKernel, BinaryFn,
  (dst: *mut u8, dst_stride: isize, src0: *const u8, src0_stride: isize,
   src1: *const u8, src1_stride: isize, count: usize) -> Result<()>
}

kernel_instance! {
  /// A move-only single-element comparison kernel.
  CompareKernel, CompareFn,
  (a: *const u8, b: *const u8) -> Result<Ordering>
}

/// A memcpy kernel moving fixed-size pod elements.
#[must_use] pub fn make_pod_copy_kernel(element_size: usize) -> UnaryKernel {
  UnaryKernel::new(move |dst: *mut u8, dst_stride, src: *const u8, src_stride, count| {
    if element_size == 0 {
      return Err(Error::InvariantViolation("pod copy of a variable-sized type".into()));
    }
    let mut d = dst;
    let mut s = src;
    for _ in 0..count {
      // Safety: the caller guarantees `count` non-overlapping elements of
      // `element_size` bytes on both sides.
      unsafe {
        std::ptr::copy_nonoverlapping(s, d, element_size);
        d = d.offset(dst_stride);
        s = s.offset(src_stride);
      }
    }
    Ok(())
  })
}

/// Drives a unary kernel over an n-dimensional strided shape, one call per
/// innermost axis.
///
/// # Safety
/// The pointers must address the full strided extents described by `shape`
/// and the stride vectors, and the destination must not overlap the source.
pub(crate) unsafe fn unary_strided_loop(shape: &[usize], dst: *mut u8, dst_strides: &[isize],
    src: *const u8, src_strides: &[isize], kernel: &UnaryKernel) -> Result<()> {
  debug_assert_eq!(shape.len(), dst_strides.len());
  debug_assert_eq!(shape.len(), src_strides.len());
  if shape.is_empty() {
    return unsafe { kernel.call(dst, 0, src, 0, 1) };
  }
  if shape.contains(&0) {
    return Ok(());
  }
  let inner = shape.len() - 1;
  let mut index = vec![0usize; inner];
  loop {
    let mut d = dst;
    let mut s = src;
    for (i, &ix) in index.iter().enumerate() {
      d = d.wrapping_offset(dst_strides[i] * ix as isize);
      s = s.wrapping_offset(src_strides[i] * ix as isize);
    }
    unsafe { kernel.call(d, dst_strides[inner], s, src_strides[inner], shape[inner])? }
    // Odometer increment over the outer axes.
    let mut axis = inner;
    loop {
      if axis == 0 {
        return Ok(());
      }
      axis -= 1;
      index[axis] += 1;
      if index[axis] < shape[axis] {
        break;
      }
      index[axis] = 0;
    }
  }
}

/// Drives a binary kernel over an n-dimensional strided shape.
///
/// # Safety
/// As [`unary_strided_loop`], for all three data pointers.
pub(crate) unsafe fn binary_strided_loop(shape: &[usize], dst: *mut u8, dst_strides: &[isize],
    src0: *const u8, src0_strides: &[isize], src1: *const u8, src1_strides: &[isize],
    kernel: &BinaryKernel) -> Result<()> {
  if shape.is_empty() {
    return unsafe { kernel.call(dst, 0, src0, 0, src1, 0, 1) };
  }
  if shape.contains(&0) {
    return Ok(());
  }
  let inner = shape.len() - 1;
  let mut index = vec![0usize; inner];
  loop {
    let mut d = dst;
    let mut s0 = src0;
    let mut s1 = src1;
    for (i, &ix) in index.iter().enumerate() {
      d = d.wrapping_offset(dst_strides[i] * ix as isize);
      s0 = s0.wrapping_offset(src0_strides[i] * ix as isize);
      s1 = s1.wrapping_offset(src1_strides[i] * ix as isize);
    }
    unsafe {
      kernel.call(d, dst_strides[inner], s0, src0_strides[inner], s1, src1_strides[inner],
        shape[inner])?;
    }
    let mut axis = inner;
    loop {
      if axis == 0 {
        return Ok(());
      }
      axis -= 1;
      index[axis] += 1;
      if index[axis] < shape[axis] {
        break;
      }
      index[axis] = 0;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pod_copy_respects_strides() {
    let src: Vec<u32> = vec![1, 2, 3, 4];
    let mut dst: Vec<u32> = vec![0; 4];
    let k = make_pod_copy_kernel(4);
    // Reverse the source by reading it with a negative stride.
    unsafe {
      k.call(
        dst.as_mut_ptr().cast(), 4,
        src.as_ptr().add(3).cast(), -4,
        4,
      ).unwrap();
    }
    assert_eq!(dst, [4, 3, 2, 1]);
  }

  #[test]
  fn strided_loop_visits_all_elements() {
    let src: Vec<u8> = (0..24).collect();
    let mut dst: Vec<u8> = vec![0; 24];
    let k = make_pod_copy_kernel(1);
    // A 2x3x4 C-order array copied whole.
    unsafe {
      unary_strided_loop(&[2, 3, 4], dst.as_mut_ptr(), &[12, 4, 1], src.as_ptr(), &[12, 4, 1],
        &k).unwrap();
    }
    assert_eq!(dst, src);
  }

  #[test]
  fn nullary_kernels_fill() {
    let fill = NullaryKernel::new(|dst, dst_stride, count| {
      let mut d = dst;
      for _ in 0..count {
        unsafe {
          d.cast::<u16>().write_unaligned(0xbeef);
          d = d.offset(dst_stride);
        }
      }
      Ok(())
    });
    let mut out = [0u16; 4];
    unsafe { fill.call(out.as_mut_ptr().cast(), 2, 4).unwrap() }
    assert_eq!(out, [0xbeef; 4]);
  }

  #[test]
  fn strided_loop_skips_empty_shapes() {
    let k = UnaryKernel::new(|_, _, _, _, _| {
      Err(Error::InvariantViolation("must not be called".into()))
    });
    unsafe {
      unary_strided_loop(&[3, 0, 2], std::ptr::null_mut(), &[0, 0, 0], std::ptr::null(),
        &[0, 0, 0], &k).unwrap();
    }
  }
}
