//! Chained unary kernels and the storage-to-value chain composers.
//!
//! A chain composes N unary kernels through N−1 contiguous intermediate
//! buffers, each sized per-link and reused across a batch. The batch count
//! is chosen so every buffer stays inside a small fixed byte budget, which
//! keeps the intermediates cache-resident; the final partial batch runs
//! through the same path.
//!
//! The composer consumes kernels from the input FIFO instead of copying
//! them, because kernel instances own their auxiliary state and must not be
//! cloned. On return the input deques are empty.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{Metadata, Type};

use super::UnaryKernel;

/// Upper bound on the size of one intermediate chain buffer.
pub(crate) const MAX_CHAIN_BUFFER_BYTES: usize = 8192;

/// Given a size-N deque of kernel instances and a size-(N−1) deque of the
/// intermediate element sizes, creates a kernel which chains them all
/// together through intermediate buffers.
///
/// The kernels are moved out of the deque instead of copied, so `kernels`
/// and `element_sizes` no longer contain them on exit.
pub fn make_chained_unary_kernel(kernels: &mut VecDeque<UnaryKernel>,
    element_sizes: &mut VecDeque<usize>) -> Result<UnaryKernel> {
  if kernels.is_empty() {
    return Err(Error::InvariantViolation("a kernel chain needs at least one kernel".into()));
  }
  if element_sizes.len() + 1 != kernels.len() {
    return Err(Error::InvariantViolation(format!(
      "kernel chain arity mismatch: {} kernels with {} intermediate sizes",
      kernels.len(), element_sizes.len())));
  }
  if kernels.len() == 1 {
    return Ok(kernels.pop_front().expect("just checked nonempty"));
  }
  if element_sizes.iter().any(|&s| s == 0) {
    return Err(Error::InvariantViolation(
      "kernel chain intermediates must have a fixed element size".into()));
  }
  let links: Vec<UnaryKernel> = kernels.drain(..).collect();
  let sizes: Vec<usize> = element_sizes.drain(..).collect();
  log::trace!("composing a {}-kernel unary chain", links.len());
  let batch = sizes.iter().map(|&s| (MAX_CHAIN_BUFFER_BYTES / s).max(1)).min()
    .expect("chain has at least one intermediate");
  let buffers: Mutex<Vec<Vec<u8>>> =
    Mutex::new(sizes.iter().map(|&s| vec![0u8; s * batch]).collect());
  Ok(UnaryKernel::new(move |dst, dst_stride, src, src_stride, count| {
    let mut buffers = buffers.lock().expect("chain buffers poisoned");
    let mut done = 0usize;
    while done < count {
      let m = batch.min(count - done);
      let mut in_ptr = src.wrapping_offset(src_stride * done as isize);
      let mut in_stride = src_stride;
      for (i, link) in links.iter().enumerate() {
        // Safety: the caller's contract covers the outer pointers; the
        // intermediate buffers hold `batch` elements of each link size.
        if i + 1 == links.len() {
          unsafe {
            link.call(dst.wrapping_offset(dst_stride * done as isize), dst_stride, in_ptr,
              in_stride, m)?;
          }
        } else {
          let buf = buffers[i].as_mut_ptr();
          unsafe { link.call(buf, sizes[i] as isize, in_ptr, in_stride, m)? }
          in_ptr = buf.cast_const();
          in_stride = sizes[i] as isize;
        }
      }
      done += m;
    }
    Ok(())
  }))
}

/// Pushes onto the *front* of the output deques the chain of kernels which
/// transforms the type's storage values into its user-visible values,
/// outermost conversion last. Assumes contiguous intermediate buffers.
///
/// The type must be expression-kind; the caller verifies this.
pub fn push_front_storage_to_value(tp: &Type, meta: &Metadata,
    out_kernels: &mut VecDeque<UnaryKernel>, out_element_sizes: &mut VecDeque<usize>)
    -> Result<()> {
  debug_assert!(tp.is_expression());
  let imp = tp.extended()
    .ok_or_else(|| Error::Unsupported(format!("{tp} is not an expression type")))?;
  let kernel = imp.make_storage_to_value_kernel(meta)?;
  if !out_kernels.is_empty() {
    out_element_sizes.push_front(tp.value_type().element_size());
  }
  out_kernels.push_front(kernel);
  let storage = tp.storage_type();
  if storage.is_expression() {
    push_front_storage_to_value(&storage, meta, out_kernels, out_element_sizes)?;
  }
  Ok(())
}

/// Pushes onto the *back* of the output deques the chain of kernels which
/// transforms the type's user-visible values into its storage values,
/// outermost conversion first. Assumes contiguous intermediate buffers.
///
/// The type must be expression-kind; the caller verifies this.
pub fn push_back_value_to_storage(tp: &Type, meta: &Metadata,
    out_kernels: &mut VecDeque<UnaryKernel>, out_element_sizes: &mut VecDeque<usize>)
    -> Result<()> {
  debug_assert!(tp.is_expression());
  let imp = tp.extended()
    .ok_or_else(|| Error::Unsupported(format!("{tp} is not an expression type")))?;
  let kernel = imp.make_value_to_storage_kernel(meta)?;
  if !out_kernels.is_empty() {
    out_element_sizes.push_back(tp.value_type().element_size());
  }
  out_kernels.push_back(kernel);
  let storage = tp.storage_type();
  if storage.is_expression() {
    push_back_value_to_storage(&storage, meta, out_kernels, out_element_sizes)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::BuiltinScalar;

  fn map_kernel<S: BuiltinScalar, D: BuiltinScalar>(f: impl Fn(S) -> D + Send + Sync + 'static)
      -> UnaryKernel {
    UnaryKernel::new(move |dst, dst_stride, src, src_stride, count| {
      let mut d = dst;
      let mut s = src;
      for _ in 0..count {
        unsafe {
          D::write_scalar(d, f(S::read_scalar(s)));
          d = d.offset(dst_stride);
          s = s.offset(src_stride);
        }
      }
      Ok(())
    })
  }

  #[test]
  fn two_kernel_chain() {
    let mut kernels = VecDeque::new();
    kernels.push_back(map_kernel::<i32, i64>(|x| i64::from(x) * 2));
    kernels.push_back(map_kernel::<i64, f64>(|x| x as f64 + 0.5));
    let mut sizes = VecDeque::from([8usize]);
    let chain = make_chained_unary_kernel(&mut kernels, &mut sizes).unwrap();
    assert!(kernels.is_empty() && sizes.is_empty());

    let src: Vec<i32> = vec![1, 2, 3];
    let mut dst: Vec<f64> = vec![0.0; 3];
    unsafe {
      chain.call(dst.as_mut_ptr().cast(), 8, src.as_ptr().cast(), 4, 3).unwrap();
    }
    assert_eq!(dst, [2.5, 4.5, 6.5]);
  }

  #[test]
  fn chain_handles_partial_batches() {
    // Feed more elements than one batch holds so the tail path runs.
    let n = 3000;
    let mut kernels = VecDeque::new();
    kernels.push_back(map_kernel::<f64, f64>(|x| x + 1.0));
    kernels.push_back(map_kernel::<f64, f64>(|x| x * 3.0));
    let mut sizes = VecDeque::from([8usize]);
    let chain = make_chained_unary_kernel(&mut kernels, &mut sizes).unwrap();

    let src: Vec<f64> = (0..n).map(f64::from).collect();
    let mut dst: Vec<f64> = vec![0.0; n as usize];
    unsafe {
      chain.call(dst.as_mut_ptr().cast(), 8, src.as_ptr().cast(), 8, n as usize).unwrap();
    }
    for i in 0..n as usize {
      assert_eq!(dst[i], (i as f64 + 1.0) * 3.0);
    }
  }

  #[test]
  fn single_kernel_chain_is_passthrough() {
    let mut kernels = VecDeque::new();
    kernels.push_back(map_kernel::<i32, i32>(|x| x));
    let mut sizes = VecDeque::new();
    assert!(make_chained_unary_kernel(&mut kernels, &mut sizes).is_ok());
  }

  #[test]
  fn arity_mismatch_is_rejected() {
    let mut kernels = VecDeque::new();
    kernels.push_back(map_kernel::<i32, i32>(|x| x));
    let mut sizes = VecDeque::from([4usize]);
    assert!(matches!(
      make_chained_unary_kernel(&mut kernels, &mut sizes),
      Err(Error::InvariantViolation(_))
    ));
  }
}
