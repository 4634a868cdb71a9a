//! The memory-block subsystem backing all array data.
//!
//! A memory block is a reference-counted buffer descriptor with one of
//! several allocation disciplines:
//!
//! * [`MemoryBlock::Fixed`] — one allocation, no resize; backs array data of
//!   a known size.
//! * [`MemoryBlock::Pod`] — bump-allocated pages for sequential fills
//!   (string bodies, variable struct fields).
//! * [`MemoryBlock::Zeroinit`] — the pod discipline plus a post-condition
//!   that newly returned bytes are zero.
//! * [`MemoryBlock::ArrayData`] — the array preamble, carrying the array's
//!   root type, metadata, data pointer and flags.
//!
//! The bump disciplines deliberately forbid arbitrary free: the only
//! resize-style interaction the evaluator requires is growing or shrinking
//! the most recent allocation, so the allocator can be a pointer bump. The
//! protocol tracks the last handed-out range and reports misuse as an error
//! rather than corrupting the cursor.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::array::ArrayPreamble;
use crate::error::{Error, Result};

/// A shared handle to a memory block.
pub type MemBlockRef = Arc<MemoryBlock>;

/// Page alignment used for bump pages; at least the alignment of every
/// builtin scalar, so a fresh page can satisfy any aligned request.
const PAGE_ALIGN: usize = 16;

/// The kind tag of a memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemBlockKind {
  /// One allocation, fixed size.
  Fixed,
  /// Bump-allocated pages.
  Pod,
  /// Bump-allocated pages with zero-fill.
  Zeroinit,
  /// Array root metadata.
  ArrayPreamble,
}

/// A reference-counted buffer descriptor. See the module docs for the
/// discipline of each variant.
#[derive(Debug)]
pub enum MemoryBlock {
  /// One allocation, fixed size.
  Fixed(FixedBlock),
  /// Bump-allocated pages.
  Pod(BumpBlock),
  /// Bump-allocated pages with zero-fill.
  Zeroinit(BumpBlock),
  /// The array preamble.
  ArrayData(ArrayPreamble),
}

// Safety: page memory is privately owned by the block; the bump cursor is
// serialized by the internal mutex, and access to the bytes themselves
// requires external synchronization per the crate's concurrency contract.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
  /// The kind tag of this block.
  #[must_use] pub fn kind(&self) -> MemBlockKind {
    match self {
      MemoryBlock::Fixed(_) => MemBlockKind::Fixed,
      MemoryBlock::Pod(_) => MemBlockKind::Pod,
      MemoryBlock::Zeroinit(_) => MemBlockKind::Zeroinit,
      MemoryBlock::ArrayData(_) => MemBlockKind::ArrayPreamble,
    }
  }

  fn bump(&self) -> Result<&BumpBlock> {
    match self {
      MemoryBlock::Pod(b) | MemoryBlock::Zeroinit(b) => Ok(b),
      _ => Err(Error::InvariantViolation(format!(
        "{:?} memory block does not support the allocator protocol", self.kind()))),
    }
  }

  /// Allocates `size` bytes aligned to `align` from a pod or zeroinit
  /// block, returning the `[begin, end)` range.
  pub fn allocate(&self, size: usize, align: usize) -> Result<(*mut u8, *mut u8)> {
    self.bump()?.allocate(size, align)
  }

  /// Resizes the most recently handed-out allocation in place, updating
  /// `begin`/`end`. Resizing anything but the most recent allocation is an
  /// invariant violation.
  pub fn resize(&self, begin: &mut *mut u8, end: &mut *mut u8, new_size: usize) -> Result<()> {
    self.bump()?.resize(begin, end, new_size)
  }

  /// Surrenders the remaining tail; subsequent allocate/resize calls fail.
  pub fn finalize(&self) -> Result<()> {
    self.bump()?.finalize()
  }

  /// Frees every page except the most recent and rewinds the cursor to its
  /// start, keeping the page as scratch for reuse.
  pub fn reset(&self) -> Result<()> {
    self.bump()?.reset()
  }
}

/// Creates a fixed memory block of `size` zeroed bytes, returning the block
/// handle and the pointer to its data.
pub fn make_fixed_memory_block(size: usize, align: usize) -> Result<(MemBlockRef, *mut u8)> {
  let block = FixedBlock::new(size, align)?;
  let ptr = block.ptr.as_ptr();
  Ok((Arc::new(MemoryBlock::Fixed(block)), ptr))
}

/// Creates a pod bump block with one page of `initial_capacity` bytes.
pub fn make_pod_memory_block(initial_capacity: usize) -> Result<MemBlockRef> {
  Ok(Arc::new(MemoryBlock::Pod(BumpBlock::new(initial_capacity, false)?)))
}

/// Creates a zeroinit bump block with one page of `initial_capacity` bytes.
pub fn make_zeroinit_memory_block(initial_capacity: usize) -> Result<MemBlockRef> {
  Ok(Arc::new(MemoryBlock::Zeroinit(BumpBlock::new(initial_capacity, true)?)))
}

/// One allocation of fixed size. The bytes start zeroed.
pub struct FixedBlock {
  ptr: NonNull<u8>,
  layout: Layout,
}

impl FixedBlock {
  fn new(size: usize, align: usize) -> Result<Self> {
    // A zero-size layout is not allocatable; round up so empty arrays still
    // get a stable, owned pointer.
    let layout = Layout::from_size_align(size.max(1), align.max(1))
      .map_err(|_| Error::AllocationFailure { size })?;
    // Safety: the layout has nonzero size.
    let p = unsafe { alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(p).ok_or(Error::AllocationFailure { size })?;
    Ok(Self { ptr, layout })
  }

  /// The size of the allocation in bytes.
  #[must_use] pub fn size(&self) -> usize { self.layout.size() }
}

impl Drop for FixedBlock {
  fn drop(&mut self) {
    // Safety: allocated with this layout in `new`.
    unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
  }
}

impl std::fmt::Debug for FixedBlock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FixedBlock").field("size", &self.layout.size()).finish()
  }
}

struct Page {
  ptr: NonNull<u8>,
  layout: Layout,
}

impl Page {
  fn new(capacity: usize) -> Result<Self> {
    let layout = Layout::from_size_align(capacity.max(1), PAGE_ALIGN)
      .map_err(|_| Error::AllocationFailure { size: capacity })?;
    // Safety: the layout has nonzero size.
    let p = unsafe { alloc::alloc(layout) };
    let ptr = NonNull::new(p).ok_or(Error::AllocationFailure { size: capacity })?;
    Ok(Self { ptr, layout })
  }

  fn capacity(&self) -> usize { self.layout.size() }
}

impl Drop for Page {
  fn drop(&mut self) {
    // Safety: allocated with this layout in `new`.
    unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
  }
}

struct BumpState {
  /// Every page still owned by the block; the last entry is the page
  /// currently being doled out.
  pages: Vec<Page>,
  /// Start of the current page.
  begin: *mut u8,
  /// Where the next allocation will be handed out.
  current: *mut u8,
  /// End of the current page.
  end: *mut u8,
  /// Total capacity still reachable through handed-out allocations plus the
  /// remaining tail; abandoned tails are counted out.
  total_capacity: usize,
  finalized: bool,
}

impl BumpState {
  /// Allocates a new page and makes it current.
  fn append_page(&mut self, capacity: usize) -> Result<()> {
    let page = Page::new(capacity)?;
    self.begin = page.ptr.as_ptr();
    // Safety: one-past-the-end of the fresh allocation.
    self.end = unsafe { self.begin.add(page.capacity()) };
    self.current = self.begin;
    self.total_capacity += page.capacity();
    self.pages.push(page);
    Ok(())
  }

  fn check_live(&self) -> Result<()> {
    if self.finalized {
      return Err(Error::InvariantViolation("memory block has been finalized".into()));
    }
    Ok(())
  }
}

/// The shared implementation of the pod and zeroinit disciplines.
pub struct BumpBlock {
  zero_init: bool,
  state: Mutex<BumpState>,
}

impl BumpBlock {
  fn new(initial_capacity: usize, zero_init: bool) -> Result<Self> {
    let mut state = BumpState {
      pages: Vec::new(),
      begin: std::ptr::null_mut(),
      current: std::ptr::null_mut(),
      end: std::ptr::null_mut(),
      total_capacity: 0,
      finalized: false,
    };
    state.append_page(initial_capacity)?;
    Ok(Self { zero_init, state: Mutex::new(state) })
  }

  #[allow(clippy::cast_sign_loss)]
  fn allocate(&self, size: usize, align: usize) -> Result<(*mut u8, *mut u8)> {
    let mut st = self.state.lock().expect("bump allocator poisoned");
    st.check_live()?;
    log::trace!("bump block allocating {size} bytes with alignment {align}");
    let mut begin =
      ((st.current as usize).checked_add(align - 1).ok_or(Error::AllocationFailure { size })?
        & !(align - 1)) as *mut u8;
    // Safety: offset within (or one past) the page, checked below.
    let mut end = begin.wrapping_add(size);
    if (end as usize) > (st.end as usize) || (begin as usize) < (st.current as usize) {
      // The tail of the current page is abandoned and counted out of the
      // capacity; the next page doubles the total used so far.
      st.total_capacity -= st.end as usize - st.current as usize;
      let capacity = st.total_capacity.max(size);
      st.append_page(capacity)?;
      begin = st.begin;
      end = begin.wrapping_add(size);
    }
    st.current = end;
    if self.zero_init {
      // Safety: [begin, end) is inside the current page.
      unsafe { std::ptr::write_bytes(begin, 0, size) }
    }
    Ok((begin, end))
  }

  fn resize(&self, begin: &mut *mut u8, end: &mut *mut u8, new_size: usize) -> Result<()> {
    let mut st = self.state.lock().expect("bump allocator poisoned");
    st.check_live()?;
    if *end != st.current {
      return Err(Error::InvariantViolation(
        "resize must be called only on the most recently allocated memory".into()));
    }
    let old_size = *end as usize - *begin as usize;
    let new_end = begin.wrapping_add(new_size);
    if (new_end as usize) <= (st.end as usize) {
      // Still fits: move the cursor, zero-filling any newly exposed bytes.
      if self.zero_init && new_size > old_size {
        // Safety: [*end, new_end) is inside the current page.
        unsafe { std::ptr::write_bytes(*end, 0, new_size - old_size) }
      }
      st.current = new_end;
      *end = new_end;
    } else {
      // Does not fit: copy-grow into a fresh page, counting the old range
      // out of the capacity.
      let capacity = st.total_capacity.max(new_size);
      st.append_page(capacity)?;
      // Safety: the old range and the fresh page do not overlap, and
      // old_size <= new_size <= the new page's capacity.
      unsafe {
        std::ptr::copy_nonoverlapping(*begin, st.begin, old_size);
        if self.zero_init {
          std::ptr::write_bytes(st.begin.add(old_size), 0, new_size - old_size);
        }
      }
      st.total_capacity -= old_size;
      *begin = st.begin;
      *end = st.begin.wrapping_add(new_size);
      st.current = *end;
    }
    Ok(())
  }

  fn finalize(&self) -> Result<()> {
    let mut st = self.state.lock().expect("bump allocator poisoned");
    st.check_live()?;
    st.total_capacity -= st.end as usize - st.current as usize;
    st.begin = std::ptr::null_mut();
    st.current = std::ptr::null_mut();
    st.end = std::ptr::null_mut();
    st.finalized = true;
    Ok(())
  }

  fn reset(&self) -> Result<()> {
    let mut st = self.state.lock().expect("bump allocator poisoned");
    st.check_live()?;
    // Throw away every page except the most recently allocated one, then
    // rewind to reuse it from the start.
    let last = st.pages.len() - 1;
    st.pages.swap(0, last);
    st.pages.truncate(1);
    st.begin = st.pages[0].ptr.as_ptr();
    st.end = st.begin.wrapping_add(st.pages[0].capacity());
    st.current = st.begin;
    st.total_capacity = st.pages[0].capacity();
    Ok(())
  }

  /// Total capacity reachable through handed-out allocations plus the
  /// remaining tail of the current page.
  #[must_use] pub fn total_capacity(&self) -> usize {
    self.state.lock().expect("bump allocator poisoned").total_capacity
  }
}

impl std::fmt::Debug for BumpBlock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let st = self.state.lock().expect("bump allocator poisoned");
    f.debug_struct("BumpBlock")
      .field("zero_init", &self.zero_init)
      .field("pages", &st.pages.len())
      .field("total_capacity", &st.total_capacity)
      .field("finalized", &st.finalized)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fixed_block_is_zeroed() {
    let (_block, ptr) = make_fixed_memory_block(64, 8).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 64) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn allocate_respects_alignment() {
    let block = make_pod_memory_block(256).unwrap();
    let (b1, _) = block.allocate(3, 1).unwrap();
    let (b2, _) = block.allocate(8, 8).unwrap();
    assert_eq!(b2 as usize % 8, 0);
    assert!(b2 as usize > b1 as usize);
  }

  #[test]
  fn resize_in_place_keeps_pointer() {
    let block = make_pod_memory_block(256).unwrap();
    let (mut begin, mut end) = block.allocate(16, 1).unwrap();
    let orig = begin;
    unsafe { std::ptr::write_bytes(begin, 0xab, 16) }
    block.resize(&mut begin, &mut end, 32).unwrap();
    assert_eq!(begin, orig);
    assert_eq!(end as usize - begin as usize, 32);
    // Shrink also stays in place.
    block.resize(&mut begin, &mut end, 8).unwrap();
    assert_eq!(begin, orig);
  }

  #[test]
  fn resize_copy_grow_preserves_contents() {
    let block = make_pod_memory_block(32).unwrap();
    let (mut begin, mut end) = block.allocate(24, 1).unwrap();
    for i in 0..24 {
      unsafe { begin.add(i).write(i as u8) }
    }
    block.resize(&mut begin, &mut end, 4096).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(begin, 24) };
    for (i, &b) in bytes.iter().enumerate() {
      assert_eq!(b, i as u8);
    }
  }

  #[test]
  fn resize_of_non_recent_allocation_fails() {
    let block = make_pod_memory_block(256).unwrap();
    let (mut b1, mut e1) = block.allocate(8, 1).unwrap();
    let _second = block.allocate(8, 1).unwrap();
    assert!(matches!(
      block.resize(&mut b1, &mut e1, 16),
      Err(Error::InvariantViolation(_))
    ));
  }

  #[test]
  fn zeroinit_returns_zeroed_memory() {
    let block = make_zeroinit_memory_block(64).unwrap();
    let (begin, _) = block.allocate(48, 1).unwrap();
    unsafe { std::ptr::write_bytes(begin, 0xff, 48) }
    // Force a new page; the fresh range must come back zeroed even though
    // the allocator never recycles, because a copy-grow can expose bytes.
    let (b2, _) = block.allocate(128, 1).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(b2, 128) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn zeroinit_resize_zero_fills_growth() {
    let block = make_zeroinit_memory_block(256).unwrap();
    let (mut begin, mut end) = block.allocate(8, 1).unwrap();
    unsafe { std::ptr::write_bytes(begin, 0x7f, 8) }
    block.resize(&mut begin, &mut end, 64).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(begin, 64) };
    assert!(bytes[..8].iter().all(|&b| b == 0x7f));
    assert!(bytes[8..].iter().all(|&b| b == 0));
  }

  #[test]
  fn finalized_block_rejects_allocation() {
    let block = make_pod_memory_block(64).unwrap();
    block.allocate(8, 1).unwrap();
    block.finalize().unwrap();
    assert!(block.allocate(8, 1).is_err());
    assert!(block.finalize().is_err());
  }

  #[test]
  fn reset_keeps_one_page() {
    let block = make_pod_memory_block(16).unwrap();
    // Spill onto several pages.
    for _ in 0..8 {
      block.allocate(16, 1).unwrap();
    }
    block.reset().unwrap();
    let (b, _) = block.allocate(16, 1).unwrap();
    // After reset the cursor starts at the head of the kept page.
    let (b2, _) = block.allocate(16, 1).unwrap();
    assert!(b2 as usize != b as usize);
  }

  #[test]
  fn fixed_block_rejects_allocator_protocol() {
    let (block, _) = make_fixed_memory_block(16, 8).unwrap();
    assert!(block.allocate(8, 1).is_err());
    assert!(block.reset().is_err());
  }
}
