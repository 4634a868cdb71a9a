//! String, fixed-string and bytes types.
//!
//! A `string` element is a `(begin, end)` pointer pair into a memory block
//! named by the type's metadata; assignment allocates the body from that
//! block, using allocate-then-resize when the encoded size is only known
//! after transcoding. A `fixedstring` stores its code units inline,
//! NUL-padded. `bytes` is the untyped analogue of `string`.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::mem::{align_of, size_of};

use crate::error::{Error, Result};
use crate::kernels::assign::{AssignErrorMode, parse_num, write_num};
use crate::kernels::{CompareKernel, UnaryKernel};
use crate::memblock::make_pod_memory_block;

use super::builtin::builtin_scalar_to_string;
use super::{
  BlockrefMeta, MemoryManagement, Metadata, Type, TypeFlags, TypeId, TypeImpl, TypeKind,
};

/// Size of the `(begin, end)` pointer pair stored as string/bytes data.
pub(crate) const PTR_PAIR_SIZE: usize = 2 * size_of::<*const u8>();

/// Initial capacity of the block backing a string instance.
const STRING_BLOCK_CAPACITY: usize = 64;

/// The text encoding of a string type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringEncoding {
  /// 7-bit ASCII, one byte per code unit.
  Ascii,
  /// UTF-8, one byte per code unit.
  Utf8,
  /// UTF-16, two bytes per code unit.
  Utf16,
  /// UTF-32, four bytes per code unit.
  Utf32,
}

impl StringEncoding {
  /// Bytes per code unit.
  #[must_use] pub const fn char_size(self) -> usize {
    match self {
      StringEncoding::Ascii | StringEncoding::Utf8 => 1,
      StringEncoding::Utf16 => 2,
      StringEncoding::Utf32 => 4,
    }
  }

  /// The canonical encoding name.
  #[must_use] pub const fn name(self) -> &'static str {
    match self {
      StringEncoding::Ascii => "ascii",
      StringEncoding::Utf8 => "utf8",
      StringEncoding::Utf16 => "utf16",
      StringEncoding::Utf32 => "utf32",
    }
  }
}

impl fmt::Display for StringEncoding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Reads the `(begin, end)` pointer pair of a string/bytes element.
///
/// # Safety
/// `data` must point at `PTR_PAIR_SIZE` readable bytes.
pub(crate) unsafe fn read_ptr_pair(data: *const u8) -> (*const u8, *const u8) {
  unsafe {
    let p = data.cast::<*const u8>();
    (p.read_unaligned(), p.add(1).read_unaligned())
  }
}

/// Writes the `(begin, end)` pointer pair of a string/bytes element.
///
/// # Safety
/// `data` must point at `PTR_PAIR_SIZE` writable bytes.
pub(crate) unsafe fn write_ptr_pair(data: *mut u8, begin: *const u8, end: *const u8) {
  unsafe {
    let p = data.cast::<*const u8>();
    p.write_unaligned(begin);
    p.add(1).write_unaligned(end);
  }
}

/// Decodes raw bytes in the given encoding into UTF-8 text.
fn decode_bytes(encoding: StringEncoding, bytes: &[u8]) -> Result<String> {
  let bad = || Error::Parse {
    input: format!("{} bytes", bytes.len()),
    expected: encoding.name(),
  };
  match encoding {
    StringEncoding::Ascii => {
      if bytes.iter().any(|&b| b > 0x7f) {
        return Err(bad());
      }
      Ok(std::str::from_utf8(bytes).map_err(|_| bad())?.to_owned())
    }
    StringEncoding::Utf8 => Ok(std::str::from_utf8(bytes).map_err(|_| bad())?.to_owned()),
    StringEncoding::Utf16 => {
      if bytes.len() % 2 != 0 {
        return Err(bad());
      }
      let units: Vec<u16> = bytes.chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
      char::decode_utf16(units).collect::<std::result::Result<String, _>>().map_err(|_| bad())
    }
    StringEncoding::Utf32 => {
      if bytes.len() % 4 != 0 {
        return Err(bad());
      }
      bytes.chunks_exact(4)
        .map(|c| char::from_u32(u32::from_ne_bytes([c[0], c[1], c[2], c[3]])).ok_or_else(bad))
        .collect()
    }
  }
}

/// Encodes UTF-8 text into the given encoding, writing at most
/// `s.len() * char_size` bytes at `dst` and returning the bytes written.
/// Characters outside an ASCII target are replaced under the `none` error
/// mode and rejected otherwise.
///
/// # Safety
/// `dst` must be writable for `s.len() * encoding.char_size()` bytes.
unsafe fn encode_into(encoding: StringEncoding, s: &str, dst: *mut u8,
    errmode: AssignErrorMode, target: &dyn Fn() -> Type) -> Result<usize> {
  match encoding {
    StringEncoding::Ascii => {
      let mut n = 0;
      for c in s.chars() {
        let out = if c.is_ascii() {
          c as u8
        } else {
          if errmode != AssignErrorMode::None {
            return Err(Error::OutOfRange {
              value: format!("{s:?}"), dst: target(), mode: errmode,
            });
          }
          b'?'
        };
        unsafe { dst.add(n).write(out) }
        n += 1;
      }
      Ok(n)
    }
    StringEncoding::Utf8 => {
      unsafe { std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len()) }
      Ok(s.len())
    }
    StringEncoding::Utf16 => {
      let mut n = 0;
      for unit in s.encode_utf16() {
        unsafe { dst.add(n).cast::<u16>().write_unaligned(unit) }
        n += 2;
      }
      Ok(n)
    }
    StringEncoding::Utf32 => {
      let mut n = 0;
      for c in s.chars() {
        unsafe { dst.add(n).cast::<u32>().write_unaligned(c as u32) }
        n += 4;
      }
      Ok(n)
    }
  }
}

/// A variable-sized string referencing a memory block.
#[derive(Debug)]
pub struct StringType {
  encoding: StringEncoding,
}

/// The string type with the given encoding.
#[must_use] pub fn make_string(encoding: StringEncoding) -> Type {
  Type::from_impl(StringType { encoding })
}

impl StringType {
  /// The encoding of this string type.
  #[must_use] pub fn encoding(&self) -> StringEncoding { self.encoding }

  /// Reads the element's text as UTF-8.
  ///
  /// # Safety
  /// `data` must point at a live string element.
  pub unsafe fn get_utf8_string(&self, _meta: &Metadata, data: *const u8) -> Result<String> {
    let (begin, end) = unsafe { read_ptr_pair(data) };
    if begin.is_null() {
      return Ok(String::new());
    }
    let bytes = unsafe { std::slice::from_raw_parts(begin, end.offset_from(begin) as usize) };
    decode_bytes(self.encoding, bytes)
  }

  /// Iterates the code points of one string element.
  ///
  /// # Safety
  /// `data` must point at a live string element governed by `meta`.
  pub unsafe fn make_string_iter(&self, meta: &Metadata, data: *const u8)
      -> Result<std::vec::IntoIter<char>> {
    let s = unsafe { self.get_utf8_string(meta, data)? };
    Ok(s.chars().collect::<Vec<_>>().into_iter())
  }

  /// Encodes `s` into the metadata's block and points the element at it.
  ///
  /// # Safety
  /// `data` must point at a writable string element governed by `meta`.
  pub unsafe fn set_utf8_string(&self, meta: &Metadata, data: *mut u8,
      errmode: AssignErrorMode, s: &str) -> Result<()> {
    let block = &meta.blockref().block;
    let upper = s.len() * self.encoding.char_size();
    let (mut begin, mut end) = block.allocate(upper, self.encoding.char_size().max(1))?;
    let encoding = self.encoding;
    let written = unsafe {
      encode_into(encoding, s, begin, errmode, &|| make_string(encoding))?
    };
    if written != upper {
      block.resize(&mut begin, &mut end, written)?;
    }
    unsafe { write_ptr_pair(data, begin, end) }
    Ok(())
  }
}

impl TypeImpl for StringType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::String }
  fn kind(&self) -> TypeKind { TypeKind::String }
  fn element_size(&self) -> usize { PTR_PAIR_SIZE }
  fn alignment(&self) -> usize { align_of::<*const u8>() }
  fn flags(&self) -> TypeFlags { TypeFlags::SCALAR | TypeFlags::ZEROINIT }
  fn memory_management(&self) -> MemoryManagement { MemoryManagement::Blockref }

  fn metadata_default_construct(&self, _ndim: usize, _shape: &[usize]) -> Result<Metadata> {
    Ok(Metadata::Blockref(BlockrefMeta { block: make_pod_memory_block(STRING_BLOCK_CAPACITY)? }))
  }

  fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    meta.blockref().block.reset()
  }

  fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    meta.blockref().block.finalize()
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, meta: &Metadata, data: *const u8)
      -> fmt::Result {
    match unsafe { self.get_utf8_string(meta, data) } {
      Ok(s) => write!(f, "{s:?}"),
      Err(_) => f.write_str("<invalid string>"),
    }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.encoding == StringEncoding::Utf8 {
      f.write_str("string")
    } else {
      write!(f, "string['{}']", self.encoding)
    }
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>().is_some_and(|o| self.encoding == o.encoding)
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
    make_string_kind_assignment_kernel(dst, dst_meta, src, src_meta, errmode)
  }

  fn make_comparison_kernel(&self, _meta: &Metadata) -> Result<CompareKernel> {
    Ok(CompareKernel::new(|a, b| {
      // Safety: the caller guarantees both pointers address live elements.
      unsafe {
        let (ab, ae) = read_ptr_pair(a);
        let (bb, be) = read_ptr_pair(b);
        let av = if ab.is_null() { &[][..] }
          else { std::slice::from_raw_parts(ab, ae.offset_from(ab) as usize) };
        let bv = if bb.is_null() { &[][..] }
          else { std::slice::from_raw_parts(bb, be.offset_from(bb) as usize) };
        Ok(av.cmp(bv))
      }
    }))
  }
}

/// A fixed-size string stored inline, NUL-padded.
#[derive(Debug)]
pub struct FixedStringType {
  size: usize,
  encoding: StringEncoding,
}

/// A fixed-string type of `size` code units in the given encoding.
pub fn make_fixedstring(size: usize, encoding: StringEncoding) -> Result<Type> {
  if size == 0 {
    return Err(Error::TypeMismatch("a fixedstring needs at least one code unit".into()));
  }
  Ok(Type::from_impl(FixedStringType { size, encoding }))
}

impl FixedStringType {
  /// The capacity in code units.
  #[must_use] pub fn size(&self) -> usize { self.size }

  /// The encoding of this string type.
  #[must_use] pub fn encoding(&self) -> StringEncoding { self.encoding }

  /// The stored bytes up to the NUL padding.
  ///
  /// # Safety
  /// `data` must point at a live element of this type.
  pub(crate) unsafe fn content_bytes<'a>(&self, data: *const u8) -> &'a [u8] {
    let total = self.size * self.encoding.char_size();
    let bytes = unsafe { std::slice::from_raw_parts(data, total) };
    let cs = self.encoding.char_size();
    let mut used = 0;
    while used < total {
      if bytes[used..used + cs].iter().all(|&b| b == 0) {
        break;
      }
      used += cs;
    }
    &bytes[..used]
  }

  /// Reads the element's text as UTF-8.
  ///
  /// # Safety
  /// `data` must point at a live element of this type.
  pub unsafe fn get_utf8_string(&self, data: *const u8) -> Result<String> {
    decode_bytes(self.encoding, unsafe { self.content_bytes(data) })
  }

  /// Encodes `s` into the element, NUL-padding the tail. Text that does
  /// not fit is an error except under the `none` mode, which truncates at
  /// a code-unit boundary.
  ///
  /// # Safety
  /// `data` must point at a writable element of this type.
  pub unsafe fn set_utf8_string(&self, data: *mut u8, errmode: AssignErrorMode, s: &str)
      -> Result<()> {
    let capacity = self.size * self.encoding.char_size();
    let upper = s.len() * self.encoding.char_size();
    let (size, encoding) = (self.size, self.encoding);
    let target = || {
      make_fixedstring(size, encoding).expect("size checked at construction")
    };
    if upper <= capacity {
      let written = unsafe { encode_into(encoding, s, data, errmode, &target)? };
      unsafe { std::ptr::write_bytes(data.add(written), 0, capacity - written) }
      return Ok(());
    }
    // The worst case does not fit; encode to the side and truncate or fail.
    let mut tmp = vec![0u8; upper];
    let written = unsafe { encode_into(encoding, s, tmp.as_mut_ptr(), errmode, &target)? };
    if written > capacity && errmode != AssignErrorMode::None {
      return Err(Error::OutOfRange {
        value: format!("{s:?}"),
        dst: target(),
        mode: errmode,
      });
    }
    let n = written.min(capacity);
    unsafe {
      std::ptr::copy_nonoverlapping(tmp.as_ptr(), data, n);
      std::ptr::write_bytes(data.add(n), 0, capacity - n);
    }
    Ok(())
  }
}

impl TypeImpl for FixedStringType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::FixedString }
  fn kind(&self) -> TypeKind { TypeKind::String }
  fn element_size(&self) -> usize { self.size * self.encoding.char_size() }
  fn alignment(&self) -> usize { self.encoding.char_size() }
  fn flags(&self) -> TypeFlags { TypeFlags::SCALAR | TypeFlags::ZEROINIT }

  fn metadata_default_construct(&self, _ndim: usize, _shape: &[usize]) -> Result<Metadata> {
    Ok(Metadata::None)
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, _meta: &Metadata, data: *const u8)
      -> fmt::Result {
    match unsafe { self.get_utf8_string(data) } {
      Ok(s) => write!(f, "{s:?}"),
      Err(_) => f.write_str("<invalid string>"),
    }
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "fixedstring[{},'{}']", self.size, self.encoding)
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>()
      .is_some_and(|o| self.size == o.size && self.encoding == o.encoding)
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
    make_string_kind_assignment_kernel(dst, dst_meta, src, src_meta, errmode)
  }

  fn make_comparison_kernel(&self, _meta: &Metadata) -> Result<CompareKernel> {
    let size = self.size;
    let encoding = self.encoding;
    Ok(CompareKernel::new(move |a, b| {
      let this = FixedStringType { size, encoding };
      // Safety: the caller guarantees both pointers address live elements.
      unsafe { Ok(this.content_bytes(a).cmp(this.content_bytes(b))) }
    }))
  }
}

/// Variable-sized raw bytes referencing a memory block.
#[derive(Debug)]
pub struct BytesType {
  align: usize,
}

/// The bytes type whose data is aligned to `align`.
pub fn make_bytes(align: usize) -> Result<Type> {
  if !align.is_power_of_two() || align > 16 {
    return Err(Error::TypeMismatch(format!("bytes alignment {align} is not a power of two <= 16")));
  }
  Ok(Type::from_impl(BytesType { align }))
}

impl BytesType {
  /// The stored byte range.
  ///
  /// # Safety
  /// `data` must point at a live element of this type.
  pub unsafe fn get_bytes<'a>(&self, data: *const u8) -> &'a [u8] {
    unsafe {
      let (begin, end) = read_ptr_pair(data);
      if begin.is_null() { &[] } else {
        std::slice::from_raw_parts(begin, end.offset_from(begin) as usize)
      }
    }
  }

  /// Copies `bytes` into the metadata's block and points the element at it.
  ///
  /// # Safety
  /// `data` must point at a writable element governed by `meta`.
  pub unsafe fn set_bytes(&self, meta: &Metadata, data: *mut u8, bytes: &[u8]) -> Result<()> {
    let block = &meta.blockref().block;
    let (begin, end) = block.allocate(bytes.len(), self.align)?;
    unsafe {
      std::ptr::copy_nonoverlapping(bytes.as_ptr(), begin, bytes.len());
      write_ptr_pair(data, begin, end);
    }
    Ok(())
  }
}

impl TypeImpl for BytesType {
  fn as_any(&self) -> &dyn Any { self }
  fn type_id(&self) -> TypeId { TypeId::Bytes }
  fn kind(&self) -> TypeKind { TypeKind::Bytes }
  fn element_size(&self) -> usize { PTR_PAIR_SIZE }
  fn alignment(&self) -> usize { align_of::<*const u8>() }
  fn flags(&self) -> TypeFlags { TypeFlags::SCALAR | TypeFlags::ZEROINIT }
  fn memory_management(&self) -> MemoryManagement { MemoryManagement::Blockref }

  fn metadata_default_construct(&self, _ndim: usize, _shape: &[usize]) -> Result<Metadata> {
    Ok(Metadata::Blockref(BlockrefMeta { block: make_pod_memory_block(STRING_BLOCK_CAPACITY)? }))
  }

  fn metadata_reset_buffers(&self, meta: &Metadata) -> Result<()> {
    meta.blockref().block.reset()
  }

  fn metadata_finalize_buffers(&self, meta: &Metadata) -> Result<()> {
    meta.blockref().block.finalize()
  }

  unsafe fn print_data(&self, f: &mut fmt::Formatter<'_>, _meta: &Metadata, data: *const u8)
      -> fmt::Result {
    let bytes = unsafe { self.get_bytes(data) };
    f.write_str("bytes[")?;
    for (i, b) in bytes.iter().enumerate() {
      if i != 0 {
        f.write_str(" ")?;
      }
      write!(f, "{b:02x}")?;
    }
    f.write_str("]")
  }

  fn print_type(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "bytes[align={}]", self.align)
  }

  fn eq_impl(&self, other: &dyn TypeImpl) -> bool {
    other.as_any().downcast_ref::<Self>().is_some_and(|o| self.align == o.align)
  }

  fn make_assignment_kernel(&self, dst: &Type, dst_meta: &Metadata, src: &Type,
      _src_meta: &Metadata, _errmode: AssignErrorMode) -> Result<UnaryKernel> {
    if_chain::if_chain! {
      if let Some(d) = dst.downcast::<BytesType>();
      if src.type_id() == TypeId::Bytes;
      then {
        let align = d.align;
        let dst_meta = dst_meta.clone();
        return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
          let this = BytesType { align };
          let mut d = dp;
          let mut s = sp;
          for _ in 0..count {
            // Safety: the caller guarantees `count` live elements on both
            // sides.
            unsafe {
              let bytes = this.get_bytes(s);
              this.set_bytes(&dst_meta, d, bytes)?;
              d = d.offset(dst_stride);
              s = s.offset(src_stride);
            }
          }
          Ok(())
        }));
      }
    }
    Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
  }

  fn make_comparison_kernel(&self, _meta: &Metadata) -> Result<CompareKernel> {
    let align = self.align;
    Ok(CompareKernel::new(move |a, b| {
      let this = BytesType { align };
      // Safety: the caller guarantees both pointers address live elements.
      unsafe { Ok(this.get_bytes(a).cmp(this.get_bytes(b))) }
    }))
  }
}

/// Reads any string-kind element as UTF-8 text.
///
/// # Safety
/// `data` must point at a live element of `tp` under `meta`.
pub(crate) unsafe fn string_kind_get_utf8(tp: &Type, meta: &Metadata, data: *const u8)
    -> Result<String> {
  if let Some(t) = tp.downcast::<StringType>() {
    return unsafe { t.get_utf8_string(meta, data) };
  }
  if let Some(t) = tp.downcast::<FixedStringType>() {
    return unsafe { t.get_utf8_string(data) };
  }
  Err(Error::TypeMismatch(format!("{tp} is not a string type")))
}

/// Writes UTF-8 text into any string-kind element.
///
/// # Safety
/// `data` must point at a writable element of `tp` under `meta`.
pub(crate) unsafe fn string_kind_set_utf8(tp: &Type, meta: &Metadata, data: *mut u8,
    errmode: AssignErrorMode, s: &str) -> Result<()> {
  if let Some(t) = tp.downcast::<StringType>() {
    return unsafe { t.set_utf8_string(meta, data, errmode, s) };
  }
  if let Some(t) = tp.downcast::<FixedStringType>() {
    return unsafe { t.set_utf8_string(data, errmode, s) };
  }
  Err(Error::TypeMismatch(format!("{tp} is not a string type")))
}

/// Assignment dispatch shared by the string-kind types: transcoding
/// between string representations, formatting builtins into strings, and
/// parsing strings into builtins.
fn make_string_kind_assignment_kernel(dst: &Type, dst_meta: &Metadata, src: &Type,
    src_meta: &Metadata, errmode: AssignErrorMode) -> Result<UnaryKernel> {
  if dst.kind() == TypeKind::String {
    if src.kind() == TypeKind::String {
      // Transcode through UTF-8.
      let (dst, src) = (dst.clone(), src.clone());
      let (dst_meta, src_meta) = (dst_meta.clone(), src_meta.clone());
      return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
        let mut d = dp;
        let mut s = sp;
        for _ in 0..count {
          // Safety: the caller guarantees `count` live elements.
          unsafe {
            let text = string_kind_get_utf8(&src, &src_meta, s)?;
            string_kind_set_utf8(&dst, &dst_meta, d, errmode, &text)?;
            d = d.offset(dst_stride);
            s = s.offset(src_stride);
          }
        }
        Ok(())
      }));
    }
    if let Type::Builtin(sid) = *src {
      // Format the scalar into the destination string.
      let dst = dst.clone();
      let dst_meta = dst_meta.clone();
      return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
        let mut d = dp;
        let mut s = sp;
        for _ in 0..count {
          unsafe {
            let text = builtin_scalar_to_string(sid, s);
            string_kind_set_utf8(&dst, &dst_meta, d, errmode, &text)?;
            d = d.offset(dst_stride);
            s = s.offset(src_stride);
          }
        }
        Ok(())
      }));
    }
  } else if let Type::Builtin(did) = *dst {
    if src.kind() == TypeKind::String {
      // Parse the string into the destination scalar.
      let src = src.clone();
      let src_meta = src_meta.clone();
      return Ok(UnaryKernel::new(move |dp, dst_stride, sp, src_stride, count| {
        let mut d = dp;
        let mut s = sp;
        for _ in 0..count {
          unsafe {
            let text = string_kind_get_utf8(&src, &src_meta, s)?;
            write_num(did, d, parse_num(&text)?, errmode)?;
            d = d.offset(dst_stride);
            s = s.offset(src_stride);
          }
        }
        Ok(())
      }));
    }
  }
  Err(Error::CannotAssign { dst: dst.clone(), src: src.clone() })
}
