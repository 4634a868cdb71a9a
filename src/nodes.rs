//! The expression-node graph: the IR of deferred evaluation.
//!
//! Nodes form an immutable reference-counted DAG. A strided-array leaf
//! views concrete data; an immutable scalar carries its value inline;
//! element-wise kernel nodes defer a computation over their operands.
//! Slicing pushes index operations down the tree, casting layers a
//! conversion type over a node, and evaluation lowers everything to chained
//! unary kernels invoked once per innermost axis.
//!
//! The invariant maintained by every transformation is
//! `broadcast(linear_index(node)) == linear_index(broadcast(node))`.

use std::collections::VecDeque;
use std::sync::Arc;

use bit_vec::BitVec;
use itertools::izip;
use smallvec::smallvec;

use crate::array::{AccessFlags, Array};
use crate::error::{Error, Result};
use crate::kernels::assign::{AssignErrorMode, make_assignment_kernel};
use crate::kernels::chain::{make_chained_unary_kernel, push_front_storage_to_value};
use crate::kernels::{BinaryKernel, UnaryKernel, binary_strided_loop, unary_strided_loop};
use crate::memblock::MemBlockRef;
use crate::types::{Metadata, Type, TypeFlags, make_convert_with_errmode};
use crate::{Shape, Strides};

/// A shared handle to an expression node.
pub type NodeRef = Arc<ExprNode>;

/// The broad evaluation category of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeCategory {
  /// The node views a simple strided array in memory.
  StridedArray,
  /// The node is an element-wise transformation of its operands.
  Elementwise,
  /// An arbitrary computation requiring evaluation to a temporary.
  Arbitrary,
}

/// The concrete variant of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
  /// An aligned, strided array view.
  StridedArray,
  /// A single scalar element held by value.
  ImmutableScalar,
  /// An element-wise unary kernel over one operand.
  ElementwiseUnaryKernel,
  /// An element-wise binary kernel over two operands.
  ElementwiseBinaryKernel,
}

pub(crate) enum NodeKind {
  Strided {
    origin: *mut u8,
    strides: Strides,
    /// Metadata of the element type, for storage-to-value lowering.
    meta: Metadata,
    owner: MemBlockRef,
  },
  Scalar {
    data: Box<[u8]>,
  },
  Unary {
    kernel: Arc<UnaryKernel>,
    operand: NodeRef,
  },
  Binary {
    kernel: Arc<BinaryKernel>,
    left: NodeRef,
    right: NodeRef,
  },
}

/// An expression-graph vertex: element dtype, shape, access flags, and the
/// variant payload.
pub struct ExprNode {
  dtype: Type,
  shape: Shape,
  flags: AccessFlags,
  kind: NodeKind,
}

// Safety: the strided origin pointer is kept alive by the owning block
// reference; access to the underlying bytes follows the crate's external
// synchronization contract.
unsafe impl Send for ExprNode {}
unsafe impl Sync for ExprNode {}

impl std::fmt::Debug for ExprNode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExprNode")
      .field("node_type", &self.node_type())
      .field("dtype", &self.dtype)
      .field("shape", &self.shape)
      .finish_non_exhaustive()
  }
}

/// Broadcasts two shapes together under the right-aligned rules.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
  let ndim = a.len().max(b.len());
  let mut out: Shape = smallvec![0; ndim];
  for i in 0..ndim {
    let x = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
    let y = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
    out[i] = match (x, y) {
      (x, y) if x == y => x,
      (1, y) => y,
      (x, 1) => x,
      _ => return Err(Error::BroadcastMismatch { lhs: a.to_vec(), rhs: b.to_vec() }),
    };
  }
  Ok(out)
}

/// Pads `strides` on the left to `out_shape`, giving broadcast (missing or
/// size-1) axes a zero stride. Fails when an axis cannot broadcast.
pub(crate) fn broadcast_strides(out_shape: &[usize], shape: &[usize], strides: &[isize])
    -> Result<Strides> {
  let ndim = out_shape.len();
  if shape.len() > ndim {
    return Err(Error::BroadcastMismatch { lhs: out_shape.to_vec(), rhs: shape.to_vec() });
  }
  let lead = ndim - shape.len();
  let mut out: Strides = smallvec![0; ndim];
  for (i, (&size, &stride)) in izip!(shape, strides).enumerate() {
    if size == 1 {
      out[lead + i] = 0;
    } else if size == out_shape[lead + i] {
      out[lead + i] = stride;
    } else {
      return Err(Error::BroadcastMismatch { lhs: out_shape.to_vec(), rhs: shape.to_vec() });
    }
  }
  Ok(out)
}

impl ExprNode {
  /// A strided-array leaf viewing the data of an array.
  pub fn strided_from_array(a: &Array) -> NodeRef {
    let (shape, strides, meta) = a.strided_parts();
    Arc::new(ExprNode {
      dtype: a.element_type(),
      shape,
      flags: a.access_flags(),
      kind: NodeKind::Strided {
        origin: a.data_ptr(),
        strides,
        meta,
        owner: a.data_owner(),
      },
    })
  }

  /// An immutable scalar node holding a pod value inline.
  pub fn immutable_scalar(dtype: Type, data: Box<[u8]>) -> Result<NodeRef> {
    if dtype.flags().contains(TypeFlags::DESTRUCTOR) || dtype.element_size() == 0
        || data.len() != dtype.element_size() {
      return Err(Error::TypeMismatch(format!("{dtype} cannot be held as an inline scalar")));
    }
    Ok(Arc::new(ExprNode {
      dtype,
      shape: Shape::new(),
      flags: AccessFlags::READ | AccessFlags::IMMUTABLE,
      kind: NodeKind::Scalar { data },
    }))
  }

  /// An element-wise unary kernel node over one operand.
  pub fn elementwise_unary(return_type: Type, kernel: Arc<UnaryKernel>, operand: NodeRef)
      -> NodeRef {
    let shape = operand.shape.clone();
    Arc::new(ExprNode {
      dtype: return_type,
      shape,
      flags: AccessFlags::READ,
      kind: NodeKind::Unary { kernel, operand },
    })
  }

  /// An element-wise binary kernel node over two operands. The operand
  /// shapes must broadcast together.
  pub fn elementwise_binary(return_type: Type, kernel: Arc<BinaryKernel>, left: NodeRef,
      right: NodeRef) -> Result<NodeRef> {
    let shape = broadcast_shapes(&left.shape, &right.shape)?;
    Ok(Arc::new(ExprNode {
      dtype: return_type,
      shape,
      flags: AccessFlags::READ,
      kind: NodeKind::Binary { kernel, left, right },
    }))
  }

  /// The evaluation category.
  #[must_use] pub fn category(&self) -> NodeCategory {
    match self.kind {
      NodeKind::Strided { .. } | NodeKind::Scalar { .. } => NodeCategory::StridedArray,
      NodeKind::Unary { .. } | NodeKind::Binary { .. } => NodeCategory::Elementwise,
    }
  }

  /// The concrete node variant.
  #[must_use] pub fn node_type(&self) -> NodeType {
    match self.kind {
      NodeKind::Strided { .. } => NodeType::StridedArray,
      NodeKind::Scalar { .. } => NodeType::ImmutableScalar,
      NodeKind::Unary { .. } => NodeType::ElementwiseUnaryKernel,
      NodeKind::Binary { .. } => NodeType::ElementwiseBinaryKernel,
    }
  }

  /// The element dtype.
  #[must_use] pub fn dtype(&self) -> &Type { &self.dtype }

  /// Number of dimensions.
  #[must_use] pub fn ndim(&self) -> usize { self.shape.len() }

  /// The shape vector.
  #[must_use] pub fn shape(&self) -> &[usize] { &self.shape }

  /// The access flags.
  #[must_use] pub fn access_flags(&self) -> AccessFlags { self.flags }

  /// The number of operand nodes this node depends on.
  #[must_use] pub fn nop(&self) -> usize {
    match self.kind {
      NodeKind::Strided { .. } | NodeKind::Scalar { .. } => 0,
      NodeKind::Unary { .. } => 1,
      NodeKind::Binary { .. } => 2,
    }
  }

  /// The `i`-th operand node.
  pub fn opnode(&self, i: usize) -> Result<&NodeRef> {
    match (&self.kind, i) {
      (NodeKind::Unary { operand, .. }, 0) => Ok(operand),
      (NodeKind::Binary { left, .. }, 0) => Ok(left),
      (NodeKind::Binary { right, .. }, 1) => Ok(right),
      _ => Err(Error::InvariantViolation(format!(
        "node with {} operands has no operand {i}", self.nop()))),
    }
  }

  /// The readable origin and strides, padded on the left to `ndim` per the
  /// broadcasting rules.
  pub fn as_readonly_data_and_strides(&self, ndim: usize) -> Result<(*const u8, Strides)> {
    if !self.flags.contains(AccessFlags::READ) {
      return Err(Error::InvariantViolation("node data is not readable".into()));
    }
    match &self.kind {
      NodeKind::Strided { origin, strides, .. } => {
        let padded = pad_for_ndim(ndim, &self.shape, strides)?;
        Ok((origin.cast_const(), padded))
      }
      NodeKind::Scalar { data } => Ok((data.as_ptr(), smallvec![0; ndim])),
      _ => Err(Error::InvariantViolation(
        "only strided-category nodes expose data and strides".into())),
    }
  }

  /// The writable origin and strides, padded on the left to `ndim`.
  pub fn as_readwrite_data_and_strides(&self, ndim: usize) -> Result<(*mut u8, Strides)> {
    if !self.flags.contains(AccessFlags::WRITE) {
      return Err(Error::InvariantViolation("node data is not writable".into()));
    }
    match &self.kind {
      NodeKind::Strided { origin, strides, .. } => {
        let padded = pad_for_ndim(ndim, &self.shape, strides)?;
        Ok((*origin, padded))
      }
      _ => Err(Error::InvariantViolation(
        "only strided-category nodes expose data and strides".into())),
    }
  }
}

fn pad_for_ndim(ndim: usize, shape: &[usize], strides: &[isize]) -> Result<Strides> {
  if shape.len() > ndim {
    return Err(Error::BroadcastMismatch { lhs: vec![0; ndim], rhs: shape.to_vec() });
  }
  let mut padded: Strides = smallvec![0; ndim];
  let lead = ndim - shape.len();
  for (i, (&size, &stride)) in izip!(shape, strides).enumerate() {
    padded[lead + i] = if size == 1 { 0 } else { stride };
  }
  Ok(padded)
}

/// Converts a node to a new dtype, layering a conversion over it. Returns
/// the node unchanged when the dtype already matches. With
/// `allow_in_place` and a uniquely held node, leaves are mutated directly.
pub fn as_dtype(mut node: NodeRef, dt: &Type, errmode: AssignErrorMode, allow_in_place: bool)
    -> Result<NodeRef> {
  if node.dtype == *dt {
    return Ok(node);
  }
  match node.node_type() {
    NodeType::StridedArray | NodeType::ImmutableScalar => {
      let converted = make_convert_with_errmode(dt.clone(), node.dtype.clone(), errmode);
      if allow_in_place {
        if let Some(n) = Arc::get_mut(&mut node) {
          n.dtype = converted;
          return Ok(node);
        }
      }
      Ok(Arc::new(ExprNode {
        dtype: converted,
        shape: node.shape.clone(),
        flags: node.flags,
        kind: clone_leaf_kind(&node.kind),
      }))
    }
    NodeType::ElementwiseUnaryKernel | NodeType::ElementwiseBinaryKernel => {
      // Kernel nodes produce plain values, so layer a conversion kernel
      // instead of an expression dtype.
      let conv = make_assignment_kernel(dt, &Metadata::None, &node.dtype.value_type(),
        &Metadata::None, errmode)?;
      Ok(ExprNode::elementwise_unary(dt.clone(), Arc::new(conv), node))
    }
  }
}

fn clone_leaf_kind(kind: &NodeKind) -> NodeKind {
  match kind {
    NodeKind::Strided { origin, strides, meta, owner } => NodeKind::Strided {
      origin: *origin,
      strides: strides.clone(),
      meta: meta.clone(),
      owner: owner.clone(),
    },
    NodeKind::Scalar { data } => NodeKind::Scalar { data: data.clone() },
    _ => unreachable!("only leaf kinds are cloned"),
  }
}

/// Applies a linear index operation to the node, pushing it through the
/// tree: strided leaves fold it into origin and strides, kernel nodes
/// descend into each operand. `remove_axis`, `start` and `index_strides`
/// have one entry per indexed axis of the operation shape; `shape` holds
/// the kept extent of each axis. The caller guarantees the node broadcasts
/// to the operation's shape.
pub fn apply_linear_index(mut node: NodeRef, remove_axis: &BitVec, start: &[isize],
    index_strides: &[isize], shape: &[usize], allow_in_place: bool) -> Result<NodeRef> {
  let ndim = remove_axis.len();
  debug_assert!(start.len() == ndim && index_strides.len() == ndim && shape.len() == ndim);
  match node.node_type() {
    NodeType::ImmutableScalar => Ok(node),
    NodeType::StridedArray => {
      let (new_origin, new_shape, new_strides, meta, owner) = {
        let NodeKind::Strided { origin, strides, meta, owner } = &node.kind else {
          unreachable!("checked by node_type")
        };
        // The node broadcasts to the operation's shape by the caller's
        // guarantee; pad without re-validating.
        let bstrides = pad_for_ndim(ndim, &node.shape, strides)?;
        let mut new_origin = *origin;
        let mut new_shape = Shape::new();
        let mut new_strides = Strides::new();
        for i in 0..ndim {
          new_origin = new_origin.wrapping_offset(start[i] * bstrides[i]);
          if !remove_axis.get(i).expect("mask covers every axis") {
            new_shape.push(shape[i]);
            new_strides.push(index_strides[i] * bstrides[i]);
          }
        }
        (new_origin, new_shape, new_strides, meta.clone(), owner.clone())
      };
      let new_kind = NodeKind::Strided {
        origin: new_origin,
        strides: new_strides,
        meta,
        owner,
      };
      if allow_in_place {
        if let Some(n) = Arc::get_mut(&mut node) {
          n.shape = new_shape;
          n.kind = new_kind;
          return Ok(node);
        }
      }
      Ok(Arc::new(ExprNode {
        dtype: node.dtype.clone(),
        shape: new_shape,
        flags: node.flags,
        kind: new_kind,
      }))
    }
    NodeType::ElementwiseUnaryKernel => {
      let (kernel, operand) = {
        let NodeKind::Unary { kernel, operand } = &node.kind else {
          unreachable!("checked by node_type")
        };
        (kernel.clone(), operand.clone())
      };
      let sub = apply_linear_index(operand, remove_axis, start, index_strides, shape, false)?;
      Ok(ExprNode::elementwise_unary(node.dtype.clone(), kernel, sub))
    }
    NodeType::ElementwiseBinaryKernel => {
      let (kernel, left, right) = {
        let NodeKind::Binary { kernel, left, right } = &node.kind else {
          unreachable!("checked by node_type")
        };
        (kernel.clone(), left.clone(), right.clone())
      };
      let l = apply_linear_index(left, remove_axis, start, index_strides, shape, false)?;
      let r = apply_linear_index(right, remove_axis, start, index_strides, shape, false)?;
      ExprNode::elementwise_binary(node.dtype.clone(), kernel, l, r)
    }
  }
}

/// Evaluates the node into an array whose dtype is not expression-kind.
///
/// Strided leaves without expression dtypes evaluate to zero-copy views;
/// everything else lowers to a single chained unary kernel per operand path
/// and one pass over the broadcast output shape.
pub fn evaluate(node: &NodeRef) -> Result<Array> {
  match &node.kind {
    NodeKind::Strided { origin, strides, meta, owner } => {
      if !node.dtype.is_expression() {
        return Array::from_raw_view(node.dtype.clone(), meta.clone(), &node.shape, strides,
          *origin, owner.clone(), node.flags);
      }
      log::debug!("evaluating {} through its storage-to-value chain", node.dtype);
      let out = Array::empty(&node.shape, node.dtype.value_type())?;
      let mut kernels = VecDeque::new();
      let mut sizes = VecDeque::new();
      push_front_storage_to_value(&node.dtype, meta, &mut kernels, &mut sizes)?;
      let chain = make_chained_unary_kernel(&mut kernels, &mut sizes)?;
      let (dst, dst_strides) = out.writable_parts()?;
      // Safety: the output was sized from the node's shape, and the node's
      // origin/strides address live elements of the storage type.
      unsafe {
        unary_strided_loop(&node.shape, dst, &dst_strides, origin.cast_const(), strides,
          &chain)?;
      }
      Ok(out)
    }
    NodeKind::Scalar { data } => {
      let out = Array::empty(&[], node.dtype.clone())?;
      // Safety: the scalar data is exactly element_size bytes of a pod
      // dtype, checked at node construction.
      unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), out.data_ptr(), data.len());
      }
      Ok(out)
    }
    NodeKind::Unary { kernel, operand } => {
      let out = Array::empty(&node.shape, node.dtype.clone())?;
      let (dst, dst_strides) = out.writable_parts()?;
      // Compose the operand's storage-to-value links with this node's
      // kernel so the data moves in one pass.
      if let NodeKind::Strided { origin, strides, meta, .. } = &operand.kind {
        let mut kernels = VecDeque::new();
        let mut sizes = VecDeque::new();
        if operand.dtype.is_expression() {
          push_front_storage_to_value(&operand.dtype, meta, &mut kernels, &mut sizes)?;
          sizes.push_back(operand.dtype.value_type().element_size());
        }
        kernels.push_back(wrap_shared_unary(kernel.clone()));
        let chain = make_chained_unary_kernel(&mut kernels, &mut sizes)?;
        let src_strides = broadcast_strides(&node.shape, &operand.shape, strides)?;
        // Safety: output sized from the broadcast shape; operand extents
        // covered by its own shape and strides.
        unsafe {
          unary_strided_loop(&node.shape, dst, &dst_strides, origin.cast_const(),
            &src_strides, &chain)?;
        }
      } else {
        let src = evaluate(operand)?;
        let (src_ptr, src_strides) = src.readable_parts(&node.shape)?;
        // Safety: as above, with the materialized operand.
        unsafe {
          unary_strided_loop(&node.shape, dst, &dst_strides, src_ptr, &src_strides, kernel)?;
        }
      }
      Ok(out)
    }
    NodeKind::Binary { kernel, left, right } => {
      let out = Array::empty(&node.shape, node.dtype.clone())?;
      let (dst, dst_strides) = out.writable_parts()?;
      let lhs = evaluate(left)?;
      let rhs = evaluate(right)?;
      let (lp, ls) = lhs.readable_parts(&node.shape)?;
      let (rp, rs) = rhs.readable_parts(&node.shape)?;
      // Safety: output sized from the broadcast shape; both operands were
      // materialized to arrays covering it.
      unsafe {
        binary_strided_loop(&node.shape, dst, &dst_strides, lp, &ls, rp, &rs, kernel)?;
      }
      Ok(out)
    }
  }
}

/// Adapts a shared kernel handle into an owned instance for the chain
/// composer, which consumes kernels by value.
pub(crate) fn wrap_shared_unary(kernel: Arc<UnaryKernel>) -> UnaryKernel {
  UnaryKernel::new(move |dst, dst_stride, src, src_stride, count| {
    // Safety: forwarded verbatim; the chain composer upholds the pointer
    // contract of the wrapped kernel.
    unsafe { kernel.call(dst, dst_stride, src, src_stride, count) }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn broadcast_shape_rules() {
    assert_eq!(broadcast_shapes(&[3, 1], &[4]).unwrap().as_slice(), &[3, 4]);
    assert_eq!(broadcast_shapes(&[], &[5]).unwrap().as_slice(), &[5]);
    assert!(broadcast_shapes(&[3], &[4]).is_err());
  }

  #[test]
  fn broadcast_strides_zero_fill() {
    let s = broadcast_strides(&[2, 3, 4], &[3, 1], &[8, 8]).unwrap();
    assert_eq!(s.as_slice(), &[0, 8, 0]);
    assert!(broadcast_strides(&[2, 3], &[4], &[8]).is_err());
  }
}
