//! Tensor cells and the owned/borrowed handle seam.
//!
//! A `TetherTensorHandle` is the raw address of a heap-allocated [`TensorCell`].
//! Ownership lives on the Rust side as a `Box` and becomes a flat handle only
//! at [`cell_into_handle`]; the reverse edge is [`tether_tensor_destroy`]
//! (in `lib.rs`), which reconstitutes the box and drops it. Everything in
//! between borrows through [`handle_as_cell`] / [`handle_as_cell_mut`].

use std::sync::atomic::{AtomicI64, Ordering};

use libc::c_void;
use tch::Tensor;

/// Opaque boundary token naming exactly one tensor cell.
pub type TetherTensorHandle = *mut TensorCell;

static LIVE_CELLS: AtomicI64 = AtomicI64::new(0);

/// A boundary-visible tensor: the backing `tch` tensor plus cached metadata.
///
/// Sizes and strides are captured once so the pointers handed out by the
/// metadata accessors stay valid for the whole life of the cell instead of
/// the life of a temporary. `storage_offset` is the element-unit offset of
/// this view within the storage the `tch` tensor was created over; views
/// produced by reinterpretation compose their offset increments on top of it.
pub struct TensorCell {
    tensor: Tensor,
    sizes: Vec<i64>,
    strides: Vec<i64>,
    storage_offset: i64,
}

impl TensorCell {
    /// Wraps a tensor whose layout is already known, e.g. because the caller
    /// requested it from a factory operation.
    pub(crate) fn from_parts(
        tensor: Tensor,
        sizes: Vec<i64>,
        strides: Vec<i64>,
        storage_offset: i64,
    ) -> Self {
        TensorCell {
            tensor,
            sizes,
            strides,
            storage_offset,
        }
    }

    /// Wraps a tensor produced by the compute library.
    ///
    /// The library does not expose the result's strides, so the result is
    /// materialized densely and the cached strides describe that layout.
    /// Undefined tensors (auxiliary kernel outputs) wrap with empty metadata
    /// and keep failing cleanly when their data is queried.
    pub(crate) fn from_library(tensor: Tensor) -> Result<Self, String> {
        if !tensor.defined() {
            return Ok(TensorCell {
                tensor,
                sizes: Vec::new(),
                strides: Vec::new(),
                storage_offset: 0,
            });
        }
        let sizes = tensor.size();
        let strides = contiguous_strides(&sizes);
        let mut dense = Tensor::f_empty_strided(
            sizes.as_slice(),
            strides.as_slice(),
            (tensor.kind(), tensor.device()),
        )
        .map_err(|err| err.to_string())?;
        dense.copy_(&tensor);
        Ok(TensorCell {
            tensor: dense,
            sizes,
            strides,
            storage_offset: 0,
        })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn storage_offset(&self) -> i64 {
        self.storage_offset
    }

    pub(crate) fn data_ptr(&self) -> Result<*mut c_void, String> {
        if !self.tensor.defined() {
            return Err("tensor has no backing storage".to_string());
        }
        Ok(self.tensor.data_ptr())
    }
}

/// Converts an owned cell into the flat handle form. The sole place where
/// ownership leaves Rust; the receiver must destroy the handle exactly once.
pub(crate) fn cell_into_handle(cell: Box<TensorCell>) -> TetherTensorHandle {
    LIVE_CELLS.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(cell)
}

/// Borrows the cell behind a handle for the duration of the current call.
///
/// # Safety
/// `handle` must have been produced by [`cell_into_handle`] and not yet
/// destroyed. The returned borrow must not outlive the call that received
/// the handle.
pub unsafe fn handle_as_cell<'a>(handle: TetherTensorHandle) -> Result<&'a TensorCell, String> {
    if handle.is_null() {
        return Err("null tensor handle".to_string());
    }
    Ok(unsafe { &*handle })
}

/// Mutable variant of [`handle_as_cell`] for operations that write through
/// a borrowed handle.
///
/// # Safety
/// Same contract as [`handle_as_cell`], and the handle must not alias any
/// other cell borrowed by the same call.
pub unsafe fn handle_as_cell_mut<'a>(
    handle: TetherTensorHandle,
) -> Result<&'a mut TensorCell, String> {
    if handle.is_null() {
        return Err("null tensor handle".to_string());
    }
    Ok(unsafe { &mut *handle })
}

/// Releases the cell behind an owning handle.
///
/// # Safety
/// `handle` must be non-null, produced by [`cell_into_handle`], and must not
/// be used again afterwards. Destroying the same handle twice is undefined
/// behavior by contract and is not detected.
pub(crate) unsafe fn destroy_handle(handle: TetherTensorHandle) {
    drop(unsafe { Box::from_raw(handle) });
    LIVE_CELLS.fetch_sub(1, Ordering::SeqCst);
}

pub(crate) fn live_cells() -> i64 {
    LIVE_CELLS.load(Ordering::SeqCst)
}

/// Row-major dense strides for the given sizes. Zero-extent dimensions
/// contribute a step of one so the result matches the layout libtorch
/// reports for densely allocated tensors.
fn contiguous_strides(sizes: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; sizes.len()];
    let mut step = 1i64;
    for i in (0..sizes.len()).rev() {
        strides[i] = step;
        step *= sizes[i].max(1);
    }
    strides
}
