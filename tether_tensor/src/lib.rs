//! Stable C boundary for ahead-of-time-compiled tensor programs.
//!
//! Generated native modules link against this crate's `cdylib` and drive
//! tensor computation through opaque handles. Tensor math is delegated to
//! libtorch via `tch`; this crate owns only the boundary protocol: handle
//! ownership, the no-unwinding error boundary, zero-copy view construction,
//! the count-tagged trailing-optional dispatch for attention, and forwarding
//! to a host-registered proxy executor.
//!
//! Every exported function returns [`TETHER_SUCCESS`] or [`TETHER_FAILURE`]
//! unless documented otherwise, and documents per handle parameter whether it
//! borrows or consumes. A handle written through an out parameter is always a
//! new owning reference the caller must eventually destroy; out parameters
//! are left untouched when a call fails.

use std::cell::RefCell;
use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use libc::{c_char, c_int, c_void};
use tch::Tensor;

mod attention;
mod cell;
mod dtype;
mod executor;

pub use attention::{tether_flash_attention, TetherAttnOpt};
pub use cell::{handle_as_cell, handle_as_cell_mut, TensorCell, TetherTensorHandle};
pub use dtype::Dtype;
pub use executor::{
    executor_drop, executor_into_handle, tether_proxy_call, ExecutorCell, ProxyExecutor,
    TetherExecutorHandle,
};

/// Status code for a boundary call that completed normally.
pub const TETHER_SUCCESS: c_int = 0;
/// Status code for a boundary call that failed for any reason.
pub const TETHER_FAILURE: c_int = 1;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = RefCell::new(None);
}

pub(crate) fn set_error(message: impl Into<String>) {
    let msg = message.into();
    let cstr = CString::new(msg).unwrap_or_else(|_| CString::new("Unknown error").unwrap());
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(cstr);
    });
}

pub(crate) fn clear_error() {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// The single point where failures are prevented from crossing the boundary.
///
/// Every exported function body is exactly one `ffi_guard` call: a panic
/// raised anywhere below it is caught, its payload recorded in the last-error
/// slot, and the function's failure value returned instead of unwinding into
/// a foreign caller.
pub(crate) fn ffi_guard<T, F>(default: T, f: F) -> T
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "panic across boundary"
            };
            set_error(format!("panic: {}", msg));
            default
        }
    }
}

macro_rules! ffi_try {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                $crate::set_error(err);
                return $crate::TETHER_FAILURE;
            }
        }
    };
}
pub(crate) use ffi_try;

/// Detail channel for the most recent failure on the calling thread.
///
/// Returns null when the last boundary call on this thread succeeded. The
/// pointer stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn tether_last_error() -> *const c_char {
    ffi_guard(ptr::null(), || {
        LAST_ERROR.with(|slot| match &*slot.borrow() {
            Some(msg) => msg.as_ptr(),
            None => ptr::null(),
        })
    })
}

/// Number of tensor cells currently alive in the process. Diagnostic only;
/// a caller that destroys every owning handle it received sees this return
/// to its baseline.
#[no_mangle]
pub extern "C" fn tether_tensor_live_count() -> i64 {
    ffi_guard(-1, cell::live_cells)
}

fn dims_from_raw<'a>(ptr: *const i64, ndim: i64, what: &str) -> Result<&'a [i64], String> {
    if ndim < 0 {
        return Err(format!("negative ndim {} for {}", ndim, what));
    }
    if ndim == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(format!("null {} pointer", what));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, ndim as usize) })
}

// Constant accessors. Values are stable for the process lifetime and
// pairwise distinct across the whole set; generated callers bake them in.

#[no_mangle]
pub extern "C" fn tether_device_cpu() -> i32 {
    dtype::DEVICE_CPU
}

#[no_mangle]
pub extern "C" fn tether_device_cuda() -> i32 {
    dtype::DEVICE_CUDA
}

#[no_mangle]
pub extern "C" fn tether_dtype_uint8() -> i32 {
    Dtype::Uint8.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_int8() -> i32 {
    Dtype::Int8.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_int16() -> i32 {
    Dtype::Int16.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_int32() -> i32 {
    Dtype::Int32.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_int64() -> i32 {
    Dtype::Int64.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_uint16() -> i32 {
    Dtype::Uint16.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_uint32() -> i32 {
    Dtype::Uint32.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_uint64() -> i32 {
    Dtype::Uint64.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_float16() -> i32 {
    Dtype::Float16.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_bfloat16() -> i32 {
    Dtype::BFloat16.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_float32() -> i32 {
    Dtype::Float32.tag()
}

#[no_mangle]
pub extern "C" fn tether_dtype_float64() -> i32 {
    Dtype::Float64.tag()
}

/// Releases the tensor behind an owning handle. Consumes `handle`.
///
/// # Safety
/// `handle` must be an owning handle produced by this crate that has not
/// already been destroyed; destroying it twice or using it afterwards is
/// undefined behavior. A null handle fails cleanly.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_destroy(handle: TetherTensorHandle) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if handle.is_null() {
            set_error("null tensor handle");
            return TETHER_FAILURE;
        }
        unsafe { cell::destroy_handle(handle) };
        TETHER_SUCCESS
    })
}

/// Writes the tensor's data pointer to `ret_ptr`. Borrows `handle`.
///
/// # Safety
/// `handle` must be a live handle; `ret_ptr` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_data_ptr(
    handle: TetherTensorHandle,
    ret_ptr: *mut *mut c_void,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret_ptr.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let cell = ffi_try!(unsafe { handle_as_cell(handle) });
        let data = ffi_try!(cell.data_ptr());
        unsafe {
            *ret_ptr = data;
        }
        TETHER_SUCCESS
    })
}

/// Writes a pointer to the tensor's size array to `ret_sizes`. Borrows
/// `handle`; the pointer aims into the cell's own metadata and stays valid
/// exactly as long as the handle does.
///
/// # Safety
/// `handle` must be a live handle; `ret_sizes` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_sizes(
    handle: TetherTensorHandle,
    ret_sizes: *mut *const i64,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret_sizes.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let cell = ffi_try!(unsafe { handle_as_cell(handle) });
        unsafe {
            *ret_sizes = cell.sizes().as_ptr();
        }
        TETHER_SUCCESS
    })
}

/// Writes a pointer to the tensor's stride array to `ret_strides`. Borrows
/// `handle`; same validity rules as [`tether_tensor_sizes`].
///
/// # Safety
/// `handle` must be a live handle; `ret_strides` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_strides(
    handle: TetherTensorHandle,
    ret_strides: *mut *const i64,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret_strides.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let cell = ffi_try!(unsafe { handle_as_cell(handle) });
        unsafe {
            *ret_strides = cell.strides().as_ptr();
        }
        TETHER_SUCCESS
    })
}

/// Produces a zero-copy view of `handle` with new sizes, strides, and an
/// element-unit offset increment, sharing the source's backing storage.
/// Borrows `handle`; on success writes a new owning handle to `ret`.
///
/// Layouts that would step outside the source storage are rejected by the
/// compute library and surface as a failure.
///
/// # Safety
/// `handle` must be a live handle; `sizes`/`strides` must point to `ndim`
/// readable elements; `ret` must be valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_reinterpret(
    handle: TetherTensorHandle,
    ndim: i64,
    sizes: *const i64,
    strides: *const i64,
    offset_increment: i64,
    ret: *mut TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let sizes = ffi_try!(dims_from_raw(sizes, ndim, "sizes"));
        let strides = ffi_try!(dims_from_raw(strides, ndim, "strides"));
        let source = ffi_try!(unsafe { handle_as_cell(handle) });
        let new_offset = source.storage_offset() + offset_increment;
        if new_offset < 0 {
            set_error(format!("negative storage offset {}", new_offset));
            return TETHER_FAILURE;
        }
        let viewed = ffi_try!(source
            .tensor()
            .f_as_strided(sizes, strides, new_offset)
            .map_err(|err| err.to_string()));
        let cell = TensorCell::from_parts(viewed, sizes.to_vec(), strides.to_vec(), new_offset);
        unsafe {
            *ret = cell::cell_into_handle(Box::new(cell));
        }
        TETHER_SUCCESS
    })
}

/// Allocates a fresh tensor with exactly the requested sizes and strides.
/// On success writes a new owning handle to `ret`; fails when the dtype tag
/// or device cannot be satisfied.
///
/// # Safety
/// `sizes`/`strides` must point to `ndim` readable elements; `ret` must be
/// valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_empty_strided(
    ndim: i64,
    sizes: *const i64,
    strides: *const i64,
    dtype: i32,
    device_kind: i32,
    device_index: i32,
    ret: *mut TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let sizes = ffi_try!(dims_from_raw(sizes, ndim, "sizes"));
        let strides = ffi_try!(dims_from_raw(strides, ndim, "strides"));
        let kind = ffi_try!(dtype::resolve_kind(dtype));
        let device = ffi_try!(dtype::resolve_device(device_kind, device_index));
        let tensor = ffi_try!(
            Tensor::f_empty_strided(sizes, strides, (kind, device)).map_err(|err| err.to_string())
        );
        let cell = TensorCell::from_parts(tensor, sizes.to_vec(), strides.to_vec(), 0);
        unsafe {
            *ret = cell::cell_into_handle(Box::new(cell));
        }
        TETHER_SUCCESS
    })
}

/// Constructs a tensor viewing caller-supplied memory without copying or
/// taking ownership of it. `storage_offset` is in elements. On success
/// writes a new owning handle to `ret`.
///
/// The caller must keep `data` alive and unmoved for as long as any cell
/// viewing it exists; that obligation is documented, not enforced.
///
/// # Safety
/// `data` must point to memory large enough for the described layout;
/// `sizes`/`strides` must point to `ndim` readable elements; `ret` must be
/// valid for a write.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_from_blob(
    data: *mut c_void,
    ndim: i64,
    sizes: *const i64,
    strides: *const i64,
    storage_offset: i64,
    dtype: i32,
    device_kind: i32,
    device_index: i32,
    ret: *mut TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if ret.is_null() {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        if data.is_null() {
            set_error("null data pointer");
            return TETHER_FAILURE;
        }
        if storage_offset < 0 {
            set_error(format!("negative storage offset {}", storage_offset));
            return TETHER_FAILURE;
        }
        let sizes = ffi_try!(dims_from_raw(sizes, ndim, "sizes"));
        let strides = ffi_try!(dims_from_raw(strides, ndim, "strides"));
        let dt = ffi_try!(dtype::resolve_dtype(dtype));
        let kind = ffi_try!(dt.kind());
        let device = ffi_try!(dtype::resolve_device(device_kind, device_index));
        // The offset is folded into the base pointer, so the cell's relative
        // storage offset stays zero and reinterpretation composes on top.
        let base = unsafe { (data as *const u8).add((storage_offset * dt.size_in_bytes()) as usize) };
        let tensor = unsafe { Tensor::from_blob(base, sizes, strides, kind, device) };
        let cell = TensorCell::from_parts(tensor, sizes.to_vec(), strides.to_vec(), 0);
        unsafe {
            *ret = cell::cell_into_handle(Box::new(cell));
        }
        TETHER_SUCCESS
    })
}

/// Copies `src`'s values into `dst` in place. Borrows both handles.
///
/// # Safety
/// Both handles must be live and must not name the same cell.
#[no_mangle]
pub unsafe extern "C" fn tether_tensor_copy(
    src: TetherTensorHandle,
    dst: TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        let src = ffi_try!(unsafe { handle_as_cell(src) });
        let dst = ffi_try!(unsafe { handle_as_cell_mut(dst) });
        dst.tensor_mut().copy_(src.tensor());
        TETHER_SUCCESS
    })
}

/// `out = beta * self + alpha * (mat1 @ mat2)`, written into `out` in place.
/// Borrows all four handles; math is delegated to the compute library.
///
/// # Safety
/// All handles must be live; `out` must not alias the other three.
#[no_mangle]
pub unsafe extern "C" fn tether_addmm_out(
    out: TetherTensorHandle,
    self_: TetherTensorHandle,
    mat1: TetherTensorHandle,
    mat2: TetherTensorHandle,
    beta: f32,
    alpha: f32,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        let out = ffi_try!(unsafe { handle_as_cell_mut(out) });
        let self_ = ffi_try!(unsafe { handle_as_cell(self_) });
        let mat1 = ffi_try!(unsafe { handle_as_cell(mat1) });
        let mat2 = ffi_try!(unsafe { handle_as_cell(mat2) });
        let product = ffi_try!(mat1
            .tensor()
            .f_mm(mat2.tensor())
            .map_err(|err| err.to_string()));
        let blended =
            self_.tensor().shallow_clone() * f64::from(beta) + product * f64::from(alpha);
        out.tensor_mut().copy_(&blended);
        TETHER_SUCCESS
    })
}

/// Batched matrix multiply `out = self @ mat2`, written into `out` in place.
/// Borrows all three handles.
///
/// # Safety
/// All handles must be live; `out` must not alias the inputs.
#[no_mangle]
pub unsafe extern "C" fn tether_bmm_out(
    out: TetherTensorHandle,
    self_: TetherTensorHandle,
    mat2: TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        let out = ffi_try!(unsafe { handle_as_cell_mut(out) });
        let self_ = ffi_try!(unsafe { handle_as_cell(self_) });
        let mat2 = ffi_try!(unsafe { handle_as_cell(mat2) });
        let result = ffi_try!(self_
            .tensor()
            .f_bmm(mat2.tensor())
            .map_err(|err| err.to_string()));
        out.tensor_mut().copy_(&result);
        TETHER_SUCCESS
    })
}

/// Matrix multiply `out = self @ mat2`, written into `out` in place.
/// Borrows all three handles.
///
/// # Safety
/// All handles must be live; `out` must not alias the inputs.
#[no_mangle]
pub unsafe extern "C" fn tether_mm_out(
    out: TetherTensorHandle,
    self_: TetherTensorHandle,
    mat2: TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        let out = ffi_try!(unsafe { handle_as_cell_mut(out) });
        let self_ = ffi_try!(unsafe { handle_as_cell(self_) });
        let mat2 = ffi_try!(unsafe { handle_as_cell(mat2) });
        let result = ffi_try!(self_
            .tensor()
            .f_mm(mat2.tensor())
            .map_err(|err| err.to_string()));
        out.tensor_mut().copy_(&result);
        TETHER_SUCCESS
    })
}
