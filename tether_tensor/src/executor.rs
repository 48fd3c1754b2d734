//! Pass-through forwarding to a host-registered proxy executor.
//!
//! Some operations in a compiled program are not tensor kernels at all but
//! calls into externally defined compute graphs. The host registers an
//! executor for those, the generated module holds it as an opaque handle,
//! and [`tether_proxy_call`] hands the flattened argument buffers over
//! without interpreting them.

use libc::c_int;

use crate::cell::TetherTensorHandle;
use crate::{clear_error, ffi_guard, ffi_try, TETHER_FAILURE, TETHER_SUCCESS};

/// Invocation contract for externally registered operations. Internals are
/// the host's business; this boundary only promises the call shape.
pub trait ProxyExecutor {
    /// Invokes the externally defined operation selected by `node_index`.
    ///
    /// `int_args` carries the flattened scalar arguments and may be written
    /// through; `tensor_args` carries handles borrowed for the duration of
    /// the call and must not be destroyed by the executor.
    fn call_function(
        &mut self,
        node_index: i32,
        int_args: &mut [i64],
        tensor_args: &[TetherTensorHandle],
    ) -> Result<(), String>;
}

/// Heap cell keeping a registered executor behind a thin pointer.
pub struct ExecutorCell {
    executor: Box<dyn ProxyExecutor>,
}

/// Opaque boundary token naming one registered executor.
pub type TetherExecutorHandle = *mut ExecutorCell;

/// Registers an executor and returns its handle form. Host-side seam; the
/// handle must eventually be released with [`executor_drop`].
pub fn executor_into_handle(executor: Box<dyn ProxyExecutor>) -> TetherExecutorHandle {
    Box::into_raw(Box::new(ExecutorCell { executor }))
}

/// Releases an executor registered through [`executor_into_handle`].
///
/// # Safety
/// `handle` must come from [`executor_into_handle`] and must not be used
/// again afterwards. Null is a no-op.
pub unsafe fn executor_drop(handle: TetherExecutorHandle) {
    if handle.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(handle) });
}

unsafe fn handle_as_executor<'a>(
    handle: TetherExecutorHandle,
) -> Result<&'a mut ExecutorCell, String> {
    if handle.is_null() {
        return Err("null executor handle".to_string());
    }
    Ok(unsafe { &mut *handle })
}

unsafe fn int_args_from_raw<'a>(ptr: *mut i64, count: c_int) -> Result<&'a mut [i64], String> {
    if count < 0 {
        return Err(format!("negative int argument count {}", count));
    }
    if count == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err("null int argument buffer".to_string());
    }
    Ok(unsafe { std::slice::from_raw_parts_mut(ptr, count as usize) })
}

unsafe fn tensor_args_from_raw<'a>(
    ptr: *mut TetherTensorHandle,
    count: c_int,
) -> Result<&'a [TetherTensorHandle], String> {
    if count < 0 {
        return Err(format!("negative tensor argument count {}", count));
    }
    if count == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err("null tensor argument buffer".to_string());
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, count as usize) })
}

/// Forwards flattened argument buffers to the executor behind `executor`.
/// Borrows the executor handle and every handle in `tensor_args`; the
/// buffers are passed through by reference, never interpreted here.
///
/// # Safety
/// `executor` must be a live executor handle; `int_args` must hold
/// `num_ints` writable elements and `tensor_args` `num_tensors` readable
/// handles; every tensor handle must stay live for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn tether_proxy_call(
    executor: TetherExecutorHandle,
    node_index: c_int,
    num_ints: c_int,
    int_args: *mut i64,
    num_tensors: c_int,
    tensor_args: *mut TetherTensorHandle,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        let cell = ffi_try!(unsafe { handle_as_executor(executor) });
        let ints = ffi_try!(unsafe { int_args_from_raw(int_args, num_ints) });
        let tensors = ffi_try!(unsafe { tensor_args_from_raw(tensor_args, num_tensors) });
        ffi_try!(cell.executor.call_function(node_index, ints, tensors));
        TETHER_SUCCESS
    })
}
