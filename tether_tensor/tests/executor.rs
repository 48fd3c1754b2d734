use std::ffi::CStr;
use std::ptr;
use std::sync::{Arc, Mutex};

use libc::c_void;

use tether_tensor::*;

unsafe fn alloc_f32(sizes: &[i64], strides: &[i64]) -> TetherTensorHandle {
    let mut handle: TetherTensorHandle = ptr::null_mut();
    let status = tether_empty_strided(
        sizes.len() as i64,
        sizes.as_ptr(),
        strides.as_ptr(),
        tether_dtype_float32(),
        tether_device_cpu(),
        0,
        &mut handle,
    );
    assert_eq!(status, TETHER_SUCCESS);
    handle
}

unsafe fn data_f32(handle: TetherTensorHandle) -> *mut f32 {
    let mut data: *mut c_void = ptr::null_mut();
    assert_eq!(tether_tensor_data_ptr(handle, &mut data), TETHER_SUCCESS);
    data as *mut f32
}

/// Host-side executor that records what it was handed, mutates the int
/// buffer in place, and runs a matrix multiply through the borrowed tensor
/// handles: inputs in slots 0 and 1, output in slot 2.
struct MatmulExecutor {
    log: Arc<Mutex<Vec<(i32, Vec<i64>)>>>,
}

impl ProxyExecutor for MatmulExecutor {
    fn call_function(
        &mut self,
        node_index: i32,
        int_args: &mut [i64],
        tensor_args: &[TetherTensorHandle],
    ) -> Result<(), String> {
        if node_index != 0 {
            return Err(format!("unknown extern node {}", node_index));
        }
        self.log
            .lock()
            .unwrap()
            .push((node_index, int_args.to_vec()));
        for value in int_args.iter_mut() {
            *value += 1;
        }
        if tensor_args.len() != 3 {
            return Err("expected three tensor arguments".to_string());
        }
        let a = unsafe { handle_as_cell(tensor_args[0]) }?;
        let b = unsafe { handle_as_cell(tensor_args[1]) }?;
        let out = unsafe { handle_as_cell_mut(tensor_args[2]) }?;
        let product = a
            .tensor()
            .f_mm(b.tensor())
            .map_err(|err| err.to_string())?;
        out.tensor_mut().copy_(&product);
        Ok(())
    }
}

#[test]
fn forwarding_hands_buffers_through_untouched() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = executor_into_handle(Box::new(MatmulExecutor { log: log.clone() }));

    unsafe {
        let baseline = tether_tensor_live_count();
        let a = alloc_f32(&[2, 2], &[2, 1]);
        let b = alloc_f32(&[2, 2], &[2, 1]);
        let out = alloc_f32(&[2, 2], &[2, 1]);
        let a_data = data_f32(a);
        let b_data = data_f32(b);
        for i in 0..4 {
            *a_data.add(i) = (i + 1) as f32;
            *b_data.add(i) = if i % 2 == 0 { 1.0 } else { -1.0 };
        }

        let mut int_args = [7i64, -2, 40];
        let mut tensor_args = [a, b, out];
        let status = tether_proxy_call(
            executor,
            0,
            int_args.len() as i32,
            int_args.as_mut_ptr(),
            tensor_args.len() as i32,
            tensor_args.as_mut_ptr(),
        );
        assert_eq!(status, TETHER_SUCCESS);

        // The executor saw the buffers verbatim and wrote through them.
        assert_eq!(*log.lock().unwrap(), vec![(0, vec![7, -2, 40])]);
        assert_eq!(int_args, [8, -1, 41]);

        // a = [[1,2],[3,4]], b = [[1,-1],[1,-1]] => a @ b = [[3,-3],[7,-7]].
        let out_data = data_f32(out);
        let product: Vec<f32> = (0..4).map(|i| *out_data.add(i)).collect();
        assert_eq!(product, vec![3.0, -3.0, 7.0, -7.0]);

        // The executor borrowed the tensors; every handle is still ours to
        // destroy and the live count never moved.
        assert_eq!(tether_tensor_live_count(), baseline + 3);

        // Executor-reported failures become the boundary failure code with
        // detail in the error channel.
        let status = tether_proxy_call(
            executor,
            5,
            0,
            ptr::null_mut(),
            tensor_args.len() as i32,
            tensor_args.as_mut_ptr(),
        );
        assert_eq!(status, TETHER_FAILURE);
        let message = tether_last_error();
        assert!(!message.is_null());
        let text = CStr::from_ptr(message).to_string_lossy().into_owned();
        assert!(text.contains("unknown extern node"), "detail: {}", text);

        // Invocation-shape problems fail without reaching the executor.
        assert_eq!(
            tether_proxy_call(ptr::null_mut(), 0, 0, ptr::null_mut(), 0, ptr::null_mut()),
            TETHER_FAILURE
        );
        assert_eq!(
            tether_proxy_call(executor, 0, -1, ptr::null_mut(), 0, ptr::null_mut()),
            TETHER_FAILURE
        );
        assert_eq!(
            tether_proxy_call(executor, 0, 2, ptr::null_mut(), 0, ptr::null_mut()),
            TETHER_FAILURE
        );
        assert_eq!(log.lock().unwrap().len(), 1);

        for handle in [out, b, a] {
            assert_eq!(tether_tensor_destroy(handle), TETHER_SUCCESS);
        }
        assert_eq!(tether_tensor_live_count(), baseline);
        executor_drop(executor);
    }
}
