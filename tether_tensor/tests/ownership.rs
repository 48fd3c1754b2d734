use std::ptr;

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

/// Exercises the whole ownership protocol in one sequential pass so the
/// live-cell counter can be compared against a stable baseline.
#[test]
fn every_owning_handle_destroys_back_to_baseline() {
    let baseline = tether_tensor_live_count();

    unsafe {
        // Plain create/destroy cycles.
        let a = alloc_f32(&[2, 3], &[3, 1]);
        let b = alloc_f32(&[4], &[1]);
        assert_eq!(tether_tensor_live_count(), baseline + 2);
        assert_eq!(tether_tensor_destroy(b), TETHER_SUCCESS);
        assert_eq!(tether_tensor_destroy(a), TETHER_SUCCESS);
        assert_eq!(tether_tensor_live_count(), baseline);

        // A failed creation must not leave a live cell behind.
        let mut out: TetherTensorHandle = ptr::null_mut();
        let sizes = [2i64];
        let strides = [1i64];
        let status = tether_empty_strided(
            1,
            sizes.as_ptr(),
            strides.as_ptr(),
            tether_dtype_uint32(),
            tether_device_cpu(),
            0,
            &mut out,
        );
        assert_eq!(status, TETHER_FAILURE);
        assert_eq!(tether_tensor_live_count(), baseline);

        // Destroying a view leaves its source intact.
        let source = alloc_f32(&[2, 3], &[3, 1]);
        let source_data = data_f32(source);
        for i in 0..6 {
            *source_data.add(i) = i as f32;
        }
        let view_sizes = [6i64];
        let view_strides = [1i64];
        let mut view: TetherTensorHandle = ptr::null_mut();
        let status = tether_tensor_reinterpret(
            source,
            1,
            view_sizes.as_ptr(),
            view_strides.as_ptr(),
            0,
            &mut view,
        );
        assert_eq!(status, TETHER_SUCCESS);
        assert_eq!(tether_tensor_live_count(), baseline + 2);
        assert_eq!(tether_tensor_destroy(view), TETHER_SUCCESS);
        assert_eq!(*data_f32(source).add(5), 5.0);

        // Destroying the source first leaves the view readable: the view's
        // tensor keeps the shared storage alive.
        let mut view: TetherTensorHandle = ptr::null_mut();
        let status = tether_tensor_reinterpret(
            source,
            1,
            view_sizes.as_ptr(),
            view_strides.as_ptr(),
            0,
            &mut view,
        );
        assert_eq!(status, TETHER_SUCCESS);
        assert_eq!(tether_tensor_destroy(source), TETHER_SUCCESS);
        let view_data = data_f32(view);
        for i in 0..6 {
            assert_eq!(*view_data.add(i), i as f32);
        }
        assert_eq!(tether_tensor_destroy(view), TETHER_SUCCESS);

        assert_eq!(tether_tensor_live_count(), baseline);
    }
}
