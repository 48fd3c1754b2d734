//! Count-tagged trailing-optional dispatch for scaled-dot-product flash
//! attention.
//!
//! The boundary signature is frozen, but the operation grew optional
//! parameters over time: dropout probability, then a causal-masking flag,
//! then a debug-mask flag, then an explicit scale. Callers declare up front
//! how many logical inputs they are supplying (`query`/`key`/`value` plus
//! zero to four trailing optionals) and pass the optionals as an array of
//! fixed-width slots. Old callers built against a shorter list keep working
//! by declaring a smaller count; decode never reads past it.

use libc::c_int;
use tch::Tensor;

use crate::cell::{cell_into_handle, handle_as_cell, TensorCell, TetherTensorHandle};
use crate::{clear_error, ffi_guard, ffi_try, set_error, TETHER_FAILURE, TETHER_SUCCESS};

pub(crate) const MIN_INPUTS: i32 = 3;
pub(crate) const MAX_INPUTS: i32 = 7;

/// One trailing optional argument slot.
///
/// Eight bytes wide; the field read from each slot is fixed by contract
/// between caller and callee generation, not self-described: slot 0 is the
/// dropout probability (`as_double`), slots 1 and 2 are flags (`as_int`,
/// nonzero means true), slot 3 is the attention scale (`as_double`).
#[repr(C)]
#[derive(Clone, Copy)]
pub union TetherAttnOpt {
    pub as_double: f64,
    pub as_int: i32,
}

#[derive(Default)]
struct AttnOptions {
    dropout_p: f64,
    is_causal: bool,
    return_debug_mask: bool,
    scale: Option<f64>,
}

/// Decodes the declared optionals, leaving defaults in every undeclared
/// slot. `num_inputs` has already been range-checked.
unsafe fn decode_options(
    num_inputs: i32,
    opts: *const TetherAttnOpt,
) -> Result<AttnOptions, String> {
    let declared = (num_inputs - MIN_INPUTS) as usize;
    let mut decoded = AttnOptions::default();
    if declared == 0 {
        return Ok(decoded);
    }
    if opts.is_null() {
        return Err("null optional-argument buffer".to_string());
    }
    let slots = unsafe { std::slice::from_raw_parts(opts, declared) };
    decoded.dropout_p = unsafe { slots[0].as_double };
    if declared >= 2 {
        decoded.is_causal = unsafe { slots[1].as_int } != 0;
    }
    if declared >= 3 {
        decoded.return_debug_mask = unsafe { slots[2].as_int } != 0;
    }
    if declared >= 4 {
        decoded.scale = Some(unsafe { slots[3].as_double });
    }
    Ok(decoded)
}

#[allow(clippy::type_complexity)]
fn flash_attention_impl(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    options: &AttnOptions,
) -> Result<(Tensor, Tensor, Tensor, Tensor, i64, i64, Tensor, Tensor, Tensor), String> {
    query
        .f_internal_scaled_dot_product_flash_attention(
            key,
            value,
            options.dropout_p,
            options.is_causal,
            options.return_debug_mask,
            options.scale,
        )
        .map_err(|err| err.to_string())
}

/// Flash attention over borrowed `query`/`key`/`value` handles with a
/// caller-declared count of trailing optionals.
///
/// `num_inputs` counts the logical inputs: 3 for just the tensors, up to 7
/// with all optionals. Counts outside `[3, 7]` fail immediately without
/// reading `opts`; `opts` may be null when `num_inputs` is 3 and must hold
/// `num_inputs - 3` slots otherwise. A count of 3 behaves identically to a
/// count of 7 whose slots carry the defaults.
///
/// On success every tensor output slot receives a new owning handle:
/// attention output, logsumexp, the two cumulative-sequence tensors
/// (`ret_cum_seq_q`/`ret_cum_seq_k` may be passed as null and are then
/// skipped), the RNG state pair, and the debug mask; `ret_max_q`/`ret_max_k`
/// receive the per-batch maximum sequence lengths.
///
/// # Safety
/// The tensor handles must be live; every non-null output pointer must be
/// valid for a write; `opts` must hold the declared number of slots.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tether_flash_attention(
    ret_out: *mut TetherTensorHandle,
    ret_logsumexp: *mut TetherTensorHandle,
    ret_cum_seq_q: *mut TetherTensorHandle,
    ret_cum_seq_k: *mut TetherTensorHandle,
    ret_max_q: *mut i64,
    ret_max_k: *mut i64,
    ret_rng_seed: *mut TetherTensorHandle,
    ret_rng_offset: *mut TetherTensorHandle,
    ret_debug_mask: *mut TetherTensorHandle,
    num_inputs: i32,
    query: TetherTensorHandle,
    key: TetherTensorHandle,
    value: TetherTensorHandle,
    opts: *const TetherAttnOpt,
) -> c_int {
    ffi_guard(TETHER_FAILURE, || {
        clear_error();
        if !(MIN_INPUTS..=MAX_INPUTS).contains(&num_inputs) {
            set_error(format!(
                "flash attention expects between {} and {} inputs, got {}",
                MIN_INPUTS, MAX_INPUTS, num_inputs
            ));
            return TETHER_FAILURE;
        }
        if ret_out.is_null()
            || ret_logsumexp.is_null()
            || ret_max_q.is_null()
            || ret_max_k.is_null()
            || ret_rng_seed.is_null()
            || ret_rng_offset.is_null()
            || ret_debug_mask.is_null()
        {
            set_error("null output pointer");
            return TETHER_FAILURE;
        }
        let options = ffi_try!(unsafe { decode_options(num_inputs, opts) });
        let query = ffi_try!(unsafe { handle_as_cell(query) });
        let key = ffi_try!(unsafe { handle_as_cell(key) });
        let value = ffi_try!(unsafe { handle_as_cell(value) });
        let (out, logsumexp, cum_seq_q, cum_seq_k, max_q, max_k, rng_seed, rng_offset, debug_mask) =
            ffi_try!(flash_attention_impl(
                query.tensor(),
                key.tensor(),
                value.tensor(),
                &options
            ));
        // Wrap everything before writing any output slot so a wrapping
        // failure leaves the caller's outputs untouched.
        let out = ffi_try!(TensorCell::from_library(out));
        let logsumexp = ffi_try!(TensorCell::from_library(logsumexp));
        let cum_seq_q = ffi_try!(TensorCell::from_library(cum_seq_q));
        let cum_seq_k = ffi_try!(TensorCell::from_library(cum_seq_k));
        let rng_seed = ffi_try!(TensorCell::from_library(rng_seed));
        let rng_offset = ffi_try!(TensorCell::from_library(rng_offset));
        let debug_mask = ffi_try!(TensorCell::from_library(debug_mask));
        unsafe {
            *ret_out = cell_into_handle(Box::new(out));
            *ret_logsumexp = cell_into_handle(Box::new(logsumexp));
            if !ret_cum_seq_q.is_null() {
                *ret_cum_seq_q = cell_into_handle(Box::new(cum_seq_q));
            }
            if !ret_cum_seq_k.is_null() {
                *ret_cum_seq_k = cell_into_handle(Box::new(cum_seq_k));
            }
            *ret_max_q = max_q;
            *ret_max_k = max_k;
            *ret_rng_seed = cell_into_handle(Box::new(rng_seed));
            *ret_rng_offset = cell_into_handle(Box::new(rng_offset));
            *ret_debug_mask = cell_into_handle(Box::new(debug_mask));
        }
        TETHER_SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undeclared_slots_decode_to_defaults() {
        let options = unsafe { decode_options(3, std::ptr::null()) }.unwrap();
        assert_eq!(options.dropout_p, 0.0);
        assert!(!options.is_causal);
        assert!(!options.return_debug_mask);
        assert!(options.scale.is_none());
    }

    #[test]
    fn decode_stops_at_the_declared_count() {
        let slots = [
            TetherAttnOpt { as_double: 0.25 },
            TetherAttnOpt { as_int: 1 },
        ];
        let options = unsafe { decode_options(5, slots.as_ptr()) }.unwrap();
        assert_eq!(options.dropout_p, 0.25);
        assert!(options.is_causal);
        assert!(!options.return_debug_mask);
        assert!(options.scale.is_none());
    }

    #[test]
    fn all_slots_decode_with_their_contract_types() {
        let slots = [
            TetherAttnOpt { as_double: 0.5 },
            TetherAttnOpt { as_int: 0 },
            TetherAttnOpt { as_int: 2 },
            TetherAttnOpt { as_double: 0.125 },
        ];
        let options = unsafe { decode_options(7, slots.as_ptr()) }.unwrap();
        assert_eq!(options.dropout_p, 0.5);
        assert!(!options.is_causal);
        assert!(options.return_debug_mask);
        assert_eq!(options.scale, Some(0.125));
    }

    #[test]
    fn declared_optionals_require_a_buffer() {
        assert!(unsafe { decode_options(4, std::ptr::null()) }.is_err());
    }
}
