use super::{FrozenModel, DEFAULT_INPUT, DEFAULT_OUTPUT};
use ndarray::Array2;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;

pub const INFERENCE_OK: c_int = 0;
pub const INFERENCE_NULL_ARGUMENT: c_int = -1;
pub const INFERENCE_RUN_FAILED: c_int = -2;
pub const INFERENCE_BUFFER_TOO_SMALL: c_int = -3;

pub struct InferenceEngine {
    model: FrozenModel,
}

/// Load a frozen graph whose endpoints are `input` and `output`.
/// Returns null on any failure.
#[no_mangle]
pub extern "C" fn inference_new(model_path: *const c_char) -> *mut InferenceEngine {
    if model_path.is_null() {
        return std::ptr::null_mut();
    }
    let c_str = unsafe { CStr::from_ptr(model_path) };
    let path = PathBuf::from(c_str.to_string_lossy().into_owned());
    match FrozenModel::load_mmap(&path, DEFAULT_INPUT, DEFAULT_OUTPUT)
        .or_else(|_| FrozenModel::load(&path, DEFAULT_INPUT, DEFAULT_OUTPUT))
    {
        Ok(model) => Box::into_raw(Box::new(InferenceEngine { model })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Run on a row-major `rows` x `cols` int32 matrix. The output is written
/// row-major to `out_ptr`, which must hold `out_capacity` elements.
#[no_mangle]
pub extern "C" fn inference_run(
    engine: *mut InferenceEngine,
    input: *const i32,
    rows: usize,
    cols: usize,
    out_ptr: *mut i32,
    out_capacity: usize,
    out_len: *mut usize,
) -> c_int {
    if engine.is_null() || input.is_null() || out_ptr.is_null() || out_len.is_null() {
        return INFERENCE_NULL_ARGUMENT;
    }
    let engine = unsafe { &mut *engine };
    let Some(count) = rows.checked_mul(cols) else {
        return INFERENCE_RUN_FAILED;
    };
    let values = unsafe { std::slice::from_raw_parts(input, count) }.to_vec();
    let Ok(matrix) = Array2::from_shape_vec((rows, cols), values) else {
        return INFERENCE_RUN_FAILED;
    };
    let output = match engine.model.run_i32(matrix) {
        Ok(output) => output,
        Err(_) => return INFERENCE_RUN_FAILED,
    };
    unsafe {
        *out_len = output.len();
    }
    if output.len() > out_capacity {
        return INFERENCE_BUFFER_TOO_SMALL;
    }
    let flat: Vec<i32> = output.iter().copied().collect();
    unsafe {
        std::ptr::copy_nonoverlapping(flat.as_ptr(), out_ptr, flat.len());
    }
    INFERENCE_OK
}

#[no_mangle]
pub extern "C" fn inference_free(engine: *mut InferenceEngine) {
    if !engine.is_null() {
        unsafe { drop(Box::from_raw(engine)); }
    }
}
