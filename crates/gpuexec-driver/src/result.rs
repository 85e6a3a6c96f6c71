//! Native result codes and their translation into [`DriverError`].

use std::fmt::Display;

use gpuexec_core::DriverError;

/// CUDA result type (CUresult).
pub type CUresult = i32;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
pub const CUDA_ERROR_DEINITIALIZED: CUresult = 4;
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;
pub const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;
pub const CUDA_ERROR_INVALID_IMAGE: CUresult = 200;
pub const CUDA_ERROR_INVALID_CONTEXT: CUresult = 201;
pub const CUDA_ERROR_ALREADY_MAPPED: CUresult = 208;
pub const CUDA_ERROR_NO_BINARY_FOR_GPU: CUresult = 209;
pub const CUDA_ERROR_NOT_MAPPED: CUresult = 211;
pub const CUDA_ERROR_PEER_ACCESS_UNSUPPORTED: CUresult = 217;
pub const CUDA_ERROR_INVALID_PTX: CUresult = 218;
pub const CUDA_ERROR_SHARED_OBJECT_INIT_FAILED: CUresult = 303;
pub const CUDA_ERROR_INVALID_HANDLE: CUresult = 400;
pub const CUDA_ERROR_ILLEGAL_STATE: CUresult = 401;
pub const CUDA_ERROR_NOT_FOUND: CUresult = 500;
pub const CUDA_ERROR_NOT_READY: CUresult = 600;
pub const CUDA_ERROR_ILLEGAL_ADDRESS: CUresult = 700;
pub const CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED: CUresult = 704;
pub const CUDA_ERROR_LAUNCH_FAILED: CUresult = 719;
pub const CUDA_ERROR_NOT_PERMITTED: CUresult = 800;
pub const CUDA_ERROR_NOT_SUPPORTED: CUresult = 801;
pub const CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED: CUresult = 900;
pub const CUDA_ERROR_STREAM_CAPTURE_INVALIDATED: CUresult = 901;
pub const CUDA_ERROR_STREAM_CAPTURE_UNMATCHED: CUresult = 903;
pub const CUDA_ERROR_STREAM_CAPTURE_ISOLATION: CUresult = 905;
pub const CUDA_ERROR_STREAM_CAPTURE_WRONG_THREAD: CUresult = 908;
pub const CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE: CUresult = 910;
pub const CUDA_ERROR_UNKNOWN: CUresult = 999;

/// Convert a CUresult error code to its symbolic name.
pub fn cuda_error_name(result: CUresult) -> &'static str {
    match result {
        0 => "CUDA_SUCCESS",
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        4 => "CUDA_ERROR_DEINITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        101 => "CUDA_ERROR_INVALID_DEVICE",
        200 => "CUDA_ERROR_INVALID_IMAGE",
        201 => "CUDA_ERROR_INVALID_CONTEXT",
        208 => "CUDA_ERROR_ALREADY_MAPPED",
        209 => "CUDA_ERROR_NO_BINARY_FOR_GPU",
        211 => "CUDA_ERROR_NOT_MAPPED",
        217 => "CUDA_ERROR_PEER_ACCESS_UNSUPPORTED",
        218 => "CUDA_ERROR_INVALID_PTX",
        303 => "CUDA_ERROR_SHARED_OBJECT_INIT_FAILED",
        400 => "CUDA_ERROR_INVALID_HANDLE",
        401 => "CUDA_ERROR_ILLEGAL_STATE",
        500 => "CUDA_ERROR_NOT_FOUND",
        600 => "CUDA_ERROR_NOT_READY",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        704 => "CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED",
        719 => "CUDA_ERROR_LAUNCH_FAILED",
        800 => "CUDA_ERROR_NOT_PERMITTED",
        801 => "CUDA_ERROR_NOT_SUPPORTED",
        900 => "CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED",
        901 => "CUDA_ERROR_STREAM_CAPTURE_INVALIDATED",
        903 => "CUDA_ERROR_STREAM_CAPTURE_UNMATCHED",
        905 => "CUDA_ERROR_STREAM_CAPTURE_ISOLATION",
        908 => "CUDA_ERROR_STREAM_CAPTURE_WRONG_THREAD",
        910 => "CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

/// Convert a CUresult error code to its human-readable description.
pub fn cuda_error_string(result: CUresult) -> &'static str {
    match result {
        0 => "no error",
        1 => "invalid argument",
        2 => "out of memory",
        3 => "driver not initialized",
        4 => "driver deinitialized",
        100 => "no CUDA-capable device is detected",
        101 => "invalid device ordinal",
        200 => "device kernel image is invalid",
        201 => "invalid device context",
        208 => "resource already mapped",
        209 => "no kernel image is available for execution on the device",
        211 => "resource not mapped",
        217 => "peer access is not supported between these two devices",
        218 => "a PTX JIT compilation failed",
        303 => "shared object initialization failed",
        400 => "invalid resource handle",
        401 => "an illegal state was encountered",
        500 => "named symbol not found",
        600 => "device not ready",
        700 => "an illegal memory access was encountered",
        704 => "peer access is already enabled",
        719 => "unspecified launch failure",
        800 => "operation not permitted",
        801 => "operation not supported",
        900 => "operation not permitted when stream is capturing",
        901 => "operation failed due to a previous error during capture",
        903 => "capture was not initiated in this stream",
        905 => "operation would make the legacy stream depend on a capturing blocking stream",
        908 => "attempt to terminate a thread-local capture sequence from another thread",
        910 => "the graph update was not performed because it included changes which violated constraints specific to instantiated graph update",
        _ => "unknown error",
    }
}

/// `NAME: description`, the form embedded in every error message.
pub fn to_string(result: CUresult) -> String {
    format!("{}: {}", cuda_error_name(result), cuda_error_string(result))
}

/// Map a native failure onto the error taxonomy.
pub fn status_from_result(result: CUresult, what: impl Display) -> DriverError {
    let message = format!("{}: {}", what, to_string(result));
    match result {
        CUDA_ERROR_OUT_OF_MEMORY => DriverError::ResourceExhausted(message),
        CUDA_ERROR_INVALID_VALUE | CUDA_ERROR_INVALID_HANDLE | CUDA_ERROR_INVALID_CONTEXT
        | CUDA_ERROR_INVALID_DEVICE => DriverError::InvalidArgument(message),
        CUDA_ERROR_NOT_FOUND => DriverError::NotFound(message),
        _ => DriverError::Internal(message),
    }
}

/// Turn a unit-returning driver call into a `Result`.
pub(crate) fn check(result: CUresult, what: impl Display) -> gpuexec_core::Result<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(status_from_result(result, what))
    }
}

/// Translation for value-returning driver calls.
pub(crate) trait CuResultExt<T> {
    fn or_status(self, what: impl Display) -> gpuexec_core::Result<T>;
}

impl<T> CuResultExt<T> for Result<T, CUresult> {
    fn or_status(self, what: impl Display) -> gpuexec_core::Result<T> {
        self.map_err(|res| status_from_result(res, what))
    }
}
