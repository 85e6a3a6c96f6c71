//! Integration test: module loading, function attributes and kernel launch
//!
//! Run with: cargo test -p gpuexec-driver --test module_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::handle::{DevicePtr, StreamHandle};
use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::emulated::{FILL_U32_PTX, VECTOR_ADD_PTX};
use gpuexec_driver::result::CUDA_ERROR_UNKNOWN;
use gpuexec_driver::{
    Context, ContextOptions, EmulatedDriver, FaultPoint, FuncCachePreference, FunctionAttribute,
    GpuDriver, KernelArg, LaunchDims,
};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

const OVERSUBSCRIBED_PTX: &str = r#"
.version 7.0
.target sm_80
.address_size 64

.visible .entry vector_add(
    .param .u64 a,
    .param .u64 b,
    .param .u64 c,
    .param .u32 n
)
.maxnreg 300
{
    ret;
}
"#;

const UNKNOWN_ENTRY_PTX: &str = r#"
.version 7.0
.target sm_80
.address_size 64

.visible .entry no_such_kernel()
{
    ret;
}
"#;

const GLOBALS_PTX: &str = r#"
.version 7.0
.target sm_80
.address_size 64

.visible .global .align 4 .u32 histogram[16];
.global .f64 scale;

.visible .entry fill_u32(
    .param .u64 out,
    .param .u32 value,
    .param .u32 n
)
{
    ret;
}
"#;

fn setup() -> (Arc<EmulatedDriver>, GpuDriver, Arc<Context>) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(1, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    (emulated, gpu, context)
}

fn upload_f32s(gpu: &GpuDriver, context: &Context, values: &[f32]) -> DevicePtr {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let ptr = gpu
        .device_allocate(context, bytes.len() as u64)
        .expect("allocation");
    gpu.synchronous_memcpy_h2d(context, ptr, &bytes).expect("h2d");
    ptr
}

#[test]
fn test_vector_add() {
    let (emulated, gpu, context) = setup();
    let before = emulated.counters();
    let module = gpu.load_ptx(&context, VECTOR_ADD_PTX).expect("load");
    assert_eq!(emulated.counters().module_loads - before.module_loads, 1);
    let function = gpu
        .get_module_function(&context, module, "vector_add")
        .expect("function");

    let a: Vec<f32> = (0..8).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..8).map(|i| (i * 10) as f32).collect();
    let a_dev = upload_f32s(&gpu, &context, &a);
    let b_dev = upload_f32s(&gpu, &context, &b);
    let c_dev = gpu.device_allocate(&context, 32).expect("allocation");

    gpu.launch_kernel(
        &context,
        "vector_add",
        function,
        &LaunchDims::linear(2, 4),
        StreamHandle::null(),
        &[
            KernelArg::Ptr(a_dev),
            KernelArg::Ptr(b_dev),
            KernelArg::Ptr(c_dev),
            KernelArg::U32(8),
        ],
    )
    .expect("launch");
    assert_eq!(emulated.counters().kernel_launches - before.kernel_launches, 1);

    let mut bytes = [0u8; 32];
    gpu.synchronous_memcpy_d2h(&context, &mut bytes, c_dev).expect("d2h");
    let c: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|x| f32::from_ne_bytes([x[0], x[1], x[2], x[3]]))
        .collect();
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    assert_eq!(c, expected);

    gpu.unload_module(&context, module).expect("unload");
}

#[test]
fn test_register_allocation_failure_is_resource_exhausted() {
    let (_emulated, gpu, context) = setup();
    let err = gpu
        .load_ptx(&context, OVERSUBSCRIBED_PTX)
        .expect_err("too many registers");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);
    assert!(err.message().contains("register allocation failed"), "{}", err);
}

#[test]
fn test_unknown_entry_fails_to_load() {
    let (_emulated, gpu, context) = setup();
    let err = gpu
        .load_ptx(&context, UNKNOWN_ENTRY_PTX)
        .expect_err("no host kernel");
    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("Failed to load PTX text as a module"), "{}", err);
    assert!(err.message().contains("CUDA_ERROR_INVALID_PTX"), "{}", err);
}

#[test]
fn test_load_fault_is_internal() {
    let (emulated, gpu, context) = setup();
    emulated.inject_failure(FaultPoint::ModuleLoad, CUDA_ERROR_UNKNOWN);
    let err = gpu.load_ptx(&context, FILL_U32_PTX).expect_err("injected");
    assert_eq!(err.code(), StatusCode::Internal);

    gpu.load_ptx(&context, FILL_U32_PTX).expect("second load succeeds");
}

#[test]
fn test_load_cubin() {
    let (_emulated, gpu, context) = setup();
    let module = gpu
        .load_cubin(&context, FILL_U32_PTX.as_bytes())
        .expect("load image");
    gpu.get_module_function(&context, module, "fill_u32")
        .expect("function");

    let err = gpu
        .load_cubin(&context, b"\x7fELF not really a cubin")
        .expect_err("malformed image");
    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("failed to load in-memory CUBIN"), "{}", err);
}

#[test]
fn test_missing_function_is_not_found() {
    let (_emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, FILL_U32_PTX).expect("load");
    let err = gpu
        .get_module_function(&context, module, "vector_add")
        .expect_err("not in module");
    assert_eq!(err.code(), StatusCode::NotFound);
}

#[test]
fn test_module_globals() {
    let (emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, GLOBALS_PTX).expect("load");

    let (histogram, bytes) = gpu
        .get_module_symbol(&context, module, "histogram")
        .expect("histogram");
    assert!(!histogram.is_null());
    assert_eq!(bytes, 64);
    let (_, bytes) = gpu.get_module_symbol(&context, module, "scale").expect("scale");
    assert_eq!(bytes, 8);
    assert_eq!(emulated.allocated_bytes(0), 72);

    let err = gpu
        .get_module_symbol(&context, module, "missing")
        .expect_err("no such symbol");
    assert_eq!(err.code(), StatusCode::NotFound);

    gpu.unload_module(&context, module).expect("unload");
    assert_eq!(emulated.allocated_bytes(0), 0);
}

#[test]
fn test_unload_errors() {
    let (emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, FILL_U32_PTX).expect("load");

    emulated.inject_failure(FaultPoint::ModuleUnload, CUDA_ERROR_UNKNOWN);
    let err = gpu.unload_module(&context, module).expect_err("injected");
    assert_eq!(err.code(), StatusCode::Internal);

    gpu.unload_module(&context, module).expect("unload");
    let err = gpu.unload_module(&context, module).expect_err("already unloaded");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

#[test]
fn test_launch_raises_dynamic_shared_memory_limit() {
    let (_emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, FILL_U32_PTX).expect("load");
    let function = gpu
        .get_module_function(&context, module, "fill_u32")
        .expect("function");
    let out = gpu.device_allocate(&context, 16).expect("allocation");
    let args = [KernelArg::Ptr(out), KernelArg::U32(1), KernelArg::U32(4)];

    assert_eq!(
        gpu.func_get_attribute(FunctionAttribute::MaxDynamicSharedSizeBytes, function),
        Ok(48 * 1024)
    );
    gpu.launch_kernel(
        &context,
        "fill_u32",
        function,
        &LaunchDims::linear(1, 4).with_shared_mem(65536),
        StreamHandle::null(),
        &args,
    )
    .expect("launch with large shared memory");
    assert_eq!(
        gpu.func_get_attribute(FunctionAttribute::MaxDynamicSharedSizeBytes, function),
        Ok(65536)
    );

    let err = gpu
        .launch_kernel(
            &context,
            "fill_u32",
            function,
            &LaunchDims::linear(1, 4).with_shared_mem(200 * 1024),
            StreamHandle::null(),
            &args,
        )
        .expect_err("beyond the opt-in limit");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("failed to set shared memory size"), "{}", err);
}

#[test]
fn test_launch_rejects_oversized_block() {
    let (_emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, FILL_U32_PTX).expect("load");
    let function = gpu
        .get_module_function(&context, module, "fill_u32")
        .expect("function");
    let out = gpu.device_allocate(&context, 16).expect("allocation");

    let err = gpu
        .launch_kernel(
            &context,
            "fill_u32",
            function,
            &LaunchDims::linear(1, 1025),
            StreamHandle::null(),
            &[KernelArg::Ptr(out), KernelArg::U32(1), KernelArg::U32(4)],
        )
        .expect_err("too many threads");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("fill_u32"), "{}", err);
}

#[test]
fn test_function_attributes_and_occupancy() {
    let (_emulated, gpu, context) = setup();
    let module = gpu.load_ptx(&context, FILL_U32_PTX).expect("load");
    let function = gpu
        .get_module_function(&context, module, "fill_u32")
        .expect("function");

    assert_eq!(
        gpu.func_get_attribute(FunctionAttribute::MaxThreadsPerBlock, function),
        Ok(1024)
    );
    assert_eq!(gpu.func_get_attribute(FunctionAttribute::NumRegs, function), Ok(32));
    gpu.func_set_cache_config(function, FuncCachePreference::PreferShared)
        .expect("cache config");

    assert_eq!(gpu.max_occupied_blocks_per_core(&context, function, 256, 0), Ok(8));
    assert_eq!(
        gpu.max_occupied_blocks_per_core(&context, function, 128, 50 * 1024),
        Ok(2)
    );
    let err = gpu
        .max_occupied_blocks_per_core(&context, function, 0, 0)
        .expect_err("empty block");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}
