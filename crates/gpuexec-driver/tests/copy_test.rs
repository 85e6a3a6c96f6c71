//! Integration test: copy primitive selection and data movement
//!
//! Device-to-device copies within one context must use the intra-device
//! primitive; copies between contexts use the peer primitive.
//!
//! Run with: cargo test -p gpuexec-driver --test copy_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::handle::{DevicePtr, StreamHandle};
use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::{
    CaptureMode, Context, ContextOptions, EmulatedDriver, GpuDriver, GraphInstantiateFlags,
};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup(devices: u32) -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(devices, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    (emulated, gpu)
}

fn upload(gpu: &GpuDriver, context: &Context, data: &[u8]) -> DevicePtr {
    let ptr = gpu
        .device_allocate(context, data.len() as u64)
        .expect("allocation");
    gpu.synchronous_memcpy_h2d(context, ptr, data).expect("h2d");
    ptr
}

fn download(gpu: &GpuDriver, context: &Context, ptr: DevicePtr, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    gpu.synchronous_memcpy_d2h(context, &mut out, ptr).expect("d2h");
    out
}

#[test]
fn test_same_context_copy_is_intra_device() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let src = upload(&gpu, &context, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let dst = gpu.device_allocate(&context, 8).expect("allocation");

    let before = emulated.counters();
    gpu.synchronous_memcpy_d2d(&context, dst, src, 8).expect("d2d");
    let after = emulated.counters();

    assert_eq!(after.memcpy_dtod - before.memcpy_dtod, 1);
    assert_eq!(after.memcpy_peer, before.memcpy_peer);
    assert_eq!(download(&gpu, &context, dst, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_cross_context_copy_uses_peer() {
    let (emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");
    let src = upload(&gpu, &c0, &[42; 32]);
    let dst = gpu.device_allocate(&c1, 32).expect("allocation");

    let before = emulated.counters();
    gpu.synchronous_memcpy_d2d(&c0, dst, src, 32).expect("d2d");
    let after = emulated.counters();

    assert_eq!(after.memcpy_peer - before.memcpy_peer, 1);
    assert_eq!(after.memcpy_dtod, before.memcpy_dtod);
    assert_eq!(download(&gpu, &c1, dst, 32), vec![42; 32]);
}

#[test]
fn test_zero_size_cross_context_copy_skips_peer() {
    let (emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");
    let src = gpu.device_allocate(&c0, 16).expect("allocation");
    let dst = gpu.device_allocate(&c1, 16).expect("allocation");

    let before = emulated.counters();
    gpu.synchronous_memcpy_d2d(&c0, dst, src, 0).expect("empty copy");
    let after = emulated.counters();

    assert_eq!(after.memcpy_dtod - before.memcpy_dtod, 1);
    assert_eq!(after.memcpy_peer, before.memcpy_peer);
}

#[test]
fn test_copy_from_null_fails() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let dst = gpu.device_allocate(&context, 16).expect("allocation");

    let before = emulated.counters();
    let err = gpu
        .synchronous_memcpy_d2d(&context, dst, DevicePtr::null(), 16)
        .expect_err("null source");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert_eq!(emulated.counters().memcpy_dtod - before.memcpy_dtod, 1);
}

#[test]
fn test_async_cross_context_copy_uses_peer() {
    let (emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");
    let stream = gpu.create_stream(&c0, 0).expect("stream");
    let src = upload(&gpu, &c0, &[7; 64]);
    let dst = gpu.device_allocate(&c1, 64).expect("allocation");

    let before = emulated.counters();
    gpu.asynchronous_memcpy_d2d(&c0, dst, src, 64, stream).expect("async d2d");
    gpu.synchronize_stream(&c0, stream).expect("sync");
    let after = emulated.counters();

    assert_eq!(after.memcpy_peer - before.memcpy_peer, 1);
    assert_eq!(after.memcpy_dtod, before.memcpy_dtod);
    assert_eq!(download(&gpu, &c1, dst, 64), vec![7; 64]);
}

#[test]
fn test_async_same_context_copy_is_intra_device() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");
    let src = upload(&gpu, &context, &[5; 16]);
    let dst = gpu.device_allocate(&context, 16).expect("allocation");

    let before = emulated.counters();
    gpu.asynchronous_memcpy_d2d(&context, dst, src, 16, stream).expect("async d2d");
    let after = emulated.counters();

    assert_eq!(after.memcpy_dtod - before.memcpy_dtod, 1);
    assert_eq!(after.memcpy_peer, before.memcpy_peer);
}

#[test]
fn test_capturing_stream_records_intra_device_copy() {
    let (emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");
    let stream = gpu.create_stream(&c0, 0).expect("stream");
    let src = upload(&gpu, &c0, &[9; 16]);
    let dst = gpu.device_allocate(&c1, 16).expect("allocation");

    gpu.stream_begin_capture(&c0, stream, CaptureMode::Global).expect("begin capture");
    let before = emulated.counters();
    gpu.asynchronous_memcpy_d2d(&c0, dst, src, 16, stream).expect("captured d2d");
    let after = emulated.counters();
    let graph = gpu.stream_end_capture(&c0, stream).expect("end capture");

    assert_eq!(after.memcpy_dtod - before.memcpy_dtod, 1);
    assert_eq!(after.memcpy_peer, before.memcpy_peer);
    // Nothing ran yet; the copy is only recorded.
    assert_eq!(download(&gpu, &c1, dst, 16), vec![0; 16]);

    let exec = gpu
        .graph_instantiate(graph, GraphInstantiateFlags::default())
        .expect("instantiate");
    gpu.graph_launch(exec, stream).expect("launch");
    assert_eq!(download(&gpu, &c1, dst, 16), vec![9; 16]);

    gpu.destroy_graph_exec(exec).expect("destroy exec");
    gpu.destroy_graph(graph).expect("destroy graph");
}

#[test]
fn test_captured_copy_becomes_memcpy_node() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");
    let a = gpu.device_allocate(&context, 8).expect("allocation");
    let b = gpu.device_allocate(&context, 8).expect("allocation");

    gpu.stream_begin_capture(&context, stream, CaptureMode::Relaxed)
        .expect("begin capture");
    assert_eq!(gpu.stream_is_capturing(&context, stream), Ok(true));
    gpu.asynchronous_memcpy_d2d(&context, b, a, 8, stream).expect("captured d2d");
    let graph = gpu.stream_end_capture(&context, stream).expect("end capture");
    assert_eq!(gpu.stream_is_capturing(&context, stream), Ok(false));

    let dot = gpu
        .graph_debug_dot_print(graph, &dot_path("captured_copy"), true)
        .expect("dot print");
    assert!(dot.contains("memcpy"), "{}", dot);

    // The null stream never captures.
    assert_eq!(gpu.stream_is_capturing(&context, StreamHandle::null()), Ok(false));
}

#[test]
fn test_async_host_copies() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");
    let ptr = gpu.device_allocate(&context, 8).expect("allocation");

    let src = [10u8, 20, 30, 40, 50, 60, 70, 80];
    let mut dst = [0u8; 8];
    // SAFETY: both buffers outlive the stream synchronization below.
    unsafe {
        gpu.asynchronous_memcpy_h2d(&context, ptr, src.as_ptr(), 8, stream)
            .expect("async h2d");
        gpu.asynchronous_memcpy_d2h(&context, dst.as_mut_ptr(), ptr, 8, stream)
            .expect("async d2h");
    }
    gpu.synchronize_stream(&context, stream).expect("sync");
    assert_eq!(dst, src);
}

fn dot_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("gpuexec_{}_{}.dot", name, std::process::id()))
        .to_string_lossy()
        .into_owned()
}
