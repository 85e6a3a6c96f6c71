//! Integration test: device, host and unified memory plus pointer queries
//!
//! Run with: cargo test -p gpuexec-driver --test memory_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::handle::{DevicePtr, HostPtr, StreamHandle};
use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::{ContextOptions, EmulatedDriver, GpuDriver, MemorySpace};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup(devices: u32) -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(devices, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    (emulated, gpu)
}

#[test]
fn test_host_device_roundtrip() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let ptr = gpu.device_allocate(&context, 1024).expect("allocation");
    let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    gpu.synchronous_memcpy_h2d(&context, ptr, &data).expect("h2d");

    let mut back = vec![0u8; 1024];
    gpu.synchronous_memcpy_d2h(&context, &mut back, ptr).expect("d2h");
    assert_eq!(back, data);

    gpu.device_deallocate(&context, ptr).expect("free");
}

#[test]
fn test_zero_size_allocation_skips_driver() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let before = emulated.counters().total;
    let ptr = gpu.device_allocate(&context, 0).expect("zero-size allocation");
    assert!(ptr.is_null());
    gpu.device_deallocate(&context, ptr).expect("null free");
    assert_eq!(emulated.counters().total, before);
}

#[test]
fn test_allocation_beyond_capacity_fails() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let err = gpu
        .device_allocate(&context, DEVICE_MEMORY + 1)
        .expect_err("too large");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);
    assert!(err.message().contains("CUDA_ERROR_OUT_OF_MEMORY"), "{}", err);
}

#[test]
fn test_double_free_is_reported() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let ptr = gpu.device_allocate(&context, 64).expect("allocation");
    gpu.device_deallocate(&context, ptr).expect("free");
    let err = gpu.device_deallocate(&context, ptr).expect_err("second free");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

#[test]
fn test_memset() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let ptr = gpu.device_allocate(&context, 16).expect("allocation");

    gpu.synchronous_memset_u8(&context, ptr, 0x5a, 16).expect("memset u8");
    let mut back = vec![0u8; 16];
    gpu.synchronous_memcpy_d2h(&context, &mut back, ptr).expect("d2h");
    assert!(back.iter().all(|b| *b == 0x5a));

    gpu.synchronous_memset_u32(&context, ptr, 0xdead_beef, 2).expect("memset u32");
    gpu.synchronous_memcpy_d2h(&context, &mut back, ptr).expect("d2h");
    assert_eq!(&back[..4], &0xdead_beef_u32.to_ne_bytes());
    assert_eq!(&back[4..8], &0xdead_beef_u32.to_ne_bytes());
    assert!(back[8..].iter().all(|b| *b == 0x5a));

    let stream = gpu.create_stream(&context, 0).expect("stream");
    gpu.asynchronous_memset_u8(&context, ptr, 0, 16, stream).expect("async memset u8");
    gpu.asynchronous_memset_u32(&context, ptr.offset(4), 7, 1, stream)
        .expect("async memset u32");
    gpu.synchronize_stream(&context, stream).expect("sync");
    gpu.synchronous_memcpy_d2h(&context, &mut back, ptr).expect("d2h");
    assert_eq!(&back[4..8], &7u32.to_ne_bytes());
    assert!(back[..4].iter().all(|b| *b == 0));
}

#[test]
fn test_pointer_context_and_device() {
    let (_emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    let ptr = gpu.device_allocate(&c1, 4096).expect("allocation");
    let owner = gpu.get_pointer_context(ptr.offset(100)).expect("owner");
    assert!(Arc::ptr_eq(&owner, &c1));
    assert!(!Arc::ptr_eq(&owner, &c0));
    assert_eq!(gpu.get_pointer_device(ptr), Ok(1));
}

#[test]
fn test_pointer_context_of_unregistered_context() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let ptr = gpu.device_allocate(&context, 256).expect("allocation");

    // A second layer over the same backend has never seen the context.
    let other = GpuDriver::new(emulated, DriverFlags::default());
    let err = other.get_pointer_context(ptr).expect_err("unknown context");
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
}

#[test]
fn test_pointer_context_of_pooled_allocation() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");

    let ptr = gpu.stream_allocate(&context, 512, stream).expect("stream allocation");
    let err = gpu.get_pointer_context(ptr).expect_err("pool memory has no context");
    assert_eq!(err.code(), StatusCode::Unavailable);

    gpu.stream_free(&context, ptr, stream).expect("stream free");
}

#[test]
fn test_pointer_memory_space() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let device = gpu.device_allocate(&context, 64).expect("device allocation");
    let host = gpu.host_allocate(&context, 64).expect("host allocation");

    assert_eq!(gpu.get_pointer_memory_space(device), Ok(MemorySpace::Device));
    assert_eq!(
        gpu.get_pointer_memory_space(DevicePtr::from_raw(host.as_raw())),
        Ok(MemorySpace::Host)
    );

    let err = gpu
        .get_pointer_memory_space(DevicePtr::from_raw(0x10))
        .expect_err("unknown pointer");
    assert_eq!(err.code(), StatusCode::Internal);

    gpu.host_deallocate(&context, host).expect("host free");
}

#[test]
fn test_pointer_address_range() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let ptr = gpu.device_allocate(&context, 1000).expect("allocation");
    assert_eq!(gpu.get_pointer_address_range(ptr.offset(999)), Ok((ptr, 1000)));

    let err = gpu
        .get_pointer_address_range(ptr.offset(1000 + 4096))
        .expect_err("outside any allocation");
    assert_eq!(err.code(), StatusCode::NotFound);
}

#[test]
fn test_unified_memory() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let ptr = gpu.unified_memory_allocate(&context, 256).expect("managed allocation");
    assert_eq!(emulated.allocated_bytes(0), 256);
    assert_eq!(gpu.get_pointer_memory_space(ptr), Ok(MemorySpace::Device));

    gpu.synchronous_memcpy_h2d(&context, ptr, &[3u8; 256]).expect("h2d");
    gpu.unified_memory_deallocate(&context, ptr).expect("free");
    assert_eq!(emulated.allocated_bytes(0), 0);
}

#[test]
fn test_host_allocation_is_writable() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let host = gpu.host_allocate(&context, 128).expect("host allocation");
    // SAFETY: fresh 128-byte allocation with no other references.
    let bytes = unsafe { host.as_mut_slice(128) };
    bytes.fill(9);

    let device = gpu.device_allocate(&context, 128).expect("device allocation");
    gpu.synchronous_memcpy_h2d(&context, device, bytes).expect("h2d");
    let mut back = vec![0u8; 128];
    gpu.synchronous_memcpy_d2h(&context, &mut back, device).expect("d2h");
    assert!(back.iter().all(|b| *b == 9));

    gpu.host_deallocate(&context, host).expect("host free");
}

#[test]
fn test_host_register() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let mut buffer = vec![0u8; 4096];
    let ptr = HostPtr::from_ptr(buffer.as_mut_ptr());
    gpu.host_register(&context, ptr, buffer.len() as u64).expect("register");
    assert_eq!(
        gpu.get_pointer_memory_space(DevicePtr::from_raw(ptr.as_raw() + 10)),
        Ok(MemorySpace::Host)
    );

    let err = gpu
        .host_register(&context, ptr, buffer.len() as u64)
        .expect_err("already registered");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    gpu.host_unregister(&context, ptr).expect("unregister");
}

#[test]
fn test_stream_allocation_on_unknown_stream() {
    let (_emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let err = gpu
        .stream_allocate(&context, 64, StreamHandle::from_raw(0xbad))
        .expect_err("no such stream");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}
