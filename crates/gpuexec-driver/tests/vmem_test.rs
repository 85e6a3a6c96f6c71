//! Integration test: virtual memory reservations and mappings
//!
//! Run with: cargo test -p gpuexec-driver --test vmem_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::emulated::EMULATED_GRANULARITY;
use gpuexec_driver::result::CUDA_ERROR_UNKNOWN;
use gpuexec_driver::{Context, ContextOptions, EmulatedDriver, FaultPoint, GpuDriver};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup() -> (Arc<EmulatedDriver>, GpuDriver, Arc<Context>) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(1, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    (emulated, gpu, context)
}

#[test]
fn test_granularity() {
    let (_emulated, gpu, _context) = setup();
    let granularity = gpu.get_min_allocation_granularity(0).expect("granularity");
    assert_eq!(granularity, EMULATED_GRANULARITY);
    assert_eq!(granularity, 65536);
}

#[test]
fn test_map_write_read_unmap() {
    let (emulated, gpu, context) = setup();
    let bytes = 2 * EMULATED_GRANULARITY;

    let span = gpu.reserve_virtual_memory(&context, bytes).expect("reserve");
    assert_eq!(span.size_bytes, bytes);
    assert_eq!(span.base.as_raw() % EMULATED_GRANULARITY, 0);

    let handle = gpu.create_memory_handle(&context, bytes).expect("physical memory");
    assert_eq!(handle.bytes, bytes);
    assert_eq!(emulated.allocated_bytes(0), bytes);

    gpu.map_memory(&context, span.base, &handle, &[0]).expect("map");
    assert!(emulated.is_mapped(span.base));

    let data: Vec<u8> = (0..4096).map(|i| (i % 199) as u8).collect();
    let target = span.base.offset(EMULATED_GRANULARITY);
    gpu.synchronous_memcpy_h2d(&context, target, &data).expect("h2d");
    let mut back = vec![0u8; data.len()];
    gpu.synchronous_memcpy_d2h(&context, &mut back, target).expect("d2h");
    assert_eq!(back, data);

    // Freeing a reservation that is still mapped is refused.
    let err = gpu
        .free_virtual_memory(&context, span)
        .expect_err("still mapped");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    // Physical memory stays alive until its last mapping goes away.
    gpu.release_memory_handle(&context, handle).expect("release");
    assert_eq!(emulated.allocated_bytes(0), bytes);

    gpu.unmap_memory(&context, span.base, bytes).expect("unmap");
    assert!(!emulated.is_mapped(span.base));
    assert_eq!(emulated.allocated_bytes(0), 0);

    gpu.free_virtual_memory(&context, span).expect("free reservation");
}

#[test]
fn test_failed_access_grant_unmaps() {
    let (emulated, gpu, context) = setup();
    let span = gpu
        .reserve_virtual_memory(&context, EMULATED_GRANULARITY)
        .expect("reserve");
    let handle = gpu
        .create_memory_handle(&context, EMULATED_GRANULARITY)
        .expect("physical memory");

    emulated.inject_failure(FaultPoint::MemSetAccess, CUDA_ERROR_UNKNOWN);
    let before = emulated.counters().mem_unmap;
    let err = gpu
        .map_memory(&context, span.base, &handle, &[0])
        .expect_err("access grant fails");

    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("failed to set read/write access"), "{}", err);
    assert_eq!(emulated.counters().mem_unmap - before, 1);
    assert!(!emulated.is_mapped(span.base));

    // The reservation and handle are reusable.
    gpu.map_memory(&context, span.base, &handle, &[0]).expect("map");
    gpu.unmap_memory(&context, span.base, EMULATED_GRANULARITY).expect("unmap");
    gpu.release_memory_handle(&context, handle).expect("release");
    gpu.free_virtual_memory(&context, span).expect("free reservation");
}

#[test]
fn test_double_map_is_rejected() {
    let (_emulated, gpu, context) = setup();
    let span = gpu
        .reserve_virtual_memory(&context, EMULATED_GRANULARITY)
        .expect("reserve");
    let first = gpu
        .create_memory_handle(&context, EMULATED_GRANULARITY)
        .expect("physical memory");
    let second = gpu
        .create_memory_handle(&context, EMULATED_GRANULARITY)
        .expect("physical memory");

    gpu.map_memory(&context, span.base, &first, &[0]).expect("map");
    let err = gpu
        .map_memory(&context, span.base, &second, &[0])
        .expect_err("already mapped");
    assert!(err.message().contains("CUDA_ERROR_ALREADY_MAPPED"), "{}", err);
}

#[test]
fn test_unaligned_sizes_are_rejected() {
    let (_emulated, gpu, context) = setup();

    let err = gpu
        .reserve_virtual_memory(&context, 1000)
        .expect_err("not a multiple of the granularity");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    let err = gpu
        .create_memory_handle(&context, EMULATED_GRANULARITY + 1)
        .expect_err("not a multiple of the granularity");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    let err = gpu
        .create_memory_handle(&context, 2 * DEVICE_MEMORY)
        .expect_err("larger than the device");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);
}

#[test]
fn test_oversized_requests_exhaust_the_address_space() {
    let (_emulated, gpu, context) = setup();

    let err = gpu
        .reserve_virtual_memory(&context, 0xFFFF_FFFF_FFFF_0000)
        .expect_err("past the end of the address space");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);

    let err = gpu
        .device_allocate(&context, u64::MAX)
        .expect_err("larger than the device");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);

    let span = gpu
        .reserve_virtual_memory(&context, EMULATED_GRANULARITY)
        .expect("reservations still work afterwards");
    let handle = gpu
        .create_memory_handle(&context, EMULATED_GRANULARITY)
        .expect("physical memory");

    // A mapping whose end wraps around is outside every reservation.
    let err = gpu
        .map_memory(
            &context,
            span.base,
            &gpuexec_core::handle::GenericMemoryHandle {
                handle: handle.handle,
                bytes: u64::MAX,
            },
            &[0],
        )
        .expect_err("mapping wraps around");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    gpu.release_memory_handle(&context, handle).expect("release");
    gpu.free_virtual_memory(&context, span).expect("free");
}
