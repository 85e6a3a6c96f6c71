//! Integration test: context creation, the context registry and peer access
//!
//! Run with: cargo test -p gpuexec-driver --test context_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::handle::ContextHandle;
use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::driver::CU_CTX_SCHED_BLOCKING_SYNC;
use gpuexec_driver::result::{CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_OUT_OF_MEMORY, CUDA_ERROR_UNKNOWN};
use gpuexec_driver::{
    activation_depth, ContextOptions, Driver, EmulatedDriver, FaultPoint, GpuDriver,
    SchedulePolicy, ScopedActivateContext, SharedMemConfig,
};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup(devices: u32) -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(devices, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    (emulated, gpu)
}

#[test]
fn test_registry_add_is_idempotent() {
    let (_emulated, gpu) = setup(1);
    let registry = gpu.registry();
    let handle = ContextHandle::from_raw(0x1234);

    let first = registry.add(handle, 0);
    let second = registry.add(handle, 0);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.id(), second.id());
    assert_eq!(registry.len(), 1);

    registry.remove(handle);
    assert!(!registry.has(handle));
    assert!(registry.is_empty());

    // A fresh registration after removal gets a fresh ID.
    let third = registry.add(handle, 0);
    assert_ne!(third.id(), first.id());
}

#[test]
fn test_primary_context_is_shared() {
    let (_emulated, gpu) = setup(1);
    let a = gpu.create_context(0, ContextOptions::default()).expect("first context");
    let b = gpu.create_context(0, ContextOptions::default()).expect("second context");

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.device_ordinal(), 0);
    assert_eq!(gpu.registry().len(), 1);
}

#[test]
fn test_create_context_restores_former_current() {
    let (emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    assert_eq!(emulated.ctx_get_current(), Ok(ContextHandle::null()));

    let _guard = ScopedActivateContext::new(&c0);
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    assert_ne!(c0.handle(), c1.handle());
    assert_eq!(emulated.ctx_get_current(), Ok(c0.handle()));
}

#[test]
fn test_flags_applied_to_inactive_primary_context() {
    let (emulated, gpu) = setup(1);
    let options = ContextOptions {
        schedule: SchedulePolicy::BlockingSync,
        lmem_resize_to_max: false,
    };
    gpu.create_context(0, options).expect("context");

    let (flags, active) = emulated.device_primary_ctx_get_state(0).expect("state");
    assert_eq!(flags, CU_CTX_SCHED_BLOCKING_SYNC);
    assert!(active);

    // Different flags on an active context are reported, not applied.
    gpu.create_context(0, ContextOptions::default()).expect("context again");
    let (flags, _) = emulated.device_primary_ctx_get_state(0).expect("state");
    assert_eq!(flags, CU_CTX_SCHED_BLOCKING_SYNC);
}

#[test]
fn test_destroy_context_releases_resources() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let handle = context.handle();

    gpu.device_allocate(&context, 4096).expect("allocation");
    assert_eq!(emulated.allocated_bytes(0), 4096);

    gpu.destroy_context(&context).expect("destroy");
    assert!(!gpu.registry().has(handle));
    assert_eq!(emulated.allocated_bytes(0), 0);
}

#[test]
fn test_failed_release_still_unregisters() {
    let (emulated, gpu) = setup(1);
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    emulated.inject_failure(FaultPoint::PrimaryCtxRelease, CUDA_ERROR_UNKNOWN);
    let err = gpu.destroy_context(&context).expect_err("release fails");

    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("CUDA_ERROR_UNKNOWN"), "{}", err);
    assert!(!gpu.registry().has(context.handle()));
}

#[test]
fn test_retain_out_of_memory_reports_total_memory() {
    let (emulated, gpu) = setup(1);
    emulated.inject_failure(FaultPoint::PrimaryCtxRetain, CUDA_ERROR_OUT_OF_MEMORY);

    let err = gpu
        .create_context(0, ContextOptions::default())
        .expect_err("retain fails");

    assert_eq!(err.code(), StatusCode::ResourceExhausted);
    assert!(
        err.message().contains(&format!("total memory reported: {}", DEVICE_MEMORY)),
        "{}",
        err
    );
    assert!(gpu.registry().is_empty());
}

#[test]
fn test_create_context_rejects_bad_ordinal() {
    let (_emulated, gpu) = setup(1);
    let err = gpu
        .create_context(3, ContextOptions::default())
        .expect_err("no such device");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
}

#[test]
fn test_context_queries() {
    let (_emulated, gpu) = setup(2);
    let context = gpu.create_context(1, ContextOptions::default()).expect("context");

    assert_eq!(gpu.device_from_context(&context), Ok(1));
    gpu.synchronize_context(&context).expect("synchronize");

    gpu.device_allocate(&context, 1024 * 1024).expect("allocation");
    let (free, total) = gpu.device_memory_info(&context).expect("memory info");
    assert_eq!(total, DEVICE_MEMORY);
    assert_eq!(free, DEVICE_MEMORY - 1024 * 1024);
}

#[test]
fn test_peer_access() {
    let (_emulated, gpu) = setup(2);
    let c0 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c1 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    assert_eq!(gpu.can_enable_peer_access(&c0, &c0), Ok(true));
    assert_eq!(gpu.can_enable_peer_access(&c0, &c1), Ok(true));
    assert_eq!(gpu.can_enable_peer_access_between(0, 0), Ok(false));

    gpu.enable_peer_access(&c0, &c1).expect("enable peer access");
    // Already enabled is not an error.
    gpu.enable_peer_access(&c0, &c1).expect("enable peer access again");
    gpu.enable_peer_access(&c0, &c0).expect("same context");
}

#[test]
fn test_shared_mem_config_is_per_context() {
    let (emulated, gpu) = setup(2);
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c2 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    assert_eq!(
        gpu.context_get_shared_mem_config(&c1),
        Ok(SharedMemConfig::DefaultBankSize)
    );
    gpu.context_set_shared_mem_config(&c1, SharedMemConfig::EightByteBankSize)
        .expect("set config");
    assert_eq!(
        gpu.context_get_shared_mem_config(&c1),
        Ok(SharedMemConfig::EightByteBankSize)
    );
    assert_eq!(
        gpu.context_get_shared_mem_config(&c2),
        Ok(SharedMemConfig::DefaultBankSize)
    );
    assert_eq!(activation_depth(), 0);

    {
        let _guard = ScopedActivateContext::new(&c1);
        assert_eq!(emulated.ctx_set_shared_mem_config(7), CUDA_ERROR_INVALID_VALUE);
    }
    assert_eq!(
        gpu.context_get_shared_mem_config(&c1),
        Ok(SharedMemConfig::EightByteBankSize)
    );
}
