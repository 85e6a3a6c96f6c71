//! Integration test: driver initialization and device queries
//!
//! Run with: cargo test -p gpuexec-driver --test init_test -- --nocapture

use std::sync::Arc;

use gpuexec_core::{BackendKind, DriverConfig, DriverFlags, StatusCode};
use gpuexec_driver::diagnostics::format_driver_version;
use gpuexec_driver::result::CUDA_ERROR_UNKNOWN;
use gpuexec_driver::{ContextOptions, DeviceAttribute, EmulatedDriver, FaultPoint, GpuDriver};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn driver_with(devices: u32, flags: DriverFlags) -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(devices, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), flags);
    (emulated, gpu)
}

#[test]
fn test_injected_init_error() {
    let flags = DriverFlags {
        inject_init_error: true,
        ..Default::default()
    };
    let (_emulated, gpu) = driver_with(2, flags);

    let err = gpu.init().expect_err("injected failure");
    assert_eq!(err.code(), StatusCode::Aborted);
    assert!(err.message().contains("failed call to cuInit"), "{}", err);
    assert!(err.message().contains("CUDA_ERROR_NO_DEVICE"), "{}", err);

    assert_eq!(gpu.device_count(), 0);
    let err = gpu
        .create_context(0, ContextOptions::default())
        .expect_err("driver never initialized");
    assert_eq!(err.code(), StatusCode::Aborted);
}

#[test]
fn test_init_failure_is_cached() {
    let (emulated, gpu) = driver_with(1, DriverFlags::default());
    emulated.inject_failure(FaultPoint::Init, CUDA_ERROR_UNKNOWN);

    let first = gpu.init().expect_err("injected failure");
    assert_eq!(first.code(), StatusCode::Aborted);

    // The fault was one-shot, but the failed outcome sticks.
    let before = emulated.counters().total;
    let second = gpu.init().expect_err("cached failure");
    assert_eq!(second, first);
    assert_eq!(emulated.counters().total, before);
}

#[test]
fn test_init_success_is_cached() {
    let (emulated, gpu) = driver_with(1, DriverFlags::default());
    gpu.init().expect("init");

    let before = emulated.counters().total;
    gpu.init().expect("init again");
    assert_eq!(emulated.counters().total, before);
}

#[test]
fn test_no_devices_fails_init() {
    let (_emulated, gpu) = driver_with(0, DriverFlags::default());
    let err = gpu.init().expect_err("no devices");
    assert_eq!(err.code(), StatusCode::Aborted);
    assert_eq!(gpu.device_count(), 0);
}

#[test]
fn test_device_count() {
    let (_emulated, gpu) = driver_with(3, DriverFlags::default());
    assert_eq!(gpu.device_count(), 3);

    let flags = DriverFlags {
        device_0_only: true,
        ..Default::default()
    };
    let (_emulated, gpu) = driver_with(3, flags);
    assert_eq!(gpu.device_count(), 1);
}

#[test]
fn test_device_queries() {
    let (_emulated, gpu) = driver_with(2, DriverFlags::default());
    gpu.init().expect("init");
    let device = gpu.device(1).expect("device 1");

    let name = gpu.device_name(device).expect("name");
    assert!(!name.is_empty());
    assert_eq!(gpu.device_pci_bus_id(device).expect("pci bus id"), "0000:a2:00.0");
    assert_eq!(gpu.device_total_memory(device), Ok(DEVICE_MEMORY));

    assert_eq!(gpu.compute_capability(device), Ok((8, 0)));
    assert_eq!(gpu.threads_per_warp(device), Ok(32));
    assert_eq!(gpu.max_threads_per_block(device), Ok(1024));
    assert_eq!(gpu.max_threads_per_multiprocessor(device), Ok(2048));
    assert_eq!(gpu.max_shared_memory_per_block(device), Ok(48 * 1024));
    assert_eq!(gpu.max_shared_memory_per_block_optin(device), Ok(99 * 1024));
    assert_eq!(gpu.max_shared_memory_per_core(device), Ok(100 * 1024));
    assert_eq!(gpu.max_registers_per_block(device), Ok(64 * 1024));
    assert!(gpu.multiprocessor_count(device).expect("multiprocessors") > 0);
    assert_eq!(gpu.grid_limits(device), Ok([i32::MAX, 65535, 65535]));
    assert_eq!(gpu.is_ecc_enabled(device), Ok(false));
    assert_eq!(
        gpu.device_attribute(DeviceAttribute::ComputeCapabilityMajor, device),
        Ok(8)
    );
}

#[test]
fn test_bad_ordinal() {
    let (_emulated, gpu) = driver_with(1, DriverFlags::default());
    gpu.init().expect("init");
    let err = gpu.device(4).expect_err("no such device");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("ordinal 4"), "{}", err);
}

#[test]
fn test_driver_version() {
    let (_emulated, gpu) = driver_with(1, DriverFlags::default());
    let version = gpu.driver_version().expect("version");
    assert_eq!(version, 12040);
    assert_eq!(format_driver_version(version), "12.4");
    assert_eq!(format_driver_version(11080), "11.8");
}

#[test]
fn test_from_config_selects_emulated_backend() {
    gpuexec_common::try_init_logging();
    let config = DriverConfig {
        backend: BackendKind::Emulated,
        emulated_devices: 4,
        device_0_only: false,
        ..Default::default()
    };
    let gpu = GpuDriver::from_config(&config).expect("emulated backend");
    assert_eq!(gpu.backend_name(), "emulated");
    assert_eq!(gpu.device_count(), 4);
    assert_eq!(gpu.flags(), config.flags());
}
