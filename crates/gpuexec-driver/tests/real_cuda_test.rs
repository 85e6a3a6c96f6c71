//! Integration test: the vendor backend on real hardware
//!
//! Requires an NVIDIA GPU and driver, so it is ignored by default.
//!
//! Run with: cargo test -p gpuexec-driver --test real_cuda_test -- --ignored --nocapture

use gpuexec_core::DriverFlags;
use gpuexec_driver::{ContextOptions, CudaDriver, GpuDriver};

#[test]
#[ignore]
fn test_real_device_round_trip() {
    gpuexec_common::try_init_logging();
    let driver = CudaDriver::load().expect("CUDA driver library");
    let gpu = GpuDriver::new(driver, DriverFlags::default());
    gpu.init().expect("init");
    assert!(gpu.device_count() > 0);

    let device = gpu.device(0).expect("device 0");
    println!(
        "{} ({}) cc {:?}",
        gpu.device_name(device).expect("name"),
        gpu.device_pci_bus_id(device).expect("pci bus id"),
        gpu.compute_capability(device).expect("compute capability"),
    );

    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let data: Vec<u8> = (0..=255).collect();
    let ptr = gpu.device_allocate(&context, data.len() as u64).expect("allocation");
    gpu.synchronous_memcpy_h2d(&context, ptr, &data).expect("h2d");
    let mut back = vec![0u8; data.len()];
    gpu.synchronous_memcpy_d2h(&context, &mut back, ptr).expect("d2h");
    assert_eq!(back, data);

    gpu.device_deallocate(&context, ptr).expect("free");
    gpu.destroy_context(&context).expect("destroy context");
}
