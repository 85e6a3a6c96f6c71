//! Integration test: scoped context activation
//!
//! Drives ScopedActivateContext against the emulated backend and checks the
//! native "set current" traffic it produces.
//!
//! Run with: cargo test -p gpuexec-driver --test activation_test -- --nocapture

use std::process::Command;
use std::sync::Arc;

use gpuexec_core::DriverFlags;
use gpuexec_driver::result::{CUDA_ERROR_UNKNOWN, CUDA_SUCCESS};
use gpuexec_driver::{
    activation_depth, current_context_id, ContextOptions, Driver, EmulatedDriver, FaultPoint,
    GpuDriver, ScopedActivateContext,
};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup(devices: u32, flags: DriverFlags) -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(devices, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), flags);
    (emulated, gpu)
}

#[test]
fn test_nested_activation_restores_outer_context() {
    let (emulated, gpu) = setup(2, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c2 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");
    assert_eq!(activation_depth(), 0);

    {
        let _outer = ScopedActivateContext::new(&c1);
        assert_eq!(current_context_id(), c1.id());
        assert_eq!(emulated.ctx_get_current(), Ok(c1.handle()));
        assert_eq!(activation_depth(), 1);

        {
            let _inner = ScopedActivateContext::new(&c2);
            assert_eq!(current_context_id(), c2.id());
            assert_eq!(emulated.ctx_get_current(), Ok(c2.handle()));
            assert_eq!(activation_depth(), 2);
        }

        assert_eq!(current_context_id(), c1.id());
        assert_eq!(emulated.ctx_get_current(), Ok(c1.handle()));
        assert_eq!(activation_depth(), 1);
    }

    assert_eq!(activation_depth(), 0);
}

#[test]
fn test_reactivating_same_context_sets_current_once() {
    let (emulated, gpu) = setup(1, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context");

    let before = emulated.counters().ctx_set_current;
    {
        let _outer = ScopedActivateContext::new(&c1);
        let _inner = ScopedActivateContext::new(&c1);
        assert_eq!(activation_depth(), 2);
    }
    let after = emulated.counters().ctx_set_current;

    assert_eq!(after - before, 1, "same-context activation must not call set current again");
}

#[test]
fn test_switching_contexts_sets_and_restores() {
    let (emulated, gpu) = setup(2, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c2 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    let before = emulated.counters().ctx_set_current;
    {
        let _outer = ScopedActivateContext::new(&c1);
        let _inner = ScopedActivateContext::new(&c2);
    }
    let after = emulated.counters().ctx_set_current;

    // Activate c1, switch to c2, switch back to c1.
    assert_eq!(after - before, 3);
}

#[test]
fn test_sync_around_driver_calls_synchronizes_nested_activations() {
    let flags = DriverFlags {
        sync_around_driver_calls: true,
        ..DriverFlags::default()
    };
    let (emulated, gpu) = setup(1, flags);
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context");

    // Nothing is current yet, so only the exit synchronizes.
    let before = emulated.counters().ctx_synchronize;
    drop(ScopedActivateContext::new(&c1));
    assert_eq!(emulated.counters().ctx_synchronize - before, 1);

    // An outermost guard leaves its context current.
    let before = emulated.counters().ctx_synchronize;
    {
        let _outer = ScopedActivateContext::new(&c1);
        let _inner = ScopedActivateContext::new(&c1);
    }
    let after = emulated.counters().ctx_synchronize;

    // Both entries and both exits.
    assert_eq!(after - before, 4);
}

#[test]
fn test_activation_state_is_per_thread() {
    let (_emulated, gpu) = setup(1, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context");

    let _guard = ScopedActivateContext::new(&c1);
    assert_eq!(activation_depth(), 1);

    let remote = Arc::clone(&c1);
    let seen = std::thread::spawn(move || {
        let depth_before = activation_depth();
        let id_inside = {
            let _guard = ScopedActivateContext::new(&remote);
            current_context_id()
        };
        (depth_before, id_inside, activation_depth())
    })
    .join()
    .expect("thread joins");

    assert_eq!(seen, (0, c1.id(), 0));
    assert_eq!(activation_depth(), 1);
}

#[test]
fn test_operations_leave_depth_balanced() {
    let (_emulated, gpu) = setup(1, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context");

    let ptr = gpu.device_allocate(&c1, 256).expect("allocation");
    gpu.synchronous_memset_u8(&c1, ptr, 0xab, 256).expect("memset");
    gpu.device_deallocate(&c1, ptr).expect("free");

    assert_eq!(activation_depth(), 0);
}

// ── Fatal paths ─────────────────────────────────────────────────────────────
//
// A fatal activation error aborts the process, so each case runs in a child
// copy of this test binary that executes only `fatal_case_child`.

const FATAL_CASE_ENV: &str = "GPUEXEC_FATAL_CASE";

#[test]
fn fatal_case_child() {
    let Ok(case) = std::env::var(FATAL_CASE_ENV) else {
        return;
    };
    let (emulated, gpu) = setup(2, DriverFlags::default());
    let c1 = gpu.create_context(0, ContextOptions::default()).expect("context on device 0");
    let c2 = gpu.create_context(1, ContextOptions::default()).expect("context on device 1");

    match case.as_str() {
        "activate" => {
            emulated.inject_failure(FaultPoint::CtxSetCurrent, CUDA_ERROR_UNKNOWN);
            let _guard = ScopedActivateContext::new(&c1);
        }
        "restore" => {
            let _outer = ScopedActivateContext::new(&c1);
            let inner = ScopedActivateContext::new(&c2);
            emulated.inject_failure(FaultPoint::CtxSetCurrent, CUDA_ERROR_UNKNOWN);
            drop(inner);
        }
        "drift" => {
            let _outer = ScopedActivateContext::new(&c1);
            // Switch behind the guard's back.
            assert_eq!(emulated.ctx_set_current(c2.handle()), CUDA_SUCCESS);
            let _inner = ScopedActivateContext::new(&c1);
        }
        other => panic!("unknown fatal case {}", other),
    }
}

fn run_fatal_case(case: &str) -> (std::process::ExitStatus, String) {
    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args(["fatal_case_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(FATAL_CASE_ENV, case)
        .env(gpuexec_common::logging::LOG_ENV, "error")
        .output()
        .expect("spawn child test binary");
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    (output.status, log)
}

fn assert_aborted(status: std::process::ExitStatus, log: &str) {
    assert!(!status.success(), "child exited cleanly:\n{}", log);
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(6), "child was not aborted:\n{}", log);
    }
}

#[test]
fn test_set_current_failure_on_activation_aborts() {
    let (status, log) = run_fatal_case("activate");
    assert_aborted(status, &log);
    assert!(log.contains("failed setting context"), "{}", log);
}

#[test]
fn test_set_current_failure_on_restore_aborts() {
    let (status, log) = run_fatal_case("restore");
    assert_aborted(status, &log);
    assert!(log.contains("failed setting context"), "{}", log);
}

#[test]
fn test_current_context_drift_aborts_in_debug_builds() {
    let (status, log) = run_fatal_case("drift");
    if cfg!(debug_assertions) {
        assert_aborted(status, &log);
        assert!(log.contains("does not match tracked context"), "{}", log);
    } else {
        assert!(status.success(), "{}", log);
    }
}
