//! Integration test: streams, events and host callbacks
//!
//! Run with: cargo test -p gpuexec-driver --test stream_event_test -- --nocapture

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gpuexec_core::handle::{EventHandle, StreamHandle};
use gpuexec_core::{DriverFlags, StatusCode};
use gpuexec_driver::result::{CUDA_ERROR_OUT_OF_MEMORY, CUDA_ERROR_UNKNOWN};
use gpuexec_driver::{
    CaptureMode, ContextOptions, EmulatedDriver, EventFlags, EventStatus, FaultPoint, GpuDriver,
    StreamPriority,
};

const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;

fn setup() -> (Arc<EmulatedDriver>, GpuDriver) {
    gpuexec_common::try_init_logging();
    let emulated = Arc::new(EmulatedDriver::new(1, DEVICE_MEMORY));
    let gpu = GpuDriver::new(emulated.clone(), DriverFlags::default());
    (emulated, gpu)
}

#[test]
fn test_destroy_null_event_makes_no_driver_call() {
    let (emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let before = emulated.counters();
    let err = gpu
        .destroy_event(&context, EventHandle::null())
        .expect_err("null event");
    let after = emulated.counters();

    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert_eq!(after, before);
}

#[test]
fn test_event_lifecycle() {
    let (emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");

    let start = gpu.init_event(&context, EventFlags::Default).expect("start event");
    let stop = gpu.init_event(&context, EventFlags::Default).expect("stop event");
    gpu.record_event(&context, start, stream).expect("record start");
    gpu.record_event(&context, stop, stream).expect("record stop");

    assert_eq!(gpu.query_event(&context, stop), Ok(EventStatus::Complete));
    let elapsed = gpu
        .event_elapsed_time(&context, start, stop)
        .expect("elapsed time");
    assert!(elapsed >= 0.0, "elapsed {}", elapsed);

    let before = emulated.counters().event_destroy;
    gpu.destroy_event(&context, start).expect("destroy start");
    gpu.destroy_event(&context, stop).expect("destroy stop");
    assert_eq!(emulated.counters().event_destroy - before, 2);

    let err = gpu.destroy_event(&context, stop).expect_err("already destroyed");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("CUDA_ERROR_INVALID_HANDLE"), "{}", err);
}

#[test]
fn test_elapsed_time_requires_timing() {
    let (_emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let start = gpu.init_event(&context, EventFlags::DisableTiming).expect("event");
    let stop = gpu.init_event(&context, EventFlags::DisableTiming).expect("event");
    gpu.record_event(&context, start, StreamHandle::null()).expect("record");
    gpu.record_event(&context, stop, StreamHandle::null()).expect("record");

    let err = gpu
        .event_elapsed_time(&context, start, stop)
        .expect_err("timing disabled");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("elapsed time"), "{}", err);
}

#[test]
fn test_event_creation_failures() {
    let (emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    emulated.inject_failure(FaultPoint::EventCreate, CUDA_ERROR_OUT_OF_MEMORY);
    let err = gpu
        .init_event(&context, EventFlags::Default)
        .expect_err("out of memory");
    assert_eq!(err.code(), StatusCode::ResourceExhausted);
    assert!(err.message().contains("out of device memory"), "{}", err);

    emulated.inject_failure(FaultPoint::EventCreate, CUDA_ERROR_UNKNOWN);
    let err = gpu
        .init_event(&context, EventFlags::Default)
        .expect_err("unknown failure");
    assert_eq!(err.code(), StatusCode::FailedPrecondition);

    // Faults fire once.
    gpu.init_event(&context, EventFlags::Default).expect("event");
}

#[test]
fn test_record_unknown_event() {
    let (_emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let err = gpu
        .record_event(&context, EventHandle::from_raw(0xdead), StreamHandle::null())
        .expect_err("unknown event");
    assert_eq!(err.code(), StatusCode::InvalidArgument);

    // A destroyed event is just as stale.
    let event = gpu.init_event(&context, EventFlags::Default).expect("event");
    gpu.destroy_event(&context, event).expect("destroy");
    let err = gpu
        .record_event(&context, event, StreamHandle::null())
        .expect_err("stale event");
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(err.message().contains("error recording CUDA event"), "{}", err);
}

#[test]
fn test_stream_priorities() {
    let (_emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    assert_eq!(gpu.stream_priority(&context, StreamPriority::Default), 0);
    assert_eq!(gpu.stream_priority(&context, StreamPriority::Lowest), 0);
    let highest = gpu.stream_priority(&context, StreamPriority::Highest);
    assert_eq!(highest, -5);

    let stream = gpu.create_stream(&context, highest).expect("high priority stream");
    assert!(!stream.is_null());
    gpu.destroy_stream(&context, stream).expect("destroy");
}

#[test]
fn test_destroy_null_stream_is_noop() {
    let (emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");

    let before = emulated.counters().total;
    gpu.destroy_stream(&context, StreamHandle::null()).expect("no-op");
    assert_eq!(emulated.counters().total, before);
}

#[test]
fn test_failed_stream_destroy_is_reported() {
    let (emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");

    emulated.inject_failure(FaultPoint::StreamDestroy, CUDA_ERROR_UNKNOWN);
    let err = gpu.destroy_stream(&context, stream).expect_err("destroy fails");
    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("failed to destroy stream"), "{}", err);

    // The stream leaked and is still usable.
    assert_eq!(gpu.is_stream_idle(&context, stream), Ok(true));
}

#[test]
fn test_stream_callback_and_wait() {
    let (_emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");
    let other = gpu.create_stream(&context, 0).expect("stream");

    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    gpu.add_stream_callback(&context, stream, move || {
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .expect("callback");
    gpu.synchronize_stream(&context, stream).expect("sync");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let event = gpu.init_event(&context, EventFlags::DisableTiming).expect("event");
    gpu.record_event(&context, event, stream).expect("record");
    gpu.wait_stream_on_event(&context, other, event).expect("wait");
    assert_eq!(gpu.is_stream_idle(&context, other), Ok(true));
}

#[test]
fn test_callback_rejected_while_capturing() {
    let (_emulated, gpu) = setup();
    let context = gpu.create_context(0, ContextOptions::default()).expect("context");
    let stream = gpu.create_stream(&context, 0).expect("stream");

    gpu.stream_begin_capture(&context, stream, CaptureMode::Relaxed)
        .expect("begin capture");
    let err = gpu
        .add_stream_callback(&context, stream, || {})
        .expect_err("host callbacks are not captured");
    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.message().contains("CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED"), "{}", err);

    // The failed call poisoned the capture.
    let err = gpu.stream_end_capture(&context, stream).expect_err("invalidated");
    assert!(err.message().contains("CUDA_ERROR_STREAM_CAPTURE_INVALIDATED"), "{}", err);
}
