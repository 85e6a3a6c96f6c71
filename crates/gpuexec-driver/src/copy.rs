//! Synchronous and stream-ordered memory copies.
//!
//! Device-to-device copies pick the intra-device primitive when both
//! pointers belong to the same context and the peer primitive otherwise.

use tracing::{error, trace};

use gpuexec_core::handle::{ContextHandle, DevicePtr, StreamHandle};
use gpuexec_core::Result;

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::gpu_driver::GpuDriver;
use crate::result::{self, check, status_from_result, CUDA_SUCCESS};

impl GpuDriver {
    /// Context owning `ptr`: registry first, then the driver's attribute
    /// query. Null when neither knows the pointer.
    fn resolve_pointer_context(&self, ptr: DevicePtr) -> ContextHandle {
        let handle = self.registry().get_any_context(ptr);
        if !handle.is_null() {
            return handle;
        }
        self.pointer_context_handle(ptr).unwrap_or_default()
    }

    /// Human-readable placement of `ptr` for failure logs.
    fn describe_pointer(&self, ptr: DevicePtr) -> String {
        let space = match self.get_pointer_memory_space(ptr) {
            Ok(space) => space.to_string(),
            Err(_) => "unknown memory space".to_string(),
        };
        match self.get_pointer_device(ptr) {
            Ok(device) => format!("{} on {} (device {})", ptr, space, device),
            Err(_) => format!("{} on {}", ptr, space),
        }
    }

    fn can_access_description(&self, dst_ctx: ContextHandle, src_ctx: ContextHandle) -> String {
        let (Some(dst), Some(src)) = (self.registry().get(dst_ctx), self.registry().get(src_ctx)) else {
            return "unknown".to_string();
        };
        match self.can_enable_peer_access(&src, &dst) {
            Ok(true) => "yes".to_string(),
            Ok(false) => "no".to_string(),
            Err(e) => e.message().to_string(),
        }
    }

    // ── Synchronous ───────────────────────────────────────────────

    pub fn synchronous_memcpy_d2h(&self, context: &Context, host_dst: &mut [u8], gpu_src: DevicePtr) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memcpy_dtoh(host_dst, gpu_src),
            format!(
                "failed to synchronous memcpy from device to host: host dst: {:p}; GPU src: {}; size: {}",
                host_dst.as_ptr(),
                gpu_src,
                host_dst.len()
            ),
        )?;
        trace!("successfully sync memcpy'd d2h of {} bytes", host_dst.len());
        Ok(())
    }

    pub fn synchronous_memcpy_h2d(&self, context: &Context, gpu_dst: DevicePtr, host_src: &[u8]) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memcpy_htod(gpu_dst, host_src),
            format!(
                "failed to synchronous memcpy from host to device: GPU dst: {}; host src: {:p}; size: {}",
                gpu_dst,
                host_src.as_ptr(),
                host_src.len()
            ),
        )?;
        trace!("successfully enqueued sync memcpy h2d of {} bytes", host_src.len());
        Ok(())
    }

    /// Copy between device pointers, possibly owned by different contexts.
    ///
    /// Null pointers and empty copies skip context resolution and go
    /// straight to the intra-device primitive.
    pub fn synchronous_memcpy_d2d(&self, context: &Context, gpu_dst: DevicePtr, gpu_src: DevicePtr, bytes: u64) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();

        let res = if gpu_dst.is_null() || gpu_src.is_null() || bytes == 0 {
            driver.memcpy_dtod(gpu_dst, gpu_src, bytes)
        } else {
            let dst_context = self.resolve_pointer_context(gpu_dst);
            let src_context = self.resolve_pointer_context(gpu_src);
            if dst_context == src_context || dst_context.is_null() || src_context.is_null() {
                driver.memcpy_dtod(gpu_dst, gpu_src, bytes)
            } else {
                driver.memcpy_peer(gpu_dst, dst_context, gpu_src, src_context, bytes)
            }
        };

        check(
            res,
            format!(
                "failed to synchronous memcpy from device to device: GPU dst: {}; GPU src: {}; size: {}",
                gpu_dst, gpu_src, bytes
            ),
        )?;
        trace!("successfully sync memcpy'd d2d of {} bytes", bytes);
        Ok(())
    }

    // ── Asynchronous ──────────────────────────────────────────────

    /// Enqueue a device-to-host copy on `stream`.
    ///
    /// # Safety
    /// `host_dst` must be valid for writes of `bytes` and stay alive and
    /// untouched until the copy has completed on `stream`.
    pub unsafe fn asynchronous_memcpy_d2h(
        &self,
        context: &Context,
        host_dst: *mut u8,
        gpu_src: DevicePtr,
        bytes: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = unsafe { self.driver().memcpy_dtoh_async(host_dst, gpu_src, bytes, stream) };
        if res != CUDA_SUCCESS {
            let message = format!(
                "failed to enqueue async memcpy from device to host: host dst: {:p}; GPU src: {}; size: {}={:#x}",
                host_dst, gpu_src, bytes, bytes
            );
            error!("{}: {}", message, result::to_string(res));
            return Err(status_from_result(res, message));
        }
        trace!("successfully enqueued async memcpy d2h of {} bytes on stream {}", bytes, stream);
        Ok(())
    }

    /// Enqueue a host-to-device copy on `stream`.
    ///
    /// # Safety
    /// `host_src` must be valid for reads of `bytes` and stay alive and
    /// unmodified until the copy has completed on `stream`.
    pub unsafe fn asynchronous_memcpy_h2d(
        &self,
        context: &Context,
        gpu_dst: DevicePtr,
        host_src: *const u8,
        bytes: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = unsafe { self.driver().memcpy_htod_async(gpu_dst, host_src, bytes, stream) };
        if res != CUDA_SUCCESS {
            let message = format!(
                "failed to enqueue async memcpy from host to device: GPU dst: {}; host src: {:p}; size: {}={:#x}",
                gpu_dst, host_src, bytes, bytes
            );
            error!("{}: {}", message, result::to_string(res));
            return Err(status_from_result(res, message));
        }
        trace!("successfully enqueued async memcpy h2d of {} bytes on stream {}", bytes, stream);
        Ok(())
    }

    /// Enqueue a device-to-device copy on `stream`.
    ///
    /// While `stream` is capturing the copy is always recorded as an
    /// intra-device copy.
    pub fn asynchronous_memcpy_d2d(
        &self,
        context: &Context,
        gpu_dst: DevicePtr,
        gpu_src: DevicePtr,
        bytes: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();
        let is_capturing = self.stream_is_capturing(context, stream)?;

        let mut contexts = None;
        let res = if gpu_dst.is_null() || gpu_src.is_null() || bytes == 0 || is_capturing {
            driver.memcpy_dtod_async(gpu_dst, gpu_src, bytes, stream)
        } else {
            let dst_context = self.resolve_pointer_context(gpu_dst);
            let src_context = self.resolve_pointer_context(gpu_src);
            contexts = Some((dst_context, src_context));
            if dst_context == src_context || dst_context.is_null() || src_context.is_null() {
                driver.memcpy_dtod_async(gpu_dst, gpu_src, bytes, stream)
            } else {
                driver.memcpy_peer_async(gpu_dst, dst_context, gpu_src, src_context, bytes, stream)
            }
        };

        if res != CUDA_SUCCESS {
            let can_access = match contexts {
                Some((dst_context, src_context)) => self.can_access_description(dst_context, src_context),
                None => "not checked".to_string(),
            };
            let message = format!(
                "failed to enqueue async memcpy from device to device: GPU dst: {}; GPU src: {}; can access? {}; size: {}={:#x}",
                self.describe_pointer(gpu_dst),
                self.describe_pointer(gpu_src),
                can_access,
                bytes,
                bytes
            );
            error!("{}: {}", message, result::to_string(res));
            return Err(status_from_result(res, message));
        }
        trace!("successfully enqueued async memcpy d2d of {} bytes on stream {}", bytes, stream);
        Ok(())
    }
}
