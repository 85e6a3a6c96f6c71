//! Device, host and unified memory, plus pointer queries.

use std::sync::Arc;

use tracing::{debug, error, info, trace};

use gpuexec_core::handle::{ContextHandle, DevicePtr, HostPtr, StreamHandle};
use gpuexec_core::{DriverError, Result};

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::{
    Device, MemorySpace, CU_MEMHOSTALLOC_PORTABLE, CU_MEMHOSTREGISTER_PORTABLE, CU_MEMORYTYPE_DEVICE,
    CU_MEMORYTYPE_HOST, CU_MEM_ATTACH_GLOBAL,
};
use crate::gpu_driver::GpuDriver;
use crate::result::{self, check, status_from_result, CuResultExt, CUDA_ERROR_NOT_FOUND, CUDA_SUCCESS};

impl GpuDriver {
    // ── Device memory ─────────────────────────────────────────────

    /// Zero bytes yields the null pointer without a driver call.
    pub fn device_allocate(&self, context: &Context, bytes: u64) -> Result<DevicePtr> {
        if bytes == 0 {
            return Ok(DevicePtr::null());
        }

        let _activation = ScopedActivateContext::new(context);
        match self.driver().mem_alloc(bytes) {
            Ok(ptr) => {
                trace!("allocated {} for context {} of {} bytes", ptr, context.handle(), bytes);
                Ok(ptr)
            }
            Err(res) => {
                // Callers often retry smaller allocations, so this is not an error yet.
                info!(
                    "failed to allocate {} bytes of device memory: {}",
                    bytes,
                    result::to_string(res)
                );
                Err(status_from_result(res, format!("failed to allocate {} bytes of device memory", bytes)))
            }
        }
    }

    pub fn device_deallocate(&self, context: &Context, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().mem_free(ptr);
        if res != CUDA_SUCCESS {
            error!(
                "failed to free device memory at {}; result: {}",
                ptr,
                result::to_string(res)
            );
            return Err(status_from_result(res, format!("failed to free device memory at {}", ptr)));
        }
        trace!("deallocated {} for context {}", ptr, context.handle());
        Ok(())
    }

    /// Managed memory visible from the host and every device.
    pub fn unified_memory_allocate(&self, context: &Context, bytes: u64) -> Result<DevicePtr> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .mem_alloc_managed(bytes, CU_MEM_ATTACH_GLOBAL)
            .or_status(format!("failed to alloc {} bytes unified memory", bytes))
            .inspect_err(|e| error!("{}", e))
    }

    pub fn unified_memory_deallocate(&self, context: &Context, ptr: DevicePtr) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().mem_free(ptr);
        if res != CUDA_SUCCESS {
            error!(
                "failed to free unified memory at {}; result: {}",
                ptr,
                result::to_string(res)
            );
        }
        check(res, format!("failed to free unified memory at {}", ptr))
    }

    /// Page-locked host memory usable from every context.
    pub fn host_allocate(&self, context: &Context, bytes: u64) -> Result<HostPtr> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .mem_host_alloc(bytes, CU_MEMHOSTALLOC_PORTABLE)
            .or_status(format!("failed to alloc {} bytes on host", bytes))
            .inspect_err(|e| error!("{}", e))
    }

    pub fn host_deallocate(&self, context: &Context, ptr: HostPtr) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().mem_free_host(ptr);
        if res != CUDA_SUCCESS {
            error!("error deallocating host memory at {}: {}", ptr, result::to_string(res));
        }
        check(res, format!("error deallocating host memory at {}", ptr))
    }

    /// Page-lock an existing host range.
    pub fn host_register(&self, context: &Context, ptr: HostPtr, bytes: u64) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().mem_host_register(ptr, bytes, CU_MEMHOSTREGISTER_PORTABLE),
            format!("error registering host memory at {}", ptr),
        )
        .inspect_err(|e| error!("{}", e))
    }

    pub fn host_unregister(&self, context: &Context, ptr: HostPtr) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().mem_host_unregister(ptr),
            format!("error unregistering host memory at {}", ptr),
        )
        .inspect_err(|e| error!("{}", e))
    }

    // ── Stream-ordered allocation ─────────────────────────────────

    pub fn stream_allocate(&self, context: &Context, bytes: u64, stream: StreamHandle) -> Result<DevicePtr> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .mem_alloc_async(bytes, stream)
            .or_status(format!("failed to allocate {} bytes on stream {}", bytes, stream))
    }

    pub fn stream_free(&self, context: &Context, ptr: DevicePtr, stream: StreamHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().mem_free_async(ptr, stream),
            format!("failed to free {} on stream {}", ptr, stream),
        )
    }

    // ── Memset ────────────────────────────────────────────────────

    pub fn synchronous_memset_u8(&self, context: &Context, ptr: DevicePtr, value: u8, count: u64) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memset_d8(ptr, value, count),
            format!("failed to memset memory at {}", ptr),
        )
    }

    pub fn synchronous_memset_u32(&self, context: &Context, ptr: DevicePtr, value: u32, count: u64) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memset_d32(ptr, value, count),
            format!("failed to memset memory at {}", ptr),
        )
    }

    pub fn asynchronous_memset_u8(
        &self,
        context: &Context,
        ptr: DevicePtr,
        value: u8,
        count: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memset_d8_async(ptr, value, count, stream),
            format!("failed to enqueue async memset operation at {}", ptr),
        )
    }

    pub fn asynchronous_memset_u32(
        &self,
        context: &Context,
        ptr: DevicePtr,
        value: u32,
        count: u64,
        stream: StreamHandle,
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().memset_d32_async(ptr, value, count, stream),
            format!("failed to enqueue async memset operation at {}", ptr),
        )
    }

    // ── Pointer queries ───────────────────────────────────────────

    pub(crate) fn pointer_context_handle(&self, ptr: DevicePtr) -> Result<ContextHandle> {
        match self.driver().pointer_get_context(ptr) {
            Ok(handle) if handle.is_null() => Err(DriverError::Unavailable(
                "Empty context returned while querying context for device pointer".to_string(),
            )),
            Ok(handle) => Ok(handle),
            Err(res) => Err(DriverError::Internal(format!(
                "failed to query context for device pointer: {}",
                result::to_string(res)
            ))),
        }
    }

    /// The context that owns `ptr`.
    pub fn get_pointer_context(&self, ptr: DevicePtr) -> Result<Arc<Context>> {
        let handle = self.pointer_context_handle(ptr)?;
        self.registry().get(handle).ok_or_else(|| {
            DriverError::FailedPrecondition(format!(
                "context {} owning device pointer {} was not created through this driver",
                handle, ptr
            ))
        })
    }

    pub fn get_pointer_memory_space(&self, ptr: DevicePtr) -> Result<MemorySpace> {
        let memory_type = self.driver().pointer_get_memory_type(ptr).map_err(|res| {
            DriverError::Internal(format!(
                "failed to query device pointer for memory space: {}",
                result::to_string(res)
            ))
        })?;
        match memory_type {
            CU_MEMORYTYPE_DEVICE => Ok(MemorySpace::Device),
            CU_MEMORYTYPE_HOST => Ok(MemorySpace::Host),
            other => Err(DriverError::Internal(format!(
                "unknown memory space provided by CUDA API: {}",
                other
            ))),
        }
    }

    /// `(base, size)` of the allocation containing `ptr`.
    pub fn get_pointer_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64)> {
        match self.driver().mem_get_address_range(ptr) {
            Ok(range) => Ok(range),
            Err(CUDA_ERROR_NOT_FOUND) => {
                // Not a device pointer, e.g. host memory; callers often ask anyway.
                debug!("{} is not a device pointer", ptr);
                Err(DriverError::NotFound(format!(
                    "not a device pointer {}; {}",
                    ptr,
                    result::to_string(CUDA_ERROR_NOT_FOUND)
                )))
            }
            Err(res) => Err(DriverError::Internal(format!(
                "failed to get pointer info for device pointer {}; {}",
                ptr,
                result::to_string(res)
            ))),
        }
    }

    pub fn get_pointer_device(&self, ptr: DevicePtr) -> Result<Device> {
        let context = self.get_pointer_context(ptr)?;
        self.device_from_context(&context)
    }
}
