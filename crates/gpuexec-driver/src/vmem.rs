//! Virtual address reservations and physical memory mappings.

use tracing::{debug, error};

use gpuexec_core::handle::{DevicePtr, GenericMemoryHandle, VmemSpan};
use gpuexec_core::{DriverError, Result};

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::Device;
use crate::gpu_driver::GpuDriver;
use crate::result::{self, check, CuResultExt, CUDA_SUCCESS};

impl GpuDriver {
    pub fn reserve_virtual_memory(&self, context: &Context, bytes: u64) -> Result<VmemSpan> {
        let _activation = ScopedActivateContext::new(context);
        let base = self
            .driver()
            .mem_address_reserve(bytes, 0)
            .or_status(format!("failed to reserve {} bytes of virtual memory", bytes))?;
        debug!("reserved {} bytes of virtual memory at {}", bytes, base);
        Ok(VmemSpan {
            base,
            size_bytes: bytes,
        })
    }

    pub fn free_virtual_memory(&self, context: &Context, reservation: VmemSpan) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self
            .driver()
            .mem_address_free(reservation.base, reservation.size_bytes);
        if res != CUDA_SUCCESS {
            error!(
                "failed to free reserved memory at {}: {}",
                reservation.base,
                result::to_string(res)
            );
        }
        check(res, format!("failed to free reserved memory at {}", reservation.base))
    }

    /// Smallest physical allocation size usable with a mapping on `device`.
    pub fn get_min_allocation_granularity(&self, device: Device) -> Result<u64> {
        self.driver()
            .mem_get_allocation_granularity(device)
            .or_status("failed to get min allocation granularity")
    }

    /// Physical memory on the context's device, not yet mapped anywhere.
    pub fn create_memory_handle(&self, context: &Context, bytes: u64) -> Result<GenericMemoryHandle> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();
        let device = driver
            .ctx_get_device()
            .or_status("failed to get device for context")?;
        let handle = driver
            .mem_create(bytes, device)
            .or_status(format!("failed to create memory handle of {} bytes", bytes))?;
        Ok(GenericMemoryHandle { handle, bytes })
    }

    pub fn release_memory_handle(&self, context: &Context, handle: GenericMemoryHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().mem_release(handle.handle);
        if res != CUDA_SUCCESS {
            error!(
                "failed to release memory handle {} of size {}: {}",
                handle.handle,
                handle.bytes,
                result::to_string(res)
            );
        }
        check(res, format!("failed to release memory handle {}", handle.handle))
    }

    /// Map `handle` at `va` and grant read/write access to each device.
    ///
    /// If granting access fails the mapping is undone before returning.
    pub fn map_memory(
        &self,
        context: &Context,
        va: DevicePtr,
        handle: &GenericMemoryHandle,
        devices: &[Device],
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();

        check(
            driver.mem_map(va, handle.bytes, handle.handle),
            format!("failed to map {} bytes at {}", handle.bytes, va),
        )?;

        for &device in devices {
            let res = driver.mem_set_access(va, handle.bytes, &[device]);
            if res != CUDA_SUCCESS {
                error!(
                    "failed to set read/write access on memory mapping: {}",
                    result::to_string(res)
                );
                let unmap = driver.mem_unmap(va, handle.bytes);
                if unmap != CUDA_SUCCESS {
                    error!(
                        "failed to unmap memory after failing to set access: {}",
                        result::to_string(unmap)
                    );
                }
                return Err(DriverError::Internal(format!(
                    "failed to set read/write access on memory mapping: {}",
                    result::to_string(res)
                )));
            }
        }
        Ok(())
    }

    pub fn unmap_memory(&self, context: &Context, va: DevicePtr, bytes: u64) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().mem_unmap(va, bytes);
        if res != CUDA_SUCCESS {
            error!(
                "failed to unmap memory at {} of size {}: {}",
                va,
                bytes,
                result::to_string(res)
            );
        }
        check(res, format!("failed to unmap memory at {}", va))
    }
}
