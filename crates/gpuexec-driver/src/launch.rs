use tracing::trace;

use gpuexec_core::handle::{FunctionHandle, StreamHandle};
use gpuexec_core::Result;

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::{KernelArg, LaunchDims, CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES};
use crate::gpu_driver::GpuDriver;
use crate::result::check;

impl GpuDriver {
    /// Enqueue `function` on `stream`.
    ///
    /// A launch that asks for dynamic shared memory first raises the
    /// function's dynamic shared memory limit to match.
    pub fn launch_kernel(
        &self,
        context: &Context,
        kernel_name: &str,
        function: FunctionHandle,
        dims: &LaunchDims,
        stream: StreamHandle,
        args: &[KernelArg],
    ) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();
        trace!(
            "launching kernel: {}; grid: {:?}; block: {:?}; shared memory: {}",
            kernel_name,
            dims.grid,
            dims.block,
            dims.shared_mem_bytes
        );

        if dims.shared_mem_bytes != 0 {
            check(
                driver.func_set_attribute(
                    function,
                    CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                    dims.shared_mem_bytes as i32,
                ),
                "failed to set shared memory size",
            )?;
        }

        check(
            driver.launch_kernel(function, dims, stream, args),
            format!(
                "failed to launch kernel: {}; block dims: {:?}; grid dims: {:?}; shared memory size: {}",
                kernel_name, dims.block, dims.grid, dims.shared_mem_bytes
            ),
        )
    }
}
