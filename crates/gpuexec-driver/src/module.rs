//! Module loading and kernel function queries.

use std::sync::Arc;

use tracing::{debug, error, trace};

use gpuexec_core::handle::{DevicePtr, FunctionHandle, ModuleHandle};
use gpuexec_core::{DriverError, Result};

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::JitLog;
use crate::gpu_driver::GpuDriver;
use crate::result::{self, check, CuResultExt, CUDA_SUCCESS};
use crate::worker;

/// Per-function attributes (CUfunction_attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FunctionAttribute {
    MaxThreadsPerBlock = 0,
    SharedSizeBytes = 1,
    ConstSizeBytes = 2,
    LocalSizeBytes = 3,
    NumRegs = 4,
    PtxVersion = 5,
    BinaryVersion = 6,
    MaxDynamicSharedSizeBytes = 8,
}

impl FunctionAttribute {
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// L1 / shared memory split preference (CUfunc_cache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FuncCachePreference {
    #[default]
    PreferNone,
    PreferShared,
    PreferL1,
    PreferEqual,
}

impl FuncCachePreference {
    pub fn as_raw(self) -> i32 {
        match self {
            FuncCachePreference::PreferNone => 0,
            FuncCachePreference::PreferShared => 1,
            FuncCachePreference::PreferL1 => 2,
            FuncCachePreference::PreferEqual => 3,
        }
    }
}

impl GpuDriver {
    /// JIT-compile `ptx` into a module of `context`.
    ///
    /// Compilation runs on the module loader thread; this call blocks until
    /// it finishes.
    pub fn load_ptx(&self, context: &Arc<Context>, ptx: &str) -> Result<ModuleHandle> {
        let gpu = self.clone();
        let context = Arc::clone(context);
        let image = ptx.as_bytes().to_vec();

        worker::run_blocking(move || {
            let _activation = ScopedActivateContext::new(&context);
            let mut log = JitLog::default();

            match gpu.driver().module_load_data_ex(&image, &mut log) {
                Ok(module) => {
                    trace!("PTX compilation info log ({} bytes): {}", log.info.len(), log.info);
                    trace!("PTX compilation error log ({} bytes): {}", log.error.len(), log.error);
                    debug!("loaded PTX module {} into context {}", module, context.handle());
                    Ok(module)
                }
                Err(res) => {
                    error!("failed to load PTX text as a module: {}", result::to_string(res));
                    error!("error log buffer ({} bytes): {}", log.error.len(), log.error);
                    if log.error.contains("Register allocation failed") {
                        Err(DriverError::ResourceExhausted(format!(
                            "Failed to load PTX text as a module (register allocation failed): {}",
                            result::to_string(res)
                        )))
                    } else {
                        Err(DriverError::Internal(format!(
                            "Failed to load PTX text as a module: {}",
                            result::to_string(res)
                        )))
                    }
                }
            }
        })
    }

    /// Load a compiled cubin or fat binary on the calling thread.
    pub fn load_cubin(&self, context: &Context, image: &[u8]) -> Result<ModuleHandle> {
        let _activation = ScopedActivateContext::new(context);
        self.driver().module_load_fat_binary(image).map_err(|res| {
            DriverError::Internal(format!(
                "failed to load in-memory CUBIN: {}",
                result::to_string(res)
            ))
        })
    }

    pub fn get_module_function(&self, context: &Context, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .module_get_function(module, name)
            .or_status(format!("failed to get kernel \"{}\" from module", name))
            .inspect_err(|e| error!("{}", e))
    }

    /// Device address and size of the global `name`.
    pub fn get_module_symbol(&self, context: &Context, module: ModuleHandle, name: &str) -> Result<(DevicePtr, u64)> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .module_get_global(module, name)
            .or_status(format!("failed to get symbol \"{}\" from module", name))
            .inspect_err(|e| debug!("{}", e))
    }

    pub fn unload_module(&self, context: &Context, module: ModuleHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().module_unload(module);
        if res != CUDA_SUCCESS {
            error!(
                "failed to unload module {}; leaking: {}",
                module,
                result::to_string(res)
            );
        }
        check(res, format!("failed to unload module {}", module))
    }

    pub fn func_get_attribute(&self, attribute: FunctionAttribute, function: FunctionHandle) -> Result<i32> {
        self.driver()
            .func_get_attribute(attribute.as_raw(), function)
            .or_status(format!("failed to query kernel attribute {:?}", attribute))
    }

    pub fn func_set_cache_config(&self, function: FunctionHandle, preference: FuncCachePreference) -> Result<()> {
        check(
            self.driver().func_set_cache_config(function, preference.as_raw()),
            format!("failed to set cache preference {:?}", preference),
        )
    }

    /// How many blocks of `function` fit on one multiprocessor at once.
    pub fn max_occupied_blocks_per_core(
        &self,
        context: &Context,
        function: FunctionHandle,
        threads_per_block: i32,
        dynamic_shared_memory_bytes: u64,
    ) -> Result<i32> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .occupancy_max_active_blocks_per_multiprocessor(function, threads_per_block, dynamic_shared_memory_bytes)
            .or_status("failed to calculate occupancy of kernel")
    }
}
