//! The driver layer entry point.
//!
//! [`GpuDriver`] owns a [`Driver`] backend and the [`ContextRegistry`]. Every
//! operation that needs a current context activates it through
//! [`ScopedActivateContext`] for the duration of the driver call and
//! translates native failures into [`DriverError`].

use std::sync::{Arc, OnceLock};

use tracing::{debug, error, info, warn};

use gpuexec_core::config::default_config_path;
use gpuexec_core::{BackendKind, DriverConfig, DriverError, DriverFlags, GpuexecConfig, Result};

use crate::activation::{fatal, ScopedActivateContext};
use crate::context::{Context, ContextRegistry};
use crate::cuda_driver::CudaDriver;
use crate::diagnostics::Diagnostician;
use crate::driver::{
    DeviceAttribute, Device, Driver, CU_CTX_LMEM_RESIZE_TO_MAX, CU_CTX_SCHED_BLOCKING_SYNC,
    CU_CTX_SCHED_SPIN, CU_CTX_SCHED_YIELD, CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
    CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE, CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE,
};
use crate::emulated::EmulatedDriver;
use crate::result::{
    self, check, status_from_result, CuResultExt, CUDA_ERROR_NO_DEVICE,
    CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED, CUDA_ERROR_SHARED_OBJECT_INIT_FAILED, CUDA_SUCCESS,
};

/// How a context waits for device work to finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Let the driver pick.
    #[default]
    Auto,
    Spin,
    Yield,
    BlockingSync,
}

/// Options applied to a device's primary context when it is first created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    pub schedule: SchedulePolicy,
    /// Keep local memory sized for the largest launch seen so far.
    pub lmem_resize_to_max: bool,
}

impl ContextOptions {
    pub fn to_flags(self) -> u32 {
        let mut flags = match self.schedule {
            SchedulePolicy::Auto => 0,
            SchedulePolicy::Spin => CU_CTX_SCHED_SPIN,
            SchedulePolicy::Yield => CU_CTX_SCHED_YIELD,
            SchedulePolicy::BlockingSync => CU_CTX_SCHED_BLOCKING_SYNC,
        };
        if self.lmem_resize_to_max {
            flags |= CU_CTX_LMEM_RESIZE_TO_MAX;
        }
        flags
    }
}

/// Shared memory bank size of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SharedMemConfig {
    #[default]
    DefaultBankSize,
    FourByteBankSize,
    EightByteBankSize,
}

impl SharedMemConfig {
    pub fn as_raw(self) -> i32 {
        match self {
            SharedMemConfig::DefaultBankSize => CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
            SharedMemConfig::FourByteBankSize => CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE,
            SharedMemConfig::EightByteBankSize => CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE => Some(SharedMemConfig::DefaultBankSize),
            CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE => Some(SharedMemConfig::FourByteBankSize),
            CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE => Some(SharedMemConfig::EightByteBankSize),
            _ => None,
        }
    }
}

struct Inner {
    driver: Arc<dyn Driver>,
    registry: ContextRegistry,
    flags: DriverFlags,
    init: OnceLock<Result<()>>,
}

/// Handle to a driver backend plus its context bookkeeping.
///
/// Cheap to clone; clones share the registry and the cached init result.
#[derive(Clone)]
pub struct GpuDriver {
    inner: Arc<Inner>,
}

static GLOBAL: OnceLock<Result<GpuDriver>> = OnceLock::new();

impl GpuDriver {
    pub fn new(driver: Arc<dyn Driver>, flags: DriverFlags) -> Self {
        let registry = ContextRegistry::new(Arc::clone(&driver), flags.sync_around_driver_calls);
        Self {
            inner: Arc::new(Inner {
                driver,
                registry,
                flags,
                init: OnceLock::new(),
            }),
        }
    }

    /// Build the backend selected by `config`.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let driver: Arc<dyn Driver> = match config.backend {
            BackendKind::Cuda => CudaDriver::load().map_err(DriverError::Unavailable)?,
            BackendKind::Emulated => Arc::new(EmulatedDriver::from_config(config)),
            BackendKind::Auto => match CudaDriver::load() {
                Ok(driver) => driver,
                Err(e) => {
                    warn!("CUDA driver not available: {} - using emulated driver", e);
                    Arc::new(EmulatedDriver::from_config(config))
                }
            },
        };
        info!("using {} driver backend", driver.backend_name());
        Ok(Self::new(driver, config.flags()))
    }

    /// The process-wide instance, configured from `gpuexec.toml` and the
    /// `GPUEXEC_*` environment on first use.
    pub fn global() -> Result<GpuDriver> {
        GLOBAL
            .get_or_init(|| {
                let path = default_config_path();
                let mut config = GpuexecConfig::load_or_default(&path);
                if let Err(e) = config.driver.apply_env_overrides() {
                    warn!("{}; ignoring environment overrides", e);
                }
                Self::from_config(&config.driver)
            })
            .clone()
    }

    pub fn driver(&self) -> &dyn Driver {
        self.inner.driver.as_ref()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.driver.backend_name()
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.inner.registry
    }

    pub fn flags(&self) -> DriverFlags {
        self.inner.flags
    }

    // ── Initialization ────────────────────────────────────────────

    /// Initialize the driver. The outcome of the first call is cached.
    pub fn init(&self) -> Result<()> {
        self.inner.init.get_or_init(|| self.internal_init()).clone()
    }

    fn internal_init(&self) -> Result<()> {
        let driver = self.driver();
        let res = if self.inner.flags.inject_init_error {
            error!("injecting failure into driver initialization");
            CUDA_ERROR_NO_DEVICE
        } else {
            driver.init(0)
        };

        if res == CUDA_SUCCESS {
            info!("{} driver initialized successfully", driver.backend_name());
            return Ok(());
        }

        let message = format!("failed call to cuInit: {}", result::to_string(res));
        if res == CUDA_ERROR_SHARED_OBJECT_INIT_FAILED {
            debug!("{}", message);
        } else {
            error!("{}", message);
        }
        Diagnostician::log_diagnostic_information(driver);
        Err(DriverError::Aborted(message))
    }

    pub fn driver_version(&self) -> Result<i32> {
        self.driver()
            .driver_get_version()
            .or_status("failed to query driver version")
    }

    // ── Devices ───────────────────────────────────────────────────

    /// Number of visible devices; 0 when the driver cannot be queried.
    pub fn device_count(&self) -> i32 {
        if self.init().is_err() {
            return 0;
        }
        let count = match self.driver().device_get_count() {
            Ok(count) => count,
            Err(res) => {
                error!("could not retrieve device count: {}", result::to_string(res));
                return 0;
            }
        };
        if self.inner.flags.device_0_only && count > 1 {
            return 1;
        }
        count
    }

    pub fn device(&self, ordinal: i32) -> Result<Device> {
        self.driver()
            .device_get(ordinal)
            .or_status(format!("failed call to cuDeviceGet for ordinal {}", ordinal))
    }

    pub fn device_name(&self, device: Device) -> Result<String> {
        self.driver()
            .device_get_name(device)
            .or_status("failed to get device name")
    }

    /// Lowercased, as the rest of the system compares bus ids textually.
    pub fn device_pci_bus_id(&self, device: Device) -> Result<String> {
        self.driver()
            .device_get_pci_bus_id(device)
            .map(|id| id.to_ascii_lowercase())
            .or_status(format!("failed to query PCI bus id for device {}", device))
    }

    pub fn device_total_memory(&self, device: Device) -> Result<u64> {
        self.driver()
            .device_total_mem(device)
            .or_status("failed to query total available memory")
    }

    pub fn device_attribute(&self, attribute: DeviceAttribute, device: Device) -> Result<i32> {
        self.driver()
            .device_get_attribute(attribute.as_raw(), device)
            .or_status(format!(
                "failed to get device attribute {:?} for device {}",
                attribute, device
            ))
    }

    /// `(major, minor)`
    pub fn compute_capability(&self, device: Device) -> Result<(i32, i32)> {
        let major = self.device_attribute(DeviceAttribute::ComputeCapabilityMajor, device)?;
        let minor = self.device_attribute(DeviceAttribute::ComputeCapabilityMinor, device)?;
        Ok((major, minor))
    }

    pub fn multiprocessor_count(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MultiprocessorCount, device)
    }

    pub fn max_shared_memory_per_core(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxSharedMemoryPerMultiprocessor, device)
    }

    pub fn max_shared_memory_per_block(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxSharedMemoryPerBlock, device)
    }

    pub fn max_shared_memory_per_block_optin(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxSharedMemoryPerBlockOptin, device)
    }

    pub fn max_threads_per_multiprocessor(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxThreadsPerMultiprocessor, device)
    }

    pub fn max_threads_per_block(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxThreadsPerBlock, device)
    }

    pub fn max_registers_per_block(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::MaxRegistersPerBlock, device)
    }

    pub fn threads_per_warp(&self, device: Device) -> Result<i32> {
        self.device_attribute(DeviceAttribute::WarpSize, device)
    }

    /// Maximum grid dimensions `[x, y, z]`.
    pub fn grid_limits(&self, device: Device) -> Result<[i32; 3]> {
        Ok([
            self.device_attribute(DeviceAttribute::MaxGridDimX, device)?,
            self.device_attribute(DeviceAttribute::MaxGridDimY, device)?,
            self.device_attribute(DeviceAttribute::MaxGridDimZ, device)?,
        ])
    }

    pub fn is_ecc_enabled(&self, device: Device) -> Result<bool> {
        Ok(self.device_attribute(DeviceAttribute::EccEnabled, device)? != 0)
    }

    // ── Contexts ──────────────────────────────────────────────────

    /// Retain the primary context of device `ordinal`.
    ///
    /// The thread's current context is left as it was found.
    pub fn create_context(&self, ordinal: i32, options: ContextOptions) -> Result<Arc<Context>> {
        self.init()?;
        let driver = self.driver();
        let device = self.device(ordinal)?;
        let flags = options.to_flags();

        let (former_flags, active) = driver
            .device_primary_ctx_get_state(device)
            .or_status("failed to query primary context state")?;
        if former_flags != flags {
            if active {
                error!(
                    "the primary context is active and has a different flag set ({:#x}) than the desired flag set ({:#x})",
                    former_flags, flags
                );
            } else {
                check(
                    driver.device_primary_ctx_set_flags(device, flags),
                    "failed to set primary context flags",
                )?;
            }
        }

        let former_context = driver
            .ctx_get_current()
            .or_status("failed to query current context")?;
        let retained = driver.device_primary_ctx_retain(device);

        if !former_context.is_null() {
            match driver.ctx_get_device() {
                Ok(former_device) if former_device == device => match &retained {
                    Ok(new_context) if *new_context == former_context => {
                        debug!("the primary context {} for device {} will be used", former_context, device);
                    }
                    _ => warn!(
                        "a non-primary context {} for device {} exists before creating the primary context",
                        former_context, device
                    ),
                },
                Ok(_) => {}
                Err(res) => error!(
                    "failed to get the device of the current context {}: {}",
                    former_context,
                    result::to_string(res)
                ),
            }
        }

        let res = driver.ctx_set_current(former_context);
        if res != CUDA_SUCCESS {
            fatal(&format!(
                "failed to restore context {}: {}",
                former_context,
                result::to_string(res)
            ));
        }

        match retained {
            Ok(handle) => {
                let context = self.inner.registry.add(handle, ordinal);
                info!("created context {} (id {}) on device {}", handle, context.id(), ordinal);
                Ok(context)
            }
            Err(res) => {
                let mut err = status_from_result(res, "failed call to cuDevicePrimaryCtxRetain");
                if res == result::CUDA_ERROR_OUT_OF_MEMORY {
                    if let Ok(total) = driver.device_total_mem(device) {
                        err = DriverError::with_code(
                            err.code(),
                            format!("{}; total memory reported: {}", err.message(), total),
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Release the primary context behind `context` and forget it.
    ///
    /// A failed release leaks the context; the registry entry is removed
    /// either way.
    pub fn destroy_context(&self, context: &Context) -> Result<()> {
        let driver = self.driver();
        let handle = context.handle();

        let device = {
            let former = driver
                .ctx_get_current()
                .or_status("failed to query current context")?;
            let res = driver.ctx_set_current(handle);
            if res != CUDA_SUCCESS {
                fatal(&format!("failed setting context {}: {}", handle, result::to_string(res)));
            }
            let device = driver.ctx_get_device();
            let res = driver.ctx_set_current(former);
            if res != CUDA_SUCCESS {
                fatal(&format!("failed to restore context {}: {}", former, result::to_string(res)));
            }
            device
        };

        let released = match device {
            Ok(device) => check(
                driver.device_primary_ctx_release(device),
                "failed to release CUDA context",
            ),
            Err(res) => Err(status_from_result(res, "failed to get device of context")),
        };
        if let Err(e) = &released {
            error!("failed to release CUDA context; leaking: {}", e.message());
        }

        self.inner.registry.remove(handle);
        released
    }

    pub fn device_from_context(&self, context: &Context) -> Result<Device> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .ctx_get_device()
            .or_status("failed to get device for context")
    }

    /// Block until all work in `context` has finished.
    pub fn synchronize_context(&self, context: &Context) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().ctx_synchronize(),
            format!("could not synchronize on context {}", context.handle()),
        )
        .inspect_err(|e| error!("{}", e))
    }

    /// `(free, total)` device memory in bytes.
    pub fn device_memory_info(&self, context: &Context) -> Result<(u64, u64)> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .mem_get_info()
            .or_status("failed to query device memory info")
            .inspect_err(|e| error!("{}", e))
    }

    pub fn context_get_shared_mem_config(&self, context: &Context) -> Result<SharedMemConfig> {
        let _activation = ScopedActivateContext::new(context);
        let raw = self
            .driver()
            .ctx_get_shared_mem_config()
            .or_status(format!(
                "failed to get shared memory config for context {}",
                context.handle()
            ))
            .inspect_err(|e| error!("{}", e))?;
        SharedMemConfig::from_raw(raw).ok_or_else(|| {
            DriverError::Internal(format!("unknown shared memory config {}", raw))
        })
    }

    pub fn context_set_shared_mem_config(&self, context: &Context, config: SharedMemConfig) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().ctx_set_shared_mem_config(config.as_raw()),
            format!(
                "failed to set shared memory config {:?} for context {}",
                config,
                context.handle()
            ),
        )
        .inspect_err(|e| error!("{}", e))
    }

    // ── Peer access ───────────────────────────────────────────────

    pub fn can_enable_peer_access(&self, from: &Context, to: &Context) -> Result<bool> {
        if from.handle() == to.handle() {
            return Ok(true);
        }
        let from_device = self.device_from_context(from)?;
        let to_device = self.device_from_context(to)?;
        self.can_enable_peer_access_between(from_device, to_device)
    }

    pub fn can_enable_peer_access_between(&self, from: Device, to: Device) -> Result<bool> {
        self.driver()
            .device_can_access_peer(from, to)
            .or_status("failed to detect peer access capability")
            .inspect_err(|e| error!("{}", e))
    }

    /// Let `from` access memory owned by `to`. Already-enabled is success.
    pub fn enable_peer_access(&self, from: &Context, to: &Context) -> Result<()> {
        if from.handle() == to.handle() {
            return Ok(());
        }
        let _activation = ScopedActivateContext::new(from);
        let res = self.driver().ctx_enable_peer_access(to.handle(), 0);
        if res != CUDA_SUCCESS && res != CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED {
            return Err(status_from_result(
                res,
                format!(
                    "failed to enable peer access from {} to {}",
                    from.handle(),
                    to.handle()
                ),
            ));
        }
        Ok(())
    }
}
