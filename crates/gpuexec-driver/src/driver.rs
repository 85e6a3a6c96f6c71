//! The native driver seam.
//!
//! [`Driver`] mirrors the vendor driver entry points one to one. Methods that
//! produce a value return `Result<T, CUresult>`, the rest return the raw
//! `CUresult`; translation into [`gpuexec_core::DriverError`] happens one
//! layer up in [`crate::GpuDriver`].

use gpuexec_core::handle::{
    ContextHandle, DevicePtr, EventHandle, FunctionHandle, GraphExecHandle, GraphHandle,
    GraphNodeHandle, HostPtr, MemHandle, ModuleHandle, StreamHandle,
};

use crate::result::CUresult;

/// CUDA device ordinal as seen by the driver (CUdevice).
pub type Device = i32;

/// Host function enqueued on a stream.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

// Context creation flags (CUctx_flags).
pub const CU_CTX_SCHED_SPIN: u32 = 0x01;
pub const CU_CTX_SCHED_YIELD: u32 = 0x02;
pub const CU_CTX_SCHED_BLOCKING_SYNC: u32 = 0x04;
pub const CU_CTX_LMEM_RESIZE_TO_MAX: u32 = 0x10;

// CUsharedconfig
pub const CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE: i32 = 0;
pub const CU_SHARED_MEM_CONFIG_FOUR_BYTE_BANK_SIZE: i32 = 1;
pub const CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE: i32 = 2;

pub const CU_STREAM_NON_BLOCKING: u32 = 0x1;

pub const CU_EVENT_DEFAULT: u32 = 0x0;
pub const CU_EVENT_DISABLE_TIMING: u32 = 0x2;

pub const CU_MEM_ATTACH_GLOBAL: u32 = 0x1;
pub const CU_MEMHOSTALLOC_PORTABLE: u32 = 0x1;
pub const CU_MEMHOSTREGISTER_PORTABLE: u32 = 0x1;

// CUmemorytype
pub const CU_MEMORYTYPE_HOST: i32 = 1;
pub const CU_MEMORYTYPE_DEVICE: i32 = 2;
pub const CU_MEMORYTYPE_ARRAY: i32 = 3;
pub const CU_MEMORYTYPE_UNIFIED: i32 = 4;

pub const CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES: i32 = 8;

// CUgraphInstantiate_flags
pub const CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH: u64 = 1;
pub const CUDA_GRAPH_INSTANTIATE_FLAG_UPLOAD: u64 = 2;
pub const CUDA_GRAPH_INSTANTIATE_FLAG_DEVICE_LAUNCH: u64 = 4;
pub const CUDA_GRAPH_INSTANTIATE_FLAG_USE_NODE_PRIORITY: u64 = 8;

pub const CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE: u32 = 1;

/// Device attributes queried by the layer (CUdevice_attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceAttribute {
    MaxThreadsPerBlock = 1,
    MaxGridDimX = 5,
    MaxGridDimY = 6,
    MaxGridDimZ = 7,
    MaxSharedMemoryPerBlock = 8,
    WarpSize = 10,
    MaxRegistersPerBlock = 12,
    MultiprocessorCount = 16,
    EccEnabled = 32,
    MaxThreadsPerMultiprocessor = 39,
    ComputeCapabilityMajor = 75,
    ComputeCapabilityMinor = 76,
    MaxSharedMemoryPerMultiprocessor = 81,
    MaxSharedMemoryPerBlockOptin = 97,
}

impl DeviceAttribute {
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Grid and block geometry of a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
}

impl LaunchDims {
    /// One-dimensional launch without dynamic shared memory.
    pub fn linear(blocks: u32, threads: u32) -> Self {
        Self {
            grid: [blocks, 1, 1],
            block: [threads, 1, 1],
            shared_mem_bytes: 0,
        }
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn total_threads(&self) -> u64 {
        let g = self.grid.iter().map(|&d| d as u64).product::<u64>();
        let b = self.block.iter().map(|&d| d as u64).product::<u64>();
        g * b
    }
}

/// A single by-value kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl KernelArg {
    /// Native-endian bytes of the value, padded to eight.
    ///
    /// The driver reads each parameter through a `void*` to its storage, so
    /// the value must start at offset zero of the slot.
    pub fn to_slot(self) -> [u8; 8] {
        let mut slot = [0u8; 8];
        match self {
            KernelArg::Ptr(p) => slot.copy_from_slice(&p.as_raw().to_ne_bytes()),
            KernelArg::U32(v) => slot[..4].copy_from_slice(&v.to_ne_bytes()),
            KernelArg::I32(v) => slot[..4].copy_from_slice(&v.to_ne_bytes()),
            KernelArg::U64(v) => slot.copy_from_slice(&v.to_ne_bytes()),
            KernelArg::I64(v) => slot.copy_from_slice(&v.to_ne_bytes()),
            KernelArg::F32(v) => slot[..4].copy_from_slice(&v.to_ne_bytes()),
            KernelArg::F64(v) => slot.copy_from_slice(&v.to_ne_bytes()),
        }
        slot
    }

    pub fn as_ptr(self) -> Option<DevicePtr> {
        match self {
            KernelArg::Ptr(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_u64(self) -> Option<u64> {
        match self {
            KernelArg::U32(v) => Some(v as u64),
            KernelArg::U64(v) => Some(v),
            KernelArg::I32(v) if v >= 0 => Some(v as u64),
            KernelArg::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            KernelArg::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Stream capture mode (CUstreamCaptureMode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    Global,
    ThreadLocal,
    Relaxed,
}

impl CaptureMode {
    pub fn as_raw(self) -> i32 {
        match self {
            CaptureMode::Global => 0,
            CaptureMode::ThreadLocal => 1,
            CaptureMode::Relaxed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Global => "global",
            CaptureMode::ThreadLocal => "threadlocal",
            CaptureMode::Relaxed => "relaxed",
        }
    }
}

/// Options applied when turning a graph into an executable graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphInstantiateFlags {
    pub auto_free_on_launch: bool,
    pub upload: bool,
    pub device_launch: bool,
    pub use_node_priority: bool,
}

impl GraphInstantiateFlags {
    pub fn to_bits(self) -> u64 {
        let mut bits = 0;
        if self.auto_free_on_launch {
            bits |= CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH;
        }
        if self.upload {
            bits |= CUDA_GRAPH_INSTANTIATE_FLAG_UPLOAD;
        }
        if self.device_launch {
            bits |= CUDA_GRAPH_INSTANTIATE_FLAG_DEVICE_LAUNCH;
        }
        if self.use_node_priority {
            bits |= CUDA_GRAPH_INSTANTIATE_FLAG_USE_NODE_PRIORITY;
        }
        bits
    }
}

/// Kind of a graph node (CUgraphNodeType).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNodeType {
    Kernel,
    Memcpy,
    Memset,
    Host,
    Graph,
    Empty,
    WaitEvent,
    EventRecord,
    ExtSemasSignal,
    ExtSemasWait,
    MemAlloc,
    MemFree,
    BatchMemOp,
}

impl GraphNodeType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => GraphNodeType::Kernel,
            1 => GraphNodeType::Memcpy,
            2 => GraphNodeType::Memset,
            3 => GraphNodeType::Host,
            4 => GraphNodeType::Graph,
            5 => GraphNodeType::Empty,
            6 => GraphNodeType::WaitEvent,
            7 => GraphNodeType::EventRecord,
            8 => GraphNodeType::ExtSemasSignal,
            9 => GraphNodeType::ExtSemasWait,
            10 => GraphNodeType::MemAlloc,
            11 => GraphNodeType::MemFree,
            12 => GraphNodeType::BatchMemOp,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        match self {
            GraphNodeType::Kernel => 0,
            GraphNodeType::Memcpy => 1,
            GraphNodeType::Memset => 2,
            GraphNodeType::Host => 3,
            GraphNodeType::Graph => 4,
            GraphNodeType::Empty => 5,
            GraphNodeType::WaitEvent => 6,
            GraphNodeType::EventRecord => 7,
            GraphNodeType::ExtSemasSignal => 8,
            GraphNodeType::ExtSemasWait => 9,
            GraphNodeType::MemAlloc => 10,
            GraphNodeType::MemFree => 11,
            GraphNodeType::BatchMemOp => 12,
        }
    }
}

/// Outcome category of an executable graph update (CUgraphExecUpdateResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphExecUpdateResult {
    Success,
    Error,
    TopologyChanged,
    NodeTypeChanged,
    FunctionChanged,
    ParametersChanged,
    NotSupported,
    UnsupportedFunctionChange,
    AttributesChanged,
}

impl GraphExecUpdateResult {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => GraphExecUpdateResult::Success,
            2 => GraphExecUpdateResult::TopologyChanged,
            3 => GraphExecUpdateResult::NodeTypeChanged,
            4 => GraphExecUpdateResult::FunctionChanged,
            5 => GraphExecUpdateResult::ParametersChanged,
            6 => GraphExecUpdateResult::NotSupported,
            7 => GraphExecUpdateResult::UnsupportedFunctionChange,
            8 => GraphExecUpdateResult::AttributesChanged,
            _ => GraphExecUpdateResult::Error,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            GraphExecUpdateResult::Success => 0,
            GraphExecUpdateResult::Error => 1,
            GraphExecUpdateResult::TopologyChanged => 2,
            GraphExecUpdateResult::NodeTypeChanged => 3,
            GraphExecUpdateResult::FunctionChanged => 4,
            GraphExecUpdateResult::ParametersChanged => 5,
            GraphExecUpdateResult::NotSupported => 6,
            GraphExecUpdateResult::UnsupportedFunctionChange => 7,
            GraphExecUpdateResult::AttributesChanged => 8,
        }
    }
}

/// Event creation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFlags {
    #[default]
    Default,
    DisableTiming,
}

impl EventFlags {
    pub fn to_bits(self) -> u32 {
        match self {
            EventFlags::Default => CU_EVENT_DEFAULT,
            EventFlags::DisableTiming => CU_EVENT_DISABLE_TIMING,
        }
    }
}

/// Where a pointer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device,
}

impl std::fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySpace::Host => f.write_str("host"),
            MemorySpace::Device => f.write_str("device"),
        }
    }
}

/// Logs produced by the PTX JIT during module loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitLog {
    pub info: String,
    pub error: String,
}

/// Abstraction over the vendor driver API.
pub trait Driver: Send + Sync {
    /// Short backend label for logs and the CLI.
    fn backend_name(&self) -> &'static str;

    // ── Initialization and devices ──────────────────────────────────

    fn init(&self, flags: u32) -> CUresult;
    fn driver_get_version(&self) -> Result<i32, CUresult>;
    fn device_get_count(&self) -> Result<i32, CUresult>;
    fn device_get(&self, ordinal: i32) -> Result<Device, CUresult>;
    fn device_get_name(&self, device: Device) -> Result<String, CUresult>;
    fn device_get_attribute(&self, attrib: i32, device: Device) -> Result<i32, CUresult>;
    fn device_total_mem(&self, device: Device) -> Result<u64, CUresult>;
    fn device_get_pci_bus_id(&self, device: Device) -> Result<String, CUresult>;
    fn device_can_access_peer(&self, device: Device, peer: Device) -> Result<bool, CUresult>;

    // ── Primary context ─────────────────────────────────────────────

    fn device_primary_ctx_retain(&self, device: Device) -> Result<ContextHandle, CUresult>;
    fn device_primary_ctx_release(&self, device: Device) -> CUresult;
    /// Returns `(flags, active)`.
    fn device_primary_ctx_get_state(&self, device: Device) -> Result<(u32, bool), CUresult>;
    fn device_primary_ctx_set_flags(&self, device: Device, flags: u32) -> CUresult;

    // ── Current context ─────────────────────────────────────────────

    fn ctx_set_current(&self, ctx: ContextHandle) -> CUresult;
    fn ctx_get_current(&self) -> Result<ContextHandle, CUresult>;
    fn ctx_get_device(&self) -> Result<Device, CUresult>;
    fn ctx_synchronize(&self) -> CUresult;
    /// Returns `(least, greatest)` priority.
    fn ctx_get_stream_priority_range(&self) -> Result<(i32, i32), CUresult>;
    fn ctx_enable_peer_access(&self, peer: ContextHandle, flags: u32) -> CUresult;
    /// Shared memory bank size of the current context (CUsharedconfig).
    fn ctx_get_shared_mem_config(&self) -> Result<i32, CUresult>;
    fn ctx_set_shared_mem_config(&self, config: i32) -> CUresult;
    /// Returns `(free, total)` bytes of the current context's device.
    fn mem_get_info(&self) -> Result<(u64, u64), CUresult>;

    // ── Modules and functions ───────────────────────────────────────

    fn module_load_data_ex(&self, image: &[u8], log: &mut JitLog) -> Result<ModuleHandle, CUresult>;
    fn module_load_fat_binary(&self, image: &[u8]) -> Result<ModuleHandle, CUresult>;
    fn module_unload(&self, module: ModuleHandle) -> CUresult;
    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, CUresult>;
    fn module_get_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, u64), CUresult>;
    fn func_get_attribute(&self, attrib: i32, func: FunctionHandle) -> Result<i32, CUresult>;
    fn func_set_attribute(&self, func: FunctionHandle, attrib: i32, value: i32) -> CUresult;
    fn func_set_cache_config(&self, func: FunctionHandle, config: i32) -> CUresult;
    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        func: FunctionHandle,
        block_size: i32,
        dynamic_smem_bytes: u64,
    ) -> Result<i32, CUresult>;
    fn launch_kernel(
        &self,
        func: FunctionHandle,
        dims: &LaunchDims,
        stream: StreamHandle,
        args: &[KernelArg],
    ) -> CUresult;

    // ── Memory ──────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: u64) -> Result<DevicePtr, CUresult>;
    fn mem_free(&self, ptr: DevicePtr) -> CUresult;
    fn mem_alloc_managed(&self, bytes: u64, flags: u32) -> Result<DevicePtr, CUresult>;
    fn mem_host_alloc(&self, bytes: u64, flags: u32) -> Result<HostPtr, CUresult>;
    fn mem_free_host(&self, ptr: HostPtr) -> CUresult;
    fn mem_host_register(&self, ptr: HostPtr, bytes: u64, flags: u32) -> CUresult;
    fn mem_host_unregister(&self, ptr: HostPtr) -> CUresult;
    fn mem_alloc_async(&self, bytes: u64, stream: StreamHandle) -> Result<DevicePtr, CUresult>;
    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> CUresult;
    /// Returns `(base, size)` of the allocation containing `ptr`.
    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64), CUresult>;
    fn memset_d8(&self, dst: DevicePtr, value: u8, count: u64) -> CUresult;
    fn memset_d32(&self, dst: DevicePtr, value: u32, count: u64) -> CUresult;
    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: u64, stream: StreamHandle) -> CUresult;
    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: u64, stream: StreamHandle) -> CUresult;

    // ── Copies ──────────────────────────────────────────────────────

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> CUresult;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> CUresult;
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: u64) -> CUresult;
    fn memcpy_peer(
        &self,
        dst: DevicePtr,
        dst_ctx: ContextHandle,
        src: DevicePtr,
        src_ctx: ContextHandle,
        bytes: u64,
    ) -> CUresult;
    /// # Safety
    /// `src` must stay valid and unmodified for `bytes` until the copy
    /// completes on `stream`.
    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: *const u8, bytes: u64, stream: StreamHandle) -> CUresult;
    /// # Safety
    /// `dst` must stay valid for writes of `bytes` until the copy completes
    /// on `stream`.
    unsafe fn memcpy_dtoh_async(&self, dst: *mut u8, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult;
    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult;
    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_ctx: ContextHandle,
        src: DevicePtr,
        src_ctx: ContextHandle,
        bytes: u64,
        stream: StreamHandle,
    ) -> CUresult;

    // ── Pointer attributes ──────────────────────────────────────────

    fn pointer_get_context(&self, ptr: DevicePtr) -> Result<ContextHandle, CUresult>;
    /// Raw `CUmemorytype` of the pointer.
    fn pointer_get_memory_type(&self, ptr: DevicePtr) -> Result<i32, CUresult>;
    fn pointer_get_device_ordinal(&self, ptr: DevicePtr) -> Result<i32, CUresult>;

    // ── Virtual memory management ───────────────────────────────────

    fn mem_address_reserve(&self, bytes: u64, alignment: u64) -> Result<DevicePtr, CUresult>;
    fn mem_address_free(&self, ptr: DevicePtr, bytes: u64) -> CUresult;
    fn mem_get_allocation_granularity(&self, device: Device) -> Result<u64, CUresult>;
    fn mem_create(&self, bytes: u64, device: Device) -> Result<MemHandle, CUresult>;
    fn mem_release(&self, handle: MemHandle) -> CUresult;
    fn mem_map(&self, ptr: DevicePtr, bytes: u64, handle: MemHandle) -> CUresult;
    /// Grant read/write access to `devices`.
    fn mem_set_access(&self, ptr: DevicePtr, bytes: u64, devices: &[Device]) -> CUresult;
    fn mem_unmap(&self, ptr: DevicePtr, bytes: u64) -> CUresult;

    // ── Streams ─────────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<StreamHandle, CUresult>;
    fn stream_create_with_priority(&self, flags: u32, priority: i32) -> Result<StreamHandle, CUresult>;
    fn stream_destroy(&self, stream: StreamHandle) -> CUresult;
    fn stream_synchronize(&self, stream: StreamHandle) -> CUresult;
    fn stream_query(&self, stream: StreamHandle) -> CUresult;
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle, flags: u32) -> CUresult;
    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> CUresult;
    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> CUresult;
    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, CUresult>;
    fn stream_is_capturing(&self, stream: StreamHandle) -> Result<bool, CUresult>;

    // ── Events ──────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> Result<EventHandle, CUresult>;
    fn event_destroy(&self, event: EventHandle) -> CUresult;
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> CUresult;
    fn event_synchronize(&self, event: EventHandle) -> CUresult;
    fn event_query(&self, event: EventHandle) -> CUresult;
    fn event_elapsed_time(&self, start: EventHandle, stop: EventHandle) -> Result<f32, CUresult>;

    // ── Graphs ──────────────────────────────────────────────────────

    fn graph_create(&self, flags: u32) -> Result<GraphHandle, CUresult>;
    fn graph_destroy(&self, graph: GraphHandle) -> CUresult;
    fn graph_add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        func: FunctionHandle,
        dims: &LaunchDims,
        args: &[KernelArg],
    ) -> Result<GraphNodeHandle, CUresult>;
    fn graph_add_memcpy_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        ctx: ContextHandle,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: u64,
    ) -> Result<GraphNodeHandle, CUresult>;
    #[allow(clippy::too_many_arguments)]
    fn graph_add_memset_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        ctx: ContextHandle,
        dst: DevicePtr,
        value: u32,
        element_size: u32,
        count: u64,
    ) -> Result<GraphNodeHandle, CUresult>;
    fn graph_add_empty_node(&self, graph: GraphHandle, deps: &[GraphNodeHandle]) -> Result<GraphNodeHandle, CUresult>;
    /// Raw `CUgraphNodeType` of the node.
    fn graph_node_get_type(&self, node: GraphNodeHandle) -> Result<i32, CUresult>;
    fn graph_instantiate(&self, graph: GraphHandle, flags: u64) -> Result<GraphExecHandle, CUresult>;
    fn graph_launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> CUresult;
    /// Returns the call result and the raw `CUgraphExecUpdateResult`.
    fn graph_exec_update(&self, exec: GraphExecHandle, graph: GraphHandle) -> (CUresult, i32);
    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> CUresult;
    fn graph_debug_dot_print(&self, graph: GraphHandle, path: &str, flags: u32) -> CUresult;
}
