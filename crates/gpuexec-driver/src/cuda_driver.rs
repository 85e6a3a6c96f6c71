//! Dynamic loading of the real CUDA driver library.
//!
//! Uses `libloading` to load `nvcuda.dll` (Windows) or `libcuda.so.1` (Linux)
//! and implements [`Driver`] on top of the raw driver API functions.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::{debug, info};

use gpuexec_core::handle::{
    ContextHandle, DevicePtr, EventHandle, FunctionHandle, GraphExecHandle, GraphHandle,
    GraphNodeHandle, HostPtr, MemHandle, ModuleHandle, StreamHandle,
};

use crate::driver::{
    CaptureMode, Device, Driver, HostCallback, JitLog, KernelArg, LaunchDims, CU_MEMORYTYPE_DEVICE,
};
use crate::result::{
    CUresult, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_SUPPORTED, CUDA_SUCCESS,
};

/// Opaque CUDA types (represented as pointers).
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUdeviceptr = u64;
pub type CUstream = *mut c_void;
pub type CUevent = *mut c_void;
pub type CUgraph = *mut c_void;
pub type CUgraphExec = *mut c_void;
pub type CUgraphNode = *mut c_void;
pub type CUmemGenericAllocationHandle = u64;

const CU_POINTER_ATTRIBUTE_CONTEXT: c_int = 1;
const CU_POINTER_ATTRIBUTE_MEMORY_TYPE: c_int = 2;
const CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL: c_int = 9;

const CU_JIT_INFO_LOG_BUFFER: c_int = 3;
const CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES: c_int = 4;
const CU_JIT_ERROR_LOG_BUFFER: c_int = 5;
const CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES: c_int = 6;
const CU_JIT_LOG_VERBOSE: c_int = 12;
const JIT_LOG_BUFFER_BYTES: usize = 1024;

const CU_MEM_ALLOCATION_TYPE_PINNED: c_int = 1;
const CU_MEM_LOCATION_TYPE_DEVICE: c_int = 1;
const CU_MEM_ACCESS_FLAGS_PROT_READWRITE: c_int = 3;
const CU_MEM_ALLOC_GRANULARITY_MINIMUM: c_int = 0;

const CU_STREAM_CAPTURE_STATUS_ACTIVE: c_int = 1;

#[repr(C)]
struct CudaKernelNodeParams {
    func: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
}

#[repr(C)]
struct CudaMemcpy3D {
    src_x_in_bytes: usize,
    src_y: usize,
    src_z: usize,
    src_lod: usize,
    src_memory_type: c_int,
    src_host: *const c_void,
    src_device: CUdeviceptr,
    src_array: *mut c_void,
    reserved0: *mut c_void,
    src_pitch: usize,
    src_height: usize,
    dst_x_in_bytes: usize,
    dst_y: usize,
    dst_z: usize,
    dst_lod: usize,
    dst_memory_type: c_int,
    dst_host: *mut c_void,
    dst_device: CUdeviceptr,
    dst_array: *mut c_void,
    reserved1: *mut c_void,
    dst_pitch: usize,
    dst_height: usize,
    width_in_bytes: usize,
    height: usize,
    depth: usize,
}

#[repr(C)]
struct CudaMemsetNodeParams {
    dst: CUdeviceptr,
    pitch: usize,
    value: c_uint,
    element_size: c_uint,
    width: usize,
    height: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemLocation {
    kind: c_int,
    id: c_int,
}

#[repr(C)]
struct CUmemAllocationPropFlags {
    compression_type: u8,
    gpu_direct_rdma_capable: u8,
    usage: u16,
    reserved: [u8; 4],
}

#[repr(C)]
struct CUmemAllocationProp {
    kind: c_int,
    requested_handle_types: c_int,
    location: CUmemLocation,
    win32_handle_meta_data: *mut c_void,
    alloc_flags: CUmemAllocationPropFlags,
}

impl CUmemAllocationProp {
    fn pinned_on(device: CUdevice) -> Self {
        Self {
            kind: CU_MEM_ALLOCATION_TYPE_PINNED,
            requested_handle_types: 0,
            location: CUmemLocation {
                kind: CU_MEM_LOCATION_TYPE_DEVICE,
                id: device,
            },
            win32_handle_meta_data: std::ptr::null_mut(),
            alloc_flags: CUmemAllocationPropFlags {
                compression_type: 0,
                gpu_direct_rdma_capable: 0,
                usage: 0,
                reserved: [0; 4],
            },
        }
    }
}

#[repr(C)]
struct CUmemAccessDesc {
    location: CUmemLocation,
    flags: c_int,
}

#[repr(C)]
struct CUgraphExecUpdateResultInfo {
    result: c_int,
    error_node: CUgraphNode,
    error_from_node: CUgraphNode,
}

type CUhostFn = unsafe extern "C" fn(user_data: *mut c_void);

/// Function pointer type definitions for the CUDA driver API.
type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDriverGetVersion = unsafe extern "C" fn(version: *mut c_int) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceGetAttribute =
    unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;
type FnCuDeviceGetPCIBusId =
    unsafe extern "C" fn(pci_bus_id: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceCanAccessPeer =
    unsafe extern "C" fn(can_access: *mut c_int, dev: CUdevice, peer_dev: CUdevice) -> CUresult;

// Primary context
type FnCuDevicePrimaryCtxRetain = unsafe extern "C" fn(pctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type FnCuDevicePrimaryCtxRelease = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type FnCuDevicePrimaryCtxGetState =
    unsafe extern "C" fn(dev: CUdevice, flags: *mut c_uint, active: *mut c_int) -> CUresult;
type FnCuDevicePrimaryCtxSetFlags = unsafe extern "C" fn(dev: CUdevice, flags: c_uint) -> CUresult;

// Context management
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxGetCurrent = unsafe extern "C" fn(pctx: *mut CUcontext) -> CUresult;
type FnCuCtxGetDevice = unsafe extern "C" fn(device: *mut CUdevice) -> CUresult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CUresult;
type FnCuCtxGetStreamPriorityRange =
    unsafe extern "C" fn(least: *mut c_int, greatest: *mut c_int) -> CUresult;
type FnCuCtxEnablePeerAccess = unsafe extern "C" fn(peer_ctx: CUcontext, flags: c_uint) -> CUresult;
type FnCuCtxGetSharedMemConfig = unsafe extern "C" fn(config: *mut c_int) -> CUresult;
type FnCuCtxSetSharedMemConfig = unsafe extern "C" fn(config: c_int) -> CUresult;
type FnCuMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;

// Module management
type FnCuModuleLoadDataEx = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: c_uint,
    options: *mut c_int,
    option_values: *mut *mut c_void,
) -> CUresult;
type FnCuModuleLoadFatBinary = unsafe extern "C" fn(module: *mut CUmodule, fat_cubin: *const c_void) -> CUresult;
type FnCuModuleUnload = unsafe extern "C" fn(hmod: CUmodule) -> CUresult;
type FnCuModuleGetFunction =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type FnCuModuleGetGlobal = unsafe extern "C" fn(
    dptr: *mut CUdeviceptr,
    bytes: *mut usize,
    hmod: CUmodule,
    name: *const c_char,
) -> CUresult;

// Functions and launch
type FnCuFuncGetAttribute = unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, func: CUfunction) -> CUresult;
type FnCuFuncSetAttribute = unsafe extern "C" fn(func: CUfunction, attrib: c_int, value: c_int) -> CUresult;
type FnCuFuncSetCacheConfig = unsafe extern "C" fn(func: CUfunction, config: c_int) -> CUresult;
type FnCuOccupancyMaxActiveBlocksPerMultiprocessor = unsafe extern "C" fn(
    num_blocks: *mut c_int,
    func: CUfunction,
    block_size: c_int,
    dynamic_smem_size: usize,
) -> CUresult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    hstream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

// Memory management
type FnCuMemAlloc = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type FnCuMemFree = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type FnCuMemAllocManaged =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize, flags: c_uint) -> CUresult;
type FnCuMemHostAlloc = unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize, flags: c_uint) -> CUresult;
type FnCuMemFreeHost = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type FnCuMemHostRegister = unsafe extern "C" fn(p: *mut c_void, bytesize: usize, flags: c_uint) -> CUresult;
type FnCuMemHostUnregister = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type FnCuMemAllocAsync =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize, hstream: CUstream) -> CUresult;
type FnCuMemFreeAsync = unsafe extern "C" fn(dptr: CUdeviceptr, hstream: CUstream) -> CUresult;
type FnCuMemGetAddressRange =
    unsafe extern "C" fn(pbase: *mut CUdeviceptr, psize: *mut usize, dptr: CUdeviceptr) -> CUresult;
type FnCuMemsetD8 = unsafe extern "C" fn(dst: CUdeviceptr, value: u8, count: usize) -> CUresult;
type FnCuMemsetD32 = unsafe extern "C" fn(dst: CUdeviceptr, value: u32, count: usize) -> CUresult;
type FnCuMemsetD8Async =
    unsafe extern "C" fn(dst: CUdeviceptr, value: u8, count: usize, hstream: CUstream) -> CUresult;
type FnCuMemsetD32Async =
    unsafe extern "C" fn(dst: CUdeviceptr, value: u32, count: usize, hstream: CUstream) -> CUresult;

// Copies
type FnCuMemcpyHtoD = unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, byte_count: usize) -> CUresult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, byte_count: usize) -> CUresult;
type FnCuMemcpyDtoD = unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult;
type FnCuMemcpyPeer = unsafe extern "C" fn(
    dst: CUdeviceptr,
    dst_ctx: CUcontext,
    src: CUdeviceptr,
    src_ctx: CUcontext,
    byte_count: usize,
) -> CUresult;
type FnCuMemcpyHtoDAsync =
    unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, byte_count: usize, hstream: CUstream) -> CUresult;
type FnCuMemcpyDtoHAsync =
    unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, byte_count: usize, hstream: CUstream) -> CUresult;
type FnCuMemcpyDtoDAsync =
    unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize, hstream: CUstream) -> CUresult;
type FnCuMemcpyPeerAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    dst_ctx: CUcontext,
    src: CUdeviceptr,
    src_ctx: CUcontext,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;

// Pointer attributes
type FnCuPointerGetAttribute =
    unsafe extern "C" fn(data: *mut c_void, attribute: c_int, ptr: CUdeviceptr) -> CUresult;

// Virtual memory management
type FnCuMemAddressReserve = unsafe extern "C" fn(
    ptr: *mut CUdeviceptr,
    size: usize,
    alignment: usize,
    addr: CUdeviceptr,
    flags: u64,
) -> CUresult;
type FnCuMemAddressFree = unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult;
type FnCuMemGetAllocationGranularity =
    unsafe extern "C" fn(granularity: *mut usize, prop: *const CUmemAllocationProp, option: c_int) -> CUresult;
type FnCuMemCreate = unsafe extern "C" fn(
    handle: *mut CUmemGenericAllocationHandle,
    size: usize,
    prop: *const CUmemAllocationProp,
    flags: u64,
) -> CUresult;
type FnCuMemRelease = unsafe extern "C" fn(handle: CUmemGenericAllocationHandle) -> CUresult;
type FnCuMemMap = unsafe extern "C" fn(
    ptr: CUdeviceptr,
    size: usize,
    offset: usize,
    handle: CUmemGenericAllocationHandle,
    flags: u64,
) -> CUresult;
type FnCuMemSetAccess =
    unsafe extern "C" fn(ptr: CUdeviceptr, size: usize, desc: *const CUmemAccessDesc, count: usize) -> CUresult;
type FnCuMemUnmap = unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult;

// Streams
type FnCuStreamCreate = unsafe extern "C" fn(stream: *mut CUstream, flags: c_uint) -> CUresult;
type FnCuStreamCreateWithPriority =
    unsafe extern "C" fn(stream: *mut CUstream, flags: c_uint, priority: c_int) -> CUresult;
type FnCuStreamDestroy = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type FnCuStreamSynchronize = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type FnCuStreamQuery = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type FnCuStreamWaitEvent = unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: c_uint) -> CUresult;
type FnCuLaunchHostFunc = unsafe extern "C" fn(stream: CUstream, func: CUhostFn, user_data: *mut c_void) -> CUresult;
type FnCuStreamBeginCapture = unsafe extern "C" fn(stream: CUstream, mode: c_int) -> CUresult;
type FnCuStreamEndCapture = unsafe extern "C" fn(stream: CUstream, graph: *mut CUgraph) -> CUresult;
type FnCuStreamIsCapturing = unsafe extern "C" fn(stream: CUstream, status: *mut c_int) -> CUresult;

// Events
type FnCuEventCreate = unsafe extern "C" fn(event: *mut CUevent, flags: c_uint) -> CUresult;
type FnCuEventDestroy = unsafe extern "C" fn(event: CUevent) -> CUresult;
type FnCuEventRecord = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type FnCuEventSynchronize = unsafe extern "C" fn(event: CUevent) -> CUresult;
type FnCuEventQuery = unsafe extern "C" fn(event: CUevent) -> CUresult;
type FnCuEventElapsedTime = unsafe extern "C" fn(ms: *mut f32, start: CUevent, end: CUevent) -> CUresult;

// Graphs
type FnCuGraphCreate = unsafe extern "C" fn(graph: *mut CUgraph, flags: c_uint) -> CUresult;
type FnCuGraphDestroy = unsafe extern "C" fn(graph: CUgraph) -> CUresult;
type FnCuGraphAddKernelNode = unsafe extern "C" fn(
    node: *mut CUgraphNode,
    graph: CUgraph,
    deps: *const CUgraphNode,
    num_deps: usize,
    params: *const CudaKernelNodeParams,
) -> CUresult;
type FnCuGraphAddMemcpyNode = unsafe extern "C" fn(
    node: *mut CUgraphNode,
    graph: CUgraph,
    deps: *const CUgraphNode,
    num_deps: usize,
    params: *const CudaMemcpy3D,
    ctx: CUcontext,
) -> CUresult;
type FnCuGraphAddMemsetNode = unsafe extern "C" fn(
    node: *mut CUgraphNode,
    graph: CUgraph,
    deps: *const CUgraphNode,
    num_deps: usize,
    params: *const CudaMemsetNodeParams,
    ctx: CUcontext,
) -> CUresult;
type FnCuGraphAddEmptyNode =
    unsafe extern "C" fn(node: *mut CUgraphNode, graph: CUgraph, deps: *const CUgraphNode, num_deps: usize) -> CUresult;
type FnCuGraphNodeGetType = unsafe extern "C" fn(node: CUgraphNode, kind: *mut c_int) -> CUresult;
type FnCuGraphInstantiateWithFlags =
    unsafe extern "C" fn(exec: *mut CUgraphExec, graph: CUgraph, flags: u64) -> CUresult;
type FnCuGraphLaunch = unsafe extern "C" fn(exec: CUgraphExec, stream: CUstream) -> CUresult;
type FnCuGraphExecUpdate =
    unsafe extern "C" fn(exec: CUgraphExec, graph: CUgraph, info: *mut CUgraphExecUpdateResultInfo) -> CUresult;
type FnCuGraphExecDestroy = unsafe extern "C" fn(exec: CUgraphExec) -> CUresult;
type FnCuGraphDebugDotPrint = unsafe extern "C" fn(graph: CUgraph, path: *const c_char, flags: c_uint) -> CUresult;

/// Dynamically loaded CUDA driver.
pub struct CudaDriver {
    _lib: Library,
    // Initialization and devices
    cu_init: FnCuInit,
    cu_driver_get_version: FnCuDriverGetVersion,
    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_get_attribute: FnCuDeviceGetAttribute,
    cu_device_total_mem: FnCuDeviceTotalMem,
    cu_device_get_pci_bus_id: Option<FnCuDeviceGetPCIBusId>,
    cu_device_can_access_peer: Option<FnCuDeviceCanAccessPeer>,
    // Primary context
    cu_device_primary_ctx_retain: Option<FnCuDevicePrimaryCtxRetain>,
    cu_device_primary_ctx_release: Option<FnCuDevicePrimaryCtxRelease>,
    cu_device_primary_ctx_get_state: Option<FnCuDevicePrimaryCtxGetState>,
    cu_device_primary_ctx_set_flags: Option<FnCuDevicePrimaryCtxSetFlags>,
    // Context
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_ctx_get_current: FnCuCtxGetCurrent,
    cu_ctx_get_device: Option<FnCuCtxGetDevice>,
    cu_ctx_synchronize: FnCuCtxSynchronize,
    cu_ctx_get_stream_priority_range: Option<FnCuCtxGetStreamPriorityRange>,
    cu_ctx_enable_peer_access: Option<FnCuCtxEnablePeerAccess>,
    cu_ctx_get_shared_mem_config: Option<FnCuCtxGetSharedMemConfig>,
    cu_ctx_set_shared_mem_config: Option<FnCuCtxSetSharedMemConfig>,
    cu_mem_get_info: Option<FnCuMemGetInfo>,
    // Module
    cu_module_load_data_ex: FnCuModuleLoadDataEx,
    cu_module_load_fat_binary: Option<FnCuModuleLoadFatBinary>,
    cu_module_unload: FnCuModuleUnload,
    cu_module_get_function: FnCuModuleGetFunction,
    cu_module_get_global: FnCuModuleGetGlobal,
    // Functions
    cu_func_get_attribute: Option<FnCuFuncGetAttribute>,
    cu_func_set_attribute: Option<FnCuFuncSetAttribute>,
    cu_func_set_cache_config: Option<FnCuFuncSetCacheConfig>,
    cu_occupancy_max_active_blocks: Option<FnCuOccupancyMaxActiveBlocksPerMultiprocessor>,
    cu_launch_kernel: FnCuLaunchKernel,
    // Memory
    cu_mem_alloc: FnCuMemAlloc,
    cu_mem_free: FnCuMemFree,
    cu_mem_alloc_managed: Option<FnCuMemAllocManaged>,
    cu_mem_host_alloc: Option<FnCuMemHostAlloc>,
    cu_mem_free_host: Option<FnCuMemFreeHost>,
    cu_mem_host_register: Option<FnCuMemHostRegister>,
    cu_mem_host_unregister: Option<FnCuMemHostUnregister>,
    cu_mem_alloc_async: Option<FnCuMemAllocAsync>,
    cu_mem_free_async: Option<FnCuMemFreeAsync>,
    cu_mem_get_address_range: Option<FnCuMemGetAddressRange>,
    cu_memset_d8: FnCuMemsetD8,
    cu_memset_d32: FnCuMemsetD32,
    cu_memset_d8_async: Option<FnCuMemsetD8Async>,
    cu_memset_d32_async: Option<FnCuMemsetD32Async>,
    // Copies
    cu_memcpy_htod: FnCuMemcpyHtoD,
    cu_memcpy_dtoh: FnCuMemcpyDtoH,
    cu_memcpy_dtod: FnCuMemcpyDtoD,
    cu_memcpy_peer: Option<FnCuMemcpyPeer>,
    cu_memcpy_htod_async: Option<FnCuMemcpyHtoDAsync>,
    cu_memcpy_dtoh_async: Option<FnCuMemcpyDtoHAsync>,
    cu_memcpy_dtod_async: Option<FnCuMemcpyDtoDAsync>,
    cu_memcpy_peer_async: Option<FnCuMemcpyPeerAsync>,
    // Pointer attributes
    cu_pointer_get_attribute: Option<FnCuPointerGetAttribute>,
    // Virtual memory
    cu_mem_address_reserve: Option<FnCuMemAddressReserve>,
    cu_mem_address_free: Option<FnCuMemAddressFree>,
    cu_mem_get_allocation_granularity: Option<FnCuMemGetAllocationGranularity>,
    cu_mem_create: Option<FnCuMemCreate>,
    cu_mem_release: Option<FnCuMemRelease>,
    cu_mem_map: Option<FnCuMemMap>,
    cu_mem_set_access: Option<FnCuMemSetAccess>,
    cu_mem_unmap: Option<FnCuMemUnmap>,
    // Streams
    cu_stream_create: Option<FnCuStreamCreate>,
    cu_stream_create_with_priority: Option<FnCuStreamCreateWithPriority>,
    cu_stream_destroy: Option<FnCuStreamDestroy>,
    cu_stream_synchronize: Option<FnCuStreamSynchronize>,
    cu_stream_query: Option<FnCuStreamQuery>,
    cu_stream_wait_event: Option<FnCuStreamWaitEvent>,
    cu_launch_host_func: Option<FnCuLaunchHostFunc>,
    cu_stream_begin_capture: Option<FnCuStreamBeginCapture>,
    cu_stream_end_capture: Option<FnCuStreamEndCapture>,
    cu_stream_is_capturing: Option<FnCuStreamIsCapturing>,
    // Events
    cu_event_create: Option<FnCuEventCreate>,
    cu_event_destroy: Option<FnCuEventDestroy>,
    cu_event_record: Option<FnCuEventRecord>,
    cu_event_synchronize: Option<FnCuEventSynchronize>,
    cu_event_query: Option<FnCuEventQuery>,
    cu_event_elapsed_time: Option<FnCuEventElapsedTime>,
    // Graphs
    cu_graph_create: Option<FnCuGraphCreate>,
    cu_graph_destroy: Option<FnCuGraphDestroy>,
    cu_graph_add_kernel_node: Option<FnCuGraphAddKernelNode>,
    cu_graph_add_memcpy_node: Option<FnCuGraphAddMemcpyNode>,
    cu_graph_add_memset_node: Option<FnCuGraphAddMemsetNode>,
    cu_graph_add_empty_node: Option<FnCuGraphAddEmptyNode>,
    cu_graph_node_get_type: Option<FnCuGraphNodeGetType>,
    cu_graph_instantiate: Option<FnCuGraphInstantiateWithFlags>,
    cu_graph_launch: Option<FnCuGraphLaunch>,
    cu_graph_exec_update: Option<FnCuGraphExecUpdate>,
    cu_graph_exec_destroy: Option<FnCuGraphExecDestroy>,
    cu_graph_debug_dot_print: Option<FnCuGraphDebugDotPrint>,
}

fn ctx_ptr(h: ContextHandle) -> CUcontext {
    h.as_raw() as usize as CUcontext
}

fn ctx_handle(p: CUcontext) -> ContextHandle {
    ContextHandle::from_raw(p as usize as u64)
}

macro_rules! raw_ptr {
    ($h:expr) => {
        $h.as_raw() as usize as *mut c_void
    };
}

macro_rules! from_ptr {
    ($ty:ident, $p:expr) => {
        $ty::from_raw($p as usize as u64)
    };
}

fn node_ptrs(deps: &[GraphNodeHandle]) -> Vec<CUgraphNode> {
    deps.iter().map(|d| raw_ptr!(d)).collect()
}

/// Kernel parameters laid out the way `cuLaunchKernel` expects them: an
/// array of pointers, each pointing at the storage of one argument.
struct KernelParams {
    _slots: Vec<u64>,
    ptrs: Vec<*mut c_void>,
}

impl KernelParams {
    fn new(args: &[KernelArg]) -> Self {
        let mut slots: Vec<u64> = args.iter().map(|a| u64::from_ne_bytes(a.to_slot())).collect();
        let ptrs = slots
            .iter_mut()
            .map(|s| s as *mut u64 as *mut c_void)
            .collect();
        Self { _slots: slots, ptrs }
    }

    fn as_mut_ptr(&mut self) -> *mut *mut c_void {
        if self.ptrs.is_empty() {
            std::ptr::null_mut()
        } else {
            self.ptrs.as_mut_ptr()
        }
    }
}

unsafe extern "C" fn host_func_trampoline(user_data: *mut c_void) {
    // SAFETY: user_data was produced by Box::into_raw in launch_host_func.
    let callback = unsafe { Box::from_raw(user_data as *mut HostCallback) };
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
}

macro_rules! call_opt {
    ($self:ident . $field:ident ( $($arg:expr),* )) => {
        match $self.$field {
            Some(func) => unsafe { func($($arg),*) },
            None => CUDA_ERROR_NOT_SUPPORTED,
        }
    };
}

impl CudaDriver {
    /// Load the CUDA driver library and resolve all function pointers.
    pub fn load() -> Result<Arc<Self>, String> {
        let lib = Self::load_library()?;

        unsafe {
            let driver = Self {
                cu_init: Self::load_fn(&lib, "cuInit")?,
                cu_driver_get_version: Self::load_fn(&lib, "cuDriverGetVersion")?,
                cu_device_get_count: Self::load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: Self::load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: Self::load_fn(&lib, "cuDeviceGetName")?,
                cu_device_get_attribute: Self::load_fn(&lib, "cuDeviceGetAttribute")?,
                cu_device_total_mem: Self::load_fn(&lib, "cuDeviceTotalMem_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuDeviceTotalMem"))?,
                cu_device_get_pci_bus_id: Self::load_fn_opt(&lib, "cuDeviceGetPCIBusId"),
                cu_device_can_access_peer: Self::load_fn_opt(&lib, "cuDeviceCanAccessPeer"),
                // Primary context
                cu_device_primary_ctx_retain: Self::load_fn_opt(&lib, "cuDevicePrimaryCtxRetain"),
                cu_device_primary_ctx_release: Self::load_fn_opt::<FnCuDevicePrimaryCtxRelease>(&lib, "cuDevicePrimaryCtxRelease_v2")
                    .or(Self::load_fn_opt(&lib, "cuDevicePrimaryCtxRelease")),
                cu_device_primary_ctx_get_state: Self::load_fn_opt(&lib, "cuDevicePrimaryCtxGetState"),
                cu_device_primary_ctx_set_flags: Self::load_fn_opt::<FnCuDevicePrimaryCtxSetFlags>(&lib, "cuDevicePrimaryCtxSetFlags_v2")
                    .or(Self::load_fn_opt(&lib, "cuDevicePrimaryCtxSetFlags")),
                // Context
                cu_ctx_set_current: Self::load_fn(&lib, "cuCtxSetCurrent")?,
                cu_ctx_get_current: Self::load_fn(&lib, "cuCtxGetCurrent")?,
                cu_ctx_get_device: Self::load_fn_opt(&lib, "cuCtxGetDevice"),
                cu_ctx_synchronize: Self::load_fn(&lib, "cuCtxSynchronize")?,
                cu_ctx_get_stream_priority_range: Self::load_fn_opt(&lib, "cuCtxGetStreamPriorityRange"),
                cu_ctx_enable_peer_access: Self::load_fn_opt(&lib, "cuCtxEnablePeerAccess"),
                cu_ctx_get_shared_mem_config: Self::load_fn_opt(&lib, "cuCtxGetSharedMemConfig"),
                cu_ctx_set_shared_mem_config: Self::load_fn_opt(&lib, "cuCtxSetSharedMemConfig"),
                cu_mem_get_info: Self::load_fn_opt::<FnCuMemGetInfo>(&lib, "cuMemGetInfo_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemGetInfo")),
                // Module
                cu_module_load_data_ex: Self::load_fn(&lib, "cuModuleLoadDataEx")?,
                cu_module_load_fat_binary: Self::load_fn_opt(&lib, "cuModuleLoadFatBinary"),
                cu_module_unload: Self::load_fn(&lib, "cuModuleUnload")?,
                cu_module_get_function: Self::load_fn(&lib, "cuModuleGetFunction")?,
                cu_module_get_global: Self::load_fn(&lib, "cuModuleGetGlobal_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuModuleGetGlobal"))?,
                // Functions
                cu_func_get_attribute: Self::load_fn_opt(&lib, "cuFuncGetAttribute"),
                cu_func_set_attribute: Self::load_fn_opt(&lib, "cuFuncSetAttribute"),
                cu_func_set_cache_config: Self::load_fn_opt(&lib, "cuFuncSetCacheConfig"),
                cu_occupancy_max_active_blocks: Self::load_fn_opt(&lib, "cuOccupancyMaxActiveBlocksPerMultiprocessor"),
                cu_launch_kernel: Self::load_fn(&lib, "cuLaunchKernel")?,
                // Memory
                cu_mem_alloc: Self::load_fn(&lib, "cuMemAlloc_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemAlloc"))?,
                cu_mem_free: Self::load_fn(&lib, "cuMemFree_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemFree"))?,
                cu_mem_alloc_managed: Self::load_fn_opt(&lib, "cuMemAllocManaged"),
                cu_mem_host_alloc: Self::load_fn_opt(&lib, "cuMemHostAlloc"),
                cu_mem_free_host: Self::load_fn_opt(&lib, "cuMemFreeHost"),
                cu_mem_host_register: Self::load_fn_opt::<FnCuMemHostRegister>(&lib, "cuMemHostRegister_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemHostRegister")),
                cu_mem_host_unregister: Self::load_fn_opt(&lib, "cuMemHostUnregister"),
                cu_mem_alloc_async: Self::load_fn_opt(&lib, "cuMemAllocAsync"),
                cu_mem_free_async: Self::load_fn_opt(&lib, "cuMemFreeAsync"),
                cu_mem_get_address_range: Self::load_fn_opt::<FnCuMemGetAddressRange>(&lib, "cuMemGetAddressRange_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemGetAddressRange")),
                cu_memset_d8: Self::load_fn(&lib, "cuMemsetD8_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemsetD8"))?,
                cu_memset_d32: Self::load_fn(&lib, "cuMemsetD32_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemsetD32"))?,
                cu_memset_d8_async: Self::load_fn_opt(&lib, "cuMemsetD8Async"),
                cu_memset_d32_async: Self::load_fn_opt(&lib, "cuMemsetD32Async"),
                // Copies
                cu_memcpy_htod: Self::load_fn(&lib, "cuMemcpyHtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyHtoD"))?,
                cu_memcpy_dtoh: Self::load_fn(&lib, "cuMemcpyDtoH_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoH"))?,
                cu_memcpy_dtod: Self::load_fn(&lib, "cuMemcpyDtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoD"))?,
                cu_memcpy_peer: Self::load_fn_opt(&lib, "cuMemcpyPeer"),
                cu_memcpy_htod_async: Self::load_fn_opt::<FnCuMemcpyHtoDAsync>(&lib, "cuMemcpyHtoDAsync_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemcpyHtoDAsync")),
                cu_memcpy_dtoh_async: Self::load_fn_opt::<FnCuMemcpyDtoHAsync>(&lib, "cuMemcpyDtoHAsync_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemcpyDtoHAsync")),
                cu_memcpy_dtod_async: Self::load_fn_opt::<FnCuMemcpyDtoDAsync>(&lib, "cuMemcpyDtoDAsync_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemcpyDtoDAsync")),
                cu_memcpy_peer_async: Self::load_fn_opt(&lib, "cuMemcpyPeerAsync"),
                // Pointer attributes
                cu_pointer_get_attribute: Self::load_fn_opt(&lib, "cuPointerGetAttribute"),
                // Virtual memory
                cu_mem_address_reserve: Self::load_fn_opt(&lib, "cuMemAddressReserve"),
                cu_mem_address_free: Self::load_fn_opt(&lib, "cuMemAddressFree"),
                cu_mem_get_allocation_granularity: Self::load_fn_opt(&lib, "cuMemGetAllocationGranularity"),
                cu_mem_create: Self::load_fn_opt(&lib, "cuMemCreate"),
                cu_mem_release: Self::load_fn_opt(&lib, "cuMemRelease"),
                cu_mem_map: Self::load_fn_opt(&lib, "cuMemMap"),
                cu_mem_set_access: Self::load_fn_opt(&lib, "cuMemSetAccess"),
                cu_mem_unmap: Self::load_fn_opt(&lib, "cuMemUnmap"),
                // Streams
                cu_stream_create: Self::load_fn_opt(&lib, "cuStreamCreate"),
                cu_stream_create_with_priority: Self::load_fn_opt(&lib, "cuStreamCreateWithPriority"),
                cu_stream_destroy: Self::load_fn_opt::<FnCuStreamDestroy>(&lib, "cuStreamDestroy_v2")
                    .or(Self::load_fn_opt(&lib, "cuStreamDestroy")),
                cu_stream_synchronize: Self::load_fn_opt(&lib, "cuStreamSynchronize"),
                cu_stream_query: Self::load_fn_opt(&lib, "cuStreamQuery"),
                cu_stream_wait_event: Self::load_fn_opt(&lib, "cuStreamWaitEvent"),
                cu_launch_host_func: Self::load_fn_opt(&lib, "cuLaunchHostFunc"),
                cu_stream_begin_capture: Self::load_fn_opt::<FnCuStreamBeginCapture>(&lib, "cuStreamBeginCapture_v2")
                    .or(Self::load_fn_opt(&lib, "cuStreamBeginCapture")),
                cu_stream_end_capture: Self::load_fn_opt(&lib, "cuStreamEndCapture"),
                cu_stream_is_capturing: Self::load_fn_opt(&lib, "cuStreamIsCapturing"),
                // Events
                cu_event_create: Self::load_fn_opt(&lib, "cuEventCreate"),
                cu_event_destroy: Self::load_fn_opt::<FnCuEventDestroy>(&lib, "cuEventDestroy_v2")
                    .or(Self::load_fn_opt(&lib, "cuEventDestroy")),
                cu_event_record: Self::load_fn_opt(&lib, "cuEventRecord"),
                cu_event_synchronize: Self::load_fn_opt(&lib, "cuEventSynchronize"),
                cu_event_query: Self::load_fn_opt(&lib, "cuEventQuery"),
                cu_event_elapsed_time: Self::load_fn_opt(&lib, "cuEventElapsedTime"),
                // Graphs
                cu_graph_create: Self::load_fn_opt(&lib, "cuGraphCreate"),
                cu_graph_destroy: Self::load_fn_opt(&lib, "cuGraphDestroy"),
                cu_graph_add_kernel_node: Self::load_fn_opt(&lib, "cuGraphAddKernelNode"),
                cu_graph_add_memcpy_node: Self::load_fn_opt(&lib, "cuGraphAddMemcpyNode"),
                cu_graph_add_memset_node: Self::load_fn_opt(&lib, "cuGraphAddMemsetNode"),
                cu_graph_add_empty_node: Self::load_fn_opt(&lib, "cuGraphAddEmptyNode"),
                cu_graph_node_get_type: Self::load_fn_opt(&lib, "cuGraphNodeGetType"),
                cu_graph_instantiate: Self::load_fn_opt(&lib, "cuGraphInstantiateWithFlags"),
                cu_graph_launch: Self::load_fn_opt(&lib, "cuGraphLaunch"),
                cu_graph_exec_update: Self::load_fn_opt(&lib, "cuGraphExecUpdate_v2"),
                cu_graph_exec_destroy: Self::load_fn_opt(&lib, "cuGraphExecDestroy"),
                cu_graph_debug_dot_print: Self::load_fn_opt(&lib, "cuGraphDebugDotPrint"),
                _lib: lib,
            };

            info!("CUDA driver loaded successfully");
            Ok(Arc::new(driver))
        }
    }

    fn load_library() -> Result<Library, String> {
        let lib_names = gpuexec_common::platform::driver_library_names();

        let mut last_err = String::from("no driver library known for this platform");
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(format!("failed to load CUDA driver library: {}", last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    fn pointer_attribute<T: Default>(&self, attribute: c_int, ptr: DevicePtr) -> Result<T, CUresult> {
        let mut value = T::default();
        let res = call_opt!(self.cu_pointer_get_attribute(
            &mut value as *mut T as *mut c_void,
            attribute,
            ptr.as_raw()
        ));
        if res == CUDA_SUCCESS { Ok(value) } else { Err(res) }
    }

    fn read_c_string(buf: &[u8]) -> String {
        match CStr::from_bytes_until_nul(buf) {
            Ok(s) => s.to_string_lossy().into_owned(),
            Err(_) => String::from_utf8_lossy(buf).into_owned(),
        }
    }
}

impl Driver for CudaDriver {
    fn backend_name(&self) -> &'static str {
        "cuda"
    }

    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> CUresult {
        unsafe { (self.cu_init)(flags as c_uint) }
    }

    fn driver_get_version(&self) -> Result<i32, CUresult> {
        let mut version: c_int = 0;
        let res = unsafe { (self.cu_driver_get_version)(&mut version) };
        if res == CUDA_SUCCESS { Ok(version) } else { Err(res) }
    }

    // ── Device Management ─────────────────────────────────────────

    fn device_get_count(&self) -> Result<i32, CUresult> {
        let mut count: c_int = 0;
        let res = unsafe { (self.cu_device_get_count)(&mut count) };
        if res == CUDA_SUCCESS { Ok(count) } else { Err(res) }
    }

    fn device_get(&self, ordinal: i32) -> Result<Device, CUresult> {
        let mut device: CUdevice = 0;
        let res = unsafe { (self.cu_device_get)(&mut device, ordinal) };
        if res == CUDA_SUCCESS { Ok(device) } else { Err(res) }
    }

    fn device_get_name(&self, device: Device) -> Result<String, CUresult> {
        let mut buf = [0u8; 64];
        let res = unsafe {
            (self.cu_device_get_name)(buf.as_mut_ptr() as *mut c_char, (buf.len() - 1) as c_int, device)
        };
        if res == CUDA_SUCCESS { Ok(Self::read_c_string(&buf)) } else { Err(res) }
    }

    fn device_get_attribute(&self, attrib: i32, device: Device) -> Result<i32, CUresult> {
        let mut value: c_int = 0;
        let res = unsafe { (self.cu_device_get_attribute)(&mut value, attrib, device) };
        if res == CUDA_SUCCESS { Ok(value) } else { Err(res) }
    }

    fn device_total_mem(&self, device: Device) -> Result<u64, CUresult> {
        let mut bytes: usize = 0;
        let res = unsafe { (self.cu_device_total_mem)(&mut bytes, device) };
        if res == CUDA_SUCCESS { Ok(bytes as u64) } else { Err(res) }
    }

    fn device_get_pci_bus_id(&self, device: Device) -> Result<String, CUresult> {
        let mut buf = [0u8; 64];
        let res = call_opt!(self.cu_device_get_pci_bus_id(
            buf.as_mut_ptr() as *mut c_char,
            (buf.len() - 1) as c_int,
            device
        ));
        if res == CUDA_SUCCESS { Ok(Self::read_c_string(&buf)) } else { Err(res) }
    }

    fn device_can_access_peer(&self, device: Device, peer: Device) -> Result<bool, CUresult> {
        let mut can_access: c_int = 0;
        let res = call_opt!(self.cu_device_can_access_peer(&mut can_access, device, peer));
        if res == CUDA_SUCCESS { Ok(can_access != 0) } else { Err(res) }
    }

    // ── Primary Context ───────────────────────────────────────────

    fn device_primary_ctx_retain(&self, device: Device) -> Result<ContextHandle, CUresult> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        let res = call_opt!(self.cu_device_primary_ctx_retain(&mut ctx, device));
        if res == CUDA_SUCCESS { Ok(ctx_handle(ctx)) } else { Err(res) }
    }

    fn device_primary_ctx_release(&self, device: Device) -> CUresult {
        call_opt!(self.cu_device_primary_ctx_release(device))
    }

    fn device_primary_ctx_get_state(&self, device: Device) -> Result<(u32, bool), CUresult> {
        let mut flags: c_uint = 0;
        let mut active: c_int = 0;
        let res = call_opt!(self.cu_device_primary_ctx_get_state(device, &mut flags, &mut active));
        if res == CUDA_SUCCESS { Ok((flags, active != 0)) } else { Err(res) }
    }

    fn device_primary_ctx_set_flags(&self, device: Device, flags: u32) -> CUresult {
        call_opt!(self.cu_device_primary_ctx_set_flags(device, flags as c_uint))
    }

    // ── Context Management ────────────────────────────────────────

    fn ctx_set_current(&self, ctx: ContextHandle) -> CUresult {
        unsafe { (self.cu_ctx_set_current)(ctx_ptr(ctx)) }
    }

    fn ctx_get_current(&self) -> Result<ContextHandle, CUresult> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        let res = unsafe { (self.cu_ctx_get_current)(&mut ctx) };
        if res == CUDA_SUCCESS { Ok(ctx_handle(ctx)) } else { Err(res) }
    }

    fn ctx_get_device(&self) -> Result<Device, CUresult> {
        let mut dev: CUdevice = 0;
        let res = call_opt!(self.cu_ctx_get_device(&mut dev));
        if res == CUDA_SUCCESS { Ok(dev) } else { Err(res) }
    }

    fn ctx_synchronize(&self) -> CUresult {
        unsafe { (self.cu_ctx_synchronize)() }
    }

    fn ctx_get_stream_priority_range(&self) -> Result<(i32, i32), CUresult> {
        let mut least: c_int = 0;
        let mut greatest: c_int = 0;
        let res = call_opt!(self.cu_ctx_get_stream_priority_range(&mut least, &mut greatest));
        if res == CUDA_SUCCESS { Ok((least, greatest)) } else { Err(res) }
    }

    fn ctx_enable_peer_access(&self, peer: ContextHandle, flags: u32) -> CUresult {
        call_opt!(self.cu_ctx_enable_peer_access(ctx_ptr(peer), flags as c_uint))
    }

    fn ctx_get_shared_mem_config(&self) -> Result<i32, CUresult> {
        let mut config: c_int = 0;
        let res = call_opt!(self.cu_ctx_get_shared_mem_config(&mut config));
        if res == CUDA_SUCCESS { Ok(config) } else { Err(res) }
    }

    fn ctx_set_shared_mem_config(&self, config: i32) -> CUresult {
        call_opt!(self.cu_ctx_set_shared_mem_config(config))
    }

    fn mem_get_info(&self) -> Result<(u64, u64), CUresult> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let res = call_opt!(self.cu_mem_get_info(&mut free, &mut total));
        if res == CUDA_SUCCESS { Ok((free as u64, total as u64)) } else { Err(res) }
    }

    // ── Module Management ─────────────────────────────────────────

    fn module_load_data_ex(&self, image: &[u8], log: &mut JitLog) -> Result<ModuleHandle, CUresult> {
        // The JIT reads the image as a NUL-terminated string.
        let owned;
        let image = if image.last() == Some(&0) {
            image
        } else {
            owned = [image, &[0u8]].concat();
            &owned[..]
        };

        let mut error_buf = vec![0u8; JIT_LOG_BUFFER_BYTES];
        let mut info_buf = vec![0u8; JIT_LOG_BUFFER_BYTES];
        let mut options = [
            CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
            CU_JIT_ERROR_LOG_BUFFER,
            CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
            CU_JIT_INFO_LOG_BUFFER,
            CU_JIT_LOG_VERBOSE,
        ];
        let mut values: [*mut c_void; 5] = [
            JIT_LOG_BUFFER_BYTES as *mut c_void,
            error_buf.as_mut_ptr() as *mut c_void,
            JIT_LOG_BUFFER_BYTES as *mut c_void,
            info_buf.as_mut_ptr() as *mut c_void,
            1usize as *mut c_void,
        ];

        let mut module: CUmodule = std::ptr::null_mut();
        let res = unsafe {
            (self.cu_module_load_data_ex)(
                &mut module,
                image.as_ptr() as *const c_void,
                options.len() as c_uint,
                options.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        };

        // The JIT writes the produced log sizes back into the value slots.
        let error_len = (values[0] as usize).min(JIT_LOG_BUFFER_BYTES);
        let info_len = (values[2] as usize).min(JIT_LOG_BUFFER_BYTES);
        log.error = Self::read_c_string(&error_buf[..error_len]);
        log.info = Self::read_c_string(&info_buf[..info_len]);

        if res == CUDA_SUCCESS { Ok(from_ptr!(ModuleHandle, module)) } else { Err(res) }
    }

    fn module_load_fat_binary(&self, image: &[u8]) -> Result<ModuleHandle, CUresult> {
        let mut module: CUmodule = std::ptr::null_mut();
        let res = call_opt!(self.cu_module_load_fat_binary(&mut module, image.as_ptr() as *const c_void));
        if res == CUDA_SUCCESS { Ok(from_ptr!(ModuleHandle, module)) } else { Err(res) }
    }

    fn module_unload(&self, module: ModuleHandle) -> CUresult {
        unsafe { (self.cu_module_unload)(raw_ptr!(module)) }
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, CUresult> {
        let c_name = CString::new(name).map_err(|_| CUDA_ERROR_INVALID_VALUE)?;
        let mut func: CUfunction = std::ptr::null_mut();
        let res = unsafe { (self.cu_module_get_function)(&mut func, raw_ptr!(module), c_name.as_ptr()) };
        if res == CUDA_SUCCESS { Ok(from_ptr!(FunctionHandle, func)) } else { Err(res) }
    }

    fn module_get_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, u64), CUresult> {
        let c_name = CString::new(name).map_err(|_| CUDA_ERROR_INVALID_VALUE)?;
        let mut dptr: CUdeviceptr = 0;
        let mut bytes: usize = 0;
        let res = unsafe { (self.cu_module_get_global)(&mut dptr, &mut bytes, raw_ptr!(module), c_name.as_ptr()) };
        if res == CUDA_SUCCESS { Ok((DevicePtr::from_raw(dptr), bytes as u64)) } else { Err(res) }
    }

    // ── Functions and Launch ──────────────────────────────────────

    fn func_get_attribute(&self, attrib: i32, func: FunctionHandle) -> Result<i32, CUresult> {
        let mut value: c_int = 0;
        let res = call_opt!(self.cu_func_get_attribute(&mut value, attrib, raw_ptr!(func)));
        if res == CUDA_SUCCESS { Ok(value) } else { Err(res) }
    }

    fn func_set_attribute(&self, func: FunctionHandle, attrib: i32, value: i32) -> CUresult {
        call_opt!(self.cu_func_set_attribute(raw_ptr!(func), attrib, value))
    }

    fn func_set_cache_config(&self, func: FunctionHandle, config: i32) -> CUresult {
        call_opt!(self.cu_func_set_cache_config(raw_ptr!(func), config))
    }

    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        func: FunctionHandle,
        block_size: i32,
        dynamic_smem_bytes: u64,
    ) -> Result<i32, CUresult> {
        let mut blocks: c_int = 0;
        let res = call_opt!(self.cu_occupancy_max_active_blocks(
            &mut blocks,
            raw_ptr!(func),
            block_size,
            dynamic_smem_bytes as usize
        ));
        if res == CUDA_SUCCESS { Ok(blocks) } else { Err(res) }
    }

    fn launch_kernel(
        &self,
        func: FunctionHandle,
        dims: &LaunchDims,
        stream: StreamHandle,
        args: &[KernelArg],
    ) -> CUresult {
        let mut params = KernelParams::new(args);
        unsafe {
            (self.cu_launch_kernel)(
                raw_ptr!(func),
                dims.grid[0], dims.grid[1], dims.grid[2],
                dims.block[0], dims.block[1], dims.block[2],
                dims.shared_mem_bytes,
                raw_ptr!(stream),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        }
    }

    // ── Memory Management ─────────────────────────────────────────

    fn mem_alloc(&self, bytes: u64) -> Result<DevicePtr, CUresult> {
        let mut dptr: CUdeviceptr = 0;
        let res = unsafe { (self.cu_mem_alloc)(&mut dptr, bytes as usize) };
        if res == CUDA_SUCCESS { Ok(DevicePtr::from_raw(dptr)) } else { Err(res) }
    }

    fn mem_free(&self, ptr: DevicePtr) -> CUresult {
        unsafe { (self.cu_mem_free)(ptr.as_raw()) }
    }

    fn mem_alloc_managed(&self, bytes: u64, flags: u32) -> Result<DevicePtr, CUresult> {
        let mut dptr: CUdeviceptr = 0;
        let res = call_opt!(self.cu_mem_alloc_managed(&mut dptr, bytes as usize, flags as c_uint));
        if res == CUDA_SUCCESS { Ok(DevicePtr::from_raw(dptr)) } else { Err(res) }
    }

    fn mem_host_alloc(&self, bytes: u64, flags: u32) -> Result<HostPtr, CUresult> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let res = call_opt!(self.cu_mem_host_alloc(&mut ptr, bytes as usize, flags as c_uint));
        if res == CUDA_SUCCESS { Ok(HostPtr::from_ptr(ptr as *mut u8)) } else { Err(res) }
    }

    fn mem_free_host(&self, ptr: HostPtr) -> CUresult {
        call_opt!(self.cu_mem_free_host(ptr.as_ptr() as *mut c_void))
    }

    fn mem_host_register(&self, ptr: HostPtr, bytes: u64, flags: u32) -> CUresult {
        call_opt!(self.cu_mem_host_register(ptr.as_ptr() as *mut c_void, bytes as usize, flags as c_uint))
    }

    fn mem_host_unregister(&self, ptr: HostPtr) -> CUresult {
        call_opt!(self.cu_mem_host_unregister(ptr.as_ptr() as *mut c_void))
    }

    fn mem_alloc_async(&self, bytes: u64, stream: StreamHandle) -> Result<DevicePtr, CUresult> {
        let mut dptr: CUdeviceptr = 0;
        let res = call_opt!(self.cu_mem_alloc_async(&mut dptr, bytes as usize, raw_ptr!(stream)));
        if res == CUDA_SUCCESS { Ok(DevicePtr::from_raw(dptr)) } else { Err(res) }
    }

    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_mem_free_async(ptr.as_raw(), raw_ptr!(stream)))
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64), CUresult> {
        let mut base: CUdeviceptr = 0;
        let mut size: usize = 0;
        let res = call_opt!(self.cu_mem_get_address_range(&mut base, &mut size, ptr.as_raw()));
        if res == CUDA_SUCCESS { Ok((DevicePtr::from_raw(base), size as u64)) } else { Err(res) }
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: u64) -> CUresult {
        unsafe { (self.cu_memset_d8)(dst.as_raw(), value, count as usize) }
    }

    fn memset_d32(&self, dst: DevicePtr, value: u32, count: u64) -> CUresult {
        unsafe { (self.cu_memset_d32)(dst.as_raw(), value, count as usize) }
    }

    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: u64, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_memset_d8_async(dst.as_raw(), value, count as usize, raw_ptr!(stream)))
    }

    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: u64, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_memset_d32_async(dst.as_raw(), value, count as usize, raw_ptr!(stream)))
    }

    // ── Copies ────────────────────────────────────────────────────

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> CUresult {
        unsafe { (self.cu_memcpy_htod)(dst.as_raw(), src.as_ptr() as *const c_void, src.len()) }
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> CUresult {
        unsafe { (self.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src.as_raw(), dst.len()) }
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: u64) -> CUresult {
        unsafe { (self.cu_memcpy_dtod)(dst.as_raw(), src.as_raw(), bytes as usize) }
    }

    fn memcpy_peer(
        &self,
        dst: DevicePtr,
        dst_ctx: ContextHandle,
        src: DevicePtr,
        src_ctx: ContextHandle,
        bytes: u64,
    ) -> CUresult {
        call_opt!(self.cu_memcpy_peer(dst.as_raw(), ctx_ptr(dst_ctx), src.as_raw(), ctx_ptr(src_ctx), bytes as usize))
    }

    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: *const u8, bytes: u64, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_memcpy_htod_async(dst.as_raw(), src as *const c_void, bytes as usize, raw_ptr!(stream)))
    }

    unsafe fn memcpy_dtoh_async(&self, dst: *mut u8, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_memcpy_dtoh_async(dst as *mut c_void, src.as_raw(), bytes as usize, raw_ptr!(stream)))
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_memcpy_dtod_async(dst.as_raw(), src.as_raw(), bytes as usize, raw_ptr!(stream)))
    }

    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_ctx: ContextHandle,
        src: DevicePtr,
        src_ctx: ContextHandle,
        bytes: u64,
        stream: StreamHandle,
    ) -> CUresult {
        call_opt!(self.cu_memcpy_peer_async(
            dst.as_raw(),
            ctx_ptr(dst_ctx),
            src.as_raw(),
            ctx_ptr(src_ctx),
            bytes as usize,
            raw_ptr!(stream)
        ))
    }

    // ── Pointer Attributes ────────────────────────────────────────

    fn pointer_get_context(&self, ptr: DevicePtr) -> Result<ContextHandle, CUresult> {
        let raw: usize = self.pointer_attribute(CU_POINTER_ATTRIBUTE_CONTEXT, ptr)?;
        Ok(ContextHandle::from_raw(raw as u64))
    }

    fn pointer_get_memory_type(&self, ptr: DevicePtr) -> Result<i32, CUresult> {
        let raw: c_uint = self.pointer_attribute(CU_POINTER_ATTRIBUTE_MEMORY_TYPE, ptr)?;
        Ok(raw as i32)
    }

    fn pointer_get_device_ordinal(&self, ptr: DevicePtr) -> Result<i32, CUresult> {
        self.pointer_attribute::<c_int>(CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL, ptr)
    }

    // ── Virtual Memory ────────────────────────────────────────────

    fn mem_address_reserve(&self, bytes: u64, alignment: u64) -> Result<DevicePtr, CUresult> {
        let mut base: CUdeviceptr = 0;
        let res = call_opt!(self.cu_mem_address_reserve(&mut base, bytes as usize, alignment as usize, 0, 0));
        if res == CUDA_SUCCESS { Ok(DevicePtr::from_raw(base)) } else { Err(res) }
    }

    fn mem_address_free(&self, ptr: DevicePtr, bytes: u64) -> CUresult {
        call_opt!(self.cu_mem_address_free(ptr.as_raw(), bytes as usize))
    }

    fn mem_get_allocation_granularity(&self, device: Device) -> Result<u64, CUresult> {
        let props = CUmemAllocationProp::pinned_on(device);
        let mut granularity: usize = 0;
        let res = call_opt!(self.cu_mem_get_allocation_granularity(
            &mut granularity,
            &props,
            CU_MEM_ALLOC_GRANULARITY_MINIMUM
        ));
        if res == CUDA_SUCCESS { Ok(granularity as u64) } else { Err(res) }
    }

    fn mem_create(&self, bytes: u64, device: Device) -> Result<MemHandle, CUresult> {
        let props = CUmemAllocationProp::pinned_on(device);
        let mut handle: CUmemGenericAllocationHandle = 0;
        let res = call_opt!(self.cu_mem_create(&mut handle, bytes as usize, &props, 0));
        if res == CUDA_SUCCESS { Ok(MemHandle::from_raw(handle)) } else { Err(res) }
    }

    fn mem_release(&self, handle: MemHandle) -> CUresult {
        call_opt!(self.cu_mem_release(handle.as_raw()))
    }

    fn mem_map(&self, ptr: DevicePtr, bytes: u64, handle: MemHandle) -> CUresult {
        // Zero is the only valid value for both offset and flags.
        call_opt!(self.cu_mem_map(ptr.as_raw(), bytes as usize, 0, handle.as_raw(), 0))
    }

    fn mem_set_access(&self, ptr: DevicePtr, bytes: u64, devices: &[Device]) -> CUresult {
        let descriptors: Vec<CUmemAccessDesc> = devices
            .iter()
            .map(|&id| CUmemAccessDesc {
                location: CUmemLocation {
                    kind: CU_MEM_LOCATION_TYPE_DEVICE,
                    id,
                },
                flags: CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
            })
            .collect();
        call_opt!(self.cu_mem_set_access(ptr.as_raw(), bytes as usize, descriptors.as_ptr(), descriptors.len()))
    }

    fn mem_unmap(&self, ptr: DevicePtr, bytes: u64) -> CUresult {
        call_opt!(self.cu_mem_unmap(ptr.as_raw(), bytes as usize))
    }

    // ── Streams ───────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<StreamHandle, CUresult> {
        let mut stream: CUstream = std::ptr::null_mut();
        let res = call_opt!(self.cu_stream_create(&mut stream, flags as c_uint));
        if res == CUDA_SUCCESS { Ok(from_ptr!(StreamHandle, stream)) } else { Err(res) }
    }

    fn stream_create_with_priority(&self, flags: u32, priority: i32) -> Result<StreamHandle, CUresult> {
        let mut stream: CUstream = std::ptr::null_mut();
        let res = call_opt!(self.cu_stream_create_with_priority(&mut stream, flags as c_uint, priority));
        if res == CUDA_SUCCESS { Ok(from_ptr!(StreamHandle, stream)) } else { Err(res) }
    }

    fn stream_destroy(&self, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_stream_destroy(raw_ptr!(stream)))
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_stream_synchronize(raw_ptr!(stream)))
    }

    fn stream_query(&self, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_stream_query(raw_ptr!(stream)))
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle, flags: u32) -> CUresult {
        call_opt!(self.cu_stream_wait_event(raw_ptr!(stream), raw_ptr!(event), flags as c_uint))
    }

    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> CUresult {
        let Some(func) = self.cu_launch_host_func else {
            return CUDA_ERROR_NOT_SUPPORTED;
        };
        let data = Box::into_raw(Box::new(callback)) as *mut c_void;
        let res = unsafe { func(raw_ptr!(stream), host_func_trampoline, data) };
        if res != CUDA_SUCCESS {
            // The driver never saw the callback; reclaim it.
            drop(unsafe { Box::from_raw(data as *mut HostCallback) });
        }
        res
    }

    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> CUresult {
        call_opt!(self.cu_stream_begin_capture(raw_ptr!(stream), mode.as_raw()))
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, CUresult> {
        let mut graph: CUgraph = std::ptr::null_mut();
        let res = call_opt!(self.cu_stream_end_capture(raw_ptr!(stream), &mut graph));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphHandle, graph)) } else { Err(res) }
    }

    fn stream_is_capturing(&self, stream: StreamHandle) -> Result<bool, CUresult> {
        let mut status: c_int = 0;
        let res = call_opt!(self.cu_stream_is_capturing(raw_ptr!(stream), &mut status));
        if res == CUDA_SUCCESS { Ok(status == CU_STREAM_CAPTURE_STATUS_ACTIVE) } else { Err(res) }
    }

    // ── Events ────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> Result<EventHandle, CUresult> {
        let mut event: CUevent = std::ptr::null_mut();
        let res = call_opt!(self.cu_event_create(&mut event, flags as c_uint));
        if res == CUDA_SUCCESS { Ok(from_ptr!(EventHandle, event)) } else { Err(res) }
    }

    fn event_destroy(&self, event: EventHandle) -> CUresult {
        call_opt!(self.cu_event_destroy(raw_ptr!(event)))
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_event_record(raw_ptr!(event), raw_ptr!(stream)))
    }

    fn event_synchronize(&self, event: EventHandle) -> CUresult {
        call_opt!(self.cu_event_synchronize(raw_ptr!(event)))
    }

    fn event_query(&self, event: EventHandle) -> CUresult {
        call_opt!(self.cu_event_query(raw_ptr!(event)))
    }

    fn event_elapsed_time(&self, start: EventHandle, stop: EventHandle) -> Result<f32, CUresult> {
        let mut ms: f32 = 0.0;
        let res = call_opt!(self.cu_event_elapsed_time(&mut ms, raw_ptr!(start), raw_ptr!(stop)));
        if res == CUDA_SUCCESS { Ok(ms) } else { Err(res) }
    }

    // ── Graphs ────────────────────────────────────────────────────

    fn graph_create(&self, flags: u32) -> Result<GraphHandle, CUresult> {
        let mut graph: CUgraph = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_create(&mut graph, flags as c_uint));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphHandle, graph)) } else { Err(res) }
    }

    fn graph_destroy(&self, graph: GraphHandle) -> CUresult {
        call_opt!(self.cu_graph_destroy(raw_ptr!(graph)))
    }

    fn graph_add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        func: FunctionHandle,
        dims: &LaunchDims,
        args: &[KernelArg],
    ) -> Result<GraphNodeHandle, CUresult> {
        let deps = node_ptrs(deps);
        let mut kernel_params = KernelParams::new(args);
        let params = CudaKernelNodeParams {
            func: raw_ptr!(func),
            grid_dim_x: dims.grid[0],
            grid_dim_y: dims.grid[1],
            grid_dim_z: dims.grid[2],
            block_dim_x: dims.block[0],
            block_dim_y: dims.block[1],
            block_dim_z: dims.block[2],
            shared_mem_bytes: dims.shared_mem_bytes,
            kernel_params: kernel_params.as_mut_ptr(),
            extra: std::ptr::null_mut(),
        };
        let mut node: CUgraphNode = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_add_kernel_node(&mut node, raw_ptr!(graph), deps.as_ptr(), deps.len(), &params));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphNodeHandle, node)) } else { Err(res) }
    }

    fn graph_add_memcpy_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        ctx: ContextHandle,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: u64,
    ) -> Result<GraphNodeHandle, CUresult> {
        let deps = node_ptrs(deps);
        let params = CudaMemcpy3D {
            src_x_in_bytes: 0,
            src_y: 0,
            src_z: 0,
            src_lod: 0,
            src_memory_type: CU_MEMORYTYPE_DEVICE,
            src_host: std::ptr::null(),
            src_device: src.as_raw(),
            src_array: std::ptr::null_mut(),
            reserved0: std::ptr::null_mut(),
            src_pitch: 0,
            src_height: 0,
            dst_x_in_bytes: 0,
            dst_y: 0,
            dst_z: 0,
            dst_lod: 0,
            dst_memory_type: CU_MEMORYTYPE_DEVICE,
            dst_host: std::ptr::null_mut(),
            dst_device: dst.as_raw(),
            dst_array: std::ptr::null_mut(),
            reserved1: std::ptr::null_mut(),
            dst_pitch: 0,
            dst_height: 0,
            width_in_bytes: bytes as usize,
            height: 1,
            depth: 1,
        };
        let mut node: CUgraphNode = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_add_memcpy_node(
            &mut node,
            raw_ptr!(graph),
            deps.as_ptr(),
            deps.len(),
            &params,
            ctx_ptr(ctx)
        ));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphNodeHandle, node)) } else { Err(res) }
    }

    fn graph_add_memset_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        ctx: ContextHandle,
        dst: DevicePtr,
        value: u32,
        element_size: u32,
        count: u64,
    ) -> Result<GraphNodeHandle, CUresult> {
        let deps = node_ptrs(deps);
        let params = CudaMemsetNodeParams {
            dst: dst.as_raw(),
            pitch: 0,
            value,
            element_size,
            width: count as usize,
            height: 1,
        };
        let mut node: CUgraphNode = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_add_memset_node(
            &mut node,
            raw_ptr!(graph),
            deps.as_ptr(),
            deps.len(),
            &params,
            ctx_ptr(ctx)
        ));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphNodeHandle, node)) } else { Err(res) }
    }

    fn graph_add_empty_node(&self, graph: GraphHandle, deps: &[GraphNodeHandle]) -> Result<GraphNodeHandle, CUresult> {
        let deps = node_ptrs(deps);
        let mut node: CUgraphNode = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_add_empty_node(&mut node, raw_ptr!(graph), deps.as_ptr(), deps.len()));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphNodeHandle, node)) } else { Err(res) }
    }

    fn graph_node_get_type(&self, node: GraphNodeHandle) -> Result<i32, CUresult> {
        let mut kind: c_int = 0;
        let res = call_opt!(self.cu_graph_node_get_type(raw_ptr!(node), &mut kind));
        if res == CUDA_SUCCESS { Ok(kind) } else { Err(res) }
    }

    fn graph_instantiate(&self, graph: GraphHandle, flags: u64) -> Result<GraphExecHandle, CUresult> {
        let mut exec: CUgraphExec = std::ptr::null_mut();
        let res = call_opt!(self.cu_graph_instantiate(&mut exec, raw_ptr!(graph), flags));
        if res == CUDA_SUCCESS { Ok(from_ptr!(GraphExecHandle, exec)) } else { Err(res) }
    }

    fn graph_launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> CUresult {
        call_opt!(self.cu_graph_launch(raw_ptr!(exec), raw_ptr!(stream)))
    }

    fn graph_exec_update(&self, exec: GraphExecHandle, graph: GraphHandle) -> (CUresult, i32) {
        let mut info = CUgraphExecUpdateResultInfo {
            result: 0,
            error_node: std::ptr::null_mut(),
            error_from_node: std::ptr::null_mut(),
        };
        let res = call_opt!(self.cu_graph_exec_update(raw_ptr!(exec), raw_ptr!(graph), &mut info));
        (res, info.result)
    }

    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> CUresult {
        call_opt!(self.cu_graph_exec_destroy(raw_ptr!(exec)))
    }

    fn graph_debug_dot_print(&self, graph: GraphHandle, path: &str, flags: u32) -> CUresult {
        let Ok(c_path) = CString::new(path) else {
            return CUDA_ERROR_INVALID_VALUE;
        };
        call_opt!(self.cu_graph_debug_dot_print(raw_ptr!(graph), c_path.as_ptr(), flags as c_uint))
    }
}
