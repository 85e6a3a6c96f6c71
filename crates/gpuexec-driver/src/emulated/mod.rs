//! Host-memory emulation of the driver API.
//!
//! [`EmulatedDriver`] implements [`Driver`] without a GPU: device memory is
//! host memory behind synthetic addresses, kernels are Rust closures
//! registered by entry-point name, and all stream work runs immediately on
//! the calling thread in submission order. It keeps per-entry-point call
//! counters and can be told to fail specific calls, which is what the test
//! suites drive it with.

mod graph;
mod kernel;
mod memory;
mod stream;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use gpuexec_core::handle::{
    ContextHandle, DevicePtr, EventHandle, FunctionHandle, GraphExecHandle, GraphHandle,
    GraphNodeHandle, HostPtr, MemHandle, ModuleHandle, StreamHandle,
};
use gpuexec_core::DriverConfig;

use crate::driver::{
    CaptureMode, Device, DeviceAttribute, Driver, GraphExecUpdateResult, HostCallback, JitLog,
    KernelArg, LaunchDims, CU_EVENT_DISABLE_TIMING, CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
    CU_MEM_ATTACH_GLOBAL, CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
    CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE,
};
use crate::result::*;

use self::graph::{classify_update, ExecState, GraphNode, GraphState, NodeOp};
use self::kernel::{builtin_kernels, parse_ptx, MAX_REGISTERS_PER_THREAD};
use self::memory::{MemoryState, RegionKind};
use self::stream::{Capture, EventState, StreamState};

pub use self::kernel::{HostKernel, KernelLaunch, FILL_U32_PTX, VECTOR_ADD_PTX};
pub use self::memory::EMULATED_GRANULARITY;

const DRIVER_VERSION: i32 = 12040;
const COMPUTE_CAPABILITY: (i32, i32) = (8, 0);
const MULTIPROCESSORS: i32 = 8;
const WARP_SIZE: i32 = 32;
const MAX_THREADS_PER_BLOCK: i32 = 1024;
const MAX_THREADS_PER_MULTIPROCESSOR: i32 = 2048;
const MAX_BLOCKS_PER_MULTIPROCESSOR: i32 = 32;
const SHARED_MEMORY_PER_BLOCK: i32 = 48 * 1024;
const SHARED_MEMORY_PER_BLOCK_OPTIN: i32 = 99 * 1024;
const SHARED_MEMORY_PER_MULTIPROCESSOR: i32 = 100 * 1024;
const REGISTERS_PER_BLOCK: i32 = 64 * 1024;
const REGISTERS_PER_THREAD: i32 = 32;
const GRID_LIMITS: [i32; 3] = [i32::MAX, 65535, 65535];
/// `(least, greatest)` stream priority.
const STREAM_PRIORITY_RANGE: (i32, i32) = (0, -5);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current context of this thread, per driver instance.
    static CURRENT: RefCell<HashMap<u64, ContextHandle>> = RefCell::new(HashMap::new());
}

/// Driver calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Init,
    PrimaryCtxRetain,
    PrimaryCtxRelease,
    CtxSetCurrent,
    MemAlloc,
    MemSetAccess,
    EventCreate,
    ModuleLoad,
    ModuleUnload,
    StreamDestroy,
}

/// Snapshot of the emulated driver's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Every driver entry point, including failed calls.
    pub total: u64,
    pub ctx_set_current: u64,
    pub ctx_synchronize: u64,
    /// Intra-device copies, synchronous and stream-ordered.
    pub memcpy_dtod: u64,
    /// Peer copies, synchronous and stream-ordered.
    pub memcpy_peer: u64,
    pub mem_unmap: u64,
    pub module_loads: u64,
    /// Kernels actually executed, whether launched directly or from a graph.
    pub kernel_launches: u64,
    pub event_destroy: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    ctx_set_current: AtomicU64,
    ctx_synchronize: AtomicU64,
    memcpy_dtod: AtomicU64,
    memcpy_peer: AtomicU64,
    mem_unmap: AtomicU64,
    module_loads: AtomicU64,
    kernel_launches: AtomicU64,
    event_destroy: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> CallCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CallCounts {
            total: load(&self.total),
            ctx_set_current: load(&self.ctx_set_current),
            ctx_synchronize: load(&self.ctx_synchronize),
            memcpy_dtod: load(&self.memcpy_dtod),
            memcpy_peer: load(&self.memcpy_peer),
            mem_unmap: load(&self.mem_unmap),
            module_loads: load(&self.module_loads),
            kernel_launches: load(&self.kernel_launches),
            event_destroy: load(&self.event_destroy),
        }
    }
}

struct PrimaryContext {
    handle: ContextHandle,
    refcount: u32,
    flags: u32,
    shared_mem_config: i32,
}

struct ModuleState {
    ctx: ContextHandle,
    functions: HashMap<String, FunctionHandle>,
    globals: HashMap<String, (DevicePtr, u64)>,
}

struct FunctionState {
    name: String,
    max_dynamic_shared: i32,
}

/// Run a block returning `Result<(), CUresult>` and flatten it to a `CUresult`.
macro_rules! status {
    ($body:block) => {
        match (|| -> Result<(), CUresult> { $body })() {
            Ok(()) => CUDA_SUCCESS,
            Err(res) => res,
        }
    };
}

/// In-process stand-in for the vendor driver.
pub struct EmulatedDriver {
    instance: u64,
    device_count: u32,
    initialized: AtomicBool,
    next_handle: AtomicU64,
    primary: Mutex<Vec<PrimaryContext>>,
    peer_access: Mutex<HashSet<(ContextHandle, ContextHandle)>>,
    memory: Mutex<MemoryState>,
    kernels: RwLock<HashMap<String, HostKernel>>,
    modules: DashMap<ModuleHandle, ModuleState>,
    functions: DashMap<FunctionHandle, FunctionState>,
    streams: DashMap<StreamHandle, StreamState>,
    events: DashMap<EventHandle, EventState>,
    graphs: DashMap<GraphHandle, GraphState>,
    node_owner: DashMap<GraphNodeHandle, GraphHandle>,
    execs: DashMap<GraphExecHandle, ExecState>,
    faults: Mutex<HashMap<FaultPoint, CUresult>>,
    counters: Counters,
}

impl EmulatedDriver {
    /// `devices` devices with `memory_bytes` of device memory each.
    pub fn new(devices: u32, memory_bytes: u64) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let primary = (0..devices)
            .map(|d| PrimaryContext {
                handle: ContextHandle::from_raw(0xC0DE_0000_0000 | (instance << 8) | (d as u64 + 1)),
                refcount: 0,
                flags: 0,
                shared_mem_config: CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE,
            })
            .collect();
        let kernels = builtin_kernels()
            .into_iter()
            .map(|(name, kernel)| (name.to_string(), kernel))
            .collect();

        info!(
            "emulated driver {} created with {} device(s), {} MiB each",
            instance,
            devices,
            memory_bytes / (1024 * 1024)
        );
        Self {
            instance,
            device_count: devices,
            initialized: AtomicBool::new(false),
            next_handle: AtomicU64::new(0x1000),
            primary: Mutex::new(primary),
            peer_access: Mutex::new(HashSet::new()),
            memory: Mutex::new(MemoryState::new(devices as usize, memory_bytes)),
            kernels: RwLock::new(kernels),
            modules: DashMap::new(),
            functions: DashMap::new(),
            streams: DashMap::new(),
            events: DashMap::new(),
            graphs: DashMap::new(),
            node_owner: DashMap::new(),
            execs: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.emulated_devices, config.emulated_memory_bytes)
    }

    /// Make `name` loadable as a kernel entry point.
    pub fn register_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut KernelLaunch<'_>) -> Result<(), CUresult> + Send + Sync + 'static,
    {
        debug!("registering emulated kernel {}", name);
        self.kernels.write().insert(name.to_string(), Arc::new(kernel));
    }

    /// Fail the next call that reaches `point` with `result`.
    pub fn inject_failure(&self, point: FaultPoint, result: CUresult) {
        self.faults.lock().insert(point, result);
    }

    pub fn counters(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Device memory currently allocated on `device`, in bytes.
    pub fn allocated_bytes(&self, device: Device) -> u64 {
        self.memory.lock().used(device)
    }

    /// Whether `ptr` is the base of a live virtual memory mapping.
    pub fn is_mapped(&self, ptr: DevicePtr) -> bool {
        self.memory.lock().is_mapped(ptr)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn tick(&self) {
        bump(&self.counters.total);
    }

    /// Count the call and require a prior successful `init`.
    fn ready(&self) -> Result<(), CUresult> {
        self.tick();
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CUDA_ERROR_NOT_INITIALIZED)
        }
    }

    fn take_fault(&self, point: FaultPoint) -> Result<(), CUresult> {
        match self.faults.lock().remove(&point) {
            Some(res) => {
                debug!("emulated driver: injected {} at {:?}", cuda_error_name(res), point);
                Err(res)
            }
            None => Ok(()),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(&self, device: Device) -> Result<(), CUresult> {
        if device >= 0 && (device as u32) < self.device_count {
            Ok(())
        } else {
            Err(CUDA_ERROR_INVALID_DEVICE)
        }
    }

    /// Device behind a primary context handle of this instance.
    fn device_of(&self, ctx: ContextHandle) -> Option<Device> {
        self.primary
            .lock()
            .iter()
            .position(|p| p.handle == ctx)
            .map(|d| d as Device)
    }

    fn is_active(&self, ctx: ContextHandle) -> bool {
        self.primary
            .lock()
            .iter()
            .any(|p| p.handle == ctx && p.refcount > 0)
    }

    fn current(&self) -> ContextHandle {
        CURRENT.with(|c| c.borrow().get(&self.instance).copied().unwrap_or_default())
    }

    /// The current context and its device; the context must be active.
    fn require_context(&self) -> Result<(ContextHandle, Device), CUresult> {
        let ctx = self.current();
        if ctx.is_null() || !self.is_active(ctx) {
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        let device = self.device_of(ctx).ok_or(CUDA_ERROR_INVALID_CONTEXT)?;
        Ok((ctx, device))
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<(), CUresult> {
        if stream.is_null() || self.streams.contains_key(&stream) {
            Ok(())
        } else {
            Err(CUDA_ERROR_INVALID_HANDLE)
        }
    }

    /// Calls that are illegal while a conflicting capture is in progress
    /// invalidate that capture.
    fn unsafe_call_guard(&self) -> Result<(), CUresult> {
        let thread = std::thread::current().id();
        let mut conflict = false;
        for mut stream in self.streams.iter_mut() {
            if let Some(capture) = stream.capture.as_mut() {
                if capture.forbids_unsafe_calls_from(thread) {
                    capture.invalidated = true;
                    conflict = true;
                }
            }
        }
        if conflict {
            Err(CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED)
        } else {
            Ok(())
        }
    }

    /// Work that cannot be recorded into a graph.
    fn reject_in_capture(&self, stream: StreamHandle) -> Result<(), CUresult> {
        if let Some(mut state) = self.streams.get_mut(&stream) {
            if let Some(capture) = state.capture.as_mut() {
                capture.invalidated = true;
                return Err(CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED);
            }
        }
        Ok(())
    }

    fn add_node(&self, graph: GraphHandle, deps: &[GraphNodeHandle], op: NodeOp) -> Result<GraphNodeHandle, CUresult> {
        let mut state = self.graphs.get_mut(&graph).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        let deps = state.dependency_indices(deps).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        let handle = GraphNodeHandle::from_raw(self.next_raw());
        state.nodes.push(GraphNode { handle, deps, op });
        drop(state);
        self.node_owner.insert(handle, graph);
        Ok(handle)
    }

    /// Record `op` if `stream` is capturing, otherwise run it now.
    fn submit(&self, stream: StreamHandle, op: NodeOp) -> Result<(), CUresult> {
        let capture = match self.streams.get(&stream) {
            Some(state) => match &state.capture {
                Some(c) if c.invalidated => return Err(CUDA_ERROR_STREAM_CAPTURE_INVALIDATED),
                Some(c) => Some((c.graph, c.last_node)),
                None => None,
            },
            None if stream.is_null() => None,
            None => return Err(CUDA_ERROR_INVALID_HANDLE),
        };

        let Some((graph, last_node)) = capture else {
            return self.execute(&op);
        };
        let deps: Vec<GraphNodeHandle> = last_node.into_iter().collect();
        let node = self.add_node(graph, &deps, op)?;
        trace!("captured node {} into graph {}", node, graph);
        if let Some(mut state) = self.streams.get_mut(&stream) {
            if let Some(capture) = state.capture.as_mut() {
                capture.last_node = Some(node);
            }
        }
        Ok(())
    }

    fn validate_launch(&self, func: FunctionHandle, dims: &LaunchDims) -> Result<String, CUresult> {
        let function = self.functions.get(&func).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        let block_threads: u64 = dims.block.iter().map(|&d| d as u64).product();
        if block_threads == 0 || block_threads > MAX_THREADS_PER_BLOCK as u64 || dims.grid.contains(&0) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        if dims.shared_mem_bytes as i64 > function.max_dynamic_shared as i64 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        Ok(function.name.clone())
    }

    fn execute(&self, op: &NodeOp) -> Result<(), CUresult> {
        match op {
            NodeOp::Kernel { func, dims, args } => {
                let name = self.validate_launch(*func, dims)?;
                let kernel = self
                    .kernels
                    .read()
                    .get(&name)
                    .cloned()
                    .ok_or(CUDA_ERROR_LAUNCH_FAILED)?;
                bump(&self.counters.kernel_launches);
                let mut memory = self.memory.lock();
                kernel(&mut KernelLaunch::new(*dims, args, &mut memory))
            }
            NodeOp::Memcpy { dst, src, bytes, .. } => self.memory.lock().copy(*dst, *src, *bytes),
            NodeOp::Memset {
                dst,
                value,
                element_size,
                count,
                ..
            } => {
                let pattern = match element_size {
                    1 => vec![*value as u8],
                    2 => (*value as u16).to_ne_bytes().to_vec(),
                    4 => value.to_ne_bytes().to_vec(),
                    _ => return Err(CUDA_ERROR_INVALID_VALUE),
                };
                self.memory.lock().fill(*dst, &pattern, *count)
            }
            NodeOp::Empty => Ok(()),
        }
    }

    /// Drop everything owned by a primary context whose last reference went
    /// away.
    fn reset_context(&self, ctx: ContextHandle) {
        self.memory.lock().release_context(ctx);
        self.streams.retain(|_, s| s.ctx != ctx);
        let modules: Vec<ModuleHandle> = self
            .modules
            .iter()
            .filter(|m| m.ctx == ctx)
            .map(|m| *m.key())
            .collect();
        for module in modules {
            if let Some((_, state)) = self.modules.remove(&module) {
                for func in state.functions.values() {
                    self.functions.remove(func);
                }
            }
        }
        self.peer_access.lock().retain(|(a, b)| *a != ctx && *b != ctx);
        debug!("emulated context {} reset", ctx);
    }

    fn load_module(&self, image: &[u8], log: &mut JitLog, malformed: CUresult) -> Result<ModuleHandle, CUresult> {
        let (ctx, device) = self.require_context()?;
        self.take_fault(FaultPoint::ModuleLoad)?;
        bump(&self.counters.module_loads);

        let text = image.split(|b| *b == 0).next().unwrap_or_default();
        let text = std::str::from_utf8(text).map_err(|_| malformed)?;
        let parsed = parse_ptx(text);

        if parsed.entries.is_empty() {
            log.error = "ptxas fatal   : no kernel entry points found".to_string();
            return Err(malformed);
        }
        if let Some(registers) = parsed.max_registers.filter(|r| *r > MAX_REGISTERS_PER_THREAD) {
            log.error = format!(
                "ptxas error   : Entry function '{}' requests {} registers per thread\n\
                 ptxas error   : Register allocation failed",
                parsed.entries[0], registers
            );
            return Err(CUDA_ERROR_INVALID_PTX);
        }
        {
            let kernels = self.kernels.read();
            if let Some(missing) = parsed.entries.iter().find(|e| !kernels.contains_key(*e)) {
                log.error = format!("ptxas fatal   : no implementation for entry function '{}'", missing);
                return Err(if malformed == CUDA_ERROR_INVALID_PTX {
                    CUDA_ERROR_INVALID_PTX
                } else {
                    CUDA_ERROR_NO_BINARY_FOR_GPU
                });
            }
        }

        let mut globals = HashMap::new();
        {
            let mut memory = self.memory.lock();
            for (name, bytes) in &parsed.globals {
                match memory.allocate(*bytes, RegionKind::Device, ctx, device) {
                    Ok(ptr) => {
                        globals.insert(name.clone(), (ptr, *bytes));
                    }
                    Err(res) => {
                        for (ptr, _) in globals.values() {
                            let _ = memory.free(*ptr);
                        }
                        return Err(res);
                    }
                }
            }
        }

        let module = ModuleHandle::from_raw(self.next_raw());
        let mut functions = HashMap::new();
        for name in &parsed.entries {
            let func = FunctionHandle::from_raw(self.next_raw());
            self.functions.insert(
                func,
                FunctionState {
                    name: name.clone(),
                    max_dynamic_shared: SHARED_MEMORY_PER_BLOCK,
                },
            );
            functions.insert(name.clone(), func);
        }
        log.info = format!(
            "ptxas info    : {} entry function(s) compiled for sm_{}{}",
            parsed.entries.len(),
            COMPUTE_CAPABILITY.0,
            COMPUTE_CAPABILITY.1
        );
        self.modules.insert(module, ModuleState { ctx, functions, globals });
        Ok(module)
    }

    /// # Safety
    /// `ptr` must be readable for `bytes` bytes for the lifetime `'a`.
    unsafe fn host_span<'a>(ptr: *const u8, bytes: u64) -> Result<&'a [u8], CUresult> {
        if bytes == 0 {
            return Ok(&[]);
        }
        if ptr.is_null() {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        Ok(unsafe { std::slice::from_raw_parts(ptr, bytes as usize) })
    }
}

impl Driver for EmulatedDriver {
    fn backend_name(&self) -> &'static str {
        "emulated"
    }

    // ── Initialization and devices ──────────────────────────────────

    fn init(&self, flags: u32) -> CUresult {
        self.tick();
        status!({
            self.take_fault(FaultPoint::Init)?;
            if flags != 0 {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            if self.device_count == 0 {
                return Err(CUDA_ERROR_NO_DEVICE);
            }
            self.initialized.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn driver_get_version(&self) -> Result<i32, CUresult> {
        self.tick();
        Ok(DRIVER_VERSION)
    }

    fn device_get_count(&self) -> Result<i32, CUresult> {
        self.ready()?;
        Ok(self.device_count as i32)
    }

    fn device_get(&self, ordinal: i32) -> Result<Device, CUresult> {
        self.ready()?;
        self.check_device(ordinal)?;
        Ok(ordinal)
    }

    fn device_get_name(&self, device: Device) -> Result<String, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        Ok(format!("gpuexec emulated device {}", device))
    }

    fn device_get_attribute(&self, attrib: i32, device: Device) -> Result<i32, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        let value = match attrib {
            a if a == DeviceAttribute::MaxThreadsPerBlock.as_raw() => MAX_THREADS_PER_BLOCK,
            a if a == DeviceAttribute::MaxGridDimX.as_raw() => GRID_LIMITS[0],
            a if a == DeviceAttribute::MaxGridDimY.as_raw() => GRID_LIMITS[1],
            a if a == DeviceAttribute::MaxGridDimZ.as_raw() => GRID_LIMITS[2],
            a if a == DeviceAttribute::MaxSharedMemoryPerBlock.as_raw() => SHARED_MEMORY_PER_BLOCK,
            a if a == DeviceAttribute::WarpSize.as_raw() => WARP_SIZE,
            a if a == DeviceAttribute::MaxRegistersPerBlock.as_raw() => REGISTERS_PER_BLOCK,
            a if a == DeviceAttribute::MultiprocessorCount.as_raw() => MULTIPROCESSORS,
            a if a == DeviceAttribute::EccEnabled.as_raw() => 0,
            a if a == DeviceAttribute::MaxThreadsPerMultiprocessor.as_raw() => MAX_THREADS_PER_MULTIPROCESSOR,
            a if a == DeviceAttribute::ComputeCapabilityMajor.as_raw() => COMPUTE_CAPABILITY.0,
            a if a == DeviceAttribute::ComputeCapabilityMinor.as_raw() => COMPUTE_CAPABILITY.1,
            a if a == DeviceAttribute::MaxSharedMemoryPerMultiprocessor.as_raw() => {
                SHARED_MEMORY_PER_MULTIPROCESSOR
            }
            a if a == DeviceAttribute::MaxSharedMemoryPerBlockOptin.as_raw() => SHARED_MEMORY_PER_BLOCK_OPTIN,
            _ => return Err(CUDA_ERROR_INVALID_VALUE),
        };
        Ok(value)
    }

    fn device_total_mem(&self, device: Device) -> Result<u64, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        Ok(self.memory.lock().capacity())
    }

    fn device_get_pci_bus_id(&self, device: Device) -> Result<String, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        Ok(format!("0000:{:02X}:00.0", 0xA1 + device))
    }

    fn device_can_access_peer(&self, device: Device, peer: Device) -> Result<bool, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        self.check_device(peer)?;
        Ok(device != peer)
    }

    // ── Primary context ─────────────────────────────────────────────

    fn device_primary_ctx_retain(&self, device: Device) -> Result<ContextHandle, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        self.take_fault(FaultPoint::PrimaryCtxRetain)?;
        let mut primary = self.primary.lock();
        let state = &mut primary[device as usize];
        state.refcount += 1;
        trace!("emulated primary context {} retained ({} refs)", state.handle, state.refcount);
        Ok(state.handle)
    }

    fn device_primary_ctx_release(&self, device: Device) -> CUresult {
        status!({
            self.ready()?;
            self.check_device(device)?;
            self.take_fault(FaultPoint::PrimaryCtxRelease)?;
            let released = {
                let mut primary = self.primary.lock();
                let state = &mut primary[device as usize];
                if state.refcount == 0 {
                    return Err(CUDA_ERROR_INVALID_CONTEXT);
                }
                state.refcount -= 1;
                if state.refcount == 0 {
                    state.shared_mem_config = CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE;
                }
                (state.refcount == 0).then_some(state.handle)
            };
            if let Some(ctx) = released {
                self.reset_context(ctx);
            }
            Ok(())
        })
    }

    fn device_primary_ctx_get_state(&self, device: Device) -> Result<(u32, bool), CUresult> {
        self.ready()?;
        self.check_device(device)?;
        let primary = self.primary.lock();
        let state = &primary[device as usize];
        Ok((state.flags, state.refcount > 0))
    }

    fn device_primary_ctx_set_flags(&self, device: Device, flags: u32) -> CUresult {
        status!({
            self.ready()?;
            self.check_device(device)?;
            self.primary.lock()[device as usize].flags = flags;
            Ok(())
        })
    }

    // ── Current context ─────────────────────────────────────────────

    fn ctx_set_current(&self, ctx: ContextHandle) -> CUresult {
        bump(&self.counters.ctx_set_current);
        status!({
            self.ready()?;
            self.take_fault(FaultPoint::CtxSetCurrent)?;
            if !ctx.is_null() && self.device_of(ctx).is_none() {
                return Err(CUDA_ERROR_INVALID_CONTEXT);
            }
            CURRENT.with(|c| c.borrow_mut().insert(self.instance, ctx));
            Ok(())
        })
    }

    fn ctx_get_current(&self) -> Result<ContextHandle, CUresult> {
        self.ready()?;
        Ok(self.current())
    }

    fn ctx_get_device(&self) -> Result<Device, CUresult> {
        self.ready()?;
        let ctx = self.current();
        if ctx.is_null() {
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        self.device_of(ctx).ok_or(CUDA_ERROR_INVALID_CONTEXT)
    }

    fn ctx_synchronize(&self) -> CUresult {
        bump(&self.counters.ctx_synchronize);
        status!({
            self.ready()?;
            self.require_context()?;
            self.unsafe_call_guard()
        })
    }

    fn ctx_get_stream_priority_range(&self) -> Result<(i32, i32), CUresult> {
        self.ready()?;
        self.require_context()?;
        Ok(STREAM_PRIORITY_RANGE)
    }

    fn ctx_enable_peer_access(&self, peer: ContextHandle, flags: u32) -> CUresult {
        status!({
            self.ready()?;
            let (ctx, device) = self.require_context()?;
            if flags != 0 {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            if !self.is_active(peer) {
                return Err(CUDA_ERROR_INVALID_CONTEXT);
            }
            if self.device_of(peer) == Some(device) {
                return Err(CUDA_ERROR_INVALID_DEVICE);
            }
            if !self.peer_access.lock().insert((ctx, peer)) {
                return Err(CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED);
            }
            Ok(())
        })
    }

    fn ctx_get_shared_mem_config(&self) -> Result<i32, CUresult> {
        self.ready()?;
        let (_, device) = self.require_context()?;
        Ok(self.primary.lock()[device as usize].shared_mem_config)
    }

    fn ctx_set_shared_mem_config(&self, config: i32) -> CUresult {
        status!({
            self.ready()?;
            let (_, device) = self.require_context()?;
            if !(CU_SHARED_MEM_CONFIG_DEFAULT_BANK_SIZE..=CU_SHARED_MEM_CONFIG_EIGHT_BYTE_BANK_SIZE)
                .contains(&config)
            {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            self.primary.lock()[device as usize].shared_mem_config = config;
            Ok(())
        })
    }

    fn mem_get_info(&self) -> Result<(u64, u64), CUresult> {
        self.ready()?;
        let (_, device) = self.require_context()?;
        let memory = self.memory.lock();
        let total = memory.capacity();
        Ok((total - memory.used(device), total))
    }

    // ── Modules and functions ───────────────────────────────────────

    fn module_load_data_ex(&self, image: &[u8], log: &mut JitLog) -> Result<ModuleHandle, CUresult> {
        self.ready()?;
        self.load_module(image, log, CUDA_ERROR_INVALID_PTX)
    }

    fn module_load_fat_binary(&self, image: &[u8]) -> Result<ModuleHandle, CUresult> {
        self.ready()?;
        let mut log = JitLog::default();
        self.load_module(image, &mut log, CUDA_ERROR_INVALID_IMAGE)
    }

    fn module_unload(&self, module: ModuleHandle) -> CUresult {
        status!({
            self.ready()?;
            self.take_fault(FaultPoint::ModuleUnload)?;
            let (_, state) = self.modules.remove(&module).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            for func in state.functions.values() {
                self.functions.remove(func);
            }
            let mut memory = self.memory.lock();
            for (ptr, _) in state.globals.values() {
                let _ = memory.free(*ptr);
            }
            Ok(())
        })
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, CUresult> {
        self.ready()?;
        let state = self.modules.get(&module).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        state.functions.get(name).copied().ok_or(CUDA_ERROR_NOT_FOUND)
    }

    fn module_get_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, u64), CUresult> {
        self.ready()?;
        let state = self.modules.get(&module).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        state.globals.get(name).copied().ok_or(CUDA_ERROR_NOT_FOUND)
    }

    fn func_get_attribute(&self, attrib: i32, func: FunctionHandle) -> Result<i32, CUresult> {
        self.ready()?;
        let function = self.functions.get(&func).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        let version = COMPUTE_CAPABILITY.0 * 10 + COMPUTE_CAPABILITY.1;
        Ok(match attrib {
            0 => MAX_THREADS_PER_BLOCK,
            1..=3 => 0,
            4 => REGISTERS_PER_THREAD,
            5 | 6 => version,
            CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES => function.max_dynamic_shared,
            _ => return Err(CUDA_ERROR_INVALID_VALUE),
        })
    }

    fn func_set_attribute(&self, func: FunctionHandle, attrib: i32, value: i32) -> CUresult {
        status!({
            self.ready()?;
            let mut function = self.functions.get_mut(&func).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            if attrib != CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES
                || !(0..=SHARED_MEMORY_PER_BLOCK_OPTIN).contains(&value)
            {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            function.max_dynamic_shared = value;
            Ok(())
        })
    }

    fn func_set_cache_config(&self, func: FunctionHandle, config: i32) -> CUresult {
        status!({
            self.ready()?;
            if !self.functions.contains_key(&func) {
                return Err(CUDA_ERROR_INVALID_HANDLE);
            }
            // Only a preference; the emulated device has no L1 split.
            if !(0..=3).contains(&config) {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            Ok(())
        })
    }

    fn occupancy_max_active_blocks_per_multiprocessor(
        &self,
        func: FunctionHandle,
        block_size: i32,
        dynamic_smem_bytes: u64,
    ) -> Result<i32, CUresult> {
        self.ready()?;
        if !self.functions.contains_key(&func) {
            return Err(CUDA_ERROR_INVALID_HANDLE);
        }
        if block_size <= 0 || block_size > MAX_THREADS_PER_BLOCK {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let by_threads = MAX_THREADS_PER_MULTIPROCESSOR / block_size;
        let by_registers = REGISTERS_PER_BLOCK / (block_size * REGISTERS_PER_THREAD).max(1);
        let by_shared = match dynamic_smem_bytes {
            0 => MAX_BLOCKS_PER_MULTIPROCESSOR,
            bytes => (SHARED_MEMORY_PER_MULTIPROCESSOR as u64 / bytes) as i32,
        };
        Ok(by_threads
            .min(by_registers)
            .min(by_shared)
            .min(MAX_BLOCKS_PER_MULTIPROCESSOR))
    }

    fn launch_kernel(&self, func: FunctionHandle, dims: &LaunchDims, stream: StreamHandle, args: &[KernelArg]) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.validate_launch(func, dims)?;
            self.submit(
                stream,
                NodeOp::Kernel {
                    func,
                    dims: *dims,
                    args: args.to_vec(),
                },
            )
        })
    }

    // ── Memory ──────────────────────────────────────────────────────

    fn mem_alloc(&self, bytes: u64) -> Result<DevicePtr, CUresult> {
        self.ready()?;
        let (ctx, device) = self.require_context()?;
        self.unsafe_call_guard()?;
        self.take_fault(FaultPoint::MemAlloc)?;
        self.memory.lock().allocate(bytes, RegionKind::Device, ctx, device)
    }

    fn mem_free(&self, ptr: DevicePtr) -> CUresult {
        status!({
            self.ready()?;
            self.unsafe_call_guard()?;
            self.memory.lock().free(ptr)
        })
    }

    fn mem_alloc_managed(&self, bytes: u64, flags: u32) -> Result<DevicePtr, CUresult> {
        self.ready()?;
        let (ctx, device) = self.require_context()?;
        if flags != CU_MEM_ATTACH_GLOBAL && flags != 0x2 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.unsafe_call_guard()?;
        self.take_fault(FaultPoint::MemAlloc)?;
        self.memory.lock().allocate(bytes, RegionKind::Managed, ctx, device)
    }

    fn mem_host_alloc(&self, bytes: u64, _flags: u32) -> Result<HostPtr, CUresult> {
        self.ready()?;
        self.require_context()?;
        self.unsafe_call_guard()?;
        self.memory.lock().host_allocate(bytes)
    }

    fn mem_free_host(&self, ptr: HostPtr) -> CUresult {
        status!({
            self.ready()?;
            self.unsafe_call_guard()?;
            self.memory.lock().host_free(ptr)
        })
    }

    fn mem_host_register(&self, ptr: HostPtr, bytes: u64, _flags: u32) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.memory.lock().host_register(ptr, bytes)
        })
    }

    fn mem_host_unregister(&self, ptr: HostPtr) -> CUresult {
        status!({
            self.ready()?;
            self.memory.lock().host_unregister(ptr)
        })
    }

    fn mem_alloc_async(&self, bytes: u64, stream: StreamHandle) -> Result<DevicePtr, CUresult> {
        self.ready()?;
        let (_, device) = self.require_context()?;
        self.check_stream(stream)?;
        self.reject_in_capture(stream)?;
        self.memory
            .lock()
            .allocate(bytes, RegionKind::Pooled, ContextHandle::null(), device)
    }

    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            self.memory.lock().free(ptr)
        })
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64), CUresult> {
        self.ready()?;
        self.memory.lock().address_range(ptr)
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, count: u64) -> CUresult {
        status!({
            self.ready()?;
            let (ctx, _) = self.require_context()?;
            self.unsafe_call_guard()?;
            self.execute(&NodeOp::Memset {
                ctx,
                dst,
                value: value as u32,
                element_size: 1,
                count,
            })
        })
    }

    fn memset_d32(&self, dst: DevicePtr, value: u32, count: u64) -> CUresult {
        status!({
            self.ready()?;
            let (ctx, _) = self.require_context()?;
            self.unsafe_call_guard()?;
            self.execute(&NodeOp::Memset {
                ctx,
                dst,
                value,
                element_size: 4,
                count,
            })
        })
    }

    fn memset_d8_async(&self, dst: DevicePtr, value: u8, count: u64, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            let (ctx, _) = self.require_context()?;
            self.submit(
                stream,
                NodeOp::Memset {
                    ctx,
                    dst,
                    value: value as u32,
                    element_size: 1,
                    count,
                },
            )
        })
    }

    fn memset_d32_async(&self, dst: DevicePtr, value: u32, count: u64, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            let (ctx, _) = self.require_context()?;
            self.submit(
                stream,
                NodeOp::Memset {
                    ctx,
                    dst,
                    value,
                    element_size: 4,
                    count,
                },
            )
        })
    }

    // ── Copies ──────────────────────────────────────────────────────

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.unsafe_call_guard()?;
            self.memory.lock().write(dst, src)
        })
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.unsafe_call_guard()?;
            let data = self.memory.lock().read(src, dst.len())?;
            dst.copy_from_slice(&data);
            Ok(())
        })
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: u64) -> CUresult {
        bump(&self.counters.memcpy_dtod);
        status!({
            self.ready()?;
            self.require_context()?;
            self.unsafe_call_guard()?;
            self.memory.lock().copy(dst, src, bytes)
        })
    }

    fn memcpy_peer(
        &self,
        dst: DevicePtr,
        dst_ctx: ContextHandle,
        src: DevicePtr,
        src_ctx: ContextHandle,
        bytes: u64,
    ) -> CUresult {
        bump(&self.counters.memcpy_peer);
        status!({
            self.ready()?;
            if !self.is_active(dst_ctx) || !self.is_active(src_ctx) {
                return Err(CUDA_ERROR_INVALID_CONTEXT);
            }
            self.unsafe_call_guard()?;
            self.memory.lock().copy(dst, src, bytes)
        })
    }

    unsafe fn memcpy_htod_async(&self, dst: DevicePtr, src: *const u8, bytes: u64, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            // SAFETY: the caller guarantees `bytes` readable bytes at `src`;
            // the copy completes before this call returns.
            let data = unsafe { Self::host_span(src, bytes)? };
            self.memory.lock().write(dst, data)
        })
    }

    unsafe fn memcpy_dtoh_async(&self, dst: *mut u8, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.require_context()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            if bytes == 0 {
                return Ok(());
            }
            if dst.is_null() {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            let data = self.memory.lock().read(src, bytes as usize)?;
            // SAFETY: the caller guarantees `bytes` writable bytes at `dst`.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
            Ok(())
        })
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, bytes: u64, stream: StreamHandle) -> CUresult {
        bump(&self.counters.memcpy_dtod);
        status!({
            self.ready()?;
            let (ctx, _) = self.require_context()?;
            self.submit(stream, NodeOp::Memcpy { ctx, dst, src, bytes })
        })
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
        bump(&self.counters.memcpy_peer);
        status!({
            self.ready()?;
            if !self.is_active(dst_ctx) || !self.is_active(src_ctx) {
                return Err(CUDA_ERROR_INVALID_CONTEXT);
            }
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            self.memory.lock().copy(dst, src, bytes)
        })
    }

    // ── Pointer attributes ──────────────────────────────────────────

    fn pointer_get_context(&self, ptr: DevicePtr) -> Result<ContextHandle, CUresult> {
        self.ready()?;
        self.memory.lock().pointer_context(ptr)
    }

    fn pointer_get_memory_type(&self, ptr: DevicePtr) -> Result<i32, CUresult> {
        self.ready()?;
        self.memory.lock().pointer_memory_type(ptr)
    }

    fn pointer_get_device_ordinal(&self, ptr: DevicePtr) -> Result<i32, CUresult> {
        self.ready()?;
        self.memory.lock().pointer_device(ptr)
    }

    // ── Virtual memory management ───────────────────────────────────

    fn mem_address_reserve(&self, bytes: u64, alignment: u64) -> Result<DevicePtr, CUresult> {
        self.ready()?;
        self.memory.lock().reserve(bytes, alignment)
    }

    fn mem_address_free(&self, ptr: DevicePtr, bytes: u64) -> CUresult {
        status!({
            self.ready()?;
            self.memory.lock().free_reservation(ptr, bytes)
        })
    }

    fn mem_get_allocation_granularity(&self, device: Device) -> Result<u64, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        Ok(EMULATED_GRANULARITY)
    }

    fn mem_create(&self, bytes: u64, device: Device) -> Result<MemHandle, CUresult> {
        self.ready()?;
        self.check_device(device)?;
        self.take_fault(FaultPoint::MemAlloc)?;
        self.memory.lock().create_physical(bytes, device)
    }

    fn mem_release(&self, handle: MemHandle) -> CUresult {
        status!({
            self.ready()?;
            self.memory.lock().release_physical(handle)
        })
    }

    fn mem_map(&self, ptr: DevicePtr, bytes: u64, handle: MemHandle) -> CUresult {
        status!({
            self.ready()?;
            self.memory.lock().map(ptr, bytes, handle)
        })
    }

    fn mem_set_access(&self, ptr: DevicePtr, bytes: u64, devices: &[Device]) -> CUresult {
        status!({
            self.ready()?;
            for &device in devices {
                self.check_device(device)?;
            }
            self.take_fault(FaultPoint::MemSetAccess)?;
            self.memory.lock().set_access(ptr, bytes)
        })
    }

    fn mem_unmap(&self, ptr: DevicePtr, bytes: u64) -> CUresult {
        bump(&self.counters.mem_unmap);
        status!({
            self.ready()?;
            self.memory.lock().unmap(ptr, bytes)
        })
    }

    // ── Streams ─────────────────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<StreamHandle, CUresult> {
        self.stream_create_with_priority(flags, STREAM_PRIORITY_RANGE.0)
    }

    fn stream_create_with_priority(&self, _flags: u32, priority: i32) -> Result<StreamHandle, CUresult> {
        self.ready()?;
        let (ctx, _) = self.require_context()?;
        let (least, greatest) = STREAM_PRIORITY_RANGE;
        let stream = StreamHandle::from_raw(self.next_raw());
        self.streams.insert(stream, StreamState { ctx, capture: None });
        trace!("emulated stream {} created with priority {}", stream, priority.clamp(greatest, least));
        Ok(stream)
    }

    fn stream_destroy(&self, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.take_fault(FaultPoint::StreamDestroy)?;
            let (_, state) = self.streams.remove(&stream).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            if let Some(capture) = state.capture {
                self.graphs.remove(&capture.graph);
            }
            Ok(())
        })
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)
        })
    }

    fn stream_query(&self, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)
        })
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle, _flags: u32) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            if !self.events.contains_key(&event) {
                return Err(CUDA_ERROR_INVALID_HANDLE);
            }
            self.reject_in_capture(stream)
        })
    }

    fn launch_host_func(&self, stream: StreamHandle, callback: HostCallback) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            callback();
            Ok(())
        })
    }

    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> CUresult {
        status!({
            self.ready()?;
            if stream.is_null() {
                return Err(CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED);
            }
            let mut state = self.streams.get_mut(&stream).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            if state.capture.is_some() {
                return Err(CUDA_ERROR_ILLEGAL_STATE);
            }
            let graph = GraphHandle::from_raw(self.next_raw());
            self.graphs.insert(graph, GraphState::default());
            state.capture = Some(Capture {
                mode,
                thread: std::thread::current().id(),
                graph,
                last_node: None,
                invalidated: false,
            });
            debug!("stream {} capturing into graph {} ({})", stream, graph, mode.as_str());
            Ok(())
        })
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> Result<GraphHandle, CUresult> {
        self.ready()?;
        let capture = {
            let mut state = self.streams.get_mut(&stream).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            match &state.capture {
                None => return Err(CUDA_ERROR_ILLEGAL_STATE),
                Some(c) if c.mode != CaptureMode::Relaxed && c.thread != std::thread::current().id() => {
                    return Err(CUDA_ERROR_STREAM_CAPTURE_WRONG_THREAD);
                }
                Some(_) => {}
            }
            state.capture.take().ok_or(CUDA_ERROR_ILLEGAL_STATE)?
        };
        if capture.invalidated {
            self.graphs.remove(&capture.graph);
            return Err(CUDA_ERROR_STREAM_CAPTURE_INVALIDATED);
        }
        Ok(capture.graph)
    }

    fn stream_is_capturing(&self, stream: StreamHandle) -> Result<bool, CUresult> {
        self.ready()?;
        if stream.is_null() {
            return Ok(false);
        }
        let state = self.streams.get(&stream).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        Ok(state.capture.is_some())
    }

    // ── Events ──────────────────────────────────────────────────────

    fn event_create(&self, flags: u32) -> Result<EventHandle, CUresult> {
        self.ready()?;
        self.require_context()?;
        self.take_fault(FaultPoint::EventCreate)?;
        let event = EventHandle::from_raw(self.next_raw());
        self.events.insert(
            event,
            EventState {
                timing: flags & CU_EVENT_DISABLE_TIMING == 0,
                recorded_at: None,
            },
        );
        Ok(event)
    }

    fn event_destroy(&self, event: EventHandle) -> CUresult {
        bump(&self.counters.event_destroy);
        status!({
            self.ready()?;
            self.events.remove(&event).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            Ok(())
        })
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            if !self.events.contains_key(&event) {
                return Err(CUDA_ERROR_INVALID_HANDLE);
            }
            self.check_stream(stream)?;
            self.reject_in_capture(stream)?;
            if let Some(mut state) = self.events.get_mut(&event) {
                state.recorded_at = Some(Instant::now());
            }
            Ok(())
        })
    }

    fn event_synchronize(&self, event: EventHandle) -> CUresult {
        status!({
            self.ready()?;
            if self.events.contains_key(&event) {
                Ok(())
            } else {
                Err(CUDA_ERROR_INVALID_HANDLE)
            }
        })
    }

    fn event_query(&self, event: EventHandle) -> CUresult {
        self.event_synchronize(event)
    }

    fn event_elapsed_time(&self, start: EventHandle, stop: EventHandle) -> Result<f32, CUresult> {
        self.ready()?;
        let stamp = |event: EventHandle| -> Result<Instant, CUresult> {
            let state = self.events.get(&event).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            if !state.timing {
                return Err(CUDA_ERROR_INVALID_HANDLE);
            }
            state.recorded_at.ok_or(CUDA_ERROR_INVALID_HANDLE)
        };
        let (start, stop) = (stamp(start)?, stamp(stop)?);
        let ms = if stop >= start {
            stop.duration_since(start).as_secs_f32() * 1000.0
        } else {
            -(start.duration_since(stop).as_secs_f32() * 1000.0)
        };
        Ok(ms)
    }

    // ── Graphs ──────────────────────────────────────────────────────

    fn graph_create(&self, flags: u32) -> Result<GraphHandle, CUresult> {
        self.ready()?;
        if flags != 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let graph = GraphHandle::from_raw(self.next_raw());
        self.graphs.insert(graph, GraphState::default());
        Ok(graph)
    }

    fn graph_destroy(&self, graph: GraphHandle) -> CUresult {
        status!({
            self.ready()?;
            let (_, state) = self.graphs.remove(&graph).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            for node in &state.nodes {
                self.node_owner.remove(&node.handle);
            }
            Ok(())
        })
    }

    fn graph_add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        func: FunctionHandle,
        dims: &LaunchDims,
        args: &[KernelArg],
    ) -> Result<GraphNodeHandle, CUresult> {
        self.ready()?;
        self.validate_launch(func, dims)?;
        self.add_node(
            graph,
            deps,
            NodeOp::Kernel {
                func,
                dims: *dims,
                args: args.to_vec(),
            },
        )
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
        self.ready()?;
        if !self.is_active(ctx) {
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        self.add_node(graph, deps, NodeOp::Memcpy { ctx, dst, src, bytes })
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
        self.ready()?;
        if !self.is_active(ctx) {
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        if !matches!(element_size, 1 | 2 | 4) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.add_node(
            graph,
            deps,
            NodeOp::Memset {
                ctx,
                dst,
                value,
                element_size,
                count,
            },
        )
    }

    fn graph_add_empty_node(&self, graph: GraphHandle, deps: &[GraphNodeHandle]) -> Result<GraphNodeHandle, CUresult> {
        self.ready()?;
        self.add_node(graph, deps, NodeOp::Empty)
    }

    fn graph_node_get_type(&self, node: GraphNodeHandle) -> Result<i32, CUresult> {
        self.ready()?;
        let graph = *self.node_owner.get(&node).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        let state = self.graphs.get(&graph).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        let index = state.index_of(node).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        Ok(state.nodes[index].op.node_type().as_raw())
    }

    fn graph_instantiate(&self, graph: GraphHandle, flags: u64) -> Result<GraphExecHandle, CUresult> {
        self.ready()?;
        if flags & !0xF != 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let nodes = self
            .graphs
            .get(&graph)
            .ok_or(CUDA_ERROR_INVALID_HANDLE)?
            .nodes
            .clone();
        let exec = GraphExecHandle::from_raw(self.next_raw());
        self.execs.insert(exec, ExecState { nodes });
        Ok(exec)
    }

    fn graph_launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> CUresult {
        status!({
            self.ready()?;
            self.check_stream(stream)?;
            let nodes = self
                .execs
                .get(&exec)
                .ok_or(CUDA_ERROR_INVALID_HANDLE)?
                .nodes
                .clone();
            self.reject_in_capture(stream)?;
            for node in &nodes {
                self.execute(&node.op)?;
            }
            Ok(())
        })
    }

    fn graph_exec_update(&self, exec: GraphExecHandle, graph: GraphHandle) -> (CUresult, i32) {
        if let Err(res) = self.ready() {
            return (res, GraphExecUpdateResult::Error.as_raw());
        }
        let Some(source) = self.graphs.get(&graph).map(|g| g.value().clone()) else {
            return (CUDA_ERROR_INVALID_HANDLE, GraphExecUpdateResult::Error.as_raw());
        };
        let Some(mut state) = self.execs.get_mut(&exec) else {
            return (CUDA_ERROR_INVALID_HANDLE, GraphExecUpdateResult::Error.as_raw());
        };
        match classify_update(&state, &source) {
            GraphExecUpdateResult::Success => {
                state.nodes = source.nodes;
                (CUDA_SUCCESS, GraphExecUpdateResult::Success.as_raw())
            }
            category => (CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE, category.as_raw()),
        }
    }

    fn graph_exec_destroy(&self, exec: GraphExecHandle) -> CUresult {
        status!({
            self.ready()?;
            self.execs.remove(&exec).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
            Ok(())
        })
    }

    fn graph_debug_dot_print(&self, graph: GraphHandle, path: &str, _flags: u32) -> CUresult {
        status!({
            self.ready()?;
            let dot = self
                .graphs
                .get(&graph)
                .ok_or(CUDA_ERROR_INVALID_HANDLE)?
                .to_dot(&graph.to_string());
            std::fs::write(path, dot).map_err(|e| {
                debug!("failed to write graph dot file {}: {}", path, e);
                CUDA_ERROR_INVALID_VALUE
            })
        })
    }
}
