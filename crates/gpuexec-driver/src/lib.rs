pub mod activation;
pub mod context;
pub mod copy;
pub mod cuda_driver;
pub mod diagnostics;
pub mod driver;
pub mod emulated;
pub mod event;
pub mod gpu_driver;
pub mod graph;
pub mod launch;
pub mod memory;
pub mod module;
pub mod result;
pub mod stream;
pub mod vmem;
mod worker;

pub use activation::{activation_depth, current_context_id, ScopedActivateContext};
pub use context::{Context, ContextRegistry};
pub use cuda_driver::CudaDriver;
pub use driver::{
    CaptureMode, Device, DeviceAttribute, Driver, EventFlags, GraphExecUpdateResult,
    GraphInstantiateFlags, GraphNodeType, KernelArg, LaunchDims, MemorySpace,
};
pub use emulated::{CallCounts, EmulatedDriver, FaultPoint};
pub use event::EventStatus;
pub use gpu_driver::{ContextOptions, GpuDriver, SchedulePolicy, SharedMemConfig};
pub use graph::MemsetPattern;
pub use module::{FuncCachePreference, FunctionAttribute};
pub use stream::StreamPriority;
