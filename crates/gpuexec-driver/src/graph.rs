//! Execution graph construction, instantiation and launch.
//!
//! A graph is built node by node with explicit dependencies, instantiated
//! into an executable graph, and that executable graph can be launched any
//! number of times. Cycle and dependency validation is left to the driver.

use tracing::{debug, error, trace};

use gpuexec_core::handle::{
    DevicePtr, FunctionHandle, GraphExecHandle, GraphHandle, GraphNodeHandle, StreamHandle,
};
use gpuexec_core::{DriverError, Result};

use crate::context::Context;
use crate::driver::{
    GraphExecUpdateResult, GraphInstantiateFlags, GraphNodeType, KernelArg, LaunchDims,
    CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES, CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE,
};
use crate::gpu_driver::GpuDriver;
use crate::result::{
    self, check, status_from_result, CuResultExt, CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE,
    CUDA_SUCCESS,
};

/// Value written by a memset node. The variant fixes the element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemsetPattern {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl MemsetPattern {
    pub fn element_size(self) -> u32 {
        match self {
            MemsetPattern::U8(_) => 1,
            MemsetPattern::U16(_) => 2,
            MemsetPattern::U32(_) => 4,
        }
    }

    pub fn value(self) -> u32 {
        match self {
            MemsetPattern::U8(v) => v as u32,
            MemsetPattern::U16(v) => v as u32,
            MemsetPattern::U32(v) => v,
        }
    }
}

impl GpuDriver {
    pub fn create_graph(&self) -> Result<GraphHandle> {
        let graph = self
            .driver()
            .graph_create(0)
            .or_status("failed to create graph")?;
        debug!("created graph {}", graph);
        Ok(graph)
    }

    pub fn destroy_graph(&self, graph: GraphHandle) -> Result<()> {
        debug!("destroying graph {}", graph);
        check(self.driver().graph_destroy(graph), "failed to destroy graph")
    }

    pub fn graph_instantiate(&self, graph: GraphHandle, flags: GraphInstantiateFlags) -> Result<GraphExecHandle> {
        debug!(
            "instantiating graph {} (auto_free_on_launch={}, device_launch={}, use_node_priority={}, upload={})",
            graph, flags.auto_free_on_launch, flags.device_launch, flags.use_node_priority, flags.upload
        );
        self.driver()
            .graph_instantiate(graph, flags.to_bits())
            .or_status("failed to instantiate graph")
    }

    pub fn graph_launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> Result<()> {
        trace!("launching executable graph {} on stream {}", exec, stream);
        check(
            self.driver().graph_launch(exec, stream),
            "failed to launch graph",
        )
    }

    /// Update `exec` in place to match `graph`.
    ///
    /// An incompatible update is not an error: the returned category tells
    /// the caller what changed so it can re-instantiate instead.
    pub fn graph_exec_update(&self, exec: GraphExecHandle, graph: GraphHandle) -> Result<GraphExecUpdateResult> {
        let (res, raw) = self.driver().graph_exec_update(exec, graph);
        let category = GraphExecUpdateResult::from_raw(raw);
        match res {
            CUDA_SUCCESS => Ok(GraphExecUpdateResult::Success),
            CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE => {
                debug!("executable graph {} cannot be updated: {:?}", exec, category);
                Ok(category)
            }
            res => Err(status_from_result(res, "failed to update graph")),
        }
    }

    pub fn destroy_graph_exec(&self, exec: GraphExecHandle) -> Result<()> {
        debug!("destroying executable graph {}", exec);
        check(
            self.driver().graph_exec_destroy(exec),
            "failed to destroy executable graph",
        )
    }

    /// Write a Graphviz rendering of `graph` to `path`; optionally return it.
    pub fn graph_debug_dot_print(&self, graph: GraphHandle, path: &str, return_printed_graph: bool) -> Result<String> {
        debug!("printing graph {} to {}", graph, path);
        check(
            self.driver()
                .graph_debug_dot_print(graph, path, CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE),
            "failed to print graph debug file",
        )?;

        if !return_printed_graph {
            return Ok(String::new());
        }
        std::fs::read_to_string(path).map_err(|e| {
            error!("failed to read graph debug file {}: {}", path, e);
            DriverError::Internal(format!("failed to read graph debug file {}: {}", path, e))
        })
    }

    pub fn graph_node_get_type(&self, node: GraphNodeHandle) -> Result<GraphNodeType> {
        let raw = self
            .driver()
            .graph_node_get_type(node)
            .or_status("failed to get graph node type")?;
        GraphNodeType::from_raw(raw)
            .ok_or_else(|| DriverError::Internal(format!("invalid graph node type: {}", raw)))
    }

    pub fn graph_add_empty_node(&self, graph: GraphHandle, deps: &[GraphNodeHandle]) -> Result<GraphNodeHandle> {
        self.driver()
            .graph_add_empty_node(graph, deps)
            .or_status("failed to add empty node to graph")
    }

    pub fn graph_add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        kernel_name: &str,
        function: FunctionHandle,
        dims: &LaunchDims,
        args: &[KernelArg],
    ) -> Result<GraphNodeHandle> {
        let driver = self.driver();
        trace!(
            "adding kernel node {} to graph {}; grid: {:?}; block: {:?}; shared memory: {}",
            kernel_name,
            graph,
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

        driver
            .graph_add_kernel_node(graph, deps, function, dims, args)
            .or_status(format!("failed to add kernel node {} to graph", kernel_name))
    }

    pub fn graph_add_memcpy_d2d_node(
        &self,
        context: &Context,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        gpu_dst: DevicePtr,
        gpu_src: DevicePtr,
        bytes: u64,
    ) -> Result<GraphNodeHandle> {
        trace!(
            "adding memcpy d2d node to graph {}; dst: {}; src: {}; size: {}",
            graph, gpu_dst, gpu_src, bytes
        );
        self.driver()
            .graph_add_memcpy_node(graph, deps, context.handle(), gpu_dst, gpu_src, bytes)
            .or_status("failed to add memcpy d2d node to graph")
    }

    pub fn graph_add_memset_node(
        &self,
        context: &Context,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        dst: DevicePtr,
        pattern: MemsetPattern,
        num_elements: u64,
    ) -> Result<GraphNodeHandle> {
        trace!(
            "adding memset node to graph {}; dst: {}; pattern: {:?}; elements: {}",
            graph, dst, pattern, num_elements
        );
        self.driver()
            .graph_add_memset_node(
                graph,
                deps,
                context.handle(),
                dst,
                pattern.value(),
                pattern.element_size(),
                num_elements,
            )
            .map_err(|res| {
                error!("failed to add memset node to graph: {}", result::to_string(res));
                status_from_result(res, "failed to add memset node to graph")
            })
    }
}
