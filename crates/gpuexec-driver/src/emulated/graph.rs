//! Graph bookkeeping for the emulated backend.
//!
//! Nodes are kept in insertion order. A dependency must already exist when a
//! node is added, so insertion order is always a valid execution order.

use std::fmt::Write as _;

use gpuexec_core::handle::{ContextHandle, DevicePtr, FunctionHandle, GraphNodeHandle};

use crate::driver::{GraphExecUpdateResult, GraphNodeType, KernelArg, LaunchDims};

/// Work performed by one node, or by one immediate stream operation.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum NodeOp {
    Kernel {
        func: FunctionHandle,
        dims: LaunchDims,
        args: Vec<KernelArg>,
    },
    Memcpy {
        ctx: ContextHandle,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: u64,
    },
    Memset {
        ctx: ContextHandle,
        dst: DevicePtr,
        value: u32,
        element_size: u32,
        count: u64,
    },
    Empty,
}

impl NodeOp {
    pub(super) fn node_type(&self) -> GraphNodeType {
        match self {
            NodeOp::Kernel { .. } => GraphNodeType::Kernel,
            NodeOp::Memcpy { .. } => GraphNodeType::Memcpy,
            NodeOp::Memset { .. } => GraphNodeType::Memset,
            NodeOp::Empty => GraphNodeType::Empty,
        }
    }

    fn label(&self) -> String {
        match self {
            NodeOp::Kernel { func, dims, .. } => format!(
                "kernel {} grid={:?} block={:?} smem={}",
                func, dims.grid, dims.block, dims.shared_mem_bytes
            ),
            NodeOp::Memcpy { dst, src, bytes, .. } => {
                format!("memcpy {} -> {} ({} bytes)", src, dst, bytes)
            }
            NodeOp::Memset {
                dst,
                value,
                element_size,
                count,
                ..
            } => format!("memset {} = {:#x} x{} ({}B)", dst, value, count, element_size),
            NodeOp::Empty => "empty".to_string(),
        }
    }
}

/// A node as stored in a graph: its work and the indices it depends on.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct GraphNode {
    pub handle: GraphNodeHandle,
    pub deps: Vec<usize>,
    pub op: NodeOp,
}

#[derive(Debug, Default, Clone)]
pub(super) struct GraphState {
    pub nodes: Vec<GraphNode>,
}

impl GraphState {
    pub(super) fn index_of(&self, node: GraphNodeHandle) -> Option<usize> {
        self.nodes.iter().position(|n| n.handle == node)
    }

    /// Resolve `deps` to indices; `None` if any is not a node of this graph.
    pub(super) fn dependency_indices(&self, deps: &[GraphNodeHandle]) -> Option<Vec<usize>> {
        deps.iter().map(|d| self.index_of(*d)).collect()
    }

    pub(super) fn to_dot(&self, name: &str) -> String {
        let mut dot = format!("digraph \"{}\" {{\n", name);
        for (i, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(dot, "  n{} [label=\"{}\"];", i, node.op.label());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                let _ = writeln!(dot, "  n{} -> n{};", dep, i);
            }
        }
        dot.push_str("}\n");
        dot
    }
}

/// Snapshot taken at instantiation.
#[derive(Debug, Clone)]
pub(super) struct ExecState {
    pub nodes: Vec<GraphNode>,
}

/// Compare an executable graph against a modified source graph.
///
/// Returns the first incompatibility found, or `Success` when the executable
/// can take the new parameters in place.
pub(super) fn classify_update(exec: &ExecState, graph: &GraphState) -> GraphExecUpdateResult {
    if exec.nodes.len() != graph.nodes.len() {
        return GraphExecUpdateResult::TopologyChanged;
    }
    for (old, new) in exec.nodes.iter().zip(&graph.nodes) {
        if old.deps != new.deps {
            return GraphExecUpdateResult::TopologyChanged;
        }
    }
    for (old, new) in exec.nodes.iter().zip(&graph.nodes) {
        if old.op.node_type() != new.op.node_type() {
            return GraphExecUpdateResult::NodeTypeChanged;
        }
        match (&old.op, &new.op) {
            (NodeOp::Kernel { func: a, .. }, NodeOp::Kernel { func: b, .. }) if a != b => {
                return GraphExecUpdateResult::FunctionChanged;
            }
            (NodeOp::Memcpy { ctx: a, .. }, NodeOp::Memcpy { ctx: b, .. })
            | (NodeOp::Memset { ctx: a, .. }, NodeOp::Memset { ctx: b, .. })
                if a != b =>
            {
                return GraphExecUpdateResult::ParametersChanged;
            }
            _ => {}
        }
    }
    GraphExecUpdateResult::Success
}
