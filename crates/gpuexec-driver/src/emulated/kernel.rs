//! Host-side kernels and the PTX subset the emulated JIT understands.
//!
//! A module "compiles" when every `.entry` it declares has a host kernel
//! registered under the same name. `.global` declarations become device
//! allocations owned by the module.

use std::sync::Arc;

use gpuexec_core::handle::DevicePtr;

use crate::driver::{KernelArg, LaunchDims};
use crate::result::{CUresult, CUDA_ERROR_INVALID_VALUE};

use super::memory::MemoryState;

/// Host implementation of a kernel entry point.
pub type HostKernel = Arc<dyn Fn(&mut KernelLaunch<'_>) -> Result<(), CUresult> + Send + Sync>;

/// Registers per thread above which the JIT refuses to allocate.
pub(super) const MAX_REGISTERS_PER_THREAD: u32 = 255;

/// One kernel invocation: geometry, arguments and access to device memory.
pub struct KernelLaunch<'a> {
    dims: LaunchDims,
    args: &'a [KernelArg],
    memory: &'a mut MemoryState,
}

impl<'a> KernelLaunch<'a> {
    pub(super) fn new(dims: LaunchDims, args: &'a [KernelArg], memory: &'a mut MemoryState) -> Self {
        Self { dims, args, memory }
    }

    pub fn dims(&self) -> &LaunchDims {
        &self.dims
    }

    pub fn args(&self) -> &[KernelArg] {
        self.args
    }

    /// Total threads in the launch.
    pub fn threads(&self) -> u64 {
        self.dims.total_threads()
    }

    pub fn ptr_arg(&self, index: usize) -> Result<DevicePtr, CUresult> {
        self.args
            .get(index)
            .and_then(|a| a.as_ptr())
            .ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    pub fn u64_arg(&self, index: usize) -> Result<u64, CUresult> {
        self.args
            .get(index)
            .and_then(|a| a.as_u64())
            .ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    pub fn f32_arg(&self, index: usize) -> Result<f32, CUresult> {
        self.args
            .get(index)
            .and_then(|a| a.as_f32())
            .ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>, CUresult> {
        self.memory.read(ptr, len)
    }

    pub fn write_bytes(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<(), CUresult> {
        self.memory.write(ptr, bytes)
    }

    pub fn read_u32s(&self, ptr: DevicePtr, count: usize) -> Result<Vec<u32>, CUresult> {
        let bytes = self.memory.read(ptr, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_u32s(&mut self, ptr: DevicePtr, values: &[u32]) -> Result<(), CUresult> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.memory.write(ptr, &bytes)
    }

    pub fn read_f32s(&self, ptr: DevicePtr, count: usize) -> Result<Vec<f32>, CUresult> {
        let bytes = self.memory.read(ptr, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_f32s(&mut self, ptr: DevicePtr, values: &[f32]) -> Result<(), CUresult> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.memory.write(ptr, &bytes)
    }
}

/// `c[i] = a[i] + b[i]` for `i < n`; arguments `(a, b, c, n)`.
pub const VECTOR_ADD_PTX: &str = r#"
.version 7.0
.target sm_80
.address_size 64

.visible .entry vector_add(
    .param .u64 a,
    .param .u64 b,
    .param .u64 c,
    .param .u32 n
)
{
    ret;
}
"#;

/// `out[i] = value` for `i < n`; arguments `(out, value, n)`.
pub const FILL_U32_PTX: &str = r#"
.version 7.0
.target sm_80
.address_size 64

.visible .entry fill_u32(
    .param .u64 out,
    .param .u32 value,
    .param .u32 n
)
{
    ret;
}
"#;

/// Kernels every emulated driver starts with.
pub(super) fn builtin_kernels() -> Vec<(&'static str, HostKernel)> {
    let vector_add: HostKernel = Arc::new(|launch: &mut KernelLaunch<'_>| {
        let (a, b, c) = (launch.ptr_arg(0)?, launch.ptr_arg(1)?, launch.ptr_arg(2)?);
        let n = (launch.u64_arg(3)?).min(launch.threads()) as usize;
        let lhs = launch.read_f32s(a, n)?;
        let rhs = launch.read_f32s(b, n)?;
        let sum: Vec<f32> = lhs.iter().zip(&rhs).map(|(x, y)| x + y).collect();
        launch.write_f32s(c, &sum)
    });

    let fill_u32: HostKernel = Arc::new(|launch: &mut KernelLaunch<'_>| {
        let out = launch.ptr_arg(0)?;
        let value = launch.u64_arg(1)? as u32;
        let n = (launch.u64_arg(2)?).min(launch.threads()) as usize;
        launch.write_u32s(out, &vec![value; n])
    });

    vec![("vector_add", vector_add), ("fill_u32", fill_u32)]
}

/// Declarations pulled out of a PTX module.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct PtxModule {
    pub entries: Vec<String>,
    /// `(name, bytes)` of each module-scope `.global` variable.
    pub globals: Vec<(String, u64)>,
    pub max_registers: Option<u32>,
}

fn scalar_size(ty: &str) -> Option<u64> {
    match ty {
        ".b8" | ".u8" | ".s8" => Some(1),
        ".b16" | ".u16" | ".s16" | ".f16" => Some(2),
        ".b32" | ".u32" | ".s32" | ".f32" => Some(4),
        ".b64" | ".u64" | ".s64" | ".f64" => Some(8),
        _ => None,
    }
}

fn parse_global(line: &str) -> Option<(String, u64)> {
    let declaration = line.trim().trim_end_matches(';');
    let mut tokens = declaration.split_whitespace();
    let mut element = None;
    let mut name = None;
    while let Some(token) = tokens.next() {
        if token == ".align" {
            tokens.next();
        } else if let Some(size) = scalar_size(token) {
            element = Some(size);
        } else if !token.starts_with('.') {
            name = Some(token);
        }
    }
    let (element, name) = (element?, name?);

    match name.split_once('[') {
        Some((base, rest)) => {
            let count: u64 = rest.trim_end_matches(']').parse().ok()?;
            Some((base.to_string(), element * count))
        }
        None => Some((name.to_string(), element)),
    }
}

/// Scan `text` for entries, globals and register limits.
pub(super) fn parse_ptx(text: &str) -> PtxModule {
    let mut module = PtxModule::default();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("//") {
            continue;
        }
        if let Some(pos) = line.find(".entry") {
            let rest = &line[pos + ".entry".len()..];
            let name: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect();
            if !name.is_empty() {
                module.entries.push(name);
            }
        } else if line.starts_with(".global") || line.starts_with(".visible .global") {
            if let Some(global) = parse_global(line.trim_start_matches(".visible")) {
                module.globals.push(global);
            }
        } else if let Some(rest) = line.strip_prefix(".maxnreg") {
            if let Ok(registers) = rest.trim().trim_end_matches(';').parse::<u32>() {
                module.max_registers = Some(module.max_registers.unwrap_or(0).max(registers));
            }
        }
    }
    module
}

