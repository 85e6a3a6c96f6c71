use serde::Serialize;

use gpuexec_core::handle::DevicePtr;
use gpuexec_core::Result;
use gpuexec_driver::{
    Context, ContextOptions, GpuDriver, GraphInstantiateFlags, MemsetPattern,
};

const ROUND_TRIP_BYTES: usize = 4096;
const GRAPH_ELEMENTS: u64 = 256;
const GRAPH_PATTERN: u32 = 0x5eed_cafe;

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
}

impl CheckResult {
    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn skip(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    fn new(name: &str, status: CheckStatus, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.to_string(),
        }
    }

    fn from_outcome(name: &str, outcome: Result<String>) -> Self {
        match outcome {
            Ok(message) => Self::pass(name, &message),
            Err(e) => Self::fail(name, &e.to_string()),
        }
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

/// Run every check and print the results. Returns whether all checks passed.
pub fn run_selftest(gpu: &GpuDriver, json: bool) -> bool {
    let mut results = Vec::new();

    match gpu.init() {
        Ok(()) => results.push(CheckResult::pass(
            "Driver initialization",
            &format!("{} backend ready", gpu.backend_name()),
        )),
        Err(e) => results.push(CheckResult::fail("Driver initialization", &e.to_string())),
    }

    let count = gpu.device_count();
    if count == 0 {
        results.push(CheckResult::skip("Devices", "no devices visible"));
    }

    for ordinal in 0..count {
        let context = match gpu.create_context(ordinal, ContextOptions::default()) {
            Ok(context) => context,
            Err(e) => {
                results.push(CheckResult::fail(&format!("GPU {} context", ordinal), &e.to_string()));
                continue;
            }
        };

        results.push(CheckResult::from_outcome(
            &format!("GPU {} copy round trip", ordinal),
            check_round_trip(gpu, &context),
        ));
        results.push(CheckResult::from_outcome(
            &format!("GPU {} graph launch", ordinal),
            check_graph_launch(gpu, &context),
        ));

        if let Err(e) = gpu.destroy_context(&context) {
            results.push(CheckResult::fail(&format!("GPU {} teardown", ordinal), &e.to_string()));
        }
    }

    if json {
        print_results_json(&results);
    } else {
        print_results_pretty(&results);
    }
    !results.iter().any(|r| matches!(r.status, CheckStatus::Fail))
}

// ── Checks ──────────────────────────────────────────────────────────────────

fn check_round_trip(gpu: &GpuDriver, context: &Context) -> Result<String> {
    let data: Vec<u8> = (0..ROUND_TRIP_BYTES).map(|i| (i % 251) as u8).collect();
    let ptr = gpu.device_allocate(context, data.len() as u64)?;

    let outcome = (|| -> Result<bool> {
        gpu.synchronous_memcpy_h2d(context, ptr, &data)?;
        let mut back = vec![0u8; data.len()];
        gpu.synchronous_memcpy_d2h(context, &mut back, ptr)?;
        Ok(back == data)
    })();
    gpu.device_deallocate(context, ptr)?;

    if outcome? {
        Ok(format!("{} bytes copied to the device and back", ROUND_TRIP_BYTES))
    } else {
        Err(gpuexec_core::DriverError::Internal(
            "data read back from the device does not match".to_string(),
        ))
    }
}

/// Memset one buffer, copy it into another, all from a graph.
fn check_graph_launch(gpu: &GpuDriver, context: &Context) -> Result<String> {
    let bytes = GRAPH_ELEMENTS * 4;
    let src = gpu.device_allocate(context, bytes)?;
    let dst = match gpu.device_allocate(context, bytes) {
        Ok(dst) => dst,
        Err(e) => {
            gpu.device_deallocate(context, src)?;
            return Err(e);
        }
    };

    let outcome = run_graph(gpu, context, src, dst, bytes);
    gpu.device_deallocate(context, src)?;
    gpu.device_deallocate(context, dst)?;

    let words = outcome?;
    if words.iter().all(|w| *w == GRAPH_PATTERN) {
        Ok(format!("memset and memcpy nodes ran over {} elements", GRAPH_ELEMENTS))
    } else {
        Err(gpuexec_core::DriverError::Internal(
            "graph output does not match the memset pattern".to_string(),
        ))
    }
}

fn run_graph(
    gpu: &GpuDriver,
    context: &Context,
    src: DevicePtr,
    dst: DevicePtr,
    bytes: u64,
) -> Result<Vec<u32>> {
    let stream = gpu.create_stream(context, 0)?;
    let graph = gpu.create_graph()?;

    let memset = gpu.graph_add_memset_node(
        context,
        graph,
        &[],
        src,
        MemsetPattern::U32(GRAPH_PATTERN),
        GRAPH_ELEMENTS,
    )?;
    gpu.graph_add_memcpy_d2d_node(context, graph, &[memset], dst, src, bytes)?;

    let exec = gpu.graph_instantiate(graph, GraphInstantiateFlags::default())?;
    gpu.graph_launch(exec, stream)?;
    gpu.synchronize_stream(context, stream)?;

    let mut out = vec![0u8; bytes as usize];
    gpu.synchronous_memcpy_d2h(context, &mut out, dst)?;

    gpu.destroy_graph_exec(exec)?;
    gpu.destroy_graph(graph)?;
    gpu.destroy_stream(context, stream)?;

    Ok(out
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results_pretty(results: &[CheckResult]) {
    println!();
    println!("gpuexec self-test");
    println!("=================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };
        println!(
            "  {}{}{} {} - {}",
            color_start, icon, color_end, result.name, result.message
        );
    }

    println!();
    println!("-----------------");
    println!("  {} passed, {} failed", pass_count, fail_count);
    println!();
}

fn print_results_json(results: &[CheckResult]) {
    match serde_json::to_string(results) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
