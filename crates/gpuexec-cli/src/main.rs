use clap::{Parser, Subcommand};
use tracing::info;

use gpuexec_core::config::default_config_path;
use gpuexec_core::{BackendKind, GpuexecConfig};
use gpuexec_driver::diagnostics::format_driver_version;
use gpuexec_driver::GpuDriver;

mod selftest;

#[derive(Parser)]
#[command(name = "gpuexec")]
#[command(about = "gpuexec - context-aware GPU driver layer")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Driver backend (auto, cuda or emulated); overrides the config file
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the driver version and the visible devices
    Info,

    /// Run a copy round trip and a graph launch on every device
    Selftest {
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    gpuexec_common::init_logging();

    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(default_config_path);
    let mut config = GpuexecConfig::load_or_default(&path);
    config.driver.apply_env_overrides()?;
    if let Some(backend) = cli.backend {
        config.driver.backend = backend;
    }

    let gpu = GpuDriver::from_config(&config.driver)?;

    match cli.command {
        Commands::Info => print_info(&gpu)?,
        Commands::Selftest { json } => {
            let passed = selftest::run_selftest(&gpu, json);
            if !passed {
                anyhow::bail!("selftest failed");
            }
        }
    }

    Ok(())
}

fn print_info(gpu: &GpuDriver) -> anyhow::Result<()> {
    info!("querying {} driver", gpu.backend_name());
    gpu.init()?;

    println!("Backend:        {}", gpu.backend_name());
    println!("Driver version: {}", format_driver_version(gpu.driver_version()?));
    let count = gpu.device_count();
    println!("Devices:        {}", count);
    println!();

    for ordinal in 0..count {
        let device = gpu.device(ordinal)?;
        let (major, minor) = gpu.compute_capability(device)?;
        println!("  GPU {}: {}", ordinal, gpu.device_name(device)?);
        println!("    PCI bus:     {}", gpu.device_pci_bus_id(device)?);
        println!("    Compute:     {}.{}", major, minor);
        println!(
            "    Memory:      {} MB",
            gpu.device_total_memory(device)? / (1024 * 1024)
        );
        println!("    SMs:         {}", gpu.multiprocessor_count(device)?);
        println!("    ECC:         {}", gpu.is_ecc_enabled(device)?);
        println!();
    }
    Ok(())
}
