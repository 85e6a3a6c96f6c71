//! Environment report emitted when driver initialization fails.

use std::sync::Once;

use tracing::{error, info};

use gpuexec_common::platform::{driver_library_names, platform_name, DRIVER_ENV_VARS};

use crate::driver::Driver;
use crate::result;

static REPORTED: Once = Once::new();

/// Logs what is known about the local driver installation.
pub struct Diagnostician;

impl Diagnostician {
    /// Log the environment report, at most once per process.
    pub fn log_diagnostic_information(driver: &dyn Driver) {
        REPORTED.call_once(|| Self::report(driver));
    }

    fn report(driver: &dyn Driver) {
        error!("driver initialization failed; environment follows");
        info!("platform: {}", platform_name());
        info!("driver backend: {}", driver.backend_name());
        info!(
            "driver library candidates: {}",
            driver_library_names().join(", ")
        );
        match driver.driver_get_version() {
            Ok(version) => info!("driver version: {}", format_driver_version(version)),
            Err(res) => info!("driver version unavailable: {}", result::to_string(res)),
        }
        for var in DRIVER_ENV_VARS {
            match std::env::var(var) {
                Ok(value) => info!("{}={}", var, value),
                Err(_) => info!("{} is not set", var),
            }
        }
    }
}

/// `12040` -> `12.4`
pub fn format_driver_version(version: i32) -> String {
    format!("{}.{}", version / 1000, (version % 1000) / 10)
}
