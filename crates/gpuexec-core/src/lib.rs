pub mod config;
pub mod error;
pub mod handle;

pub use config::{BackendKind, DriverConfig, DriverFlags, GpuexecConfig};
pub use error::{ConfigError, DriverError, Result, StatusCode};
