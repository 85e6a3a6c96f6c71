pub mod logging;
pub mod platform;

pub use logging::{init_logging, try_init_logging};
