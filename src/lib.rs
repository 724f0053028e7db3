//! # mlperf-power
//!
//! Coordinates a power-measurement benchmark run between a director (on the
//! system under test) and a controller (driving a third-party power-analyzer
//! daemon, PTD) over a small line-oriented TCP protocol.

pub mod audit;
pub mod cli;
pub mod config;
pub mod controller_service;
pub mod descriptor;
pub mod director;
pub mod logging;
pub mod logparse;
pub mod merger;
pub mod protocol;
pub mod ptd;
pub mod session;
pub mod time_sync;
pub mod utils;

pub use config::ControllerConfig;
pub use controller_service::ControllerService;
pub use descriptor::Descriptor;
pub use director::Director;
pub use session::Session;

/// The current version of mlperf-power.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
