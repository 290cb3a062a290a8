mod app;
pub mod chaos;
pub mod config;
mod error;
mod metrics;
pub mod server;

// for main.rs
pub use app::run;

pub use chaos::{ChaosOutcome, ChaosSupervisor, CrashCategory};
pub use config::ChaosConfig;
pub use error::Error;
