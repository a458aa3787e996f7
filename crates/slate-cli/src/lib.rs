//! Navy Slate command line support
//!
//! - [`simulator`]: seeded workload with injected write failures
//! - [`mirror`]: inspect and clear a file mirror on disk

pub mod mirror;
pub mod simulator;

pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport};
