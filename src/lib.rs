//! Host side of a hardware-in-the-loop test rig.
//!
//! A device under test asks this process for sensor readings over a serial
//! line (`@VS:REQ:BME280:temperature`), reports flight events
//! (`@VS:EVENT:APOGEE`) and forwards its own log output. The server answers
//! from a [`simulation::Simulation`], whose clock and goals decide whether
//! the device behaved as expected.

pub mod config;
pub mod serial;
pub mod simulation;

pub use config::{RunConfig, ServerConfig, SimulationConfig};
pub use serial::{ServerBuilder, ServerError, VirtualSensorServer};
pub use simulation::{Simulation, SimulationHandle};
