//! In-process launch monitor backend.
//!
//! Implements the SDK contract without hardware so that the binary can run a
//! full session and tests can drive every failure path.

mod device;
mod sdk;

pub use device::SimulatedDevice;
pub use sdk::SimulatedSdk;
