//! `BleTransport` implementations.

pub mod simulator;

pub use simulator::{ConnectGauge, DeviceProfile, SimulatedPeripheral};
