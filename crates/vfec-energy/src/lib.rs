//! Calibrated hardware-counter energy measurement.
//!
//! Commands too short for the energy meter's resolution are looped inside a
//! single `perf stat` session ([`calibrate`]), the session's counters are
//! parsed and normalized back to one logical run ([`perf`]), and repeated
//! sessions are reduced to descriptive statistics ([`aggregate`]).

pub mod aggregate;
pub mod calibrate;
pub mod perf;

pub use aggregate::{summarize, EnergyMeter, EnergyReport, MetricAggregator};
pub use calibrate::EnergyCalibrator;
pub use perf::PerfSession;
