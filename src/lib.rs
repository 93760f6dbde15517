//! # tm-daq
//!
//! Serial telemetry engine for thermal-mockup modules. A module carries resistive temperature
//! sensors (`E1..E4`, `L1..L4`), digital probes (`P1..P3`) and optionally bump-bond continuity
//! paths, all read over one half-duplex, line-oriented serial link.
//!
//! ## Crate Structure
//!
//! - **`firmware`**: command/response codecs for each firmware dialect and the sensor ↔ channel
//!   table.
//! - **`sensor`**: per-channel request state machine with split-frame recovery.
//! - **`module`**: `ModuleController`, which polls all sensors of a module with one command and
//!   gates the next poll until every sensor answered.
//! - **`bump_bond`**: the `TP` continuity-path protocol.
//! - **`calibration`**: raw code → volts → ohms → °C conversion and linear-fit calibration.
//! - **`scheduler`**: injectable poll timing.
//! - **`engine`**: `TelemetryEngine`, the single-task loop that ties units to a transport.
//! - **`transport`**: the `Transport` trait, an in-memory mock and the `tokio-serial` adapter.
//! - **`events`**: `TelemetryEvent`s broadcast to consumers.
//! - **`config`**: figment-based run configuration.
//! - **`error`**: `DaqError` and `DaqResult`.
//! - **`tracing_init`**: subscriber setup.

pub mod bump_bond;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod firmware;
pub mod module;
pub mod scheduler;
pub mod sensor;
pub mod tracing_init;
pub mod transport;

pub use engine::TelemetryEngine;
pub use error::{DaqError, DaqResult};
pub use events::TelemetryEvent;
pub use module::{ModuleController, WriteOutcome};
