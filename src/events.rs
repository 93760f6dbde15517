//! Notifications published by controllers and monitors.
//!
//! Consumers (plotting, persistence, the CLI log) subscribe through
//! [`crate::engine::TelemetryEngine::subscribe`]. Publishing never blocks; a lagging subscriber
//! loses the oldest events.

use crate::calibration::Conversion;
use crate::firmware::SensorName;
use crate::sensor::Reading;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the engine publishes to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A command was handed to the transport.
    CommandSent {
        /// Sending module.
        module: String,
        /// Command text without the line terminator.
        command: String,
    },
    /// A sensor accepted a sample.
    SensorReading {
        /// Owning module.
        module: String,
        /// Answering sensor.
        sensor: SensorName,
        /// The stored sample.
        reading: Reading,
        /// Sample converted with the sensor's current fit.
        conversion: Conversion,
    },
    /// A sensor answered with the transient zero sentinel.
    ZeroReadingDiscarded {
        /// Owning module.
        module: String,
        /// Answering sensor.
        sensor: SensorName,
    },
    /// A bump-bond path answered.
    BumpBondReading {
        /// Owning module.
        module: String,
        /// Path id from the `TP` response.
        path_id: u32,
        /// Arrival time.
        timestamp: DateTime<Utc>,
        /// Voltage across the path.
        volts: f64,
        /// Path resistance.
        ohms: f64,
    },
}

impl TelemetryEvent {
    /// Module the event came from.
    pub fn module(&self) -> &str {
        match self {
            TelemetryEvent::CommandSent { module, .. }
            | TelemetryEvent::SensorReading { module, .. }
            | TelemetryEvent::ZeroReadingDiscarded { module, .. }
            | TelemetryEvent::BumpBondReading { module, .. } => module,
        }
    }
}

/// Optional handle to the event channel held by each controller.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventPublisher {
    sender: Option<broadcast::Sender<TelemetryEvent>>,
}

impl EventPublisher {
    pub(crate) fn attach(&mut self, sender: broadcast::Sender<TelemetryEvent>) {
        self.sender = Some(sender);
    }

    pub(crate) fn publish(&self, event: TelemetryEvent) {
        if let Some(sender) = &self.sender {
            // No subscribers is not an error
            let _ = sender.send(event);
        }
    }
}
