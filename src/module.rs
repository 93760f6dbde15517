//! Group-gated polling of all sensors on one module.
//!
//! A module sends one command that addresses every enabled sensor, for example
//! `measure 3 1` for `E1` and `E3`, then waits until every sensor has answered before it sends
//! again. Answers arrive in any order and are demultiplexed by offering each inbound line to every
//! sensor.
//!
//! ```text
//! write()  ── all idle? ── no ──▶ Gated
//!              │ yes
//!              ├─ link down ─────▶ Disconnected (pending untouched)
//!              ▼
//!          send command, mark every sensor pending
//! ```
//!
//! There is no timeout. A sensor whose answer is lost keeps the module gated until
//! [`ModuleController::reset_pending`] is called.

use crate::calibration::{convert, ModuleCalibration};
use crate::error::{DaqError, DaqResult};
use crate::events::{EventPublisher, TelemetryEvent};
use crate::firmware::{ControlCommand, Firmware, FirmwareCodec, SensorName};
use crate::scheduler::{IntervalScheduler, PollScheduler};
use crate::sensor::{DecodeOutcome, Sensor};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default poll period of a module.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// What a write attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The command was handed to the transport.
    Sent(String),
    /// At least one request is still outstanding; nothing was sent.
    Gated,
    /// The transport is down; nothing was sent and pending flags are unchanged.
    Disconnected,
}

/// One module's sensors behind a single poll command.
#[derive(Debug)]
pub struct ModuleController {
    name: String,
    firmware: Firmware,
    sensors: Vec<Sensor>,
    command: String,
    poll_interval: Duration,
    scheduler: Box<dyn PollScheduler>,
    calibration: ModuleCalibration,
    events: EventPublisher,
}

impl ModuleController {
    /// Set up a module polling `enabled` sensors through `firmware`.
    ///
    /// The measure command is encoded here, so an unknown or unsupported sensor is reported now
    /// rather than on the first poll.
    pub fn new(
        name: impl Into<String>,
        firmware: Firmware,
        enabled: &[SensorName],
        poll_interval: Duration,
    ) -> DaqResult<Self> {
        let name = name.into();
        let mut seen = BTreeSet::new();
        if let Some(dup) = enabled.iter().find(|n| !seen.insert(**n)) {
            return Err(DaqError::Configuration(format!(
                "Sensor {} enabled twice on module {}",
                dup, name
            )));
        }
        if poll_interval.is_zero() {
            return Err(DaqError::Configuration(format!(
                "Poll interval of module {} must be greater than zero",
                name
            )));
        }

        let command = firmware.encode_measure(enabled)?;
        let sensors = enabled
            .iter()
            .map(|&sensor| Ok(Sensor::new(sensor, firmware.frame_spec(sensor)?)))
            .collect::<DaqResult<Vec<_>>>()?;

        info!(
            module = %name,
            firmware = firmware.name(),
            sensors = sensors.len(),
            "Module configured"
        );

        Ok(Self {
            calibration: ModuleCalibration::new(enabled),
            name,
            firmware,
            sensors,
            command,
            poll_interval,
            scheduler: Box::new(IntervalScheduler::new()),
            events: EventPublisher::default(),
        })
    }

    /// Replace the poll trigger.
    pub fn with_scheduler(mut self, scheduler: Box<dyn PollScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Publish events to `sender`.
    pub fn set_event_sender(&mut self, sender: broadcast::Sender<TelemetryEvent>) {
        self.events.attach(sender);
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dialect the module speaks.
    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// Command sent on every poll.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time between polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Sensors in poll order.
    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Sensor by name.
    pub fn sensor(&self, name: SensorName) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    /// True when no sensor has an outstanding request.
    pub fn is_idle(&self) -> bool {
        self.sensors.iter().all(|s| !s.is_pending())
    }

    /// Poll every sensor once, if the module is idle.
    pub fn write(&mut self, transport: &mut dyn Transport) -> DaqResult<WriteOutcome> {
        if !self.is_idle() {
            trace!(module = %self.name, "Write gated by outstanding requests");
            return Ok(WriteOutcome::Gated);
        }
        if !transport.is_connected() {
            warn!(module = %self.name, "Transport disconnected, skipping poll");
            return Ok(WriteOutcome::Disconnected);
        }

        transport.send(&self.command)?;
        for sensor in &mut self.sensors {
            sensor.mark_pending();
        }
        debug!(module = %self.name, command = %self.command, "Sent measure command");
        self.events.publish(TelemetryEvent::CommandSent {
            module: self.name.clone(),
            command: self.command.clone(),
        });
        Ok(WriteOutcome::Sent(self.command.clone()))
    }

    /// Offer one inbound line to every sensor.
    pub fn read(&mut self, line: &str) -> Vec<(SensorName, DecodeOutcome)> {
        self.read_at(line, Utc::now())
    }

    /// [`ModuleController::read`] with an explicit receive time.
    ///
    /// Returns the outcome of every sensor the line concerned; mismatches are left out.
    pub fn read_at(&mut self, line: &str, now: DateTime<Utc>) -> Vec<(SensorName, DecodeOutcome)> {
        let mut outcomes = Vec::new();
        for sensor in &mut self.sensors {
            let outcome = sensor.try_decode(line, now);
            match &outcome {
                DecodeOutcome::Mismatch => continue,
                DecodeOutcome::Unsolicited => {}
                DecodeOutcome::Accepted(reading) => {
                    let conversion =
                        convert(sensor.name(), &reading.raw, self.calibration.fit(sensor.name()));
                    self.events.publish(TelemetryEvent::SensorReading {
                        module: self.name.clone(),
                        sensor: sensor.name(),
                        reading: reading.clone(),
                        conversion,
                    });
                }
                DecodeOutcome::ZeroDiscarded => {
                    self.events.publish(TelemetryEvent::ZeroReadingDiscarded {
                        module: self.name.clone(),
                        sensor: sensor.name(),
                    });
                }
            }
            outcomes.push((sensor.name(), outcome));
        }

        if outcomes.is_empty() {
            if let Some((sensor, _)) = self.firmware.decode_line(line) {
                trace!(module = %self.name, %sensor, line, "Line for a sensor not polled here");
            }
        }
        outcomes
    }

    /// Drop every outstanding request so polling can resume.
    pub fn reset_pending(&mut self) {
        for sensor in &mut self.sensors {
            sensor.clear_pending();
        }
        info!(module = %self.name, "Pending requests cleared");
    }

    /// Send `reset` or `calibrate` to the module. Not gated by pending requests.
    pub fn send_control(
        &mut self,
        command: ControlCommand,
        transport: &mut dyn Transport,
    ) -> DaqResult<WriteOutcome> {
        if !transport.is_connected() {
            return Ok(WriteOutcome::Disconnected);
        }
        let text = self.firmware.encode_control(command);
        transport.send(&text)?;
        info!(module = %self.name, command = %text, "Sent control command");
        self.events.publish(TelemetryEvent::CommandSent {
            module: self.name.clone(),
            command: text.clone(),
        });
        Ok(WriteOutcome::Sent(text))
    }

    /// Start the poll scheduler; the first poll is due at `now`.
    pub fn start_polling(&mut self, now: Instant) {
        self.scheduler.start(self.poll_interval, now);
    }

    /// Stop polling. Pending flags are kept.
    pub fn stop_polling(&mut self) {
        self.scheduler.stop();
    }

    /// Whether the scheduler is running.
    pub fn is_polling(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Write if the scheduler says a poll is due.
    pub fn on_tick(
        &mut self,
        now: Instant,
        transport: &mut dyn Transport,
    ) -> DaqResult<Option<WriteOutcome>> {
        if !self.scheduler.poll_due(now) {
            return Ok(None);
        }
        self.write(transport).map(Some)
    }

    /// Calibration session.
    pub fn calibration(&self) -> &ModuleCalibration {
        &self.calibration
    }

    /// Mutable calibration session.
    pub fn calibration_mut(&mut self) -> &mut ModuleCalibration {
        &mut self.calibration
    }

    /// Pair a reference temperature with the latest reading of every sensor.
    pub fn add_calibration_reference(&mut self, celsius: f64) -> DaqResult<()> {
        let latest = self.sensors.iter().map(|s| (s.name(), s.latest()));
        self.calibration.add_reference(celsius, latest)
    }
}
