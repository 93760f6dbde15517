//! Bump-bond continuity paths.
//!
//! Runs beside the sensor protocol on the same link: `TP 1 4 7` asks the module to measure the
//! voltage across paths 1, 4 and 7, which answer with one `TP<id> <volts>` line each. The path is
//! one leg of a divider against a known reference resistor, so
//!
//! ```text
//! ohms = volts * reference / (vcc - volts)
//! ```
//!
//! Each path carries its own pending flag. A request is only sent when every requested path is
//! idle.

use crate::error::{DaqError, DaqResult};
use crate::events::{EventPublisher, TelemetryEvent};
use crate::firmware::{Firmware, FirmwareCodec};
use crate::module::WriteOutcome;
use crate::scheduler::{IntervalScheduler, PollScheduler};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default supply voltage of the bump-bond divider.
pub const DEFAULT_VCC: f64 = 3.3;

/// Default poll period of the bump-bond paths.
pub const DEFAULT_BUMP_BOND_INTERVAL: Duration = Duration::from_millis(3000);

/// Path resistance from the measured divider voltage. Returns 0 when `volts == vcc`.
pub fn bump_bond_ohms(volts: f64, reference_ohms: f64, vcc: f64) -> f64 {
    if volts == vcc {
        return 0.0;
    }
    volts * reference_ohms / (vcc - volts)
}

/// One answered bump-bond request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BumpBondReading {
    /// When the answer was read.
    pub timestamp: DateTime<Utc>,
    /// Voltage across the path.
    pub volts: f64,
    /// Path resistance from the divider.
    pub ohms: f64,
}

/// One bump-bond path and its reference resistor.
#[derive(Debug, Clone)]
pub struct BumpBondPath {
    id: u32,
    reference_ohms: f64,
    pending: bool,
    readings: Vec<BumpBondReading>,
}

impl BumpBondPath {
    /// Idle path with no readings.
    pub fn new(id: u32, reference_ohms: f64) -> Self {
        Self {
            id,
            reference_ohms,
            pending: false,
            readings: Vec::new(),
        }
    }

    /// Path id used in `TP` requests.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Reference resistor of the divider.
    pub fn reference_ohms(&self) -> f64 {
        self.reference_ohms
    }

    /// Whether a `TP` request for this path is unanswered.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// All readings in arrival order.
    pub fn readings(&self) -> &[BumpBondReading] {
        &self.readings
    }

    /// Most recent reading.
    pub fn latest(&self) -> Option<&BumpBondReading> {
        self.readings.last()
    }
}

/// Polls the bump-bond paths of one module.
#[derive(Debug)]
pub struct BumpBondMonitor {
    module: String,
    firmware: Firmware,
    paths: BTreeMap<u32, BumpBondPath>,
    vcc: f64,
    poll_interval: Duration,
    scheduler: Box<dyn PollScheduler>,
    events: EventPublisher,
}

impl BumpBondMonitor {
    /// `paths` maps path id to reference resistor ohms.
    pub fn new(
        module: impl Into<String>,
        firmware: Firmware,
        paths: &BTreeMap<u32, f64>,
        vcc: f64,
        poll_interval: Duration,
    ) -> DaqResult<Self> {
        let module = module.into();
        if paths.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Module {} has no bump-bond paths",
                module
            )));
        }
        if let Some((id, ohms)) = paths.iter().find(|(_, r)| !(r.is_finite() && **r > 0.0)) {
            return Err(DaqError::Configuration(format!(
                "Reference resistor of bump-bond path {} must be positive, got {}",
                id, ohms
            )));
        }
        if !(vcc.is_finite() && vcc > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Bump-bond supply voltage must be positive, got {}",
                vcc
            )));
        }
        if poll_interval.is_zero() {
            return Err(DaqError::Configuration(format!(
                "Bump-bond interval of module {} must be greater than zero",
                module
            )));
        }

        info!(module = %module, paths = paths.len(), "Bump-bond monitor configured");
        Ok(Self {
            module,
            firmware,
            paths: paths
                .iter()
                .map(|(&id, &ohms)| (id, BumpBondPath::new(id, ohms)))
                .collect(),
            vcc,
            poll_interval,
            scheduler: Box::new(IntervalScheduler::new()),
            events: EventPublisher::default(),
        })
    }

    /// Replace the interval scheduler.
    pub fn with_scheduler(mut self, scheduler: Box<dyn PollScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Publish readings to `sender`.
    pub fn set_event_sender(&mut self, sender: broadcast::Sender<TelemetryEvent>) {
        self.events.attach(sender);
    }

    /// Name of the module the paths belong to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Divider supply voltage.
    pub fn vcc(&self) -> f64 {
        self.vcc
    }

    /// Path by id.
    pub fn path(&self, id: u32) -> Option<&BumpBondPath> {
        self.paths.get(&id)
    }

    /// Paths in id order.
    pub fn paths(&self) -> impl Iterator<Item = &BumpBondPath> {
        self.paths.values()
    }

    /// Request a measurement of `path_ids`.
    pub fn write_bbs(
        &mut self,
        path_ids: &[u32],
        transport: &mut dyn Transport,
    ) -> DaqResult<WriteOutcome> {
        if let Some(unknown) = path_ids.iter().find(|id| !self.paths.contains_key(id)) {
            return Err(DaqError::Configuration(format!(
                "Unknown bump-bond path {} on module {}",
                unknown, self.module
            )));
        }
        let command = self.firmware.encode_bb(path_ids)?;

        if path_ids
            .iter()
            .any(|id| self.paths.get(id).is_some_and(BumpBondPath::is_pending))
        {
            trace!(module = %self.module, "Bump-bond write gated by outstanding requests");
            return Ok(WriteOutcome::Gated);
        }
        if !transport.is_connected() {
            warn!(module = %self.module, "Transport disconnected, skipping bump-bond poll");
            return Ok(WriteOutcome::Disconnected);
        }

        transport.send(&command)?;
        for id in path_ids {
            if let Some(path) = self.paths.get_mut(id) {
                path.pending = true;
            }
        }
        debug!(module = %self.module, command = %command, "Sent bump-bond command");
        self.events.publish(TelemetryEvent::CommandSent {
            module: self.module.clone(),
            command: command.clone(),
        });
        Ok(WriteOutcome::Sent(command))
    }

    /// Request every configured path.
    pub fn write_all(&mut self, transport: &mut dyn Transport) -> DaqResult<WriteOutcome> {
        let ids: Vec<u32> = self.paths.keys().copied().collect();
        self.write_bbs(&ids, transport)
    }

    /// Decode one inbound line, stamped with the current time.
    pub fn read(&mut self, line: &str) -> Option<BumpBondReading> {
        self.read_at(line, Utc::now())
    }

    /// Offer one inbound line. Answers for idle or unknown paths are ignored.
    pub fn read_at(&mut self, line: &str, now: DateTime<Utc>) -> Option<BumpBondReading> {
        let (id, volts) = self.firmware.decode_bb(line)?;
        let Some(path) = self.paths.get_mut(&id) else {
            trace!(module = %self.module, path = id, "Answer for unknown bump-bond path");
            return None;
        };
        if !path.pending {
            trace!(module = %self.module, path = id, "Ignoring unsolicited bump-bond answer");
            return None;
        }

        path.pending = false;
        let reading = BumpBondReading {
            timestamp: now,
            volts,
            ohms: bump_bond_ohms(volts, path.reference_ohms, self.vcc),
        };
        path.readings.push(reading);
        self.events.publish(TelemetryEvent::BumpBondReading {
            module: self.module.clone(),
            path_id: id,
            timestamp: reading.timestamp,
            volts: reading.volts,
            ohms: reading.ohms,
        });
        Some(reading)
    }

    /// Clear every pending path.
    pub fn reset_pending(&mut self) {
        for path in self.paths.values_mut() {
            path.pending = false;
        }
        info!(module = %self.module, "Bump-bond pending requests cleared");
    }

    /// Start the bump-bond interval.
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

    /// Request every path if the scheduler says a poll is due.
    pub fn on_tick(
        &mut self,
        now: Instant,
        transport: &mut dyn Transport,
    ) -> DaqResult<Option<WriteOutcome>> {
        if !self.scheduler.poll_due(now) {
            return Ok(None);
        }
        self.write_all(transport).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::FirmwareSetup;
    use crate::transport::MockTransport;

    fn monitor() -> BumpBondMonitor {
        let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
        let paths = BTreeMap::from([(1, 1000.0), (4, 2200.0)]);
        BumpBondMonitor::new("TM0", fw, &paths, DEFAULT_VCC, DEFAULT_BUMP_BOND_INTERVAL).unwrap()
    }

    #[test]
    fn test_ohms() {
        assert!((bump_bond_ohms(1.65, 1000.0, 3.3) - 1000.0).abs() < 1e-9);
        assert_eq!(bump_bond_ohms(3.3, 1000.0, 3.3), 0.0);
        assert_eq!(bump_bond_ohms(0.0, 1000.0, 3.3), 0.0);
    }

    #[test]
    fn test_write_and_read_cycle() {
        let mut m = monitor();
        let mut link = MockTransport::new();

        assert_eq!(
            m.write_all(&mut link).unwrap(),
            WriteOutcome::Sent("TP 1 4".into())
        );
        assert!(m.path(1).unwrap().is_pending());
        assert_eq!(m.write_bbs(&[4], &mut link).unwrap(), WriteOutcome::Gated);

        let reading = m.read("TP1 1.65").unwrap();
        assert!((reading.ohms - 1000.0).abs() < 1e-9);
        assert!(!m.path(1).unwrap().is_pending());
        assert!(m.path(4).unwrap().is_pending());

        // Path 1 is idle again and can be polled on its own
        assert_eq!(
            m.write_bbs(&[1], &mut link).unwrap(),
            WriteOutcome::Sent("TP 1".into())
        );
        assert_eq!(link.sent(), vec!["TP 1 4", "TP 1"]);
    }

    #[test]
    fn test_unknown_and_idle_paths_ignored() {
        let mut m = monitor();
        assert!(m.read("TP1 1.0").is_none());
        assert!(m.read("TP9 1.0").is_none());
        assert!(m.read("measure 1 72a4ff").is_none());
        assert!(m.path(1).unwrap().readings().is_empty());
    }

    #[test]
    fn test_unknown_path_is_configuration_error() {
        let mut m = monitor();
        let mut link = MockTransport::new();
        assert!(matches!(
            m.write_bbs(&[2], &mut link),
            Err(DaqError::Configuration(_))
        ));
        assert!(m.write_bbs(&[], &mut link).is_err());
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_invalid_setup() {
        let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
        let bad = BTreeMap::from([(1, -5.0)]);
        assert!(BumpBondMonitor::new("TM0", fw.clone(), &bad, DEFAULT_VCC, DEFAULT_BUMP_BOND_INTERVAL).is_err());
        assert!(BumpBondMonitor::new("TM0", fw, &BTreeMap::new(), DEFAULT_VCC, DEFAULT_BUMP_BOND_INTERVAL).is_err());
    }

    #[test]
    fn test_disconnect_and_reset() {
        let mut m = monitor();
        let mut link = MockTransport::new();
        link.set_connected(false);
        assert_eq!(m.write_all(&mut link).unwrap(), WriteOutcome::Disconnected);
        assert!(!m.path(1).unwrap().is_pending());

        link.set_connected(true);
        m.write_all(&mut link).unwrap();
        m.reset_pending();
        assert!(m.paths().all(|p| !p.is_pending()));
    }
}
