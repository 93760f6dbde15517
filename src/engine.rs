//! Single-task event loop driving every module on one link.
//!
//! All protocol state lives in the [`TelemetryEngine`] and is only touched from its loop:
//!
//! ```text
//!            ┌────────────── TelemetryEngine::run ──────────────┐
//! shutdown ─▶│ 1. stop                                          │
//! inbound  ─▶│ 2. dispatch every queued line to all units       │──▶ broadcast<TelemetryEvent>
//! ticker   ─▶│ 3. poll units whose scheduler is due             │──▶ Transport::send
//!            └──────────────────────────────────────────────────┘
//! ```
//!
//! The select is biased in that order, and queued lines are drained before a tick is handled, so
//! a response that has already arrived always clears its pending flag before the next poll.

use crate::bump_bond::BumpBondMonitor;
use crate::error::{DaqError, DaqResult};
use crate::events::{TelemetryEvent, EVENT_CHANNEL_CAPACITY};
use crate::module::{ModuleController, WriteOutcome};
use crate::transport::{Transport, TransportEvent};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default engine tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Owns every module and bump-bond monitor on one link.
pub struct TelemetryEngine {
    modules: Vec<ModuleController>,
    monitors: Vec<BumpBondMonitor>,
    events: broadcast::Sender<TelemetryEvent>,
    tick: Duration,
}

impl TelemetryEngine {
    /// Empty engine ticking every `tick`.
    pub fn new(tick: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            modules: Vec::new(),
            monitors: Vec::new(),
            events,
            tick,
        }
    }

    /// Loop tick.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Register a module. Names must be unique.
    pub fn add_module(&mut self, mut module: ModuleController) -> DaqResult<()> {
        if self.module(module.name()).is_some() {
            return Err(DaqError::Configuration(format!(
                "Module {} added twice",
                module.name()
            )));
        }
        module.set_event_sender(self.events.clone());
        self.modules.push(module);
        Ok(())
    }

    /// Register a bump-bond monitor.
    pub fn add_monitor(&mut self, mut monitor: BumpBondMonitor) {
        monitor.set_event_sender(self.events.clone());
        self.monitors.push(monitor);
    }

    /// New receiver for telemetry events.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// Modules in registration order.
    pub fn modules(&self) -> &[ModuleController] {
        &self.modules
    }

    /// Module by name.
    pub fn module(&self, name: &str) -> Option<&ModuleController> {
        self.modules.iter().find(|m| m.name() == name)
    }

    /// Mutable module by name.
    pub fn module_mut(&mut self, name: &str) -> Option<&mut ModuleController> {
        self.modules.iter_mut().find(|m| m.name() == name)
    }

    /// Bump-bond monitors in registration order.
    pub fn monitors(&self) -> &[BumpBondMonitor] {
        &self.monitors
    }

    /// Monitor of `module`.
    pub fn monitor(&self, module: &str) -> Option<&BumpBondMonitor> {
        self.monitors.iter().find(|m| m.module() == module)
    }

    /// Offer one inbound line to every module and monitor.
    pub fn dispatch_line(&mut self, line: &str) {
        self.dispatch_line_at(line, Utc::now());
    }

    /// Like [`dispatch_line`](Self::dispatch_line) with an explicit timestamp.
    pub fn dispatch_line_at(&mut self, line: &str, now: DateTime<Utc>) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return;
        }
        for module in &mut self.modules {
            module.read_at(line, now);
        }
        for monitor in &mut self.monitors {
            monitor.read_at(line, now);
        }
    }

    /// Poll every unit whose scheduler is due. Returns the number of commands sent.
    pub fn on_tick(&mut self, now: Instant, transport: &mut dyn Transport) -> usize {
        let mut sent = 0;
        for module in &mut self.modules {
            let result = module.on_tick(now, transport);
            sent += count_sent(module.name(), result);
        }
        for monitor in &mut self.monitors {
            let result = monitor.on_tick(now, transport);
            sent += count_sent(monitor.module(), result);
        }
        sent
    }

    /// Start every unit's scheduler.
    pub fn start_polling(&mut self, now: Instant) {
        for module in &mut self.modules {
            module.start_polling(now);
        }
        for monitor in &mut self.monitors {
            monitor.start_polling(now);
        }
        info!(
            modules = self.modules.len(),
            monitors = self.monitors.len(),
            "Polling started"
        );
    }

    /// Stop every unit's scheduler. Pending flags are kept.
    pub fn stop_polling(&mut self) {
        for module in &mut self.modules {
            module.stop_polling();
        }
        for monitor in &mut self.monitors {
            monitor.stop_polling();
        }
        info!("Polling stopped");
    }

    /// Clear every pending flag so gated units resume polling.
    pub fn reset_pending(&mut self) {
        for module in &mut self.modules {
            module.reset_pending();
        }
        for monitor in &mut self.monitors {
            monitor.reset_pending();
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Line(line) => self.dispatch_line(&line),
            TransportEvent::Disconnected => {
                warn!("Transport disconnected; polls are skipped until it reconnects");
            }
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    ///
    /// Polling is started on entry and stopped on exit.
    pub async fn run<T: Transport>(
        &mut self,
        transport: &mut T,
        mut inbound: mpsc::Receiver<TransportEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> DaqResult<()> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        self.start_polling(Instant::now());
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => {
                        self.handle_event(event);
                        while let Ok(event) = inbound.try_recv() {
                            self.handle_event(event);
                        }
                    }
                    None => {
                        warn!("Inbound channel closed");
                        inbound_open = false;
                    }
                },

                _ = ticker.tick() => {
                    let sent = self.on_tick(Instant::now(), transport);
                    if sent > 0 {
                        debug!(sent, "Tick");
                    }
                }
            }
        }
        self.stop_polling();
        Ok(())
    }
}

fn count_sent(unit: &str, result: DaqResult<Option<WriteOutcome>>) -> usize {
    match result {
        Ok(Some(WriteOutcome::Sent(_))) => 1,
        Ok(_) => 0,
        Err(e) => {
            warn!(module = unit, error = %e, "Poll failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{Firmware, FirmwareSetup, SensorName};
    use crate::module::DEFAULT_POLL_INTERVAL;
    use crate::transport::MockTransport;

    fn engine() -> TelemetryEngine {
        let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
        let module = ModuleController::new(
            "TM0",
            fw,
            &[SensorName::E1, SensorName::E3],
            DEFAULT_POLL_INTERVAL,
        )
        .unwrap();
        let mut engine = TelemetryEngine::new(DEFAULT_TICK);
        engine.add_module(module).unwrap();
        engine
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let mut e = engine();
        let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
        let again =
            ModuleController::new("TM0", fw, &[SensorName::E2], DEFAULT_POLL_INTERVAL).unwrap();
        assert!(e.add_module(again).is_err());
    }

    #[test]
    fn test_dispatch_strips_line_endings() {
        let mut e = engine();
        let mut link = MockTransport::new();
        e.start_polling(Instant::now());
        assert_eq!(e.on_tick(Instant::now(), &mut link), 1);

        e.dispatch_line("measure 3 72a4ff\r\n");
        e.dispatch_line("\r\n");
        e.dispatch_line("measure 1 6fa1ff\r");
        assert!(e.module("TM0").unwrap().is_idle());
    }

    #[test]
    fn test_events_are_published() {
        let mut e = engine();
        let mut rx = e.subscribe();
        let mut link = MockTransport::new();
        e.start_polling(Instant::now());
        e.on_tick(Instant::now(), &mut link);
        e.dispatch_line("measure 3 72a4ff");

        assert!(matches!(rx.try_recv().unwrap(), TelemetryEvent::CommandSent { .. }));
        match rx.try_recv().unwrap() {
            TelemetryEvent::SensorReading {
                sensor, conversion, ..
            } => {
                assert_eq!(sensor, SensorName::E1);
                assert!((conversion.volts.unwrap() - 2.2328125).abs() < 1e-9);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_tick_counts_modules_and_monitors() {
        let mut e = engine();
        let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
        let paths = std::collections::BTreeMap::from([(1, 1000.0)]);
        e.add_monitor(
            BumpBondMonitor::new(
                "TM0",
                fw,
                &paths,
                crate::bump_bond::DEFAULT_VCC,
                crate::bump_bond::DEFAULT_BUMP_BOND_INTERVAL,
            )
            .unwrap(),
        );
        let mut link = MockTransport::new();
        let t0 = Instant::now();
        e.start_polling(t0);
        assert_eq!(e.on_tick(t0, &mut link), 2);
        assert_eq!(link.sent(), vec!["measure 3 1", "TP 1"]);
        // Both units are gated until their answers arrive
        assert_eq!(e.on_tick(t0 + Duration::from_secs(10), &mut link), 0);
    }

    #[test]
    fn test_send_failure_does_not_stop_polling() {
        let mut e = engine();
        let mut link = MockTransport::new();
        link.trigger_failure();
        let t0 = Instant::now();
        e.start_polling(t0);
        assert_eq!(e.on_tick(t0, &mut link), 0);
        assert!(e.module("TM0").unwrap().is_idle());
        assert_eq!(e.on_tick(t0 + DEFAULT_POLL_INTERVAL, &mut link), 1);
    }
}
