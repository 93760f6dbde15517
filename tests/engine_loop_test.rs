//! Timer-driven tests of the engine loop on a paused clock.

use std::time::Duration;
use tm_daq::config::RunConfig;
use tm_daq::transport::{MockTransport, TransportEvent};
use tm_daq::{TelemetryEngine, TelemetryEvent};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const CONFIG: &str = r#"
[serial]
port = "mock"

[firmware]
version = "Thermal Mockup V2"

[[modules]]
name = "TM0"
poll_interval_ms = 1500
disabled_sensors = ["E2", "E4", "L1", "L2", "L3", "L4", "P1", "P2", "P3"]
"#;

struct Harness {
    link: MockTransport,
    lines: mpsc::Sender<TransportEvent>,
    stop: oneshot::Sender<()>,
    events: broadcast::Receiver<TelemetryEvent>,
    task: JoinHandle<TelemetryEngine>,
}

fn start(config: &str) -> Harness {
    let mut engine = RunConfig::from_toml_str(config)
        .unwrap()
        .build_engine()
        .unwrap();
    let events = engine.subscribe();
    let link = MockTransport::new();
    let (lines, inbound) = mpsc::channel(64);
    let (stop, shutdown) = oneshot::channel();

    let mut engine_link = link.clone();
    let task = tokio::spawn(async move {
        engine.run(&mut engine_link, inbound, shutdown).await.unwrap();
        engine
    });

    Harness {
        link,
        lines,
        stop,
        events,
        task,
    }
}

async fn line(h: &Harness, text: &str) {
    h.lines
        .send(TransportEvent::Line(text.to_string()))
        .await
        .unwrap();
}

async fn next_reading(events: &mut broadcast::Receiver<TelemetryEvent>) -> TelemetryEvent {
    loop {
        let event = events.recv().await.unwrap();
        if !matches!(event, TelemetryEvent::CommandSent { .. }) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_polls_on_interval_after_answers() {
    let mut h = start(CONFIG);

    // First poll fires on the first tick
    assert_eq!(
        h.events.recv().await.unwrap(),
        TelemetryEvent::CommandSent {
            module: "TM0".into(),
            command: "measure 3 1".into()
        }
    );

    line(&h, "measure 3 72a4ff").await;
    line(&h, "measure 1 6fa1ff").await;
    for _ in 0..2 {
        assert!(matches!(
            next_reading(&mut h.events).await,
            TelemetryEvent::SensorReading { .. }
        ));
    }

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(h.link.sent(), vec!["measure 3 1", "measure 3 1"]);

    h.stop.send(()).unwrap();
    let engine = h.task.await.unwrap();
    assert!(!engine.modules()[0].is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_keeps_module_gated() {
    let h = start(CONFIG);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.link.sent(), vec!["measure 3 1"]);

    // Only one answer arrives; the other sensor keeps the gate closed
    line(&h, "measure 3 72a4ff").await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.link.sent().len(), 1);

    drop(h.stop);
    let mut engine = h.task.await.unwrap();
    assert!(!engine.modules()[0].is_idle());

    engine.reset_pending();
    assert!(engine.modules()[0].is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_reset_pending() {
    let h = start(CONFIG);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.link.sent().len(), 1);

    h.link.set_connected(false);
    h.lines.send(TransportEvent::Disconnected).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    h.link.set_connected(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    // Still waiting for the answers to the first poll
    assert_eq!(h.link.sent().len(), 1);

    h.stop.send(()).unwrap();
    let engine = h.task.await.unwrap();
    assert!(!engine.modules()[0].is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_link_skips_polls() {
    let h = start(CONFIG);
    h.link.set_connected(false);
    // Polls due while the link is down are skipped, not queued
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.link.sent().is_empty());

    h.link.set_connected(true);
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(h.link.sent(), vec!["measure 3 1"]);

    h.stop.send(()).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bump_bond_paths_polled_alongside_sensors() {
    let config = format!(
        "{}\n[modules.reference_resistors]\n1 = 1000.0\n4 = 2200.0\n",
        CONFIG
    );
    let mut h = start(&config);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.link.sent(), vec!["measure 3 1", "TP 1 4"]);

    line(&h, "TP1 1.65").await;
    match next_reading(&mut h.events).await {
        TelemetryEvent::BumpBondReading { path_id, ohms, .. } => {
            assert_eq!(path_id, 1);
            assert!((ohms - 1000.0).abs() < 1e-9);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Path 4 is still pending at the next bump-bond interval
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(
        h.link.sent().iter().filter(|c| c.starts_with("TP")).count(),
        1
    );

    h.stop.send(()).unwrap();
    let engine = h.task.await.unwrap();
    let monitor = engine.monitor("TM0").unwrap();
    assert_eq!(monitor.path(1).unwrap().readings().len(), 1);
    assert!(monitor.path(4).unwrap().is_pending());
}
