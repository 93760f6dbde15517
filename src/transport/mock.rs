//! In-memory transport for testing
//!
//! Records every command written, can be disconnected at will and can fail the next send. Clones
//! share state, so a test keeps one handle while the engine owns another.

use super::Transport;
use crate::error::{DaqError, DaqResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use tm_daq::transport::{MockTransport, Transport};
///
/// let mut link = MockTransport::new();
/// link.send("measure 3 1").unwrap();
/// assert_eq!(link.sent(), vec!["measure 3 1".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct MockTransport {
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    /// Create a connected mock transport
    pub fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulate the link going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next send with a transport error
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Copy of every command sent so far
    pub fn sent(&self) -> Vec<String> {
        self.log().clone()
    }

    /// Take and clear the sent log
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.log())
    }

    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, command: &str) -> DaqResult<()> {
        if !self.is_connected() {
            return Err(DaqError::SerialPortNotConnected);
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Transport("Mock send failure".into()));
        }
        debug!(command, "MockTransport send");
        self.log().push(command.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_commands() {
        let mut link = MockTransport::new();
        let observer = link.clone();
        link.send("measure 3 1").unwrap();
        link.send("TP 1 2").unwrap();
        assert_eq!(observer.sent(), vec!["measure 3 1", "TP 1 2"]);
        assert_eq!(observer.take_sent().len(), 2);
        assert!(observer.sent().is_empty());
    }

    #[test]
    fn test_failure_is_one_shot() {
        let mut link = MockTransport::new();
        link.trigger_failure();
        assert!(matches!(link.send("reset"), Err(DaqError::Transport(_))));
        assert!(link.send("reset").is_ok());
        assert_eq!(link.sent(), vec!["reset"]);
    }

    #[test]
    fn test_disconnected_send_fails() {
        let mut link = MockTransport::new();
        link.set_connected(false);
        assert!(!link.is_connected());
        assert!(matches!(
            link.send("measure 1"),
            Err(DaqError::SerialPortNotConnected)
        ));
        assert!(link.sent().is_empty());
    }
}
