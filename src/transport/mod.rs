//! Line-oriented links to the module hardware.
//!
//! The protocol core needs two things from a link: a non-blocking `send` of one command and a
//! stream of inbound [`TransportEvent`]s. Outbound commands are written with a trailing `\n`;
//! composite commands already contain their inner newlines and go out as one write.
//!
//! - [`MockTransport`]: in-memory link for tests and dry runs.
//! - [`SerialTransport`]: `tokio-serial` link (feature `instrument_serial`).

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

use crate::error::DaqResult;

/// Capacity of the inbound event queue created by transports.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound line, without its terminator.
    Line(String),
    /// The link went away. Later sends fail until it is reopened.
    Disconnected,
}

/// Outbound half of a link.
pub trait Transport: Send {
    /// Queue `command` for writing. Must not block.
    fn send(&mut self, command: &str) -> DaqResult<()>;

    /// Whether sends can currently succeed.
    fn is_connected(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, command: &str) -> DaqResult<()> {
        (**self).send(command)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
