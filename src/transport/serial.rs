//! Serial port transport using `tokio-serial`.
//!
//! The port is split into a writer task fed by an unbounded channel, so [`Transport::send`] never
//! blocks the engine loop, and a reader task that turns the byte stream into
//! [`TransportEvent::Line`]s. Either task flips the shared connected flag when the port fails.

use super::{Transport, TransportEvent, INBOUND_QUEUE_CAPACITY};
use crate::error::{DaqError, DaqResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Line-oriented serial link driven by background tasks.
pub struct SerialTransport {
    port_name: String,
    commands: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SerialTransport {
    /// Open `port_path` at `baud_rate` (8N1, no flow control).
    ///
    /// Returns the transport together with the receiver of inbound events.
    pub async fn open(
        port_path: &str,
        baud_rate: u32,
    ) -> DaqResult<(Self, mpsc::Receiver<TransportEvent>)> {
        let port = open_serial_async(port_path, baud_rate).await?;
        info!(port = port_path, baud_rate, "Opened serial port");
        Ok(Self::from_stream(port_path, port))
    }

    /// Wrap any async byte stream. Used for real ports and for `tokio::io::duplex` in tests.
    pub fn from_stream<S>(port_name: &str, stream: S) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_lines(
            port_name.to_string(),
            read_half,
            event_tx,
            connected.clone(),
        ));
        let writer = tokio::spawn(write_commands(
            port_name.to_string(),
            write_half,
            command_rx,
            connected.clone(),
        ));

        (
            Self {
                port_name: port_name.to_string(),
                commands: command_tx,
                connected,
                reader,
                writer,
            },
            event_rx,
        )
    }

    /// Port path it was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, command: &str) -> DaqResult<()> {
        if !self.is_connected() {
            return Err(DaqError::SerialPortNotConnected);
        }
        self.commands
            .send(command.to_string())
            .map_err(|_| DaqError::Transport(format!("Writer for {} has stopped", self.port_name)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> DaqResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Transport(format!(
                    "Failed to open serial port {}: {}",
                    port_path_owned, e
                ))
            })
    })
    .await
    .map_err(|e| DaqError::Transport(format!("spawn_blocking for serial port opening failed: {}", e)))?
}

async fn read_lines<R>(
    port_name: String,
    read_half: R,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if events.send(TransportEvent::Line(line)).await.is_err() {
                    debug!(port = %port_name, "Inbound receiver dropped, stopping reader");
                    return;
                }
            }
            Ok(None) => {
                warn!(port = %port_name, "Serial port closed");
                break;
            }
            Err(e) => {
                error!(port = %port_name, error = %e, "Serial read failed");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Disconnected).await;
}

async fn write_commands<W>(
    port_name: String,
    mut write_half: W,
    mut commands: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        let framed = format!("{}\n", command);
        let result = async {
            write_half.write_all(framed.as_bytes()).await?;
            write_half.flush().await
        }
        .await;
        if let Err(e) = result {
            error!(port = %port_name, error = %e, "Serial write failed");
            connected.store(false, Ordering::SeqCst);
            return;
        }
    }
}
