//! Serial port transport implementation

use super::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Ok(Self::None),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 9600)
    }
}

/// Serial port transport
///
/// While connected, a background task drains the port and publishes
/// [`TransportEvent::Data`] chunks in arrival order.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader_task: Option<JoinHandle<()>>,
    tx: broadcast::Sender<TransportEvent>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Self {
        let (tx, _) = broadcast::channel(1024);

        Self {
            config,
            writer: None,
            reader_task: None,
            tx,
        }
    }

    fn spawn_reader(&self, mut reader: ReadHalf<SerialStream>) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        let _ = tx.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        let _ = tx.send(TransportEvent::Data(Bytes::copy_from_slice(&buffer[..n])));
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(e.to_string()));
                        let _ = tx.send(TransportEvent::Closed);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        debug!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");

        let (reader, writer) = tokio::io::split(stream);
        self.reader_task = Some(self.spawn_reader(reader));
        self.writer = Some(writer);

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if self.writer.take().is_some() {
            let _ = self.tx.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;

        writer.write_all(data).await.map_err(TransportError::IoError)?;
        writer.flush().await.map_err(TransportError::IoError)?;

        Ok(data.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits,
        )
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::ConfigError(e.to_string()))
}
