//! # Modmon Core Library
//!
//! A Modbus master-side protocol engine for RTU and ASCII over
//! byte-oriented transports, with support for:
//!
//! - Function codes FC01-FC06, FC15 and FC16
//! - Frame building, validation and checksum checking (CRC-16 / LRC)
//! - Stream reassembly with resynchronisation after line noise
//! - Request/response exchanges with external cancellation
//! - A stateful client facade with at-most-one in-flight request
//! - Periodic register polling with an event channel
//! - Serial transports plus an in-memory mock for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use modmon_core::{
//!     ExchangeOptions, FunctionCode, ModbusClient, Protocol, ReadRequest, SerialConfig,
//!     SerialTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 9600));
//!     let client = ModbusClient::new(Box::new(transport), Protocol::Rtu);
//!     client.connect().await?;
//!
//!     let request = ReadRequest::new(1, FunctionCode::ReadHoldingRegisters, 0, 10);
//!     let response = client.read(request, ExchangeOptions::default()).await?;
//!     println!("registers: {:?}", response.data);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod client;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use crate::cancel::CancelHandle;
pub use crate::client::{ClientEvent, ModbusClient};
pub use crate::protocol::{
    ExceptionCode, ExchangeOptions, FrameError, FunctionCode, ModbusError, ParsedFrame, Protocol,
    ReadRequest, Response, ResponseData, WriteRequest, WriteValue,
};
pub use crate::transport::{
    list_ports, MockHandle, MockTransport, SerialConfig, SerialFlowControl, SerialParity,
    SerialTransport, Transport, TransportError, TransportEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
