//! Modbus master protocol engine
//!
//! This module provides:
//! - Checksum primitives (CRC-16/Modbus, LRC)
//! - Frame builders and parsers for RTU and ASCII encodings
//! - Stream scanners that reassemble frames with resynchronisation
//! - The request/response exchange over an abstract transport

pub mod checksum;
pub mod exchange;
pub mod frame;
pub mod scanner;

pub use frame::{FrameError, ParsedFrame};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::cancel::CancelHandle;

/// Lowest addressable slave id on a serial line
pub const SLAVE_ID_MIN: u8 = 1;
/// Highest addressable slave id on a serial line
pub const SLAVE_ID_MAX: u8 = 247;
/// Maximum coils/discrete inputs per read (FC01/FC02)
pub const MAX_READ_BITS: u16 = 2000;
/// Maximum registers per read (FC03/FC04)
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum coils per multi-write (FC15)
pub const MAX_WRITE_COILS: u16 = 1968;
/// Maximum registers per multi-write (FC16)
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus serial-line protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Modbus RTU (binary, CRC-16)
    Rtu,
    /// Modbus ASCII (hex text, LRC)
    Ascii,
}

impl Protocol {
    /// Get name of protocol variant
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rtu => "RTU",
            Self::Ascii => "ASCII",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Modbus function codes supported by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Get function code from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Get name of function code
    pub fn name(&self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    /// True for the read function codes (FC01-FC04)
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// True for the write function codes (FC05/06/15/16)
    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    /// True when the function reads or writes single-bit items
    pub fn is_bit_oriented(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCode {
    /// Illegal function (0x01)
    IllegalFunction,
    /// Illegal data address (0x02)
    IllegalDataAddress,
    /// Illegal data value (0x03)
    IllegalDataValue,
    /// Slave device failure (0x04)
    SlaveDeviceFailure,
    /// Acknowledge (0x05)
    Acknowledge,
    /// Slave device busy (0x06)
    SlaveDeviceBusy,
    /// Memory parity error (0x08)
    MemoryParityError,
    /// Gateway path unavailable (0x0A)
    GatewayPathUnavailable,
    /// Gateway target failed to respond (0x0B)
    GatewayTargetFailedToRespond,
    /// Any code outside the standard set
    Unknown(u8),
}

impl ExceptionCode {
    /// Get exception from its wire code
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Unknown(other),
        }
    }

    /// Get the wire code
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Unknown(code) => *code,
        }
    }

    /// Get name of exception
    pub fn name(&self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveDeviceFailure => "Slave Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveDeviceBusy => "Slave Device Busy",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "Gateway Target Failed to Respond",
            ExceptionCode::Unknown(_) => "Unknown Exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.name(), self.code())
    }
}

/// A read request (FC01-FC04)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Target slave id (1..=247)
    pub slave_id: u8,
    /// Read function code
    pub function: FunctionCode,
    /// Start address
    pub address: u16,
    /// Item count (1..=2000 bits, 1..=125 registers)
    pub quantity: u16,
}

impl ReadRequest {
    /// Create a new read request
    pub fn new(slave_id: u8, function: FunctionCode, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
        }
    }
}

/// The value carried by a write request
///
/// Scalar variants serve the single-item writes (FC05/FC06); sequence
/// variants serve the multi-item writes (FC15/FC16).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteValue {
    /// Single coil state
    Coil(bool),
    /// Single register value
    Register(u16),
    /// Coil sequence for FC15
    Coils(Vec<bool>),
    /// Register sequence for FC16
    Registers(Vec<u16>),
}

/// A write request (FC05/06/15/16)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Target slave id (1..=247)
    pub slave_id: u8,
    /// Write function code
    pub function: FunctionCode,
    /// Start address
    pub address: u16,
    /// Value(s) to write
    pub value: WriteValue,
}

impl WriteRequest {
    /// Create a new write request
    pub fn new(slave_id: u8, function: FunctionCode, address: u16, value: WriteValue) -> Self {
        Self {
            slave_id,
            function,
            address,
            value,
        }
    }
}

/// Decoded payload of a successful read or write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Bit values from FC01/FC02, trimmed to the requested quantity
    Coils(Vec<bool>),
    /// Register values from FC03/FC04
    Registers(Vec<u16>),
    /// Write acknowledge; the echo payload is not decoded
    Echo,
}

/// A decoded response delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Responding slave id
    pub slave_id: u8,
    /// Function code with the exception bit stripped
    pub function: FunctionCode,
    /// Decoded payload
    pub data: ResponseData,
    /// Start address echoed from the request (caller-side annotation)
    pub address: u16,
    /// Time the response was decoded
    pub timestamp: DateTime<Utc>,
}

/// Per-exchange options
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// External cancellation handle for this exchange
    pub cancel: Option<CancelHandle>,
}

impl ExchangeOptions {
    /// Options bound to the given cancel handle
    pub fn with_cancel(cancel: CancelHandle) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }
}

/// Protocol engine error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    /// Exchange attempted while the transport is closed
    #[error("transport not connected")]
    TransportNotConnected,
    /// The transport send call failed
    #[error("transport send failed: {0}")]
    TransportSend(String),
    /// The inbound byte stream failed
    #[error("transport stream failed: {0}")]
    TransportStream(String),
    /// External cancellation, with the reason if one was supplied
    #[error("request cancelled")]
    Cancelled(Option<String>),
    /// Frame-level validation failure
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// Structured Modbus exception response
    #[error("modbus exception: {0}")]
    Exception(ExceptionCode),
    /// Function code not usable for the attempted operation
    #[error("invalid function code 0x{0:02X}")]
    InvalidFunctionCode(u8),
    /// Value shape does not match the function code
    #[error("value shape does not match the function code")]
    InvalidValueShape,
    /// A request field is outside its legal range
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
    /// A second request was issued while one is pending
    #[error("another request is already pending")]
    Busy,
    /// The stream ended before a matching response arrived
    #[error("stream ended before a matching response arrived")]
    StreamEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_roundtrip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            let fc = FunctionCode::from_u8(code).unwrap();
            assert_eq!(fc as u8, code);
        }
        assert!(FunctionCode::from_u8(0x07).is_none());
        assert!(FunctionCode::from_u8(0x80).is_none());
    }

    #[test]
    fn test_read_write_split() {
        assert!(FunctionCode::ReadCoils.is_read());
        assert!(FunctionCode::ReadInputRegisters.is_read());
        assert!(FunctionCode::WriteSingleCoil.is_write());
        assert!(FunctionCode::WriteMultipleRegisters.is_write());
    }

    #[test]
    fn test_exception_code_total() {
        assert_eq!(ExceptionCode::from_u8(2), ExceptionCode::IllegalDataAddress);
        assert_eq!(ExceptionCode::from_u8(0x0B).code(), 0x0B);
        let unknown = ExceptionCode::from_u8(0x42);
        assert_eq!(unknown, ExceptionCode::Unknown(0x42));
        assert_eq!(unknown.code(), 0x42);
    }
}
