//! Frame building and parsing for Modbus RTU and ASCII
//!
//! Builders assemble request PDUs and wrap them into ADUs (CRC for RTU,
//! `:`/hex/LRC/CRLF for ASCII). Parsers validate inbound ADUs, strip the
//! exception bit and expose the payload. The length/plausibility helpers
//! at the bottom drive the stream scanners' resynchronisation.

use thiserror::Error;

use super::checksum;
use super::{
    FunctionCode, ModbusError, ReadRequest, WriteRequest, WriteValue, MAX_READ_BITS,
    MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS, SLAVE_ID_MAX, SLAVE_ID_MIN,
};

/// Shortest valid RTU ADU (exception response without its padding)
pub const MIN_RTU_FRAME_LEN: usize = 5;

/// Frame-level validation failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than any valid frame
    #[error("frame too short")]
    TooShort,
    /// Header present but the payload has not fully arrived
    #[error("frame incomplete")]
    Incomplete,
    /// Function code outside the supported set
    #[error("unknown function code")]
    UnknownFunctionCode,
    /// ASCII frame missing `:` lead-in or otherwise malformed
    #[error("malformed ASCII frame")]
    BadFormat,
    /// ASCII frame with an odd number of hex digits
    #[error("odd number of hex digits")]
    BadHexLength,
    /// ASCII frame with characters outside `[0-9A-Fa-f]`
    #[error("invalid hex digits")]
    BadHex,
    /// RTU checksum mismatch
    #[error("CRC mismatch")]
    BadCrc,
    /// ASCII checksum mismatch
    #[error("LRC mismatch")]
    BadLrc,
}

/// A validated frame with its payload extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    /// Responding slave id
    pub slave_id: u8,
    /// Function code with the exception bit stripped
    pub function_code: u8,
    /// Payload bytes without header, byte-count or checksum
    pub data: Vec<u8>,
    /// Whether the raw function code had bit 7 set
    pub is_exception: bool,
    /// Exception code byte, for exception responses
    pub exception_code: Option<u8>,
}

fn check_slave_id(slave_id: u8) -> Result<(), ModbusError> {
    if (SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave_id) {
        Ok(())
    } else {
        Err(ModbusError::ValueOutOfRange(format!(
            "slave id {slave_id} outside {SLAVE_ID_MIN}..={SLAVE_ID_MAX}"
        )))
    }
}

// ============ PDU builders ============

/// Build a read PDU: `[slave, fc, addr_hi, addr_lo, qty_hi, qty_lo]`
pub fn build_read_pdu(request: &ReadRequest) -> Result<Vec<u8>, ModbusError> {
    if !request.function.is_read() {
        return Err(ModbusError::InvalidFunctionCode(request.function as u8));
    }
    check_slave_id(request.slave_id)?;

    let max = if request.function.is_bit_oriented() {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    };
    if request.quantity == 0 || request.quantity > max {
        return Err(ModbusError::ValueOutOfRange(format!(
            "quantity {} outside 1..={max}",
            request.quantity
        )));
    }

    let mut pdu = Vec::with_capacity(6);
    pdu.push(request.slave_id);
    pdu.push(request.function as u8);
    pdu.extend_from_slice(&request.address.to_be_bytes());
    pdu.extend_from_slice(&request.quantity.to_be_bytes());
    Ok(pdu)
}

/// First element of a coil-valued write, accepting scalar or sequence forms
fn coil_scalar(value: &WriteValue) -> Result<bool, ModbusError> {
    match value {
        WriteValue::Coil(state) => Ok(*state),
        WriteValue::Register(raw) => Ok(*raw != 0),
        WriteValue::Coils(states) => states.first().copied().ok_or(ModbusError::InvalidValueShape),
        WriteValue::Registers(raws) => raws
            .first()
            .map(|raw| *raw != 0)
            .ok_or(ModbusError::InvalidValueShape),
    }
}

/// First element of a register-valued write
fn register_scalar(value: &WriteValue) -> Result<u16, ModbusError> {
    match value {
        WriteValue::Register(raw) => Ok(*raw),
        WriteValue::Registers(raws) => raws.first().copied().ok_or(ModbusError::InvalidValueShape),
        WriteValue::Coil(_) | WriteValue::Coils(_) => Err(ModbusError::InvalidValueShape),
    }
}

/// Build a write PDU for FC05/06/15/16
pub fn build_write_pdu(request: &WriteRequest) -> Result<Vec<u8>, ModbusError> {
    check_slave_id(request.slave_id)?;

    let mut pdu = Vec::with_capacity(8);
    pdu.push(request.slave_id);
    pdu.push(request.function as u8);
    pdu.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        FunctionCode::WriteSingleCoil => {
            let on = coil_scalar(&request.value)?;
            pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        }
        FunctionCode::WriteSingleRegister => {
            let raw = register_scalar(&request.value)?;
            pdu.extend_from_slice(&raw.to_be_bytes());
        }
        FunctionCode::WriteMultipleCoils => {
            let WriteValue::Coils(states) = &request.value else {
                return Err(ModbusError::InvalidValueShape);
            };
            if states.is_empty() || states.len() > MAX_WRITE_COILS as usize {
                return Err(ModbusError::ValueOutOfRange(format!(
                    "coil count {} outside 1..={MAX_WRITE_COILS}",
                    states.len()
                )));
            }
            let packed = pack_bits(states);
            pdu.extend_from_slice(&(states.len() as u16).to_be_bytes());
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
        FunctionCode::WriteMultipleRegisters => {
            let WriteValue::Registers(raws) = &request.value else {
                return Err(ModbusError::InvalidValueShape);
            };
            if raws.is_empty() || raws.len() > MAX_WRITE_REGISTERS as usize {
                return Err(ModbusError::ValueOutOfRange(format!(
                    "register count {} outside 1..={MAX_WRITE_REGISTERS}",
                    raws.len()
                )));
            }
            pdu.extend_from_slice(&(raws.len() as u16).to_be_bytes());
            pdu.push((raws.len() * 2) as u8);
            for raw in raws {
                pdu.extend_from_slice(&raw.to_be_bytes());
            }
        }
        _ => return Err(ModbusError::InvalidFunctionCode(request.function as u8)),
    }

    Ok(pdu)
}

/// Pack bit values LSB-first into bytes (bit `i` -> byte `i/8`, bit `i%8`)
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bits.len().div_ceil(8));
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (bit, &state) in chunk.iter().enumerate() {
            if state {
                byte |= 1 << bit;
            }
        }
        result.push(byte);
    }
    result
}

// ============ ADU wrappers ============

/// Wrap a PDU into an RTU ADU by appending the CRC, low byte first
pub fn wrap_rtu(pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 2);
    adu.extend_from_slice(pdu);
    adu.extend_from_slice(&checksum::crc16_modbus(pdu).to_le_bytes());
    adu
}

/// Wrap a PDU into an ASCII ADU: `:` + uppercase hex + LRC + CRLF
pub fn wrap_ascii(pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() * 2 + 5);
    adu.push(b':');
    adu.extend_from_slice(hex::encode_upper(pdu).as_bytes());
    adu.extend_from_slice(hex::encode_upper([checksum::lrc(pdu)]).as_bytes());
    adu.extend_from_slice(b"\r\n");
    adu
}

// ============ Parsers ============

/// Build a [`ParsedFrame`] from checksum-free frame bytes `[slave, fc, ...]`
fn parse_payload(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
    let slave_id = bytes[0];
    let raw_function = bytes[1];
    let is_exception = raw_function & 0x80 != 0;
    let function_code = raw_function & 0x7F;

    if is_exception {
        if bytes.len() < 3 {
            return Err(FrameError::Incomplete);
        }
        return Ok(ParsedFrame {
            slave_id,
            function_code,
            data: Vec::new(),
            is_exception: true,
            exception_code: Some(bytes[2]),
        });
    }

    let data = match function_code {
        0x01..=0x04 => {
            if bytes.len() < 3 {
                return Err(FrameError::Incomplete);
            }
            let byte_count = bytes[2] as usize;
            if bytes.len() < 3 + byte_count {
                return Err(FrameError::Incomplete);
            }
            bytes[3..3 + byte_count].to_vec()
        }
        0x05 | 0x06 | 0x0F | 0x10 => bytes[2..].to_vec(),
        _ => return Err(FrameError::UnknownFunctionCode),
    };

    Ok(ParsedFrame {
        slave_id,
        function_code,
        data,
        is_exception: false,
        exception_code: None,
    })
}

/// Parse and validate an RTU ADU
///
/// The receive path only ever sees responses, so FC15/FC16 mean the 8-byte
/// echo; exact-length request frames for those codes are also accepted so
/// that locally built ADUs can be fed back through the parser.
pub fn parse_rtu(buf: &[u8]) -> Result<ParsedFrame, FrameError> {
    if buf.len() < MIN_RTU_FRAME_LEN {
        return Err(FrameError::TooShort);
    }

    let function = buf[1];
    let expected = if function & 0x80 != 0 {
        5
    } else {
        match function {
            0x01..=0x04 => 3 + buf[2] as usize + 2,
            0x05 | 0x06 => 8,
            0x0F | 0x10 => {
                if buf.len() <= 8 {
                    8
                } else {
                    // multi-write request: qty + byte_count header before the data
                    9 + buf[6] as usize
                }
            }
            _ => return Err(FrameError::UnknownFunctionCode),
        }
    };

    if buf.len() < expected {
        return Err(FrameError::Incomplete);
    }

    let crc_received = u16::from_le_bytes([buf[expected - 2], buf[expected - 1]]);
    let crc_calculated = checksum::crc16_modbus(&buf[..expected - 2]);
    if crc_received != crc_calculated {
        return Err(FrameError::BadCrc);
    }

    parse_payload(&buf[..expected - 2])
}

/// Decode an ASCII ADU string into its raw frame bytes (LRC stripped)
pub fn decode_ascii_frame(text: &str) -> Result<Vec<u8>, FrameError> {
    let trimmed = text.strip_suffix("\r\n").unwrap_or(text);
    if !trimmed.starts_with(':') || trimmed.len() < 3 {
        return Err(FrameError::BadFormat);
    }

    let digits = &trimmed[1..];
    if digits.len() % 2 != 0 {
        return Err(FrameError::BadHexLength);
    }
    let bytes = hex::decode(digits).map_err(|_| FrameError::BadHex)?;
    if bytes.len() < 3 {
        return Err(FrameError::BadFormat);
    }

    let (payload, received) = bytes.split_at(bytes.len() - 1);
    if checksum::lrc(payload) != received[0] {
        return Err(FrameError::BadLrc);
    }
    // An exception response carries a code byte after slave and function
    if payload[1] & 0x80 != 0 && payload.len() < 3 {
        return Err(FrameError::Incomplete);
    }
    Ok(payload.to_vec())
}

/// Parse and validate an ASCII ADU
pub fn parse_ascii(text: &str) -> Result<ParsedFrame, FrameError> {
    parse_payload(&decode_ascii_frame(text)?)
}

// ============ Scanner helpers ============

/// Expected ADU length for the frame starting at `buf[0]`
///
/// `None` when the length cannot be determined yet or the function code is
/// outside the supported set.
pub fn expected_rtu_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let function = buf[1];
    if function & 0x80 != 0 {
        return Some(5);
    }
    match function {
        0x01..=0x04 => {
            if buf.len() < 3 {
                None
            } else {
                Some(3 + buf[2] as usize + 2)
            }
        }
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        _ => None,
    }
}

/// Whether `buf[at..]` could begin a valid RTU frame
pub fn is_plausible_rtu_start(buf: &[u8], at: usize) -> bool {
    if at + 1 >= buf.len() {
        return false;
    }
    let slave_id = buf[at];
    let function = buf[at + 1] & 0x7F;
    (SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave_id) && FunctionCode::from_u8(function).is_some()
}

/// Smallest offset >= 1 at which a plausible RTU frame could start
pub fn find_resync_position(buf: &[u8]) -> Option<usize> {
    (1..buf.len()).find(|&at| is_plausible_rtu_start(buf, at))
}

// ============ Payload decoders ============

/// Big-endian register values from a raw FC03/FC04 response frame
pub fn registers_from_frame(frame: &[u8]) -> Vec<u16> {
    if frame.len() < 3 {
        return Vec::new();
    }
    let byte_count = (frame[2] as usize).min(frame.len() - 3);
    frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Bit values from a raw FC01/FC02 response frame, trimmed to `quantity`
pub fn bits_from_frame(frame: &[u8], quantity: u16) -> Vec<bool> {
    if frame.len() < 3 {
        return Vec::new();
    }
    let byte_count = (frame[2] as usize).min(frame.len() - 3);
    let mut bits = Vec::with_capacity(quantity as usize);
    for (index, &byte) in frame[3..3 + byte_count].iter().enumerate() {
        for bit in 0..8 {
            if index * 8 + bit >= quantity as usize {
                return bits;
            }
            bits.push((byte >> bit) & 1 == 1);
        }
    }
    bits
}
