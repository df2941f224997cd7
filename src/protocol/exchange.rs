//! Request/response exchange over a transport
//!
//! Pipes a transport subscription through the protocol-specific frame
//! scanner and resolves the first frame addressed to the pending request.
//! Each exchange owns its accumulation buffer; dropping the exchange drops
//! the subscription, so cancellation can never leak listeners.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::frame;
use super::scanner::{AsciiScanner, RtuScanner};
use super::{
    ExceptionCode, ExchangeOptions, FunctionCode, ModbusError, Protocol, ReadRequest, Response,
    ResponseData, WriteRequest,
};
use crate::cancel::CancelHandle;
use crate::transport::{Transport, TransportEvent};

/// Lazy chunk sequence over a transport subscription
///
/// Ends on transport close, fails on transport error, and resolves
/// `Cancelled` when the bound handle fires. Chunks arrive in order and are
/// never split or coalesced.
pub struct ByteStream {
    rx: broadcast::Receiver<TransportEvent>,
    cancel: CancelHandle,
    finished: bool,
}

impl ByteStream {
    /// Bind a subscription to a cancel handle
    pub fn new(rx: broadcast::Receiver<TransportEvent>, cancel: CancelHandle) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    /// Pull the next chunk; `Ok(None)` marks the end of the stream
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ModbusError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.finished = true;
                    return Err(ModbusError::Cancelled(self.cancel.reason()));
                }
                event = self.rx.recv() => match event {
                    Ok(TransportEvent::Data(chunk)) => return Ok(Some(chunk)),
                    Ok(TransportEvent::Closed) => {
                        self.finished = true;
                        return Ok(None);
                    }
                    Ok(TransportEvent::Error(message)) => {
                        self.finished = true;
                        return Err(ModbusError::TransportStream(message));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.finished = true;
                        return Ok(None);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped chunks are recovered by scanner resynchronisation
                        warn!(missed, "transport subscriber lagged");
                    }
                }
            }
        }
    }
}

enum FrameScanner {
    Rtu(RtuScanner),
    Ascii(AsciiScanner),
}

/// Lazy sequence of validated frames over a [`ByteStream`]
pub struct FrameStream {
    chunks: ByteStream,
    scanner: FrameScanner,
    ready: VecDeque<Vec<u8>>,
}

impl FrameStream {
    /// Create a frame stream for the given protocol
    pub fn new(chunks: ByteStream, protocol: Protocol) -> Self {
        let scanner = match protocol {
            Protocol::Rtu => FrameScanner::Rtu(RtuScanner::new()),
            Protocol::Ascii => FrameScanner::Ascii(AsciiScanner::new()),
        };
        Self {
            chunks,
            scanner,
            ready: VecDeque::new(),
        }
    }

    /// Pull the next validated frame; `Ok(None)` marks the end of the stream
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ModbusError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            match self.chunks.next_chunk().await? {
                Some(chunk) => {
                    let frames = match &mut self.scanner {
                        FrameScanner::Rtu(scanner) => scanner.push(&chunk),
                        FrameScanner::Ascii(scanner) => scanner.push(&chunk),
                    };
                    self.ready.extend(frames);
                }
                None => return Ok(None),
            }
        }
    }
}

/// Encode a PDU into the on-wire ADU for the given protocol
pub fn encode_adu(protocol: Protocol, pdu: &[u8]) -> Vec<u8> {
    match protocol {
        Protocol::Rtu => frame::wrap_rtu(pdu),
        Protocol::Ascii => frame::wrap_ascii(pdu),
    }
}

/// Whether a frame answers the request identified by `slave` and `function`
///
/// The exception variant (`function | 0x80`) counts as a match.
pub fn matches_request(frame: &[u8], slave: u8, function: u8) -> bool {
    frame.len() >= 2
        && frame[0] == slave
        && (frame[1] == function || (frame[1] & 0x80 != 0 && frame[1] & 0x7F == function))
}

/// Send an ADU and wait for the matching response frame
///
/// Frames from other slaves or for other function codes are skipped. An
/// exception response resolves as `Err(Exception)`; the raw matched frame
/// is returned otherwise. RTU frames include their CRC, ASCII frames are
/// the decoded bytes without the LRC.
pub async fn exchange(
    transport: &mut dyn Transport,
    protocol: Protocol,
    adu: &[u8],
    expected_slave: u8,
    expected_function: u8,
    options: &ExchangeOptions,
) -> Result<Vec<u8>, ModbusError> {
    let cancel = options.cancel.clone().unwrap_or_default();
    if cancel.is_cancelled() {
        return Err(ModbusError::Cancelled(cancel.reason()));
    }
    if !transport.is_connected() {
        return Err(ModbusError::TransportNotConnected);
    }

    // Subscribe before sending so a fast response cannot slip past
    let rx = transport.subscribe();
    transport
        .send(adu)
        .await
        .map_err(|e| ModbusError::TransportSend(e.to_string()))?;
    debug!(
        protocol = protocol.name(),
        slave = expected_slave,
        function = expected_function,
        len = adu.len(),
        "request sent"
    );

    let mut frames = FrameStream::new(ByteStream::new(rx, cancel.clone()), protocol);
    while let Some(frame) = frames.next_frame().await? {
        if !matches_request(&frame, expected_slave, expected_function) {
            trace!(
                slave = frame[0],
                function = frame[1],
                "skipping frame for another request"
            );
            continue;
        }
        if frame[1] & 0x80 != 0 {
            return Err(ModbusError::Exception(ExceptionCode::from_u8(frame[2])));
        }
        return Ok(frame);
    }

    if cancel.is_cancelled() {
        Err(ModbusError::Cancelled(cancel.reason()))
    } else {
        Err(ModbusError::StreamEnded)
    }
}

/// Decode the payload of a matched read response into a [`Response`]
pub fn decode_read_response(request: &ReadRequest, raw: &[u8]) -> Response {
    let data = match request.function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            ResponseData::Coils(frame::bits_from_frame(raw, request.quantity))
        }
        _ => ResponseData::Registers(frame::registers_from_frame(raw)),
    };
    Response {
        slave_id: request.slave_id,
        function: request.function,
        data,
        address: request.address,
        timestamp: Utc::now(),
    }
}

/// Issue a read request and decode the matching response
pub async fn read(
    transport: &mut dyn Transport,
    protocol: Protocol,
    request: &ReadRequest,
    options: &ExchangeOptions,
) -> Result<Response, ModbusError> {
    let pdu = frame::build_read_pdu(request)?;
    let adu = encode_adu(protocol, &pdu);
    let raw = exchange(
        transport,
        protocol,
        &adu,
        request.slave_id,
        request.function as u8,
        options,
    )
    .await?;
    Ok(decode_read_response(request, &raw))
}

/// Issue a write request and wait for its echo
pub async fn write(
    transport: &mut dyn Transport,
    protocol: Protocol,
    request: &WriteRequest,
    options: &ExchangeOptions,
) -> Result<(), ModbusError> {
    let pdu = frame::build_write_pdu(request)?;
    let adu = encode_adu(protocol, &pdu);
    exchange(
        transport,
        protocol,
        &adu,
        request.slave_id,
        request.function as u8,
        options,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_request() {
        assert!(matches_request(&[0x01, 0x03, 0x00], 1, 3));
        assert!(matches_request(&[0x01, 0x83, 0x02], 1, 3));
        assert!(!matches_request(&[0x02, 0x03, 0x00], 1, 3));
        assert!(!matches_request(&[0x01, 0x04, 0x00], 1, 3));
        assert!(!matches_request(&[0x01], 1, 3));
    }

    #[test]
    fn test_encode_adu_per_protocol() {
        let pdu = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(encode_adu(Protocol::Rtu, &pdu).len(), 8);
        assert_eq!(encode_adu(Protocol::Ascii, &pdu), b":010300000001FB\r\n");
    }

    #[test]
    fn test_decode_read_response_registers() {
        let request = ReadRequest::new(1, FunctionCode::ReadHoldingRegisters, 0x10, 2);
        let raw = frame::wrap_rtu(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let response = decode_read_response(&request, &raw);
        assert_eq!(response.slave_id, 1);
        assert_eq!(response.address, 0x10);
        assert_eq!(response.data, ResponseData::Registers(vec![1, 2]));
    }

    #[test]
    fn test_decode_read_response_coils() {
        let request = ReadRequest::new(1, FunctionCode::ReadCoils, 0, 8);
        let raw = frame::wrap_rtu(&[0x01, 0x01, 0x01, 0xA5]);
        let response = decode_read_response(&request, &raw);
        let expected = vec![true, false, true, false, false, true, false, true];
        assert_eq!(response.data, ResponseData::Coils(expected));
    }
}
