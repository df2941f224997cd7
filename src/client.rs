//! High-level Modbus master client
//!
//! A [`ModbusClient`] owns a transport, a protocol selection and at most one
//! in-flight request. Inbound bytes reach the per-protocol scan buffer either
//! through the internal pump task subscribed to the transport or directly via
//! [`ModbusClient::handle_response`]; the frame that matches the pending
//! request resolves the caller's future. An optional monitor task repeats a
//! read on a fixed interval and publishes the results on the client's event
//! channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::exchange::{decode_read_response, encode_adu};
use crate::protocol::{
    frame, ExceptionCode, ExchangeOptions, FunctionCode, ModbusError, Protocol, ReadRequest,
    Response, ResponseData, WriteRequest,
};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Events published by a [`ModbusClient`]
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Encoded request bytes were handed to the transport
    RequestOutbound(Bytes),
    /// A read or write completed with a decoded response
    Response(Response),
    /// A request failed
    Error(ModbusError),
}

/// What the pending request is waiting for
enum PendingKind {
    Read(ReadRequest),
    Write {
        slave_id: u8,
        function: FunctionCode,
        address: u16,
    },
}

impl PendingKind {
    fn slave_id(&self) -> u8 {
        match self {
            PendingKind::Read(request) => request.slave_id,
            PendingKind::Write { slave_id, .. } => *slave_id,
        }
    }

    fn function(&self) -> FunctionCode {
        match self {
            PendingKind::Read(request) => request.function,
            PendingKind::Write { function, .. } => *function,
        }
    }
}

/// The single in-flight request slot
///
/// `None` is the idle state; installing a request moves the facade to
/// awaiting, and taking the slot to complete or cancel it returns to idle.
struct PendingRequest {
    kind: PendingKind,
    completion: oneshot::Sender<Result<Response, ModbusError>>,
}

struct MonitorHandle {
    stop: CancellationToken,
}

struct ClientInner {
    protocol: Mutex<Protocol>,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    pending: Mutex<Option<PendingRequest>>,
    rtu_buffer: Mutex<Vec<u8>>,
    ascii_buffer: Mutex<String>,
    events: broadcast::Sender<ClientEvent>,
    monitor: Mutex<Option<MonitorHandle>>,
    shutdown: CancellationToken,
}

/// Stateful Modbus master facade over a single transport
pub struct ModbusClient {
    inner: Arc<ClientInner>,
}

impl ModbusClient {
    /// Create a client over the given transport
    pub fn new(transport: Box<dyn Transport>, protocol: Protocol) -> Self {
        let (events, _) = broadcast::channel(256);
        let rx = transport.subscribe();
        let inner = Arc::new(ClientInner {
            protocol: Mutex::new(protocol),
            transport: tokio::sync::Mutex::new(transport),
            pending: Mutex::new(None),
            rtu_buffer: Mutex::new(Vec::new()),
            ascii_buffer: Mutex::new(String::new()),
            events,
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::pump(inner.clone(), rx));

        Self { inner }
    }

    /// Connect the underlying transport
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.transport.lock().await.connect().await
    }

    /// Disconnect the underlying transport
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.transport.lock().await.disconnect().await
    }

    /// Whether the underlying transport is connected
    pub async fn is_connected(&self) -> bool {
        self.inner.transport.lock().await.is_connected()
    }

    /// Human-readable description of the underlying connection
    pub async fn connection_info(&self) -> String {
        self.inner.transport.lock().await.connection_info()
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Currently selected protocol
    pub fn protocol(&self) -> Protocol {
        *self.inner.protocol.lock()
    }

    /// Select the protocol; only legal while no request is pending
    pub fn set_protocol(&self, protocol: Protocol) -> Result<(), ModbusError> {
        if self.inner.pending.lock().is_some() {
            return Err(ModbusError::Busy);
        }
        *self.inner.protocol.lock() = protocol;
        // A protocol switch invalidates any partial frame data
        self.inner.rtu_buffer.lock().clear();
        self.inner.ascii_buffer.lock().clear();
        Ok(())
    }

    /// Issue a read and wait for the decoded response
    pub async fn read(
        &self,
        request: ReadRequest,
        options: ExchangeOptions,
    ) -> Result<Response, ModbusError> {
        Self::read_on(&self.inner, request, options).await
    }

    /// Issue a write and wait for its echo
    pub async fn write(
        &self,
        request: WriteRequest,
        options: ExchangeOptions,
    ) -> Result<(), ModbusError> {
        let pdu = frame::build_write_pdu(&request)?;
        let kind = PendingKind::Write {
            slave_id: request.slave_id,
            function: request.function,
            address: request.address,
        };
        let result = Self::run_request(&self.inner, pdu, kind, options).await;
        match &result {
            Ok(response) => {
                let _ = self
                    .inner
                    .events
                    .send(ClientEvent::Response(response.clone()));
            }
            Err(error) => {
                let _ = self.inner.events.send(ClientEvent::Error(error.clone()));
            }
        }
        result.map(|_| ())
    }

    /// Feed inbound bytes through the per-protocol scan buffer
    ///
    /// This is the out-of-band entry point for callers that receive bytes
    /// themselves; the internal pump task uses the same path.
    pub fn handle_response(&self, bytes: &[u8]) {
        self.inner.ingest(bytes);
    }

    /// Poll `request` every `interval`, publishing results as events
    ///
    /// A running monitor is stopped first. Stopping a monitor only prevents
    /// the next scheduled read; a read already in flight runs to completion.
    pub fn start_monitoring(&self, request: ReadRequest, interval: Duration) {
        self.stop_monitoring();

        let stop = CancellationToken::new();
        *self.inner.monitor.lock() = Some(MonitorHandle { stop: stop.clone() });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Deliberately not raced against the stop token: cancelling
                // a monitor only skips reads that have not started yet.
                if let Err(error) =
                    Self::read_on(&inner, request.clone(), ExchangeOptions::default()).await
                {
                    debug!(%error, "poll cycle failed");
                }
            }
        });
    }

    /// Stop the monitor if one is running; a no-op otherwise
    pub fn stop_monitoring(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop.cancel();
        }
    }

    /// Whether a monitor task is currently installed
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().is_some()
    }

    async fn read_on(
        inner: &Arc<ClientInner>,
        request: ReadRequest,
        options: ExchangeOptions,
    ) -> Result<Response, ModbusError> {
        let pdu = frame::build_read_pdu(&request)?;
        let kind = PendingKind::Read(request);
        let result = Self::run_request(inner, pdu, kind, options).await;
        match &result {
            Ok(response) => {
                let _ = inner.events.send(ClientEvent::Response(response.clone()));
            }
            Err(error) => {
                let _ = inner.events.send(ClientEvent::Error(error.clone()));
            }
        }
        result
    }

    async fn run_request(
        inner: &Arc<ClientInner>,
        pdu: Vec<u8>,
        kind: PendingKind,
        options: ExchangeOptions,
    ) -> Result<Response, ModbusError> {
        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled(cancel.reason()));
        }

        let protocol = *inner.protocol.lock();
        let adu = encode_adu(protocol, &pdu);

        let (completion, waiter) = oneshot::channel();
        {
            let mut pending = inner.pending.lock();
            if pending.is_some() {
                return Err(ModbusError::Busy);
            }
            *pending = Some(PendingRequest { kind, completion });
        }

        // The slot is reserved; every early exit below must release it.
        let send_result = {
            let mut transport = inner.transport.lock().await;
            if transport.is_connected() {
                let _ = inner
                    .events
                    .send(ClientEvent::RequestOutbound(Bytes::copy_from_slice(&adu)));
                transport
                    .send(&adu)
                    .await
                    .map(|_| ())
                    .map_err(|e| ModbusError::TransportSend(e.to_string()))
            } else {
                Err(ModbusError::TransportNotConnected)
            }
        };
        if let Err(error) = send_result {
            inner.pending.lock().take();
            return Err(error);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                inner.pending.lock().take();
                Err(ModbusError::Cancelled(cancel.reason()))
            }
            outcome = waiter => match outcome {
                Ok(result) => result,
                // Completion sender dropped without a verdict (client shut down)
                Err(_) => Err(ModbusError::StreamEnded),
            }
        }
    }

    async fn pump(inner: Arc<ClientInner>, mut rx: broadcast::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(TransportEvent::Data(chunk)) => inner.ingest(&chunk),
                    Ok(TransportEvent::Closed) => {
                        inner.rtu_buffer.lock().clear();
                        inner.ascii_buffer.lock().clear();
                        inner.fail_pending(ModbusError::StreamEnded);
                    }
                    Ok(TransportEvent::Error(message)) => {
                        inner.fail_pending(ModbusError::TransportStream(message));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "client pump lagged behind the transport");
                    }
                }
            }
        }
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl ClientInner {
    fn ingest(&self, bytes: &[u8]) {
        match *self.protocol.lock() {
            Protocol::Rtu => self.pump_rtu(bytes),
            Protocol::Ascii => self.pump_ascii(bytes),
        }
    }

    /// One scan pass over the RTU buffer
    ///
    /// A checksum miss while a request is pending triggers a single
    /// resynchronisation scan and one retry; if that also fails, or no
    /// plausible start exists, the whole buffer is dropped. With no request
    /// pending the buffer recovers like the stream scanner, one byte at a
    /// time.
    fn pump_rtu(&self, bytes: &[u8]) {
        let mut guard = self.rtu_buffer.lock();
        let buffer = &mut *guard;
        buffer.extend_from_slice(bytes);
        let mut resynced = false;

        while buffer.len() >= frame::MIN_RTU_FRAME_LEN {
            let Some(expected) = frame::expected_rtu_length(buffer) else {
                if !self.recover_rtu(buffer, &mut resynced) {
                    break;
                }
                continue;
            };
            if buffer.len() < expected {
                break;
            }
            if frame::parse_rtu(&buffer[..expected]).is_ok() {
                let raw: Vec<u8> = buffer.drain(..expected).collect();
                self.deliver_frame(&raw);
            } else if !self.recover_rtu(buffer, &mut resynced) {
                break;
            }
        }
    }

    fn recover_rtu(&self, buffer: &mut Vec<u8>, resynced: &mut bool) -> bool {
        if self.pending.lock().is_none() {
            // Nothing to recover for; scan forward like the stream scanner
            trace!("resync: dropping byte {:02X}", buffer[0]);
            buffer.drain(..1);
            return true;
        }
        if !*resynced {
            if let Some(position) = frame::find_resync_position(buffer) {
                debug!(dropped = position, "RTU resynchronisation");
                buffer.drain(..position);
                *resynced = true;
                return true;
            }
        }
        trace!(dropped = buffer.len(), "RTU buffer cleared");
        buffer.clear();
        false
    }

    /// One scan pass over the ASCII buffer
    ///
    /// An LRC miss drops the buffer and accumulator entirely; other
    /// malformed candidates are skipped past their CRLF.
    fn pump_ascii(&self, bytes: &[u8]) {
        let mut guard = self.ascii_buffer.lock();
        let buffer = &mut *guard;
        buffer.push_str(&String::from_utf8_lossy(bytes));

        loop {
            let Some(start) = buffer.find(':') else {
                buffer.clear();
                break;
            };
            let Some(offset) = buffer[start..].find("\r\n") else {
                buffer.drain(..start);
                break;
            };
            let end = start + offset + 2;
            match frame::decode_ascii_frame(&buffer[start..end]) {
                Ok(decoded) => {
                    buffer.drain(..end);
                    self.deliver_frame(&decoded);
                }
                Err(frame::FrameError::BadLrc) => {
                    trace!("LRC failure, dropping ASCII accumulator");
                    buffer.clear();
                    break;
                }
                Err(error) => {
                    trace!(%error, "skipping malformed ASCII candidate");
                    buffer.drain(..end);
                }
            }
        }
    }

    /// Complete the pending request if `raw` answers it
    fn deliver_frame(&self, raw: &[u8]) {
        let taken = {
            let mut pending = self.pending.lock();
            let Some(current) = pending.as_ref() else {
                trace!("frame arrived with no pending request");
                return;
            };
            let expected_function = current.kind.function() as u8;
            if raw[0] != current.kind.slave_id()
                || !(raw[1] == expected_function
                    || (raw[1] & 0x80 != 0 && raw[1] & 0x7F == expected_function))
            {
                trace!(
                    slave = raw[0],
                    function = raw[1],
                    "skipping frame for another request"
                );
                return;
            }
            pending.take()
        };

        let Some(request) = taken else { return };
        let result = if raw[1] & 0x80 != 0 {
            Err(ModbusError::Exception(ExceptionCode::from_u8(raw[2])))
        } else {
            match &request.kind {
                PendingKind::Read(read) => Ok(decode_read_response(read, raw)),
                PendingKind::Write {
                    slave_id,
                    function,
                    address,
                } => Ok(Response {
                    slave_id: *slave_id,
                    function: *function,
                    data: ResponseData::Echo,
                    address: *address,
                    timestamp: Utc::now(),
                }),
            }
        };
        let _ = request.completion.send(result);
    }

    /// Fail the pending request, if any, with `error`
    fn fail_pending(&self, error: ModbusError) {
        if let Some(request) = self.pending.lock().take() {
            let _ = request.completion.send(Err(error));
        }
    }
}
