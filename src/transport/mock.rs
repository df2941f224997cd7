//! In-memory loopback transport for tests, demos and CI
//!
//! Records everything the engine sends and lets the driving side inject
//! inbound bytes, errors and close events through a [`MockHandle`].

use super::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Clonable handle for driving a [`MockTransport`] from the outside
#[derive(Debug, Clone)]
pub struct MockHandle {
    tx: broadcast::Sender<TransportEvent>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockHandle {
    /// Inject inbound bytes as one chunk
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.tx.send(TransportEvent::Data(Bytes::copy_from_slice(bytes)));
    }

    /// Inject a stream error
    pub fn inject_error(&self, message: &str) {
        let _ = self.tx.send(TransportEvent::Error(message.to_string()));
    }

    /// Inject a close event
    pub fn inject_close(&self) {
        let _ = self.tx.send(TransportEvent::Closed);
    }

    /// All frames sent through the transport so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// The most recently sent frame
    pub fn last_written(&self) -> Option<Vec<u8>> {
        self.written.lock().last().cloned()
    }

    /// Forget recorded frames
    pub fn clear_written(&self) {
        self.written.lock().clear();
    }
}

/// In-memory transport
pub struct MockTransport {
    connected: bool,
    fail_sends: bool,
    tx: broadcast::Sender<TransportEvent>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTransport {
    /// Create a new, disconnected mock transport
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            connected: false,
            fail_sends: false,
            tx,
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get a handle for injecting events and inspecting sent data
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            tx: self.tx.clone(),
            written: self.written.clone(),
        }
    }

    /// Make subsequent `send` calls fail
    pub fn fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            self.connected = false;
            let _ = self.tx.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends {
            return Err(TransportError::SendError("mock send failure".to_string()));
        }
        self.written.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    fn connection_info(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_sent_frames() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.unwrap();
        transport.send(&[0x01, 0x02]).await.unwrap();
        transport.send(&[0x03]).await.unwrap();
        assert_eq!(handle.written(), vec![vec![0x01, 0x02], vec![0x03]]);
        assert_eq!(handle.last_written(), Some(vec![0x03]));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = MockTransport::new();
        assert!(matches!(
            transport.send(&[0x00]).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_injected_data_reaches_subscriber() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut rx = transport.subscribe();
        handle.inject(&[0xAA, 0xBB]);
        match rx.recv().await.unwrap() {
            TransportEvent::Data(bytes) => assert_eq!(&bytes[..], [0xAA, 0xBB]),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
