//! Client facade tests: busy gating, cancellation, recovery, monitoring

use std::sync::Arc;
use std::time::Duration;

use modmon_core::protocol::frame::wrap_rtu;
use modmon_core::{
    CancelHandle, ClientEvent, ExceptionCode, ExchangeOptions, FunctionCode, MockHandle,
    MockTransport, ModbusClient, ModbusError, Protocol, ReadRequest, ResponseData, WriteRequest,
    WriteValue,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn connected_client(protocol: Protocol) -> (Arc<ModbusClient>, MockHandle) {
    let transport = MockTransport::new();
    let handle = transport.handle();
    let client = Arc::new(ModbusClient::new(Box::new(transport), protocol));
    client.connect().await.unwrap();
    (client, handle)
}

fn holding_read(quantity: u16) -> ReadRequest {
    ReadRequest::new(1, FunctionCode::ReadHoldingRegisters, 0, quantity)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn read_completes_through_the_pump() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(2), ExchangeOptions::default()).await })
    };
    settle().await;
    assert_eq!(
        handle.last_written(),
        Some(vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
    );

    handle.inject(&wrap_rtu(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]));
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![1, 2]));
}

#[tokio::test]
async fn second_request_is_busy_until_cancel() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let cancel = CancelHandle::new();
    let first = {
        let client = client.clone();
        let options = ExchangeOptions::with_cancel(cancel.clone());
        tokio::spawn(async move { client.read(holding_read(1), options).await })
    };
    settle().await;
    assert_eq!(handle.written().len(), 1);

    // Second read rejected without touching the transport
    let second = client
        .read(holding_read(1), ExchangeOptions::default())
        .await;
    assert_eq!(second.unwrap_err(), ModbusError::Busy);
    assert_eq!(handle.written().len(), 1);

    // Writes are gated by the same slot
    let write = client
        .write(
            WriteRequest::new(1, FunctionCode::WriteSingleCoil, 0, WriteValue::Coil(true)),
            ExchangeOptions::default(),
        )
        .await;
    assert_eq!(write.unwrap_err(), ModbusError::Busy);

    cancel.cancel();
    let first = tokio::time::timeout(TEST_TIMEOUT, first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.unwrap_err(), ModbusError::Cancelled(None));

    // The slot is free again
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;
    handle.inject(&wrap_rtu(&[0x01, 0x03, 0x02, 0x00, 0x0A]));
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![10]));
}

#[tokio::test]
async fn handle_response_feeds_the_scanner_directly() {
    let (client, _handle) = connected_client(Protocol::Rtu).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(2), ExchangeOptions::default()).await })
    };
    settle().await;

    client.handle_response(&wrap_rtu(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]));
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![1, 2]));
}

#[tokio::test]
async fn rtu_recovery_shifts_past_noise() {
    let (client, _handle) = connected_client(Protocol::Rtu).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(2), ExchangeOptions::default()).await })
    };
    settle().await;

    // Noise first; the one-shot resynchronisation lands on the real frame
    let mut noisy = vec![0xFF, 0xFF, 0x00];
    noisy.extend_from_slice(&wrap_rtu(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]));
    client.handle_response(&noisy);

    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![1, 2]));
}

#[tokio::test]
async fn idle_noise_recovers_like_the_stream_scanner() {
    let (client, _handle) = connected_client(Protocol::Rtu).await;
    let response = wrap_rtu(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);

    // Garbage plus the first response bytes arrive with no request pending;
    // the buffer must skip forward byte by byte, not be wiped wholesale
    let mut early = vec![0x00, 0x00, 0x00, 0x00, 0x00];
    early.extend_from_slice(&response[..2]);
    client.handle_response(&early);

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(2), ExchangeOptions::default()).await })
    };
    settle().await;

    client.handle_response(&response[2..]);
    let decoded = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(decoded.data, ResponseData::Registers(vec![1, 2]));
}

#[tokio::test]
async fn unmatched_frames_are_ignored() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    // No pending request: a stray frame must be dropped without effect
    client.handle_response(&wrap_rtu(&[0x01, 0x03, 0x02, 0x00, 0x0A]));

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;

    // Wrong slave, then the matching response
    handle.inject(&wrap_rtu(&[0x02, 0x03, 0x02, 0x00, 0x63]));
    handle.inject(&wrap_rtu(&[0x01, 0x03, 0x02, 0x00, 0x0A]));
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![10]));
}

#[tokio::test]
async fn exception_rejects_and_emits_error_event() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let mut events = client.subscribe();
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;
    handle.inject(&wrap_rtu(&[0x01, 0x83, 0x02]));

    let result = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result.unwrap_err(),
        ModbusError::Exception(ExceptionCode::IllegalDataAddress)
    );

    // request-outbound first, then the error
    let mut saw_error = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if let ClientEvent::Error(error) = event {
            assert_eq!(
                error,
                ModbusError::Exception(ExceptionCode::IllegalDataAddress)
            );
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn write_resolves_on_echo() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .write(
                    WriteRequest::new(
                        1,
                        FunctionCode::WriteSingleRegister,
                        1,
                        WriteValue::Register(3),
                    ),
                    ExchangeOptions::default(),
                )
                .await
        })
    };
    settle().await;
    assert_eq!(
        handle.last_written(),
        Some(vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B])
    );
    handle.inject(&wrap_rtu(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]));
    tokio::time::timeout(TEST_TIMEOUT, writer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn ascii_round_trip_through_client() {
    let (client, handle) = connected_client(Protocol::Ascii).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;
    assert_eq!(handle.last_written(), Some(b":010300000001FB\r\n".to_vec()));

    handle.inject(b":010302000AF0\r\n");
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![10]));
}

#[tokio::test]
async fn ascii_truncated_exception_is_skipped() {
    let (client, handle) = connected_client(Protocol::Ascii).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;

    // Checksum-correct exception frame missing its code byte, then the
    // real response; the short frame must be skipped, not delivered
    handle.inject(b":01837C\r\n");
    handle.inject(b":010302000AF0\r\n");
    let response = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, ResponseData::Registers(vec![10]));
}

#[tokio::test]
async fn transport_close_fails_the_pending_request() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(holding_read(1), ExchangeOptions::default()).await })
    };
    settle().await;
    handle.inject_close();

    let result = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), ModbusError::StreamEnded);
}

#[tokio::test]
async fn set_protocol_requires_an_idle_slot() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let cancel = CancelHandle::new();
    let reader = {
        let client = client.clone();
        let options = ExchangeOptions::with_cancel(cancel.clone());
        tokio::spawn(async move { client.read(holding_read(1), options).await })
    };
    settle().await;

    assert_eq!(client.set_protocol(Protocol::Ascii), Err(ModbusError::Busy));
    assert_eq!(client.protocol(), Protocol::Rtu);

    cancel.cancel();
    tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    client.set_protocol(Protocol::Ascii).unwrap();
    assert_eq!(client.protocol(), Protocol::Ascii);
    drop(handle);
}

#[tokio::test]
async fn cancelled_before_send_leaves_transport_untouched() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let cancel = CancelHandle::new();
    cancel.cancel_with_reason("shutting down");

    let result = client
        .read(holding_read(1), ExchangeOptions::with_cancel(cancel))
        .await;
    assert_eq!(
        result.unwrap_err(),
        ModbusError::Cancelled(Some("shutting down".to_string()))
    );
    assert!(handle.written().is_empty());
}

#[tokio::test]
async fn monitor_polls_and_stops() {
    let (client, handle) = connected_client(Protocol::Rtu).await;
    let mut events = client.subscribe();

    // Responder: answer every outbound request with a fixed response
    let responder = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut answered = 0usize;
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let outstanding = handle.written().len();
                while answered < outstanding {
                    handle.inject(&wrap_rtu(&[0x01, 0x03, 0x02, 0x00, 0x0A]));
                    answered += 1;
                }
            }
        })
    };

    client.start_monitoring(holding_read(1), Duration::from_millis(25));
    assert!(client.is_monitoring());

    let mut responses = 0;
    while responses < 2 {
        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ClientEvent::Response(response) = event {
            assert_eq!(response.data, ResponseData::Registers(vec![10]));
            responses += 1;
        }
    }

    client.stop_monitoring();
    assert!(!client.is_monitoring());
    responder.abort();

    // No further polls are scheduled after stopping
    tokio::time::sleep(Duration::from_millis(80)).await;
    let after_stop = handle.written().len();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(handle.written().len(), after_stop);
}

#[tokio::test]
async fn stop_monitoring_is_idempotent() {
    let (client, _handle) = connected_client(Protocol::Rtu).await;
    assert!(!client.is_monitoring());
    client.stop_monitoring();
    client.stop_monitoring();
    assert!(!client.is_monitoring());
}
