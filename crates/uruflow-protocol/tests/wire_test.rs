//! Wire-level protocol tests against literal byte sequences

use uruflow_protocol::frame::{decode_header, encode_header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use uruflow_protocol::message::{AuthOkPayload, AuthPayload, MetricsPayload, SystemMetrics};
use uruflow_protocol::{Connection, Message, MessageKind, ProtocolError};

fn pair() -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Connection::new(Box::new(a)), Connection::new(Box::new(b)))
}

#[test]
fn auth_frame_layout_matches_wire_format() {
    let payload = serde_json::to_vec(&AuthPayload {
        token: "T".to_string(),
        hostname: "h".to_string(),
        ip: None,
        version: "1.0.0".to_string(),
    })
    .unwrap();

    let header = encode_header(MessageKind::Auth, payload.len() as u32);
    assert_eq!(header[0], 0x55);
    assert_eq!(header[1], 0x46);
    assert_eq!(header[2], 0x01);
    assert_eq!(header[3], 0x01);
    assert_eq!(
        u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize,
        payload.len()
    );
}

#[tokio::test]
async fn handshake_frames_roundtrip() {
    let (worker, coordinator) = pair();

    let auth = Message::new(
        MessageKind::Auth,
        &AuthPayload {
            token: "T".to_string(),
            hostname: "h".to_string(),
            ip: None,
            version: "1.0.0".to_string(),
        },
    )
    .unwrap();
    worker.send(&auth).await.unwrap();

    let received = coordinator.receive().await.unwrap();
    assert_eq!(received.kind, MessageKind::Auth);
    let decoded: AuthPayload = received.decode().unwrap();
    assert_eq!(decoded.token, "T");

    let ok = Message::new(
        MessageKind::AuthOk,
        &AuthOkPayload {
            agent_id: "W1".to_string(),
            name: "prod".to_string(),
            server_version: "1.0.0".to_string(),
        },
    )
    .unwrap();
    coordinator.send(&ok).await.unwrap();

    let reply = worker.receive().await.unwrap();
    assert_eq!(reply.kind, MessageKind::AuthOk);
    let decoded: AuthOkPayload = reply.decode().unwrap();
    assert_eq!(decoded.agent_id, "W1");
    assert_eq!(decoded.name, "prod");
}

#[tokio::test]
async fn concatenated_frames_do_not_cross_contaminate() {
    let (left, right) = pair();

    let metrics = Message::new(
        MessageKind::Metrics,
        &MetricsPayload {
            timestamp: 100,
            system: SystemMetrics {
                cpu_percent: 42.5,
                ..Default::default()
            },
            containers: vec![],
        },
    )
    .unwrap();

    // Both frames land in the pipe before the first read
    left.send(&metrics).await.unwrap();
    left.send(&Message::disconnect()).await.unwrap();

    let first = right.receive().await.unwrap();
    assert_eq!(first, metrics);
    let decoded: MetricsPayload = first.decode().unwrap();
    assert_eq!(decoded.system.cpu_percent, 42.5);

    let second = right.receive().await.unwrap();
    assert_eq!(second.kind, MessageKind::Disconnect);
    assert!(second.payload.is_empty());
}

#[test]
fn oversized_length_is_rejected_from_header_alone() {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = 0x55;
    header[1] = 0x46;
    header[2] = 0x01;
    header[3] = 0x10;
    header[4..8].copy_from_slice(&(16 * 1024 * 1024u32 + 1).to_be_bytes());

    match decode_header(&header) {
        Err(ProtocolError::PayloadTooLarge { size, max }) => {
            assert_eq!(size, MAX_PAYLOAD_SIZE + 1);
            assert_eq!(max, MAX_PAYLOAD_SIZE);
        }
        other => panic!("expected PayloadTooLarge, got {:?}", other),
    }
}

#[test]
fn encoder_rejects_oversized_payload() {
    // The JSON quoting pushes this over the cap; the encoder must refuse
    // before the frame ever reaches a writer
    let blob = "a".repeat(MAX_PAYLOAD_SIZE);
    let result = Message::new(MessageKind::Metrics, &blob);
    assert!(matches!(
        result,
        Err(ProtocolError::PayloadTooLarge { .. })
    ));
}
