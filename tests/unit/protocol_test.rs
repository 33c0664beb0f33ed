//! Tests for the bundled wire protocols

use bytes::{Bytes, BytesMut};
use team_kernel::core::KernelError;
use team_kernel::infra::{
    CommunicationProtocol, HttpProtocol, HttpRequest, HttpResponse, LineProtocol, ProtocolDecoder,
};

#[test]
fn test_http_request_split_across_reads() {
    let protocol = HttpProtocol::default();
    let mut decoder = protocol.new_decoder();
    let wire = HttpProtocol::encode_request(
        &HttpRequest::new("POST", "/items", Bytes::from_static(b"{\"id\":1}"))
            .with_header("Content-Type", "application/json"),
    );

    let mut input = BytesMut::new();
    let (head, tail) = wire.split_at(wire.len() - 3);
    input.extend_from_slice(head);
    assert_eq!(decoder.decode(&mut input).unwrap(), None);

    input.extend_from_slice(tail);
    let request = decoder.decode(&mut input).unwrap().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/items");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(&request.body[..], b"{\"id\":1}");
    assert!(input.is_empty());
}

#[test]
fn test_http_response_encoding_respects_write_buffer_size() {
    let protocol = HttpProtocol::default();
    let response = HttpResponse::ok(vec![b'x'; 100]).with_header("Content-Type", "text/plain");
    let chunks = protocol.encode(&response, 32);
    assert!(chunks.iter().all(|c| c.len() <= 32));

    let mut wire = BytesMut::new();
    for chunk in chunks {
        wire.extend_from_slice(&chunk);
    }
    let decoded = HttpProtocol::decode_response(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.status, 200);
    assert_eq!(decoded.body.len(), 100);
}

#[test]
fn test_http_rejects_oversized_head() {
    let protocol = HttpProtocol::with_max_head(64);
    let mut decoder = protocol.new_decoder();
    let mut input = BytesMut::from(&[b'a'; 128][..]);
    assert!(matches!(
        decoder.decode(&mut input),
        Err(KernelError::Protocol(_))
    ));
}

#[test]
fn test_line_protocol_round_trip() {
    let protocol = LineProtocol::default();
    let mut decoder = protocol.new_decoder();
    let mut input = BytesMut::from(&b"PING\r\nECHO hi\n"[..]);
    let lines = decoder.decode_all(&mut input).unwrap();
    assert_eq!(lines, vec!["PING".to_string(), "ECHO hi".to_string()]);

    let encoded = protocol.encode(&"PONG".to_string(), 1024);
    assert_eq!(encoded.concat(), b"PONG\n".to_vec());
}

#[test]
fn test_line_failure_response_names_the_failure() {
    let protocol = LineProtocol::default();
    let failure = anyhow::anyhow!("db offline");
    assert_eq!(protocol.failure_response(Some(&failure)), "ERR db offline");
    assert_eq!(protocol.failure_response(None), "ERR no response");
}
