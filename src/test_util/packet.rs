use crate::messaging::correlation_id::CorrelationId;
use crate::messaging::packet::{Packet, StatusCode};

pub const TEST_REQUEST_TYPE: u8 = 1;

/// a data packet with the correlation id [CorrelationId::from_u8]
pub fn test_request(id: u8) -> Packet {
    Packet::data(CorrelationId::from_u8(id), TEST_REQUEST_TYPE, &b"request"[..])
}

/// an `Ok` response matching [test_request] with the same id
pub fn test_response(id: u8) -> Packet {
    Packet::response(CorrelationId::from_u8(id), StatusCode::Ok, &b"response"[..])
}

/// a data packet with a payload of the given length
pub fn test_request_with_payload_len(id: u8, payload_len: usize) -> Packet {
    Packet::data(CorrelationId::from_u8(id), TEST_REQUEST_TYPE, vec![0u8; payload_len])
}
