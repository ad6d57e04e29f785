use axl_core::{AxlError, ClusterDescription, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::message::HelloPayload;
use crate::protocol::{Command, FrameHeader};
use crate::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(command: Command, request_id: u64, payload: Option<Bytes>) -> Self {
        let header = FrameHeader::new(command, request_id, payload.as_deref());
        Self { header, payload }
    }

    pub fn new_hello(request_id: u64, hello: &HelloPayload) -> Result<Self> {
        Ok(Self::new(Command::Hello, request_id, Some(to_json(hello)?)))
    }

    pub fn new_hello_ack(request_id: u64) -> Self {
        Self::new(Command::HelloAck, request_id, None)
    }

    pub fn new_ping(request_id: u64) -> Self {
        Self::new(Command::Ping, request_id, None)
    }

    pub fn new_pong(request_id: u64) -> Self {
        Self::new(Command::Pong, request_id, None)
    }

    pub fn new_describe_cluster(request_id: u64) -> Self {
        Self::new(Command::DescribeCluster, request_id, None)
    }

    /// Payload format: JSON-encoded [`ClusterDescription`]
    pub fn new_cluster_description(
        request_id: u64,
        description: &ClusterDescription,
    ) -> Result<Self> {
        Ok(Self::new(
            Command::ClusterDescription,
            request_id,
            Some(to_json(description)?),
        ))
    }

    pub fn new_request(request_id: u64, payload: Bytes) -> Self {
        Self::new(Command::Request, request_id, Some(payload))
    }

    pub fn new_response(request_id: u64, payload: Bytes) -> Self {
        Self::new(Command::Response, request_id, Some(payload))
    }

    pub fn new_error(request_id: u64, message: &str) -> Self {
        Self::new(
            Command::ErrorResponse,
            request_id,
            Some(Bytes::copy_from_slice(message.as_bytes())),
        )
    }

    #[inline]
    #[must_use]
    pub fn command(&self) -> Command {
        self.header.command
    }

    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Payload of an error frame as text
    #[must_use]
    pub fn error_message(&self) -> String {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Decode a JSON payload
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.as_ref().ok_or_else(|| {
            AxlError::Protocol(format!("Empty payload for {:?}", self.header.command))
        })?;
        serde_json::from_slice(payload)
            .map_err(|e| AxlError::Protocol(format!("Invalid JSON payload: {}", e)))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| AxlError::Protocol(format!("JSON encoding failed: {}", e)))
}

/// Parse one frame from the front of `buf`
///
/// Returns `Ok(None)` while the buffer holds less than a full frame, and the
/// number of bytes consumed otherwise.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::parse(buf)?;
    let payload_len = header.payload_length as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(AxlError::PayloadTooLarge(payload_len));
    }

    let total_len = FRAME_HEADER_SIZE + payload_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = if payload_len > 0 {
        let payload_bytes = &buf[FRAME_HEADER_SIZE..total_len];
        header.validate_payload(payload_bytes)?;
        Some(Bytes::copy_from_slice(payload_bytes))
    } else {
        None
    };

    Ok(Some((Frame { header, payload }, total_len)))
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let header_bytes = frame.header.encode();
    let payload_len = frame.payload.as_ref().map_or(0, Bytes::len);

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload_len);
    buf.extend_from_slice(&header_bytes);

    if let Some(ref payload) = frame.payload {
        buf.extend_from_slice(payload);
    }

    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axl_core::{ClusterMember, NodeRole};

    #[test]
    fn test_request_frame_roundtrip() {
        let payload = Bytes::from_static(b"GetItem");
        let frame = Frame::new_request(7, payload.clone());

        let encoded = encode_frame(&frame);
        let (parsed, len) = parse_frame(&encoded).unwrap().unwrap();

        assert_eq!(len, encoded.len());
        assert_eq!(parsed.command(), Command::Request);
        assert_eq!(parsed.request_id(), 7);
        assert_eq!(parsed.payload.unwrap(), payload);
    }

    #[test]
    fn test_partial_frame() {
        let frame = Frame::new_request(1, Bytes::from_static(b"abcdef"));
        let encoded = encode_frame(&frame);

        assert!(parse_frame(&encoded[..FRAME_HEADER_SIZE - 1]).unwrap().is_none());
        assert!(parse_frame(&encoded[..FRAME_HEADER_SIZE + 2]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode_frame(&Frame::new_ping(1));
        buf.extend_from_slice(&encode_frame(&Frame::new_pong(2)));

        let (first, used) = parse_frame(&buf).unwrap().unwrap();
        let (second, _) = parse_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(first.command(), Command::Ping);
        assert_eq!(second.command(), Command::Pong);
        assert_eq!(second.request_id(), 2);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut encoded = encode_frame(&Frame::new_request(3, Bytes::from_static(b"xyz")));
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(matches!(
            parse_frame(&encoded),
            Err(AxlError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_cluster_description_payload() {
        let desc = ClusterDescription {
            members: vec![
                ClusterMember::new("node1", 8111, NodeRole::Leader),
                ClusterMember::new("node2", 8111, NodeRole::Replica),
            ],
        };
        let frame = Frame::new_cluster_description(9, &desc).unwrap();
        let (parsed, _) = parse_frame(&encode_frame(&frame)).unwrap().unwrap();

        let decoded: ClusterDescription = parsed.decode_json().unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn test_error_message() {
        let frame = Frame::new_error(4, "throttled");
        assert_eq!(frame.error_message(), "throttled");
        assert_eq!(Frame::new_ping(1).error_message(), "Unknown error");
    }
}
