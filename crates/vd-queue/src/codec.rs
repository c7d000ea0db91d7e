//! Length-prefixed packet frames: 4-byte big-endian body length, then JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use vd_common::Packet;

use crate::{QueueError, Result};

const HEADER_LEN: usize = 4;

pub fn encode_packet(packet: &Packet) -> Result<Bytes> {
    let body = serde_json::to_vec(packet)?;
    let len = u32::try_from(body.len())
        .map_err(|_| QueueError::Frame(format!("packet of {} bytes exceeds frame limit", body.len())))?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u32(len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    if frame.len() < HEADER_LEN {
        return Err(QueueError::Frame(format!("frame too short: {} bytes", frame.len())));
    }
    let mut buf = frame;
    let len = buf.get_u32() as usize;
    if buf.remaining() != len {
        return Err(QueueError::Frame(format!(
            "declared length {} does not match body length {}",
            len,
            buf.remaining()
        )));
    }
    Ok(serde_json::from_slice(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_is_big_endian_body_length() {
        let packet = Packet::new("s", 3, json!({"text": "hello"}));
        let frame = encode_packet(&packet).unwrap();
        let body_len = frame.len() - HEADER_LEN;
        assert_eq!(&frame[..HEADER_LEN], &(body_len as u32).to_be_bytes());
        assert_eq!(decode_packet(&frame).unwrap(), packet);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let packet = Packet::new("s", 1, json!({}));
        let frame = encode_packet(&packet).unwrap();
        let err = decode_packet(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, QueueError::Frame(_)));

        assert!(matches!(decode_packet(&[0, 0]), Err(QueueError::Frame(_))));
    }

    #[test]
    fn test_garbage_body_is_serialization_error() {
        let mut frame = 3u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"{{{");
        assert!(matches!(decode_packet(&frame), Err(QueueError::Serialization(_))));
    }
}
