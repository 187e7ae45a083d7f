//! Application frame envelope: `[sequence: u32 BE][payload]`.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Size of the sequence header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Sequence number carried by messages that expect no reply.
pub const UNCORRELATED: u32 = 0;

/// Append a frame (`seq` followed by `payload`) to `dst`.
///
/// Existing contents of `dst` are kept; the frame is written after them.
pub fn append_frame(dst: &mut Vec<u8>, seq: u32, payload: &[u8]) {
    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_u32(seq);
    dst.extend_from_slice(payload);
}

/// Split a frame into its sequence number and payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] if `buf` is shorter than the header.
pub fn parse_frame(buf: &[u8]) -> Result<(u32, &[u8])> {
    let Some((header, payload)) = buf.split_first_chunk::<FRAME_HEADER_SIZE>() else {
        return Err(ProtocolError::Truncated { needed: FRAME_HEADER_SIZE, actual: buf.len() });
    };

    Ok((u32::from_be_bytes(*header), payload))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn header_is_big_endian() {
        let mut buf = Vec::new();
        append_frame(&mut buf, 0x0102_0304, b"abc");
        assert_eq!(buf, [1, 2, 3, 4, b'a', b'b', b'c']);
    }

    #[test]
    fn append_keeps_existing_bytes() {
        let mut buf = vec![0xff];
        append_frame(&mut buf, 7, b"");
        assert_eq!(buf, [0xff, 0, 0, 0, 7]);
    }

    #[test]
    fn empty_payload_parses() {
        let (seq, payload) = parse_frame(&[0, 0, 0, 9]).unwrap();
        assert_eq!(seq, 9);
        assert!(payload.is_empty());
    }

    #[test]
    fn short_buffer_is_truncated() {
        for len in 0..FRAME_HEADER_SIZE {
            let buf = vec![0u8; len];
            assert!(matches!(
                parse_frame(&buf),
                Err(ProtocolError::Truncated { needed: FRAME_HEADER_SIZE, actual }) if actual == len
            ));
        }
    }

    proptest! {
        #[test]
        fn parse_inverts_append(seq in any::<u32>(), payload in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = Vec::new();
            append_frame(&mut buf, seq, &payload);

            let (parsed_seq, parsed_payload) = parse_frame(&buf).unwrap();
            prop_assert_eq!(parsed_seq, seq);
            prop_assert_eq!(parsed_payload, &payload[..]);
        }
    }
}
