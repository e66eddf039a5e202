//! WebSocket frame encoding/decoding
//!
//! Wire format: [FIN|opcode][MASK|len7][ext len 0/2/8 bytes][mask key 0/4 bytes][payload]
//!
//! Server frames are never masked. Client frames must be masked.
//! Only unfragmented frames are produced; fragments are decoded so they can be
//! rejected, never reassembled.

/// Sanity limit on a single frame payload (16MB)
pub const MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// Close status codes used by the server
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const MASK_BIT: u8 = 0x80;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Frame codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Client frame is not masked")]
    Unmasked,

    #[error("Server frame must not be masked")]
    UnexpectedMask,

    #[error("Reserved bits set")]
    ReservedBits,

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Frame too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    Oversized(u64),

    #[error("Fragmented frames are not supported")]
    Fragmented,

    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    /// Payload with the mask already removed
    pub payload: Vec<u8>,
}

impl Frame {
    /// True for continuation frames and any frame with FIN clear
    pub fn is_fragment(&self) -> bool {
        !self.fin || self.opcode == Opcode::Continuation
    }

    /// Consume a text frame into its UTF-8 payload
    pub fn into_text(self) -> Result<String, FrameError> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }
}

/// Encode an unmasked (server to client) frame
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_header(&mut out, opcode, payload.len(), false);
    out.extend_from_slice(payload);
    out
}

/// Encode a masked (client to server) frame
pub fn encode_masked(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_header(&mut out, opcode, payload.len(), true);
    out.extend_from_slice(&mask);
    out.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4]),
    );
    out
}

fn write_header(out: &mut Vec<u8>, opcode: Opcode, len: usize, masked: bool) {
    out.push(FIN_BIT | opcode as u8);
    let mask_bit = if masked { MASK_BIT } else { 0 };

    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Decode one client frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied. The mask bit must
/// be set.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    decode_frame(buf, true)
}

/// Decode one server frame from the front of `buf`. The mask bit must be clear.
pub fn decode_unmasked(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    decode_frame(buf, false)
}

fn decode_frame(buf: &[u8], expect_mask: bool) -> Result<(Frame, usize), FrameError> {
    ensure_len(buf, 2)?;

    let first = buf[0];
    let second = buf[1];

    if first & RSV_BITS != 0 {
        return Err(FrameError::ReservedBits);
    }
    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first & 0x0F)?;

    let masked = second & MASK_BIT != 0;
    match (expect_mask, masked) {
        (true, false) => return Err(FrameError::Unmasked),
        (false, true) => return Err(FrameError::UnexpectedMask),
        _ => {}
    }

    let (len, mut offset) = match second & 0x7F {
        126 => {
            ensure_len(buf, 4)?;
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            ensure_len(buf, 10)?;
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(ext), 10)
        }
        short => (short as u64, 2),
    };

    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::Oversized(len));
    }
    let len = len as usize;

    let mask = if masked {
        ensure_len(buf, offset + 4)?;
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + len;
    ensure_len(buf, end)?;

    let payload = match mask {
        Some(key) => buf[offset..end]
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4])
            .collect(),
        None => buf[offset..end].to_vec(),
    };

    Ok((
        Frame {
            fin,
            opcode,
            mask,
            payload,
        },
        end,
    ))
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        Err(FrameError::Truncated {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Build a close frame body: 2-byte status code followed by a UTF-8 reason
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + reason.len());
    out.extend_from_slice(&code.to_be_bytes());
    // Control frame payloads are capped at 125 bytes
    let mut cut = reason.len().min(123);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    out.extend_from_slice(&reason.as_bytes()[..cut]);
    out
}

/// Status code carried by a close frame body, if any
pub fn close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_text_roundtrip_across_length_tiers() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let text = "x".repeat(len);

            let server = encode(Opcode::Text, text.as_bytes());
            let (frame, used) = decode_unmasked(&server).unwrap();
            assert_eq!(used, server.len());
            assert_eq!(frame.into_text().unwrap(), text, "server frame, len {}", len);

            let client = encode_masked(Opcode::Text, text.as_bytes(), KEY);
            let (frame, used) = decode(&client).unwrap();
            assert_eq!(used, client.len());
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(frame.into_text().unwrap(), text, "client frame, len {}", len);
        }
    }

    #[test]
    fn test_length_header_tiers() {
        assert_eq!(&encode(Opcode::Text, &[0; 125])[..2], &[0x81, 125]);
        assert_eq!(&encode(Opcode::Text, &[0; 126])[..4], &[0x81, 126, 0x00, 0x7E]);
        assert_eq!(&encode(Opcode::Text, &[0; 65535])[..4], &[0x81, 126, 0xFF, 0xFF]);
        assert_eq!(
            &encode(Opcode::Text, &[0; 65536])[..10],
            &[0x81, 127, 0, 0, 0, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn test_decode_masked_hello() {
        // Single-frame masked "Hello"
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, used) = decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert!(frame.fin);
        assert_eq!(frame.mask, Some(KEY));
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let bytes = encode(Opcode::Text, b"Hello");
        assert_eq!(decode(&bytes), Err(FrameError::Unmasked));
    }

    #[test]
    fn test_masked_server_frame_rejected() {
        let bytes = encode_masked(Opcode::Text, b"Hello", KEY);
        assert_eq!(decode_unmasked(&bytes), Err(FrameError::UnexpectedMask));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(matches!(decode(&[0x81]), Err(FrameError::Truncated { .. })));

        // Extended length announced but missing
        assert!(matches!(
            decode(&[0x81, 0xFE, 0x01]),
            Err(FrameError::Truncated { .. })
        ));

        // Payload shorter than declared
        let mut bytes = encode_masked(Opcode::Text, b"Hello", KEY);
        bytes.truncate(bytes.len() - 2);
        assert_eq!(
            decode(&bytes),
            Err(FrameError::Truncated {
                needed: 11,
                available: 9
            })
        );
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode_masked(Opcode::Text, b"one", KEY);
        bytes.extend(encode_masked(Opcode::Text, b"two", KEY));

        let (first, used) = decode(&bytes).unwrap();
        let (second, rest) = decode(&bytes[used..]).unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn test_fragment_detected() {
        let mut bytes = encode_masked(Opcode::Text, b"part", KEY);
        bytes[0] &= !FIN_BIT;
        let (frame, _) = decode(&bytes).unwrap();
        assert!(frame.is_fragment());

        let bytes = encode_masked(Opcode::Continuation, b"more", KEY);
        let (frame, _) = decode(&bytes).unwrap();
        assert!(frame.is_fragment());
    }

    #[test]
    fn test_invalid_header_bits() {
        assert_eq!(decode(&[0x83, 0x80]), Err(FrameError::InvalidOpcode(0x3)));
        assert_eq!(decode(&[0xC1, 0x80]), Err(FrameError::ReservedBits));

        let mut huge = vec![0x81, 0xFF];
        huge.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(decode(&huge), Err(FrameError::Oversized(u64::MAX)));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let bytes = encode_masked(Opcode::Text, &[0xFF, 0xFE], KEY);
        let (frame, _) = decode(&bytes).unwrap();
        assert_eq!(frame.into_text(), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_close_payload() {
        let body = close_payload(CLOSE_GOING_AWAY, "server shutdown");
        assert_eq!(close_code(&body), Some(1001));
        assert_eq!(&body[2..], b"server shutdown");
        assert_eq!(close_code(&[]), None);

        let long = "é".repeat(100);
        assert!(close_payload(CLOSE_NORMAL, &long).len() <= 125);
    }
}
