//! Tunnel framing codec
//!
//! Every message on the TCP stream is one frame:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────────┐
//! │ Length (4B)  │ Type (1B) │ Payload (Length - 5 bytes)   │
//! └──────────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! `Length` is little-endian and counts the whole frame, including itself.
//! Decoding consumes exactly one frame and never reads ahead, so it can be
//! driven directly from a blocking socket.

use std::io::{self, Read, Write};

// ============================================================================
// Constants
// ============================================================================

/// Size of the length field
pub const LENGTH_LEN: usize = 4;

/// Size of the fixed header (length + type)
pub const HEADER_LEN: usize = LENGTH_LEN + 1;

/// Largest payload a single frame may carry
pub const MAX_PAYLOAD: usize = 4096;

/// Largest total frame length
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

// ============================================================================
// Frame Kinds
// ============================================================================

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Client asks for a tunnel address (empty payload)
    AddressRequest,
    /// Server assigns an address (UTF-8 payload)
    AddressReply,
    /// Outbound IP packet (client -> server)
    DataRequest,
    /// Inbound IP packet (server -> client)
    DataReply,
    /// Liveness probe, either direction (empty payload)
    Heartbeat,
    /// Type byte outside the known set
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            100 => FrameKind::AddressRequest,
            101 => FrameKind::AddressReply,
            102 => FrameKind::DataRequest,
            103 => FrameKind::DataReply,
            104 => FrameKind::Heartbeat,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::AddressRequest => 100,
            FrameKind::AddressReply => 101,
            FrameKind::DataRequest => 102,
            FrameKind::DataReply => 103,
            FrameKind::Heartbeat => 104,
            FrameKind::Unknown(other) => other,
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Frame { kind, payload }
    }

    /// A frame with no payload (AddressRequest, Heartbeat)
    pub fn empty(kind: FrameKind) -> Self {
        Frame::new(kind, Vec::new())
    }

    /// Total bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self.kind, &self.payload)
    }
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode a frame
///
/// Returns a Vec containing: [4-byte LE length][type][payload]
pub fn encode(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge(payload.len()));
    }

    let total = HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.push(kind.as_u8());
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode exactly one frame from a reader
///
/// Blocks until the whole frame is read. A stream that ends (or gives up)
/// inside the frame is reported as `Truncated`.
pub fn decode<R: Read>(reader: &mut R) -> Result<Frame, DecodeError> {
    let mut prefix = [0u8; LENGTH_LEN];
    reader.read_exact(&mut prefix).map_err(DecodeError::from_io)?;

    let length = u32::from_le_bytes(prefix);
    let total = length as usize;
    if total < HEADER_LEN {
        return Err(DecodeError::InvalidLength(length));
    }
    if total > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge(length));
    }

    let mut body = vec![0u8; total - LENGTH_LEN];
    reader.read_exact(&mut body).map_err(DecodeError::from_io)?;

    let payload = body.split_off(1);
    let kind = FrameKind::from_u8(body[0]);

    Ok(Frame { kind, payload })
}

/// Encode and write a frame in one `write_all`
pub fn write_frame<W: Write>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> io::Result<()> {
    let encoded = encode(kind, payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&encoded)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload exceeds MAX_PAYLOAD
    PayloadTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::PayloadTooLarge(size) => {
                write!(f, "payload too large: {} bytes (max {})", size, MAX_PAYLOAD)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during frame decoding
///
/// All of them are fatal for the stream: the reader is no longer aligned on
/// a frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Stream ended before the frame was complete
    Truncated,
    /// Declared length is smaller than the header
    InvalidLength(u32),
    /// Declared length exceeds MAX_FRAME_LEN
    TooLarge(u32),
    /// Underlying read failed
    Io(io::ErrorKind),
}

impl DecodeError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::Truncated,
            kind => DecodeError::Io(kind),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated frame"),
            DecodeError::InvalidLength(len) => {
                write!(f, "invalid frame length: {} (min {})", len, HEADER_LEN)
            }
            DecodeError::TooLarge(len) => {
                write!(f, "frame too large: {} bytes (max {})", len, MAX_FRAME_LEN)
            }
            DecodeError::Io(kind) => write!(f, "read error: {:?}", kind),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let encoded = encode(FrameKind::DataRequest, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[..4], &8u32.to_le_bytes());
        assert_eq!(encoded[4], 102);
        assert_eq!(&encoded[5..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_empty_frames_are_header_only() {
        let heartbeat = encode(FrameKind::Heartbeat, &[]).unwrap();
        assert_eq!(heartbeat, vec![5, 0, 0, 0, 104]);

        let request = Frame::empty(FrameKind::AddressRequest).encode().unwrap();
        assert_eq!(request, vec![5, 0, 0, 0, 100]);
    }

    #[test]
    fn test_roundtrip_kinds_and_sizes() {
        let kinds = [
            FrameKind::AddressRequest,
            FrameKind::AddressReply,
            FrameKind::DataRequest,
            FrameKind::DataReply,
            FrameKind::Heartbeat,
        ];
        for (i, kind) in kinds.iter().enumerate() {
            let payload: Vec<u8> = (0..(i * 1000).min(MAX_PAYLOAD)).map(|b| b as u8).collect();
            let encoded = encode(*kind, &payload).unwrap();

            let decoded = decode(&mut Cursor::new(encoded)).unwrap();
            assert_eq!(decoded.kind, *kind);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let payload = vec![0x5A; MAX_PAYLOAD];
        let encoded = encode(FrameKind::DataReply, &payload).unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_LEN);

        let decoded = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(FrameKind::DataRequest, &payload),
            Err(EncodeError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode(FrameKind::DataReply, &[1, 2, 3, 4, 5, 6]).unwrap();

        // Partial length prefix
        assert_eq!(
            decode(&mut Cursor::new(&encoded[..2])),
            Err(DecodeError::Truncated)
        );

        // Partial body
        assert_eq!(
            decode(&mut Cursor::new(&encoded[..encoded.len() - 1])),
            Err(DecodeError::Truncated)
        );

        // Nothing at all
        assert_eq!(decode(&mut Cursor::new(Vec::<u8>::new())), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_invalid_length() {
        let bogus = 4u32.to_le_bytes();
        assert_eq!(
            decode(&mut Cursor::new(bogus)),
            Err(DecodeError::InvalidLength(4))
        );

        let huge = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(
            decode(&mut Cursor::new(huge)),
            Err(DecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind_tolerated() {
        let encoded = encode(FrameKind::Unknown(7), b"x").unwrap();
        let decoded = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded.kind, FrameKind::Unknown(7));
        assert_eq!(decoded.payload, b"x");
    }

    #[test]
    fn test_decode_stops_at_frame_boundary() {
        let mut stream = encode(FrameKind::Heartbeat, &[]).unwrap();
        stream.extend(encode(FrameKind::DataReply, &[9; 300]).unwrap());

        let mut cursor = Cursor::new(stream);
        assert_eq!(decode(&mut cursor).unwrap().kind, FrameKind::Heartbeat);
        assert_eq!(cursor.position(), 5);

        let second = decode(&mut cursor).unwrap();
        assert_eq!(second.kind, FrameKind::DataReply);
        assert_eq!(second.payload.len(), 300);
    }

    #[test]
    fn test_write_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::AddressReply, b"10.0.0.2").unwrap();
        let decoded = decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, Frame::new(FrameKind::AddressReply, b"10.0.0.2".to_vec()));
    }

    #[test]
    fn test_decode_error_display() {
        assert_eq!(format!("{}", DecodeError::Truncated), "truncated frame");
        assert_eq!(
            format!("{}", EncodeError::PayloadTooLarge(5000)),
            "payload too large: 5000 bytes (max 4096)"
        );
    }
}
