//! Wire format for framed messages.
//!
//! Frame format:
//! `[length:4][checksum:4][meta_len:4][segments:4][meta:M]([seg_len:4][seg:S])*`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **meta_len**: Size of the packed [`Meta`](crate::Meta)
//! - **segments**: Number of data segments that follow the meta
//!
//! Each data segment is prefixed with its own length.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::message::{pack_meta, unpack_meta, Message};

/// Header size: 4 (length) + 4 (checksum) + 4 (meta_len) + 4 (segments).
pub const HEADER_SIZE: usize = 16;

/// Maximum frame size (64 MiB).
///
/// Larger frames are rejected so a corrupt length cannot make a reader
/// allocate without bound.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Offset of the checksummed region.
const CHECKSUM_START: usize = 8;

/// Why a frame could not be built or decoded.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ends before the header or the frame does.
    #[error("truncated frame: {have} of {needed} bytes")]
    InsufficientData {
        /// Bytes the frame occupies.
        needed: usize,
        /// Bytes in the buffer.
        have: usize,
    },

    /// The CRC32C in the header does not match the frame body.
    #[error("frame crc {expected:#010x} does not match body crc {actual:#010x}")]
    ChecksumMismatch {
        /// Value carried by the header.
        expected: u32,
        /// Value computed over the received body.
        actual: u32,
    },

    /// The frame is larger than [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
    },

    /// Length fields disagree with the frame contents.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The offending length value.
        length: u32,
    },

    /// The packed meta could not be decoded.
    #[error("malformed meta: {message}")]
    MalformedMeta {
        /// Decoder error.
        message: String,
    },

    /// A decoded field holds a value outside its domain.
    #[error("invalid value {value} for {field}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// Reading from the stream failed.
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C of the bytes after the checksum field.
    pub checksum: u32,
    /// Size of the packed meta.
    pub meta_len: u32,
    /// Number of data segments.
    pub segments: u32,
}

impl FrameHeader {
    /// Write the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.meta_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.segments.to_le_bytes());
    }

    /// Read the header from the start of `buf`. Fails with
    /// `InsufficientData` on a buffer shorter than [`HEADER_SIZE`].
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            length: read_u32(buf, 0),
            checksum: read_u32(buf, 4),
            meta_len: read_u32(buf, 8),
            segments: read_u32(buf, 12),
        })
    }

    fn validate(&self) -> Result<usize, WireError> {
        let length = self.length as usize;
        if length < HEADER_SIZE {
            return Err(WireError::InvalidLength {
                length: self.length,
            });
        }
        if length > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge { size: length });
        }
        Ok(length)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Serialize a message into a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the frame would exceed MAX_FRAME_SIZE.
pub fn serialize_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let meta = pack_meta(&msg.meta);
    let total_length = HEADER_SIZE
        + meta.len()
        + msg.data.iter().map(|seg| 4 + seg.len()).sum::<usize>();
    if total_length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: total_length });
    }

    let mut data = Vec::with_capacity(total_length);
    data.resize(HEADER_SIZE, 0);
    data.extend_from_slice(&meta);
    for seg in &msg.data {
        data.extend_from_slice(&(seg.len() as u32).to_le_bytes());
        data.extend_from_slice(seg);
    }

    let mut header = FrameHeader {
        length: total_length as u32,
        checksum: 0,
        meta_len: meta.len() as u32,
        segments: msg.data.len() as u32,
    };
    header.serialize_into(&mut data[..HEADER_SIZE]);
    header.checksum = crc32c::crc32c(&data[CHECKSUM_START..]);
    header.serialize_into(&mut data[..HEADER_SIZE]);

    Ok(data)
}

/// Decode the body of a frame whose header has already been validated.
fn decode_body(header: &FrameHeader, frame: &[u8]) -> Result<Message, WireError> {
    let computed = crc32c::crc32c(&frame[CHECKSUM_START..]);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
        });
    }

    let meta_end = HEADER_SIZE + header.meta_len as usize;
    if meta_end > frame.len() {
        return Err(WireError::InvalidLength {
            length: header.meta_len,
        });
    }
    let meta = unpack_meta(&frame[HEADER_SIZE..meta_end])?;

    let mut data = Vec::with_capacity(header.segments as usize);
    let mut offset = meta_end;
    for _ in 0..header.segments {
        if offset + 4 > frame.len() {
            return Err(WireError::InvalidLength {
                length: header.length,
            });
        }
        let seg_len = read_u32(frame, offset) as usize;
        offset += 4;
        if offset + seg_len > frame.len() {
            return Err(WireError::InvalidLength {
                length: seg_len as u32,
            });
        }
        data.push(Bytes::copy_from_slice(&frame[offset..offset + seg_len]));
        offset += seg_len;
    }
    if offset != frame.len() {
        return Err(WireError::InvalidLength {
            length: header.length,
        });
    }

    Ok(Message { meta, data })
}

/// Deserialize a complete frame, validating length and checksum.
///
/// # Errors
///
/// - `InsufficientData`: Not enough bytes for the header or the full frame
/// - `ChecksumMismatch`: The body does not match the header's CRC
/// - `InvalidLength`: Length fields are inconsistent
/// - `MalformedMeta` / `InvalidField`: The envelope could not be decoded
pub fn deserialize_frame(data: &[u8]) -> Result<Message, WireError> {
    let header = FrameHeader::deserialize(data)?;
    let expected_len = header.validate()?;
    if data.len() < expected_len {
        return Err(WireError::InsufficientData {
            needed: expected_len,
            have: data.len(),
        });
    }
    decode_body(&header, &data[..expected_len])
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new header.
///
/// # Errors
///
/// Returns `Io` for stream failures (including EOF inside a frame) and the
/// decoding errors of [`deserialize_frame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(Message, usize)>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; HEADER_SIZE];
    match reader.read_exact(&mut frame).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::deserialize(&frame)?;
    let length = header.validate()?;
    frame.resize(length, 0);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;

    let message = decode_body(&header, &frame)?;
    Ok(Some((message, length)))
}
