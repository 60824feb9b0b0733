//! Frame encoding and incremental decoding.
//!
//! Frame layout: `[4-byte header length][4-byte body length][header][body]`
//! with little-endian lengths. The header is the serialized [`Message`]
//! minus its body bytes; the body travels as-is, already encoded by the
//! sender's codec.

use granary_core::Message;

use crate::prefix::PrefixWriter;

/// Length-prefix size: 4 bytes header length + 4 bytes body length.
pub const FRAME_PREFIX_SIZE: usize = 8;

/// Maximum accepted size for a single frame (header + body).
///
/// Frames larger than this are rejected to bound memory per connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge {
        /// Combined header + body length from the prefix.
        size: usize,
    },

    /// Header bytes did not deserialize to a message.
    #[error("bad message header: {0}")]
    Header(#[from] serde_json::Error),

    /// A prefix of the wrong size was handed to a prefix writer.
    #[error("prefix size mismatch: writer reserved {reserved}, caller provided {provided}")]
    PrefixSizeMismatch {
        /// Bytes reserved at construction.
        reserved: usize,
        /// Bytes provided at completion.
        provided: usize,
    },
}

/// Encode a message into one framed byte vector.
///
/// The length prefix is emitted through [`PrefixWriter`]: payload first,
/// prefix filled in at completion, committed to the output in order.
///
/// # Errors
///
/// Returns [`WireError::FrameTooLarge`] for oversized messages and
/// [`WireError::Header`] if the header fails to serialize.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let header = serialize_header(msg)?;
    let body = &msg.body;
    let total = header.len() + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: total });
    }

    let mut writer = PrefixWriter::new(FRAME_PREFIX_SIZE, total);
    writer.write(&header);
    writer.write(body);

    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    prefix[0..4].copy_from_slice(&(header.len() as u32).to_le_bytes());
    prefix[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());

    let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + total);
    writer.complete(&prefix, &mut out)?;
    Ok(out)
}

/// Serialize the message header (the message with body bytes stripped).
fn serialize_header(msg: &Message) -> Result<Vec<u8>, WireError> {
    let header_view = Message {
        body: Vec::new(),
        ..msg.clone()
    };
    Ok(serde_json::to_vec(&header_view)?)
}

/// Reassemble a message from header and body byte slices.
///
/// # Errors
///
/// Returns [`WireError::Header`] if the header is malformed.
pub fn decode_message(header: &[u8], body: &[u8]) -> Result<Message, WireError> {
    let mut msg: Message = serde_json::from_slice(header)?;
    msg.body = body.to_vec();
    Ok(msg)
}

/// Try to decode one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((message, consumed)))` when a complete frame was parsed
/// - `Ok(None)` when more bytes are needed (not an error)
/// - `Err` when the frame is malformed or oversized
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Ok(None);
    }
    let header_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = header_len
        .checked_add(body_len)
        .filter(|t| *t <= MAX_FRAME_SIZE)
        .ok_or(WireError::FrameTooLarge {
            size: header_len.saturating_add(body_len),
        })?;

    let frame_end = FRAME_PREFIX_SIZE + total;
    if buf.len() < frame_end {
        return Ok(None);
    }

    let header = &buf[FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + header_len];
    let body = &buf[FRAME_PREFIX_SIZE + header_len..frame_end];
    let msg = decode_message(header, body)?;
    Ok(Some((msg, frame_end)))
}
