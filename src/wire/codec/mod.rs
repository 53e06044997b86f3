//! Binary framing for requests and responses.
//!
//! ```text
//! u32 frame length | u8 major | u8 minor | u16 flags | u64 sequence
//! u64 agent id | u64 management server id | u64 via id | u32 item count
//! item*: u16 tag | u32 payload length | payload
//! ```
//!
//! All integers are big-endian. Payloads are MessagePack maps (see
//! [`crate::wire::command`]).

use thiserror::Error;

use crate::config::AppConfig;
use crate::wire::command::payload::PayloadError;
use crate::wire::command::{Answer, Command};
use crate::wire::envelope::{
    Frame, ProtocolVersion, Request, Response, Routing, FLAG_CONTROL, FLAG_FROM_SERVER,
    FLAG_IN_SEQUENCE, FLAG_RESPONSE, FLAG_STOP_ON_ERROR,
};

pub const MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
pub const ENVELOPE_HEADER_SIZE_BYTES: usize = 1 + 1 + 2 + 8 * 4 + 4;
pub const ITEM_HEADER_SIZE_BYTES: usize = 2 + 4;
pub const MAX_ITEMS_PER_FRAME: usize = 1024;

#[derive(Debug, Error, PartialEq)]
pub enum MalformedFrame {
    #[error("frame size {size} is smaller than 4-byte header")]
    TooShort { size: usize },
    #[error("frame length cannot be zero")]
    ZeroLength,
    #[error("frame length {length} exceeds max {limit}")]
    LengthTooLarge { length: usize, limit: usize },
    #[error("frame length mismatch: declared {declared} bytes, actual payload {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("envelope header truncated at {size} bytes")]
    TruncatedHeader { size: usize },
    #[error("item count {count} exceeds max {limit}")]
    TooManyItems { count: usize, limit: usize },
    #[error("item #{index} is truncated")]
    TruncatedItem { index: usize },
    #[error("item #{index} (tag {tag:#06x}) has an invalid payload: {source}")]
    ItemPayload {
        index: usize,
        tag: u16,
        source: PayloadError,
    },
    #[error("{extra} trailing bytes after last item")]
    TrailingBytes { extra: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol version mismatch: local v{local}, remote v{remote}")]
    ProtocolVersionMismatch {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),
    #[error("envelope size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("cannot encode {count} items, max is {limit}")]
    TooManyItems { count: usize, limit: usize },
    #[error("item #{index} could not be encoded: {source}")]
    ItemEncode { index: usize, source: PayloadError },
    #[error("invalid wire configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let max = app_config.wire.max_envelope_size_bytes;
        if max <= ENVELOPE_HEADER_SIZE_BYTES || max > u32::MAX as usize {
            return Err(CodecError::InvalidConfig(format!(
                "wire.max_envelope_size_bytes must be in {}..={}, got {max}",
                ENVELOPE_HEADER_SIZE_BYTES + 1,
                u32::MAX
            )));
        }

        Ok(Self::new(CodecConfig {
            max_envelope_size_bytes: max,
        }))
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.config.max_envelope_size_bytes
    }

    pub fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer::new(self.config.max_envelope_size_bytes)
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let (version, flags, sequence, routing, items) = match frame {
            Frame::Request(request) => (
                request.version,
                request.flags(),
                request.sequence,
                request.routing,
                encode_items(&request.commands, Command::encode)?,
            ),
            Frame::Response(response) => (
                response.version,
                response.flags(),
                response.sequence,
                response.routing,
                encode_items(&response.answers, Answer::encode)?,
            ),
        };

        let body_len = ENVELOPE_HEADER_SIZE_BYTES
            + items
                .iter()
                .map(|(_, raw)| ITEM_HEADER_SIZE_BYTES + raw.len())
                .sum::<usize>();
        if body_len > self.config.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: body_len,
                limit: self.config.max_envelope_size_bytes,
            });
        }

        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(version.major);
        out.push(version.minor);
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&routing.agent_id.to_be_bytes());
        out.extend_from_slice(&routing.management_server_id.to_be_bytes());
        out.extend_from_slice(&routing.via_id.to_be_bytes());
        out.extend_from_slice(&(items.len() as u32).to_be_bytes());
        for (tag, raw) in &items {
            out.extend_from_slice(&tag.to_be_bytes());
            out.extend_from_slice(&(raw.len() as u32).to_be_bytes());
            out.extend_from_slice(raw);
        }

        Ok(out)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<Frame, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(MalformedFrame::TooShort { size: frame.len() }.into());
        }

        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        validate_declared_length(declared, self.config.max_envelope_size_bytes)?;

        let body = &frame[FRAME_HEADER_SIZE_BYTES..];
        if body.len() != declared {
            return Err(MalformedFrame::LengthMismatch {
                declared,
                actual: body.len(),
            }
            .into());
        }

        let mut reader = ByteReader::new(body);
        let truncated = MalformedFrame::TruncatedHeader { size: body.len() };

        // Version first so a peer on another major never gets its header misread.
        let (Some(major), Some(minor)) = (reader.u8(), reader.u8()) else {
            return Err(truncated.into());
        };
        let remote = ProtocolVersion { major, minor };
        if !ProtocolVersion::CURRENT.is_compatible_with(remote) {
            return Err(CodecError::ProtocolVersionMismatch {
                local: ProtocolVersion::CURRENT,
                remote,
            });
        }

        let header = (|| {
            Some((
                reader.u16()?,
                reader.u64()?,
                Routing {
                    agent_id: reader.u64()?,
                    management_server_id: reader.u64()?,
                    via_id: reader.u64()?,
                },
                reader.u32()? as usize,
            ))
        })();
        let Some((flags, sequence, routing, count)) = header else {
            return Err(truncated.into());
        };
        if count > MAX_ITEMS_PER_FRAME {
            return Err(MalformedFrame::TooManyItems {
                count,
                limit: MAX_ITEMS_PER_FRAME,
            }
            .into());
        }

        let is_response = flags & FLAG_RESPONSE != 0;
        let control = flags & FLAG_CONTROL != 0;
        let from_server = flags & FLAG_FROM_SERVER != 0;

        let decoded = if is_response {
            let answers = decode_items(&mut reader, count, Answer::decode)?;
            Frame::Response(Response {
                version: remote,
                sequence,
                routing,
                control,
                from_server,
                answers,
            })
        } else {
            let commands = decode_items(&mut reader, count, Command::decode)?;
            Frame::Request(Request {
                version: remote,
                sequence,
                routing,
                control,
                stop_on_error: flags & FLAG_STOP_ON_ERROR != 0,
                execute_in_sequence: flags & FLAG_IN_SEQUENCE != 0,
                from_server,
                commands,
            })
        };

        if reader.remaining() != 0 {
            return Err(MalformedFrame::TrailingBytes {
                extra: reader.remaining(),
            }
            .into());
        }

        Ok(decoded)
    }
}

fn validate_declared_length(declared: usize, limit: usize) -> Result<(), MalformedFrame> {
    if declared == 0 {
        return Err(MalformedFrame::ZeroLength);
    }
    if declared > limit {
        return Err(MalformedFrame::LengthTooLarge {
            length: declared,
            limit,
        });
    }
    Ok(())
}

fn encode_items<T>(
    items: &[T],
    encode: impl Fn(&T) -> Result<(u16, Vec<u8>), PayloadError>,
) -> Result<Vec<(u16, Vec<u8>)>, CodecError> {
    if items.len() > MAX_ITEMS_PER_FRAME {
        return Err(CodecError::TooManyItems {
            count: items.len(),
            limit: MAX_ITEMS_PER_FRAME,
        });
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| encode(item).map_err(|source| CodecError::ItemEncode { index, source }))
        .collect()
}

fn decode_items<T>(
    reader: &mut ByteReader<'_>,
    count: usize,
    decode: impl Fn(u16, &[u8]) -> Result<T, PayloadError>,
) -> Result<Vec<T>, MalformedFrame> {
    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        let (Some(tag), Some(len)) = (reader.u16(), reader.u32()) else {
            return Err(MalformedFrame::TruncatedItem { index });
        };
        let Some(raw) = reader.take(len as usize) else {
            return Err(MalformedFrame::TruncatedItem { index });
        };
        let item =
            decode(tag, raw).map_err(|source| MalformedFrame::ItemPayload { index, tag, source })?;
        items.push(item);
    }
    Ok(items)
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|raw| raw[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }
}

/// Reassembles length-prefixed frames from a byte stream.
#[derive(Debug)]
pub struct FrameBuffer {
    buffered: Vec<u8>,
    max_envelope_size_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_envelope_size_bytes: usize) -> Self {
        Self {
            buffered: Vec::new(),
            max_envelope_size_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffered.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Returns the next complete frame (length prefix included). An invalid
    /// length prefix means the stream can no longer be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MalformedFrame> {
        if self.buffered.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([
            self.buffered[0],
            self.buffered[1],
            self.buffered[2],
            self.buffered[3],
        ]) as usize;
        validate_declared_length(declared, self.max_envelope_size_bytes)?;

        let total = FRAME_HEADER_SIZE_BYTES + declared;
        if self.buffered.len() < total {
            return Ok(None);
        }

        let rest = self.buffered.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buffered, rest)))
    }
}
