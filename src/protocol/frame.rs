//! Wire frame definitions for the station P2P protocol
//!
//! Every frame starts with a 2-byte prefix (version, frame type) followed
//! by a type-specific header, all integers big-endian:
//!
//! - Hello:    sequence u32, connection type u8
//! - HelloAck: sequence u32
//! - Command:  sequence u32, channel u8, command u16, flags u8, len u16, payload
//! - Ack:      sequence u32, channel u8, command u16, return code i32, flags u8, len u16, payload
//! - Data:     channel u8, kind u8, medium u8, flags u8, frag index u16,
//!             frag count u16, chunk sequence u32, len u16, payload
//! - Ping/Pong: sequence u32
//! - Bye:      (empty)
//!
//! The true byte layout of the hardware protocol is not recoverable from
//! the available captures; this layout carries every mandatory header field
//! (sequence, channel, command type, fragment index/total, payload length)
//! and must be validated against a reference capture before claiming
//! byte-level compatibility.

use super::command::CommandType;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Data frame header size (prefix + fixed fields)
pub const DATA_HEADER_SIZE: usize = 16;

/// Maximum data payload per fragment
/// (MTU 1500 - IP 20 - UDP 8 - data header 16)
pub const MAX_PAYLOAD_SIZE: usize = 1456;

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    HelloAck = 0x02,
    Command = 0x03,
    Ack = 0x04,
    Data = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    Bye = 0x08,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::HelloAck),
            0x03 => Ok(FrameType::Command),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Data),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            0x08 => Ok(FrameType::Bye),
            _ => Err(()),
        }
    }
}

/// Logical stream kind multiplexed over one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    Livestream = 0x01,
    Rtsp = 0x02,
    Download = 0x03,
    Talkback = 0x04,
}

impl TryFrom<u8> for StreamKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(StreamKind::Livestream),
            0x02 => Ok(StreamKind::Rtsp),
            0x03 => Ok(StreamKind::Download),
            0x04 => Ok(StreamKind::Talkback),
            _ => Err(()),
        }
    }
}

/// What a data frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Video = 0x00,
    Audio = 0x01,
    Metadata = 0x02,
}

impl TryFrom<u8> for MediaKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MediaKind::Video),
            0x01 => Ok(MediaKind::Audio),
            0x02 => Ok(MediaKind::Metadata),
            _ => Err(()),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Payload is encrypted (lock AES for command/ack, stream AES for data)
    pub encrypted: bool,
    /// Last data frame of a stream
    pub end_of_stream: bool,
}

impl FrameFlags {
    pub fn to_u8(self) -> u8 {
        let mut flags = 0u8;
        if self.encrypted {
            flags |= 0x01;
        }
        if self.end_of_stream {
            flags |= 0x02;
        }
        flags
    }

    pub fn from_u8(value: u8) -> Self {
        Self {
            encrypted: (value & 0x01) != 0,
            end_of_stream: (value & 0x02) != 0,
        }
    }
}

/// A wire frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello {
        sequence: u32,
        connection_type: u8,
    },
    HelloAck {
        sequence: u32,
    },
    Command {
        sequence: u32,
        channel: u8,
        command: CommandType,
        flags: FrameFlags,
        payload: Vec<u8>,
    },
    Ack {
        sequence: u32,
        channel: u8,
        command: CommandType,
        return_code: i32,
        flags: FrameFlags,
        payload: Vec<u8>,
    },
    Data {
        channel: u8,
        kind: StreamKind,
        medium: MediaKind,
        flags: FrameFlags,
        frag_index: u16,
        frag_count: u16,
        chunk_sequence: u32,
        payload: Vec<u8>,
    },
    Ping {
        sequence: u32,
    },
    Pong {
        sequence: u32,
    },
    Bye,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::HelloAck { .. } => FrameType::HelloAck,
            Frame::Command { .. } => FrameType::Command,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Data { .. } => FrameType::Data,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Bye => FrameType::Bye,
        }
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + self.payload_len());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.frame_type() as u8);

        match self {
            Frame::Hello {
                sequence,
                connection_type,
            } => {
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.push(*connection_type);
            }
            Frame::HelloAck { sequence } | Frame::Ping { sequence } | Frame::Pong { sequence } => {
                buf.extend_from_slice(&sequence.to_be_bytes());
            }
            Frame::Command {
                sequence,
                channel,
                command,
                flags,
                payload,
            } => {
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.push(*channel);
                buf.extend_from_slice(&command.0.to_be_bytes());
                buf.push(flags.to_u8());
                buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Ack {
                sequence,
                channel,
                command,
                return_code,
                flags,
                payload,
            } => {
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.push(*channel);
                buf.extend_from_slice(&command.0.to_be_bytes());
                buf.extend_from_slice(&return_code.to_be_bytes());
                buf.push(flags.to_u8());
                buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Data {
                channel,
                kind,
                medium,
                flags,
                frag_index,
                frag_count,
                chunk_sequence,
                payload,
            } => {
                buf.push(*channel);
                buf.push(*kind as u8);
                buf.push(*medium as u8);
                buf.push(flags.to_u8());
                buf.extend_from_slice(&frag_index.to_be_bytes());
                buf.extend_from_slice(&frag_count.to_be_bytes());
                buf.extend_from_slice(&chunk_sequence.to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Bye => {}
        }

        buf
    }

    /// Deserialize a frame from bytes. Returns `None` for truncated,
    /// malformed, or unknown-version datagrams.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 2 || data[0] != PROTOCOL_VERSION {
            return None;
        }
        let frame_type = FrameType::try_from(data[1]).ok()?;
        let body = &data[2..];

        match frame_type {
            FrameType::Hello => {
                if body.len() != 5 {
                    return None;
                }
                Some(Frame::Hello {
                    sequence: read_u32(body, 0)?,
                    connection_type: body[4],
                })
            }
            FrameType::HelloAck => Some(Frame::HelloAck {
                sequence: read_exact_u32(body)?,
            }),
            FrameType::Ping => Some(Frame::Ping {
                sequence: read_exact_u32(body)?,
            }),
            FrameType::Pong => Some(Frame::Pong {
                sequence: read_exact_u32(body)?,
            }),
            FrameType::Command => {
                if body.len() < 10 {
                    return None;
                }
                let len = read_u16(body, 8)? as usize;
                if body.len() != 10 + len {
                    return None;
                }
                Some(Frame::Command {
                    sequence: read_u32(body, 0)?,
                    channel: body[4],
                    command: CommandType(read_u16(body, 5)?),
                    flags: FrameFlags::from_u8(body[7]),
                    payload: body[10..].to_vec(),
                })
            }
            FrameType::Ack => {
                if body.len() < 14 {
                    return None;
                }
                let len = read_u16(body, 12)? as usize;
                if body.len() != 14 + len {
                    return None;
                }
                Some(Frame::Ack {
                    sequence: read_u32(body, 0)?,
                    channel: body[4],
                    command: CommandType(read_u16(body, 5)?),
                    return_code: read_u32(body, 7)? as i32,
                    flags: FrameFlags::from_u8(body[11]),
                    payload: body[14..].to_vec(),
                })
            }
            FrameType::Data => {
                if body.len() < 14 {
                    return None;
                }
                let len = read_u16(body, 12)? as usize;
                if body.len() != 14 + len {
                    return None;
                }
                Some(Frame::Data {
                    channel: body[0],
                    kind: StreamKind::try_from(body[1]).ok()?,
                    medium: MediaKind::try_from(body[2]).ok()?,
                    flags: FrameFlags::from_u8(body[3]),
                    frag_index: read_u16(body, 4)?,
                    frag_count: read_u16(body, 6)?,
                    chunk_sequence: read_u32(body, 8)?,
                    payload: body[14..].to_vec(),
                })
            }
            FrameType::Bye => {
                if !body.is_empty() {
                    return None;
                }
                Some(Frame::Bye)
            }
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Command { payload, .. }
            | Frame::Ack { payload, .. }
            | Frame::Data { payload, .. } => payload.len(),
            _ => 8,
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_exact_u32(body: &[u8]) -> Option<u32> {
    if body.len() != 4 {
        return None;
    }
    read_u32(body, 0)
}
