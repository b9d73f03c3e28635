// Tunnel wire codec - encoding and decoding of the serial frame format
//
// Every unit transferred over the UART is one frame: a fixed 27-byte header
// followed by a variable payload. The header carries the command byte, the
// 128-bit session id, the routing endpoint and the payload length. Parsing
// follows a check/parse split so the framer can cheaply decide whether a
// whole frame is buffered before allocating anything.

use crate::session::SessionId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::fmt;
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Fixed length of the frame header in bytes.
///
/// `cmd` (1) + `session_id` (16) + `target_ip` (4) + `target_port` (2)
/// + `data_len` (4).
pub const HEADER_LEN: usize = 27;

/// Hard ceiling on the payload length of a single frame.
///
/// A header announcing more than this is a framing error: the link is
/// declared corrupt and the tunnel shuts down. No resync is attempted, the
/// underlying serial link is assumed reliable.
pub const MAX_DATA_LEN: u32 = 16 * 1024 * 1024;

/// Command byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Payload is a chunk of TCP bytes for the session.
    Data = 0x01,
    /// Peer requests closure of the session; payload empty.
    Disconnect = 0x03,
    /// Peer is about to terminate; recipient must begin shutdown.
    ProgramClose = 0x05,
}

/// The TCP endpoint a session is routed to on the egress side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    /// Placeholder endpoint carried by frames whose routing fields are
    /// ignored by the receiver.
    pub const ZERO: Endpoint = Endpoint {
        host: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Endpoint { host, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

/// One decoded frame.
///
/// Unknown command bytes decode to [`Frame::Unknown`] so the stream stays in
/// sync: the header and payload are consumed, the payload content is
/// discarded, and the consumer logs and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        id: SessionId,
        target: Endpoint,
        payload: Bytes,
    },
    Disconnect {
        id: SessionId,
    },
    ProgramClose {
        id: SessionId,
    },
    Unknown {
        cmd: u8,
        id: SessionId,
        data_len: u32,
    },
}

/// Codec errors.
///
/// `Incomplete` is an expected runtime condition hit whenever a partial
/// frame sits in the reassembly buffer; it is never fatal. `PayloadTooLarge`
/// is fatal for the whole tunnel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame; need more data")]
    Incomplete,

    #[error("frame payload length {len} exceeds ceiling {max}")]
    PayloadTooLarge { len: u32, max: u32 },
}

impl Frame {
    /// Checks whether a whole frame can be decoded from `src`. On success
    /// returns the total frame length (header plus payload) without moving
    /// the cursor.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, CodecError> {
        if src.remaining() < HEADER_LEN {
            return Err(CodecError::Incomplete);
        }

        // data_len sits in the last four header bytes
        let start = src.position();
        src.advance(HEADER_LEN - 4);
        let data_len = src.get_u32();
        src.set_position(start);

        if data_len > MAX_DATA_LEN {
            return Err(CodecError::PayloadTooLarge {
                len: data_len,
                max: MAX_DATA_LEN,
            });
        }

        let total = HEADER_LEN + data_len as usize;
        if src.remaining() < total {
            return Err(CodecError::Incomplete);
        }

        Ok(total)
    }

    /// Decodes one frame from `src`, advancing the cursor past it. The frame
    /// must have been validated with [`Frame::check`] first.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, CodecError> {
        Self::check(src)?;

        let cmd = src.get_u8();
        let mut id_bytes = [0u8; 16];
        src.copy_to_slice(&mut id_bytes);
        let id = SessionId::from_bytes(id_bytes);
        let mut octets = [0u8; 4];
        src.copy_to_slice(&mut octets);
        let host = Ipv4Addr::from(octets);
        let port = src.get_u16();
        let data_len = src.get_u32();

        let frame = match Command::try_from(cmd) {
            Ok(Command::Data) => Frame::Data {
                id,
                target: Endpoint::new(host, port),
                payload: src.copy_to_bytes(data_len as usize),
            },
            Ok(Command::Disconnect) => {
                // routing fields and any stray payload are ignored
                src.advance(data_len as usize);
                Frame::Disconnect { id }
            }
            Ok(Command::ProgramClose) => {
                src.advance(data_len as usize);
                Frame::ProgramClose { id }
            }
            Err(_) => {
                src.advance(data_len as usize);
                Frame::Unknown { cmd, id, data_len }
            }
        };

        Ok(frame)
    }

    /// Encodes this frame into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let (cmd, id, target, payload) = match self {
            Frame::Data {
                id,
                target,
                payload,
            } => (Command::Data as u8, id, *target, payload.as_ref()),
            Frame::Disconnect { id } => (Command::Disconnect as u8, id, Endpoint::ZERO, &[][..]),
            Frame::ProgramClose { id } => {
                (Command::ProgramClose as u8, id, Endpoint::ZERO, &[][..])
            }
            Frame::Unknown { cmd, id, .. } => (*cmd, id, Endpoint::ZERO, &[][..]),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(cmd);
        buf.put_slice(id.as_bytes());
        buf.put_slice(&target.host.octets());
        buf.put_u16(target.port);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// The session id this frame refers to.
    pub fn id(&self) -> SessionId {
        match self {
            Frame::Data { id, .. }
            | Frame::Disconnect { id }
            | Frame::ProgramClose { id }
            | Frame::Unknown { id, .. } => *id,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Data {
                id,
                target,
                payload,
            } => write!(fmt, "Data {id} -> {target} ({} bytes)", payload.len()),
            Frame::Disconnect { id } => write!(fmt, "Disconnect {id}"),
            Frame::ProgramClose { id } => write!(fmt, "ProgramClose {id}"),
            Frame::Unknown { cmd, id, data_len } => {
                write!(fmt, "Unknown cmd {cmd:#04x} {id} ({data_len} bytes)")
            }
        }
    }
}
