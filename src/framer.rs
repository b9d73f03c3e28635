//! Reassembles the UART byte stream into whole frames.
//!
//! The framer owns one internal buffer. Each chunk read from the serial port
//! is appended with [`Framer::feed`]; [`Framer::next_frame`] then yields as
//! many complete frames as the buffer contains, in order, retaining any
//! trailing partial frame for the next read. The consumed prefix is dropped
//! as soon as a frame is emitted, so the buffer never holds more than one
//! in-progress frame.

use crate::codec::{CodecError, Frame};
use bytes::{Buf, BytesMut};
use std::io::Cursor;

#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Framer {
        Framer {
            // One page covers the common case of small interactive frames;
            // bulk transfers grow the buffer up to header + payload.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Appends a chunk of UART bytes to the reassembly buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extracts the next complete frame, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when only a partial frame is buffered. A
    /// [`CodecError::PayloadTooLarge`] means the link is corrupt; the caller
    /// must tear the tunnel down.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut cursor) {
            Ok(total) => {
                let frame = Frame::parse(&mut cursor)?;
                self.buffer.advance(total);
                Ok(Some(frame))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of bytes currently buffered; at most one partial frame after
    /// [`Framer::next_frame`] has been drained.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
