//! Stream framing for the Meshtastic serial API.
//!
//! On a serial link every protobuf is preceded by a four byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything between frames (boot banners, debug console text) is skipped by scanning
//! for the next magic byte. Declared lengths of zero or above [`MAX_DECODE_LEN`] are
//! treated as garbage and the scanner advances one byte.
use bytes::{Buf, Bytes, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload the firmware accepts from a client.
pub const MAX_ENCODE_LEN: usize = 512;
/// Tolerance when reading; larger lengths trigger resync.
const MAX_DECODE_LEN: usize = 8192;

/// Incremental decoder fed with arbitrary chunks.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, if any.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if !(self.buf[0] == START1 && self.buf[1] == START2) {
                match self.buf.iter().skip(1).position(|&b| b == START1) {
                    Some(pos) => self.buf.advance(pos + 1),
                    None => {
                        // Keep nothing: no magic byte anywhere in the buffer
                        self.buf.clear();
                        return None;
                    }
                }
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_DECODE_LEN {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).freeze());
        }
    }
}

/// Prefix `payload` with the serial header. Returns `None` when it exceeds [`MAX_ENCODE_LEN`].
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_ENCODE_LEN {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_console_text_between_frames() {
        let mut framer = StreamFramer::new();
        let mut stream = b"INFO  | ??:??:?? 2 Booting\r\n".to_vec();
        stream.extend(encode_frame(&[0x08, 0x01]).unwrap());
        stream.extend_from_slice(b"DEBUG noise");
        stream.extend(encode_frame(&[0x38, 0xac, 0x9c, 0x04]).unwrap());
        framer.push(&stream);
        assert_eq!(framer.next_frame().unwrap().as_ref(), &[0x08, 0x01]);
        assert_eq!(
            framer.next_frame().unwrap().as_ref(),
            &[0x38, 0xac, 0x9c, 0x04]
        );
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn waits_for_split_frames() {
        let mut framer = StreamFramer::new();
        let frame = encode_frame(b"hello").unwrap();
        framer.push(&frame[..3]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[3..6]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[6..]);
        assert_eq!(framer.next_frame().unwrap().as_ref(), b"hello");
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn resyncs_after_bogus_length() {
        let mut framer = StreamFramer::new();
        // Header claiming a 0xFFFF payload, then a valid frame
        let mut stream = vec![START1, START2, 0xFF, 0xFF];
        stream.extend(encode_frame(b"ok").unwrap());
        framer.push(&stream);
        assert_eq!(framer.next_frame().unwrap().as_ref(), b"ok");
    }

    #[test]
    fn encoder_rejects_oversize() {
        assert!(encode_frame(&vec![0u8; MAX_ENCODE_LEN + 1]).is_none());
        let max = encode_frame(&vec![0u8; MAX_ENCODE_LEN]).unwrap();
        assert_eq!(&max[..4], &[START1, START2, 0x02, 0x00]);
    }
}
