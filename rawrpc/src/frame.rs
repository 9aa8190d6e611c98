//! Wire framing: `[u32 little-endian length N][N bytes of body]`.
//!
//! TCP delivers a byte stream, so the receive side accumulates bytes in a
//! [`FrameDecoder`] and only hands out complete bodies. Surplus bytes after
//! a frame stay buffered for the next one.

use std::borrow::{Borrow, BorrowMut};
use std::io::Read;

use crate::error::Error;

pub const HEAD_SIZE: usize = 4;

pub fn parse_head(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEAD_SIZE {
        return None;
    }
    let tmp: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
    Some(u32::from_le_bytes(tmp) as usize)
}

/// Write the prefix for a body of `len` bytes.
///
/// Callers check `len` against their frame limit, which is at most
/// `u32::MAX`.
pub fn build_head(len: usize, output: &mut [u8]) {
    debug_assert!(len <= u32::MAX as usize, "frame body of {len} bytes");
    let tmp = (len as u32).to_le_bytes();
    output[..HEAD_SIZE].copy_from_slice(&tmp);
}

/// Append one frame carrying `body` to `output`.
pub fn encode(body: &[u8], output: &mut Vec<u8>) {
    let start = output.len();
    output.resize(start + HEAD_SIZE, 0);
    build_head(body.len(), &mut output[start..]);
    output.extend_from_slice(body);
}

/// Append one frame whose body is written in place by `f`.
///
/// The head is reserved first and patched once the body length is known.
pub fn encode_with<F, E>(output: &mut Vec<u8>, f: F) -> Result<(), E>
where
    F: FnOnce(&mut Vec<u8>) -> Result<(), E>,
{
    let start = output.len();
    output.resize(start + HEAD_SIZE, 0);
    f(output)?;
    let len = output.len() - start - HEAD_SIZE;
    build_head(len, &mut output[start..]);
    Ok(())
}

/// Accumulates inbound bytes and splits them into frame bodies.
///
/// The backing buffer is usually a pooled one. It grows when a declared
/// frame does not fit, and shrinks back to its initial size once drained.
pub struct FrameDecoder<B = Vec<u8>> {
    buf: B,
    start: usize,
    end: usize,
    initial: usize,
    max_frame_size: usize,
}

impl<B: BorrowMut<Vec<u8>>> FrameDecoder<B> {
    pub fn new(mut buf: B, max_frame_size: usize) -> Self {
        let v = <B as BorrowMut<Vec<u8>>>::borrow_mut(&mut buf);
        if v.len() < HEAD_SIZE {
            v.resize(HEAD_SIZE, 0);
        }
        let initial = v.len();
        Self {
            buf,
            start: 0,
            end: 0,
            initial,
            max_frame_size,
        }
    }

    fn vec(&self) -> &Vec<u8> {
        <B as Borrow<Vec<u8>>>::borrow(&self.buf)
    }

    fn vec_mut(&mut self) -> &mut Vec<u8> {
        <B as BorrowMut<Vec<u8>>>::borrow_mut(&mut self.buf)
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    // Declared body length of the frame at the front, if its head arrived.
    fn pending_len(&self) -> Result<Option<usize>, Error> {
        match parse_head(&self.vec()[self.start..self.end]) {
            Some(len) if len > self.max_frame_size => {
                Err(Error::FrameTooLarge(len, self.max_frame_size))
            }
            other => Ok(other),
        }
    }

    /// Free space to read into. Compacts or grows the buffer as needed.
    pub fn spare_mut(&mut self) -> Result<&mut [u8], Error> {
        let (start, end) = (self.start, self.end);
        if end == self.vec().len() && start > 0 {
            self.vec_mut().copy_within(start..end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.vec().len() {
            let len = self.vec().len();
            let want = match self.pending_len()? {
                Some(body) => HEAD_SIZE + body,
                None => len + HEAD_SIZE,
            };
            self.vec_mut().resize(want.max(len + 1), 0);
        }
        let end = self.end;
        Ok(&mut self.vec_mut()[end..])
    }

    /// Mark `n` bytes of the spare space as filled.
    pub fn filled(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.vec().len());
        self.end += n;
    }

    /// Read once from `r` into the spare space.
    pub fn read_from<R: Read>(&mut self, mut r: R) -> Result<usize, Error> {
        let spare = self.spare_mut()?;
        let n = r.read(spare)?;
        self.filled(n);
        Ok(n)
    }

    /// Copy `bytes` in, as if they had been read from a socket.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        while !bytes.is_empty() {
            let spare = self.spare_mut()?;
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.filled(n);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Take the next complete frame body, if one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, Error> {
        if self.start == self.end {
            self.reset();
            return Ok(None);
        }
        let Some(len) = self.pending_len()? else {
            return Ok(None);
        };
        let body_start = self.start + HEAD_SIZE;
        if self.end - body_start < len {
            return Ok(None);
        }
        self.start = body_start + len;
        Ok(Some(&self.vec()[body_start..body_start + len]))
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        let initial = self.initial;
        let buf = self.vec_mut();
        if buf.len() > initial {
            buf.truncate(initial);
            buf.shrink_to(initial);
        }
    }
}
