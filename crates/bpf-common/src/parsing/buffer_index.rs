//! `BufferIndex` locates a variable-length argument inside the payload of a
//! record. Kernel code appends strings and argument vectors after the fixed
//! part of the payload and stores their position as `(start, len)`.

use std::{
    marker::PhantomData,
    str::{Utf8Error, from_utf8},
};

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Size of a `BufferIndex` on the wire: two little-endian `u16`.
pub const BUFFER_INDEX_SIZE: usize = 4;

#[derive(Debug)]
pub struct BufferIndex<T: ?Sized> {
    start: u16,
    len: u16,
    /// What the pointed-at bytes represent.
    _data: PhantomData<T>,
}

impl<T: ?Sized> Clone for BufferIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for BufferIndex<T> {}

impl<T: ?Sized> PartialEq for BufferIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.len == other.len
    }
}

impl<T: ?Sized> Eq for BufferIndex<T> {}

impl<T: ?Sized> BufferIndex<T> {
    pub const fn new(start: u16, len: u16) -> Self {
        Self {
            start,
            len,
            _data: PhantomData,
        }
    }

    /// Read an index from the fixed part of a payload.
    pub fn read(buf: &mut impl Buf) -> Self {
        let start = buf.get_u16_le();
        let len = buf.get_u16_le();
        Self::new(start, len)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The pointed-at slice, or `IndexError::IndexOutsideBuffer` when the
    /// buffer is too short.
    pub fn bytes<'a>(&self, buffer: &'a Bytes) -> Result<&'a [u8], IndexError> {
        let start = self.start as usize;
        let end = start + self.len as usize;
        buffer
            .get(start..end)
            .ok_or(IndexError::IndexOutsideBuffer {
                start,
                end,
                len: buffer.len(),
            })
    }
}

impl BufferIndex<str> {
    /// The pointed-at utf8 string, without its NUL terminator.
    pub fn string(&self, buffer: &Bytes) -> Result<String, IndexError> {
        let bytes = self.bytes(buffer)?;
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        from_utf8(bytes)
            .map(str::to_string)
            .map_err(|error| IndexError::NotAString {
                error,
                bytes: bytes.to_vec(),
            })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("Index [{start}-{end}] is out of event buffer (len {len})")]
    IndexOutsideBuffer {
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("Index is not pointing to a valid string. {bytes:?}")]
    NotAString {
        #[source]
        error: Utf8Error,
        bytes: Vec<u8>,
    },
}
