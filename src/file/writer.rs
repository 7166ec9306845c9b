//! Growing byte buffer for emitting PE structures.
//!
//! [`Writer`] is the serialization counterpart of
//! [`crate::file::parser::Parser`]: append-only little-endian writes,
//! raw bytes, zero-terminated and zero-padded strings, alignment padding,
//! and forward zero-fill to an absolute offset. The write pipeline runs
//! after all layout decisions are final, so a request to move backwards is
//! a [`crate::Error::WriteLayoutFailed`], not something to patch around.

use crate::{file::io::LeField, Result};

/// An append-only byte buffer with alignment helpers.
#[derive(Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    /// Consume the writer and return the emitted bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Append a little-endian value.
    pub fn write_le<T: LeField>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `len` zero bytes.
    pub fn pad(&mut self, len: usize) {
        self.data.resize(self.data.len() + len, 0);
    }

    /// Zero-pad until the offset is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(alignment.is_power_of_two());
        let aligned = (self.data.len() + alignment - 1) & !(alignment - 1);
        self.data.resize(aligned, 0);
    }

    /// Append an ASCII string followed by its zero terminator.
    pub fn write_string_ascii(&mut self, value: &str) {
        debug_assert!(value.is_ascii());
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    /// Append an ASCII string zero-padded to exactly `len` bytes.
    ///
    /// # Errors
    /// [`crate::Error::WriteLayoutFailed`] if the string does not fit.
    pub fn write_string_ascii_padded(&mut self, value: &str, len: usize) -> Result<()> {
        debug_assert!(value.is_ascii());
        if value.len() > len {
            return Err(crate::Error::WriteLayoutFailed {
                message: format!("string '{}' does not fit in {} bytes", value, len),
            });
        }

        self.data.extend_from_slice(value.as_bytes());
        self.pad(len - value.len());
        Ok(())
    }

    /// Zero-fill forward until the buffer is exactly `offset` bytes long.
    ///
    /// # Errors
    /// [`crate::Error::WriteLayoutFailed`] if the buffer has already grown
    /// past `offset`, meaning serialization has diverged from the reserved layout.
    pub fn ensure_at(&mut self, offset: usize) -> Result<()> {
        if self.data.len() > offset {
            return Err(crate::Error::WriteLayoutFailed {
                message: format!(
                    "already at offset {}, cannot rewind to {}",
                    self.data.len(),
                    offset
                ),
            });
        }

        self.data.resize(offset, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_writes() {
        let mut writer = Writer::new();
        writer.write_le(0x0201u16);
        writer.write_le(0x0605_0403u32);
        writer.write_bytes(&[0x07, 0x08]);

        assert_eq!(writer.offset(), 8);
        assert_eq!(
            writer.into_bytes(),
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn align_and_pad() {
        let mut writer = Writer::new();
        writer.write_le(0xFFu8);
        writer.align(4);
        assert_eq!(writer.offset(), 4);
        writer.align(4);
        assert_eq!(writer.offset(), 4);
        writer.pad(3);
        assert_eq!(writer.into_bytes(), [0xFF, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn strings() {
        let mut writer = Writer::new();
        writer.write_string_ascii("abc");
        writer.write_string_ascii_padded(".text", 8).unwrap();
        assert_eq!(
            writer.into_bytes(),
            [b'a', b'b', b'c', 0, b'.', b't', b'e', b'x', b't', 0, 0, 0]
        );

        let mut writer = Writer::new();
        assert!(writer.write_string_ascii_padded("too long!", 8).is_err());
    }

    #[test]
    fn ensure_at_forward_only() {
        let mut writer = Writer::new();
        writer.write_le(0xAAu8);
        writer.ensure_at(4).unwrap();
        assert_eq!(writer.offset(), 4);

        assert!(writer.ensure_at(2).is_err());
    }
}
