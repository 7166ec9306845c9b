//! Little-endian primitive reading and writing for PE structures.
//!
//! Every multi-byte field in a PE image is little-endian, so this module
//! only carries the LE direction. All operations are bounds-checked and
//! fail with [`crate::Error::OutOfBounds`] rather than panicking.

use crate::{Error::OutOfBounds, Result};

/// Trait for primitive types that can be read from / written to a byte
/// buffer in little-endian order.
///
/// Implemented for the unsigned integer widths the PE format uses. The
/// associated `Bytes` type is the fixed-size array holding the encoded
/// form.
pub trait LeField: Sized {
    /// Fixed-size byte array type for this field width.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]> + AsRef<[u8]>;

    /// Decode from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Encode into little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_field {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl LeField for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_le_field!(u8 => 1, u16 => 2, u32 => 4, u64 => 8);

/// Reads a `T` at `*offset`, advancing the offset on success.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()`
/// bytes remain.
pub fn read_le_at<T: LeField>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T::Bytes>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Writes a `T` at `*offset` into a pre-sized buffer, advancing the offset
/// on success.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: LeField>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let type_len = bytes.as_ref().len();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes.as_ref());
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_widths() {
        let mut offset = 0;
        assert_eq!(read_le_at::<u8>(&TEST_BUFFER, &mut offset).unwrap(), 0x01);
        assert_eq!(read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap(), 0x0302);
        assert_eq!(
            read_le_at::<u32>(&TEST_BUFFER, &mut offset).unwrap(),
            0x0706_0504
        );
        assert_eq!(offset, 7);
    }

    #[test]
    fn read_u64() {
        let mut offset = 0;
        assert_eq!(
            read_le_at::<u64>(&TEST_BUFFER, &mut offset).unwrap(),
            0x0807_0605_0403_0201
        );
    }

    #[test]
    fn read_out_of_bounds() {
        let mut offset = 4;
        let result = read_le_at::<u64>(&TEST_BUFFER, &mut offset);
        assert!(matches!(result, Err(OutOfBounds)));
        assert_eq!(offset, 4);
    }

    #[test]
    fn write_widths() {
        let mut buffer = [0u8; 8];
        let mut offset = 0;
        write_le_at(&mut buffer, &mut offset, 0x1234u16).unwrap();
        write_le_at(&mut buffer, &mut offset, 0x5678_9ABCu32).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(buffer, [0x34, 0x12, 0xBC, 0x9A, 0x78, 0x56, 0x00, 0x00]);
    }

    #[test]
    fn write_out_of_bounds() {
        let mut buffer = [0u8; 2];
        let mut offset = 0;
        let result = write_le_at(&mut buffer, &mut offset, 0x1234_5678u32);
        assert!(matches!(result, Err(OutOfBounds)));
    }

    #[test]
    fn round_trip() {
        let mut buffer = [0u8; 4];
        let mut offset = 0;
        write_le_at(&mut buffer, &mut offset, 0xDEAD_BEEFu32).unwrap();
        offset = 0;
        assert_eq!(
            read_le_at::<u32>(&buffer, &mut offset).unwrap(),
            0xDEAD_BEEF
        );
    }
}
