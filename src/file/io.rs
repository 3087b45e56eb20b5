//! Little-endian, bounds-checked reading and writing of primitive values.
//!
//! Every multi-byte field in a PE image is little-endian. The helpers in this module read and
//! write such fields from and to byte buffers, failing with [`crate::Error::OutOfBounds`]
//! instead of panicking when the buffer is too short.
//!
//! # Key Components
//!
//! - [`crate::file::io::ByteIO`] - Conversion between a primitive and its byte array
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Reading
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Writing
//!
//! # Examples
//!
//! ```rust
//! use memimport::file::io::{read_le_at, write_le};
//!
//! let mut data = [0u8; 6];
//! write_le(&mut data, 0x0403_0201_u32)?;
//!
//! let mut offset = 0;
//! let low: u16 = read_le_at(&data, &mut offset)?;
//! let high: u16 = read_le_at(&data, &mut offset)?;
//! assert_eq!((low, high, offset), (0x0201, 0x0403, 4));
//! # Ok::<(), memimport::Error>(())
//! ```

use crate::Result;

/// Trait for primitives that can be converted from and to little-endian byte arrays.
///
/// Implemented for the integer widths found in PE structures.
pub trait ByteIO: Sized {
    /// The byte array type for this numeric type.
    type Bytes: AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_byte_io {
    ($($ty:ty),*) => {
        $(
            impl ByteIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

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

impl_byte_io!(u8, u16, u32, u64, i32, i64);

/// Reads a value of type `T` in little-endian byte order from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: ByteIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value of type `T` in little-endian byte order at `offset`, advancing the offset by
/// the number of bytes read.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: ByteIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = <T::Bytes as TryFrom<&[u8]>>::try_from(&data[*offset..end]) else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Writes `value` in little-endian byte order to the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le<T: ByteIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Writes `value` in little-endian byte order at `offset`, advancing the offset by the number
/// of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: ByteIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };

    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let bytes = value.to_le_bytes();
    data[*offset..end].copy_from_slice(bytes.as_ref());
    *offset = end;

    Ok(())
}
