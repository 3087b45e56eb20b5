//! Cursor based parsing over a byte slice.
//!
//! [`crate::file::parser::Parser`] wraps a byte slice with a position and offers bounds-checked
//! reads of the little-endian primitives, pointer-sized fields and null-terminated strings that
//! make up the import, export and TLS tables of a PE image.
//!
//! # Examples
//!
//! ```rust
//! use memimport::Parser;
//!
//! let data = [0x34, 0x12, b'f', b'o', b'o', 0x00];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_le::<u16>()?, 0x1234);
//! assert_eq!(parser.read_string_utf8()?, "foo");
//! assert_eq!(parser.remaining(), 0);
//! # Ok::<(), memimport::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, ByteIO},
    Result,
};

/// A bounds-checked reader over a borrowed byte slice.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Move the current position to the specified index.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns the number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Read a type `T` from the current position in little-endian format and advance the
    /// position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_le<T: ByteIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read a pointer-sized field, 8 bytes for PE32+ images and 4 bytes otherwise.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_pointer(&mut self, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read_le::<u64>()
        } else {
            Ok(u64::from(self.read_le::<u32>()?))
        }
    }

    /// Reads a null-terminated UTF-8 string and positions the cursor after the terminator.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no terminator is found before the end of the
    /// data, or [`crate::Error::Malformed`] for invalid UTF-8.
    pub fn read_string_utf8(&mut self) -> Result<String> {
        let start = self.position;
        let Some(length) = self
            .data
            .get(start..)
            .and_then(|rest| rest.iter().position(|byte| *byte == 0))
        else {
            return Err(out_of_bounds_error!());
        };

        let end = start + length;
        self.position = end + 1;

        String::from_utf8(self.data[start..end].to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                end,
                e.utf8_error()
            )
        })
    }

    /// Reads a slice of bytes of the specified length from the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `length` bytes would exceed the data.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;

        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}
