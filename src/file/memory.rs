//! Owned buffers as a [`Backend`].
//!
//! Images taken out of an archive, and archives embedded in the host, arrive as `Vec<u8>`.
//! [`Memory`] takes ownership of such a buffer so [`crate::file::Image`] and
//! [`crate::archive::ZipArchiveIndex`] can borrow from it for as long as they live.

use super::Backend;
use crate::Result;

/// An image or archive held in an owned buffer.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Takes ownership of `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(out_of_bounds_error!())
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_memory_header_slices() {
        let mut data = vec![0u8; 0x400];
        data[..2].copy_from_slice(b"MZ");
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        data[0x80..0x84].copy_from_slice(b"PE\0\0");

        let memory = Memory::new(data);

        assert_eq!(memory.len(), 0x400);
        assert_eq!(memory.data_slice(0, 2).unwrap(), b"MZ");
        assert_eq!(memory.data_slice(0x3C, 4).unwrap(), &[0x80, 0, 0, 0]);
        assert_eq!(memory.data_slice(0x80, 4).unwrap(), b"PE\0\0");
        assert_eq!(memory.data_slice(0x400, 0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_memory_truncated_reads() {
        let memory = Memory::new(vec![0x4D, 0x5A]);

        assert!(matches!(
            memory.data_slice(1, 2),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            memory.data_slice(usize::MAX, 1),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(memory.data_slice(3, 0).is_err());
    }
}
