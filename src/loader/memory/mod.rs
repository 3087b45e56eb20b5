//! Memory reservation and page protection for mapped images.
//!
//! The loader never touches process memory directly. It asks a [`MemoryBackend`] for one
//! contiguous [`MappedRegion`] per image, fills it while every page is read-write, and finally
//! seals it page range by page range. Dropping a region releases it, which is what makes the
//! failure paths of the loader leak-free.
//!
//! Two backends are provided:
//! - [`NativeMemory`] reserves real pages from the operating system
//! - [`HeapMemory`] hands out heap buffers at synthetic addresses, for inspection and tests
//!
//! Both refuse to make a page writable and executable at the same time.

mod heap;
mod native;

use bitflags::bitflags;

use crate::{
    file::io::{read_le, write_le, ByteIO},
    Error, Result,
};

pub use heap::{HeapMemory, DEFAULT_HEAP_BASE, DEFAULT_MAX_RESERVATION};
pub use native::NativeMemory;

bitflags! {
    /// Access rights of a mapped page.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        /// Page can be read
        const READ = 0x01;
        /// Page can be written
        const WRITE = 0x02;
        /// Page can be executed
        const EXECUTE = 0x04;
    }
}

impl Protection {
    /// Derives the protection of a section from its `Characteristics` field.
    #[must_use]
    pub fn from_characteristics(characteristics: u32) -> Protection {
        let mut protection = Protection::empty();
        if characteristics & 0x2000_0000 != 0 {
            // IMAGE_SCN_MEM_EXECUTE
            protection |= Protection::EXECUTE;
        }
        if characteristics & 0x4000_0000 != 0 {
            // IMAGE_SCN_MEM_READ
            protection |= Protection::READ;
        }
        if characteristics & 0x8000_0000 != 0 {
            // IMAGE_SCN_MEM_WRITE
            protection |= Protection::WRITE;
        }
        protection
    }

    /// Returns `true` if the protection is both writable and executable.
    #[must_use]
    pub fn is_write_execute(self) -> bool {
        self.contains(Protection::WRITE | Protection::EXECUTE)
    }
}

/// A source of mappable memory.
pub trait MemoryBackend: Send + Sync {
    /// The granularity at which protections can be changed.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of zeroed, read-write memory.
    ///
    /// `preferred` is the address the image was linked for. Backends may use it as a
    /// placement hint but are free to return any page-aligned base.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory cannot be reserved.
    fn reserve(&self, size: usize, preferred: Option<u64>) -> Result<Box<dyn MappedRegion>>;
}

/// One contiguous reservation. Dropping it releases the memory.
pub trait MappedRegion: Send + Sync {
    /// Address of the first byte.
    fn base(&self) -> u64;

    /// Length in bytes, a multiple of the page size.
    fn len(&self) -> usize;

    /// Returns `true` if the region spans no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether instructions in the region can actually be executed by the processor.
    fn is_executable(&self) -> bool {
        false
    }

    /// Current protection of the page containing `offset`.
    fn protection_at(&self, offset: usize) -> Protection;

    /// Borrows `len` bytes at `offset`; every page touched must be readable.
    ///
    /// # Errors
    ///
    /// [`crate::Error::OutOfBounds`] outside the region, [`crate::Error::AccessDenied`] for
    /// pages without read access.
    fn read(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Copies `data` to `offset`; every page touched must be writable.
    ///
    /// # Errors
    ///
    /// [`crate::Error::OutOfBounds`] outside the region, [`crate::Error::AccessDenied`] for
    /// pages without write access.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Changes the protection of the pages covering `offset..offset + len`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WriteExecute`] for writable and executable requests, or an error from
    /// the operating system.
    fn protect(&mut self, offset: usize, len: usize, protection: Protection) -> Result<()>;
}

impl<'a> dyn MappedRegion + 'a {
    /// Reads a little-endian value at `offset`.
    ///
    /// # Errors
    ///
    /// See [`MappedRegion::read`].
    pub fn read_le<T: ByteIO>(&self, offset: usize) -> Result<T> {
        read_le(self.read(offset, std::mem::size_of::<T>())?)
    }

    /// Writes a little-endian value at `offset`.
    ///
    /// # Errors
    ///
    /// See [`MappedRegion::write`].
    pub fn write_le<T: ByteIO>(&mut self, offset: usize, value: T) -> Result<()> {
        let mut buffer = [0u8; 8];
        let width = std::mem::size_of::<T>();
        write_le(&mut buffer[..width], value)?;
        self.write(offset, &buffer[..width])
    }

    /// Reads a pointer-sized value, 8 bytes for PE32+ and 4 bytes otherwise.
    ///
    /// # Errors
    ///
    /// See [`MappedRegion::read`].
    pub fn read_pointer(&self, offset: usize, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read_le::<u64>(offset)
        } else {
            Ok(u64::from(self.read_le::<u32>(offset)?))
        }
    }

    /// Writes a pointer-sized value, 8 bytes for PE32+ and 4 bytes otherwise.
    ///
    /// # Errors
    ///
    /// See [`MappedRegion::write`], and [`crate::Error::Relocation`] if the value does not
    /// fit into 32 bits for a PE32 image.
    pub fn write_pointer(&mut self, offset: usize, value: u64, is_64: bool) -> Result<()> {
        if is_64 {
            self.write_le::<u64>(offset, value)
        } else {
            let narrow = u32::try_from(value).map_err(|_| {
                relocation_error!("Address 0x{:X} does not fit a 32-bit image", value)
            })?;
            self.write_le::<u32>(offset, narrow)
        }
    }
}

/// Per-page protection bookkeeping shared by the backends.
#[derive(Debug)]
pub(crate) struct PageTable {
    page_size: usize,
    pages: Vec<Protection>,
}

impl PageTable {
    /// A table for `len` bytes, every page read-write.
    pub(crate) fn new(page_size: usize, len: usize) -> PageTable {
        PageTable {
            page_size,
            pages: vec![Protection::READ | Protection::WRITE; len.div_ceil(page_size)],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len() * self.page_size
    }

    pub(crate) fn get(&self, offset: usize) -> Protection {
        self.pages
            .get(offset / self.page_size)
            .copied()
            .unwrap_or_default()
    }

    /// Verifies `offset..offset + len` lies in the region and carries `required` on every page.
    pub(crate) fn check(
        &self,
        base: u64,
        offset: usize,
        len: usize,
        required: Protection,
    ) -> Result<()> {
        let Some(end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        if end > self.len() {
            return Err(out_of_bounds_error!());
        }
        if len == 0 {
            return Ok(());
        }

        for page in offset / self.page_size..=(end - 1) / self.page_size {
            if !self.pages[page].contains(required) {
                let address = base + (page * self.page_size).max(offset) as u64;
                return Err(Error::AccessDenied { address, required });
            }
        }

        Ok(())
    }

    /// Page-aligned bounds of `offset..offset + len`.
    pub(crate) fn span(&self, offset: usize, len: usize) -> Result<(usize, usize)> {
        let Some(end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        if end > self.len() {
            return Err(out_of_bounds_error!());
        }

        let first = offset - offset % self.page_size;
        let last = align_up!(end, self.page_size);
        Ok((first, last - first))
    }

    pub(crate) fn set(&mut self, offset: usize, len: usize, protection: Protection) {
        let first = offset / self.page_size;
        let count = len.div_ceil(self.page_size);
        for page in self.pages.iter_mut().skip(first).take(count) {
            *page = protection;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristics() {
        assert_eq!(
            Protection::from_characteristics(0x6000_0020),
            Protection::READ | Protection::EXECUTE
        );
        assert_eq!(
            Protection::from_characteristics(0xC000_0040),
            Protection::READ | Protection::WRITE
        );
        assert_eq!(
            Protection::from_characteristics(0x4000_0040),
            Protection::READ
        );
        assert!(Protection::from_characteristics(0xE000_0020).is_write_execute());
        assert!(Protection::from_characteristics(0x0000_0080).is_empty());
    }

    #[test]
    fn test_page_table_checks() {
        let mut table = PageTable::new(0x1000, 0x3000);
        assert_eq!(table.len(), 0x3000);

        table.set(0x1000, 0x1000, Protection::READ);
        table.set(0x2000, 0x1000, Protection::empty());

        assert!(table.check(0, 0x0FF0, 0x20, Protection::READ).is_ok());
        assert!(matches!(
            table.check(0x10_0000, 0x0FF0, 0x20, Protection::WRITE),
            Err(Error::AccessDenied {
                address: 0x10_1000,
                ..
            })
        ));
        assert!(table.check(0, 0x2000, 1, Protection::READ).is_err());
        assert!(table.check(0, 0x2FFF, 2, Protection::empty()).is_err());
        assert!(table.check(0, 0x3000, 0, Protection::READ).is_ok());
        assert_eq!(table.get(0x2ABC), Protection::empty());
    }

    #[test]
    fn test_page_table_span() {
        let table = PageTable::new(0x1000, 0x4000);
        assert_eq!(table.span(0x1234, 0x10).unwrap(), (0x1000, 0x1000));
        assert_eq!(table.span(0x0FFF, 0x2).unwrap(), (0x0000, 0x2000));
        assert!(table.span(0x3FFF, 2).is_err());
    }
}
