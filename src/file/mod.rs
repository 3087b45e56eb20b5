//! PE image access and validation.
//!
//! This module provides the validated, read-only view of a raw PE image that the loader works
//! from. It abstracts over different data sources (files, memory) and checks every structural
//! property the loader relies on before a single byte of process memory is reserved.
//!
//! # Key Components
//!
//! ## Core Types
//! - [`crate::file::Image`] - Parsed and validated PE image
//! - [`crate::file::Backend`] - Trait for different data sources (disk files, memory buffers)
//! - [`crate::file::Machine`] - The target architectures the loader understands
//!
//! ## Parsing Infrastructure
//! - [`crate::file::parser::Parser`] - Cursor based reader for in-image tables
//! - [`crate::file::io`] - Low-level little-endian reading and writing
//!
//! ## Backend Implementations
//! - [`crate::file::Physical`] - Memory-mapped file backend for disk access
//! - [`crate::file::Memory`] - In-memory buffer backend
//!
//! # Validation
//!
//! [`crate::file::Image::from_mem`] and [`crate::file::Image::from_file`] reject:
//! - empty input
//! - anything goblin cannot parse as PE/COFF
//! - images without an optional header
//! - PE32 / PE32+ magic that disagrees with the COFF machine
//! - a zero or non power-of-two `SectionAlignment`, or a zero `SizeOfImage`
//! - headers or sections that do not fit into `SizeOfImage`
//! - section raw data that lies outside the input
//!
//! # Examples
//!
//! ```rust,no_run
//! use memimport::file::Image;
//!
//! let data = std::fs::read("spam.pyd")?;
//! let image = Image::from_mem(data)?;
//!
//! println!("Image base: 0x{:x}", image.imagebase());
//! for section in image.sections() {
//!     let name = std::str::from_utf8(&section.name)
//!         .unwrap_or("<invalid>")
//!         .trim_end_matches('\0');
//!     println!("{} at RVA 0x{:x}", name, section.virtual_address);
//! }
//! # Ok::<(), memimport::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::Empty, Result};
use goblin::pe::{
    data_directories::DataDirectoryType, header::Header, section_table::SectionTable, PE,
};
use ouroboros::self_referencing;

pub use memory::Memory;
pub use physical::Physical;

/// `IMAGE_FILE_RELOCS_STRIPPED`
const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
/// `IMAGE_FILE_DLL`
const IMAGE_FILE_DLL: u16 = 0x2000;

/// Backend trait for file data sources.
///
/// This trait abstracts over the source of raw bytes, allowing for both in-memory and on-disk
/// representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// Target architectures an image can be built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Machine {
    /// `IMAGE_FILE_MACHINE_I386`, PE32 only
    I386,
    /// `IMAGE_FILE_MACHINE_AMD64`, PE32+ only
    Amd64,
    /// `IMAGE_FILE_MACHINE_ARM64`, PE32+ only
    Arm64,
}

impl Machine {
    /// Maps a COFF `Machine` field to a known architecture.
    #[must_use]
    pub fn from_coff(machine: u16) -> Option<Machine> {
        match machine {
            0x014C => Some(Machine::I386),
            0x8664 => Some(Machine::Amd64),
            0xAA64 => Some(Machine::Arm64),
            _ => None,
        }
    }

    /// The COFF `Machine` field value of this architecture.
    #[must_use]
    pub fn coff(self) -> u16 {
        match self {
            Machine::I386 => 0x014C,
            Machine::Amd64 => 0x8664,
            Machine::Arm64 => 0xAA64,
        }
    }

    /// Returns `true` if images for this architecture use the PE32+ format.
    #[must_use]
    pub fn is_64(self) -> bool {
        !matches!(self, Machine::I386)
    }

    /// The architecture of the running process, if it is one images can be built for.
    #[must_use]
    pub fn host() -> Option<Machine> {
        if cfg!(target_arch = "x86_64") {
            Some(Machine::Amd64)
        } else if cfg!(target_arch = "x86") {
            Some(Machine::I386)
        } else if cfg!(target_arch = "aarch64") {
            Some(Machine::Arm64)
        } else {
            None
        }
    }
}

#[self_referencing]
/// A parsed and validated PE image.
///
/// This struct wraps the parsed PE and provides access to headers, sections and data
/// directories. Construction fails for any image the loader could not map faithfully, see the
/// [module documentation](crate::file) for the list of checks.
///
/// # Examples
///
/// ```rust,no_run
/// use memimport::file::Image;
/// use std::path::Path;
///
/// let image = Image::from_file(Path::new("spam.pyd"))?;
/// println!("{} needs {:?}", image.len(), image.libraries());
/// # Ok::<(), memimport::Error>(())
/// ```
pub struct Image {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
    /// The parsed PE structure, referencing the data.
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl Image {
    /// Loads and validates a PE image from the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the image fails validation.
    pub fn from_file(file: &Path) -> Result<Image> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Loads and validates a PE image from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty or the image fails validation.
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        let input = Memory::new(data);

        Self::load(input)
    }

    /// Internal loader for any backend.
    fn load<T: Backend + 'static>(data: T) -> Result<Image> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let data = Box::new(data);

        Image::try_new(data, |data| {
            let data = data.as_ref();
            let pe = PE::parse(data.data())?;
            Self::validate(&pe, data.len())?;
            Ok(pe)
        })
    }

    /// Structural checks that goblin does not perform.
    fn validate(pe: &PE, file_len: usize) -> Result<()> {
        let Some(optional_header) = pe.header.optional_header else {
            return Err(malformed_error!("File does not have an OptionalHeader"));
        };

        let machine = pe.header.coff_header.machine;
        let Some(known) = Machine::from_coff(machine) else {
            return Err(malformed_error!("Unsupported machine type - 0x{:04X}", machine));
        };

        if known.is_64() != pe.is_64 {
            return Err(malformed_error!(
                "Optional header magic 0x{:X} does not match machine {:?}",
                optional_header.standard_fields.magic,
                known
            ));
        }

        let section_alignment = optional_header.windows_fields.section_alignment as u64;
        if section_alignment == 0 || !section_alignment.is_power_of_two() {
            return Err(malformed_error!(
                "Invalid section alignment - 0x{:X}",
                section_alignment
            ));
        }

        let size_of_image = optional_header.windows_fields.size_of_image as u64;
        if size_of_image == 0 {
            return Err(malformed_error!("SizeOfImage is zero"));
        }

        let size_of_headers = optional_header.windows_fields.size_of_headers as u64;
        if size_of_headers > size_of_image || size_of_headers > file_len as u64 {
            return Err(malformed_error!(
                "SizeOfHeaders 0x{:X} exceeds the image or the input",
                size_of_headers
            ));
        }

        for section in &pe.sections {
            let virtual_end = u64::from(section.virtual_address) + section_extent(section);
            if virtual_end > size_of_image {
                return Err(malformed_error!(
                    "Section {} ends at 0x{:X}, beyond SizeOfImage 0x{:X}",
                    section_name(section),
                    virtual_end,
                    size_of_image
                ));
            }

            let raw_len = section_copy_len(section);
            let raw_end = u64::from(section.pointer_to_raw_data) + raw_len;
            if raw_len != 0 && raw_end > file_len as u64 {
                return Err(malformed_error!(
                    "Raw data of section {} ends at 0x{:X}, beyond the input (0x{:X} bytes)",
                    section_name(section),
                    raw_end,
                    file_len
                ));
            }
        }

        Ok(())
    }

    /// Returns the total size of the input in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the input has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the preferred load address of the image.
    #[must_use]
    pub fn imagebase(&self) -> u64 {
        self.with_pe(|pe| pe.image_base)
    }

    /// Returns a reference to the PE header.
    #[must_use]
    pub fn header(&self) -> &Header {
        self.with_pe(|pe| &pe.header)
    }

    /// Returns the target architecture of the image.
    ///
    /// # Panics
    ///
    /// Never; the machine was verified during validation.
    #[must_use]
    pub fn machine(&self) -> Machine {
        self.with_pe(|pe| {
            Machine::from_coff(pe.header.coff_header.machine).unwrap_or(Machine::I386)
        })
    }

    /// Returns `true` for PE32+ images.
    #[must_use]
    pub fn is_64(&self) -> bool {
        self.with_pe(|pe| pe.is_64)
    }

    /// Returns `true` if the image is flagged as a dynamic-link library.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.characteristics() & IMAGE_FILE_DLL != 0
    }

    /// Returns `true` if the linker removed the relocation information.
    #[must_use]
    pub fn relocs_stripped(&self) -> bool {
        self.characteristics() & IMAGE_FILE_RELOCS_STRIPPED != 0
    }

    fn characteristics(&self) -> u16 {
        self.with_pe(|pe| pe.header.coff_header.characteristics)
    }

    /// Returns `SizeOfImage`, the number of bytes the mapped image spans.
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .map_or(0, |oh| oh.windows_fields.size_of_image as u32)
        })
    }

    /// Returns `SizeOfHeaders`, the number of header bytes mapped at the image base.
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .map_or(0, |oh| oh.windows_fields.size_of_headers as u32)
        })
    }

    /// Returns `SectionAlignment`.
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .map_or(0, |oh| oh.windows_fields.section_alignment as u32)
        })
    }

    /// Returns the RVA of the image entry point (`DllMain` for libraries), if there is one.
    #[must_use]
    pub fn entry_point(&self) -> Option<u32> {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .map(|oh| oh.standard_fields.address_of_entry_point as u32)
                .filter(|rva| *rva != 0)
        })
    }

    /// Returns an iterator over the section headers of the image.
    pub fn sections(&self) -> impl Iterator<Item = &SectionTable> {
        self.with_pe(|pe| pe.sections.iter())
    }

    /// Returns the names of the libraries the image imports from.
    #[must_use]
    pub fn libraries(&self) -> Vec<String> {
        self.with_pe(|pe| pe.libraries.iter().map(ToString::to_string).collect())
    }

    /// Returns the RVA and size of a specific data directory entry.
    ///
    /// Returns `None` if the directory doesn't exist or has zero address or size.
    #[must_use]
    pub fn get_data_directory(&self, dir_type: DataDirectoryType) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            pe.header.optional_header.and_then(|optional_header| {
                optional_header
                    .data_directories
                    .dirs()
                    .find(|(directory_type, directory)| {
                        *directory_type == dir_type
                            && directory.virtual_address != 0
                            && directory.size != 0
                    })
                    .map(|(_, directory)| (directory.virtual_address, directory.size))
            })
        })
    }

    /// Returns the raw data of the image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.with_data(|data| data.data())
    }

    /// Returns a slice of the raw data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.with_data(|data| data.data_slice(offset, len))
    }

    /// Converts a relative virtual address (RVA) to a file offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the RVA is not backed by raw data of any section.
    pub fn rva_to_offset(&self, rva: usize) -> Result<usize> {
        let rva_u64 = rva as u64;
        if rva_u64 < u64::from(self.size_of_headers()) {
            return Ok(rva);
        }

        self.with_pe(|pe| {
            for section in &pe.sections {
                let start = u64::from(section.virtual_address);
                let end = start + section_copy_len(section);
                if start <= rva_u64 && rva_u64 < end {
                    return Ok((rva - section.virtual_address as usize)
                        + section.pointer_to_raw_data as usize);
                }
            }

            Err(malformed_error!(
                "RVA could not be converted to offset - 0x{:X}",
                rva
            ))
        })
    }
}

/// The number of bytes a section spans once mapped.
pub(crate) fn section_extent(section: &SectionTable) -> u64 {
    if section.virtual_size == 0 {
        u64::from(section.size_of_raw_data)
    } else {
        u64::from(section.virtual_size)
    }
}

/// The number of raw bytes copied from the input for a section.
pub(crate) fn section_copy_len(section: &SectionTable) -> u64 {
    u64::from(section.size_of_raw_data).min(section_extent(section))
}

/// The section name without its null padding.
pub(crate) fn section_name(section: &SectionTable) -> String {
    String::from_utf8_lossy(&section.name)
        .trim_end_matches('\0')
        .to_string()
}
