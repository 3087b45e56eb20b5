//! Base relocation processing.
//!
//! The relocation directory is a sequence of blocks, each covering one 4 KiB page:
//!
//! ```text
//! +----------------+----------------+-------+-------+-----+
//! | PageRVA (u32)  | BlockSize (u32)| entry | entry | ... |
//! +----------------+----------------+-------+-------+-----+
//! entry = type (4 bits) << 12 | offset within the page (12 bits)
//! ```
//!
//! Every entry names a location holding an absolute address that has to be moved by the
//! difference between the address the image was linked for and the address it was mapped at.

use crate::{file::parser::Parser, loader::MappedRegion, Result};

/// Base relocation types from the PE format specification.
mod kind {
    /// No-op relocation, used for padding to maintain alignment.
    pub const ABSOLUTE: u16 = 0;
    /// High 16 bits of the delta added to a WORD.
    pub const HIGH: u16 = 1;
    /// Low 16 bits of the delta added to a WORD.
    pub const LOW: u16 = 2;
    /// 32-bit address fixup (add delta to DWORD at offset).
    pub const HIGHLOW: u16 = 3;
    /// 64-bit address fixup (add delta to QWORD at offset).
    pub const DIR64: u16 = 10;
}

const BLOCK_HEADER_SIZE: usize = 8;

/// Moves every relocated address in `region` from `preferred` to `region.base()`.
///
/// ## Arguments
/// * `region`    - The mapped image, still writable
/// * `directory` - RVA and size of the relocation directory, if the image has one
/// * `stripped`  - Whether the image carries `IMAGE_FILE_RELOCS_STRIPPED`
/// * `preferred` - The image base from the optional header
/// * `is_64`     - Whether the image is PE32+
///
/// Returns the number of locations that were patched.
///
/// # Errors
/// Returns [`crate::Error::Relocation`] if the image has to move but cannot, or if the
/// directory is malformed in any way.
pub fn relocate(
    region: &mut dyn MappedRegion,
    directory: Option<(u32, u32)>,
    stripped: bool,
    preferred: u64,
    is_64: bool,
) -> Result<usize> {
    let base = region.base();
    if !is_64 && base + region.len() as u64 > u64::from(u32::MAX) {
        return Err(relocation_error!(
            "32-bit image mapped at 0x{:X} does not fit below 4 GiB",
            base
        ));
    }

    let delta = base.wrapping_sub(preferred);
    if delta == 0 {
        return Ok(0);
    }

    let (rva, size) = match directory {
        Some(directory) if !stripped => directory,
        _ => {
            return Err(relocation_error!(
                "Image prefers 0x{:X} but was mapped at 0x{:X} and has no relocations",
                preferred,
                base
            ))
        }
    };

    let start = rva as usize;
    let size = size as usize;
    if start.saturating_add(size) > region.len() {
        return Err(relocation_error!(
            "Relocation directory 0x{:X}+0x{:X} lies outside the image",
            rva,
            size
        ));
    }

    let table = region.read(start, size)?.to_vec();
    let mut parser = Parser::new(&table);
    let mut applied = 0;

    while parser.pos() < size {
        if size - parser.pos() < BLOCK_HEADER_SIZE {
            return Err(relocation_error!(
                "Truncated relocation block at 0x{:X}",
                rva as usize + parser.pos()
            ));
        }

        let block_offset = parser.pos();
        let page = parser.read_le::<u32>()? as usize;
        let block_size = parser.read_le::<u32>()? as usize;

        if page == 0 && block_size == 0 {
            break;
        }
        if block_size < BLOCK_HEADER_SIZE || block_offset + block_size > size {
            return Err(relocation_error!(
                "Relocation block at 0x{:X} has invalid size 0x{:X}",
                rva as usize + block_offset,
                block_size
            ));
        }

        for _ in 0..(block_size - BLOCK_HEADER_SIZE) / 2 {
            let entry = parser.read_le::<u16>()?;
            let target = page + (entry & 0x0FFF) as usize;

            let width = match entry >> 12 {
                kind::ABSOLUTE => continue,
                kind::HIGH | kind::LOW => 2,
                kind::HIGHLOW => 4,
                kind::DIR64 => 8,
                other => {
                    return Err(relocation_error!(
                        "Unsupported relocation type {} at 0x{:X}",
                        other,
                        target
                    ))
                }
            };

            if target.saturating_add(width) > region.len() {
                return Err(relocation_error!(
                    "Relocation at 0x{:X} lies outside the image (0x{:X} bytes)",
                    target,
                    region.len()
                ));
            }

            match entry >> 12 {
                kind::HIGH => {
                    let value = region.read_le::<u16>(target)?;
                    region.write_le::<u16>(target, value.wrapping_add((delta >> 16) as u16))?;
                }
                kind::LOW => {
                    let value = region.read_le::<u16>(target)?;
                    region.write_le::<u16>(target, value.wrapping_add(delta as u16))?;
                }
                kind::HIGHLOW => {
                    let value = region.read_le::<u32>(target)?;
                    region.write_le::<u32>(target, value.wrapping_add(delta as u32))?;
                }
                _ => {
                    let value = region.read_le::<u64>(target)?;
                    region.write_le::<u64>(target, value.wrapping_add(delta))?;
                }
            }
            applied += 1;
        }

        // A block may declare an odd trailing byte beyond its last whole entry
        let next = block_offset + block_size;
        if next >= size {
            break;
        }
        parser.seek(next)?;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        loader::{HeapMemory, MemoryBackend},
        Error,
    };

    const PREFERRED: u64 = 0x1000_0000;

    fn region_with(table: &[u8]) -> Box<dyn MappedRegion> {
        let memory = HeapMemory::new();
        let mut region = memory.reserve(0x3000, None).unwrap();
        region.write(0x2000, table).unwrap();
        region
    }

    fn block(page: u32, entries: &[u16]) -> Vec<u8> {
        let mut bytes = page.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(8 + entries.len() as u32 * 2).to_le_bytes());
        for entry in entries {
            bytes.extend_from_slice(&entry.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_all_kinds() {
        let table = block(0x1000, &[0xA000, 0x3010, 0x1020, 0x2030, 0x0000, 0x0000]);
        let mut region = region_with(&table);
        let delta = region.base() - PREFERRED;

        region.write_le::<u64>(0x1000, PREFERRED + 0x1234).unwrap();
        region.write_le::<u32>(0x1010, (PREFERRED + 0x40) as u32).unwrap();
        region.write_le::<u16>(0x1020, 0x1000).unwrap();
        region.write_le::<u16>(0x1030, 0x0010).unwrap();

        let applied = relocate(
            &mut *region,
            Some((0x2000, table.len() as u32)),
            false,
            PREFERRED,
            false,
        )
        .unwrap();

        assert_eq!(applied, 4);
        assert_eq!(
            region.read_le::<u64>(0x1000).unwrap(),
            region.base() + 0x1234
        );
        assert_eq!(
            region.read_le::<u32>(0x1010).unwrap(),
            (region.base() + 0x40) as u32
        );
        assert_eq!(
            region.read_le::<u16>(0x1020).unwrap(),
            0x1000u16.wrapping_add((delta >> 16) as u16)
        );
        assert_eq!(
            region.read_le::<u16>(0x1030).unwrap(),
            0x0010u16.wrapping_add(delta as u16)
        );
    }

    #[test]
    fn test_no_delta_is_untouched() {
        let mut region = region_with(&block(0x1000, &[0xF000]));
        let base = region.base();

        assert_eq!(relocate(&mut *region, None, true, base, true).unwrap(), 0);
    }

    #[test]
    fn test_missing_or_stripped() {
        let table = block(0x1000, &[0x0000, 0x0000]);
        let mut region = region_with(&table);

        assert!(matches!(
            relocate(&mut *region, None, false, PREFERRED, true),
            Err(Error::Relocation { .. })
        ));
        assert!(matches!(
            relocate(&mut *region, Some((0x2000, 12)), true, PREFERRED, true),
            Err(Error::Relocation { .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let table = block(0x1000, &[0x5008]);
        let mut region = region_with(&table);

        assert!(matches!(
            relocate(&mut *region, Some((0x2000, 10)), false, PREFERRED, true),
            Err(Error::Relocation { .. })
        ));
    }

    #[test]
    fn test_target_outside_image() {
        let table = block(0x2FF0, &[0xA00C]);
        let mut region = region_with(&table);

        assert!(matches!(
            relocate(&mut *region, Some((0x2000, 10)), false, PREFERRED, true),
            Err(Error::Relocation { .. })
        ));
    }

    #[test]
    fn test_malformed_blocks() {
        let mut short = block(0x1000, &[]);
        short[4..8].copy_from_slice(&4u32.to_le_bytes());
        let mut region = region_with(&short);
        assert!(relocate(&mut *region, Some((0x2000, 8)), false, PREFERRED, true).is_err());

        let long = block(0x1000, &[0x0000, 0x0000]);
        let mut region = region_with(&long);
        assert!(relocate(&mut *region, Some((0x2000, 10)), false, PREFERRED, true).is_err());

        let mut region = region_with(&long);
        assert!(relocate(&mut *region, Some((0x2000, 5)), false, PREFERRED, true).is_err());

        let mut region = region_with(&long);
        assert!(relocate(&mut *region, Some((0x2F00, 0x200)), false, PREFERRED, true).is_err());
    }

    #[test]
    fn test_pe32_above_4gib() {
        let memory = HeapMemory::with_start(0x1_0000_0000);
        let mut region = memory.reserve(0x1000, None).unwrap();

        assert!(matches!(
            relocate(&mut *region, None, false, PREFERRED, false),
            Err(Error::Relocation { .. })
        ));
    }
}
