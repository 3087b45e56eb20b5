//! Import directory parsing.

use crate::{file::parser::Parser, loader::Symbol, Result};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`.
const DESCRIPTOR_SIZE: usize = 20;

/// One symbol an image imports and the IAT slot that receives its address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportEntry {
    /// The imported symbol
    pub symbol: Symbol,
    /// Index hint into the exporter's name table; zero for ordinal imports
    pub hint: u16,
    /// RVA of the IAT slot
    pub slot: u32,
}

/// All symbols imported from one library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// Library name as written in the image
    pub library: String,
    /// The imported symbols, in table order
    pub entries: Vec<ImportEntry>,
}

/// Parses the import directory of a mapped image.
///
/// Descriptors are read until the all-zero terminator. Each descriptor's import lookup table is
/// used when present; images whose `OriginalFirstThunk` is zero are walked through their IAT.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for descriptors without a name or IAT, and
/// [`crate::Error::OutOfBounds`] for tables that run past the image.
pub fn parse_imports(
    image: &[u8],
    directory: Option<(u32, u32)>,
    is_64: bool,
) -> Result<Vec<ImportDescriptor>> {
    let Some((rva, _)) = directory else {
        return Ok(Vec::new());
    };

    let width = if is_64 { 8 } else { 4 };
    let ordinal_flag = if is_64 { 1u64 << 63 } else { 1u64 << 31 };

    let mut descriptors = Vec::new();
    let mut parser = Parser::new(image);
    let mut offset = rva as usize;

    loop {
        parser.seek(offset)?;
        let lookup_rva = parser.read_le::<u32>()?;
        let time_date_stamp = parser.read_le::<u32>()?;
        let forwarder_chain = parser.read_le::<u32>()?;
        let name_rva = parser.read_le::<u32>()?;
        let iat_rva = parser.read_le::<u32>()?;
        offset += DESCRIPTOR_SIZE;

        if lookup_rva == 0
            && time_date_stamp == 0
            && forwarder_chain == 0
            && name_rva == 0
            && iat_rva == 0
        {
            break;
        }
        if name_rva == 0 || iat_rva == 0 {
            return Err(malformed_error!(
                "Import descriptor at 0x{:X} has no name or IAT",
                offset - DESCRIPTOR_SIZE
            ));
        }

        let mut names = Parser::new(image);
        names.seek(name_rva as usize)?;
        let library = names.read_string_utf8()?;

        let table = if lookup_rva != 0 { lookup_rva } else { iat_rva };
        let mut entries = Vec::new();
        let mut thunks = Parser::new(image);
        thunks.seek(table as usize)?;

        loop {
            let thunk = thunks.read_pointer(is_64)?;
            if thunk == 0 {
                break;
            }

            let slot = iat_rva as usize + entries.len() * width;
            let slot = u32::try_from(slot)
                .map_err(|_| malformed_error!("IAT of {} overflows", library))?;

            let entry = if thunk & ordinal_flag != 0 {
                ImportEntry {
                    symbol: Symbol::Ordinal((thunk & 0xFFFF) as u16),
                    hint: 0,
                    slot,
                }
            } else {
                names.seek((thunk & 0x7FFF_FFFF) as usize)?;
                let hint = names.read_le::<u16>()?;
                ImportEntry {
                    symbol: Symbol::Name(names.read_string_utf8()?),
                    hint,
                    slot,
                }
            };
            entries.push(entry);
        }

        descriptors.push(ImportDescriptor { library, entries });
    }

    Ok(descriptors)
}
