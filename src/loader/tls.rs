//! TLS directory parsing.
//!
//! Only the callback table is acted upon. Images that rely on implicit TLS data get no slot
//! allocated; the template size is kept so the loader can say so in its log.

use crate::{file::parser::Parser, Result};

/// The parts of `IMAGE_TLS_DIRECTORY` the loader uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsDirectory {
    /// RVAs of the callbacks, in table order
    pub callbacks: Vec<u32>,
    /// RVA of the slot that receives the TLS index, if any
    pub index_slot: Option<u32>,
    /// Size of the initialized TLS template plus its zero fill
    pub data_size: u64,
}

/// Parses the TLS directory of a mapped and relocated image.
///
/// All addresses in the directory are virtual addresses; after relocation they are relative to
/// `base`, the address the image is mapped at.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for addresses outside the image and
/// [`crate::Error::OutOfBounds`] for a truncated directory or callback table.
pub fn parse_tls(
    image: &[u8],
    directory: Option<(u32, u32)>,
    is_64: bool,
    base: u64,
) -> Result<Option<TlsDirectory>> {
    let Some((rva, _)) = directory else {
        return Ok(None);
    };

    let to_rva = |address: u64, what: &str| -> Result<u32> {
        address
            .checked_sub(base)
            .filter(|rva| *rva < image.len() as u64)
            .map(|rva| rva as u32)
            .ok_or_else(|| {
                malformed_error!("TLS {} 0x{:X} lies outside the image", what, address)
            })
    };

    let mut parser = Parser::new(image);
    parser.seek(rva as usize)?;
    let start = parser.read_pointer(is_64)?;
    let end = parser.read_pointer(is_64)?;
    let index = parser.read_pointer(is_64)?;
    let callbacks = parser.read_pointer(is_64)?;
    let zero_fill = parser.read_le::<u32>()?;

    if end < start {
        return Err(malformed_error!(
            "TLS template ends before it starts - 0x{:X}..0x{:X}",
            start,
            end
        ));
    }

    let mut directory = TlsDirectory {
        callbacks: Vec::new(),
        index_slot: None,
        data_size: (end - start) + u64::from(zero_fill),
    };

    if index != 0 {
        directory.index_slot = Some(to_rva(index, "index slot")?);
    }

    if callbacks != 0 {
        parser.seek(to_rva(callbacks, "callback table")? as usize)?;
        loop {
            let callback = parser.read_pointer(is_64)?;
            if callback == 0 {
                break;
            }
            directory.callbacks.push(to_rva(callback, "callback")?);
        }
    }

    Ok(Some(directory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::Image,
        test::{map_flat, PeBuilder, SCN_CODE},
        Error,
    };
    use goblin::pe::data_directories::DataDirectoryType;

    #[test]
    fn test_callbacks_in_order() {
        let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
        let text = builder.section(".text", SCN_CODE, vec![0xC3; 0x40]);
        builder.tls_callback(text + 0x20).tls_callback(text);
        let built = builder.build();

        let image = Image::from_mem(built.bytes.clone()).unwrap();
        let flat = map_flat(&image);
        let tls = parse_tls(
            &flat,
            image.get_data_directory(DataDirectoryType::TlsTable),
            true,
            built.image_base,
        )
        .unwrap()
        .unwrap();

        assert_eq!(tls.callbacks, vec![text + 0x20, text]);
        assert_eq!(tls.index_slot, built.tls_index);
        assert_eq!(tls.data_size, 8);
    }

    #[test]
    fn test_pe32_without_callbacks() {
        let mut builder = PeBuilder::new_i386(0x1000_0000);
        builder.section(".text", SCN_CODE, vec![0xC3; 4]);
        builder.tls();
        let built = builder.build();

        let image = Image::from_mem(built.bytes.clone()).unwrap();
        let flat = map_flat(&image);
        let tls = parse_tls(
            &flat,
            image.get_data_directory(DataDirectoryType::TlsTable),
            false,
            built.image_base,
        )
        .unwrap()
        .unwrap();

        assert!(tls.callbacks.is_empty());
        assert!(tls.index_slot.is_some());
    }

    #[test]
    fn test_wrong_base() {
        let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
        let text = builder.section(".text", SCN_CODE, vec![0xC3; 4]);
        builder.tls_callback(text);
        let image = Image::from_mem(builder.build().bytes).unwrap();
        let flat = map_flat(&image);

        let result = parse_tls(
            &flat,
            image.get_data_directory(DataDirectoryType::TlsTable),
            true,
            0x7000_0000,
        );
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_no_directory() {
        assert_eq!(parse_tls(&[], None, true, 0).unwrap(), None);
    }
}
