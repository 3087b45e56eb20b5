//! Export directory parsing.
//!
//! The export table is read once per image, straight after relocation, into a
//! [`ModuleExports`] value. That value is what other images bind against, including images that
//! import from a library whose own load is still in progress.

use std::{collections::HashMap, fmt};

use crate::{file::parser::Parser, Result};

/// A symbol as imports and forwarders refer to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Lookup by exported name
    Name(String),
    /// Lookup by ordinal
    Ordinal(u16),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Name(name) => f.write_str(name),
            Symbol::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// Where an export points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportTarget {
    /// Code or data inside the exporting image
    Address(u32),
    /// A symbol of another library, `LIB.Symbol` or `LIB.#ordinal` in the image
    Forwarder {
        /// Library file name, with `.dll` appended
        library: String,
        /// The forwarded symbol
        symbol: Symbol,
    },
}

/// The export table of one mapped image.
#[derive(Debug, Default, Clone)]
pub struct ModuleExports {
    /// Name the image was loaded under
    pub name: String,
    /// Address the image is mapped at
    pub base: u64,
    /// Ordinal of the first entry in `functions`
    pub ordinal_base: u32,
    functions: Vec<Option<ExportTarget>>,
    names: HashMap<String, usize>,
}

impl ModuleExports {
    /// An export table without entries, for images without an export directory.
    #[must_use]
    pub fn empty(name: &str, base: u64) -> ModuleExports {
        ModuleExports {
            name: name.to_string(),
            base,
            ordinal_base: 1,
            functions: Vec::new(),
            names: HashMap::new(),
        }
    }

    /// Parses the export directory of a mapped image.
    ///
    /// ## Arguments
    /// * `image`     - The mapped image, starting at RVA 0
    /// * `directory` - RVA and size of the export directory, if there is one
    /// * `name`      - Name the image is loaded under
    /// * `base`      - Address the image is mapped at
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the directory or
    /// anything it references does not fit the image.
    pub fn parse(
        image: &[u8],
        directory: Option<(u32, u32)>,
        name: &str,
        base: u64,
    ) -> Result<ModuleExports> {
        let Some((rva, size)) = directory else {
            return Ok(Self::empty(name, base));
        };

        let start = rva as usize;
        let end = start.saturating_add(size as usize);
        if end > image.len() || size < 40 {
            return Err(malformed_error!(
                "Export directory 0x{:X}+0x{:X} does not fit the image",
                rva,
                size
            ));
        }

        let mut parser = Parser::new(image);
        parser.seek(start + 16)?;
        let ordinal_base = parser.read_le::<u32>()?;
        let function_count = parser.read_le::<u32>()? as usize;
        let name_count = parser.read_le::<u32>()? as usize;
        let functions_rva = parser.read_le::<u32>()? as usize;
        let names_rva = parser.read_le::<u32>()? as usize;
        let ordinals_rva = parser.read_le::<u32>()? as usize;

        // Several names may share one function, so only the function count is bounded
        if function_count > 0x1_0000 {
            return Err(malformed_error!(
                "Export directory declares {} functions",
                function_count
            ));
        }

        let mut functions = Vec::with_capacity(function_count);
        for index in 0..function_count {
            parser.seek(functions_rva + index * 4)?;
            let target = parser.read_le::<u32>()? as usize;

            let entry = if target == 0 {
                None
            } else if (start..end).contains(&target) {
                let mut forwarder = Parser::new(image);
                forwarder.seek(target)?;
                Some(parse_forwarder(&forwarder.read_string_utf8()?)?)
            } else if target >= image.len() {
                return Err(malformed_error!(
                    "Export #{} points outside the image - 0x{:X}",
                    index,
                    target
                ));
            } else {
                Some(ExportTarget::Address(target as u32))
            };
            functions.push(entry);
        }

        let mut names = HashMap::with_capacity(name_count.min(function_count));
        for index in 0..name_count {
            parser.seek(ordinals_rva + index * 2)?;
            let function = parser.read_le::<u16>()? as usize;
            if function >= function_count {
                return Err(malformed_error!(
                    "Export name #{} refers to function {} of {}",
                    index,
                    function,
                    function_count
                ));
            }

            parser.seek(names_rva + index * 4)?;
            let name_rva = parser.read_le::<u32>()? as usize;
            parser.seek(name_rva)?;
            names.insert(parser.read_string_utf8()?, function);
        }

        Ok(ModuleExports {
            name: name.to_string(),
            base,
            ordinal_base,
            functions,
            names,
        })
    }

    /// Looks up a symbol by name or ordinal.
    #[must_use]
    pub fn lookup(&self, symbol: &Symbol) -> Option<&ExportTarget> {
        let index = match symbol {
            Symbol::Name(name) => *self.names.get(name)?,
            Symbol::Ordinal(ordinal) => {
                u32::from(*ordinal).checked_sub(self.ordinal_base)? as usize
            }
        };
        self.functions.get(index)?.as_ref()
    }

    /// The address of a symbol that is exported from this image itself.
    ///
    /// Returns `None` for unknown symbols and for forwarders.
    #[must_use]
    pub fn address(&self, symbol: &Symbol) -> Option<u64> {
        match self.lookup(symbol)? {
            ExportTarget::Address(rva) => Some(self.base + u64::from(*rva)),
            ExportTarget::Forwarder { .. } => None,
        }
    }

    /// The exported names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    /// Number of export slots, named or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.iter().flatten().count()
    }

    /// Returns `true` if the image exports nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `LIB.Symbol` / `LIB.#ordinal`.
fn parse_forwarder(forwarder: &str) -> Result<ExportTarget> {
    let Some((library, symbol)) = forwarder.rsplit_once('.') else {
        return Err(malformed_error!("Invalid export forwarder - {}", forwarder));
    };
    if library.is_empty() || symbol.is_empty() {
        return Err(malformed_error!("Invalid export forwarder - {}", forwarder));
    }

    let symbol = match symbol.strip_prefix('#') {
        Some(ordinal) => Symbol::Ordinal(ordinal.parse::<u16>().map_err(|_| {
            malformed_error!("Invalid ordinal in export forwarder - {}", forwarder)
        })?),
        None => Symbol::Name(symbol.to_string()),
    };

    Ok(ExportTarget::Forwarder {
        library: format!("{library}.dll"),
        symbol,
    })
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

    fn exports_of(builder: &PeBuilder) -> ModuleExports {
        let image = Image::from_mem(builder.build().bytes).unwrap();
        let flat = map_flat(&image);
        ModuleExports::parse(
            &flat,
            image.get_data_directory(DataDirectoryType::ExportTable),
            "spam.pyd",
            0x7000_0000,
        )
        .unwrap()
    }

    #[test]
    fn test_names_ordinals_forwarders() {
        let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
        let text = builder.section(".text", SCN_CODE, vec![0xC3; 0x40]);
        builder
            .export("PyInit_spam", text)
            .export("helper", text + 0x10)
            .export_ordinal(text + 0x20)
            .forward("Sleep", "KERNEL32.Sleep")
            .forward("Other", "dep.#7");

        let exports = exports_of(&builder);

        assert_eq!(exports.name, "spam.pyd");
        assert_eq!(exports.ordinal_base, 1);
        assert_eq!(exports.len(), 5);
        assert_eq!(
            exports.address(&Symbol::Name("PyInit_spam".into())),
            Some(0x7000_0000 + u64::from(text))
        );
        assert_eq!(
            exports.address(&Symbol::Ordinal(2)),
            Some(0x7000_0000 + u64::from(text) + 0x10)
        );
        assert_eq!(
            exports.lookup(&Symbol::Ordinal(3)),
            Some(&ExportTarget::Address(text + 0x20))
        );
        assert_eq!(
            exports.lookup(&Symbol::Name("Sleep".into())),
            Some(&ExportTarget::Forwarder {
                library: "KERNEL32.dll".into(),
                symbol: Symbol::Name("Sleep".into()),
            })
        );
        assert_eq!(
            exports.lookup(&Symbol::Name("Other".into())),
            Some(&ExportTarget::Forwarder {
                library: "dep.dll".into(),
                symbol: Symbol::Ordinal(7),
            })
        );
        assert_eq!(exports.address(&Symbol::Name("Sleep".into())), None);
        assert_eq!(exports.lookup(&Symbol::Ordinal(0)), None);
        assert_eq!(exports.lookup(&Symbol::Ordinal(6)), None);
        assert_eq!(exports.lookup(&Symbol::Name("missing".into())), None);

        let mut names: Vec<&str> = exports.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["Other", "PyInit_spam", "Sleep", "helper"]);
    }

    #[test]
    fn test_no_directory() {
        let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
        builder.section(".text", SCN_CODE, vec![0xC3; 4]);

        let exports = exports_of(&builder);
        assert!(exports.is_empty());
        assert_eq!(exports.base, 0x7000_0000);
    }

    #[test]
    fn test_directory_outside_image() {
        let image = vec![0u8; 0x100];
        assert!(matches!(
            ModuleExports::parse(&image, Some((0xF0, 0x40)), "x", 0),
            Err(Error::Malformed { .. })
        ));
    }

    /// Writes a bare export directory at 0x100 of a 0x2000 byte image.
    fn directory(functions: &[u32], names: &[(&str, u16)]) -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];
        let mut put = |offset: usize, bytes: &[u8]| {
            image[offset..offset + bytes.len()].copy_from_slice(bytes);
        };

        put(0x110, &1u32.to_le_bytes());
        put(0x114, &(functions.len() as u32).to_le_bytes());
        put(0x118, &(names.len() as u32).to_le_bytes());
        put(0x11C, &0x140u32.to_le_bytes());
        put(0x120, &0x160u32.to_le_bytes());
        put(0x124, &0x180u32.to_le_bytes());

        for (index, function) in functions.iter().enumerate() {
            put(0x140 + index * 4, &function.to_le_bytes());
        }
        for (index, (name, ordinal)) in names.iter().enumerate() {
            let name_rva = 0x1A0 + index * 0x10;
            put(0x160 + index * 4, &(name_rva as u32).to_le_bytes());
            put(0x180 + index * 2, &ordinal.to_le_bytes());
            put(name_rva, name.as_bytes());
        }
        image
    }

    #[test]
    fn test_aliased_names() {
        let image = directory(&[0x1000], &[("a", 0), ("b", 0)]);
        let exports = ModuleExports::parse(&image, Some((0x100, 0x100)), "alias.dll", 0).unwrap();

        assert_eq!(exports.len(), 1);
        assert_eq!(exports.address(&Symbol::Name("a".into())), Some(0x1000));
        assert_eq!(exports.address(&Symbol::Name("b".into())), Some(0x1000));
        assert_eq!(exports.address(&Symbol::Ordinal(1)), Some(0x1000));
    }

    #[test]
    fn test_name_past_functions() {
        let image = directory(&[0x1000], &[("a", 0), ("b", 1)]);
        assert!(matches!(
            ModuleExports::parse(&image, Some((0x100, 0x100)), "bad.dll", 0),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_forwarders() {
        assert!(parse_forwarder("NoDot").is_err());
        assert!(parse_forwarder("lib.").is_err());
        assert!(parse_forwarder("lib.#x").is_err());
        assert_eq!(
            parse_forwarder("api.ms.win.Sym").unwrap(),
            ExportTarget::Forwarder {
                library: "api.ms.win.dll".into(),
                symbol: Symbol::Name("Sym".into()),
            }
        );
        assert_eq!(Symbol::Ordinal(4).to_string(), "#4");
        assert_eq!(Symbol::Name("f".into()).to_string(), "f");
    }
}
