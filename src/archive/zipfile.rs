//! Zip archives.
//!
//! The central directory is read once when the archive is opened; directories are skipped and
//! every file is indexed under its normalized path. Reading an entry decompresses it into a
//! fresh buffer. The [`zip::ZipArchive`] reader keeps a cursor, so reads are serialized.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    path::Path,
    sync::Mutex,
};

use zip::ZipArchive;

use crate::{
    archive::{normalize, ArchiveIndex},
    file::{Backend, Memory, Physical},
    Error, Result,
};

/// Makes a file backend readable through a cursor.
struct Source(Box<dyn Backend>);

impl AsRef<[u8]> for Source {
    fn as_ref(&self) -> &[u8] {
        self.0.data()
    }
}

/// A zip file indexed by path.
///
/// # Examples
///
/// ```rust,no_run
/// use memimport::archive::{ArchiveIndex, ZipArchiveIndex};
///
/// let archive = ZipArchiveIndex::from_file("library.zip".as_ref())?;
/// for path in archive.paths() {
///     println!("{}", path);
/// }
/// # Ok::<(), memimport::Error>(())
/// ```
pub struct ZipArchiveIndex {
    name: String,
    archive: Mutex<ZipArchive<Cursor<Source>>>,
    entries: HashMap<String, usize>,
}

impl ZipArchiveIndex {
    /// Opens a zip file on disk. The file is memory-mapped, not read.
    ///
    /// # Errors
    ///
    /// [`Error::FileError`] if the file cannot be opened and [`Error::ZipErr`] if it is not a
    /// zip archive.
    pub fn from_file(path: &Path) -> Result<ZipArchiveIndex> {
        let backend = Physical::new(path)?;
        Self::open(path.to_string_lossy().into_owned(), Box::new(backend))
    }

    /// Opens a zip archive held in memory.
    ///
    /// # Errors
    ///
    /// [`Error::ZipErr`] if `data` is not a zip archive.
    pub fn from_mem(name: &str, data: Vec<u8>) -> Result<ZipArchiveIndex> {
        Self::open(name.to_string(), Box::new(Memory::new(data)))
    }

    fn open(name: String, backend: Box<dyn Backend>) -> Result<ZipArchiveIndex> {
        let mut archive = ZipArchive::new(Cursor::new(Source(backend)))?;

        let mut entries = HashMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            if entry.is_dir() {
                continue;
            }
            entries.insert(normalize(entry.name()), index);
        }
        log::debug!("{}: indexed {} files", name, entries.len());

        Ok(ZipArchiveIndex {
            name,
            archive: Mutex::new(archive),
            entries,
        })
    }

    /// Number of files in the archive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the archive holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArchiveIndex for ZipArchiveIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn has(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize(path))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let Some(index) = self.entries.get(&path) else {
            return Err(Error::NotFoundInArchive(path));
        };

        let mut archive = lock!(self.archive)?;
        let mut entry = archive.by_index(*index)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }
}

impl std::fmt::Debug for ZipArchiveIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchiveIndex")
            .field("name", &self.name)
            .field("files", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.add_directory("pkg/", options).unwrap();
        for (path, data) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_index_and_read() {
        let archive = ZipArchiveIndex::from_mem(
            "lib.zip",
            zip_of(&[("spam.pyd", b"MZ spam"), ("pkg/eggs.pyd", &[0xAB; 4096])]),
        )
        .unwrap();

        assert_eq!(archive.name(), "lib.zip");
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.paths(), vec!["pkg/eggs.pyd", "spam.pyd"]);
        assert!(archive.has(r"pkg\eggs.pyd"));
        assert!(!archive.has("pkg/"));
        assert_eq!(archive.read("spam.pyd").unwrap(), b"MZ spam");
        assert_eq!(archive.read("pkg/eggs.pyd").unwrap(), vec![0xAB; 4096]);
        assert!(matches!(
            archive.read("ham.pyd"),
            Err(Error::NotFoundInArchive(_))
        ));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            ZipArchiveIndex::from_mem("junk", b"definitely not a zip".to_vec()),
            Err(Error::ZipErr(_))
        ));
    }
}
