use std::collections::BTreeMap;

use crate::{
    archive::{normalize, ArchiveIndex},
    Error, Result,
};

/// An archive held as a map in memory.
///
/// # Examples
///
/// ```rust
/// use memimport::archive::{ArchiveIndex, MemoryArchive};
///
/// let archive = MemoryArchive::new("embedded").with(r"pkg\spam.pyd", vec![0x4D, 0x5A]);
///
/// assert!(archive.has("pkg/spam.pyd"));
/// assert_eq!(archive.read("pkg/spam.pyd")?, vec![0x4D, 0x5A]);
/// # Ok::<(), memimport::Error>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    name: String,
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    /// Creates an empty archive with a display name.
    #[must_use]
    pub fn new(name: &str) -> MemoryArchive {
        MemoryArchive {
            name: name.to_string(),
            files: BTreeMap::new(),
        }
    }

    /// Adds a file, builder style.
    #[must_use]
    pub fn with(mut self, path: &str, data: Vec<u8>) -> MemoryArchive {
        self.insert(path, data);
        self
    }

    /// Adds or replaces a file.
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(normalize(path), data);
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if the archive holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ArchiveIndex for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn has(&self, path: &str) -> bool {
        self.files.contains_key(&normalize(path))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        self.files
            .get(&path)
            .cloned()
            .ok_or(Error::NotFoundInArchive(path))
    }

    fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read() {
        let mut archive = MemoryArchive::new("mem");
        assert!(archive.is_empty());

        archive.insert("./a.pyd", vec![1]);
        archive.insert("a.pyd", vec![2]);
        archive.insert(r"pkg\b.pyd", vec![3]);

        assert_eq!(archive.len(), 2);
        assert_eq!(archive.read("a.pyd").unwrap(), vec![2]);
        assert_eq!(archive.paths(), vec!["a.pyd", "pkg/b.pyd"]);
        assert!(matches!(
            archive.read("c.pyd"),
            Err(Error::NotFoundInArchive(path)) if path == "c.pyd"
        ));
    }
}
