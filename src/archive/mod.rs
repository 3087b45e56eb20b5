//! Archive indexes: where module images come from.
//!
//! An [`ArchiveIndex`] maps logical file paths such as `pkg/_speedups.pyd` to the bytes stored
//! under them. It has no notion of modules or loading; the [`crate::hook::ImportHook`] decides
//! which paths to ask for.
//!
//! # Key Components
//!
//! - [`ArchiveIndex`] - The lookup interface
//! - [`ZipArchiveIndex`] - A zip file, memory-mapped from disk or held in memory
//! - [`MemoryArchive`] - A plain path to bytes map, for embedding and tests
//!
//! # Paths
//!
//! All paths are compared in their normalized form (see [`normalize`]): `\` separators become
//! `/`, and leading `./` and `/` are removed. `pkg\spam.pyd`, `./pkg/spam.pyd` and
//! `pkg/spam.pyd` name the same entry.

mod memory;
mod zipfile;

use crate::Result;

pub use memory::MemoryArchive;
pub use zipfile::ZipArchiveIndex;

/// Lookup of files inside a packed container.
pub trait ArchiveIndex: Send + Sync {
    /// Display name of the archive, usually its path.
    fn name(&self) -> &str;

    /// Returns `true` if the archive holds a file at `path`.
    fn has(&self, path: &str) -> bool;

    /// Reads the file at `path`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NotFoundInArchive`] if there is no such file, or an error of the
    /// underlying container.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// The normalized paths of all files, sorted.
    fn paths(&self) -> Vec<String>;

    /// The stored path matching `path`, exactly or else ignoring ASCII case.
    fn find(&self, path: &str) -> Option<String> {
        let path = normalize(path);
        if self.has(&path) {
            return Some(path);
        }

        self.paths()
            .into_iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(&path))
    }
}

/// Brings a path into the form archives store and compare it in.
///
/// ```rust
/// use memimport::archive::normalize;
///
/// assert_eq!(normalize(r".\pkg\spam.pyd"), "pkg/spam.pyd");
/// assert_eq!(normalize("/spam.pyd"), "spam.pyd");
/// ```
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut path = path.replace('\\', "/");
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest.to_string();
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest.to_string();
        } else {
            return path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(normalize("spam.pyd"), "spam.pyd");
        assert_eq!(normalize(r"pkg\sub\spam.pyd"), "pkg/sub/spam.pyd");
        assert_eq!(normalize("././/pkg/spam.pyd"), "pkg/spam.pyd");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_find_falls_back_to_case_insensitive() {
        let archive = MemoryArchive::new("lib.zip")
            .with("PyWinTypes312.dll", vec![1])
            .with("pkg/spam.pyd", vec![2]);

        assert_eq!(archive.find(r"pkg\spam.pyd").as_deref(), Some("pkg/spam.pyd"));
        assert_eq!(
            archive.find("pywintypes312.DLL").as_deref(),
            Some("PyWinTypes312.dll")
        );
        assert!(archive.find("eggs.pyd").is_none());
    }
}
