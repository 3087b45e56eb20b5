//! How logical module names map to archive paths and entry points.

use std::{fmt, ops::RangeInclusive};

/// Version of the host runtime, which selects the entry point prefix and the file names of
/// legacy modules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl RuntimeVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> RuntimeVersion {
        RuntimeVersion { major, minor }
    }
}

impl Default for RuntimeVersion {
    fn default() -> Self {
        RuntimeVersion::new(3, 12)
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The naming rules of extension modules.
///
/// Three rules are applied, all of them plain data:
/// - an ordinary module `a.b.c` lives at `a/b/c` plus one of the extension suffixes
/// - a legacy module (`pywintypes`, `pythoncom`) lives at its name followed by the runtime's
///   major and minor version and the legacy extension, e.g. `pywintypes312.dll`
/// - the entry point is the last name component behind the prefix the runtime's major version
///   selects, e.g. `PyInit_c`
///
/// # Examples
///
/// ```rust
/// use memimport::hook::{NamingConvention, RuntimeVersion};
///
/// let naming = NamingConvention::new(RuntimeVersion::new(3, 11));
///
/// assert_eq!(naming.candidates("pkg._speedups"), vec!["pkg/_speedups.pyd"]);
/// assert_eq!(naming.candidates("pywintypes"), vec!["pywintypes311.dll"]);
/// assert_eq!(naming.entry_point("pkg._speedups").as_deref(), Some("PyInit__speedups"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingConvention {
    version: RuntimeVersion,
    suffixes: Vec<String>,
    legacy_names: Vec<String>,
    legacy_extension: String,
    prefixes: Vec<(RangeInclusive<u32>, String)>,
}

impl Default for NamingConvention {
    fn default() -> Self {
        NamingConvention::new(RuntimeVersion::default())
    }
}

impl NamingConvention {
    /// The standard rules for `version`.
    #[must_use]
    pub fn new(version: RuntimeVersion) -> NamingConvention {
        NamingConvention {
            version,
            suffixes: vec![".pyd".to_string()],
            legacy_names: vec!["pywintypes".to_string(), "pythoncom".to_string()],
            legacy_extension: ".dll".to_string(),
            prefixes: vec![
                (0..=2, "init".to_string()),
                (3..=u32::MAX, "PyInit_".to_string()),
            ],
        }
    }

    /// Replaces the extension suffixes, tried in the given order.
    #[must_use]
    pub fn with_suffixes<S: AsRef<str>>(mut self, suffixes: &[S]) -> NamingConvention {
        self.suffixes = suffixes.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Replaces the list of legacy module names.
    #[must_use]
    pub fn with_legacy_names<S: AsRef<str>>(mut self, names: &[S]) -> NamingConvention {
        self.legacy_names = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Replaces the extension of legacy modules.
    #[must_use]
    pub fn with_legacy_extension(mut self, extension: &str) -> NamingConvention {
        self.legacy_extension = extension.to_string();
        self
    }

    /// Uses `prefix` for every major version in `majors`, ahead of the existing rules.
    #[must_use]
    pub fn with_prefix(mut self, majors: RangeInclusive<u32>, prefix: &str) -> NamingConvention {
        self.prefixes.insert(0, (majors, prefix.to_string()));
        self
    }

    /// The runtime version the rules are evaluated for.
    #[must_use]
    pub fn version(&self) -> RuntimeVersion {
        self.version
    }

    /// The extension suffixes.
    #[must_use]
    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    /// Returns `true` if `name` follows the legacy rule.
    #[must_use]
    pub fn is_legacy(&self, name: &str) -> bool {
        self.legacy_names.iter().any(|legacy| legacy == name)
    }

    /// The archive paths `name` may be stored under, in the order they are tried.
    #[must_use]
    pub fn candidates(&self, name: &str) -> Vec<String> {
        let path = name.replace('.', "/");
        if self.is_legacy(name) {
            return vec![format!(
                "{}{}{}{}",
                path, self.version.major, self.version.minor, self.legacy_extension
            )];
        }

        self.suffixes
            .iter()
            .map(|suffix| format!("{path}{suffix}"))
            .collect()
    }

    /// The prefix the runtime's major version selects.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|(majors, _)| majors.contains(&self.version.major))
            .map(|(_, prefix)| prefix.as_str())
    }

    /// The entry point of `name`, or `None` if no prefix applies to the runtime version.
    #[must_use]
    pub fn entry_point(&self, name: &str) -> Option<String> {
        let last = name.rsplit('.').next().unwrap_or(name);
        self.prefix().map(|prefix| format!("{prefix}{last}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinary_modules() {
        let naming = NamingConvention::default().with_suffixes(&[".cp312-win_amd64.pyd", ".pyd"]);

        assert_eq!(
            naming.candidates("a.b.c"),
            vec!["a/b/c.cp312-win_amd64.pyd", "a/b/c.pyd"]
        );
        assert_eq!(naming.entry_point("a.b.c").as_deref(), Some("PyInit_c"));
    }

    #[test]
    fn test_legacy_modules_ignore_suffixes() {
        let naming = NamingConvention::new(RuntimeVersion::new(2, 7))
            .with_suffixes(&[".cp27.pyd", ".pyd"]);

        assert_eq!(naming.candidates("pywintypes"), vec!["pywintypes27.dll"]);
        assert_eq!(naming.candidates("pythoncom"), vec!["pythoncom27.dll"]);
        assert_eq!(naming.entry_point("pythoncom").as_deref(), Some("initpythoncom"));

        let naming = NamingConvention::new(RuntimeVersion::new(3, 9));
        assert_eq!(naming.candidates("pywintypes"), vec!["pywintypes39.dll"]);
        assert!(!naming.is_legacy("pkg.pywintypes"));
        assert_eq!(naming.candidates("pkg.pywintypes"), vec!["pkg/pywintypes.pyd"]);
    }

    #[test]
    fn test_prefix_table() {
        assert_eq!(
            NamingConvention::new(RuntimeVersion::new(2, 7)).prefix(),
            Some("init")
        );
        assert_eq!(
            NamingConvention::new(RuntimeVersion::new(3, 0)).prefix(),
            Some("PyInit_")
        );

        let custom = NamingConvention::new(RuntimeVersion::new(4, 0)).with_prefix(4..=4, "Init4_");
        assert_eq!(custom.entry_point("x.y").as_deref(), Some("Init4_y"));

        let mut none = NamingConvention::new(RuntimeVersion::new(3, 0));
        none.prefixes.clear();
        assert!(none.entry_point("spam").is_none());
    }

    #[test]
    fn test_custom_legacy_rules() {
        let naming = NamingConvention::new(RuntimeVersion::new(3, 12))
            .with_legacy_names(&["win32api"])
            .with_legacy_extension(".pyd");

        assert_eq!(naming.candidates("win32api"), vec!["win32api312.pyd"]);
        assert_eq!(naming.candidates("pywintypes"), vec!["pywintypes.pyd"]);
        assert_eq!(naming.version().to_string(), "3.12");
    }
}
