use thiserror::Error;

use crate::loader::Protection;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! relocation_error {
    ($msg:expr) => {
        crate::Error::Relocation {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Relocation {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The loader never retries internally. Any structural failure ends the load attempt that hit
/// it, and everything that attempt mapped is released before the error reaches the caller.
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::Malformed`] - Corrupted, truncated or unsupported image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the image or a mapped region
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::Relocation`] - A base relocation could not be applied
///
/// ## Linking Errors
/// - [`Error::UnresolvedImport`] - A dependency or one of its symbols could not be resolved
/// - [`Error::EntryPointNotFound`] - The requested entry point is not exported
/// - [`Error::EntryPointFailed`] - The entry point returned no module object
/// - [`Error::InitializerFailed`] - `DllMain` refused to attach
/// - [`Error::RecursionLimit`] - Dependency or forwarder chain too deep
///
/// ## Memory Errors
/// - [`Error::AccessDenied`] - A read or write hit a page without the needed protection
/// - [`Error::WriteExecute`] - A mapping was requested writable and executable at once
///
/// ## Archive and Import Errors
/// - [`Error::NotFoundInArchive`] - The archive does not hold the requested path
/// - [`Error::Import`] - The host visible failure of [`crate::hook::ImportHook::load`]
///
/// # Examples
///
/// ```rust,no_run
/// use memimport::{Error, file::Image};
///
/// match Image::from_file(std::path::Path::new("spam.pyd")) {
///     Ok(image) => println!("{} sections", image.sections().count()),
///     Err(Error::Malformed { message, .. }) => eprintln!("Malformed image: {}", message),
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged, truncated or not loadable on this target.
    ///
    /// Raised during validation, before any memory is reserved, and while walking the import,
    /// export and TLS tables of a mapped image. The error includes the source location where
    /// the problem was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// This error occurs when trying to read data beyond the end of a buffer, a file or
    /// a mapped region.
    #[error("Out of Bound read would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// This operation is not supported on the current platform.
    #[error("This operation is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures, such as an operating system refusing a
    /// memory reservation.
    #[error("{0}")]
    Error(String),

    /// Error reported by the zip reader.
    #[error("{0}")]
    ZipErr(#[from] zip::result::ZipError),

    /// A base relocation entry could not be applied.
    ///
    /// Covers unknown relocation kinds, blocks that run past the relocation directory,
    /// fixups that target memory outside the mapped image, and images that have to move
    /// but carry no relocation information.
    #[error("Relocation - {file}:{line}: {message}")]
    Relocation {
        /// The message to be printed for the Relocation error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An import could not be bound.
    ///
    /// `symbol` is `None` when the dependency itself could not be found or loaded, in which
    /// case `source` holds the failure of the nested load, if there was one.
    #[error("Unresolved import from '{dependency}'{}", symbol_suffix(.symbol))]
    UnresolvedImport {
        /// Name of the dependency as it appears in the import table
        dependency: String,
        /// The symbol that could not be found, if the dependency itself was found
        symbol: Option<String>,
        /// The failure of the nested load of the dependency
        #[source]
        source: Option<Box<Error>>,
    },

    /// The requested entry point is not exported by the image.
    #[error("Entry point '{0}' not found")]
    EntryPointNotFound(String),

    /// The entry point ran but returned no module object.
    #[error("Entry point '{0}' returned no module object")]
    EntryPointFailed(String),

    /// A static initializer of the named library reported failure.
    #[error("Initialization of '{0}' failed")]
    InitializerFailed(String),

    /// The archive does not contain the requested path.
    #[error("'{0}' not found in archive")]
    NotFoundInArchive(String),

    /// A memory access hit a page that lacks the required protection.
    #[error("Access to 0x{address:X} denied, requires {required:?}")]
    AccessDenied {
        /// The address that was accessed
        address: u64,
        /// The protection the access needed
        required: Protection,
    },

    /// A mapping was requested as writable and executable at once.
    #[error("Refusing writable and executable mapping at 0x{0:X}")]
    WriteExecute(u64),

    /// Recursion limit reached.
    ///
    /// Dependency loads and export forwarders both recurse. The associated value shows the
    /// depth limit that was reached.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    ///
    /// A mutex was poisoned by a panicking thread.
    #[error("Failed to lock target")]
    LockError,

    /// The host visible import error.
    ///
    /// Every failure of [`crate::hook::ImportHook::load`] is reported with this variant,
    /// naming the module that was requested.
    #[error("can't import module {module}: {source}")]
    Import {
        /// The logical module name that was requested
        module: String,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },
}

fn symbol_suffix(symbol: &Option<String>) -> String {
    symbol
        .as_ref()
        .map(|symbol| format!(" - {symbol}"))
        .unwrap_or_default()
}

impl Error {
    /// Returns the innermost error, following [`Error::Import`] and
    /// [`Error::UnresolvedImport`] causes.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Import { source, .. } => source.root_cause(),
            Error::UnresolvedImport {
                source: Some(source),
                ..
            } => source.root_cause(),
            other => other,
        }
    }
}

impl From<goblin::error::Error> for Error {
    fn from(error: goblin::error::Error) -> Self {
        malformed_error!("{}", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_import_display() {
        let missing = Error::UnresolvedImport {
            dependency: "D.dll".to_string(),
            symbol: None,
            source: None,
        };
        assert_eq!(missing.to_string(), "Unresolved import from 'D.dll'");

        let symbol = Error::UnresolvedImport {
            dependency: "D.dll".to_string(),
            symbol: Some("frob".to_string()),
            source: None,
        };
        assert_eq!(symbol.to_string(), "Unresolved import from 'D.dll' - frob");
    }

    #[test]
    fn test_root_cause_unwraps_nesting() {
        let error = Error::Import {
            module: "spam".to_string(),
            source: Box::new(Error::UnresolvedImport {
                dependency: "A.dll".to_string(),
                symbol: None,
                source: Some(Box::new(Error::EntryPointNotFound("x".to_string()))),
            }),
        };

        assert!(matches!(error.root_cause(), Error::EntryPointNotFound(_)));
        assert!(error.to_string().starts_with("can't import module spam"));
    }

    #[test]
    fn test_goblin_errors_are_malformed() {
        let error: Error = goblin::error::Error::Malformed("bad".to_string()).into();
        assert!(matches!(error, Error::Malformed { .. }));
    }
}
