//! Import hook configuration and the verbose diagnostic stream.

use std::{
    fmt,
    io::Write,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{hook::NamingConvention, loader::DependencyResolver};

/// Where verbose import messages go.
///
/// These messages are meant for the person running the host, not for the log: they are
/// written as plain lines, independent of any logger that may be installed.
#[derive(Clone, Default)]
pub enum Diagnostics {
    /// No messages
    #[default]
    Disabled,
    /// Messages go to standard error
    Stderr,
    /// Messages go to a caller supplied sink
    Writer(Arc<Mutex<Box<dyn Write + Send>>>),
}

impl Diagnostics {
    /// Sends messages to `writer`.
    pub fn writer(writer: impl Write + Send + 'static) -> Diagnostics {
        Diagnostics::Writer(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// Returns `true` unless disabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Diagnostics::Disabled)
    }

    /// Writes one line. Failures to write are logged and otherwise ignored.
    pub fn line(&self, message: fmt::Arguments<'_>) {
        let result = match self {
            Diagnostics::Disabled => return,
            Diagnostics::Stderr => writeln!(std::io::stderr(), "{message}"),
            Diagnostics::Writer(writer) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                writeln!(writer, "{message}").and_then(|()| writer.flush())
            }
        };

        if let Err(error) = result {
            log::debug!("diagnostic line dropped - {}", error);
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostics::Disabled => f.write_str("Disabled"),
            Diagnostics::Stderr => f.write_str("Stderr"),
            Diagnostics::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Configuration of an [`crate::hook::ImportHook`].
///
/// # Default Configuration
///
/// - Naming rules of [`NamingConvention::default`]
/// - No diagnostic messages
/// - Dependencies are only looked up in the archive
///
/// # Example
///
/// ```rust
/// use memimport::{
///     hook::{HookConfig, NamingConvention, RuntimeVersion},
///     loader::SystemLibraries,
/// };
///
/// let config = HookConfig::new()
///     .with_naming(NamingConvention::new(RuntimeVersion::new(3, 11)))
///     .with_host_resolver(SystemLibraries)
///     .verbose();
///
/// assert!(config.diagnostics.is_enabled());
/// ```
#[derive(Clone, Default)]
pub struct HookConfig {
    /// How module names map to paths and entry points
    pub naming: NamingConvention,
    /// Verbose import messages
    pub diagnostics: Diagnostics,
    /// Consulted for dependencies the archive does not contain
    pub host: Option<Arc<dyn DependencyResolver + Send + Sync>>,
}

impl HookConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the naming rules.
    #[must_use]
    pub fn with_naming(mut self, naming: NamingConvention) -> Self {
        self.naming = naming;
        self
    }

    /// Writes verbose import messages to standard error.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.diagnostics = Diagnostics::Stderr;
        self
    }

    /// Sets where verbose import messages go.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Resolves dependencies missing from the archive through `resolver`.
    #[must_use]
    pub fn with_host_resolver(
        mut self,
        resolver: impl DependencyResolver + Send + Sync + 'static,
    ) -> Self {
        self.host = Some(Arc::new(resolver));
        self
    }
}

impl fmt::Debug for HookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookConfig")
            .field("naming", &self.naming)
            .field("diagnostics", &self.diagnostics)
            .field("host", &self.host.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_receives_lines() {
        let sink = Sink::default();
        let diagnostics = Diagnostics::writer(sink.clone());

        diagnostics.line(format_args!("import {} # test", "spam"));
        Diagnostics::Disabled.line(format_args!("never"));

        assert_eq!(
            String::from_utf8(sink.0.lock().unwrap().clone()).unwrap(),
            "import spam # test\n"
        );
    }

    #[test]
    fn test_defaults() {
        let config = HookConfig::new();
        assert!(!config.diagnostics.is_enabled());
        assert!(config.host.is_none());
        assert_eq!(config.naming, NamingConvention::default());
    }
}
