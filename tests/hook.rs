//! End-to-end imports out of a zip file on disk.

#[path = "../src/test/builder.rs"]
mod builder;

use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use builder::{PeBuilder, SCN_CODE, SCN_DATA};
use memimport::{
    loader::{Initializer, DLL_PROCESS_ATTACH},
    prelude::*,
};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

const OBJECT: u64 = 0xC0FF_EE00;

/// Counts calls into images without running them. Calls must land on executable pages.
#[derive(Default)]
struct Counting {
    entry_points: AtomicUsize,
    attaches: AtomicUsize,
}

impl Counting {
    fn check(image: &LoadedImage, address: u64) -> Result<()> {
        let rva = address
            .checked_sub(image.base())
            .filter(|rva| *rva < image.size() as u64)
            .ok_or(Error::NotSupported)? as u32;
        if image.protection_at(rva).contains(Protection::EXECUTE) {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                address,
                required: Protection::EXECUTE,
            })
        }
    }
}

impl Executor for Counting {
    fn run_initializer(
        &self,
        image: &LoadedImage,
        _kind: Initializer,
        address: u64,
        reason: u32,
    ) -> Result<bool> {
        Self::check(image, address)?;
        if reason == DLL_PROCESS_ATTACH {
            self.attaches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(true)
    }

    fn call_entry_point(&self, image: &LoadedImage, address: u64) -> Result<u64> {
        Self::check(image, address)?;
        self.entry_points.fetch_add(1, Ordering::SeqCst);
        Ok(OBJECT)
    }
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn extension(entry_point: &str, imports: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
    let text = builder.section(".text", SCN_CODE, vec![0xC3; 0x40]);
    builder.section(".data", SCN_DATA, vec![0; 0x20]);
    builder.entry_point(text + 0x30).export(entry_point, text);
    for (library, symbol) in imports {
        builder.import(library, &[*symbol]);
    }
    builder.build().bytes
}

fn helper() -> Vec<u8> {
    let mut builder = PeBuilder::new_amd64(0x1_8000_0000);
    let text = builder.section(".text", SCN_CODE, vec![0xC3; 0x20]);
    builder
        .dll_name("helper.dll")
        .entry_point(text + 0x10)
        .export("helper_fn", text);
    builder.build().bytes
}

fn write_zip(files: &[(&str, Vec<u8>)]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut zip = ZipWriter::new(file.as_file_mut());
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.add_directory("pkg/", options).unwrap();
    for (path, data) in files {
        zip.start_file(*path, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
    file
}

fn hook(
    file: &tempfile::NamedTempFile,
    config: HookConfig,
) -> (ImportHook<ZipArchiveIndex>, Arc<Counting>, HeapMemory) {
    let memory = HeapMemory::new();
    let executor = Arc::new(Counting::default());
    let loader = Loader::new(
        Arc::new(memory.clone()),
        Arc::clone(&executor) as Arc<dyn Executor>,
        LoaderConfig::new().with_machine(Machine::Amd64),
    );
    let archive = ZipArchiveIndex::from_file(file.path()).unwrap();
    (ImportHook::new(archive, loader, config), executor, memory)
}

#[test]
fn test_package_module_with_archive_dependency() {
    let file = write_zip(&[
        ("pkg/_speedups.pyd", extension("PyInit__speedups", &[("HELPER.DLL", "helper_fn")])),
        ("helper.dll", helper()),
    ]);
    let (hook, executor, memory) = hook(&file, HookConfig::new());

    let module = hook.load("pkg._speedups").unwrap();

    assert_eq!(module.name, "pkg._speedups");
    assert_eq!(
        module.file,
        format!("{}/pkg/_speedups.pyd", file.path().display())
    );
    assert_eq!(module.module.object(), OBJECT);
    assert_eq!(module.module.entry_point(), "PyInit__speedups");

    let image = module.module.image();
    assert_eq!(image.dependencies().len(), 1);
    assert!(image.dependencies()[0].is_initialized());
    assert!(image.is_initialized());

    // DllMain of the extension and of its dependency
    assert_eq!(executor.attaches.load(Ordering::SeqCst), 2);
    assert_eq!(executor.entry_points.load(Ordering::SeqCst), 1);
    assert_eq!(memory.reservations(), 2);
}

#[test]
fn test_missing_dependency_fails_cleanly() {
    let file = write_zip(&[(
        "spam.pyd",
        extension("PyInit_spam", &[("absent.dll", "nothing")]),
    )]);
    let (hook, executor, memory) = hook(&file, HookConfig::new());

    let error = hook.load("spam").unwrap_err();

    assert!(matches!(&error, Error::Import { module, .. } if module == "spam"));
    assert!(matches!(
        error.root_cause(),
        Error::UnresolvedImport { dependency, symbol: None, .. } if dependency == "absent.dll"
    ));
    assert!(!hook.is_loaded("spam"));
    assert_eq!(memory.allocated_bytes(), 0);
    assert_eq!(executor.entry_points.load(Ordering::SeqCst), 0);
}

#[test]
fn test_legacy_module_name() {
    let file = write_zip(&[("pywintypes311.dll", extension("PyInit_pywintypes", &[]))]);
    let naming = NamingConvention::new(RuntimeVersion::new(3, 11));
    let (hook, _, _) = hook(&file, HookConfig::new().with_naming(naming));

    let module = hook.load("pywintypes").unwrap();
    assert!(module.file.ends_with("/pywintypes311.dll"));
    assert_eq!(module.module.image().name(), "pywintypes311.dll");
}

#[test]
fn test_verbose_diagnostics() {
    let file = write_zip(&[("spam.pyd", extension("PyInit_spam", &[]))]);
    let sink = Sink::default();
    let (hook, _, _) = hook(
        &file,
        HookConfig::new().with_diagnostics(Diagnostics::writer(sink.clone())),
    );
    let archive = file.path().display().to_string();

    hook.load("spam").unwrap();
    hook.load("spam").unwrap();

    assert_eq!(
        sink.lines(),
        vec![
            format!("# found spam.pyd in archive {archive}"),
            format!("import spam # loaded from archive {archive}/spam.pyd"),
            format!("import spam # previously loaded from archive {archive}"),
        ]
    );
}

#[test]
fn test_concurrent_imports_load_once() {
    let file = write_zip(&[("spam.pyd", extension("PyInit_spam", &[]))]);
    let (hook, executor, memory) = hook(&file, HookConfig::new());

    let modules: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| hook.load("spam").unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(modules.iter().all(|m| Arc::ptr_eq(m, &modules[0])));
    assert_eq!(executor.entry_points.load(Ordering::SeqCst), 1);
    assert_eq!(memory.total_reservations(), 1);
}

#[test]
fn test_unknown_module_is_not_ours() {
    let file = write_zip(&[("spam.pyd", extension("PyInit_spam", &[]))]);
    let (hook, _, _) = hook(&file, HookConfig::new());

    assert!(hook.resolve("eggs").is_none());
    assert!(hook.resolve("pkg").is_none());
    assert!(matches!(
        hook.load("eggs").unwrap_err().root_cause(),
        Error::NotFoundInArchive(_)
    ));
}
