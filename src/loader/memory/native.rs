//! Memory backend over real process pages.
//!
//! Regions are reserved read-write with `mmap` / `VirtualAlloc` and sealed with `mprotect` /
//! `VirtualProtect`. This is the backend under which mapped code can actually run.

use std::ptr::NonNull;

use super::{MappedRegion, MemoryBackend, PageTable, Protection};
use crate::{Error, Result};

#[cfg(unix)]
mod platform {
    use std::ptr;

    use crate::loader::Protection;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    /// Reserve zeroed read-write memory, near `hint` if the kernel agrees.
    pub unsafe fn reserve(size: usize, hint: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn protect(ptr: *mut u8, size: usize, protection: Protection) -> bool {
        let mut flags = libc::PROT_NONE;
        if protection.contains(Protection::READ) {
            flags |= libc::PROT_READ;
        }
        if protection.contains(Protection::WRITE) {
            flags |= libc::PROT_WRITE;
        }
        if protection.contains(Protection::EXECUTE) {
            flags |= libc::PROT_EXEC;
        }
        unsafe { libc::mprotect(ptr as *mut _, size, flags) == 0 }
    }

    pub unsafe fn release(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    use crate::loader::Protection;

    pub fn page_size() -> usize {
        4096
    }

    /// Reserve zeroed read-write memory, at `hint` if that range is free.
    pub unsafe fn reserve(size: usize, hint: usize) -> *mut u8 {
        let at_hint = unsafe {
            VirtualAlloc(
                hint as *const _,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if !at_hint.is_null() {
            return at_hint as *mut u8;
        }

        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn protect(ptr: *mut u8, size: usize, protection: Protection) -> bool {
        let read = protection.contains(Protection::READ);
        let write = protection.contains(Protection::WRITE);
        let flags = if protection.contains(Protection::EXECUTE) {
            if read {
                PAGE_EXECUTE_READ
            } else {
                PAGE_EXECUTE
            }
        } else if write {
            PAGE_READWRITE
        } else if read {
            PAGE_READONLY
        } else {
            PAGE_NOACCESS
        };

        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *const _, size, flags, &mut old_protect) != 0 }
    }

    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

/// Backend that reserves real pages from the operating system.
///
/// Mapping an image with this backend is the only way its code can be executed, see
/// [`crate::loader::NativeExecutor`]. On targets other than unix and Windows, every reservation
/// fails with [`crate::Error::NotSupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMemory;

impl NativeMemory {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> NativeMemory {
        NativeMemory
    }
}

impl MemoryBackend for NativeMemory {
    #[cfg(any(unix, windows))]
    fn page_size(&self) -> usize {
        platform::page_size()
    }

    #[cfg(not(any(unix, windows)))]
    fn page_size(&self) -> usize {
        4096
    }

    #[cfg(any(unix, windows))]
    fn reserve(&self, size: usize, preferred: Option<u64>) -> Result<Box<dyn MappedRegion>> {
        let page_size = platform::page_size();
        let size = align_up!(size.max(1), page_size);
        let hint = preferred
            .and_then(|address| usize::try_from(address).ok())
            .filter(|address| address % page_size == 0)
            .unwrap_or(0);

        let ptr = unsafe { platform::reserve(size, hint) };
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(Error::Error(format!(
                "Failed to reserve 0x{:X} bytes: {}",
                size,
                std::io::Error::last_os_error()
            )));
        };

        Ok(Box::new(NativeRegion {
            ptr,
            pages: PageTable::new(page_size, size),
        }))
    }

    #[cfg(not(any(unix, windows)))]
    fn reserve(&self, _size: usize, _preferred: Option<u64>) -> Result<Box<dyn MappedRegion>> {
        Err(Error::NotSupported)
    }
}

/// A reservation of real pages.
#[cfg(any(unix, windows))]
struct NativeRegion {
    ptr: NonNull<u8>,
    pages: PageTable,
}

// SAFETY: the region exclusively owns its pages; shared access only reads them and every
// mutation goes through `&mut self`.
#[cfg(any(unix, windows))]
unsafe impl Send for NativeRegion {}
#[cfg(any(unix, windows))]
unsafe impl Sync for NativeRegion {}

#[cfg(any(unix, windows))]
impl MappedRegion for NativeRegion {
    fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    fn is_executable(&self) -> bool {
        true
    }

    fn protection_at(&self, offset: usize) -> Protection {
        self.pages.get(offset)
    }

    fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.pages.check(self.base(), offset, len, Protection::READ)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.pages
            .check(self.base(), offset, data.len(), Protection::WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    fn protect(&mut self, offset: usize, len: usize, protection: Protection) -> Result<()> {
        if protection.is_write_execute() {
            return Err(Error::WriteExecute(self.base() + offset as u64));
        }

        let (start, size) = self.pages.span(offset, len)?;
        if size == 0 {
            return Ok(());
        }

        let success =
            unsafe { platform::protect(self.ptr.as_ptr().add(start), size, protection) };
        if !success {
            return Err(Error::Error(format!(
                "Failed to protect 0x{:X} bytes at 0x{:X}: {}",
                size,
                self.base() + start as u64,
                std::io::Error::last_os_error()
            )));
        }

        self.pages.set(start, size, protection);
        Ok(())
    }
}

#[cfg(any(unix, windows))]
impl Drop for NativeRegion {
    fn drop(&mut self) {
        unsafe { platform::release(self.ptr.as_ptr(), self.pages.len()) };
    }
}

#[cfg(all(test, any(unix, windows)))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_write_seal() {
        let memory = NativeMemory::new();
        let page = memory.page_size();
        let mut region = memory.reserve(page + 1, None).unwrap();

        assert_eq!(region.len(), page * 2);
        assert_eq!(region.base() % page as u64, 0);
        assert!(region.read(0, page * 2).unwrap().iter().all(|b| *b == 0));

        region.write(page - 2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(region.read(page - 2, 4).unwrap(), &[1, 2, 3, 4]);

        region.protect(0, page, Protection::READ).unwrap();
        assert_eq!(region.protection_at(0), Protection::READ);
        assert_eq!(region.read(page - 2, 2).unwrap(), &[1, 2]);
        assert!(matches!(
            region.write(0, &[9]),
            Err(Error::AccessDenied { .. })
        ));
        region.write(page, &[9]).unwrap();

        assert!(matches!(
            region.protect(page, page, Protection::all()),
            Err(Error::WriteExecute(_))
        ));

        region
            .protect(page, page, Protection::READ | Protection::EXECUTE)
            .unwrap();
        assert!(region.write(page, &[0]).is_err());
    }

    #[test]
    fn test_out_of_bounds() {
        let memory = NativeMemory::new();
        let mut region = memory.reserve(16, None).unwrap();
        let len = region.len();

        assert!(matches!(
            region.read(len, 1),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(region.write(len - 1, &[0, 0]).is_err());
        assert!(region.protect(len, 1, Protection::READ).is_err());
    }
}
