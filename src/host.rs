//! Host-side collaborators.
//!
//! Three capabilities the loader consumes but does not implement: loading a
//! native shared library and resolving its exports, checking what files the
//! application package contains, and reporting non-fatal errors to whoever is
//! watching. Each is a trait with a host-backed default implementation.

use std::ffi::{CStr, CString};
use std::io;
use std::path::{Path, PathBuf};

/// Opaque token for a native library loaded by a [`HostLoader`].
///
/// Only the loader that produced a handle can interpret it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostHandle(pub u64);

/// The host operating system's library loader.
pub trait HostLoader {
    /// Load a shared library. The returned handle stays valid for the
    /// lifetime of the loader (libraries are never unloaded).
    fn open(&self, path: &Path) -> io::Result<HostHandle>;

    /// Address of an exported symbol, or `None` if the library does not
    /// export it.
    fn symbol(&self, handle: HostHandle, name: &str) -> Option<u64>;

    /// Base address and in-memory size of the loaded module.
    fn module_bounds(&self, handle: HostHandle) -> io::Result<(u64, u64)>;
}

/// `dlopen`-backed host loader.
pub struct SystemLoader;

impl HostLoader for SystemLoader {
    fn open(&self, path: &Path) -> io::Result<HostHandle> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(io::Error::other(last_dl_error()));
        }
        Ok(HostHandle(handle as u64))
    }

    fn symbol(&self, handle: HostHandle, name: &str) -> Option<u64> {
        let c_name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(handle.0 as *mut libc::c_void, c_name.as_ptr()) };
        if addr.is_null() { None } else { Some(addr as u64) }
    }

    #[cfg(target_os = "linux")]
    fn module_bounds(&self, handle: HostHandle) -> io::Result<(u64, u64)> {
        use libc::{c_int, c_void, dl_phdr_info};

        // `libc` does not expose glibc's internal `struct link_map`; only the
        // leading `l_addr` field is needed here, so declare it locally.
        #[repr(C)]
        struct LinkMap {
            l_addr: usize,
        }

        let mut map: *mut LinkMap = std::ptr::null_mut();
        let rc = unsafe {
            libc::dlinfo(
                handle.0 as *mut c_void,
                libc::RTLD_DI_LINKMAP,
                &mut map as *mut _ as *mut c_void,
            )
        };
        if rc != 0 || map.is_null() {
            return Err(io::Error::other(last_dl_error()));
        }
        let base = unsafe { (*map).l_addr as u64 };

        struct Query {
            base: u64,
            size: u64,
        }

        unsafe extern "C" fn visit(info: *mut dl_phdr_info, _size: usize, data: *mut c_void) -> c_int {
            let query = unsafe { &mut *(data as *mut Query) };
            let info = unsafe { &*info };
            if info.dlpi_addr as u64 != query.base {
                return 0;
            }
            let phdrs = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
            for phdr in phdrs {
                if phdr.p_type == libc::PT_LOAD {
                    query.size = query.size.max(phdr.p_vaddr as u64 + phdr.p_memsz as u64);
                }
            }
            1
        }

        let mut query = Query { base, size: 0 };
        unsafe { libc::dl_iterate_phdr(Some(visit), &mut query as *mut _ as *mut c_void) };
        if query.size == 0 {
            return Err(io::Error::other("module not present in program header list"));
        }
        Ok((base, query.size))
    }

    #[cfg(not(target_os = "linux"))]
    fn module_bounds(&self, _handle: HostHandle) -> io::Result<(u64, u64)> {
        Err(io::Error::other("module bounds unavailable on this host"))
    }
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dl error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

/// The installed application package.
pub trait PackageStore {
    /// Directory the package is installed at; package-relative paths resolve
    /// against this.
    fn base_dir(&self) -> &Path;

    /// Whether the package contains `relative`.
    fn contains(&self, relative: &str) -> bool;
}

/// A package rooted at a plain directory.
pub struct DirPackage {
    root: PathBuf,
}

impl DirPackage {
    pub fn new(root: impl Into<PathBuf>) -> DirPackage {
        DirPackage { root: root.into() }
    }
}

impl PackageStore for DirPackage {
    fn base_dir(&self) -> &Path {
        &self.root
    }

    fn contains(&self, relative: &str) -> bool {
        self.root.join(relative).exists()
    }
}

/// Sink for non-fatal loader errors.
///
/// The loader reports and keeps going; what "report" means (log line, dialog,
/// both) is up to the sink.
pub trait DiagnosticSink {
    fn report(&self, message: &str);
}

/// Forwards reports to the error log stream.
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, message: &str) {
        tracing::error!("Error occurred: {message}");
    }
}
