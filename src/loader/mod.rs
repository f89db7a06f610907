//! The dynamic loader.
//!
//! [`DynamicLoader`] owns everything the emulator can see: every loaded
//! image, the guest stack and the kernel sentinel page. Images are loaded at
//! most once per resolved path; the registry doubles as the memo that breaks
//! dependency cycles and as the address-range reverse lookup the boundary
//! trap relies on.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cpu::{Cpu, Prot, check};
use crate::host::{DiagnosticSink, HostHandle, HostLoader, PackageStore};
use crate::macho::MachImage;
use crate::mem::HostAlloc;
use crate::paths::{BinaryPath, resolve_path};

mod dylib;
mod exec;
mod native;
pub mod wrapper;

/// A Mach-O image mapped from a package file. Owns the single host
/// allocation backing all of its segments.
pub struct DylibImage {
    pub macho: MachImage,
    #[allow(dead_code)]
    allocation: HostAlloc,
}

/// A native library loaded by the host loader. The host owns its memory.
pub struct NativeImage {
    pub handle: HostHandle,
}

pub(crate) enum ImageKind {
    Dylib(DylibImage),
    Native(NativeImage),
}

/// A loaded image registered with the emulator.
pub struct LoadedImage {
    /// Base of the image in emulator (= host) address space.
    pub start: u64,
    pub size: u64,
    /// True for generated wrapper libraries (`gen/*.wrapper.dll`).
    pub is_wrapper: bool,
    pub(crate) kind: ImageKind,
}

impl LoadedImage {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.start + self.size
    }

    pub fn is_dylib(&self) -> bool {
        matches!(self.kind, ImageKind::Dylib(_))
    }

    /// Whether exported C symbols carry a leading underscore. Mach-O images
    /// do, native libraries don't.
    pub fn has_underscore_prefix(&self) -> bool {
        self.is_dylib()
    }

    /// The parsed Mach-O, for dylib images.
    pub fn macho(&self) -> Option<&MachImage> {
        match &self.kind {
            ImageKind::Dylib(dylib) => Some(&dylib.macho),
            ImageKind::Native(_) => None,
        }
    }
}

/// Result of reverse-looking-up an address.
pub struct AddrInfo<'a> {
    /// Registry key of the containing image.
    pub path: &'a str,
    pub image: &'a LoadedImage,
    /// Reserved for symbol resolution; not populated yet.
    pub symbol: Option<String>,
}

enum BinaryFormat {
    MachO,
    Pe,
    Unknown,
}

/// The dynamic loader and image registry.
pub struct DynamicLoader {
    images: HashMap<String, LoadedImage>,
    kernel: HostAlloc,
    /// Guest stack, held so its mapping outlives every emulator run.
    #[allow(dead_code)]
    stack: Option<HostAlloc>,
    host: Box<dyn HostLoader>,
    package: Box<dyn PackageStore>,
    diag: Box<dyn DiagnosticSink>,
}

impl DynamicLoader {
    /// Create a loader and map the kernel sentinel page.
    ///
    /// The kernel page is a no-permission mapping whose base serves as the
    /// return address of the top-level entry call: the first fetch after the
    /// guest returns faults there, which is the clean-termination signal.
    pub fn new(
        cpu: &mut dyn Cpu,
        host: Box<dyn HostLoader>,
        package: Box<dyn PackageStore>,
        diag: Box<dyn DiagnosticSink>,
    ) -> crate::Result<DynamicLoader> {
        let page = cpu.page_size();
        let kernel = HostAlloc::new(page as usize)?;
        check(cpu.map_ptr(kernel.addr(), page, Prot::NONE, kernel.as_mut_ptr()));
        Ok(DynamicLoader {
            images: HashMap::new(),
            kernel,
            stack: None,
            host,
            package,
            diag,
        })
    }

    /// Base address of the kernel sentinel page.
    pub fn kernel_addr(&self) -> u64 {
        self.kernel.addr()
    }

    /// Look up a loaded image by its registry key (resolved path).
    pub fn image(&self, path: &str) -> Option<&LoadedImage> {
        self.images.get(path)
    }

    /// Report a non-fatal error and keep going.
    pub(crate) fn error(&self, message: &str) {
        self.diag.report(message);
    }

    /// Load a binary, or return it if the resolved path is already loaded.
    ///
    /// Returns the registry key of the image, or `None` when loading failed
    /// (the failure has been reported).
    pub fn load(&mut self, cpu: &mut dyn Cpu, path: &str) -> Option<String> {
        let resolved = resolve_path(path);
        if self.images.contains_key(&resolved.path) {
            return Some(resolved.path);
        }

        if !self.file_exists(&resolved) {
            self.error(&format!("invalid file: {}", resolved.path));
            return None;
        }

        let host_path = self.host_path(&resolved);
        let key = match sniff_format(&host_path) {
            BinaryFormat::MachO => self.load_macho(cpu, &resolved, &host_path)?,
            BinaryFormat::Pe => self.load_native(cpu, &resolved, &host_path)?,
            BinaryFormat::Unknown => {
                self.error(&format!("invalid binary type: {}", resolved.path));
                return None;
            }
        };

        // Recognize wrapper DLLs by their staging location and suffix.
        let gen_prefix = format!("gen{}", std::path::MAIN_SEPARATOR);
        let is_wrapper = resolved.relative
            && resolved.path.starts_with(&gen_prefix)
            && resolved.path.ends_with(".wrapper.dll");
        if let Some(image) = self.images.get_mut(&key) {
            image.is_wrapper = is_wrapper;
        }

        debug!("Loaded {} ({})", key, if is_wrapper { "wrapper" } else { "image" });
        Some(key)
    }

    /// Find the image whose range contains `addr`.
    ///
    /// A linear scan is fine here: the number of loaded images is small
    /// (tens) and the boundary trap is not a hot path.
    pub fn lookup(&self, addr: u64) -> Option<AddrInfo<'_>> {
        self.images
            .iter()
            .find(|(_, image)| image.contains(addr))
            .map(|(path, image)| AddrInfo {
                path,
                image,
                symbol: None,
            })
    }

    /// Like [`lookup`](Self::lookup), reserved for symbol enrichment.
    pub fn inspect(&self, addr: u64) -> Option<AddrInfo<'_>> {
        self.lookup(addr)
    }

    /// Resolve a symbol in a loaded image.
    ///
    /// For Mach-O images the local symbol table wins; otherwise re-exported
    /// dylibs are searched, stripping the leading underscore when delegating
    /// to an image that does not use that convention. Zero means not found.
    pub fn find_symbol(&mut self, cpu: &mut dyn Cpu, path: &str, name: &str) -> u64 {
        let Some(image) = self.images.get(path) else {
            return 0;
        };
        let reexports: Vec<String> = match &image.kind {
            ImageKind::Native(native) => {
                return self.host.symbol(native.handle, name).unwrap_or(0);
            }
            ImageKind::Dylib(dylib) => {
                if let Some(value) = dylib.macho.symbol_value(name) {
                    return image.start.wrapping_add(value);
                }
                dylib
                    .macho
                    .dylibs
                    .iter()
                    .filter(|d| d.reexport)
                    .map(|d| d.name.clone())
                    .collect()
            }
        };

        for library in reexports {
            let Some(key) = self.load(cpu, &library) else {
                continue;
            };
            let delegated = {
                let target = &self.images[&key];
                if !target.has_underscore_prefix() && name.starts_with('_') {
                    name[1..].to_string()
                } else {
                    name.to_string()
                }
            };
            let addr = self.find_symbol(cpu, &key, &delegated);
            if addr != 0 {
                return addr;
            }
        }
        0
    }

    fn file_exists(&self, resolved: &BinaryPath) -> bool {
        if resolved.relative {
            self.package.contains(&resolved.path)
        } else {
            Path::new(&resolved.path).exists()
        }
    }

    fn host_path(&self, resolved: &BinaryPath) -> PathBuf {
        if resolved.relative {
            self.package.base_dir().join(&resolved.path)
        } else {
            PathBuf::from(&resolved.path)
        }
    }
}

/// Classify a file by magic: Mach-O (thin or universal) first, then PE.
fn sniff_format(path: &Path) -> BinaryFormat {
    let mut magic = [0u8; 4];
    let readable = File::open(path).and_then(|mut f| f.read_exact(&mut magic));
    if readable.is_err() {
        return BinaryFormat::Unknown;
    }
    let word = u32::from_le_bytes(magic);
    if word == crate::macho::raw::MH_MAGIC
        || word == crate::macho::raw::FAT_MAGIC
        || word == crate::macho::raw::FAT_CIGAM
    {
        BinaryFormat::MachO
    } else if magic[0] == b'M' && magic[1] == b'Z' {
        BinaryFormat::Pe
    } else {
        BinaryFormat::Unknown
    }
}
