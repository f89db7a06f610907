//! The wrapper library contract.
//!
//! For every native library that guest code may call into, the build system
//! generates a pair of shared libraries: a wrapper DLL exporting a lookup
//! index, and a companion library exporting one trampoline per call site.
//! A trampoline runs host-ABI code; it takes a single machine word - the
//! guest's R0, pointing at a block holding the original call's arguments and
//! a slot for the return value.

use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};

/// Exported symbol under which every wrapper DLL publishes its
/// [`WrapperIndex`]. Fixed by the wrapper generator.
pub const WRAPPER_INDEX_SYMBOL: &str = "?Idx@@3UWrapperIndex@@A";

/// Prefix of trampoline exports; the decimal RVA follows.
pub const WRAPPER_SYMBOL_PREFIX: &str = "$__ipaSim_wraps_";

/// Base the generator adds to relative virtual addresses.
pub const WRAPPER_RVA_BASE: u64 = 0x1000;

/// Maps call-site RVAs to the wrapper library exporting their trampolines.
///
/// Read-only data produced by the wrapper generator; the loader never
/// allocates or frees one.
#[repr(C)]
pub struct WrapperIndex {
    pub entry_count: u32,
    pub entries: *const WrapperIndexEntry,
    pub dylib_count: u32,
    /// NUL-terminated library paths, indexed by [`WrapperIndexEntry::dylib`].
    pub dylibs: *const *const c_char,
}

#[repr(C)]
pub struct WrapperIndexEntry {
    pub rva: u32,
    pub dylib: u32,
}

impl WrapperIndex {
    /// Path of the library holding the trampoline for `rva`.
    ///
    /// # Safety
    ///
    /// The index must be a well-formed generator-emitted structure: `entries`
    /// and `dylibs` valid for their counts, paths NUL-terminated.
    pub unsafe fn dylib_for_rva(&self, rva: u64) -> Option<String> {
        let entries = unsafe { std::slice::from_raw_parts(self.entries, self.entry_count as usize) };
        let entry = entries.iter().find(|entry| u64::from(entry.rva) == rva)?;
        if entry.dylib >= self.dylib_count {
            return None;
        }
        let path = unsafe { *self.dylibs.add(entry.dylib as usize) };
        if path.is_null() {
            return None;
        }
        Some(
            unsafe { CStr::from_ptr(path) }
                .to_string_lossy()
                .into_owned(),
        )
    }
}

/// Wrapper library location for a native image:
/// `gen/<basename>.wrapper.dll`.
pub fn wrapper_path(native_path: &str) -> String {
    let file = Path::new(native_path)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    let mut wrapper = file;
    wrapper.set_extension("wrapper.dll");
    PathBuf::from("gen")
        .join(wrapper)
        .to_string_lossy()
        .into_owned()
}

/// Exported name of the trampoline for `rva`.
pub fn trampoline_symbol(rva: u64) -> String {
    format!("{WRAPPER_SYMBOL_PREFIX}{rva}")
}
