//! Native image loading.
//!
//! Native libraries are loaded by the host OS loader and registered with the
//! emulator as read/write but never executable. That missing execute bit is
//! the whole mechanism: every guest attempt to call into native code becomes
//! a fetch-protection fault for the boundary trap to translate.

use std::path::Path;

use tracing::debug;

use crate::cpu::{Cpu, Prot, check};
use crate::host::HostHandle;
use crate::macho::raw;
use crate::mem::{align_down, round_up};
use crate::paths::BinaryPath;

use super::{DynamicLoader, ImageKind, LoadedImage, NativeImage};

/// Export that marks a native library as a Mach-O facade: the symbol's value
/// is the in-memory `mach_header` of the dylib the library stands in for.
const DYLIB_HEADER_SYMBOL: &str = "_mh_dylib_header";

impl DynamicLoader {
    /// Load a native library through the host loader and register its
    /// in-memory range.
    pub(crate) fn load_native(
        &mut self,
        cpu: &mut dyn Cpu,
        resolved: &BinaryPath,
        host_path: &Path,
    ) -> Option<String> {
        // Mark the library as found before calling the host: dependency
        // resolution can re-enter `load` with the same path.
        let key = resolved.path.clone();
        self.images.insert(
            key.clone(),
            LoadedImage {
                start: 0,
                size: 0,
                is_wrapper: false,
                kind: ImageKind::Native(NativeImage {
                    handle: HostHandle(0),
                }),
            },
        );

        let handle = match self.host.open(host_path) {
            Ok(handle) => handle,
            Err(err) => {
                self.error(&format!("couldn't load DLL: {} ({})", resolved.path, err));
                self.images.remove(&key);
                return None;
            }
        };
        if let Some(LoadedImage {
            kind: ImageKind::Native(native),
            ..
        }) = self.images.get_mut(&key)
        {
            native.handle = handle;
        }

        // Find out where the library lies in memory. Libraries acting as
        // dylib facades are mapped from their Mach-O header, without the
        // host format's own headers; everything else in its entirety.
        let (start, size) = if let Some(header) = self.host.symbol(handle, DYLIB_HEADER_SYMBOL) {
            (header, unsafe { dylib_size_at(header) })
        } else {
            match self.host.module_bounds(handle) {
                Ok(bounds) => bounds,
                Err(err) => {
                    self.error(&format!(
                        "couldn't load module information: {} ({})",
                        resolved.path, err
                    ));
                    return None;
                }
            }
        };
        if let Some(image) = self.images.get_mut(&key) {
            image.start = start;
            image.size = size;
        }

        // Read/write only - fetches out of this range must fault.
        let page = cpu.page_size();
        let map_start = align_down(start, page);
        let map_size = round_up(size + (start - map_start), page);
        check(cpu.map_ptr(
            map_start,
            map_size,
            Prot::READ | Prot::WRITE,
            map_start as *mut u8,
        ));
        debug!(
            "Native image {} at 0x{:x} (size 0x{:x})",
            resolved.path, start, size
        );

        Some(key)
    }
}

/// Size of an in-memory dylib: the sum of `vmsize` over its LC_SEGMENT
/// commands.
///
/// # Safety
///
/// `header` must point at a mapped, well-formed 32-bit `mach_header`
/// followed by its load commands (the facade contract).
unsafe fn dylib_size_at(header: u64) -> u64 {
    let header = unsafe { &*(header as *const raw::mach_header) };
    let mut cursor = (header as *const raw::mach_header).wrapping_add(1) as *const u8;
    let mut size = 0u64;
    for _ in 0..header.ncmds {
        let cmd = unsafe { &*(cursor as *const raw::load_command) };
        if cmd.cmd == raw::LC_SEGMENT {
            let segment = unsafe { &*(cursor as *const raw::segment_command) };
            size += u64::from(segment.vmsize);
        }
        cursor = unsafe { cursor.add(cmd.cmdsize as usize) };
    }
    size
}
