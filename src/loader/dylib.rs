//! Mach-O image loading.
//!
//! All segments of an image slide together, so one page-aligned host
//! allocation covers the whole `[low, high)` span and the slide is the
//! distance between the allocation base and the lowest segment address.
//! Emulator addresses equal host addresses, which is what lets bind sites
//! and rebased pointers be patched through raw pointers.

use std::path::Path;

use tracing::debug;

use crate::cpu::{Cpu, Prot, check};
use crate::macho::{BindClass, MachImage, RelocOrigin, raw};
use crate::mem::{HostAlloc, round_up};
use crate::paths::BinaryPath;

use super::{DylibImage, DynamicLoader, ImageKind, LoadedImage};

impl DynamicLoader {
    /// Parse, map, rebase and bind a Mach-O file, registering it under the
    /// resolved path.
    pub(crate) fn load_macho(
        &mut self,
        cpu: &mut dyn Cpu,
        resolved: &BinaryPath,
        host_path: &Path,
    ) -> Option<String> {
        let bytes = match std::fs::read(host_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.error(&format!("couldn't read {}: {}", resolved.path, err));
                return None;
            }
        };
        let macho = match MachImage::parse(&bytes) {
            Ok(macho) => macho,
            Err(err) => {
                self.error(&format!("couldn't parse {}: {}", resolved.path, err));
                return None;
            }
        };

        // Preflight. These are reported but not fatal; behavior past a
        // failed check is undefined.
        if macho.cpu_type != raw::CPU_TYPE_ARM {
            self.error("expected ARM binary");
        }
        // Segments must be continuous for the single-span relocation below.
        if macho.has_split_segs() {
            self.error("MH_SPLIT_SEGS not supported");
        }
        if !macho.can_slide() {
            self.error("the binary is not slideable");
        }
        if macho.segments.is_empty() {
            self.error(&format!("no segments in {}", resolved.path));
            return None;
        }

        // Compute the span covering every segment. Segments must slide
        // together, so the image is sized as one block.
        let page = cpu.page_size();
        let mut low = u64::MAX;
        let mut high = 0u64;
        for segment in &macho.segments {
            let seg_low = segment.vmaddr;
            let seg_high = round_up(segment.vmaddr + segment.vmsize, page);
            if (seg_low < high && seg_low >= low) || (seg_high > low && seg_high <= high) {
                self.error("overlapping segments (after rounding to page size)");
            }
            low = low.min(seg_low);
            high = high.max(seg_high);
        }

        let size = high - low;
        let allocation = match HostAlloc::new(size as usize) {
            Ok(allocation) => allocation,
            Err(_) => {
                self.error("couldn't allocate memory for segments");
                return None;
            }
        };
        let slide = allocation.addr().wrapping_sub(low);
        debug!(
            "Mapping {} over [0x{:x}, 0x{:x}) with slide 0x{:x}",
            resolved.path, low, high, slide
        );

        // Register before touching dependencies; recursive loads use the
        // registry as their memo.
        let key = resolved.path.clone();
        self.images.insert(
            key.clone(),
            LoadedImage {
                start: slide,
                size,
                is_wrapper: false,
                kind: ImageKind::Dylib(DylibImage { macho, allocation }),
            },
        );

        self.map_segments(cpu, &key, slide);
        if slide != 0 {
            self.apply_relocations(&key, low, slide);
        }

        // Load referenced libraries. Re-exported ones are picked up lazily
        // by find_symbol.
        let dependencies: Vec<String> = {
            let macho = self.images[&key].macho().unwrap();
            macho
                .dylibs
                .iter()
                .filter(|d| !d.reexport)
                .map(|d| d.name.clone())
                .collect()
        };
        for dependency in dependencies {
            self.load(cpu, &dependency);
        }

        self.bind_symbols(cpu, &key, low, high, slide);

        Some(key)
    }

    /// Copy segment contents into the allocation and hand each range to the
    /// emulator with its translated permissions.
    fn map_segments(&self, cpu: &mut dyn Cpu, key: &str, slide: u64) {
        let macho = self.images[key].macho().unwrap();
        for segment in &macho.segments {
            let prot = vm_prot_to_cpu(segment.initprot);
            let vaddr = segment.vmaddr.wrapping_add(slide);
            // Emulated addresses equal host addresses.
            let host = vaddr as *mut u8;

            if prot == Prot::NONE {
                // Nothing readable to copy; just reserve the range.
                check(cpu.map_ptr(vaddr, segment.vmsize, prot, host));
                continue;
            }

            let content = macho.segment_bytes(segment);
            unsafe {
                std::ptr::copy_nonoverlapping(content.as_ptr(), host, content.len());
                if (content.len() as u64) < segment.vmsize {
                    std::ptr::write_bytes(
                        host.add(content.len()),
                        0,
                        (segment.vmsize - content.len() as u64) as usize,
                    );
                }
            }
            check(cpu.map_ptr(vaddr, segment.vmsize, prot, host));
            debug!(
                "Segment {} at 0x{:x} (vmsize=0x{:x} filesize=0x{:x})",
                segment.name, vaddr, segment.vmsize, segment.filesize
            );
        }
    }

    /// Slide every recorded pointer relocation.
    fn apply_relocations(&self, key: &str, low: u64, slide: u64) {
        let macho = self.images[key].macho().unwrap();
        for relocation in macho.relocations() {
            if relocation.pc_relative
                || relocation.origin != RelocOrigin::DyldInfo
                || relocation.size_bits != 32
                || relocation.scattered
            {
                self.error("unsupported relocation");
            }

            let site = low.wrapping_add(slide).wrapping_add(relocation.offset);
            let in_segment = macho.segments.iter().any(|segment| {
                let start = segment.vmaddr.wrapping_add(slide);
                site >= start && site + 4 <= start + segment.vmsize
            });
            if !in_segment {
                self.error("relocation target out of range");
                continue;
            }

            unsafe {
                let ptr = site as *mut u32;
                let value = ptr.read_unaligned();
                // NULL pointers stay NULL even though the PAGEZERO segment
                // slid; programs would not enjoy non-zero NULLs.
                if value != 0 {
                    ptr.write_unaligned(value.wrapping_add(slide as u32));
                }
            }
        }
    }

    /// Resolve external symbols and write their addresses into the bind
    /// sites. Failed sites are reported and left unwritten.
    fn bind_symbols(&mut self, cpu: &mut dyn Cpu, key: &str, low: u64, high: u64, slide: u64) {
        let bindings = {
            let macho = self.images[key].macho().unwrap();
            macho.bindings().to_vec()
        };

        for binding in &bindings {
            if !matches!(binding.class, BindClass::Standard | BindClass::Lazy)
                || binding.bind_type != raw::BIND_TYPE_POINTER
                || binding.addend != 0
            {
                self.error("unsupported binding info");
                continue;
            }
            if !binding.has_library() {
                self.error("flat-namespace symbols are not supported yet");
                continue;
            }

            let library = {
                let macho = self.images[key].macho().unwrap();
                macho
                    .dylib_name(binding.library_ordinal)
                    .map(str::to_string)
            };
            let Some(library) = library else {
                self.error("symbol's library couldn't be loaded");
                continue;
            };
            let Some(library_key) = self.load(cpu, &library) else {
                self.error("symbol's library couldn't be loaded");
                continue;
            };

            let symbol_addr = self.find_symbol(cpu, &library_key, &binding.symbol);
            if symbol_addr == 0 {
                self.error("external symbol couldn't be resolved");
                continue;
            }

            let target = binding.address.wrapping_add(slide);
            if target < low.wrapping_add(slide) || target + 4 > high.wrapping_add(slide) {
                self.error("address out of range");
                continue;
            }
            unsafe {
                (target as *mut u32).write_unaligned(symbol_addr as u32);
            }
        }
    }
}

/// Translate Mach-O VM protection flags into emulator permissions.
fn vm_prot_to_cpu(vm_prot: u32) -> Prot {
    let mut prot = Prot::NONE;
    if vm_prot & raw::VM_PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if vm_prot & raw::VM_PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if vm_prot & raw::VM_PROT_EXECUTE != 0 {
        prot |= Prot::EXEC;
    }
    prot
}
