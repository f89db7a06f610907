//! 32-bit ARM Mach-O parsing.
//!
//! [`MachImage::parse`] reads a thin Mach-O (or the ARM slice of a universal
//! binary) into a flat model: segments, referenced dylibs, defined symbols,
//! the entry point, pointer rebase sites and external bind sites. The raw
//! file bytes are kept so the loader can copy segment contents into the
//! address space it builds.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{trace, warn};

pub mod raw;

mod opcodes;

#[derive(Debug, Error)]
pub enum MachError {
    #[error("not a Mach-O file")]
    NotMachO,

    #[error("no 32-bit ARM slice in universal binary")]
    MissingArmSlice,

    #[error("truncated or malformed load commands")]
    Truncated,

    #[error("missing __TEXT segment")]
    MissingTextSegment,
}

/// A segment load command.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    /// Initial VM protection (VM_PROT_* bits).
    pub initprot: u32,
}

/// A dylib referenced by the image.
#[derive(Debug, Clone)]
pub struct DylibRef {
    pub name: String,
    /// True for LC_REEXPORT_DYLIB: the dylib's exports are visible through
    /// this image.
    pub reexport: bool,
}

/// Where a relocation record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocOrigin {
    /// LC_DYLD_INFO rebase opcodes.
    DyldInfo,
    /// Classic section relocation tables.
    RelocTable,
}

/// A pointer relocation site.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Site offset relative to the image's lowest segment address.
    pub offset: u64,
    pub pc_relative: bool,
    pub size_bits: u8,
    pub scattered: bool,
    pub origin: RelocOrigin,
}

/// Binding class of an external symbol reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindClass {
    Standard,
    Lazy,
    Weak,
}

/// An external symbol bind site.
#[derive(Debug, Clone)]
pub struct Binding {
    pub class: BindClass,
    pub bind_type: u8,
    pub addend: i64,
    /// 1-based index into the image's dylib list; 0 or negative are the
    /// special self/flat-namespace ordinals.
    pub library_ordinal: i32,
    pub symbol: String,
    /// Un-slid virtual address of the 32-bit slot to patch.
    pub address: u64,
}

impl Binding {
    /// Whether the record names a specific library (two-level namespace).
    pub fn has_library(&self) -> bool {
        self.library_ordinal > 0
    }
}

/// A parsed 32-bit Mach-O image.
pub struct MachImage {
    pub cpu_type: u32,
    pub file_type: u32,
    pub flags: u32,
    pub segments: Vec<Segment>,
    pub dylibs: Vec<DylibRef>,
    /// Un-slid virtual address of the entry point; 0 when the image has none.
    pub entry_point: u64,
    symbols: HashMap<String, u64>,
    relocations: Vec<Relocation>,
    bindings: Vec<Binding>,
    data: Vec<u8>,
}

enum EntryCommand {
    None,
    Main(u64),
    ThreadPc(u64),
}

impl MachImage {
    /// Parse a thin 32-bit Mach-O, or the ARM slice of a universal binary.
    pub fn parse(bytes: &[u8]) -> Result<MachImage, MachError> {
        let data = select_arm_slice(bytes)?;
        let header: raw::mach_header = read_struct(data, 0)?;
        if header.magic != raw::MH_MAGIC {
            return Err(MachError::NotMachO);
        }

        let mut segments = Vec::new();
        let mut section_relocs: Vec<(u32, u32)> = Vec::new();
        let mut dylibs = Vec::new();
        let mut symtab: Option<raw::symtab_command> = None;
        let mut dyld_info: Option<raw::dyld_info_command> = None;
        let mut entry = EntryCommand::None;

        let mut offset = std::mem::size_of::<raw::mach_header>();
        for _ in 0..header.ncmds {
            let cmd: raw::load_command = read_struct(data, offset)?;
            if cmd.cmdsize < std::mem::size_of::<raw::load_command>() as u32
                || offset + cmd.cmdsize as usize > data.len()
            {
                return Err(MachError::Truncated);
            }
            match cmd.cmd {
                raw::LC_SEGMENT => {
                    let seg: raw::segment_command = read_struct(data, offset)?;
                    segments.push(Segment {
                        name: fixed_name(&seg.segname),
                        vmaddr: u64::from(seg.vmaddr),
                        vmsize: u64::from(seg.vmsize),
                        fileoff: u64::from(seg.fileoff),
                        filesize: u64::from(seg.filesize),
                        initprot: seg.initprot,
                    });

                    let sections_offset = offset + std::mem::size_of::<raw::segment_command>();
                    for i in 0..seg.nsects as usize {
                        let section: raw::section = read_struct(
                            data,
                            sections_offset + i * std::mem::size_of::<raw::section>(),
                        )?;
                        if section.nreloc > 0 {
                            section_relocs.push((section.reloff, section.nreloc));
                        }
                    }
                }
                raw::LC_LOAD_DYLIB | raw::LC_LOAD_WEAK_DYLIB | raw::LC_REEXPORT_DYLIB => {
                    let dylib: raw::dylib_command = read_struct(data, offset)?;
                    let name = command_string(data, offset, &cmd, dylib.name_offset)?;
                    trace!("Referenced dylib: {}", name);
                    dylibs.push(DylibRef {
                        name,
                        reexport: cmd.cmd == raw::LC_REEXPORT_DYLIB,
                    });
                }
                raw::LC_SYMTAB => {
                    symtab = Some(read_struct(data, offset)?);
                }
                raw::LC_ID_DYLIB | raw::LC_DYSYMTAB => { /* ignore */ }
                raw::LC_DYLD_INFO | raw::LC_DYLD_INFO_ONLY => {
                    dyld_info = Some(read_struct(data, offset)?);
                }
                raw::LC_MAIN => {
                    let main: raw::entry_point_command = read_struct(data, offset)?;
                    entry = EntryCommand::Main(main.entryoff);
                }
                raw::LC_UNIXTHREAD => {
                    if let Some(pc) = parse_thread_pc(data, offset, &cmd) {
                        entry = EntryCommand::ThreadPc(pc);
                    }
                }
                other => {
                    trace!("Ignoring load command 0x{:x}", other);
                }
            }
            offset += cmd.cmdsize as usize;
        }

        let entry_point = match entry {
            EntryCommand::Main(entryoff) => {
                let text = segments
                    .iter()
                    .find(|s| s.name == "__TEXT")
                    .ok_or(MachError::MissingTextSegment)?;
                text.vmaddr + entryoff
            }
            EntryCommand::ThreadPc(pc) => pc,
            EntryCommand::None => 0,
        };

        let symbols = match symtab {
            Some(symtab) => parse_symtab(data, &symtab),
            None => HashMap::new(),
        };

        let low_vmaddr = segments.iter().map(|s| s.vmaddr).min().unwrap_or(0);

        let mut relocations = Vec::new();
        let mut bindings = Vec::new();
        if let Some(info) = dyld_info {
            collect_dyld_info(
                data,
                &info,
                &segments,
                low_vmaddr,
                &mut relocations,
                &mut bindings,
            );
        }
        for (reloff, nreloc) in section_relocs {
            collect_classic_relocs(data, reloff, nreloc, &mut relocations);
        }

        Ok(MachImage {
            cpu_type: header.cputype,
            file_type: header.filetype,
            flags: header.flags,
            segments,
            dylibs,
            entry_point,
            symbols,
            relocations,
            bindings,
            data: data.to_vec(),
        })
    }

    pub fn is_pie(&self) -> bool {
        self.flags & raw::MH_PIE != 0
    }

    pub fn has_split_segs(&self) -> bool {
        self.flags & raw::MH_SPLIT_SEGS != 0
    }

    /// Whether segments may be loaded at an address other than their
    /// preferred one: dylibs and bundles always can, executables only when
    /// built position-independent.
    pub fn can_slide(&self) -> bool {
        match self.file_type {
            raw::MH_DYLIB | raw::MH_BUNDLE => true,
            raw::MH_EXECUTE => self.is_pie(),
            _ => false,
        }
    }

    /// Un-slid value of a symbol defined in this image.
    pub fn symbol_value(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Name of the dylib a 1-based binding ordinal refers to.
    pub fn dylib_name(&self, ordinal: i32) -> Option<&str> {
        if ordinal < 1 {
            return None;
        }
        self.dylibs
            .get(ordinal as usize - 1)
            .map(|d| d.name.as_str())
    }

    /// Lowest segment address; relocation offsets are relative to this.
    pub fn low_vmaddr(&self) -> u64 {
        self.segments.iter().map(|s| s.vmaddr).min().unwrap_or(0)
    }

    /// File content of a segment, clamped to what the file actually holds.
    pub fn segment_bytes(&self, segment: &Segment) -> &[u8] {
        let start = (segment.fileoff as usize).min(self.data.len());
        let len = (segment.filesize.min(segment.vmsize) as usize).min(self.data.len() - start);
        &self.data[start..start + len]
    }
}

/// Read a `T` at `offset`, bounds-checked against `data`.
fn read_struct<T: Copy>(data: &[u8], offset: usize) -> Result<T, MachError> {
    let size = std::mem::size_of::<T>();
    if offset.checked_add(size).is_none_or(|end| end > data.len()) {
        return Err(MachError::Truncated);
    }
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

/// NUL-padded fixed-size name field.
fn fixed_name(bytes: &[u8; 16]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// NUL-terminated string embedded in a load command, bounded by its cmdsize.
fn command_string(
    data: &[u8],
    cmd_offset: usize,
    cmd: &raw::load_command,
    string_offset: u32,
) -> Result<String, MachError> {
    let start = cmd_offset + string_offset as usize;
    let limit = cmd_offset + cmd.cmdsize as usize;
    if start >= limit || limit > data.len() {
        return Err(MachError::Truncated);
    }
    let mut end = start;
    while end < limit && data[end] != 0 {
        end += 1;
    }
    Ok(String::from_utf8_lossy(&data[start..end]).to_string())
}

/// Pick the 32-bit ARM slice out of a universal binary, or pass a thin
/// image through.
fn select_arm_slice(bytes: &[u8]) -> Result<&[u8], MachError> {
    if bytes.len() < 4 {
        return Err(MachError::NotMachO);
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic == raw::MH_MAGIC {
        return Ok(bytes);
    }
    if magic != raw::FAT_MAGIC && magic != raw::FAT_CIGAM {
        return Err(MachError::NotMachO);
    }

    // Fat headers are big-endian on disk.
    let swap = magic == raw::FAT_CIGAM;
    let header: raw::fat_header = read_struct(bytes, 0)?;
    let nfat_arch = if swap {
        header.nfat_arch.swap_bytes()
    } else {
        header.nfat_arch
    };
    for i in 0..nfat_arch as usize {
        let arch: raw::fat_arch = read_struct(
            bytes,
            std::mem::size_of::<raw::fat_header>() + i * std::mem::size_of::<raw::fat_arch>(),
        )?;
        let (cputype, offset, size) = if swap {
            (
                arch.cputype.swap_bytes(),
                arch.offset.swap_bytes() as usize,
                arch.size.swap_bytes() as usize,
            )
        } else {
            (arch.cputype, arch.offset as usize, arch.size as usize)
        };
        if cputype == raw::CPU_TYPE_ARM {
            if offset.checked_add(size).is_none_or(|end| end > bytes.len()) {
                return Err(MachError::Truncated);
            }
            return Ok(&bytes[offset..offset + size]);
        }
    }
    Err(MachError::MissingArmSlice)
}

/// Program counter from an ARM LC_UNIXTHREAD command.
fn parse_thread_pc(data: &[u8], cmd_offset: usize, cmd: &raw::load_command) -> Option<u64> {
    let base = cmd_offset + std::mem::size_of::<raw::load_command>();
    let flavor: u32 = read_struct(data, base).ok()?;
    let count: u32 = read_struct(data, base + 4).ok()?;
    if flavor != raw::ARM_THREAD_STATE || count < 16 {
        warn!("Unsupported thread state flavor: {}", flavor);
        return None;
    }
    if (base + 8 + 16 * 4) > cmd_offset + cmd.cmdsize as usize {
        return None;
    }
    // Registers r0-r15 follow the flavor/count words; pc is r15.
    let pc: u32 = read_struct(data, base + 8 + 15 * 4).ok()?;
    Some(u64::from(pc))
}

/// Defined symbols from LC_SYMTAB: name to un-slid value.
fn parse_symtab(data: &[u8], symtab: &raw::symtab_command) -> HashMap<String, u64> {
    let mut symbols = HashMap::new();
    let strtab_start = symtab.stroff as usize;
    let strtab_end = (symtab.stroff as usize + symtab.strsize as usize).min(data.len());
    for i in 0..symtab.nsyms as usize {
        let Ok(entry) = read_struct::<raw::nlist>(
            data,
            symtab.symoff as usize + i * std::mem::size_of::<raw::nlist>(),
        ) else {
            warn!("Symbol table runs past the end of the file");
            break;
        };
        if entry.n_type & raw::N_STAB != 0 {
            continue;
        }
        let kind = entry.n_type & raw::N_TYPE;
        if kind != raw::N_SECT && kind != raw::N_ABS {
            continue;
        }
        let name_start = strtab_start + entry.n_strx as usize;
        if name_start >= strtab_end {
            continue;
        }
        let mut end = name_start;
        while end < strtab_end && data[end] != 0 {
            end += 1;
        }
        let name = String::from_utf8_lossy(&data[name_start..end]).to_string();
        if !name.is_empty() {
            symbols.insert(name, u64::from(entry.n_value));
        }
    }
    symbols
}

/// Decode LC_DYLD_INFO rebase and bind streams into site lists.
fn collect_dyld_info(
    data: &[u8],
    info: &raw::dyld_info_command,
    segments: &[Segment],
    low_vmaddr: u64,
    relocations: &mut Vec<Relocation>,
    bindings: &mut Vec<Binding>,
) {
    fn slice(data: &[u8], off: u32, size: u32) -> Option<&[u8]> {
        if off == 0 || size == 0 {
            return None;
        }
        data.get(off as usize..(off as usize).checked_add(size as usize)?)
    }

    if let Some(rebase_data) = slice(data, info.rebase_off, info.rebase_size) {
        match opcodes::parse_rebase_info(rebase_data) {
            Ok(sites) => {
                for site in sites {
                    let Some(segment) = segments.get(site.segment_index as usize) else {
                        warn!("Invalid segment index {} for rebase", site.segment_index);
                        continue;
                    };
                    relocations.push(Relocation {
                        offset: segment.vmaddr + site.segment_offset - low_vmaddr,
                        pc_relative: false,
                        size_bits: 32,
                        scattered: false,
                        origin: RelocOrigin::DyldInfo,
                    });
                }
            }
            Err(err) => warn!("Failed to parse rebase info: {}", err),
        }
    }

    let mut collect_binds = |off: u32, size: u32, class: BindClass| {
        let Some(bind_data) = slice(data, off, size) else {
            return;
        };
        let parsed = match class {
            BindClass::Lazy => opcodes::parse_lazy_bind_info(bind_data),
            _ => opcodes::parse_bind_info(bind_data, class),
        };
        match parsed {
            Ok(sites) => {
                for site in sites {
                    let Some(segment) = segments.get(site.segment_index as usize) else {
                        warn!(
                            "Invalid segment index {} for symbol {}",
                            site.segment_index, site.symbol_name
                        );
                        continue;
                    };
                    bindings.push(Binding {
                        class: site.class,
                        bind_type: site.bind_type,
                        addend: site.addend,
                        library_ordinal: site.library_ordinal,
                        symbol: site.symbol_name,
                        address: segment.vmaddr + site.segment_offset,
                    });
                }
            }
            Err(err) => warn!("Failed to parse bind info: {}", err),
        }
    };

    collect_binds(info.bind_off, info.bind_size, BindClass::Standard);
    collect_binds(info.weak_bind_off, info.weak_bind_size, BindClass::Weak);
    collect_binds(info.lazy_bind_off, info.lazy_bind_size, BindClass::Lazy);
}

/// Decode a classic section relocation table.
///
/// These only show up so the loader can recognize and report them; the
/// supported rebase path is the DYLD_INFO one.
fn collect_classic_relocs(data: &[u8], reloff: u32, nreloc: u32, relocations: &mut Vec<Relocation>) {
    for i in 0..nreloc as usize {
        let offset = reloff as usize + i * 8;
        let Ok(word0) = read_struct::<u32>(data, offset) else {
            warn!("Relocation table runs past the end of the file");
            return;
        };
        let Ok(word1) = read_struct::<u32>(data, offset + 4) else {
            warn!("Relocation table runs past the end of the file");
            return;
        };
        let relocation = if word0 & raw::R_SCATTERED != 0 {
            Relocation {
                offset: u64::from(word0 & 0x00ff_ffff),
                pc_relative: (word0 >> 30) & 1 != 0,
                size_bits: 8 << ((word0 >> 28) & 3),
                scattered: true,
                origin: RelocOrigin::RelocTable,
            }
        } else {
            Relocation {
                offset: u64::from(word0),
                pc_relative: (word1 >> 24) & 1 != 0,
                size_bits: 8 << ((word1 >> 25) & 3),
                scattered: false,
                origin: RelocOrigin::RelocTable,
            }
        };
        relocations.push(relocation);
    }
}
