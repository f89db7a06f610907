//! Mach-O on-disk structures and constants (32-bit variant).
//!
//! Guest binaries are 32-bit ARM, so everything here is the 32-bit layout:
//! `mach_header` without the trailing `reserved` word, `LC_SEGMENT` instead
//! of `LC_SEGMENT_64`, 12-byte `nlist` entries.

#![allow(non_camel_case_types)]

// Magic numbers
pub const MH_MAGIC: u32 = 0xfeedface; // 32-bit Mach-O
pub const FAT_MAGIC: u32 = 0xcafebabe; // Fat binary (big-endian)
pub const FAT_CIGAM: u32 = 0xbebafeca; // Fat binary (little-endian)

// CPU types
pub const CPU_TYPE_ARM: u32 = 12;

// File types
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

// Header flags
pub const MH_SPLIT_SEGS: u32 = 0x00000020;
pub const MH_PIE: u32 = 0x00200000;

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_UNIXTHREAD: u32 = 0x5;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;

// VM protection bits of segment commands
pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;

// Symbol table entry type bits
pub const N_STAB: u8 = 0xe0;
pub const N_TYPE: u8 = 0x0e;
pub const N_ABS: u8 = 0x2;
pub const N_SECT: u8 = 0xe;

// Relocation entries
pub const R_SCATTERED: u32 = 0x80000000;

// Bind record types
pub const BIND_TYPE_POINTER: u8 = 1;

// ARM thread state flavor used by LC_UNIXTHREAD
pub const ARM_THREAD_STATE: u32 = 1;
pub const ARM_THREAD_STATE_COUNT: u32 = 17;

/// Mach-O 32-bit header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct mach_header {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

/// Fat (universal) binary header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct fat_header {
    pub magic: u32,
    pub nfat_arch: u32,
}

/// Fat binary architecture entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct fat_arch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// Generic load command header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct load_command {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// 32-bit segment load command
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct segment_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

/// 32-bit section within a segment
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

/// Dynamic library command (LC_LOAD_DYLIB, LC_REEXPORT_DYLIB, ...)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct dylib_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Symbol table command (LC_SYMTAB)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct symtab_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// 32-bit symbol table entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: i16,
    pub n_value: u32,
}

/// Dynamic linker info command (LC_DYLD_INFO, LC_DYLD_INFO_ONLY)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct dyld_info_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// Entry point command (LC_MAIN)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct entry_point_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub entryoff: u64,
    pub stacksize: u64,
}
