//! Loader integration tests.
//!
//! These drive the loader against a scripted CPU engine and an in-memory
//! host loader, with real package directories holding synthesized 32-bit
//! Mach-O images and stub native libraries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CString, c_char};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use gangway::cpu::{Cpu, CpuHooks, CpuResult, HookKind, Prot, Reg};
use gangway::host::{DiagnosticSink, DirPackage, HostHandle, HostLoader};
use gangway::loader::DynamicLoader;
use gangway::loader::wrapper::{WRAPPER_INDEX_SYMBOL, WrapperIndex, WrapperIndexEntry};

// ---------------------------------------------------------------------------
// Scripted CPU engine

#[derive(Debug)]
enum Event {
    FetchProt(u64),
    Code(u64),
}

#[derive(Default)]
struct ScriptedCpu {
    regs: [u32; 16],
    mappings: Vec<(u64, u64, Prot)>,
    hooks: Vec<HookKind>,
    script: Vec<Event>,
    started_at: Option<u64>,
    stopped: bool,
}

impl Cpu for ScriptedCpu {
    fn map_ptr(&mut self, addr: u64, size: u64, prot: Prot, _host: *mut u8) -> CpuResult<()> {
        self.mappings.push((addr, size, prot));
        Ok(())
    }

    fn reg_read(&mut self, reg: Reg) -> CpuResult<u32> {
        Ok(self.regs[reg as usize])
    }

    fn reg_write(&mut self, reg: Reg, value: u32) -> CpuResult<()> {
        self.regs[reg as usize] = value;
        Ok(())
    }

    fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> CpuResult<()> {
        // The tests read loaded memory directly through the identity
        // mapping; the engine double only has to answer, not to fault.
        let _ = addr;
        buf.fill(0);
        Ok(())
    }

    fn hook_add(&mut self, kind: HookKind) -> CpuResult<()> {
        self.hooks.push(kind);
        Ok(())
    }

    fn start(&mut self, begin: u64, hooks: &mut dyn CpuHooks) -> CpuResult<()> {
        self.started_at = Some(begin);
        let script = std::mem::take(&mut self.script);
        for event in script {
            if self.stopped {
                break;
            }
            match event {
                Event::FetchProt(addr) => {
                    if self.hooks.contains(&HookKind::FetchProt)
                        && !hooks.on_fetch_prot(&mut *self, addr, 4)
                    {
                        break;
                    }
                }
                Event::Code(addr) => {
                    if self.hooks.contains(&HookKind::Code) {
                        hooks.on_code(&mut *self, addr, 4);
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> CpuResult<()> {
        self.stopped = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host doubles

#[derive(Default, Clone)]
struct MockModule {
    symbols: HashMap<String, u64>,
    bounds: Option<(u64, u64)>,
}

impl MockModule {
    fn new(bounds: (u64, u64)) -> MockModule {
        MockModule {
            symbols: HashMap::new(),
            bounds: Some(bounds),
        }
    }

    fn symbol(mut self, name: &str, addr: u64) -> MockModule {
        self.symbols.insert(name.to_string(), addr);
        self
    }
}

#[derive(Default)]
struct MockHost {
    modules: Vec<(PathBuf, MockModule)>,
    opened: Rc<RefCell<Vec<PathBuf>>>,
}

impl MockHost {
    fn module(mut self, path: PathBuf, module: MockModule) -> MockHost {
        self.modules.push((path, module));
        self
    }

    fn opened_log(&self) -> Rc<RefCell<Vec<PathBuf>>> {
        self.opened.clone()
    }
}

impl HostLoader for MockHost {
    fn open(&self, path: &Path) -> io::Result<HostHandle> {
        let index = self
            .modules
            .iter()
            .position(|(p, _)| p == path)
            .ok_or_else(|| io::Error::other(format!("no such module: {}", path.display())))?;
        self.opened.borrow_mut().push(path.to_path_buf());
        Ok(HostHandle(index as u64 + 1))
    }

    fn symbol(&self, handle: HostHandle, name: &str) -> Option<u64> {
        let (_, module) = self.modules.get(handle.0 as usize - 1)?;
        module.symbols.get(name).copied()
    }

    fn module_bounds(&self, handle: HostHandle) -> io::Result<(u64, u64)> {
        self.modules
            .get(handle.0 as usize - 1)
            .and_then(|(_, m)| m.bounds)
            .ok_or_else(|| io::Error::other("no module information"))
    }
}

struct CollectSink(Rc<RefCell<Vec<String>>>);

impl DiagnosticSink for CollectSink {
    fn report(&self, message: &str) {
        self.0.borrow_mut().push(message.to_string());
    }
}

// ---------------------------------------------------------------------------
// Mach-O image builder

const MH_MAGIC: u32 = 0xfeedface;
const CPU_TYPE_ARM: u32 = 12;
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const MH_PIE: u32 = 0x00200000;
const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_REEXPORT_DYLIB: u32 = 0x1f | 0x80000000;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | 0x80000000;
const LC_MAIN: u32 = 0x28 | 0x80000000;
const PROT_RW: u32 = 0x3;
const PROT_RX: u32 = 0x5;

struct SegSpec {
    name: &'static str,
    vmaddr: u32,
    vmsize: u32,
    prot: u32,
    content: Vec<u8>,
}

#[derive(Default)]
struct MachBuilder {
    filetype: u32,
    flags: u32,
    segments: Vec<SegSpec>,
    dylibs: Vec<(String, bool)>,
    symbols: Vec<(String, u32)>,
    rebase: Vec<u8>,
    bind: Vec<u8>,
    relocs: Vec<(u32, u32)>,
    entry: Option<u64>,
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_name16(out: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 16];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&bytes);
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

impl MachBuilder {
    fn dylib() -> MachBuilder {
        MachBuilder {
            filetype: MH_DYLIB,
            ..MachBuilder::default()
        }
    }

    fn executable() -> MachBuilder {
        MachBuilder {
            filetype: MH_EXECUTE,
            flags: MH_PIE,
            ..MachBuilder::default()
        }
    }

    fn segment(mut self, name: &'static str, vmaddr: u32, vmsize: u32, prot: u32, content: &[u8]) -> MachBuilder {
        self.segments.push(SegSpec {
            name,
            vmaddr,
            vmsize,
            prot,
            content: content.to_vec(),
        });
        self
    }

    fn load_dylib(mut self, name: &str) -> MachBuilder {
        self.dylibs.push((name.to_string(), false));
        self
    }

    fn reexport_dylib(mut self, name: &str) -> MachBuilder {
        self.dylibs.push((name.to_string(), true));
        self
    }

    fn symbol(mut self, name: &str, value: u32) -> MachBuilder {
        self.symbols.push((name.to_string(), value));
        self
    }

    fn rebase_opcodes(mut self, opcodes: &[u8]) -> MachBuilder {
        self.rebase = opcodes.to_vec();
        self
    }

    fn bind_opcodes(mut self, opcodes: &[u8]) -> MachBuilder {
        self.bind = opcodes.to_vec();
        self
    }

    fn classic_reloc(mut self, word0: u32, word1: u32) -> MachBuilder {
        self.relocs.push((word0, word1));
        self
    }

    fn entry(mut self, entryoff: u64) -> MachBuilder {
        self.entry = Some(entryoff);
        self
    }

    fn build(self) -> Vec<u8> {
        let has_relocs = !self.relocs.is_empty();
        let has_symtab = !self.symbols.is_empty();
        let has_dyld = !self.rebase.is_empty() || !self.bind.is_empty();

        let mut ncmds = self.segments.len() + self.dylibs.len();
        let seg_cmd_size =
            |i: usize| -> usize { 56 + if i == 0 && has_relocs { 68 } else { 0 } };
        let mut sizeofcmds: usize = (0..self.segments.len()).map(seg_cmd_size).sum();
        for (name, _) in &self.dylibs {
            sizeofcmds += 24 + pad4(name.len() + 1);
        }
        if has_symtab {
            ncmds += 1;
            sizeofcmds += 24;
        }
        if has_dyld {
            ncmds += 1;
            sizeofcmds += 48;
        }
        if self.entry.is_some() {
            ncmds += 1;
            sizeofcmds += 24;
        }

        // Payload layout past the load commands.
        let mut payload_off = 28 + sizeofcmds;
        let seg_file_offsets: Vec<usize> = self
            .segments
            .iter()
            .map(|seg| {
                let off = payload_off;
                payload_off += seg.content.len();
                off
            })
            .collect();
        let mut strtab = vec![0u8];
        let name_indices: Vec<u32> = self
            .symbols
            .iter()
            .map(|(name, _)| {
                let index = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                index
            })
            .collect();
        let nlist_off = payload_off;
        payload_off += 12 * self.symbols.len();
        let str_off = payload_off;
        payload_off += strtab.len();
        let rebase_off = payload_off;
        payload_off += self.rebase.len();
        let bind_off = payload_off;
        payload_off += self.bind.len();
        let reloc_off = payload_off;
        payload_off += 8 * self.relocs.len();

        let mut out = Vec::with_capacity(payload_off);
        push_u32(&mut out, MH_MAGIC);
        push_u32(&mut out, CPU_TYPE_ARM);
        push_u32(&mut out, 0);
        push_u32(&mut out, self.filetype);
        push_u32(&mut out, ncmds as u32);
        push_u32(&mut out, sizeofcmds as u32);
        push_u32(&mut out, self.flags);

        for (i, seg) in self.segments.iter().enumerate() {
            push_u32(&mut out, LC_SEGMENT);
            push_u32(&mut out, seg_cmd_size(i) as u32);
            push_name16(&mut out, seg.name);
            push_u32(&mut out, seg.vmaddr);
            push_u32(&mut out, seg.vmsize);
            push_u32(&mut out, seg_file_offsets[i] as u32);
            push_u32(&mut out, seg.content.len() as u32);
            push_u32(&mut out, seg.prot);
            push_u32(&mut out, seg.prot);
            push_u32(&mut out, (i == 0 && has_relocs) as u32);
            push_u32(&mut out, 0);
            if i == 0 && has_relocs {
                push_name16(&mut out, "__content");
                push_name16(&mut out, seg.name);
                push_u32(&mut out, seg.vmaddr);
                push_u32(&mut out, seg.vmsize);
                push_u32(&mut out, seg_file_offsets[i] as u32);
                push_u32(&mut out, 2);
                push_u32(&mut out, reloc_off as u32);
                push_u32(&mut out, self.relocs.len() as u32);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
            }
        }

        for (name, reexport) in &self.dylibs {
            let cmdsize = 24 + pad4(name.len() + 1);
            push_u32(
                &mut out,
                if *reexport {
                    LC_REEXPORT_DYLIB
                } else {
                    LC_LOAD_DYLIB
                },
            );
            push_u32(&mut out, cmdsize as u32);
            push_u32(&mut out, 24);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            for _ in 0..(pad4(name.len() + 1) - name.len() - 1) {
                out.push(0);
            }
        }

        if has_symtab {
            push_u32(&mut out, LC_SYMTAB);
            push_u32(&mut out, 24);
            push_u32(&mut out, nlist_off as u32);
            push_u32(&mut out, self.symbols.len() as u32);
            push_u32(&mut out, str_off as u32);
            push_u32(&mut out, strtab.len() as u32);
        }

        if has_dyld {
            push_u32(&mut out, LC_DYLD_INFO_ONLY);
            push_u32(&mut out, 48);
            push_u32(&mut out, if self.rebase.is_empty() { 0 } else { rebase_off as u32 });
            push_u32(&mut out, self.rebase.len() as u32);
            push_u32(&mut out, if self.bind.is_empty() { 0 } else { bind_off as u32 });
            push_u32(&mut out, self.bind.len() as u32);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
            push_u32(&mut out, 0);
        }

        if let Some(entryoff) = self.entry {
            push_u32(&mut out, LC_MAIN);
            push_u32(&mut out, 24);
            push_u64(&mut out, entryoff);
            push_u64(&mut out, 0);
        }

        assert_eq!(out.len(), 28 + sizeofcmds);

        for seg in &self.segments {
            out.extend_from_slice(&seg.content);
        }
        for (i, (_, value)) in self.symbols.iter().enumerate() {
            push_u32(&mut out, name_indices[i]);
            out.push(0x0f); // N_SECT | N_EXT
            out.push(1);
            out.extend_from_slice(&0i16.to_le_bytes());
            push_u32(&mut out, *value);
        }
        out.extend_from_slice(&strtab);
        out.extend_from_slice(&self.rebase);
        out.extend_from_slice(&self.bind);
        for (word0, word1) in &self.relocs {
            push_u32(&mut out, *word0);
            push_u32(&mut out, *word1);
        }
        assert_eq!(out.len(), payload_off);
        out
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    cpu: ScriptedCpu,
    loader: DynamicLoader,
    errors: Rc<RefCell<Vec<String>>>,
    root: PathBuf,
}

fn test_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gangway-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("gen")).unwrap();
    dir
}

fn write_file(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(tag: &str, host: MockHost) -> Harness {
    init_tracing();
    let root = test_root(tag);
    let mut cpu = ScriptedCpu::default();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let loader = DynamicLoader::new(
        &mut cpu,
        Box::new(host),
        Box::new(DirPackage::new(root.clone())),
        Box::new(CollectSink(errors.clone())),
    )
    .unwrap();
    Harness {
        cpu,
        loader,
        errors,
        root,
    }
}

impl Harness {
    fn error_count(&self, needle: &str) -> usize {
        self.errors
            .borrow()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

const MZ_STUB: &[u8] = b"MZ\x90\x00stub";

// ---------------------------------------------------------------------------
// Tests

#[test]
fn duplicate_loads_return_the_same_record() {
    let root = test_root("dup");
    let host = MockHost::default().module(
        root.join("liba.dll"),
        MockModule::new((0x7000_0000, 0x1000)),
    );
    let opened = host.opened_log();
    let mut h = harness("dup", host);
    write_file(&h.root, "liba.dll", MZ_STUB);

    let first = h.loader.load(&mut h.cpu, "liba.dll").unwrap();
    let second = h.loader.load(&mut h.cpu, "liba.dll").unwrap();
    assert_eq!(first, second);
    assert_eq!(opened.borrow().len(), 1, "the file is opened once");
    assert_eq!(h.error_count(""), 0);

    let image = h.loader.image(&first).unwrap();
    assert_eq!(image.start, 0x7000_0000);
    assert_eq!(image.size, 0x1000);
}

#[test]
fn lookup_covers_exactly_the_image_ranges() {
    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[0xfe, 0xed])
        .segment("__DATA", 0x2000, 0x1000, PROT_RW, &[1, 2, 3, 4])
        .build();
    let mut h = harness("lookup", MockHost::default());
    write_file(&h.root, "libx", &image);

    let key = h.loader.load(&mut h.cpu, "libx").unwrap();
    let (start, size) = {
        let image = h.loader.image(&key).unwrap();
        (image.start, image.size)
    };
    // The span covers the gap page between the segments.
    assert_eq!(size, 0x3000);

    assert_eq!(h.loader.lookup(start).unwrap().path, key);
    assert_eq!(h.loader.lookup(start + size - 1).unwrap().path, key);
    assert!(h.loader.lookup(start + size).is_none());
    assert!(h.loader.lookup(start.wrapping_sub(1)).is_none());
    assert!(h.loader.lookup(h.loader.kernel_addr()).is_none());
    assert!(h.loader.inspect(start).is_some());
}

#[test]
fn rebasing_slides_nonzero_words_only() {
    let mut data = Vec::new();
    push_u32(&mut data, 0x0000_0000);
    push_u32(&mut data, 0x0000_1000);
    push_u32(&mut data, 0x0000_2000);
    // SET_TYPE_IMM(pointer), SET_SEGMENT_AND_OFFSET_ULEB(1, 0),
    // DO_REBASE_IMM_TIMES(3), DONE
    let rebase = [0x11, 0x21, 0x00, 0x53, 0x00];
    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .segment("__DATA", 0x1000, 0x1000, PROT_RW, &data)
        .rebase_opcodes(&rebase)
        .build();
    let mut h = harness("rebase", MockHost::default());
    write_file(&h.root, "libr", &image);

    let key = h.loader.load(&mut h.cpu, "libr").unwrap();
    let start = h.loader.image(&key).unwrap().start;
    let slide = start as u32;
    assert_ne!(slide, 0);

    let words: [u32; 3] = unsafe { std::ptr::read((start + 0x1000) as *const [u32; 3]) };
    assert_eq!(words[0], 0, "NULL pointers must not slide");
    assert_eq!(words[1], 0x1000u32.wrapping_add(slide));
    assert_eq!(words[2], 0x2000u32.wrapping_add(slide));
    assert_eq!(h.error_count("unsupported relocation"), 0);
}

#[test]
fn scattered_relocation_is_reported_once_and_others_apply() {
    let mut data = Vec::new();
    push_u32(&mut data, 0x0000_1000);
    push_u32(&mut data, 0x0000_2000);
    push_u32(&mut data, 0x0000_0000);
    let rebase = [0x11, 0x21, 0x00, 0x52, 0x00];
    // Scattered entry (r_scattered | r_length=2) pointing at the zero word.
    let scattered_word0 = 0x8000_0000 | (2 << 28) | 0x1008;
    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .segment("__DATA", 0x1000, 0x1000, PROT_RW, &data)
        .rebase_opcodes(&rebase)
        .classic_reloc(scattered_word0, 0)
        .build();
    let mut h = harness("scattered", MockHost::default());
    write_file(&h.root, "libs", &image);

    let key = h.loader.load(&mut h.cpu, "libs").unwrap();
    let start = h.loader.image(&key).unwrap().start;
    let slide = start as u32;

    assert_eq!(h.error_count("unsupported relocation"), 1);
    let words: [u32; 3] = unsafe { std::ptr::read((start + 0x1000) as *const [u32; 3]) };
    assert_eq!(words[0], 0x1000u32.wrapping_add(slide));
    assert_eq!(words[1], 0x2000u32.wrapping_add(slide));
    assert_eq!(words[2], 0);
}

#[test]
fn bindings_write_resolved_addresses_and_skip_failures() {
    // Two bind sites in __DATA: `_bar` resolves, `_missing` does not.
    let mut bind = vec![0x11]; // SET_DYLIB_ORDINAL_IMM(1)
    bind.push(0x40);
    bind.extend_from_slice(b"_bar\0");
    bind.extend_from_slice(&[0x51, 0x71, 0x00, 0x90]); // TYPE, SEG(1)+0, DO_BIND
    bind.push(0x40);
    bind.extend_from_slice(b"_missing\0");
    bind.extend_from_slice(&[0x71, 0x08, 0x90, 0x00]); // SEG(1)+8, DO_BIND, DONE

    let mut data = Vec::new();
    push_u32(&mut data, 0);
    push_u32(&mut data, 0x5555_5555);
    push_u32(&mut data, 0x1111_1111);

    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .segment("__DATA", 0x1000, 0x1000, PROT_RW, &data)
        .load_dylib("libb.dll")
        .bind_opcodes(&bind)
        .build();

    let root = test_root("bind");
    let host = MockHost::default().module(
        root.join("libb.dll"),
        MockModule::new((0x6000_0000, 0x1000)).symbol("_bar", 0x6000_0420),
    );
    let mut h = harness("bind", host);
    write_file(&h.root, "libb.dll", MZ_STUB);
    write_file(&h.root, "libbind", &image);

    let key = h.loader.load(&mut h.cpu, "libbind").unwrap();
    let start = h.loader.image(&key).unwrap().start;

    let bound: u32 = unsafe { std::ptr::read((start + 0x1000) as *const u32) };
    assert_eq!(bound, 0x6000_0420);
    let untouched: u32 = unsafe { std::ptr::read((start + 0x1008) as *const u32) };
    assert_eq!(untouched, 0x1111_1111, "failed binds leave the site unwritten");
    assert_eq!(h.error_count("external symbol couldn't be resolved"), 1);
}

#[test]
fn reexported_symbols_drop_the_underscore_for_native_targets() {
    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .reexport_dylib("libb.dll")
        .build();

    let root = test_root("reexport");
    let host = MockHost::default().module(
        root.join("libb.dll"),
        MockModule::new((0x6100_0000, 0x1000)).symbol("foo", 0x6100_0123),
    );
    let mut h = harness("reexport", host);
    write_file(&h.root, "libb.dll", MZ_STUB);
    write_file(&h.root, "liba", &image);

    let key = h.loader.load(&mut h.cpu, "liba").unwrap();
    assert_eq!(h.loader.find_symbol(&mut h.cpu, &key, "_foo"), 0x6100_0123);
    assert_eq!(h.loader.find_symbol(&mut h.cpu, &key, "_nope"), 0);
}

#[test]
fn local_symbols_win_over_reexports() {
    let image = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .symbol("_local", 0x200)
        .reexport_dylib("libb.dll")
        .build();
    let mut h = harness("localsym", MockHost::default());
    write_file(&h.root, "liblocal", &image);

    let key = h.loader.load(&mut h.cpu, "liblocal").unwrap();
    let start = h.loader.image(&key).unwrap().start;
    assert_eq!(
        h.loader.find_symbol(&mut h.cpu, &key, "_local"),
        start + 0x200
    );
}

#[test]
fn dependency_order_does_not_change_the_registry() {
    let leaf = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .build();
    let rootimg = MachBuilder::dylib()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[])
        .load_dylib("libleaf")
        .build();

    let loaded_keys = |h: &Harness| -> Vec<&'static str> {
        ["libleaf", "libroot"]
            .into_iter()
            .filter(|key| h.loader.image(key).is_some())
            .collect()
    };

    let keys_root_first = {
        let mut h = harness("order-a", MockHost::default());
        write_file(&h.root, "libleaf", &leaf);
        write_file(&h.root, "libroot", &rootimg);
        h.loader.load(&mut h.cpu, "libroot").unwrap();
        loaded_keys(&h)
    };
    let keys_leaf_first = {
        let mut h = harness("order-b", MockHost::default());
        write_file(&h.root, "libleaf", &leaf);
        write_file(&h.root, "libroot", &rootimg);
        h.loader.load(&mut h.cpu, "libleaf").unwrap();
        h.loader.load(&mut h.cpu, "libroot").unwrap();
        loaded_keys(&h)
    };
    assert_eq!(keys_root_first, vec!["libleaf", "libroot"]);
    assert_eq!(keys_root_first, keys_leaf_first);
}

#[test]
fn missing_and_malformed_files_are_reported() {
    let mut h = harness("badfiles", MockHost::default());
    write_file(&h.root, "garbage.bin", b"\x7fELF not supported here");

    assert!(h.loader.load(&mut h.cpu, "nothere").is_none());
    assert_eq!(h.error_count("invalid file: nothere"), 1);

    assert!(h.loader.load(&mut h.cpu, "garbage.bin").is_none());
    assert_eq!(h.error_count("invalid binary type"), 1);
}

#[test]
fn failed_native_load_removes_the_stub() {
    // Package contains the file, but the host loader refuses it.
    let mut h = harness("nativefail", MockHost::default());
    write_file(&h.root, "libfail.dll", MZ_STUB);

    assert!(h.loader.load(&mut h.cpu, "libfail.dll").is_none());
    assert_eq!(h.error_count("couldn't load DLL"), 1);
    assert!(h.loader.image("libfail.dll").is_none());

    // A later retry goes through the host again instead of hitting a stub.
    assert!(h.loader.load(&mut h.cpu, "libfail.dll").is_none());
    assert_eq!(h.error_count("couldn't load DLL"), 2);
}

static DYLD_INIT_CALLS: AtomicU32 = AtomicU32::new(0);
static OBJC_INIT_CALLS: AtomicU32 = AtomicU32::new(0);

extern "C" fn fake_dyld_initialize(_header: u32) {
    DYLD_INIT_CALLS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn fake_objc_init() {
    OBJC_INIT_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn kernel_return_stops_emulation_cleanly() {
    let exe = MachBuilder::executable()
        .segment("__TEXT", 0, 0x1000, PROT_RX, &[0x00, 0xbf])
        .entry(0x100)
        .build();

    let root = test_root("kernel");
    let host = MockHost::default()
        .module(
            root.join("libdyld.dll"),
            MockModule::new((0x6200_0000, 0x1000))
                .symbol("_dyld_initialize", fake_dyld_initialize as u64),
        )
        .module(
            root.join("libobjc.dll"),
            MockModule::new((0x6300_0000, 0x1000)).symbol("_objc_init", fake_objc_init as u64),
        );
    let mut h = harness("kernel", host);
    write_file(&h.root, "libdyld.dll", MZ_STUB);
    write_file(&h.root, "libobjc.dll", MZ_STUB);
    write_file(&h.root, "ToDo", &exe);

    let key = h.loader.load(&mut h.cpu, "ToDo").unwrap();
    let start = h.loader.image(&key).unwrap().start;
    let kernel = h.loader.kernel_addr();

    // One traced instruction at the entry point, then the return to kernel.
    h.cpu.script = vec![Event::Code(start + 0x100), Event::FetchProt(kernel)];
    h.loader.execute(&mut h.cpu, &key);

    assert!(h.cpu.stopped, "kernel return must stop the engine");
    assert_eq!(h.cpu.started_at, Some(start + 0x100));
    // The entry point lies inside an executable mapping.
    let begin = h.cpu.started_at.unwrap();
    assert!(
        h.cpu
            .mappings
            .iter()
            .any(|(base, size, prot)| begin >= *base
                && begin < base + size
                && prot.contains(Prot::EXEC))
    );
    assert_eq!(h.cpu.regs[Reg::Lr as usize], kernel as u32);
    assert!(DYLD_INIT_CALLS.load(Ordering::SeqCst) >= 1);
    assert!(OBJC_INIT_CALLS.load(Ordering::SeqCst) >= 1);
    for kind in [HookKind::FetchProt, HookKind::Code, HookKind::MemWrite] {
        assert!(h.cpu.hooks.contains(&kind));
    }
    // SP sits 12 bytes under the top of the 8 MiB stack mapping.
    let (stack_base, stack_size, _) = *h
        .cpu
        .mappings
        .iter()
        .find(|(_, size, _)| *size == 8 * 1024 * 1024)
        .expect("guest stack mapping");
    assert_eq!(
        h.cpu.regs[Reg::Sp as usize] as u64,
        stack_base + stack_size - 12
    );
    assert_eq!(h.error_count(""), 0);
}

#[test]
fn executing_a_native_image_is_refused() {
    let root = test_root("execnative");
    let host = MockHost::default().module(
        root.join("liba.dll"),
        MockModule::new((0x7100_0000, 0x1000)),
    );
    let mut h = harness("execnative", host);
    write_file(&h.root, "liba.dll", MZ_STUB);

    let key = h.loader.load(&mut h.cpu, "liba.dll").unwrap();
    h.loader.execute(&mut h.cpu, &key);
    assert_eq!(h.error_count("we can only execute dylib images"), 1);
    assert!(h.cpu.started_at.is_none());
}

static TRAMPOLINE_ARG: AtomicU32 = AtomicU32::new(0);

extern "C" fn fake_trampoline(arg: u32) {
    TRAMPOLINE_ARG.store(arg, Ordering::SeqCst);
}

#[test]
fn boundary_trap_routes_native_calls_through_the_wrapper() {
    const NATIVE_BASE: u64 = 0x7200_0000;

    // Wrapper index: rva 0x2345 is served by gen/liba_wrapper.dll.
    let dylib_path = CString::new("gen/liba_wrapper.dll").unwrap();
    let dylibs: &'static [*const c_char] =
        Box::leak(vec![dylib_path.as_ptr()].into_boxed_slice());
    std::mem::forget(dylib_path);
    let entries: &'static [WrapperIndexEntry] = Box::leak(
        vec![WrapperIndexEntry {
            rva: 0x2345,
            dylib: 0,
        }]
        .into_boxed_slice(),
    );
    let index: &'static WrapperIndex = Box::leak(Box::new(WrapperIndex {
        entry_count: 1,
        entries: entries.as_ptr(),
        dylib_count: 1,
        dylibs: dylibs.as_ptr(),
    }));

    let trampoline_addr = fake_trampoline as u64;
    let trampoline_page = trampoline_addr & !0xfff;

    let root = test_root("wrapper");
    let host = MockHost::default()
        .module(
            root.join("liba.dll"),
            MockModule::new((NATIVE_BASE, 0x4000)),
        )
        .module(
            root.join("gen").join("liba.wrapper.dll"),
            MockModule::new((0x7300_0000, 0x1000))
                .symbol(WRAPPER_INDEX_SYMBOL, index as *const WrapperIndex as u64),
        )
        .module(
            root.join("gen").join("liba_wrapper.dll"),
            MockModule::new((trampoline_page, 0x2000))
                .symbol("$__ipaSim_wraps_9029", trampoline_addr),
        );
    let mut h = harness("wrapper", host);
    write_file(&h.root, "liba.dll", MZ_STUB);
    write_file(&h.root, "gen/liba.wrapper.dll", MZ_STUB);
    write_file(&h.root, "gen/liba_wrapper.dll", MZ_STUB);

    h.loader.load(&mut h.cpu, "liba.dll").unwrap();
    h.cpu.regs[Reg::R0 as usize] = 0xcafe;
    h.cpu.regs[Reg::Lr as usize] = 0x1234;

    // Guest jumped to a bound import inside liba.dll at rva 0x2345 - 0x1000.
    let fault = NATIVE_BASE + 0x2345 - 0x1000;
    assert!(h.loader.handle_fetch_prot(&mut h.cpu, fault));

    assert_eq!(TRAMPOLINE_ARG.load(Ordering::SeqCst), 0xcafe);
    assert_eq!(h.cpu.regs[Reg::Pc as usize], 0x1234, "PC must equal LR");
    assert_eq!(h.error_count(""), 0);
}

#[test]
fn faults_inside_wrapper_images_resume_in_place() {
    let root = test_root("wrapjump");
    let host = MockHost::default().module(
        root.join("gen").join("libw.wrapper.dll"),
        MockModule::new((0x7400_0000, 0x1000)),
    );
    let mut h = harness("wrapjump", host);
    write_file(&h.root, "gen/libw.wrapper.dll", MZ_STUB);

    h.loader.load(&mut h.cpu, "gen/libw.wrapper.dll").unwrap();
    assert!(h.loader.handle_fetch_prot(&mut h.cpu, 0x7400_0200));
    assert_eq!(h.cpu.regs[Reg::Pc as usize], 0x7400_0200);
}

#[test]
fn unmapped_fetch_is_an_error_unless_kernel() {
    let mut h = harness("unmapped", MockHost::default());
    assert!(!h.loader.handle_fetch_prot(&mut h.cpu, 0xdead_0000));
    assert_eq!(h.error_count("unmapped address fetched"), 1);
    assert!(!h.cpu.stopped);
}

#[test]
fn code_hook_routes_native_addresses_to_the_boundary_handler() {
    let root = test_root("codehook");
    let host = MockHost::default().module(
        root.join("liba.dll"),
        MockModule::new((0x7500_0000, 0x1000)),
    );
    let mut h = harness("codehook", host);
    write_file(&h.root, "liba.dll", MZ_STUB);

    h.loader.load(&mut h.cpu, "liba.dll").unwrap();
    // No wrapper library exists, so routing through the boundary handler
    // surfaces as the wrapper-load failure.
    h.loader.handle_code(&mut h.cpu, 0x7500_0100, 4);
    assert_eq!(h.error_count("invalid file"), 1);
}
