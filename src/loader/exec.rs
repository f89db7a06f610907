//! Execution control and the guest/native boundary.
//!
//! The controller drives one emulator on one host thread. Hooks run
//! synchronously on that thread with emulation paused, so a hook is free to
//! load more images, call native code, and poke guest registers before
//! resuming. Termination is cooperative: the top-level entry call returns to
//! the kernel sentinel page, whose fetch faults into
//! [`DynamicLoader::handle_fetch_prot`] and stops the engine.

use tracing::trace;

use crate::cpu::{Cpu, CpuHooks, HookKind, Prot, Reg, check};
use crate::mem::HostAlloc;

use super::{DynamicLoader, wrapper};

/// Guest stack size.
const STACK_SIZE: usize = 8 * 1024 * 1024;

/// Bytes kept free above the initial stack pointer so the instruction trace
/// can read three words there without faulting.
const STACK_RESERVED: u64 = 12;

/// Header export of the main executable, passed to the dynamic-linker shim.
const EXECUTE_HEADER_SYMBOL: &str = "__mh_execute_header";

const DYLD_SHIM_LIBRARY: &str = "libdyld.dll";
const DYLD_INITIALIZE: &str = "_dyld_initialize";
const OBJC_SHIM_LIBRARY: &str = "libobjc.dll";
const OBJC_INIT: &str = "_objc_init";

impl DynamicLoader {
    /// Run a loaded executable image under the emulator.
    ///
    /// Sets up the guest stack and hooks, bootstraps the guest runtime by
    /// calling the dynamic-linker and Objective-C initialization entry
    /// points natively, then starts emulation at the image's entry point
    /// with the link register parked on the kernel page.
    pub fn execute(&mut self, cpu: &mut dyn Cpu, path: &str) {
        let (entry, start) = match self.images.get(path) {
            Some(image) => match image.macho() {
                Some(macho) => (macho.entry_point, image.start),
                None => {
                    self.error("we can only execute dylib images");
                    return;
                }
            },
            None => {
                self.error(&format!("invalid file: {path}"));
                return;
            }
        };

        // Initialize the stack.
        let stack = match HostAlloc::new(STACK_SIZE) {
            Ok(stack) => stack,
            Err(err) => {
                self.error(&format!("couldn't allocate guest stack: {err}"));
                return;
            }
        };
        check(cpu.map_ptr(
            stack.addr(),
            STACK_SIZE as u64,
            Prot::READ | Prot::WRITE,
            stack.as_mut_ptr(),
        ));
        let stack_top = (stack.addr() + STACK_SIZE as u64 - STACK_RESERVED) as u32;
        check(cpu.reg_write(Reg::Sp, stack_top));
        self.stack = Some(stack);

        // Fetch-protection faults carry calls across the guest/native
        // boundary; code and write hooks only trace.
        check(cpu.hook_add(HookKind::FetchProt));
        check(cpu.hook_add(HookKind::Code));
        check(cpu.hook_add(HookKind::MemWrite));

        // Simulate early dynamic-linker initialization: the shims expect to
        // be called natively, before any guest code runs.
        let header = self.find_symbol(cpu, path, EXECUTE_HEADER_SYMBOL);
        self.call_native(cpu, DYLD_SHIM_LIBRARY, DYLD_INITIALIZE, Some(header as u32));
        self.call_native(cpu, OBJC_SHIM_LIBRARY, OBJC_INIT, None);

        // Point the return address at the kernel page; returning there is
        // the only sanctioned way out of emulation.
        check(cpu.reg_write(Reg::Lr, self.kernel_addr() as u32));

        check(cpu.start(entry.wrapping_add(start), self));
    }

    /// Resolve and call a native entry point on the current thread,
    /// bypassing the emulator.
    fn call_native(&mut self, cpu: &mut dyn Cpu, library: &str, symbol: &str, arg: Option<u32>) {
        let Some(key) = self.load(cpu, library) else {
            return;
        };
        let addr = self.find_symbol(cpu, &key, symbol);
        if addr == 0 {
            self.error(&format!("couldn't resolve {symbol} in {library}"));
            return;
        }
        unsafe {
            match arg {
                Some(value) => {
                    let func: unsafe extern "C" fn(u32) = std::mem::transmute(addr as usize);
                    func(value);
                }
                None => {
                    let func: unsafe extern "C" fn() = std::mem::transmute(addr as usize);
                    func();
                }
            }
        }
    }

    /// Handle a fetch-protection fault at `addr`.
    ///
    /// Three outcomes: the kernel sentinel stops emulation; a fault inside a
    /// wrapper library resumes there (it is guest code territory); any other
    /// target is a guest call into native code, which gets routed through
    /// the generated wrapper trampoline and returned by hand.
    pub fn handle_fetch_prot(&mut self, cpu: &mut dyn Cpu, addr: u64) -> bool {
        let (path, start, is_wrapper) = match self.lookup(addr) {
            Some(info) => (info.path.to_string(), info.image.start, info.image.is_wrapper),
            None => {
                // Handle return to kernel.
                if addr == self.kernel_addr() {
                    check(cpu.stop());
                    return true;
                }
                self.error("unmapped address fetched");
                return false;
            }
        };

        if is_wrapper {
            trace!(
                "fetch prot. mem. in {} at 0x{:x}",
                path,
                addr - start
            );
            check(cpu.reg_write(Reg::Pc, addr as u32));
            return true;
        }

        // The target is not a wrapper: find and call the corresponding
        // wrapper instead.
        let wrapper_library = wrapper::wrapper_path(&path);
        let Some(wrapper_key) = self.load(cpu, &wrapper_library) else {
            return false;
        };
        let index_addr = self.find_symbol(cpu, &wrapper_key, wrapper::WRAPPER_INDEX_SYMBOL);
        if index_addr == 0 {
            self.error(&format!("wrapper index missing in {wrapper_library}"));
            return false;
        }

        let rva = addr - start + wrapper::WRAPPER_RVA_BASE;
        let dylib = unsafe { (*(index_addr as *const wrapper::WrapperIndex)).dylib_for_rva(rva) };
        let Some(dylib) = dylib else {
            self.error("cannot find RVA in WrapperIndex");
            return false;
        };
        let Some(dylib_key) = self.load(cpu, &dylib) else {
            return false;
        };

        let trampoline = self.find_symbol(cpu, &dylib_key, &wrapper::trampoline_symbol(rva));
        if trampoline == 0 {
            self.error(&format!("cannot find wrapper for 0x{rva:x} in {path}"));
            return false;
        }
        debug_assert!(
            self.lookup(trampoline).is_some(),
            "symbol found in library wasn't found there in reverse lookup"
        );

        trace!(
            "fetch prot. mem. in {} at 0x{:x} (not a wrapper)",
            path,
            addr - start
        );

        // R0 points at the block holding the call's arguments and return
        // slot; the wrapper runs host-ABI code, so call it natively.
        let r0 = check(cpu.reg_read(Reg::R0));
        unsafe {
            let func: unsafe extern "C" fn(u32) = std::mem::transmute(trampoline as usize);
            func(r0);
        }

        // Reconstitute the guest return: move LR to PC.
        let lr = check(cpu.reg_read(Reg::Lr));
        check(cpu.reg_write(Reg::Pc, lr));
        true
    }

    /// Per-instruction trace, plus a workaround for engine builds that miss
    /// fetch-protection faults on some paths: when the PC sits in a native
    /// image, the boundary handler is invoked by hand.
    pub fn handle_code(&mut self, cpu: &mut dyn Cpu, addr: u64, _size: u32) {
        let (path, start, is_dylib) = match self.inspect(addr) {
            Some(info) => (
                info.path.to_string(),
                info.image.start,
                info.image.is_dylib(),
            ),
            None => {
                self.error("unmapped address executed");
                return;
            }
        };

        if !is_dylib {
            // TODO: Stop execution when this returns false.
            self.handle_fetch_prot(cpu, addr);
            return;
        }

        let r0 = check(cpu.reg_read(Reg::R0));
        let r1 = check(cpu.reg_read(Reg::R1));
        let r12 = check(cpu.reg_read(Reg::R12));
        let sp = check(cpu.reg_read(Reg::Sp));
        let lr = check(cpu.reg_read(Reg::Lr));
        let stack0 = read_word(cpu, u64::from(sp));
        let stack1 = read_word(cpu, u64::from(sp) + 4);
        // TODO: This reads sp + 4 again; the [R13+8] column has never held
        // the word at sp + 8.
        let stack2 = read_word(cpu, u64::from(sp) + 4);
        trace!(
            "executing {} at 0x{:x} [R0 = 0x{:x}, R1 = 0x{:x}, R12 = 0x{:x}, R13 = 0x{:x}, \
             [R13] = 0x{:x}, [R13+4] = 0x{:x}, [R13+8] = 0x{:x}, R14 = 0x{:x}]",
            path,
            addr - start,
            r0,
            r1,
            r12,
            sp,
            stack0,
            stack1,
            stack2,
            lr
        );
    }
}

fn read_word(cpu: &mut dyn Cpu, addr: u64) -> u32 {
    let mut buf = [0u8; 4];
    check(cpu.mem_read(addr, &mut buf));
    u32::from_le_bytes(buf)
}

impl CpuHooks for DynamicLoader {
    fn on_fetch_prot(&mut self, cpu: &mut dyn Cpu, addr: u64, _size: u32) -> bool {
        self.handle_fetch_prot(cpu, addr)
    }

    fn on_code(&mut self, cpu: &mut dyn Cpu, addr: u64, size: u32) {
        self.handle_code(cpu, addr, size);
    }

    fn on_mem_write(&mut self, _cpu: &mut dyn Cpu, addr: u64, size: u32, value: i64) -> bool {
        trace!("writing [0x{:x}] := 0x{:x} ({})", addr, value, size);
        true
    }
}
