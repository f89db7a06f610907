//! Abstract CPU engine interface.
//!
//! The emulator executing guest code is an external collaborator; the loader
//! only needs memory mapping, register access, hook installation and
//! start/stop. Hooks are delivered through a [`CpuHooks`] handler passed to
//! [`Cpu::start`]: the engine hands itself back to every callback, which is
//! how hook code gets a stable engine reference without aliasing the owner.
//!
//! Engine failures are not recoverable from the loader's point of view -
//! no loader state can be trusted once a map or register operation has
//! failed - so loader code routes every engine result through a checked
//! helper that aborts on error.

use thiserror::Error;

/// An error reported by the CPU engine.
#[derive(Debug, Error)]
#[error("cpu engine error: {0}")]
pub struct CpuError(pub String);

pub type CpuResult<T> = Result<T, CpuError>;

/// Guest registers of the 32-bit ARM core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

/// Memory permissions for an emulator mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prot(u8);

impl Prot {
    pub const NONE: Prot = Prot(0);
    pub const READ: Prot = Prot(1);
    pub const WRITE: Prot = Prot(2);
    pub const EXEC: Prot = Prot(4);

    pub fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        Prot(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Prot {
    fn bitor_assign(&mut self, rhs: Prot) {
        self.0 |= rhs.0;
    }
}

/// Hook categories the loader installs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// Instruction fetch from memory mapped without execute permission.
    FetchProt,
    /// Every executed instruction.
    Code,
    /// Every memory write.
    MemWrite,
}

/// The CPU engine as the loader sees it.
///
/// Addresses are identity-mapped: the `addr` of a mapping equals the host
/// pointer backing it, and the backing memory must stay valid for as long as
/// the engine can run.
pub trait Cpu {
    /// Guest page size. Mapping addresses and sizes are multiples of this.
    fn page_size(&self) -> u64 {
        0x1000
    }

    /// Map `size` bytes of host memory at guest address `addr`.
    fn map_ptr(&mut self, addr: u64, size: u64, prot: Prot, host: *mut u8) -> CpuResult<()>;

    fn reg_read(&mut self, reg: Reg) -> CpuResult<u32>;

    fn reg_write(&mut self, reg: Reg, value: u32) -> CpuResult<()>;

    fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> CpuResult<()>;

    /// Enable delivery of one hook category to the handler passed to `start`.
    fn hook_add(&mut self, kind: HookKind) -> CpuResult<()>;

    /// Run the guest from `begin` until stopped. Installed hooks fire on
    /// `hooks` synchronously, on the calling thread, with emulation paused.
    fn start(&mut self, begin: u64, hooks: &mut dyn CpuHooks) -> CpuResult<()>;

    /// Stop emulation. Only meaningful from inside a hook.
    fn stop(&mut self) -> CpuResult<()>;
}

/// Callbacks fired by the engine while it runs.
pub trait CpuHooks {
    /// Fetch-protection fault at `addr`. Returning false leaves the fault
    /// unhandled and the engine reacts as it sees fit (usually a hard stop).
    fn on_fetch_prot(&mut self, cpu: &mut dyn Cpu, addr: u64, size: u32) -> bool;

    /// An instruction at `addr` is about to execute.
    fn on_code(&mut self, cpu: &mut dyn Cpu, addr: u64, size: u32);

    /// A write of `value` (`size` bytes) to `addr`. Returning false aborts
    /// the access.
    fn on_mem_write(&mut self, cpu: &mut dyn Cpu, addr: u64, size: u32, value: i64) -> bool;
}

/// Unwrap an engine result or abort.
///
/// Engine errors leave the address space in an unknown state; continuing
/// would let the guest run over garbage mappings.
pub(crate) fn check<T>(result: CpuResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{err}"),
    }
}
