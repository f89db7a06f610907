//! Gangway - a dynamic loader and cross-ABI call bridge.
//!
//! Gangway maps a 32-bit ARM iOS program (a Mach-O executable and the dylibs
//! it references) into the address space of a CPU emulator and keeps that
//! program runnable on a host whose native libraries follow a different
//! executable format and ABI. Guest addresses are identical to host addresses,
//! so pointers cross the boundary unmodified.
//!
//! # Modules
//!
//! - [`loader`] - Image registry, Mach-O and native image loading, execution
//!   control and the guest/native boundary trap
//! - [`macho`] - 32-bit ARM Mach-O parsing
//! - [`cpu`] - Abstract CPU engine interface (the emulator is an external
//!   collaborator)
//! - [`host`] - Host-side collaborators: native library loader, package
//!   store, diagnostic sink
//! - [`mem`] - Page-aligned host allocations backing emulator mappings
//! - [`paths`] - Guest path resolution
//!
//! # Error Handling
//!
//! Format and I/O failures use the consolidated [`Error`] type. Most loader
//! conditions are deliberately non-fatal: they are reported through the
//! configured diagnostic sink and the load path degrades instead of
//! propagating. Emulator API failures are the exception - they abort the
//! process, since no loader state can be trusted afterwards.

pub mod cpu;
pub mod host;
pub mod loader;
pub mod macho;
pub mod mem;
pub mod paths;

/// Consolidated error type for Gangway operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object format error: {0}")]
    ObjectFormat(#[from] macho::MachError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory allocation error: {0}")]
    Allocation(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use cpu::{Cpu, CpuError, CpuHooks, HookKind, Prot, Reg};
pub use host::{
    DiagnosticSink, DirPackage, HostHandle, HostLoader, LogSink, PackageStore, SystemLoader,
};
pub use loader::{AddrInfo, DynamicLoader, LoadedImage};
pub use paths::{BinaryPath, resolve_path};
