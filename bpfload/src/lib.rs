//! Load eBPF object files, manage their maps and attach XDP programs.
//!
//! ```no_run
//! use bpfload::System;
//!
//! let mut system = System::new();
//! system.load_elf("xdp.elf")?;
//! for (name, res) in system.load_programs() {
//!     res.map_err(|e| { eprintln!("{}: {}", name, e); e })?;
//! }
//! system.program_mut("xdp0").unwrap().attach("eth0")?;
//! # Ok::<(), bpfload::Error>(())
//! ```

mod bpf;
mod elf;
mod encode;
mod error;
mod fd;
mod info;
mod relocate;
mod system;
mod utils;

mod map;
mod prog;

#[cfg(test)]
mod testutil;

pub use bpf::{
    Kernel,
    KernelMapInfo,
    KernelProgInfo,
    MapAttr,
    ProgAttr,
    SysKernel
};

pub use elf::{
    InnerMapDefinition,
    MapDefinition,
    ObjectFile,
    ProgramDefinition,
    Relocation,
    KERNEL_VERSION_ANY
};

pub use encode::{
    EncodeError,
    ToMapBytes,
    decode_uint
};

pub use error::{
    Error,
    FormatError,
    Result
};

pub use info::ProgramInfo;

pub use map::{
    Map,
    MapType,
    MapKeys,
    MapIterator
};

pub use prog::{
    Program,
    ProgType,
    ProgState,
    XdpFlags,
    DEFAULT_LOG_SIZE
};

pub use relocate::relocate;

pub use system::{
    Options,
    System,
    DEFAULT_PIN_ROOT
};
