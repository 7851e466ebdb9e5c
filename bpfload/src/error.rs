use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::map::MapType;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors caught while reading an object file.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("error parsing ELF data")]
    Elf(#[source] object::read::Error),

    #[error("error reading section `{section}`")]
    Section {
        section: String,
        #[source]
        error: object::read::Error,
    },

    #[error("invalid license `{data:?}`")]
    InvalidLicense { data: Vec<u8> },

    #[error("invalid kernel version `{data:?}`")]
    InvalidKernelVersion { data: Vec<u8> },

    #[error("map definition `{name}` is truncated ({size} bytes)")]
    InvalidMapDefinition { name: String, size: usize },

    #[error("unknown map type {map_type} for map `{name}`")]
    UnknownMapType { name: String, map_type: u32 },

    #[error("map `{name}` is a map-in-map but has no inner map definition")]
    MissingInnerMap { name: String },

    #[error("invalid persistent path for map `{name}`")]
    InvalidPinPath { name: String },

    #[error("program `{name}` is {size} bytes, not a whole number of instructions")]
    InvalidProgramCode { name: String, size: usize },

    #[error("relocation at {offset:#x} in section `{section}` references an unknown symbol")]
    UnknownSymbol { section: String, offset: u64 },

    #[error("relocation at {offset:#x} in section `{section}` does not target a map")]
    UnsupportedRelocation { section: String, offset: u64 },

    #[error("relocation in program `{program}` targets instruction {index}, which is not a 64-bit immediate load")]
    InvalidRelocationTarget { program: String, index: usize },
}

/// The error type of every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed object file")]
    Format(#[from] FormatError),

    #[error("error reading `{}`", path.display())]
    File {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("program `{program}` references map `{map}`, which is not loaded")]
    UnresolvedReference { program: String, map: String },

    #[error("the kernel rejected {call} for `{name}`")]
    KernelRejected {
        call: &'static str,
        name: String,
        #[source]
        error: io::Error,
    },

    #[error("the verifier rejected program `{name}`:\n{log}")]
    VerifierRejected {
        name: String,
        log: String,
        #[source]
        error: io::Error,
    },

    #[error("`{name}` is already closed")]
    AlreadyClosed { name: String },

    #[error("program `{name}` is already loaded")]
    AlreadyLoaded { name: String },

    #[error("an object file is already loaded into this system")]
    ObjectAlreadyLoaded,

    #[error("program `{name}` is not loaded")]
    NotLoaded { name: String },

    #[error("map `{name}` has not been created")]
    NotCreated { name: String },

    #[error("program `{name}` is not attached")]
    NotAttached { name: String },

    #[error("`{name}` is not pinned")]
    NotPinned { name: String },

    #[error("key not found in map `{name}`")]
    NotFound { name: String },

    #[error("key already exists in map `{name}`")]
    KeyExists { name: String },

    #[error("key {key} is out of range for map `{name}` ({max_entries} entries)")]
    KeyOutOfRange {
        name: String,
        key: u64,
        max_entries: u32,
    },

    #[error("invalid key for map `{name}`: {reason}")]
    InvalidKey { name: String, reason: String },

    #[error("invalid value for map `{name}`: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("{operation} is not supported on `{name}` ({map_type:?})")]
    UnsupportedOperation {
        name: String,
        operation: &'static str,
        map_type: Option<MapType>,
    },

    #[error("network interface `{iface}` does not exist")]
    InterfaceNotFound { iface: String },

    #[error("failed to attach program `{name}` to `{iface}`")]
    AttachFailed {
        name: String,
        iface: String,
        #[source]
        error: io::Error,
    },

    #[error("{call} failed")]
    Syscall {
        call: &'static str,
        #[source]
        error: io::Error,
    },
}
