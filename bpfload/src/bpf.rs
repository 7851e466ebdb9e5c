//! The kernel boundary.
//!
//! Everything this crate asks of the kernel goes through the [`Kernel`] trait.
//! [`SysKernel`] implements it with the raw `bpf(2)` wrappers from
//! `bpfload-sys`.

use std::fmt;
use std::io;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use bpfload_sys as sys;

use crate::map::MapType;
use crate::prog::ProgType;
use crate::utils::*;

/// Attributes for creating a map.
#[derive(Debug, Clone)]
pub struct MapAttr<'a> {
    pub map_type: MapType,
    pub name: &'a str,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    /// Template map the kernel validates nested maps against.
    pub inner_map_fd: Option<RawFd>,
}

/// Attributes for loading a program.
#[derive(Debug, Clone)]
pub struct ProgAttr<'a> {
    pub prog_type: ProgType,
    pub name: &'a str,
    pub insns: &'a [u8],
    pub license: &'a str,
    pub kernel_version: u32,
}

/// What the kernel reports about a loaded program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelProgInfo {
    pub name: String,
    pub prog_type: u32,
    pub id: u32,
    pub tag: [u8; 8],
    pub jited_len: u32,
    pub xlated_len: u32,
    /// Nanoseconds since boot.
    pub load_time: u64,
    pub gpl_compatible: bool,
    pub map_ids: Vec<u32>,
}

/// What the kernel reports about a map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelMapInfo {
    pub name: String,
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

/// The operations this crate needs from the kernel.
///
/// Every call returns the raw `io::Error` the kernel produced; mapping errno
/// values onto [`Error`](crate::Error) is left to the callers, which know what
/// the operation meant.
pub trait Kernel: fmt::Debug + Send + Sync {
    fn map_create(&self, attr: &MapAttr) -> io::Result<RawFd>;

    /// `value_size` is the full buffer width, which for per-CPU maps covers
    /// every possible CPU.
    fn map_lookup(&self, fd: RawFd, key: &[u8], value_size: usize) -> io::Result<Vec<u8>>;

    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> io::Result<()>;

    fn map_delete(&self, fd: RawFd, key: &[u8]) -> io::Result<()>;

    /// Returns `None` once `key` is the last key. A `None` key asks for the
    /// first one.
    fn map_next_key(&self, fd: RawFd, key: Option<&[u8]>, key_size: usize)
        -> io::Result<Option<Vec<u8>>>;

    /// Load a program. When `log` is given the verifier writes its log there.
    fn prog_load(&self, attr: &ProgAttr, log: Option<&mut [u8]>) -> io::Result<RawFd>;

    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()>;

    fn obj_get(&self, path: &Path) -> io::Result<RawFd>;

    /// Attach an XDP program to an interface, returning the link handle.
    /// Closing the link detaches the program.
    fn xdp_attach(&self, prog_fd: RawFd, ifindex: u32, flags: u32) -> io::Result<RawFd>;

    fn if_index(&self, iface: &str) -> Option<u32>;

    fn prog_info(&self, fd: RawFd) -> io::Result<KernelProgInfo>;

    fn map_info(&self, fd: RawFd) -> io::Result<KernelMapInfo>;

    fn prog_fd_by_id(&self, id: u32) -> io::Result<RawFd>;

    fn map_fd_by_id(&self, id: u32) -> io::Result<RawFd>;

    fn close(&self, fd: RawFd) -> io::Result<()>;

    fn possible_cpus(&self) -> io::Result<usize>;
}

/// Lookup an element from the map
pub fn lookup_elem(fd: c_int, key: &[u8], value_size: usize) -> io::Result<Vec<u8>> {
    let mut value = vec![0u8; value_size];
    unsafe {
        err_check(sys::bpf_map_lookup_elem(
            fd,
            key.as_ptr() as *const _,
            value.as_mut_ptr() as *mut _,
        ))?;
    }
    Ok(value)
}

/// Update an element in the map
pub fn update_elem(fd: c_int, key: &[u8], value: &[u8], flags: u64) -> io::Result<()> {
    unsafe {
        err_check(sys::bpf_map_update_elem(
            fd,
            key.as_ptr() as *const _,
            value.as_ptr() as *const _,
            flags,
        ))
    }
}

/// Delete an element from the map
pub fn delete_elem(fd: c_int, key: &[u8]) -> io::Result<()> {
    unsafe { err_check(sys::bpf_map_delete_elem(fd, key.as_ptr() as *const _)) }
}

/// Iterate to the next key from a given one in a map
pub fn get_next_key(fd: c_int, old_key: Option<&[u8]>, key_size: usize) -> io::Result<Option<Vec<u8>>> {
    let mut next_key = vec![0u8; key_size];
    let old = old_key.map_or(ptr::null(), |k| k.as_ptr() as *const c_void);
    let res = unsafe { sys::bpf_map_get_next_key(fd, old, next_key.as_mut_ptr() as *mut _) };
    match err_check(res) {
        Ok(()) => Ok(Some(next_key)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Get a file descriptor from a path to a pinned BPF object
pub fn obj_get_fd(path: &Path) -> io::Result<RawFd> {
    let cstr = path_to_cstring(path)?;

    unsafe { val_check(sys::bpf_obj_get(cstr.as_ptr())) }
}

/// Pin a file descriptor to a path
pub fn obj_pin_fd(fd: c_int, path: &Path) -> io::Result<()> {
    let cstr = path_to_cstring(path)?;

    unsafe { err_check(sys::bpf_obj_pin(fd, cstr.as_ptr())) }
}

/// The real kernel, reached through the `bpf(2)` system call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysKernel;

impl Kernel for SysKernel {
    fn map_create(&self, attr: &MapAttr) -> io::Result<RawFd> {
        let name = str_to_cstring(attr.name)?;
        unsafe {
            val_check(sys::bpf_create_map_node(
                attr.map_type.as_bpf_map_type(),
                &name,
                attr.key_size as c_int,
                attr.value_size as c_int,
                attr.max_entries as c_int,
                attr.flags,
                attr.inner_map_fd,
            ))
        }
    }

    fn map_lookup(&self, fd: RawFd, key: &[u8], value_size: usize) -> io::Result<Vec<u8>> {
        lookup_elem(fd, key, value_size)
    }

    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> io::Result<()> {
        update_elem(fd, key, value, flags)
    }

    fn map_delete(&self, fd: RawFd, key: &[u8]) -> io::Result<()> {
        delete_elem(fd, key)
    }

    fn map_next_key(
        &self,
        fd: RawFd,
        key: Option<&[u8]>,
        key_size: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        get_next_key(fd, key, key_size)
    }

    fn prog_load(&self, attr: &ProgAttr, log: Option<&mut [u8]>) -> io::Result<RawFd> {
        const INSN_SIZE: usize = mem::size_of::<sys::bpf_insn>();
        if attr.insns.is_empty() || attr.insns.len() % INSN_SIZE != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let insns: Vec<sys::bpf_insn> = attr
            .insns
            .chunks_exact(INSN_SIZE)
            .map(|c| sys::bpf_insn {
                code: c[0],
                regs: c[1],
                off: i16::from_ne_bytes([c[2], c[3]]),
                imm: i32::from_ne_bytes([c[4], c[5], c[6], c[7]]),
            })
            .collect();
        let name = str_to_cstring(attr.name)?;
        let license = str_to_cstring(attr.license)?;
        let load_attr = sys::bpf_load_program_attr {
            prog_type: attr.prog_type.as_bpf_prog_type(),
            expected_attach_type: attr.prog_type.expected_attach_type(),
            name: &name,
            insns: &insns,
            license: &license,
            kern_version: attr.kernel_version,
        };

        let (log_buf, log_size) = match log {
            Some(buf) => (buf.as_mut_ptr() as *mut c_char, buf.len()),
            None => (ptr::null_mut(), 0),
        };
        unsafe { val_check(sys::bpf_load_program_xattr(&load_attr, log_buf, log_size)) }
    }

    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        obj_pin_fd(fd, path)
    }

    fn obj_get(&self, path: &Path) -> io::Result<RawFd> {
        obj_get_fd(path)
    }

    fn xdp_attach(&self, prog_fd: RawFd, ifindex: u32, flags: u32) -> io::Result<RawFd> {
        unsafe {
            val_check(sys::bpf_link_create(
                prog_fd,
                ifindex as c_int,
                sys::bpf_attach_type::BPF_XDP,
                flags,
            ))
        }
    }

    fn if_index(&self, iface: &str) -> Option<u32> {
        let cstr = str_to_cstring(iface).ok()?;
        match unsafe { libc::if_nametoindex(cstr.as_ptr()) } {
            0 => None,
            index => Some(index),
        }
    }

    fn prog_info(&self, fd: RawFd) -> io::Result<KernelProgInfo> {
        let mut info = sys::bpf_prog_info::default();
        get_info(fd, &mut info)?;

        // Second pass now that the number of maps is known.
        let mut map_ids = vec![0u32; info.nr_map_ids as usize];
        if !map_ids.is_empty() {
            let nr_map_ids = info.nr_map_ids;
            info = sys::bpf_prog_info {
                nr_map_ids,
                map_ids: map_ids.as_mut_ptr() as u64,
                ..Default::default()
            };
            get_info(fd, &mut info)?;
            map_ids.truncate(info.nr_map_ids.min(nr_map_ids) as usize);
        }

        Ok(KernelProgInfo {
            name: name_from_raw(&info.name),
            prog_type: info.type_,
            id: info.id,
            tag: info.tag,
            jited_len: info.jited_prog_len,
            xlated_len: info.xlated_prog_len,
            load_time: info.load_time,
            gpl_compatible: info.flags & 1 == 1,
            map_ids,
        })
    }

    fn map_info(&self, fd: RawFd) -> io::Result<KernelMapInfo> {
        let mut info = sys::bpf_map_info::default();
        get_info(fd, &mut info)?;

        Ok(KernelMapInfo {
            name: name_from_raw(&info.name),
            map_type: info.type_,
            id: info.id,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            flags: info.map_flags,
        })
    }

    fn prog_fd_by_id(&self, id: u32) -> io::Result<RawFd> {
        unsafe { val_check(sys::bpf_prog_get_fd_by_id(id)) }
    }

    fn map_fd_by_id(&self, id: u32) -> io::Result<RawFd> {
        unsafe { val_check(sys::bpf_map_get_fd_by_id(id)) }
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        unsafe { err_check(libc::close(fd)) }
    }

    fn possible_cpus(&self) -> io::Result<usize> {
        possible_cpus().map(|cpus| cpus.len())
    }
}

fn get_info<T>(fd: RawFd, info: &mut T) -> io::Result<()> {
    let mut len = mem::size_of::<T>() as u32;
    unsafe {
        err_check(sys::bpf_obj_get_info_by_fd(
            fd,
            info as *mut T as *mut c_void,
            &mut len,
        ))
    }
}
