//! Raw bindings to the Linux `bpf(2)` system call.
//!
//! Every wrapper mirrors the libbpf C API it is named after: it returns the
//! raw syscall result (a file descriptor or `0` on success) and leaves the
//! error in `errno`.

#![allow(non_camel_case_types)]

extern crate libc;

use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_int, c_uint, c_void};

include!(concat!(env!("OUT_DIR"), "/version.rs"));

pub const BPF_OBJ_NAME_LEN: usize = 16;

/// `BPF_LD | BPF_IMM | BPF_DW`, the first half of a 16-byte immediate load.
pub const BPF_LD_IMM64: u8 = 0x18;
/// Marks an immediate load whose `imm` holds a map file descriptor.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;
/// `BPF_JMP | BPF_EXIT`
pub const BPF_EXIT_INSN: u8 = 0x95;

pub const BPF_ANY: u64 = 0;
pub const BPF_NOEXIST: u64 = 1;
pub const BPF_EXIST: u64 = 2;

/// Map flag: allocate elements on demand. Required for LPM tries.
pub const BPF_F_NO_PREALLOC: u32 = 1 << 0;

pub const XDP_FLAGS_UPDATE_IF_NOEXIST: u32 = 1 << 0;
pub const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;
pub const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;
pub const XDP_FLAGS_HW_MODE: u32 = 1 << 3;
pub const XDP_FLAGS_REPLACE: u32 = 1 << 4;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum bpf_cmd {
    BPF_MAP_CREATE = 0,
    BPF_MAP_LOOKUP_ELEM = 1,
    BPF_MAP_UPDATE_ELEM = 2,
    BPF_MAP_DELETE_ELEM = 3,
    BPF_MAP_GET_NEXT_KEY = 4,
    BPF_PROG_LOAD = 5,
    BPF_OBJ_PIN = 6,
    BPF_OBJ_GET = 7,
    BPF_PROG_GET_FD_BY_ID = 13,
    BPF_MAP_GET_FD_BY_ID = 14,
    BPF_OBJ_GET_INFO_BY_FD = 15,
    BPF_LINK_CREATE = 28,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum bpf_map_type {
    BPF_MAP_TYPE_UNSPEC = 0,
    BPF_MAP_TYPE_HASH = 1,
    BPF_MAP_TYPE_ARRAY = 2,
    BPF_MAP_TYPE_PROG_ARRAY = 3,
    BPF_MAP_TYPE_PERF_EVENT_ARRAY = 4,
    BPF_MAP_TYPE_PERCPU_HASH = 5,
    BPF_MAP_TYPE_PERCPU_ARRAY = 6,
    BPF_MAP_TYPE_STACK_TRACE = 7,
    BPF_MAP_TYPE_CGROUP_ARRAY = 8,
    BPF_MAP_TYPE_LRU_HASH = 9,
    BPF_MAP_TYPE_LRU_PERCPU_HASH = 10,
    BPF_MAP_TYPE_LPM_TRIE = 11,
    BPF_MAP_TYPE_ARRAY_OF_MAPS = 12,
    BPF_MAP_TYPE_HASH_OF_MAPS = 13,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum bpf_prog_type {
    BPF_PROG_TYPE_UNSPEC = 0,
    BPF_PROG_TYPE_SOCKET_FILTER = 1,
    BPF_PROG_TYPE_KPROBE = 2,
    BPF_PROG_TYPE_SCHED_CLS = 3,
    BPF_PROG_TYPE_SCHED_ACT = 4,
    BPF_PROG_TYPE_TRACEPOINT = 5,
    BPF_PROG_TYPE_XDP = 6,
    BPF_PROG_TYPE_PERF_EVENT = 7,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum bpf_attach_type {
    BPF_XDP = 37,
}

/// A single eBPF instruction.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct bpf_insn {
    pub code: u8,
    /// `dst_reg` in the low nibble, `src_reg` in the high nibble.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl bpf_insn {
    pub fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub fn set_src_reg(&mut self, src: u8) {
        self.regs = (self.regs & 0x0f) | (src << 4);
    }

    /// Decode the first instruction of `bytes`, in native byte order.
    pub fn from_bytes(bytes: &[u8]) -> Option<bpf_insn> {
        let bytes = bytes.get(..8)?;
        Some(bpf_insn {
            code: bytes[0],
            regs: bytes[1],
            off: i16::from_ne_bytes([bytes[2], bytes[3]]),
            imm: i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.code;
        bytes[1] = self.regs;
        bytes[2..4].copy_from_slice(&self.off.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.imm.to_ne_bytes());
        bytes
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct bpf_prog_info {
    pub type_: u32,
    pub id: u32,
    pub tag: [u8; 8],
    pub jited_prog_len: u32,
    pub xlated_prog_len: u32,
    pub jited_prog_insns: u64,
    pub xlated_prog_insns: u64,
    pub load_time: u64,
    pub created_by_uid: u32,
    pub nr_map_ids: u32,
    pub map_ids: u64,
    pub name: [c_char; BPF_OBJ_NAME_LEN],
    pub ifindex: u32,
    /// Bit 0 is `gpl_compatible`.
    pub flags: u32,
    pub netns_dev: u64,
    pub netns_ino: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct bpf_map_info {
    pub type_: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub name: [c_char; BPF_OBJ_NAME_LEN],
    pub ifindex: u32,
    pub btf_vmlinux_value_type_id: u32,
    pub netns_dev: u64,
    pub netns_ino: u64,
}

/// Program attributes for [`bpf_load_program_xattr`].
#[derive(Debug)]
pub struct bpf_load_program_attr<'a> {
    pub prog_type: bpf_prog_type,
    pub expected_attach_type: u32,
    pub name: &'a CStr,
    pub insns: &'a [bpf_insn],
    pub license: &'a CStr,
    pub kern_version: u32,
}

#[repr(C)]
#[derive(Default)]
struct map_create_attr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [c_char; BPF_OBJ_NAME_LEN],
    map_ifindex: u32,
}

#[repr(C)]
#[derive(Default)]
struct map_elem_attr {
    map_fd: u32,
    _pad0: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct prog_load_attr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [c_char; BPF_OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct obj_attr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct info_attr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
#[derive(Default)]
struct get_id_attr {
    id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct link_create_attr {
    prog_fd: u32,
    target_fd: u32,
    attach_type: u32,
    flags: u32,
}

unsafe fn sys_bpf<T>(cmd: bpf_cmd, attr: &mut T) -> c_int {
    libc::syscall(
        libc::SYS_bpf,
        cmd as c_int,
        attr as *mut T as *mut c_void,
        mem::size_of::<T>() as c_uint,
    ) as c_int
}

fn obj_name(name: &CStr) -> [c_char; BPF_OBJ_NAME_LEN] {
    let mut buf = [0 as c_char; BPF_OBJ_NAME_LEN];
    for (dst, src) in buf
        .iter_mut()
        .zip(name.to_bytes().iter().take(BPF_OBJ_NAME_LEN - 1))
    {
        *dst = *src as c_char;
    }
    buf
}

/// Create a map. `inner_map_fd` is only meaningful for map-in-map types.
pub unsafe fn bpf_create_map_node(
    map_type: bpf_map_type,
    name: &CStr,
    key_size: c_int,
    value_size: c_int,
    max_entries: c_int,
    map_flags: c_uint,
    inner_map_fd: Option<c_int>,
) -> c_int {
    let mut attr = map_create_attr {
        map_type: map_type as u32,
        key_size: key_size as u32,
        value_size: value_size as u32,
        max_entries: max_entries as u32,
        map_flags,
        inner_map_fd: inner_map_fd.unwrap_or(0) as u32,
        map_name: obj_name(name),
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_CREATE, &mut attr)
}

pub unsafe fn bpf_map_lookup_elem(fd: c_int, key: *const c_void, value: *mut c_void) -> c_int {
    let mut attr = map_elem_attr {
        map_fd: fd as u32,
        key: key as u64,
        value: value as u64,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_LOOKUP_ELEM, &mut attr)
}

pub unsafe fn bpf_map_update_elem(
    fd: c_int,
    key: *const c_void,
    value: *const c_void,
    flags: u64,
) -> c_int {
    let mut attr = map_elem_attr {
        map_fd: fd as u32,
        key: key as u64,
        value: value as u64,
        flags,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_UPDATE_ELEM, &mut attr)
}

pub unsafe fn bpf_map_delete_elem(fd: c_int, key: *const c_void) -> c_int {
    let mut attr = map_elem_attr {
        map_fd: fd as u32,
        key: key as u64,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_DELETE_ELEM, &mut attr)
}

/// A null `key` asks for the first key of the map.
pub unsafe fn bpf_map_get_next_key(fd: c_int, key: *const c_void, next_key: *mut c_void) -> c_int {
    let mut attr = map_elem_attr {
        map_fd: fd as u32,
        key: key as u64,
        value: next_key as u64,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_GET_NEXT_KEY, &mut attr)
}

/// Load a program. A non-null `log_buf` enables verifier logging (level 1).
pub unsafe fn bpf_load_program_xattr(
    load_attr: &bpf_load_program_attr,
    log_buf: *mut c_char,
    log_buf_sz: usize,
) -> c_int {
    let mut attr = prog_load_attr {
        prog_type: load_attr.prog_type as u32,
        insn_cnt: load_attr.insns.len() as u32,
        insns: load_attr.insns.as_ptr() as u64,
        license: load_attr.license.as_ptr() as u64,
        kern_version: load_attr.kern_version,
        prog_name: obj_name(load_attr.name),
        expected_attach_type: load_attr.expected_attach_type,
        ..Default::default()
    };
    if !log_buf.is_null() && log_buf_sz > 0 {
        attr.log_level = 1;
        attr.log_buf = log_buf as u64;
        attr.log_size = log_buf_sz as u32;
    }
    sys_bpf(bpf_cmd::BPF_PROG_LOAD, &mut attr)
}

pub unsafe fn bpf_obj_pin(fd: c_int, pathname: *const c_char) -> c_int {
    let mut attr = obj_attr {
        pathname: pathname as u64,
        bpf_fd: fd as u32,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_OBJ_PIN, &mut attr)
}

pub unsafe fn bpf_obj_get(pathname: *const c_char) -> c_int {
    let mut attr = obj_attr {
        pathname: pathname as u64,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_OBJ_GET, &mut attr)
}

pub unsafe fn bpf_obj_get_info_by_fd(fd: c_int, info: *mut c_void, info_len: *mut u32) -> c_int {
    let mut attr = info_attr {
        bpf_fd: fd as u32,
        info_len: *info_len,
        info: info as u64,
    };
    let res = sys_bpf(bpf_cmd::BPF_OBJ_GET_INFO_BY_FD, &mut attr);
    if res == 0 {
        *info_len = attr.info_len;
    }
    res
}

pub unsafe fn bpf_prog_get_fd_by_id(id: u32) -> c_int {
    let mut attr = get_id_attr {
        id,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_PROG_GET_FD_BY_ID, &mut attr)
}

pub unsafe fn bpf_map_get_fd_by_id(id: u32) -> c_int {
    let mut attr = get_id_attr {
        id,
        ..Default::default()
    };
    sys_bpf(bpf_cmd::BPF_MAP_GET_FD_BY_ID, &mut attr)
}

/// Create a bpf link. For `BPF_XDP`, `target_fd` is the interface index.
pub unsafe fn bpf_link_create(
    prog_fd: c_int,
    target_fd: c_int,
    attach_type: bpf_attach_type,
    flags: u32,
) -> c_int {
    let mut attr = link_create_attr {
        prog_fd: prog_fd as u32,
        target_fd: target_fd as u32,
        attach_type: attach_type as u32,
        flags,
    };
    sys_bpf(bpf_cmd::BPF_LINK_CREATE, &mut attr)
}
