use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bpfload_sys as sys;
use log::{debug, warn};

use crate::bpf::{Kernel, KernelMapInfo, MapAttr};
use crate::elf::{InnerMapDefinition, MapDefinition};
use crate::encode::{decode_index, decode_uint, EncodeError, ToMapBytes};
use crate::error::{Error, FormatError, Result};
use crate::fd::FdState;

/// Possible types for BPF maps.
///
/// This must be kept in sync with map types available in the kernel.
///
/// Certain map types do not expose functionality to lookup elements or iterate through keys.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MapType {
    Unspec,
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PerCPUHash,
    PerCPUArray,
    StackTrace,
    CgroupArray,
    LRUHash,
    LRUPerCPUHash,
    LPMTrie,
    ArrayOfMaps,
    HashOfMaps,
}

impl MapType {
    pub(crate) fn as_bpf_map_type(&self) -> sys::bpf_map_type {
        use self::MapType::*;
        use bpfload_sys::bpf_map_type::*;

        match *self {
            Unspec             => BPF_MAP_TYPE_UNSPEC,
            Hash               => BPF_MAP_TYPE_HASH,
            Array              => BPF_MAP_TYPE_ARRAY,
            ProgArray          => BPF_MAP_TYPE_PROG_ARRAY,
            PerfEventArray     => BPF_MAP_TYPE_PERF_EVENT_ARRAY,
            PerCPUHash         => BPF_MAP_TYPE_PERCPU_HASH,
            PerCPUArray        => BPF_MAP_TYPE_PERCPU_ARRAY,
            StackTrace         => BPF_MAP_TYPE_STACK_TRACE,
            CgroupArray        => BPF_MAP_TYPE_CGROUP_ARRAY,
            LRUHash            => BPF_MAP_TYPE_LRU_HASH,
            LRUPerCPUHash      => BPF_MAP_TYPE_LRU_PERCPU_HASH,
            LPMTrie            => BPF_MAP_TYPE_LPM_TRIE,
            ArrayOfMaps        => BPF_MAP_TYPE_ARRAY_OF_MAPS,
            HashOfMaps         => BPF_MAP_TYPE_HASH_OF_MAPS,
        }
    }

    /// Array-like maps: every index below `max_entries` always exists.
    pub fn is_array(&self) -> bool {
        use self::MapType::*;

        matches!(
            *self,
            Array | ProgArray | PerfEventArray | PerCPUArray | CgroupArray | ArrayOfMaps
        )
    }

    /// Arrays of kernel object fds. The kernel only accepts `BPF_ANY` writes
    /// on these.
    pub fn is_fd_array(&self) -> bool {
        use self::MapType::*;

        matches!(*self, ProgArray | PerfEventArray | CgroupArray | ArrayOfMaps)
    }

    pub fn is_per_cpu(&self) -> bool {
        use self::MapType::*;

        matches!(*self, PerCPUHash | PerCPUArray | LRUPerCPUHash)
    }

    pub fn is_map_in_map(&self) -> bool {
        matches!(*self, MapType::ArrayOfMaps | MapType::HashOfMaps)
    }
}

impl TryFrom<u32> for MapType {
    type Error = u32;

    fn try_from(val: u32) -> ::std::result::Result<MapType, u32> {
        use self::MapType::*;

        Ok(match val {
            0 => Unspec,
            1 => Hash,
            2 => Array,
            3 => ProgArray,
            4 => PerfEventArray,
            5 => PerCPUHash,
            6 => PerCPUArray,
            7 => StackTrace,
            8 => CgroupArray,
            9 => LRUHash,
            10 => LRUPerCPUHash,
            11 => LPMTrie,
            12 => ArrayOfMaps,
            13 => HashOfMaps,
            _ => return Err(val),
        })
    }
}

/// An eBPF map.
///
/// A `Map` exclusively owns its kernel handle. Other `Map`s may refer to the
/// same kernel object (see [`ProgramInfo`](crate::ProgramInfo)), but each
/// holds a handle of its own.
#[derive(Debug)]
pub struct Map {
    name: String,
    map_type: MapType,
    /// Size of keys in the map, in bytes
    key_size: usize,
    /// Size of values in the map, in bytes. Per CPU for per-CPU maps.
    value_size: usize,
    /// The maximum number of entries this map can hold
    max_entries: usize,
    /// Additional flags set at creation
    flags: u32,
    inner: Option<InnerMapDefinition>,
    pin_path: Option<PathBuf>,
    cpus: usize,
    fd: FdState,
    kernel: Arc<dyn Kernel>,
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.kernel.close(fd) {
                warn!("failed to close map `{}` (fd {}): {}", self.name, fd, e);
            }
        }
    }
}

impl Display for Map {
    fn fmt(&self, f: &mut fmt::Formatter) -> ::std::result::Result<(), fmt::Error> {
        write!(f, "Name:          {}\n", self.name)?;
        write!(f, "Type:          {:?}\n", self.map_type)?;
        write!(f, "Key size:      {:?}\n", self.key_size)?;
        write!(f, "Value size:    {:?}\n", self.value_size)?;
        write!(f, "Max entries:   {:?}", self.max_entries)
    }
}

impl Map {
    /// A map that is yet to be created with [`create`](Map::create).
    pub fn new(
        kernel: Arc<dyn Kernel>,
        name: &str,
        map_type: MapType,
        key_size: usize,
        value_size: usize,
        max_entries: usize,
    ) -> Map {
        Map {
            name: name.to_owned(),
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            inner: None,
            pin_path: None,
            cpus: 1,
            fd: FdState::Unset,
            kernel,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Map {
        self.flags = flags;
        self
    }

    /// The template nested maps must match. Required for map-in-map types.
    pub fn with_inner_map(mut self, inner: InnerMapDefinition) -> Map {
        self.inner = Some(inner);
        self
    }

    /// Reuse the map pinned at `path` on creation, or pin it there.
    pub fn with_pin_path<P: Into<PathBuf>>(mut self, path: P) -> Map {
        self.pin_path = Some(path.into());
        self
    }

    pub(crate) fn from_definition(kernel: Arc<dyn Kernel>, def: &MapDefinition) -> Map {
        Map {
            name: def.name.clone(),
            map_type: def.map_type,
            key_size: def.key_size as usize,
            value_size: def.value_size as usize,
            max_entries: def.max_entries as usize,
            flags: def.flags,
            inner: def.inner.clone(),
            pin_path: def.pin_path.clone(),
            cpus: 1,
            fd: FdState::Unset,
            kernel,
        }
    }

    /// Wrap an already open handle, sized and typed from what the kernel reports.
    pub(crate) fn from_kernel_info(
        kernel: Arc<dyn Kernel>,
        fd: RawFd,
        info: &KernelMapInfo,
    ) -> Result<Map> {
        let map_type = match MapType::try_from(info.map_type) {
            Ok(map_type) => map_type,
            Err(_) => {
                let _ = kernel.close(fd);
                return Err(Error::UnsupportedOperation {
                    name: info.name.clone(),
                    operation: "opening a map of unknown type",
                    map_type: None,
                });
            }
        };
        let mut map = Map {
            name: info.name.clone(),
            map_type,
            key_size: info.key_size as usize,
            value_size: info.value_size as usize,
            max_entries: info.max_entries as usize,
            flags: info.flags,
            inner: None,
            pin_path: None,
            cpus: 1,
            fd: FdState::Open(fd),
            kernel,
        };
        map.cpus = map.count_cpus()?;
        Ok(map)
    }

    /// Load map information from a path to a persisted BPF map
    pub fn from_path<P: AsRef<Path>>(kernel: Arc<dyn Kernel>, path: P) -> Result<Map> {
        let path = path.as_ref();
        let fd = kernel
            .obj_get(path)
            .map_err(|error| Error::Syscall {
                call: "BPF_OBJ_GET",
                error,
            })?;
        let info = match kernel.map_info(fd) {
            Ok(info) => info,
            Err(error) => {
                let _ = kernel.close(fd);
                return Err(Error::Syscall {
                    call: "BPF_OBJ_GET_INFO_BY_FD",
                    error,
                });
            }
        };
        let mut map = Map::from_kernel_info(kernel, fd, &info)?;
        map.pin_path = Some(path.to_owned());
        Ok(map)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn inner_map(&self) -> Option<&InnerMapDefinition> {
        self.inner.as_ref()
    }

    /// Where the map is pinned, or will be pinned on creation.
    pub fn pin_path(&self) -> Option<&Path> {
        self.pin_path.as_deref()
    }

    /// The kernel handle, while the map is open.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.get()
    }

    pub fn is_closed(&self) -> bool {
        self.fd == FdState::Closed
    }

    pub(crate) fn set_pin_path(&mut self, path: PathBuf) {
        self.pin_path = Some(path);
    }

    fn live_fd(&self) -> Result<RawFd> {
        match self.fd {
            FdState::Open(fd) => Ok(fd),
            FdState::Unset => Err(Error::NotCreated {
                name: self.name.clone(),
            }),
            FdState::Closed => Err(Error::AlreadyClosed {
                name: self.name.clone(),
            }),
        }
    }

    fn count_cpus(&self) -> Result<usize> {
        if !self.map_type.is_per_cpu() {
            return Ok(1);
        }
        self.kernel
            .possible_cpus()
            .map_err(|error| Error::Syscall {
                call: "possible_cpus",
                error,
            })
    }

    fn rejected(&self, call: &'static str, error: io::Error) -> Error {
        Error::KernelRejected {
            call,
            name: self.name.clone(),
            error,
        }
    }

    /// Create the map in the kernel.
    ///
    /// A map with a pin path reuses whatever is pinned there, provided it has
    /// the same type and sizes. Creating an open map does nothing.
    pub fn create(&mut self) -> Result<()> {
        match self.fd {
            FdState::Open(_) => return Ok(()),
            FdState::Closed => {
                return Err(Error::AlreadyClosed {
                    name: self.name.clone(),
                })
            }
            FdState::Unset => {}
        }
        self.cpus = self.count_cpus()?;

        if let Some(path) = self.pin_path.clone() {
            if path.exists() {
                return self.open_pinned(&path);
            }
        }

        let inner_fd = if self.map_type.is_map_in_map() {
            let inner = self.inner.clone().ok_or_else(|| FormatError::MissingInnerMap {
                name: self.name.clone(),
            })?;
            let inner_name = format!("{}_inner", self.name);
            let fd = self
                .kernel
                .map_create(&MapAttr {
                    map_type: inner.map_type,
                    name: &inner_name,
                    key_size: inner.key_size,
                    value_size: inner.value_size,
                    max_entries: inner.max_entries,
                    flags: inner.flags,
                    inner_map_fd: None,
                })
                .map_err(|e| self.rejected("BPF_MAP_CREATE", e))?;
            Some(fd)
        } else {
            None
        };

        let res = self.kernel.map_create(&MapAttr {
            map_type: self.map_type,
            name: &self.name,
            key_size: self.key_size as u32,
            value_size: self.value_size as u32,
            max_entries: self.max_entries as u32,
            flags: self.flags,
            inner_map_fd: inner_fd,
        });
        // The template only has to outlive the creation of the outer map.
        if let Some(fd) = inner_fd {
            if let Err(e) = self.kernel.close(fd) {
                warn!("failed to close inner map template of `{}`: {}", self.name, e);
            }
        }
        let fd = res.map_err(|e| self.rejected("BPF_MAP_CREATE", e))?;
        self.fd = FdState::Open(fd);
        debug!(
            "created map `{}` ({:?}, key {} value {} max {}) fd {}",
            self.name, self.map_type, self.key_size, self.value_size, self.max_entries, fd
        );

        if let Some(path) = self.pin_path.clone() {
            self.pin(path)?;
        }
        Ok(())
    }

    fn open_pinned(&mut self, path: &Path) -> Result<()> {
        let fd = self
            .kernel
            .obj_get(path)
            .map_err(|e| self.rejected("BPF_OBJ_GET", e))?;
        let info = match self.kernel.map_info(fd) {
            Ok(info) => info,
            Err(e) => {
                let _ = self.kernel.close(fd);
                return Err(self.rejected("BPF_OBJ_GET_INFO_BY_FD", e));
            }
        };
        if info.map_type != self.map_type as u32
            || info.key_size as usize != self.key_size
            || info.value_size as usize != self.value_size
            || info.max_entries as usize != self.max_entries
        {
            let _ = self.kernel.close(fd);
            let msg = format!(
                "map pinned at {} does not match the definition of `{}`",
                path.display(),
                self.name
            );
            return Err(self.rejected(
                "BPF_OBJ_GET",
                io::Error::new(io::ErrorKind::InvalidData, msg),
            ));
        }
        self.fd = FdState::Open(fd);
        debug!("reusing map `{}` pinned at {}", self.name, path.display());
        Ok(())
    }

    /// What the kernel reports about this map.
    pub fn kernel_info(&self) -> Result<KernelMapInfo> {
        let fd = self.live_fd()?;
        self.kernel
            .map_info(fd)
            .map_err(|error| Error::Syscall {
                call: "BPF_OBJ_GET_INFO_BY_FD",
                error,
            })
    }

    fn encode_key<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<Vec<u8>> {
        let bytes = key
            .to_map_bytes(self.key_size)
            .map_err(|e| self.invalid_key(e))?;
        if self.map_type.is_array() {
            let index = decode_index(&bytes).ok_or_else(|| Error::InvalidKey {
                name: self.name.clone(),
                reason: format!("{}-byte keys are not array indices", self.key_size),
            })?;
            if index as usize >= self.max_entries {
                return Err(self.out_of_range(index as u64));
            }
        }
        Ok(bytes)
    }

    fn invalid_key(&self, e: EncodeError) -> Error {
        Error::InvalidKey {
            name: self.name.clone(),
            reason: e.to_string(),
        }
    }

    fn invalid_value(&self, e: EncodeError) -> Error {
        Error::InvalidValue {
            name: self.name.clone(),
            reason: e.to_string(),
        }
    }

    fn out_of_range(&self, key: u64) -> Error {
        Error::KeyOutOfRange {
            name: self.name.clone(),
            key,
            max_entries: self.max_entries as u32,
        }
    }

    /// Per-CPU values are stored with each CPU's slot rounded up to 8 bytes.
    fn slot_size(&self) -> usize {
        (self.value_size + 7) / 8 * 8
    }

    /// Width of the buffer the kernel reads and writes for one value.
    fn value_buffer_size(&self) -> usize {
        if self.map_type.is_per_cpu() {
            self.slot_size() * self.cpus
        } else {
            self.value_size
        }
    }

    fn encode_value<V: ToMapBytes + ?Sized>(&self, value: &V) -> Result<Vec<u8>> {
        if !self.map_type.is_per_cpu() {
            return value
                .to_map_bytes(self.value_size)
                .map_err(|e| self.invalid_value(e));
        }

        let total = self.value_buffer_size();
        if value.byte_len() == Some(total) {
            return value.to_map_bytes(total).map_err(|e| self.invalid_value(e));
        }
        // One value, written to every CPU's slot.
        let one = value
            .to_map_bytes(self.value_size)
            .map_err(|e| self.invalid_value(e))?;
        let mut buf = vec![0u8; total];
        for slot in buf.chunks_mut(self.slot_size()) {
            slot[..one.len()].copy_from_slice(&one);
        }
        Ok(buf)
    }

    fn write<K, V>(&self, key: &K, value: &V, flags: u64) -> Result<()>
    where
        K: ToMapBytes + ?Sized,
        V: ToMapBytes + ?Sized,
    {
        let fd = self.live_fd()?;
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        // Array slots always exist and the key is already range checked, so
        // the kernel's BPF_ANY-only rule for fd arrays loses nothing.
        let flags = if self.map_type.is_fd_array() {
            if flags == sys::BPF_NOEXIST {
                return Err(Error::KeyExists {
                    name: self.name.clone(),
                });
            }
            sys::BPF_ANY
        } else {
            flags
        };

        self.kernel
            .map_update(fd, &key, &value, flags)
            .map_err(|error| match error.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound {
                    name: self.name.clone(),
                },
                Some(libc::EEXIST) => Error::KeyExists {
                    name: self.name.clone(),
                },
                Some(libc::E2BIG) if self.map_type.is_array() => {
                    self.out_of_range(decode_uint(&key).unwrap_or_default())
                }
                _ => Error::Syscall {
                    call: "BPF_MAP_UPDATE_ELEM",
                    error,
                },
            })
    }

    /// Add a new entry. Fails with [`Error::KeyExists`] if the key is present.
    pub fn insert<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: ToMapBytes + ?Sized,
        V: ToMapBytes + ?Sized,
    {
        self.write(key, value, sys::BPF_NOEXIST)
    }

    /// Overwrite an existing entry. Fails with [`Error::NotFound`] if the key
    /// is absent; array slots always exist.
    ///
    /// For program arrays the value is a program's fd, for map-in-map types a
    /// map's fd.
    pub fn update<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: ToMapBytes + ?Sized,
        V: ToMapBytes + ?Sized,
    {
        self.write(key, value, sys::BPF_EXIST)
    }

    /// Insert or overwrite.
    pub fn upsert<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: ToMapBytes + ?Sized,
        V: ToMapBytes + ?Sized,
    {
        self.write(key, value, sys::BPF_ANY)
    }

    /// Raw value bytes. For per-CPU maps this is every CPU's slot, back to back.
    pub fn lookup<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<Vec<u8>> {
        let fd = self.live_fd()?;
        let key = self.encode_key(key)?;
        self.lookup_raw(fd, &key)
    }

    fn lookup_raw(&self, fd: RawFd, key: &[u8]) -> Result<Vec<u8>> {
        self.kernel
            .map_lookup(fd, key, self.value_buffer_size())
            .map_err(|error| match error.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound {
                    name: self.name.clone(),
                },
                _ => Error::Syscall {
                    call: "BPF_MAP_LOOKUP_ELEM",
                    error,
                },
            })
    }

    /// The value decoded as an unsigned integer of the map's value size.
    pub fn lookup_int<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<u64> {
        if self.map_type.is_per_cpu() {
            return Err(Error::UnsupportedOperation {
                name: self.name.clone(),
                operation: "lookup_int",
                map_type: Some(self.map_type),
            });
        }
        let value = self.lookup(key)?;
        decode_uint(&value).map_err(|e| self.invalid_value(e))
    }

    /// The value read as text, up to the first NUL.
    pub fn lookup_string<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<String> {
        let value = self.lookup(key)?;
        let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
        Ok(String::from_utf8_lossy(&value[..end]).into_owned())
    }

    /// One value per possible CPU. Only for per-CPU maps.
    pub fn lookup_per_cpu<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<Vec<Vec<u8>>> {
        if !self.map_type.is_per_cpu() {
            return Err(Error::UnsupportedOperation {
                name: self.name.clone(),
                operation: "lookup_per_cpu",
                map_type: Some(self.map_type),
            });
        }
        let value = self.lookup(key)?;
        Ok(value
            .chunks(self.slot_size())
            .map(|slot| slot[..self.value_size].to_vec())
            .collect())
    }

    /// Remove an entry. Array slots cannot be deleted.
    pub fn delete<K: ToMapBytes + ?Sized>(&self, key: &K) -> Result<()> {
        let fd = self.live_fd()?;
        if self.map_type.is_array() {
            return Err(Error::UnsupportedOperation {
                name: self.name.clone(),
                operation: "delete",
                map_type: Some(self.map_type),
            });
        }
        let key = self.encode_key(key)?;

        self.kernel
            .map_delete(fd, &key)
            .map_err(|error| match error.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound {
                    name: self.name.clone(),
                },
                _ => Error::Syscall {
                    call: "BPF_MAP_DELETE_ELEM",
                    error,
                },
            })
    }

    /// The key following `key`, or the first key when `key` is `None`.
    pub fn get_next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let fd = self.live_fd()?;
        if let Some(key) = key {
            if key.len() != self.key_size {
                return Err(Error::InvalidKey {
                    name: self.name.clone(),
                    reason: format!("expected {} bytes, got {}", self.key_size, key.len()),
                });
            }
        }
        self.kernel
            .map_next_key(fd, key, self.key_size)
            .map_err(|error| Error::Syscall {
                call: "BPF_MAP_GET_NEXT_KEY",
                error,
            })
    }

    pub fn keys(&self) -> MapKeys<'_> {
        MapKeys {
            map: self,
            key: None,
            done: false,
        }
    }

    pub fn iter(&self) -> MapIterator<'_> {
        MapIterator { keys: self.keys() }
    }

    /// Pin the map to `path` on the BPF filesystem.
    pub fn pin<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let fd = self.live_fd()?;

        self.kernel
            .obj_pin(fd, path)
            .map_err(|error| Error::Syscall {
                call: "BPF_OBJ_PIN",
                error,
            })?;
        debug!("pinned map `{}` at {}", self.name, path.display());
        self.pin_path = Some(path.to_owned());
        Ok(())
    }

    /// Remove the pin path. The map itself stays open.
    pub fn unpin(&mut self) -> Result<()> {
        let path = self.pin_path.take().ok_or_else(|| Error::NotPinned {
            name: self.name.clone(),
        })?;
        if let Err(error) = fs::remove_file(&path) {
            self.pin_path = Some(path.clone());
            return Err(Error::File { path, error });
        }
        debug!("unpinned map `{}` from {}", self.name, path.display());
        Ok(())
    }

    /// Release the kernel handle. Pins survive.
    pub fn close(&mut self) -> Result<()> {
        match self.fd {
            FdState::Closed => Err(Error::AlreadyClosed {
                name: self.name.clone(),
            }),
            FdState::Unset => {
                self.fd = FdState::Closed;
                Ok(())
            }
            FdState::Open(fd) => {
                self.fd = FdState::Closed;
                self.kernel.close(fd).map_err(|error| Error::Syscall {
                    call: "close",
                    error,
                })?;
                debug!("closed map `{}` (fd {})", self.name, fd);
                Ok(())
            }
        }
    }
}

/// Iterates over the keys of a map.
pub struct MapKeys<'a> {
    map: &'a Map,
    key: Option<Vec<u8>>,
    done: bool,
}

impl<'a> Iterator for MapKeys<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.map.get_next_key(self.key.as_deref()) {
            Ok(Some(key)) => {
                self.key = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterates over the entries of a map.
pub struct MapIterator<'a> {
    keys: MapKeys<'a>,
}

impl<'a> IntoIterator for &'a Map {
    type Item = Result<(Vec<u8>, Vec<u8>)>;
    type IntoIter = MapIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> Iterator for MapIterator<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = match self.keys.next()? {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            let map = self.keys.map;
            let fd = match map.live_fd() {
                Ok(fd) => fd,
                Err(e) => return Some(Err(e)),
            };
            match map.lookup_raw(fd, &key) {
                Ok(value) => return Some(Ok((key, value))),
                // Deleted between get_next_key and lookup.
                Err(Error::NotFound { .. }) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
