//! An in-memory kernel and an object file builder for tests.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io;
use std::ops::Bound;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bpfload_sys as sys;
use object::write::{Object, Relocation, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use crate::bpf::{Kernel, KernelMapInfo, KernelProgInfo, MapAttr, ProgAttr};
use crate::map::MapType;
use crate::prog::ProgType;
use crate::utils::boot_time_ns;

pub const FAKE_CPUS: usize = 2;

const LOOPBACK: u32 = 1;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handle {
    Map(u32),
    Prog(u32),
    Link(u32),
}

#[derive(Debug)]
struct FakeMap {
    info: KernelMapInfo,
    map_type: MapType,
    value_len: usize,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    next_fd: RawFd,
    next_id: u32,
    fds: HashMap<RawFd, Handle>,
    maps: HashMap<u32, FakeMap>,
    progs: HashMap<u32, KernelProgInfo>,
    pins: HashMap<PathBuf, Handle>,
}

impl State {
    fn open(&mut self, handle: Handle) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, handle);
        fd
    }

    fn id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn handle(&self, fd: RawFd) -> io::Result<Handle> {
        self.fds.get(&fd).copied().ok_or_else(|| errno(libc::EBADF))
    }

    fn map(&mut self, fd: RawFd) -> io::Result<&mut FakeMap> {
        match self.handle(fd)? {
            Handle::Map(id) => self.maps.get_mut(&id).ok_or_else(|| errno(libc::EBADF)),
            _ => Err(errno(libc::EINVAL)),
        }
    }
}

/// Enough of the kernel's map, program and link semantics to exercise the
/// crate without privileges.
#[derive(Debug)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> FakeKernel {
        FakeKernel {
            state: Mutex::new(State {
                next_fd: 3,
                ..Default::default()
            }),
        }
    }

    /// Number of fds currently open, of any kind.
    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().fds.len()
    }

    /// Number of maps ever created.
    pub fn created_maps(&self) -> usize {
        self.state.lock().unwrap().maps.len()
    }

    /// Make the map behind `fd` report a raw type number, e.g. one newer
    /// than `MapType` knows.
    pub fn set_raw_map_type(&self, fd: RawFd, map_type: u32) {
        self.state.lock().unwrap().map(fd).unwrap().info.map_type = map_type;
    }
}

fn kernel_name(name: &str) -> String {
    name.chars().take(sys::BPF_OBJ_NAME_LEN - 1).collect()
}

fn value_len(map_type: MapType, value_size: u32) -> usize {
    if map_type.is_per_cpu() {
        (value_size as usize + 7) / 8 * 8 * FAKE_CPUS
    } else {
        value_size as usize
    }
}

fn index(key: &[u8]) -> u32 {
    u32::from_ne_bytes([key[0], key[1], key[2], key[3]])
}

fn gpl_compatible(license: &str) -> bool {
    matches!(
        license,
        "GPL" | "GPL v2" | "GPL and additional rights" | "Dual BSD/GPL" | "Dual MIT/GPL"
            | "Dual MPL/GPL"
    )
}

impl Kernel for FakeKernel {
    fn map_create(&self, attr: &MapAttr) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        let map_type = attr.map_type;

        if attr.key_size == 0 || attr.value_size == 0 || attr.max_entries == 0 {
            return Err(errno(libc::EINVAL));
        }
        if map_type.is_array() && attr.key_size != 4 {
            return Err(errno(libc::EINVAL));
        }
        let holds_fds = matches!(
            map_type,
            MapType::ProgArray | MapType::ArrayOfMaps | MapType::HashOfMaps
        );
        if holds_fds && attr.value_size != 4 {
            return Err(errno(libc::EINVAL));
        }
        if map_type.is_map_in_map() {
            match attr.inner_map_fd.map(|fd| state.handle(fd)) {
                Some(Ok(Handle::Map(_))) => {}
                _ => return Err(errno(libc::EBADF)),
            }
        }

        let value_len = value_len(map_type, attr.value_size);
        let mut entries = BTreeMap::new();
        // Slots of fd arrays stay empty until something is stored.
        if map_type.is_array() && !map_type.is_fd_array() {
            for i in 0..attr.max_entries {
                entries.insert(i.to_ne_bytes().to_vec(), vec![0u8; value_len]);
            }
        }
        let id = state.id();
        state.maps.insert(
            id,
            FakeMap {
                info: KernelMapInfo {
                    name: kernel_name(attr.name),
                    map_type: map_type as u32,
                    id,
                    key_size: attr.key_size,
                    value_size: attr.value_size,
                    max_entries: attr.max_entries,
                    flags: attr.flags,
                },
                map_type,
                value_len,
                entries,
            },
        );
        Ok(state.open(Handle::Map(id)))
    }

    fn map_lookup(&self, fd: RawFd, key: &[u8], value_size: usize) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let map = state.map(fd)?;
        if key.len() != map.info.key_size as usize || value_size != map.value_len {
            return Err(errno(libc::EINVAL));
        }
        map.entries.get(key).cloned().ok_or_else(|| errno(libc::ENOENT))
    }

    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let map_type = match state.handle(fd)? {
            Handle::Map(id) => state.maps[&id].map_type,
            _ => return Err(errno(libc::EINVAL)),
        };

        // Handles stored in maps are kept as object ids.
        let stored = match map_type {
            MapType::ProgArray if value.len() == 4 => match state.handle(index(value) as RawFd)? {
                Handle::Prog(id) => id.to_ne_bytes().to_vec(),
                _ => return Err(errno(libc::EINVAL)),
            },
            MapType::ArrayOfMaps | MapType::HashOfMaps if value.len() == 4 => {
                match state.handle(index(value) as RawFd)? {
                    Handle::Map(id) => id.to_ne_bytes().to_vec(),
                    _ => return Err(errno(libc::EINVAL)),
                }
            }
            _ => value.to_vec(),
        };

        let map = state.map(fd)?;
        if key.len() != map.info.key_size as usize || value.len() != map.value_len {
            return Err(errno(libc::EINVAL));
        }
        let exists = map.entries.contains_key(key);
        if map_type.is_fd_array() && flags != sys::BPF_ANY {
            return Err(errno(libc::EINVAL));
        }
        if map_type.is_array() {
            if index(key) >= map.info.max_entries {
                return Err(errno(libc::E2BIG));
            }
            if flags == sys::BPF_NOEXIST {
                return Err(errno(libc::EEXIST));
            }
        } else {
            if flags == sys::BPF_EXIST && !exists {
                return Err(errno(libc::ENOENT));
            }
            if flags == sys::BPF_NOEXIST && exists {
                return Err(errno(libc::EEXIST));
            }
            if !exists && map.entries.len() >= map.info.max_entries as usize {
                return Err(errno(libc::E2BIG));
            }
        }
        map.entries.insert(key.to_vec(), stored);
        Ok(())
    }

    fn map_delete(&self, fd: RawFd, key: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let map = state.map(fd)?;
        if map.map_type.is_array() {
            return Err(errno(libc::EINVAL));
        }
        map.entries.remove(key).map(|_| ()).ok_or_else(|| errno(libc::ENOENT))
    }

    fn map_next_key(
        &self,
        fd: RawFd,
        key: Option<&[u8]>,
        _key_size: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        let map = state.map(fd)?;
        let next = match key {
            None => map.entries.keys().next(),
            Some(key) => map
                .entries
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .map(|(k, _)| k)
                .next(),
        };
        Ok(next.cloned())
    }

    fn prog_load(&self, attr: &ProgAttr, log: Option<&mut [u8]>) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        let insns = attr.insns;

        let reject = |log: Option<&mut [u8]>, msg: &str| {
            if let Some(log) = log {
                let n = msg.len().min(log.len().saturating_sub(1));
                log[..n].copy_from_slice(&msg.as_bytes()[..n]);
            }
            errno(libc::EACCES)
        };
        if insns.is_empty() || insns.len() % 8 != 0 {
            return Err(errno(libc::EINVAL));
        }
        if insns[insns.len() - 8] != sys::BPF_EXIT_INSN {
            return Err(reject(log, "last insn is not an exit or jmp\n"));
        }

        let mut map_ids = Vec::new();
        for (i, insn) in insns.chunks_exact(8).enumerate() {
            if insn[0] == sys::BPF_LD_IMM64 && insn[1] >> 4 == sys::BPF_PSEUDO_MAP_FD {
                let fd = i32::from_ne_bytes([insn[4], insn[5], insn[6], insn[7]]);
                match state.handle(fd) {
                    Ok(Handle::Map(id)) => {
                        if !map_ids.contains(&id) {
                            map_ids.push(id);
                        }
                    }
                    _ => {
                        let msg = format!("{}: fd {} is not pointing to valid bpf_map\n", i, fd);
                        return Err(reject(log, &msg));
                    }
                }
            }
        }

        let mut tag = [0u8; 8];
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in insns {
            hash = (hash ^ *b as u64).wrapping_mul(0x100_0000_01b3);
        }
        tag.copy_from_slice(&hash.to_be_bytes());

        let id = state.id();
        state.progs.insert(
            id,
            KernelProgInfo {
                name: kernel_name(attr.name),
                prog_type: attr.prog_type as u32,
                id,
                tag,
                jited_len: insns.len() as u32 * 2,
                xlated_len: insns.len() as u32,
                load_time: boot_time_ns(),
                gpl_compatible: gpl_compatible(attr.license),
                map_ids,
            },
        );
        Ok(state.open(Handle::Prog(id)))
    }

    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.handle(fd)?;
        if let Handle::Link(_) = handle {
            return Err(errno(libc::EINVAL));
        }
        OpenOptions::new().write(true).create_new(true).open(path)?;
        state.pins.insert(path.to_owned(), handle);
        Ok(())
    }

    fn obj_get(&self, path: &Path) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        if !path.exists() {
            return Err(errno(libc::ENOENT));
        }
        let handle = state
            .pins
            .get(path)
            .copied()
            .ok_or_else(|| errno(libc::EPERM))?;
        Ok(state.open(handle))
    }

    fn xdp_attach(&self, prog_fd: RawFd, ifindex: u32, _flags: u32) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        let id = match state.handle(prog_fd)? {
            Handle::Prog(id) => id,
            _ => return Err(errno(libc::EINVAL)),
        };
        if ifindex != LOOPBACK {
            return Err(errno(libc::ENODEV));
        }
        if state.progs[&id].prog_type != ProgType::XDP as u32 {
            return Err(errno(libc::EINVAL));
        }
        Ok(state.open(Handle::Link(id)))
    }

    fn if_index(&self, iface: &str) -> Option<u32> {
        match iface {
            "lo" => Some(LOOPBACK),
            _ => None,
        }
    }

    fn prog_info(&self, fd: RawFd) -> io::Result<KernelProgInfo> {
        let state = self.state.lock().unwrap();
        match state.handle(fd)? {
            Handle::Prog(id) => Ok(state.progs[&id].clone()),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn map_info(&self, fd: RawFd) -> io::Result<KernelMapInfo> {
        let mut state = self.state.lock().unwrap();
        state.map(fd).map(|map| map.info.clone())
    }

    fn prog_fd_by_id(&self, id: u32) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        if !state.progs.contains_key(&id) {
            return Err(errno(libc::ENOENT));
        }
        Ok(state.open(Handle::Prog(id)))
    }

    fn map_fd_by_id(&self, id: u32) -> io::Result<RawFd> {
        let mut state = self.state.lock().unwrap();
        if !state.maps.contains_key(&id) {
            return Err(errno(libc::ENOENT));
        }
        Ok(state.open(Handle::Map(id)))
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.fds.remove(&fd).map(|_| ()).ok_or_else(|| errno(libc::EBADF))
    }

    fn possible_cpus(&self) -> io::Result<usize> {
        Ok(FAKE_CPUS)
    }
}

/// `r0 = 2; exit`, an XDP program that passes every packet.
pub fn pass_program() -> Vec<u8> {
    let mut insns = vec![0xb7, 0x00, 0, 0, 2, 0, 0, 0];
    insns.extend_from_slice(&[sys::BPF_EXIT_INSN, 0, 0, 0, 0, 0, 0, 0]);
    insns
}

/// `maps` 64-bit map loads into r1, followed by [`pass_program`]. The
/// loads start at instruction 0, 2, 4, ...
pub fn map_program(maps: usize) -> Vec<u8> {
    let mut insns = Vec::new();
    for _ in 0..maps {
        insns.extend_from_slice(&[sys::BPF_LD_IMM64, 0x01, 0, 0, 0, 0, 0, 0]);
        insns.extend_from_slice(&[0; 8]);
    }
    insns.extend(pass_program());
    insns
}

pub struct MapSpec {
    name: &'static str,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    inner: Option<&'static str>,
    pin: Option<&'static str>,
}

impl MapSpec {
    pub fn new(name: &'static str, map_type: MapType, key: u32, value: u32, max: u32) -> MapSpec {
        MapSpec::raw(name, map_type as u32, key, value, max)
    }

    pub fn raw(name: &'static str, map_type: u32, key: u32, value: u32, max: u32) -> MapSpec {
        MapSpec {
            name,
            map_type,
            key_size: key,
            value_size: value,
            max_entries: max,
            flags: 0,
            inner: None,
            pin: None,
        }
    }

    pub fn flags(mut self, flags: u32) -> MapSpec {
        self.flags = flags;
        self
    }

    pub fn inner(mut self, inner: &'static str) -> MapSpec {
        self.inner = Some(inner);
        self
    }

    pub fn pin(mut self, path: &'static str) -> MapSpec {
        self.pin = Some(path);
        self
    }
}

struct ProgSpec {
    name: Option<&'static str>,
    section: &'static str,
    insns: Vec<u8>,
    relocs: Vec<(usize, &'static str)>,
}

/// Writes little-endian BPF relocatable objects the way clang lays them out.
pub struct ObjectBuilder {
    license: Option<&'static str>,
    version: Option<u32>,
    record_size: usize,
    maps: Vec<MapSpec>,
    progs: Vec<ProgSpec>,
}

impl ObjectBuilder {
    pub fn new() -> ObjectBuilder {
        ObjectBuilder {
            license: Some("GPL"),
            version: None,
            record_size: 40,
            maps: Vec::new(),
            progs: Vec::new(),
        }
    }

    pub fn license(mut self, license: &'static str) -> ObjectBuilder {
        self.license = Some(license);
        self
    }

    pub fn without_license(mut self) -> ObjectBuilder {
        self.license = None;
        self
    }

    pub fn version(mut self, version: u32) -> ObjectBuilder {
        self.version = Some(version);
        self
    }

    /// Size of each record in the `maps` section.
    pub fn record_size(mut self, size: usize) -> ObjectBuilder {
        self.record_size = size;
        self
    }

    pub fn map(mut self, map: MapSpec) -> ObjectBuilder {
        self.maps.push(map);
        self
    }

    /// A function symbol `name` in `section`. Each relocation names the
    /// instruction index and the symbol it refers to.
    pub fn program(
        mut self,
        name: &'static str,
        section: &'static str,
        insns: Vec<u8>,
        relocs: &[(usize, &'static str)],
    ) -> ObjectBuilder {
        self.progs.push(ProgSpec {
            name: Some(name),
            section,
            insns,
            relocs: relocs.to_vec(),
        });
        self
    }

    /// Code in `section` without any function symbol.
    pub fn section_program(mut self, section: &'static str, insns: Vec<u8>) -> ObjectBuilder {
        self.progs.push(ProgSpec {
            name: None,
            section,
            insns,
            relocs: Vec::new(),
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
        let mut symbols: HashMap<&'static str, SymbolId> = HashMap::new();
        let symbol = |name: &str, value: u64, size: u64, kind: SymbolKind, section| Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        };
        let flags = RelocationFlags::Elf {
            r_type: object::elf::R_BPF_64_64,
        };

        if let Some(license) = self.license {
            let section = obj.add_section(Vec::new(), b"license".to_vec(), SectionKind::Data);
            let mut data = license.as_bytes().to_vec();
            data.push(0);
            obj.append_section_data(section, &data, 1);
        }
        if let Some(version) = self.version {
            let section = obj.add_section(Vec::new(), b"version".to_vec(), SectionKind::Data);
            obj.append_section_data(section, &version.to_le_bytes(), 4);
        }

        let mut records = Vec::new();
        if !self.maps.is_empty() {
            let section = obj.add_section(Vec::new(), b"maps".to_vec(), SectionKind::Data);
            for map in &self.maps {
                let mut record = [0u8; 40];
                let fields = [
                    map.map_type,
                    map.key_size,
                    map.value_size,
                    map.max_entries,
                    map.flags,
                ];
                for (i, field) in fields.iter().enumerate() {
                    record[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
                }
                let offset = obj.append_section_data(section, &record[..self.record_size], 4);
                let id = obj.add_symbol(symbol(
                    map.name,
                    offset,
                    self.record_size as u64,
                    SymbolKind::Data,
                    section,
                ));
                symbols.insert(map.name, id);
                records.push((section, offset));
            }
        }

        let mut sections = HashMap::new();
        let mut placed = Vec::new();
        for prog in &self.progs {
            let section = *sections.entry(prog.section).or_insert_with(|| {
                obj.add_section(Vec::new(), prog.section.as_bytes().to_vec(), SectionKind::Text)
            });
            let offset = obj.append_section_data(section, &prog.insns, 8);
            if let Some(name) = prog.name {
                let id = obj.add_symbol(symbol(
                    name,
                    offset,
                    prog.insns.len() as u64,
                    SymbolKind::Text,
                    section,
                ));
                symbols.insert(name, id);
            }
            placed.push((section, offset));
        }

        let strings = obj.add_section(
            Vec::new(),
            b".rodata.str1.1".to_vec(),
            SectionKind::ReadOnlyString,
        );
        for (map, (section, offset)) in self.maps.iter().zip(&records) {
            if self.record_size < 40 {
                continue;
            }
            if let Some(inner) = map.inner {
                let target = symbol_or_undefined(&mut obj, &mut symbols, inner);
                obj.add_relocation(
                    *section,
                    Relocation {
                        offset: offset + 24,
                        symbol: target,
                        addend: 0,
                        flags,
                    },
                )
                .unwrap();
            }
            if let Some(path) = map.pin {
                let mut data = path.as_bytes().to_vec();
                data.push(0);
                let at = obj.append_section_data(strings, &data, 1);
                let name = format!(".L{}.path", map.name);
                let target = obj.add_symbol(symbol(name.as_str(), at, data.len() as u64, SymbolKind::Data, strings));
                obj.add_relocation(
                    *section,
                    Relocation {
                        offset: offset + 32,
                        symbol: target,
                        addend: 0,
                        flags,
                    },
                )
                .unwrap();
            }
        }

        for (prog, (section, offset)) in self.progs.iter().zip(&placed) {
            for (insn, name) in &prog.relocs {
                let target = symbol_or_undefined(&mut obj, &mut symbols, name);
                obj.add_relocation(
                    *section,
                    Relocation {
                        offset: offset + (*insn as u64) * 8,
                        symbol: target,
                        addend: 0,
                        flags,
                    },
                )
                .unwrap();
            }
        }

        obj.write().unwrap()
    }
}

fn symbol_or_undefined(
    obj: &mut Object<'_>,
    symbols: &mut HashMap<&'static str, SymbolId>,
    name: &'static str,
) -> SymbolId {
    if let Some(id) = symbols.get(name) {
        return *id;
    }
    let id = obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    symbols.insert(name, id);
    id
}

/// Six maps and four XDP programs:
///
/// * `txcnt`: per-CPU array 4/8/100, pinned at `txcnt`
/// * `rxcnt`: hash 8/4/50
/// * `match_maps_tx`: array of maps 4/4/10, holding maps shaped like `array_map`
/// * `match_maps_rx`: hash of maps 4/4/20, pinned at `match_maps_rx`
/// * `programs`: program array 4/4/2
/// * `array_map`: array 4/8/4
///
/// `xdp0` loads `rxcnt` and `txcnt`, `xdp1` loads `programs`,
/// `xdp_head_meta2` loads `match_maps_tx` and `xdp_root3` uses no maps.
pub fn scenario_object() -> Vec<u8> {
    ObjectBuilder::new()
        .license("GPLv2")
        .map(MapSpec::new("txcnt", MapType::PerCPUArray, 4, 8, 100).pin("txcnt"))
        .map(MapSpec::new("rxcnt", MapType::Hash, 8, 4, 50))
        .map(MapSpec::new("match_maps_tx", MapType::ArrayOfMaps, 4, 4, 10).inner("array_map"))
        .map(
            MapSpec::new("match_maps_rx", MapType::HashOfMaps, 4, 4, 20)
                .inner("array_map")
                .pin("match_maps_rx"),
        )
        .map(MapSpec::new("programs", MapType::ProgArray, 4, 4, 2))
        .map(MapSpec::new("array_map", MapType::Array, 4, 8, 4))
        .program("xdp0", "xdp", map_program(2), &[(0, "rxcnt"), (2, "txcnt")])
        .program("xdp1", "xdp", map_program(1), &[(0, "programs")])
        .program(
            "xdp_head_meta2",
            "xdp_head_meta",
            map_program(1),
            &[(0, "match_maps_tx")],
        )
        .program("xdp_root3", "xdp_root", pass_program(), &[])
        .build()
}
