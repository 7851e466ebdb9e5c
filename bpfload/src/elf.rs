//! Reading programs and map definitions out of an eBPF object file.
//!
//! Nothing here talks to the kernel. [`ObjectFile::parse`] turns the bytes of
//! a compiled object into plain definitions that the rest of the crate
//! creates and loads.

use std::collections::HashMap;
use std::path::PathBuf;

use object::{
    Endianness, Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex,
    SectionKind, SymbolKind,
};

use crate::error::FormatError;
use crate::map::MapType;
use crate::prog::ProgType;
use crate::utils::cstr_prefix;

/// `version` section value meaning "any kernel".
pub const KERNEL_VERSION_ANY: u32 = 0xFFFF_FFFE;

const INSN_SIZE: usize = 8;
const MAP_DEF_MIN_SIZE: usize = 20;
const MAP_DEF_SIZE: usize = 40;
const INNER_MAP_FIELD: u64 = 24;
const PIN_PATH_FIELD: u64 = 32;

/// Shape of the maps a map-in-map accepts as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMapDefinition {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDefinition {
    pub name: String,
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub inner: Option<InnerMapDefinition>,
    pub pin_path: Option<PathBuf>,
}

/// An instruction that loads the address of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Index of the instruction in the program, in 8-byte units.
    pub insn_index: usize,
    pub map: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDefinition {
    pub name: String,
    pub prog_type: ProgType,
    pub section: String,
    pub license: String,
    pub insns: Vec<u8>,
    /// Ordered by instruction index.
    pub relocations: Vec<Relocation>,
}

/// The parsed contents of an object file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub license: String,
    /// `None` when the file has no `version` section or accepts any kernel.
    pub kernel_version: Option<u32>,
    /// In the order they appear in the `maps` section.
    pub maps: Vec<MapDefinition>,
    /// By section, then by offset within the section.
    pub programs: Vec<ProgramDefinition>,
}

impl ObjectFile {
    pub fn parse(data: &[u8]) -> Result<ObjectFile, FormatError> {
        let obj = object::File::parse(data).map_err(FormatError::Elf)?;
        let endianness = obj.endianness();

        let license = match obj.section_by_name("license") {
            Some(section) => parse_license(section_data(&section)?)?,
            None => "GPL".to_owned(),
        };
        let kernel_version = match obj.section_by_name("version") {
            Some(section) => parse_version(section_data(&section)?, endianness)?,
            None => None,
        };

        let (maps_index, records) = match obj.section_by_name("maps") {
            Some(section) => (Some(section.index()), parse_maps(&obj, &section, endianness)?),
            None => (None, Vec::new()),
        };

        let mut programs = Vec::new();
        for section in obj.sections() {
            if section.kind() != SectionKind::Text {
                continue;
            }
            let name = section.name().map_err(|error| FormatError::Section {
                section: format!("#{}", section.index().0),
                error,
            })?;
            if name == ".text" {
                continue;
            }
            let prog_type = match ProgType::from_section_name(name) {
                Some(prog_type) => prog_type,
                None => continue,
            };
            let ctx = ProgramSection {
                name,
                prog_type,
                license: &license,
                maps_index,
                records: &records,
                endianness,
            };
            programs.extend(ctx.parse(&obj, &section)?);
        }

        Ok(ObjectFile {
            license,
            kernel_version,
            maps: records.into_iter().map(|r| r.def).collect(),
            programs,
        })
    }
}

fn section_data<'data, S: ObjectSection<'data>>(section: &S) -> Result<&'data [u8], FormatError> {
    section.data().map_err(|error| FormatError::Section {
        section: section.name().unwrap_or("?").to_owned(),
        error,
    })
}

fn parse_license(data: &[u8]) -> Result<String, FormatError> {
    cstr_prefix(data)
        .filter(|license| !license.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| FormatError::InvalidLicense {
            data: data.to_vec(),
        })
}

fn parse_version(data: &[u8], endianness: Endianness) -> Result<Option<u32>, FormatError> {
    if data.len() != 4 {
        return Err(FormatError::InvalidKernelVersion {
            data: data.to_vec(),
        });
    }
    let v = read_u32(data, 0, endianness);
    Ok(if v == KERNEL_VERSION_ANY { None } else { Some(v) })
}

fn read_u32(data: &[u8], offset: usize, endianness: Endianness) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    match endianness {
        Endianness::Big => u32::from_be_bytes(buf),
        Endianness::Little => u32::from_le_bytes(buf),
    }
}

/// Named symbols of `index`, sorted by address, with the byte range each
/// covers. Symbols without a size extend to the next symbol.
fn symbol_ranges<'data>(
    obj: &object::File<'data>,
    index: SectionIndex,
    len: usize,
    kind: Option<SymbolKind>,
) -> Vec<(u64, u64, String)> {
    let mut symbols: Vec<(u64, u64, String)> = obj
        .symbols()
        .filter(|s| s.section_index() == Some(index))
        .filter(|s| s.kind() != SymbolKind::Section && kind.map_or(true, |k| s.kind() == k))
        .filter_map(|s| match s.name() {
            Ok(name) if !name.is_empty() => Some((s.address(), s.size(), name.to_owned())),
            _ => None,
        })
        .collect();
    symbols.sort_by_key(|(address, _, _)| *address);
    symbols.dedup_by_key(|(address, _, _)| *address);

    let starts: Vec<u64> = symbols.iter().map(|(address, _, _)| *address).collect();
    symbols
        .into_iter()
        .enumerate()
        .map(|(i, (start, size, name))| {
            let end = if size > 0 {
                start + size
            } else {
                starts.get(i + 1).copied().unwrap_or(len as u64)
            };
            (start, end, name)
        })
        .collect()
}

/// Where a relocation points: a section and an offset into it.
struct Target {
    section: SectionIndex,
    address: u64,
}

fn resolve_target<'data>(
    obj: &object::File<'data>,
    section: &str,
    offset: u64,
    reloc: &object::Relocation,
    implicit_addend: i64,
) -> Result<Target, FormatError> {
    let index = match reloc.target() {
        RelocationTarget::Symbol(index) => index,
        _ => {
            return Err(FormatError::UnsupportedRelocation {
                section: section.to_owned(),
                offset,
            })
        }
    };
    let unknown = || FormatError::UnknownSymbol {
        section: section.to_owned(),
        offset,
    };
    let symbol = obj.symbol_by_index(index).map_err(|_| unknown())?;
    let target = symbol.section_index().ok_or_else(unknown)?;

    let addend = if reloc.has_implicit_addend() {
        implicit_addend
    } else {
        reloc.addend()
    };
    Ok(Target {
        section: target,
        address: symbol.address().wrapping_add(addend as u64),
    })
}

/// A map definition together with its position in the `maps` section.
struct MapRecord {
    offset: u64,
    def: MapDefinition,
}

fn parse_maps<'data>(
    obj: &object::File<'data>,
    section: &object::Section<'data, '_>,
    endianness: Endianness,
) -> Result<Vec<MapRecord>, FormatError> {
    let data = section_data(section)?;
    let index = section.index();

    struct Raw {
        offset: u64,
        len: u64,
        name: String,
        fields: [u32; 5],
    }

    let mut raws = Vec::new();
    for (start, end, name) in symbol_ranges(obj, index, data.len(), None) {
        let len = end.saturating_sub(start) as usize;
        if len < MAP_DEF_MIN_SIZE || end as usize > data.len() {
            return Err(FormatError::InvalidMapDefinition { name, size: len });
        }
        let mut record = [0u8; MAP_DEF_SIZE];
        let len = len.min(MAP_DEF_SIZE);
        record[..len].copy_from_slice(&data[start as usize..start as usize + len]);

        let mut fields = [0u32; 5];
        for (i, field) in fields.iter_mut().enumerate() {
            *field = read_u32(&record, i * 4, endianness);
        }
        raws.push(Raw {
            offset: start,
            len: len as u64,
            name,
            fields,
        });
    }

    let mut inner_refs = HashMap::new();
    let mut pin_paths = HashMap::new();
    for (offset, reloc) in section.relocations() {
        let unsupported = || FormatError::UnsupportedRelocation {
            section: "maps".to_owned(),
            offset,
        };
        let raw = raws
            .iter()
            .find(|r| offset >= r.offset && offset < r.offset + r.len)
            .ok_or_else(unsupported)?;

        let implicit = data
            .get(offset as usize..offset as usize + 8)
            .map_or(0, |b| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                match endianness {
                    Endianness::Big => i64::from_be_bytes(buf),
                    Endianness::Little => i64::from_le_bytes(buf),
                }
            });
        let target = resolve_target(obj, "maps", offset, &reloc, implicit)?;

        match offset - raw.offset {
            INNER_MAP_FIELD => {
                if target.section != index {
                    return Err(unsupported());
                }
                inner_refs.insert(raw.offset, target.address);
            }
            PIN_PATH_FIELD => {
                let invalid = || FormatError::InvalidPinPath {
                    name: raw.name.clone(),
                };
                let strings = obj.section_by_index(target.section).map_err(|_| invalid())?;
                let strings = section_data(&strings)?;
                let path = strings
                    .get(target.address as usize..)
                    .and_then(cstr_prefix)
                    .filter(|path| !path.is_empty())
                    .ok_or_else(invalid)?;
                pin_paths.insert(raw.offset, PathBuf::from(path));
            }
            _ => return Err(unsupported()),
        }
    }

    let map_type = |raw: &Raw| {
        MapType::try_from(raw.fields[0]).map_err(|map_type| FormatError::UnknownMapType {
            name: raw.name.clone(),
            map_type,
        })
    };

    let mut records = Vec::with_capacity(raws.len());
    for raw in &raws {
        let inner = match inner_refs.get(&raw.offset) {
            Some(address) => {
                let inner = raws
                    .iter()
                    .find(|r| r.offset == *address)
                    .ok_or_else(|| FormatError::MissingInnerMap {
                        name: raw.name.clone(),
                    })?;
                Some(InnerMapDefinition {
                    map_type: map_type(inner)?,
                    key_size: inner.fields[1],
                    value_size: inner.fields[2],
                    max_entries: inner.fields[3],
                    flags: inner.fields[4],
                })
            }
            None => None,
        };

        let def = MapDefinition {
            name: raw.name.clone(),
            map_type: map_type(raw)?,
            key_size: raw.fields[1],
            value_size: raw.fields[2],
            max_entries: raw.fields[3],
            flags: raw.fields[4],
            inner,
            pin_path: pin_paths.remove(&raw.offset),
        };
        if def.map_type.is_map_in_map() && def.inner.is_none() {
            return Err(FormatError::MissingInnerMap { name: def.name });
        }
        records.push(MapRecord {
            offset: raw.offset,
            def,
        });
    }
    Ok(records)
}

struct ProgramSection<'a> {
    name: &'a str,
    prog_type: ProgType,
    license: &'a str,
    maps_index: Option<SectionIndex>,
    records: &'a [MapRecord],
    endianness: Endianness,
}

impl<'a> ProgramSection<'a> {
    fn parse<'data>(
        &self,
        obj: &object::File<'data>,
        section: &object::Section<'data, '_>,
    ) -> Result<Vec<ProgramDefinition>, FormatError> {
        let data = section_data(section)?;

        let mut ranges = symbol_ranges(obj, section.index(), data.len(), Some(SymbolKind::Text));
        if ranges.is_empty() {
            ranges.push((0, data.len() as u64, program_name(self.name)));
        }

        let mut programs = Vec::with_capacity(ranges.len());
        for (start, end, name) in &ranges {
            let size = end.saturating_sub(*start) as usize;
            if size == 0 || size % INSN_SIZE != 0 || *end as usize > data.len() {
                return Err(FormatError::InvalidProgramCode {
                    name: name.clone(),
                    size,
                });
            }
            programs.push(ProgramDefinition {
                name: name.clone(),
                prog_type: self.prog_type,
                section: self.name.to_owned(),
                license: self.license.to_owned(),
                insns: data[*start as usize..*end as usize].to_vec(),
                relocations: Vec::new(),
            });
        }

        for (offset, reloc) in section.relocations() {
            let unsupported = || FormatError::UnsupportedRelocation {
                section: self.name.to_owned(),
                offset,
            };
            let (i, (start, _, _)) = ranges
                .iter()
                .enumerate()
                .find(|(_, (start, end, _))| offset >= *start && offset < *end)
                .ok_or_else(unsupported)?;

            // REL entries keep the addend in the instruction's immediate.
            let implicit = data
                .get(offset as usize + 4..offset as usize + 8)
                .map_or(0, |_| read_u32(data, offset as usize + 4, self.endianness) as i32 as i64);
            let target = resolve_target(obj, self.name, offset, &reloc, implicit)?;
            if Some(target.section) != self.maps_index {
                return Err(unsupported());
            }
            let record = self
                .records
                .iter()
                .find(|r| r.offset == target.address)
                .ok_or_else(unsupported)?;

            programs[i].relocations.push(Relocation {
                insn_index: ((offset - start) as usize) / INSN_SIZE,
                map: record.def.name.clone(),
            });
        }

        for program in &mut programs {
            program.relocations.sort_by_key(|r| r.insn_index);
        }
        Ok(programs)
    }
}

/// Kernel object names only allow alphanumerics, `_` and `.`.
fn program_name(section: &str) -> String {
    section
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}
