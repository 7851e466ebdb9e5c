//! Patching map references into program bytecode.

use std::collections::HashMap;

use bpfload_sys as sys;

use crate::elf::ProgramDefinition;
use crate::error::{Error, FormatError, Result};
use crate::map::Map;

const INSN_SIZE: usize = 8;

/// Return a copy of `prog`'s instructions in which every map load carries
/// the live handle of the map it names.
pub fn relocate(prog: &ProgramDefinition, maps: &HashMap<String, Map>) -> Result<Vec<u8>> {
    let mut insns = prog.insns.clone();

    for reloc in &prog.relocations {
        let unresolved = || Error::UnresolvedReference {
            program: prog.name.clone(),
            map: reloc.map.clone(),
        };
        let fd = maps
            .get(&reloc.map)
            .and_then(Map::fd)
            .ok_or_else(unresolved)?;

        let start = reloc.insn_index * INSN_SIZE;
        // A 64-bit immediate load spans two instruction slots.
        let insn = insns
            .get(start..start + 2 * INSN_SIZE)
            .and_then(sys::bpf_insn::from_bytes)
            .filter(|insn| insn.code == sys::BPF_LD_IMM64);
        let mut insn = match insn {
            Some(insn) => insn,
            None => {
                return Err(FormatError::InvalidRelocationTarget {
                    program: prog.name.clone(),
                    index: reloc.insn_index,
                }
                .into())
            }
        };
        insn.set_src_reg(sys::BPF_PSEUDO_MAP_FD);
        insn.imm = fd;
        insns[start..start + INSN_SIZE].copy_from_slice(&insn.to_bytes());
    }
    Ok(insns)
}
