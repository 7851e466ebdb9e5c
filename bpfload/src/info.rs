use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

use crate::bpf::Kernel;
use crate::error::{Error, Result};
use crate::map::{Map, MapType};
use crate::prog::ProgType;
use crate::utils::boot_ns_to_system_time;

/// A snapshot of what the kernel knows about a loaded program.
#[derive(Debug)]
pub struct ProgramInfo {
    pub name: String,
    pub fd: RawFd,
    pub id: u32,
    /// `None` for program types this crate does not know.
    pub prog_type: Option<ProgType>,
    pub tag: [u8; 8],
    /// Size of the JIT-compiled program, zero when JIT is disabled.
    pub jited_len: u32,
    pub xlated_len: u32,
    pub load_time: SystemTime,
    pub gpl_compatible: bool,
    /// The maps the program uses, each with a handle of its own.
    ///
    /// Keys are the names the kernel reports, which it cuts to 15 bytes. When
    /// two maps end up with the same name, the later one is keyed
    /// `name#id`. Maps of types [`MapType`] does not know are left out.
    pub maps: HashMap<String, Map>,
    /// Set when the handle was opened for this snapshot.
    owned_fd: bool,
    kernel: Arc<dyn Kernel>,
}

impl Drop for ProgramInfo {
    fn drop(&mut self) {
        if self.owned_fd {
            if let Err(e) = self.kernel.close(self.fd) {
                warn!("failed to close program `{}` (fd {}): {}", self.name, self.fd, e);
            }
        }
    }
}

impl ProgramInfo {
    /// Introspect the program behind `fd`. The handle stays owned by the caller.
    pub fn from_fd(kernel: Arc<dyn Kernel>, fd: RawFd) -> Result<ProgramInfo> {
        ProgramInfo::build(kernel, fd, false)
    }

    /// Introspect a program by its kernel id. The snapshot keeps a handle to
    /// the program until it is dropped.
    pub fn from_id(kernel: Arc<dyn Kernel>, id: u32) -> Result<ProgramInfo> {
        let fd = kernel.prog_fd_by_id(id).map_err(|error| match error.raw_os_error() {
            Some(libc::ENOENT) => Error::NotFound {
                name: format!("program id {}", id),
            },
            _ => Error::Syscall {
                call: "BPF_PROG_GET_FD_BY_ID",
                error,
            },
        })?;
        ProgramInfo::build(kernel.clone(), fd, true).map_err(|e| {
            let _ = kernel.close(fd);
            e
        })
    }

    fn build(kernel: Arc<dyn Kernel>, fd: RawFd, owned_fd: bool) -> Result<ProgramInfo> {
        let info = kernel.prog_info(fd).map_err(|error| Error::Syscall {
            call: "BPF_OBJ_GET_INFO_BY_FD",
            error,
        })?;

        let mut maps = HashMap::with_capacity(info.map_ids.len());
        for id in &info.map_ids {
            let map_fd = kernel.map_fd_by_id(*id).map_err(|error| Error::Syscall {
                call: "BPF_MAP_GET_FD_BY_ID",
                error,
            })?;
            let map_info = match kernel.map_info(map_fd) {
                Ok(map_info) => map_info,
                Err(error) => {
                    let _ = kernel.close(map_fd);
                    return Err(Error::Syscall {
                        call: "BPF_OBJ_GET_INFO_BY_FD",
                        error,
                    });
                }
            };
            if MapType::try_from(map_info.map_type).is_err() {
                warn!(
                    "skipping map `{}` (id {}) of unknown type {}",
                    map_info.name, id, map_info.map_type
                );
                let _ = kernel.close(map_fd);
                continue;
            }
            let map = Map::from_kernel_info(kernel.clone(), map_fd, &map_info)?;
            let key = if maps.contains_key(map.name()) {
                format!("{}#{}", map.name(), id)
            } else {
                map.name().to_owned()
            };
            maps.insert(key, map);
        }

        Ok(ProgramInfo {
            name: info.name,
            fd,
            id: info.id,
            prog_type: ProgType::try_from(info.prog_type).ok(),
            tag: info.tag,
            jited_len: info.jited_len,
            xlated_len: info.xlated_len,
            load_time: boot_ns_to_system_time(info.load_time),
            gpl_compatible: info.gpl_compatible,
            maps,
            owned_fd,
            kernel,
        })
    }
}
