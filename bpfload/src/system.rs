use std::collections::HashMap;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bpf::{Kernel, SysKernel};
use crate::elf::ObjectFile;
use crate::error::{Error, Result};
use crate::info::ProgramInfo;
use crate::map::Map;
use crate::prog::{Program, XdpFlags, DEFAULT_LOG_SIZE};
use crate::relocate::relocate;

/// Default mount point of the BPF filesystem.
pub const DEFAULT_PIN_ROOT: &str = "/sys/fs/bpf";

/// Settings applied to everything a [`System`] loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Directory relative map pin paths are resolved against.
    pub pin_root: PathBuf,
    /// Verifier log buffer size, zero to skip collecting the log.
    pub log_size: usize,
    /// Flags [`Program::attach`] uses.
    pub xdp_flags: XdpFlags,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            pin_root: PathBuf::from(DEFAULT_PIN_ROOT),
            log_size: DEFAULT_LOG_SIZE,
            xdp_flags: XdpFlags::empty(),
        }
    }
}

impl Options {
    pub fn pin_root<P: Into<PathBuf>>(mut self, root: P) -> Options {
        self.pin_root = root.into();
        self
    }

    pub fn log_size(mut self, size: usize) -> Options {
        self.log_size = size;
        self
    }

    pub fn xdp_flags(mut self, flags: XdpFlags) -> Options {
        self.xdp_flags = flags;
        self
    }
}

/// The maps and programs of one object file.
///
/// Maps are created while the object is loaded; programs are relocated but
/// stay unloaded until [`Program::load`] or [`System::load_programs`]. A
/// system takes exactly one object; load another one into a new `System`.
#[derive(Debug)]
pub struct System {
    kernel: Arc<dyn Kernel>,
    options: Options,
    maps: HashMap<String, Map>,
    programs: HashMap<String, Program>,
    loaded: bool,
}

impl System {
    /// A system backed by the running kernel.
    pub fn new() -> System {
        System::with_kernel(Arc::new(SysKernel))
    }

    pub fn with_kernel(kernel: Arc<dyn Kernel>) -> System {
        System::with_options(kernel, Options::default())
    }

    pub fn with_options(kernel: Arc<dyn Kernel>, options: Options) -> System {
        System {
            kernel,
            options,
            maps: HashMap::new(),
            programs: HashMap::new(),
            loaded: false,
        }
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Read the object file at `path` and create its maps.
    pub fn load_elf<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|error| Error::File {
            path: path.to_owned(),
            error,
        })?;
        info!("loading {}", path.display());
        self.load_bytes(&data)
    }

    /// Parse an object file, create its maps and relocate its programs.
    ///
    /// Fails with [`Error::ObjectAlreadyLoaded`] once an object has been
    /// loaded. On any other error nothing is kept: maps created so far are
    /// closed and the pins this call made are removed again. Pins that
    /// existed before are left alone.
    pub fn load_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.loaded {
            return Err(Error::ObjectAlreadyLoaded);
        }
        let obj = ObjectFile::parse(data)?;

        let mut maps = HashMap::with_capacity(obj.maps.len());
        let mut pinned = Vec::new();
        let programs = match self.instantiate(&obj, &mut maps, &mut pinned) {
            Ok(programs) => programs,
            Err(e) => {
                for name in &pinned {
                    if let Some(Err(err)) = maps.get_mut(name).map(Map::unpin) {
                        warn!("failed to remove pin of map `{}`: {}", name, err);
                    }
                }
                return Err(e);
            }
        };

        debug!(
            "created {} maps, relocated {} programs",
            maps.len(),
            programs.len()
        );
        self.maps = maps;
        self.programs = programs;
        self.loaded = true;
        Ok(())
    }

    /// Create the maps of `obj` into `maps` and build its programs. Names of
    /// maps pinned by this call are pushed to `pinned`.
    fn instantiate(
        &self,
        obj: &ObjectFile,
        maps: &mut HashMap<String, Map>,
        pinned: &mut Vec<String>,
    ) -> Result<HashMap<String, Program>> {
        for def in &obj.maps {
            let mut map = Map::from_definition(self.kernel.clone(), def);
            if let Some(path) = def.pin_path.as_ref().filter(|p| p.is_relative()) {
                map.set_pin_path(self.options.pin_root.join(path));
            }
            let reused = map.pin_path().map_or(false, Path::exists);
            map.create()?;
            if map.pin_path().is_some() && !reused {
                pinned.push(def.name.clone());
            }
            maps.insert(def.name.clone(), map);
        }

        let kernel_version = obj.kernel_version.unwrap_or(bpfload_sys::KERNEL_VERSION);
        let mut programs = HashMap::with_capacity(obj.programs.len());
        for def in &obj.programs {
            let insns = relocate(def, maps)?;
            let prog = Program::new(self.kernel.clone(), &def.name, def.prog_type, insns, &def.license)
                .with_section(&def.section)
                .with_kernel_version(kernel_version)
                .with_log_size(self.options.log_size)
                .with_xdp_flags(self.options.xdp_flags);
            programs.insert(def.name.clone(), prog);
        }
        Ok(programs)
    }

    /// Load every program into the kernel. A failure does not stop the
    /// remaining programs from loading.
    pub fn load_programs(&mut self) -> Vec<(String, Result<()>)> {
        let mut names: Vec<String> = self.programs.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let res = match self.programs.get_mut(&name) {
                    Some(prog) => prog.load(),
                    None => Ok(()),
                };
                (name, res)
            })
            .collect()
    }

    pub fn map(&self, name: &str) -> Option<&Map> {
        self.maps.get(name)
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.get_mut(name)
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    pub fn program_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.get_mut(name)
    }

    pub fn maps(&self) -> &HashMap<String, Map> {
        &self.maps
    }

    pub fn programs(&self) -> &HashMap<String, Program> {
        &self.programs
    }

    /// Introspect any loaded program by its handle.
    pub fn program_info(&self, fd: RawFd) -> Result<ProgramInfo> {
        ProgramInfo::from_fd(self.kernel.clone(), fd)
    }

    /// Introspect any loaded program by its kernel id.
    pub fn program_info_by_id(&self, id: u32) -> Result<ProgramInfo> {
        ProgramInfo::from_id(self.kernel.clone(), id)
    }
}

impl Default for System {
    fn default() -> System {
        System::new()
    }
}
