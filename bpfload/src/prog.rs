use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use bpfload_sys as sys;
use log::{debug, warn};

use crate::bpf::{Kernel, ProgAttr};
use crate::error::{Error, Result};
use crate::fd::FdState;
use crate::info::ProgramInfo;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProgType {
    Unspec          = 0,
    SocketFilter    = 1,
    Kprobe          = 2,
    SchedCls        = 3,
    SchedAct        = 4,
    Tracepoint      = 5,
    XDP             = 6,
    PerfEvent       = 7,
}

impl ProgType {
    pub(crate) fn as_bpf_prog_type(&self) -> sys::bpf_prog_type {
        use self::ProgType::*;
        use bpfload_sys::bpf_prog_type::*;

        match *self {
            Unspec          => BPF_PROG_TYPE_UNSPEC,
            SocketFilter    => BPF_PROG_TYPE_SOCKET_FILTER,
            Kprobe          => BPF_PROG_TYPE_KPROBE,
            SchedCls        => BPF_PROG_TYPE_SCHED_CLS,
            SchedAct        => BPF_PROG_TYPE_SCHED_ACT,
            Tracepoint      => BPF_PROG_TYPE_TRACEPOINT,
            XDP             => BPF_PROG_TYPE_XDP,
            PerfEvent       => BPF_PROG_TYPE_PERF_EVENT,
        }
    }

    /// XDP programs must declare at load time that they will be attached
    /// through a link.
    pub(crate) fn expected_attach_type(&self) -> u32 {
        match *self {
            ProgType::XDP => sys::bpf_attach_type::BPF_XDP as u32,
            _ => 0,
        }
    }

    /// The program type an object file section name stands for.
    pub fn from_section_name(section: &str) -> Option<ProgType> {
        const PREFIXES: &[(&str, ProgType)] = &[
            ("xdp", ProgType::XDP),
            ("socket", ProgType::SocketFilter),
            ("kprobe/", ProgType::Kprobe),
            ("kretprobe/", ProgType::Kprobe),
            ("tracepoint/", ProgType::Tracepoint),
            ("perf_event", ProgType::PerfEvent),
        ];

        PREFIXES
            .iter()
            .find(|(prefix, _)| section.starts_with(prefix))
            .map(|(_, prog_type)| *prog_type)
    }
}

impl TryFrom<u32> for ProgType {
    type Error = u32;

    fn try_from(val: u32) -> ::std::result::Result<ProgType, u32> {
        use self::ProgType::*;

        Ok(match val {
            0 => Unspec,
            1 => SocketFilter,
            2 => Kprobe,
            3 => SchedCls,
            4 => SchedAct,
            5 => Tracepoint,
            6 => XDP,
            7 => PerfEvent,
            _ => return Err(val),
        })
    }
}

bitflags! {
    /// Flags passed when attaching an XDP program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XdpFlags: u32 {
        const UPDATE_IF_NOEXIST = sys::XDP_FLAGS_UPDATE_IF_NOEXIST;
        const SKB_MODE = sys::XDP_FLAGS_SKB_MODE;
        const DRV_MODE = sys::XDP_FLAGS_DRV_MODE;
        const HW_MODE = sys::XDP_FLAGS_HW_MODE;
        const REPLACE = sys::XDP_FLAGS_REPLACE;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgState {
    Unloaded,
    Loaded,
    Attached,
    Closed,
}

#[derive(Debug)]
struct Attachment {
    iface: String,
    ifindex: u32,
    link_fd: RawFd,
}

/// A BPF program
#[derive(Debug)]
pub struct Program {
    name: String,
    prog_type: ProgType,
    section: String,
    license: String,
    insns: Vec<u8>,
    kernel_version: u32,
    log_size: usize,
    xdp_flags: XdpFlags,
    fd: FdState,
    attachment: Option<Attachment>,
    pin_path: Option<PathBuf>,
    kernel: Arc<dyn Kernel>,
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            if let Err(e) = self.kernel.close(attachment.link_fd) {
                warn!(
                    "failed to detach program `{}` from `{}`: {}",
                    self.name, attachment.iface, e
                );
            }
        }
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.kernel.close(fd) {
                warn!("failed to close program `{}` (fd {}): {}", self.name, fd, e);
            }
        }
    }
}

/// Size of the verifier log buffer used when a load is retried.
pub const DEFAULT_LOG_SIZE: usize = 64 * 1024;

impl Program {
    /// A program that is yet to be loaded with [`load`](Program::load).
    ///
    /// `insns` must already carry concrete map handles.
    pub fn new(
        kernel: Arc<dyn Kernel>,
        name: &str,
        prog_type: ProgType,
        insns: Vec<u8>,
        license: &str,
    ) -> Program {
        Program {
            name: name.to_owned(),
            prog_type,
            section: String::new(),
            license: license.to_owned(),
            insns,
            kernel_version: sys::KERNEL_VERSION,
            log_size: DEFAULT_LOG_SIZE,
            xdp_flags: XdpFlags::empty(),
            fd: FdState::Unset,
            attachment: None,
            pin_path: None,
            kernel,
        }
    }

    pub(crate) fn with_section(mut self, section: &str) -> Program {
        self.section = section.to_owned();
        self
    }

    pub fn with_kernel_version(mut self, version: u32) -> Program {
        self.kernel_version = version;
        self
    }

    /// Size of the buffer the verifier log is collected in when a load fails.
    /// Zero disables the retry.
    pub fn with_log_size(mut self, size: usize) -> Program {
        self.log_size = size;
        self
    }

    /// Flags used by [`attach`](Program::attach).
    pub fn with_xdp_flags(mut self, flags: XdpFlags) -> Program {
        self.xdp_flags = flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prog_type(&self) -> ProgType {
        self.prog_type
    }

    /// The object file section the program was read from, if any.
    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn insns(&self) -> &[u8] {
        &self.insns
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.get()
    }

    pub fn state(&self) -> ProgState {
        match self.fd {
            FdState::Unset => ProgState::Unloaded,
            FdState::Closed => ProgState::Closed,
            FdState::Open(_) if self.attachment.is_some() => ProgState::Attached,
            FdState::Open(_) => ProgState::Loaded,
        }
    }

    /// Name of the interface the program is attached to.
    pub fn attached_interface(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.iface.as_str())
    }

    pub fn pin_path(&self) -> Option<&Path> {
        self.pin_path.as_deref()
    }

    fn live_fd(&self) -> Result<RawFd> {
        match self.fd {
            FdState::Open(fd) => Ok(fd),
            FdState::Unset => Err(Error::NotLoaded {
                name: self.name.clone(),
            }),
            FdState::Closed => Err(Error::AlreadyClosed {
                name: self.name.clone(),
            }),
        }
    }

    /// Submit the program to the kernel.
    ///
    /// When the kernel rejects it, the load is repeated with a verifier log
    /// buffer and the log is returned in [`Error::VerifierRejected`].
    pub fn load(&mut self) -> Result<()> {
        match self.state() {
            ProgState::Unloaded => {}
            ProgState::Closed => {
                return Err(Error::AlreadyClosed {
                    name: self.name.clone(),
                })
            }
            ProgState::Loaded | ProgState::Attached => {
                return Err(Error::AlreadyLoaded {
                    name: self.name.clone(),
                })
            }
        }

        let attr = ProgAttr {
            prog_type: self.prog_type,
            name: &self.name,
            insns: &self.insns,
            license: &self.license,
            kernel_version: self.kernel_version,
        };
        let fd = match self.kernel.prog_load(&attr, None) {
            Ok(fd) => fd,
            Err(error) if !is_verifier_error(&error) => {
                return Err(Error::KernelRejected {
                    call: "BPF_PROG_LOAD",
                    name: self.name.clone(),
                    error,
                })
            }
            Err(error) if self.log_size == 0 => {
                return Err(Error::VerifierRejected {
                    name: self.name.clone(),
                    log: String::new(),
                    error,
                })
            }
            Err(_) => {
                let mut log = vec![0u8; self.log_size];
                match self.kernel.prog_load(&attr, Some(&mut log)) {
                    Ok(fd) => fd,
                    Err(error) => {
                        let end = log.iter().position(|b| *b == 0).unwrap_or(log.len());
                        return Err(Error::VerifierRejected {
                            name: self.name.clone(),
                            log: String::from_utf8_lossy(&log[..end]).trim_end().to_owned(),
                            error,
                        });
                    }
                }
            }
        };

        self.fd = FdState::Open(fd);
        debug!("loaded program `{}` ({:?}) fd {}", self.name, self.prog_type, fd);
        Ok(())
    }

    /// Attach an XDP program to `iface` with the configured flags.
    pub fn attach(&mut self, iface: &str) -> Result<()> {
        self.attach_with_flags(iface, self.xdp_flags)
    }

    pub fn attach_with_flags(&mut self, iface: &str, flags: XdpFlags) -> Result<()> {
        let fd = self.live_fd()?;
        if let Some(attachment) = &self.attachment {
            return Err(Error::AttachFailed {
                name: self.name.clone(),
                iface: iface.to_owned(),
                error: io::Error::new(
                    io::ErrorKind::Other,
                    format!("already attached to `{}`", attachment.iface),
                ),
            });
        }
        if self.prog_type != ProgType::XDP {
            return Err(Error::UnsupportedOperation {
                name: self.name.clone(),
                operation: "attach",
                map_type: None,
            });
        }

        let ifindex = self
            .kernel
            .if_index(iface)
            .ok_or_else(|| Error::InterfaceNotFound {
                iface: iface.to_owned(),
            })?;
        let link_fd = self
            .kernel
            .xdp_attach(fd, ifindex, flags.bits())
            .map_err(|error| match error.raw_os_error() {
                Some(libc::ENODEV) => Error::InterfaceNotFound {
                    iface: iface.to_owned(),
                },
                _ => Error::AttachFailed {
                    name: self.name.clone(),
                    iface: iface.to_owned(),
                    error,
                },
            })?;

        debug!(
            "attached program `{}` to `{}` (ifindex {})",
            self.name, iface, ifindex
        );
        self.attachment = Some(Attachment {
            iface: iface.to_owned(),
            ifindex,
            link_fd,
        });
        Ok(())
    }

    /// Remove the program from its interface. It stays loaded.
    pub fn detach(&mut self) -> Result<()> {
        let attachment = self.attachment.take().ok_or_else(|| Error::NotAttached {
            name: self.name.clone(),
        })?;
        self.kernel
            .close(attachment.link_fd)
            .map_err(|error| Error::Syscall {
                call: "close",
                error,
            })?;
        debug!(
            "detached program `{}` from `{}` (ifindex {})",
            self.name, attachment.iface, attachment.ifindex
        );
        Ok(())
    }

    pub fn pin<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let fd = self.live_fd()?;

        self.kernel
            .obj_pin(fd, path)
            .map_err(|error| Error::Syscall {
                call: "BPF_OBJ_PIN",
                error,
            })?;
        debug!("pinned program `{}` at {}", self.name, path.display());
        self.pin_path = Some(path.to_owned());
        Ok(())
    }

    pub fn unpin(&mut self) -> Result<()> {
        let path = self.pin_path.take().ok_or_else(|| Error::NotPinned {
            name: self.name.clone(),
        })?;
        if let Err(error) = fs::remove_file(&path) {
            self.pin_path = Some(path.clone());
            return Err(Error::File { path, error });
        }
        debug!("unpinned program `{}` from {}", self.name, path.display());
        Ok(())
    }

    /// Detach if attached, then release the program handle. Pins survive.
    pub fn close(&mut self) -> Result<()> {
        if self.fd == FdState::Closed {
            return Err(Error::AlreadyClosed {
                name: self.name.clone(),
            });
        }
        if self.attachment.is_some() {
            self.detach()?;
        }
        if let Some(fd) = self.fd.take() {
            self.kernel.close(fd).map_err(|error| Error::Syscall {
                call: "close",
                error,
            })?;
            debug!("closed program `{}` (fd {})", self.name, fd);
        }
        Ok(())
    }

    /// Live kernel metadata about this program and the maps it uses.
    pub fn info(&self) -> Result<ProgramInfo> {
        let fd = self.live_fd()?;
        ProgramInfo::from_fd(self.kernel.clone(), fd)
    }
}

fn is_verifier_error(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EINVAL)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, FakeKernel};
    use assert_matches::assert_matches;

    fn xdp(kernel: &Arc<FakeKernel>) -> Program {
        Program::new(
            kernel.clone(),
            "xdp0",
            ProgType::XDP,
            testutil::pass_program(),
            "GPL",
        )
    }

    #[test]
    fn section_names() {
        assert_eq!(ProgType::from_section_name("xdp"), Some(ProgType::XDP));
        assert_eq!(ProgType::from_section_name("xdp_root"), Some(ProgType::XDP));
        assert_eq!(
            ProgType::from_section_name("kretprobe/sys_open"),
            Some(ProgType::Kprobe)
        );
        assert_eq!(
            ProgType::from_section_name("tracepoint/syscalls/sys_enter"),
            Some(ProgType::Tracepoint)
        );
        assert_eq!(ProgType::from_section_name(".text"), None);
        assert_eq!(ProgType::from_section_name("maps"), None);
        assert_eq!(ProgType::try_from(6), Ok(ProgType::XDP));
        assert_eq!(ProgType::try_from(99), Err(99));
    }

    #[test]
    fn load_program() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = xdp(&kernel);
        assert_eq!(prog.state(), ProgState::Unloaded);

        prog.load().unwrap();
        assert_eq!(prog.state(), ProgState::Loaded);
        assert!(prog.fd().is_some());
        assert_matches!(prog.load(), Err(Error::AlreadyLoaded { .. }));
    }

    #[test]
    fn verifier_log_is_collected() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = Program::new(
            kernel.clone(),
            "broken",
            ProgType::XDP,
            vec![0xb7, 0, 0, 0, 2, 0, 0, 0],
            "GPL",
        );

        let err = prog.load().unwrap_err();
        assert_matches!(&err, Error::VerifierRejected { log, .. } if log.contains("exit"));
        assert_eq!(prog.state(), ProgState::Unloaded);
        assert_eq!(kernel.open_handles(), 0);
    }

    #[test]
    fn attach_and_detach() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = xdp(&kernel);

        assert_matches!(prog.attach("lo"), Err(Error::NotLoaded { .. }));
        prog.load().unwrap();

        assert_matches!(
            prog.attach("eth_missing0"),
            Err(Error::InterfaceNotFound { iface }) if iface == "eth_missing0"
        );
        assert_eq!(prog.state(), ProgState::Loaded);

        prog.attach("lo").unwrap();
        assert_eq!(prog.state(), ProgState::Attached);
        assert_eq!(prog.attached_interface(), Some("lo"));
        assert_matches!(prog.attach("lo"), Err(Error::AttachFailed { .. }));

        prog.detach().unwrap();
        assert_eq!(prog.state(), ProgState::Loaded);
        assert_eq!(prog.attached_interface(), None);
        assert_matches!(prog.detach(), Err(Error::NotAttached { .. }));
    }

    #[test]
    fn only_xdp_programs_attach() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = Program::new(
            kernel.clone(),
            "probe",
            ProgType::Kprobe,
            testutil::pass_program(),
            "GPL",
        );
        prog.load().unwrap();
        assert_matches!(
            prog.attach("lo"),
            Err(Error::UnsupportedOperation { operation: "attach", .. })
        );
    }

    #[test]
    fn pin_and_unpin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xdp0");
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = xdp(&kernel);

        assert_matches!(prog.pin(&path), Err(Error::NotLoaded { .. }));
        prog.load().unwrap();
        prog.pin(&path).unwrap();
        assert!(path.exists());
        assert_eq!(prog.pin_path(), Some(path.as_path()));

        prog.unpin().unwrap();
        assert!(!path.exists());
        assert_matches!(prog.unpin(), Err(Error::NotPinned { .. }));
    }

    #[test]
    fn close_releases_everything() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = xdp(&kernel);
        prog.load().unwrap();
        prog.attach("lo").unwrap();
        assert_eq!(kernel.open_handles(), 2);

        prog.close().unwrap();
        assert_eq!(prog.state(), ProgState::Closed);
        assert_eq!(kernel.open_handles(), 0);
        assert_matches!(prog.close(), Err(Error::AlreadyClosed { .. }));
        assert_matches!(prog.load(), Err(Error::AlreadyClosed { .. }));
        assert_matches!(prog.attach("lo"), Err(Error::AlreadyClosed { .. }));
    }

    #[test]
    fn close_unloaded() {
        let kernel = Arc::new(FakeKernel::new());
        let mut prog = xdp(&kernel);
        prog.close().unwrap();
        assert_eq!(prog.state(), ProgState::Closed);
    }

    #[test]
    fn drop_releases_handles() {
        let kernel = Arc::new(FakeKernel::new());
        {
            let mut prog = xdp(&kernel);
            prog.load().unwrap();
            prog.attach("lo").unwrap();
        }
        assert_eq!(kernel.open_handles(), 0);
    }
}
