use std::os::unix::io::RawFd;

/// Lifecycle of a kernel handle owned by a map, program or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdState {
    /// Not yet created or loaded.
    Unset,
    Open(RawFd),
    /// Released. A closed object is never reopened.
    Closed,
}

impl FdState {
    pub fn get(&self) -> Option<RawFd> {
        match *self {
            FdState::Open(fd) => Some(fd),
            _ => None,
        }
    }

    /// Take the open handle, leaving the state `Closed`.
    pub fn take(&mut self) -> Option<RawFd> {
        let fd = self.get();
        *self = FdState::Closed;
        fd
    }
}
