use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

pub const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

pub fn err_check(res: c_int) -> io::Result<()> {
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn val_check(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res)
}

pub fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub fn str_to_cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Decode a fixed-size, NUL-padded kernel name.
pub fn name_from_raw(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Read a NUL-terminated string from the start of `data`.
pub fn cstr_prefix(data: &[u8]) -> Option<&str> {
    let end = data.iter().position(|b| *b == 0)?;
    CStr::from_bytes_with_nul(&data[..=end])
        .ok()
        .and_then(|s| s.to_str().ok())
}

/// Parse a kernel CPU list such as `0-3,5,7-8`.
pub fn parse_cpu_ranges(data: &str) -> io::Result<Vec<u32>> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid CPU list `{}`", data.trim()),
        )
    };
    let mut cpus = Vec::new();
    for range in data.trim().split(',').filter(|r| !r.is_empty()) {
        let mut bounds = range.splitn(2, '-');
        let start = bounds
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let end = match bounds.next() {
            Some(end) => end.parse::<u32>().map_err(|_| invalid())?,
            None => start,
        };
        if end < start {
            return Err(invalid());
        }
        cpus.extend(start..=end);
    }
    if cpus.is_empty() {
        return Err(invalid());
    }
    Ok(cpus)
}

pub fn possible_cpus() -> io::Result<Vec<u32>> {
    parse_cpu_ranges(&fs::read_to_string(POSSIBLE_CPUS)?)
}

/// Nanoseconds elapsed on `CLOCK_BOOTTIME`, the clock program load times use.
pub fn boot_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Convert a `CLOCK_BOOTTIME` timestamp into wall-clock time.
pub fn boot_ns_to_system_time(ns: u64) -> SystemTime {
    let now = SystemTime::now();
    let since = Duration::from_nanos(boot_time_ns().saturating_sub(ns));
    now.checked_sub(since).unwrap_or(SystemTime::UNIX_EPOCH)
}
