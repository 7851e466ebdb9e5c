use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

fn kernel_version(a: u32, b: u32, c: u32) -> u32 {
    (a << 16) + (b << 8) + c.min(255)
}

/// Parse a release string such as `6.1.0-13-amd64` into a version code.
fn parse_release(release: &str) -> Option<u32> {
    let mut parts = release
        .trim()
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok());

    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(kernel_version(major, minor, patch))
}

fn get_kernel_version() -> u32 {
    if let Ok(var) = env::var("KERNEL_VERSION") {
        return str::parse(&var).expect("KERNEL_VERSION must be a numeric version code");
    }

    fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .and_then(|release| parse_release(&release))
        .unwrap_or(0)
}

fn write_kernel_version(ver: u32) {
    let path = Path::new(&env::var("OUT_DIR").unwrap()).join("version.rs");
    let mut file = File::create(path).unwrap();
    writeln!(file, "pub const KERNEL_VERSION : u32 = {};", ver).unwrap();
}

fn main() {
    println!("cargo:rerun-if-env-changed=KERNEL_VERSION");

    let kernel_ver = get_kernel_version();
    println!("cargo:rustc-env=KERNEL_VERSION={}", kernel_ver);
    write_kernel_version(kernel_ver);
}
