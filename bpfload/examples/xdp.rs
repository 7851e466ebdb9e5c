//! Load an object file and attach one of its XDP programs.
//!
//! Usage: xdp <object file> <program> <interface>

use std::env;
use std::process;
use std::thread;
use std::time::Duration;

use bpfload::System;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!("usage: {} <object file> <program> <interface>", args[0]);
        process::exit(2);
    }

    let mut system = System::new();
    system.load_elf(&args[1]).unwrap();

    for (name, map) in system.maps() {
        println!("map {}:\n{}", name, map);
    }

    for (name, res) in system.load_programs() {
        if let Err(e) = res {
            eprintln!("{}: {}", name, e);
        }
    }

    let prog = match system.program_mut(&args[2]) {
        Some(prog) => prog,
        None => {
            eprintln!("no program named {}", args[2]);
            process::exit(1);
        }
    };
    prog.attach(&args[3]).unwrap();
    println!("attached {} to {}", args[2], args[3]);

    let info = prog.info().unwrap();
    println!("id {} tag {:02x?} jited {} bytes", info.id, info.tag, info.jited_len);
    for name in info.maps.keys() {
        println!("uses map {}", name);
    }

    thread::sleep(Duration::from_secs(10));
    prog.detach().unwrap();
}
