//! Post-mortem monitor: reconstruct the wear-levelling status of a
//! partition image and print it as a JSON document on stdout.
//!
//! Any failure becomes a single-line `{"error":"<kind>"}` document, so the
//! consumer on the other end of the pipe always gets valid JSON.

use std::fs;
use std::io::{Error, ErrorKind};
use std::process;

use clap::{App, Arg};
use wear_levelling::{find_wl_partition, FlashAccess, MemFlash, WlError, WlMonitor, WlResult};

fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn run(path: &str, sector_size: u64) -> WlResult<String> {
    let image = fs::read(path)?;
    log::info!("loaded image {} ({} bytes)", path, image.len());
    let flash = MemFlash::from_vec(image, sector_size);

    // a raw image file is a single candidate partition; a future
    // partition-table walk would push more entries here
    let candidates: [&dyn FlashAccess; 1] = [&flash];
    let (index, cfg) = find_wl_partition(&candidates, sector_size)?;
    let monitor = WlMonitor::reconstruct(cfg, candidates[index])?;
    serde_json::to_string(&monitor.status())
        .map_err(|e| WlError::Io(Error::new(ErrorKind::Other, e)))
}

fn main() {
    env_logger::init();

    let matches = App::new("wlmon")
        .about("Reconstructs wear-levelling status from a partition image")
        .arg(Arg::with_name("image").help("partition image file").required(true))
        .arg(
            Arg::with_name("sector-size")
                .long("sector-size")
                .takes_value(true)
                .help("erase sector size of the imaged flash; sets where the config record is probed (default 0x1000)"),
        )
        .get_matches();

    let image = matches.value_of("image").unwrap_or_default();
    let sector_size = match matches.value_of("sector-size") {
        Some(arg) => match parse_num(arg) {
            Some(n) if n > 0 => n,
            _ => {
                eprintln!("invalid --sector-size: {}", arg);
                process::exit(2);
            }
        },
        None => 0x1000,
    };

    match run(image, sector_size) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("reconstruction failed: {}", e);
            println!("{}", serde_json::json!({ "error": e.name() }));
            process::exit(1);
        }
    }
}
