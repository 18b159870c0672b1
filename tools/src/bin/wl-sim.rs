//! Workload simulator for the wear-levelling mapper and scheduler.
//!
//! Positional form runs a simulation until some sector wears out:
//!
//! ```text
//! wl-sim <f|b> <c|z> <c|z> <max_block> <restart_per_mille>
//! ```
//!
//! feistel on/base, address distribution, block-size distribution, largest
//! erase burst in sectors, and the per-mille chance of a simulated power
//! loss after each burst. `wl-sim test` instead checks that the keyed
//! address permutation is one-to-one over the whole partition.

use std::process;

use clap::{App, Arg};
use wear_levelling::{sim, AddrDist, BlockDist, SimConfig, Simulator};

const USAGE: &str = "simulation parameters:
    ENABLE_FEISTEL: f for Feistel, b for the base mapping
    ADDRESS_FUNC:   z for zipf, c for constant
    BLOCK_FUNC:     z for zipf, c for constant
    BLOCK_SIZE:     largest erase burst, in sectors
    RESTART_PROB:   restart chance after every burst [per mille]
or `test` to self-check the address permutation";

fn main() {
    env_logger::init();

    let matches = App::new("wl-sim")
        .about("Drives the wear-levelling mapper with synthetic workloads")
        .arg(Arg::with_name("params").help(USAGE).multiple(true))
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("RNG seed; equal seeds reproduce runs (default 1)"),
        )
        .get_matches();

    let seed = match matches.value_of("seed").unwrap_or("1").parse::<u64>() {
        Ok(seed) => seed,
        Err(_) => {
            eprintln!("invalid --seed");
            process::exit(2);
        }
    };
    let params: Vec<&str> = matches.values_of("params").map(|v| v.collect()).unwrap_or_default();

    match params.as_slice() {
        ["test"] => match sim::mapping_self_test(&Simulator::default_config(), seed) {
            Ok(()) => {
                println!("mapping self-test passed");
            }
            Err(e) => {
                eprintln!("mapping self-test failed: {}", e);
                process::exit(1);
            }
        },
        [feistel, addr, block, max_block, restart] => {
            let sim_cfg = SimConfig {
                feistel: feistel.starts_with('f'),
                addr_dist: if addr.starts_with('z') { AddrDist::Zipf } else { AddrDist::Constant },
                block_dist: if block.starts_with('z') { BlockDist::Zipf } else { BlockDist::Constant },
                max_block: match max_block.parse() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        eprintln!("invalid BLOCK_SIZE: {}\n{}", max_block, USAGE);
                        process::exit(2);
                    }
                },
                restart_per_mille: match restart.parse() {
                    Ok(p) => p,
                    Err(_) => {
                        eprintln!("invalid RESTART_PROB: {}\n{}", restart, USAGE);
                        process::exit(2);
                    }
                },
                seed,
                ..Default::default()
            };
            let mut simulator = match Simulator::new(&Simulator::default_config(), sim_cfg) {
                Ok(simulator) => simulator,
                Err(e) => {
                    eprintln!("cannot set up the simulation: {}", e);
                    process::exit(1);
                }
            };
            let report = simulator.run();
            log::info!(
                "erases: total={}, estimated from counters={}, per sector min={} max={} mean={:.1} var={:.1} dev={:.1}",
                report.total_erases,
                report.estimated_erases,
                report.min_count,
                report.max_count,
                report.mean,
                report.variance,
                report.std_dev
            );
            log::info!(
                "sector 0x{:x} wore out; feistel_calls={}, cycle_walks={}",
                report.exhausted_sector,
                report.feistel_calls,
                report.cycle_walks
            );
            println!("{}", report);
        }
        _ => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    }
}
