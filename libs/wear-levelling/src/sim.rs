//! Deterministic workload simulator for the translation layer.
//!
//! Shares the mapper and the scheduler with the engine but skips all flash
//! I/O: the counters live as plain fields and every translated erase just
//! bumps a per-physical-sector tally. A run ends when any sector reaches
//! the configured endurance, which is exactly the figure wear levelling
//! exists to postpone; the report's normalized endurance says how close
//! the run came to the theoretical optimum of wearing every sector out
//! simultaneously.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::api::{WlError, WlMode, WlResult};
use crate::backend::{advance_position, map_logical, resolve, Feistel, WlConfig, WlState};

/// Distribution of erase addresses over the usable area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrDist {
    /// always the middle of the area
    Constant,
    Uniform,
    /// Zipfian over sector indices, skew 0.99: a few very hot sectors
    Zipf,
}

/// Distribution of erase burst lengths, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDist {
    /// always `max_block`
    Constant,
    /// Zipfian over `[1, max_block]`, skew 0.99
    Zipf,
}

/// Simulation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// run the address permutation (advanced mapping) or the base rotation
    pub feistel: bool,
    pub addr_dist: AddrDist,
    pub block_dist: BlockDist,
    /// largest erase burst, in sectors; at least 1
    pub max_block: u64,
    /// chance per burst, in per mille, of a simulated power loss that
    /// forgets `access_count`
    pub restart_per_mille: u32,
    /// erase cycles a sector survives
    pub endurance: u32,
    /// RNG seed; equal seeds reproduce runs bit for bit
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            feistel: true,
            addr_dist: AddrDist::Zipf,
            block_dist: BlockDist::Constant,
            max_block: 1,
            restart_per_mille: 0,
            endurance: 100_000,
            seed: 1,
        }
    }
}

/// Zipfian sampling via a precomputed inverse CDF over a closed range.
struct ZipfTable {
    lo: u64,
    cdf: Vec<f64>,
}

impl ZipfTable {
    fn new(lo: u64, hi: u64, skew: f64) -> ZipfTable {
        let n = (hi - lo + 1) as usize;
        let mut cdf = Vec::with_capacity(n);
        let mut total = 0.0;
        for rank in 1..=n {
            total += 1.0 / (rank as f64).powf(skew);
            cdf.push(total);
        }
        for value in &mut cdf {
            *value /= total;
        }
        ZipfTable { lo, cdf }
    }

    fn sample(&self, rng: &mut StdRng) -> u64 {
        let u: f64 = rng.gen();
        let index = self.cdf.partition_point(|&p| p < u);
        self.lo + index.min(self.cdf.len() - 1) as u64
    }
}

/// One simulated engine: the mapping counters as plain fields, a stubbed
/// block device reduced to an erase tally.
pub struct Simulator {
    flash_size: u64,
    page_size: u64,
    sector_size: u64,
    state: WlState,
    feistel: Option<Feistel>,
    erase_counts: Vec<u32>,
    endurance: u32,
    addr_dist: AddrDist,
    block_dist: BlockDist,
    max_block: u64,
    restart_per_mille: u32,
    zipf_addr: ZipfTable,
    zipf_block: ZipfTable,
    rng: StdRng,
    total_erases: u64,
    feistel_calls: u64,
    cycle_walks: u64,
    restarted: u64,
}

impl Simulator {
    /// The 1 MiB partition with 4 KiB sectors that small data partitions
    /// typically use; handy as the default simulation target.
    pub fn default_config() -> WlConfig {
        WlConfig {
            start_addr: 0,
            full_mem_size: 0x10_0000,
            page_size: 0x1000,
            sector_size: 0x1000,
            updaterate: 0x10,
            wr_size: 0x10,
            version: 2,
            temp_buff_size: 0x20,
            crc: 0,
        }
    }

    pub fn new(cfg: &WlConfig, sim: SimConfig) -> WlResult<Simulator> {
        if sim.max_block == 0 || sim.endurance == 0 {
            return Err(WlError::InvalidConfig);
        }
        // the simulator models the base region layout; nothing is persisted,
        // so no erase-count regions get carved out
        let geo = resolve(cfg, WlMode::Base)?;
        let mut rng = StdRng::seed_from_u64(sim.seed);

        let feistel = if sim.feistel {
            let keys = [rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()];
            Some(Feistel::new(keys, geo.sector_count, cfg.sector_size as u64)?)
        } else {
            None
        };

        let state = WlState {
            max_pos: geo.max_pos,
            max_count: if cfg.updaterate != 0 {
                cfg.updaterate
            } else {
                ((geo.flash_size / geo.state_size) as u32).max(1)
            },
            ..Default::default()
        };

        // the dummy page is a legal mapping target, so the tally covers one
        // page beyond the usable sector count
        let counts_len = ((geo.flash_size + cfg.page_size as u64) / cfg.sector_size as u64) as usize;

        Ok(Simulator {
            flash_size: geo.flash_size,
            page_size: cfg.page_size as u64,
            sector_size: cfg.sector_size as u64,
            state,
            feistel,
            erase_counts: vec![0; counts_len],
            endurance: sim.endurance,
            addr_dist: sim.addr_dist,
            block_dist: sim.block_dist,
            max_block: sim.max_block,
            restart_per_mille: sim.restart_per_mille,
            zipf_addr: ZipfTable::new(0, geo.sector_count, 0.99),
            zipf_block: ZipfTable::new(1, sim.max_block, 0.99),
            rng,
            total_erases: 0,
            feistel_calls: 0,
            cycle_walks: 0,
            restarted: 0,
        })
    }

    pub fn state(&self) -> &WlState { &self.state }

    pub fn erase_counts(&self) -> &[u32] { &self.erase_counts }

    fn calc_addr(&mut self, addr: u64) -> u64 {
        let intermediate = match &self.feistel {
            Some(feistel) => {
                self.feistel_calls += 1;
                let (mapped, walks) = feistel.randomize_addr(addr);
                self.cycle_walks += walks as u64;
                mapped
            }
            None => addr,
        };
        map_logical(self.flash_size, self.page_size, self.state.pos, self.state.move_count, intermediate)
    }

    fn update_wl(&mut self) {
        self.state.access_count += 1;
        if self.state.access_count < self.state.max_count {
            return;
        }
        self.state.access_count = 0;
        advance_position(&mut self.state);
    }

    /// Translate and tally one sector erase. Fails with `ExhaustedSector`
    /// once the translated sector hits the endurance limit.
    pub fn erase_sector(&mut self, sector: u64) -> WlResult<()> {
        self.update_wl();
        let physical = self.calc_addr(sector * self.sector_size) / self.sector_size;
        let count = match self.erase_counts.get_mut(physical as usize) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                log::error!("mapping produced sector 0x{:x}, beyond the physical area", physical);
                return Err(WlError::InvalidState);
            }
        };
        self.total_erases += 1;
        if count >= self.endurance {
            log::info!("sector 0x{:x} reached {} erases", physical, count);
            return Err(WlError::ExhaustedSector(physical));
        }
        Ok(())
    }

    pub fn erase_range(&mut self, addr: u64, len: u64) -> WlResult<()> {
        let first = addr / self.sector_size;
        let count = (len + self.sector_size - 1) / self.sector_size;
        for i in 0..count {
            self.erase_sector(first + i)?;
        }
        Ok(())
    }

    /// Drive synthetic bursts until a sector wears out, then report.
    pub fn run(&mut self) -> SimReport {
        let exhausted;
        loop {
            let addr = self.next_addr();
            let blocks = self.next_block();
            match self.erase_range(addr, blocks * self.sector_size) {
                Ok(()) => {}
                Err(WlError::ExhaustedSector(sector)) => {
                    exhausted = sector;
                    break;
                }
                Err(e) => {
                    log::error!("simulation aborted: {}", e);
                    exhausted = u64::MAX;
                    break;
                }
            }
            if self.restart_per_mille != 0 && self.rng.gen_range(0..1000) < self.restart_per_mille {
                // power loss between rotations: only access_count is lost
                self.state.access_count = 0;
                self.restarted += 1;
            }
        }
        self.report(exhausted)
    }

    fn next_addr(&mut self) -> u64 {
        match self.addr_dist {
            AddrDist::Constant => self.flash_size / 2,
            AddrDist::Uniform => self.rng.gen_range(0..self.flash_size),
            AddrDist::Zipf => self.zipf_addr.sample(&mut self.rng) * self.sector_size,
        }
    }

    fn next_block(&mut self) -> u64 {
        match self.block_dist {
            BlockDist::Constant => self.max_block,
            BlockDist::Zipf => self.zipf_block.sample(&mut self.rng),
        }
    }

    fn report(&self, exhausted_sector: u64) -> SimReport {
        let mut sum = 0u64;
        let mut min = u32::MAX;
        let mut max = 0u32;
        let mut nonzeros = 0u64;
        for &count in &self.erase_counts {
            if count != 0 {
                sum += count as u64;
                nonzeros += 1;
                min = min.min(count);
                max = max.max(count);
            }
        }
        let sectors = self.erase_counts.len() as u64;
        let normalized_endurance =
            sum as f64 / (self.endurance as u64 * sectors) as f64 * 100.0;
        let mean = if nonzeros != 0 { sum as f64 / nonzeros as f64 } else { 0.0 };
        let mut spread = 0.0;
        for &count in &self.erase_counts {
            if count != 0 {
                spread += (count as f64 - mean) * (count as f64 - mean);
            }
        }
        let variance = if nonzeros != 0 { spread / nonzeros as f64 } else { 0.0 };

        // what the persistent counters alone would let a monitor estimate
        let updaterate = self.state.max_count as u64;
        let max_pos = self.state.max_pos as u64;
        let estimated_erases = (self.state.cycle_count as u64 * max_pos * (max_pos - 1)
            + self.state.move_count as u64 * max_pos
            + self.state.pos as u64)
            * updaterate;

        SimReport {
            normalized_endurance,
            total_erases: self.total_erases,
            estimated_erases,
            min_count: if nonzeros != 0 { min } else { 0 },
            max_count: max,
            mean,
            variance,
            std_dev: variance.sqrt(),
            feistel_calls: self.feistel_calls,
            cycle_walks: self.cycle_walks,
            restarted: self.restarted,
            exhausted_sector,
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Copy)]
pub struct SimReport {
    /// achieved share of the theoretical erase budget, in percent
    pub normalized_endurance: f64,
    pub total_erases: u64,
    /// total implied by (pos, move_count, cycle_count) alone
    pub estimated_erases: u64,
    pub min_count: u32,
    pub max_count: u32,
    pub mean: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub feistel_calls: u64,
    pub cycle_walks: u64,
    pub restarted: u64,
    pub exhausted_sector: u64,
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NE {:.6} cycle_walks {} restarted {}",
            self.normalized_endurance, self.cycle_walks, self.restarted
        )
    }
}

/// Full-domain check that the keyed permutation really is one-to-one:
/// every sector must be hit exactly once. Keys come from `seed`.
pub fn mapping_self_test(cfg: &WlConfig, seed: u64) -> WlResult<()> {
    let geo = resolve(cfg, WlMode::Base)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let keys = [rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()];
    let feistel = Feistel::new(keys, geo.sector_count, cfg.sector_size as u64)?;

    let mut occurrences = vec![0u32; geo.sector_count as usize];
    for sector in 0..geo.sector_count {
        let (mapped, _) = feistel.permute_sector(sector);
        match occurrences.get_mut(mapped as usize) {
            Some(seen) => *seen += 1,
            None => {
                log::error!("sector 0x{:x} mapped outside the domain: 0x{:x}", sector, mapped);
                return Err(WlError::InvalidState);
            }
        }
    }
    for (sector, &seen) in occurrences.iter().enumerate() {
        if seen != 1 {
            log::error!("sector 0x{:x} was the image of {} sectors", sector, seen);
            return Err(WlError::InvalidState);
        }
    }
    log::info!("mapping is a permutation of {} sectors with keys ({}, {}, {})", geo.sector_count, keys[0], keys[1], keys[2]);
    Ok(())
}
