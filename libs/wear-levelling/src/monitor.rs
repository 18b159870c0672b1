//! Read-only reconstruction of a partition's wear-levelling status.
//!
//! The monitor never writes: it holds a shared borrow of the image and the
//! `FlashAccess` trait only offers reads through `&self`. Everything the
//! engine persists -- config, state, position-update log, erase-count
//! ledger -- is rebuilt from the image alone, including which engine
//! variant wrote it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::api::{FlashAccess, WlError, WlMode, WlResult};
use crate::backend::{
    base_slot_set, config_crc_ok, config_region_size, resolve, state_crc_ok, EraseCountRecord,
    SectorEraseRecord, WlConfig, WlGeometry, WlState,
};

/// Read and verify the config record from the end of a partition.
///
/// The record occupies the final sector-aligned block the engine reserves,
/// so its offset depends on the erase sector size of the flash the image
/// came from. That size cannot be read from the image (the config is what
/// would say so); `sector_size` is the caller's declaration of it.
///
/// Refuses encrypted partitions outright: their last sector is ciphertext
/// and cannot carry a readable config.
pub fn read_config(dev: &dyn FlashAccess, sector_size: u64) -> WlResult<WlConfig> {
    if dev.is_encrypted() {
        log::error!("cannot read a config record from an encrypted partition");
        return Err(WlError::Encrypted);
    }
    if sector_size == 0 {
        return Err(WlError::InvalidConfig);
    }
    let cfg_size = config_region_size(sector_size);
    if dev.len() < cfg_size {
        return Err(WlError::NotFound);
    }
    let mut raw = [0u8; WlConfig::BYTES];
    dev.read(dev.len() - cfg_size, &mut raw)?;
    if !config_crc_ok(&raw) {
        return Err(WlError::InvalidCrc);
    }
    let cfg = WlConfig::from_bytes(&raw);
    if cfg.sector_size as u64 != sector_size {
        log::warn!(
            "config record declares sector_size=0x{:x} but was probed with 0x{:x}",
            cfg.sector_size,
            sector_size
        );
    }
    Ok(cfg)
}

/// Probe a set of candidate data partitions and return the index and
/// config of the first one carrying a CRC-valid config record.
/// `sector_size` declares the erase sector size of the imaged flash, as
/// for [`read_config`].
///
/// Only a wear-levelled partition ends in a valid config; on anything else
/// the probed bytes are payload data and the CRC check fails.
pub fn find_wl_partition(
    candidates: &[&dyn FlashAccess],
    sector_size: u64,
) -> WlResult<(usize, WlConfig)> {
    for (index, dev) in candidates.iter().enumerate() {
        match read_config(*dev, sector_size) {
            Ok(cfg) => {
                log::debug!("candidate {} carries a valid config record", index);
                return Ok((index, cfg));
            }
            Err(e) => log::debug!("candidate {} rejected: {}", index, e),
        }
    }
    Err(WlError::NotFound)
}

/// Convenience wrapper: locate the config on `dev` (probing with the
/// declared erase sector size) and reconstruct the full status document
/// from it.
pub fn get_status(dev: &dyn FlashAccess, sector_size: u64) -> WlResult<WlStatus> {
    let cfg = read_config(dev, sector_size)?;
    let monitor = WlMonitor::reconstruct(cfg, dev)?;
    Ok(monitor.status())
}

/// Post-mortem view over a partition image.
pub struct WlMonitor<'d> {
    dev: &'d dyn FlashAccess,
    cfg: WlConfig,
    state: WlState,
    mode: WlMode,
    erase_counts: Vec<u16>,
}

impl<'d> WlMonitor<'d> {
    /// Rebuild the wear-levelling status from `dev`.
    ///
    /// The engine variant is identified twice over: the `feistel_keys` word
    /// of the state record tags advanced mode, and the position-update log
    /// only scans as non-empty under the slot predicate of the variant that
    /// wrote it. The two must agree; a log that scans as non-empty under
    /// both predicates is ambiguous and rejected.
    pub fn reconstruct(cfg: WlConfig, dev: &'d dyn FlashAccess) -> WlResult<WlMonitor<'d>> {
        // the state regions sit in the same place for both variants
        let geo = resolve(&cfg, WlMode::Base)?;

        let mut raw = [0u8; WlState::BYTES];
        dev.read(geo.addr_state1, &mut raw)?;
        if !state_crc_ok(&raw) {
            return Err(WlError::InvalidCrc);
        }
        let mut state = WlState::from_bytes(&raw);
        if state.max_pos < 2
            || WlState::BYTES as u64 + state.max_pos as u64 * cfg.wr_size as u64 > geo.state_size
        {
            log::error!("state record claims max_pos=0x{:x}, which cannot fit its own log", state.max_pos);
            return Err(WlError::InvalidState);
        }

        let tag_advanced = state.feistel_keys != 0;
        let pos_base = scan_position_log(dev, &geo, &cfg, &state, WlMode::Base)?;
        let pos_advanced = scan_position_log(dev, &geo, &cfg, &state, WlMode::Advanced)?;
        log::debug!(
            "recovery scans: base=0x{:x}, advanced=0x{:x}, key tag={}",
            pos_base,
            pos_advanced,
            if tag_advanced { "advanced" } else { "base" }
        );

        let (mode, pos) = match (pos_base, pos_advanced) {
            // no record scans as set under either predicate: the key word
            // is the only evidence left
            (0, 0) if tag_advanced => (WlMode::Advanced, 0),
            (0, 0) => (WlMode::Undefined, 0),
            (pos, 0) => (WlMode::Base, pos),
            (0, pos) => (WlMode::Advanced, pos),
            (base, advanced) => {
                log::error!("position log is ambiguous: base scan 0x{:x}, advanced scan 0x{:x}", base, advanced);
                return Err(WlError::InvalidState);
            }
        };
        match mode {
            WlMode::Base if tag_advanced => {
                log::error!("base-mode log under an advanced key tag");
                return Err(WlError::InvalidState);
            }
            WlMode::Advanced if !tag_advanced => {
                log::error!("advanced-mode log without a key tag");
                return Err(WlError::InvalidState);
            }
            _ => {}
        }
        state.pos = pos.min(state.max_pos - 1);

        let mut monitor = WlMonitor { dev, cfg, state, mode, erase_counts: Vec::new() };
        if mode == WlMode::Advanced {
            monitor.load_erase_counts()?;
        }
        log::info!("reconstructed {}: pos=0x{:x}, max_pos=0x{:x}", mode.as_str(), state.pos, state.max_pos);
        Ok(monitor)
    }

    /// Ledger checkpoint plus whatever the position-update log has
    /// accumulated since: the same view the engine would load and tally.
    fn load_erase_counts(&mut self) -> WlResult<()> {
        let geo = resolve(&self.cfg, WlMode::Advanced)?;
        let counts_len = ((geo.flash_size + self.cfg.page_size as u64) / self.cfg.sector_size as u64) as usize;
        self.erase_counts = vec![0; counts_len];

        // the checkpoint regions are only written once move_count wraps
        if self.state.move_count != 0 || self.state.cycle_count != 0 {
            let record_bytes = EraseCountRecord::BYTES as u64;
            for i in 0..geo.erase_count_records_size / record_bytes {
                let mut raw = [0u8; EraseCountRecord::BYTES];
                self.dev.read(geo.addr_erase_counts1 + i * record_bytes, &mut raw)?;
                if !EraseCountRecord::crc_ok(&raw) {
                    self.dev.read(geo.addr_erase_counts2 + i * record_bytes, &mut raw)?;
                    if !EraseCountRecord::crc_ok(&raw) {
                        log::debug!("erase-count log ends at record 0x{:x}", i);
                        break;
                    }
                }
                let rec = EraseCountRecord::from_bytes(&raw);
                for (sector, count) in rec.pairs.iter() {
                    if *count != 0 {
                        if let Some(slot) = self.erase_counts.get_mut(*sector as usize) {
                            *slot = *count;
                        }
                    }
                }
            }
        }

        // records still sitting in the position-update log have not been
        // folded into the checkpoint yet
        let wr_size = self.cfg.wr_size as u64;
        let base = resolve(&self.cfg, WlMode::Base)?;
        let mut slot = vec![0u8; self.cfg.wr_size as usize];
        for i in 0..self.state.max_pos {
            self.dev.read(base.addr_state1 + WlState::BYTES as u64 + i as u64 * wr_size, &mut slot)?;
            let rec = SectorEraseRecord::from_bytes(&slot[..SectorEraseRecord::BYTES]);
            if !rec.is_set(self.state.device_id, i) {
                break;
            }
            if let Some(count) = self.erase_counts.get_mut(rec.sector as usize) {
                *count = count.saturating_add(1);
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> WlMode { self.mode }

    pub fn state(&self) -> &WlState { &self.state }

    pub fn config(&self) -> &WlConfig { &self.cfg }

    pub fn erase_counts(&self) -> &[u16] { &self.erase_counts }

    /// Assemble the status document.
    pub fn status(&self) -> WlStatus {
        let advanced = self.mode == WlMode::Advanced;
        WlStatus {
            wl_mode: self.mode.as_str(),
            config: WlConfigStatus {
                start_addr: hex(self.cfg.start_addr),
                full_mem_size: hex(self.cfg.full_mem_size),
                page_size: hex(self.cfg.page_size),
                sector_size: hex(self.cfg.sector_size),
                updaterate: hex(self.cfg.updaterate),
                wr_size: hex(self.cfg.wr_size),
                version: hex(self.cfg.version),
                temp_buff_size: hex(self.cfg.temp_buff_size),
                crc: hex(self.cfg.crc),
            },
            state: WlStateStatus {
                pos: hex(self.state.pos),
                max_pos: hex(self.state.max_pos),
                move_count: hex(self.state.move_count),
                access_count: hex(self.state.access_count),
                max_count: hex(self.state.max_count),
                block_size: hex(self.state.block_size),
                version: hex(self.state.version),
                device_id: hex(self.state.device_id),
                crc: hex(self.state.crc),
                cycle_count: if advanced { Some(hex(self.state.cycle_count)) } else { None },
                feistel_keys: if advanced { Some(self.state.feistel_subkeys()) } else { None },
            },
            erase_counts: if advanced {
                Some(
                    self.erase_counts
                        .iter()
                        .enumerate()
                        .filter(|(_, &count)| count != 0)
                        .map(|(sector, &count)| (sector as u32, count.to_string()))
                        .collect(),
                )
            } else {
                None
            },
        }
    }
}

/// Walk the position-update log of state region 1 under one variant's slot
/// predicate; the first unset slot is the committed position.
fn scan_position_log(
    dev: &dyn FlashAccess,
    geo: &WlGeometry,
    cfg: &WlConfig,
    state: &WlState,
    mode: WlMode,
) -> WlResult<u32> {
    let wr_size = cfg.wr_size as u64;
    let mut slot = vec![0u8; cfg.wr_size as usize];
    let mut position = 0;
    for i in 0..state.max_pos {
        position = i;
        dev.read(geo.addr_state1 + WlState::BYTES as u64 + i as u64 * wr_size, &mut slot)?;
        let set = match mode {
            WlMode::Advanced => SectorEraseRecord::from_bytes(&slot[..SectorEraseRecord::BYTES])
                .is_set(state.device_id, i),
            _ => base_slot_set(&slot[..SectorEraseRecord::BYTES], state.device_id, i),
        };
        if !set {
            break;
        }
    }
    Ok(position)
}

fn hex(value: u32) -> String { format!("{:#x}", value) }

/// Machine-readable status document; the `wlmon` tool serializes this to
/// JSON. All counters render as hex strings; the advanced-only fields are
/// omitted for base-mode (and undefined) partitions.
#[derive(Debug, Serialize)]
pub struct WlStatus {
    pub wl_mode: &'static str,
    pub config: WlConfigStatus,
    pub state: WlStateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erase_counts: Option<BTreeMap<u32, String>>,
}

#[derive(Debug, Serialize)]
pub struct WlConfigStatus {
    pub start_addr: String,
    pub full_mem_size: String,
    pub page_size: String,
    pub sector_size: String,
    pub updaterate: String,
    pub wr_size: String,
    pub version: String,
    pub temp_buff_size: String,
    pub crc: String,
}

#[derive(Debug, Serialize)]
pub struct WlStateStatus {
    pub pos: String,
    pub max_pos: String,
    pub move_count: String,
    pub access_count: String,
    pub max_count: String,
    pub block_size: String,
    pub version: String,
    pub device_id: String,
    pub crc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_count: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feistel_keys: Option<[u8; 3]>,
}
