use crate::api::{FlashAccess, WlError, WlMode, WlResult};
use super::geometry::{resolve, WlGeometry};
use super::mapper::{advance_position, map_logical, Feistel};
use super::types::{
    base_slot_set, fill_base_slot, EraseCountRecord, SectorEraseRecord, WlConfig, WlState,
    state_crc_ok,
};

fn alloc_buffer(len: usize) -> WlResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| WlError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

fn alloc_counts(len: usize) -> WlResult<Vec<u16>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| WlError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// The wear-levelling engine.
///
/// Presents a logical, sector-addressable space of `chip_size()` bytes and
/// spreads erase load by rotating a hidden dummy page through the physical
/// area. The block device is borrowed for the engine's lifetime; all
/// persistent bookkeeping (duplicated state, position-update log, erase
/// counts) lives on the managed partition itself.
///
/// Base and advanced mode share this one type; the mode tag selects the
/// position-update record format and, in advanced mode, enables the Feistel
/// address permutation and the erase-count ledger.
pub struct WlFlash<'d> {
    pub(crate) dev: &'d mut dyn FlashAccess,
    pub(crate) cfg: WlConfig,
    pub(crate) geo: WlGeometry,
    pub(crate) state: WlState,
    pub(crate) mode: WlMode,
    pub(crate) feistel: Option<Feistel>,
    temp_buff: Vec<u8>,
    pub(crate) erase_counts: Vec<u16>,
    initialized: bool,
}

impl<'d> WlFlash<'d> {
    /// Bind the engine to a partition. Validates the config invariants and
    /// derives the region layout, but touches no flash; call [`init`] next.
    ///
    /// The config's CRC is recomputed here, so callers only fill in the
    /// payload fields.
    ///
    /// [`init`]: WlFlash::init
    pub fn configure(cfg: &WlConfig, mode: WlMode, dev: &'d mut dyn FlashAccess) -> WlResult<WlFlash<'d>> {
        if mode == WlMode::Undefined {
            return Err(WlError::InvalidConfig);
        }
        let mut cfg = *cfg;
        cfg.update_crc();
        let geo = resolve(&cfg, mode)?;
        if dev.len() < cfg.start_addr as u64 + cfg.full_mem_size as u64 {
            log::warn!(
                "device too small: 0x{:x} B for a partition of 0x{:x} B at 0x{:x}",
                dev.len(),
                cfg.full_mem_size,
                cfg.start_addr
            );
            return Err(WlError::InvalidConfig);
        }
        let temp_buff = alloc_buffer(cfg.temp_buff_size as usize)?;
        Ok(WlFlash {
            dev,
            cfg,
            geo,
            state: WlState::default(),
            mode,
            feistel: None,
            temp_buff,
            erase_counts: Vec::new(),
            initialized: false,
        })
    }

    /// Recover (or freshly create) the on-flash state and make the engine
    /// operational.
    ///
    /// Both state copies are read and CRC-checked; a single corrupt copy is
    /// rewritten from its twin, position-update records included. With no
    /// valid copy the partition is treated as virgin and all sections are
    /// initialized. The committed `pos` always comes from the
    /// position-update log, not from the state record.
    pub fn init(&mut self) -> WlResult<()> {
        self.initialized = false;

        let mut raw1 = [0u8; WlState::BYTES];
        let mut raw2 = [0u8; WlState::BYTES];
        self.dev.read(self.geo.addr_state1, &mut raw1)?;
        self.dev.read(self.geo.addr_state2, &mut raw2)?;
        let state1 = WlState::from_bytes(&raw1);
        let state2 = WlState::from_bytes(&raw2);
        let crc1_ok = state_crc_ok(&raw1) && self.state_plausible(&state1);
        let crc2_ok = state_crc_ok(&raw2) && self.state_plausible(&state2);

        match (crc1_ok, crc2_ok) {
            (true, true) => {
                self.state = state1;
                if state1.crc != state2.crc {
                    // the copy missed the last full rewrite
                    log::warn!("state copies diverge (crc 0x{:x} vs 0x{:x}), rewriting copy 2", state1.crc, state2.crc);
                    self.mirror_state(self.geo.addr_state1, self.geo.addr_state2)?;
                }
                self.recover_pos()?;
            }
            (true, false) => {
                log::warn!("state copy 2 is corrupt, rewriting from copy 1");
                self.state = state1;
                self.mirror_state(self.geo.addr_state1, self.geo.addr_state2)?;
                self.recover_pos()?;
            }
            (false, true) => {
                log::warn!("state copy 1 is corrupt, rewriting from copy 2");
                self.state = state2;
                self.mirror_state(self.geo.addr_state2, self.geo.addr_state1)?;
                self.recover_pos()?;
            }
            (false, false) => {
                log::info!("no valid state found, initializing a fresh partition");
                self.init_sections()?;
            }
        }

        if self.mode == WlMode::Advanced {
            if self.state.feistel_keys == 0 {
                log::warn!("advanced engine over a base-mode state; mapping degenerates to the plain rotation");
            }
            self.feistel = Some(Feistel::new(
                self.state.feistel_subkeys(),
                self.geo.sector_count,
                self.cfg.sector_size as u64,
            )?);
            self.erase_counts = alloc_counts(self.counts_len())?;
            self.read_counts()?;
        } else if self.state.feistel_keys != 0 {
            log::warn!("base engine over an advanced-mode state; the key word will be ignored");
        }

        self.initialized = true;
        log::info!(
            "mounted {}: pos=0x{:x}, max_pos=0x{:x}, move_count=0x{:x}, access_count=0x{:x}",
            self.mode.as_str(),
            self.state.pos,
            self.state.max_pos,
            self.state.move_count,
            self.state.access_count
        );
        Ok(())
    }

    /// A CRC-valid record can still describe a different layout (resized
    /// partition, foreign tooling); its slot log must fit the state region.
    fn state_plausible(&self, state: &WlState) -> bool {
        if state.max_pos < 2 {
            return false;
        }
        let log_bytes = WlState::BYTES as u64 + state.max_pos as u64 * self.cfg.wr_size as u64;
        log_bytes <= self.geo.state_size
    }

    /// Logical byte address to physical byte address within the usable
    /// area. Advanced mode first sends the sector index through the Feistel
    /// permutation; both modes then apply the rotation shift and skip over
    /// the dummy page.
    pub(crate) fn calc_addr(&self, addr: u64) -> u64 {
        let intermediate = match &self.feistel {
            Some(feistel) => feistel.randomize_addr(addr).0,
            None => addr,
        };
        let result = map_logical(
            self.geo.flash_size,
            self.cfg.page_size as u64,
            self.state.pos,
            self.state.move_count,
            intermediate,
        );
        log::trace!("calc_addr: 0x{:x} -> 0x{:x} (dummy at 0x{:x})", addr, result, self.state.pos as u64 * self.cfg.page_size as u64);
        result
    }

    fn ensure_init(&self) -> WlResult<()> {
        if self.initialized { Ok(()) } else { Err(WlError::InvalidState) }
    }

    /// Usable bytes presented to the client.
    pub fn chip_size(&self) -> u64 { self.geo.flash_size }

    pub fn sector_size(&self) -> u64 { self.cfg.sector_size as u64 }

    pub fn mode(&self) -> WlMode { self.mode }

    pub fn state(&self) -> &WlState { &self.state }

    /// Per-physical-sector rotation counts (advanced mode; empty in base).
    /// One count stands for `updaterate` erases.
    pub fn erase_counts(&self) -> &[u16] { &self.erase_counts }

    /// Erase the logical sector `sector`, accounting for it first.
    pub fn erase_sector(&mut self, sector: u64) -> WlResult<()> {
        self.ensure_init()?;
        log::trace!("erase_sector 0x{:x}", sector);
        self.update_wl(sector)?;
        let sector_size = self.cfg.sector_size as u64;
        let virt_addr = self.calc_addr(sector * sector_size);
        self.dev.erase_sector((self.cfg.start_addr as u64 + virt_addr) / sector_size)
    }

    /// Erase every sector overlapping `[addr, addr + len)`.
    pub fn erase_range(&mut self, addr: u64, len: u64) -> WlResult<()> {
        self.ensure_init()?;
        let sector_size = self.cfg.sector_size as u64;
        let first = addr / sector_size;
        let count = (len + sector_size - 1) / sector_size;
        log::trace!("erase_range: addr=0x{:x}, len=0x{:x} -> sectors 0x{:x}..0x{:x}", addr, len, first, first + count);
        for i in 0..count {
            self.erase_sector(first + i)?;
        }
        Ok(())
    }

    /// Write `src` starting at logical byte `dest_addr`, page by page. The
    /// destination pages are expected to be erased, as on raw flash.
    pub fn write(&mut self, dest_addr: u64, src: &[u8]) -> WlResult<()> {
        self.ensure_init()?;
        if src.is_empty() {
            return Ok(());
        }
        let page_size = self.cfg.page_size as usize;
        let start_addr = self.cfg.start_addr as u64;
        let count = (src.len() - 1) / page_size;
        for i in 0..count {
            let virt_addr = self.calc_addr(dest_addr + (i * page_size) as u64);
            self.dev.write(start_addr + virt_addr, &src[i * page_size..(i + 1) * page_size])?;
        }
        let virt_addr = self.calc_addr(dest_addr + (count * page_size) as u64);
        self.dev.write(start_addr + virt_addr, &src[count * page_size..])?;
        Ok(())
    }

    /// Read into `dst` starting at logical byte `src_addr`.
    pub fn read(&self, src_addr: u64, dst: &mut [u8]) -> WlResult<()> {
        self.ensure_init()?;
        if dst.is_empty() {
            return Ok(());
        }
        let page_size = self.cfg.page_size as usize;
        let start_addr = self.cfg.start_addr as u64;
        let count = (dst.len() - 1) / page_size;
        for i in 0..count {
            let virt_addr = self.calc_addr(src_addr + (i * page_size) as u64);
            self.dev.read(start_addr + virt_addr, &mut dst[i * page_size..(i + 1) * page_size])?;
        }
        let virt_addr = self.calc_addr(src_addr + (count * page_size) as u64);
        self.dev.read(start_addr + virt_addr, &mut dst[count * page_size..])?;
        Ok(())
    }

    /// Force the pending rotation so the current dummy also gets cycled
    /// before power-down. The dummy position itself stands in as the
    /// triggering sector, which over a full loop charges each sector one
    /// extra erase -- about what the maintenance traffic really costs.
    pub fn flush(&mut self) -> WlResult<()> {
        self.ensure_init()?;
        self.state.access_count = self.state.max_count - 1;
        let pos = self.state.pos as u64;
        self.update_wl(pos)
    }

    /// One erase worth of accounting. Every `max_count` calls this rotates
    /// the dummy: erase it, copy the next page into it, append a
    /// position-update record to both state regions, then advance `pos`.
    /// On a pos wrap the state (and in advanced mode the erase-count
    /// ledger) is rewritten in full.
    ///
    /// If any flash operation of the rotation fails, `access_count` is
    /// rewound so the very next call retries the same rotation.
    fn update_wl(&mut self, sector: u64) -> WlResult<()> {
        self.state.access_count += 1;
        if self.state.access_count < self.state.max_count {
            return Ok(());
        }
        self.state.access_count = 0;

        let page_size = self.cfg.page_size as u64;
        let start_addr = self.cfg.start_addr as u64;
        log::trace!("rotation due: sector=0x{:x}, pos=0x{:x}", sector, self.state.pos);

        // copy the next page into the dummy, in temp_buff sized chunks
        let mut data_pos = self.state.pos + 1;
        if data_pos >= self.state.max_pos {
            data_pos = 0;
        }
        let data_addr = start_addr + data_pos as u64 * page_size;
        let dummy_addr = start_addr + self.state.pos as u64 * page_size;

        if let Err(e) = self.dev.erase_range(dummy_addr, page_size) {
            log::error!("dummy erase failed, will retry next call: {}", e);
            self.rewind_access();
            return Err(e);
        }
        let chunk = self.cfg.temp_buff_size as u64;
        for i in 0..page_size / chunk {
            if let Err(e) = self.dev.read(data_addr + i * chunk, &mut self.temp_buff) {
                log::error!("page copy read failed, will retry next call: {}", e);
                self.rewind_access();
                return Err(e);
            }
            if let Err(e) = self.dev.write(dummy_addr + i * chunk, &self.temp_buff) {
                log::error!("page copy write failed, will retry next call: {}", e);
                self.rewind_access();
                return Err(e);
            }
        }

        // commit the new position to both logs before advancing
        self.fill_slot(sector);
        for region in [self.geo.addr_state1, self.geo.addr_state2] {
            if let Err(e) = self.write_slot(region) {
                log::error!("position update at 0x{:x} failed, will retry next call: {}", region, e);
                self.rewind_access();
                return Err(e);
            }
        }

        if advance_position(&mut self.state) {
            if self.mode != WlMode::Advanced {
                // the cycle counter lives in words base mode keeps reserved
                self.state.cycle_count = 0;
            }
            self.state.update_crc();
            if self.mode == WlMode::Advanced {
                // fold the full log into the ledger while it is still
                // intact, then persist both copies; the state rewrite below
                // resets the log
                self.update_counts()?;
                self.write_counts(self.geo.addr_erase_counts1)?;
                self.write_counts(self.geo.addr_erase_counts2)?;
            }
            self.write_state_region(self.geo.addr_state1)?;
            self.write_state_region(self.geo.addr_state2)?;
            log::debug!(
                "pos wrapped: move_count=0x{:x}, cycle_count=0x{:x}",
                self.state.move_count,
                self.state.cycle_count
            );
        }
        Ok(())
    }

    fn rewind_access(&mut self) { self.state.access_count = self.state.max_count - 1; }

    /// Stage the position-update record for the current `pos` in temp_buff.
    fn fill_slot(&mut self, sector: u64) {
        let wr_size = self.cfg.wr_size as usize;
        for byte in &mut self.temp_buff[..wr_size] {
            *byte = 0;
        }
        match self.mode {
            WlMode::Advanced => {
                let sector_size = self.cfg.sector_size as u64;
                let physical = self.calc_addr(sector * sector_size) / sector_size;
                let rec = SectorEraseRecord::new(self.state.device_id, self.state.pos, physical as u32);
                self.temp_buff[..SectorEraseRecord::BYTES].copy_from_slice(&rec.to_bytes());
                log::trace!("slot 0x{:x}: sector 0x{:x} maps to physical 0x{:x}", self.state.pos, sector, physical);
            }
            _ => fill_base_slot(&mut self.temp_buff[..SectorEraseRecord::BYTES], self.state.device_id, self.state.pos),
        }
    }

    fn write_slot(&mut self, region: u64) -> WlResult<()> {
        let wr_size = self.cfg.wr_size as u64;
        let addr = region + WlState::BYTES as u64 + self.state.pos as u64 * wr_size;
        self.dev.write(addr, &self.temp_buff[..wr_size as usize])
    }

    /// Read slot `n` of `region` into temp_buff.
    fn read_slot(&mut self, region: u64, n: u32) -> WlResult<()> {
        let wr_size = self.cfg.wr_size as u64;
        let addr = region + WlState::BYTES as u64 + n as u64 * wr_size;
        self.dev.read(addr, &mut self.temp_buff[..wr_size as usize])
    }

    /// Does temp_buff hold a set slot for index `n`?
    fn slot_set(&self, n: u32) -> bool {
        match self.mode {
            WlMode::Advanced => SectorEraseRecord::from_bytes(&self.temp_buff[..SectorEraseRecord::BYTES])
                .is_set(self.state.device_id, n),
            _ => base_slot_set(&self.temp_buff[..SectorEraseRecord::BYTES], self.state.device_id, n),
        }
    }

    /// The committed position is the first unset slot of region 1.
    fn recover_pos(&mut self) -> WlResult<()> {
        let mut position = 0;
        for i in 0..self.state.max_pos {
            position = i;
            self.read_slot(self.geo.addr_state1, i)?;
            if !self.slot_set(i) {
                break;
            }
        }
        self.state.pos = position.min(self.state.max_pos - 1);
        log::debug!("recovered pos=0x{:x}", self.state.pos);
        Ok(())
    }

    /// Rewrite the state region at `to` from the adopted state plus every
    /// set slot of the region at `from`.
    fn mirror_state(&mut self, from: u64, to: u64) -> WlResult<()> {
        self.dev.erase_range(to, self.geo.state_size)?;
        self.dev.write(to, &self.state.to_bytes())?;
        let wr_size = self.cfg.wr_size as u64;
        for i in 0..self.state.max_pos {
            self.read_slot(from, i)?;
            if self.slot_set(i) {
                let addr = to + WlState::BYTES as u64 + i as u64 * wr_size;
                self.dev.write(addr, &self.temp_buff[..wr_size as usize])?;
            }
        }
        Ok(())
    }

    fn write_state_region(&mut self, region: u64) -> WlResult<()> {
        self.dev.erase_range(region, self.geo.state_size)?;
        self.dev.write(region, &self.state.to_bytes())
    }

    /// First-time setup of a virgin partition: fresh counters, random
    /// device id (and Feistel keys in advanced mode), both state regions,
    /// the config sector, and in advanced mode two erased erase-count
    /// regions.
    fn init_sections(&mut self) -> WlResult<()> {
        let mut state = WlState::default();
        state.max_count = if self.cfg.updaterate != 0 {
            self.cfg.updaterate
        } else {
            // updaterate 0 selects a geometry-derived default
            ((self.geo.flash_size / self.geo.state_size) as u32).max(1)
        };
        state.version = self.cfg.version;
        state.block_size = self.cfg.page_size;
        state.device_id = rand::random::<u32>();
        state.max_pos = self.geo.max_pos;
        if self.mode == WlMode::Advanced {
            // a zero key word would read back as base mode
            state.feistel_keys = loop {
                let keys = rand::random::<u32>();
                if keys != 0 {
                    break keys;
                }
            };
        }
        state.update_crc();
        self.state = state;

        self.write_state_region(self.geo.addr_state1)?;
        self.write_state_region(self.geo.addr_state2)?;

        self.dev.erase_range(self.geo.addr_cfg, self.geo.cfg_size)?;
        self.dev.write(self.geo.addr_cfg, &self.cfg.to_bytes())?;

        if self.mode == WlMode::Advanced {
            self.dev.erase_range(self.geo.addr_erase_counts1, self.geo.erase_count_records_size)?;
            self.dev.erase_range(self.geo.addr_erase_counts2, self.geo.erase_count_records_size)?;
        }
        log::debug!(
            "fresh sections written: device_id=0x{:x}, max_count=0x{:x}, max_pos=0x{:x}",
            self.state.device_id,
            self.state.max_count,
            self.state.max_pos
        );
        Ok(())
    }

    fn counts_len(&self) -> usize {
        // every physical sector the mapping can produce, dummy included
        ((self.geo.flash_size + self.cfg.page_size as u64) / self.cfg.sector_size as u64) as usize
    }

    /// Tally the position-update log of region 1 into the in-memory
    /// ledger. One record stands for `updaterate` erases of its sector.
    fn update_counts(&mut self) -> WlResult<()> {
        for i in 0..self.state.max_pos {
            self.read_slot(self.geo.addr_state1, i)?;
            if !self.slot_set(i) {
                log::debug!("log ends at slot 0x{:x}", i);
                break;
            }
            let rec = SectorEraseRecord::from_bytes(&self.temp_buff[..SectorEraseRecord::BYTES]);
            match self.erase_counts.get_mut(rec.sector as usize) {
                Some(count) => *count = count.saturating_add(1),
                None => log::warn!("record at slot 0x{:x} names sector 0x{:x}, outside the partition", i, rec.sector),
            }
        }
        Ok(())
    }

    /// Persist the ledger into one of the two reserved regions: non-zero
    /// counts packed three pairs per CRC-protected record, a trailing
    /// partial record padded with zero pairs.
    fn write_counts(&mut self, region: u64) -> WlResult<()> {
        self.dev.erase_range(region, self.geo.erase_count_records_size)?;
        let capacity = self.geo.erase_count_records_size / EraseCountRecord::BYTES as u64;
        let mut pairs = [(0u16, 0u16); 3];
        let mut pair_index = 0;
        let mut record_index = 0u64;
        for (sector, &count) in self.erase_counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            pairs[pair_index] = (sector as u16, count);
            pair_index += 1;
            if pair_index == 3 {
                if record_index >= capacity {
                    log::warn!("erase-count region at 0x{:x} is full, dropping the remaining counts", region);
                    return Ok(());
                }
                let rec = EraseCountRecord::new(pairs);
                self.dev.write(region + record_index * EraseCountRecord::BYTES as u64, &rec.to_bytes())?;
                record_index += 1;
                pair_index = 0;
                pairs = [(0, 0); 3];
            }
        }
        if pair_index > 0 && record_index < capacity {
            let rec = EraseCountRecord::new(pairs);
            self.dev.write(region + record_index * EraseCountRecord::BYTES as u64, &rec.to_bytes())?;
        }
        Ok(())
    }

    /// Load the persisted ledger, preferring region 1 and falling back to
    /// region 2 record by record. The first record that fails in both
    /// copies ends the log.
    fn read_counts(&mut self) -> WlResult<()> {
        for count in &mut self.erase_counts {
            *count = 0;
        }
        if self.state.move_count == 0 && self.state.cycle_count == 0 {
            log::info!("no erase counts persisted yet");
            return Ok(());
        }
        let record_bytes = EraseCountRecord::BYTES as u64;
        for i in 0..self.geo.erase_count_records_size / record_bytes {
            let mut raw = [0u8; EraseCountRecord::BYTES];
            self.dev.read(self.geo.addr_erase_counts1 + i * record_bytes, &mut raw)?;
            if !EraseCountRecord::crc_ok(&raw) {
                log::warn!("erase-count record 0x{:x} invalid in copy 1, trying copy 2", i);
                self.dev.read(self.geo.addr_erase_counts2 + i * record_bytes, &mut raw)?;
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
        log::debug!("erase counts loaded");
        Ok(())
    }
}
