use crate::api::{WlError, WlMode, WlResult};
use super::types::{EraseCountRecord, WlConfig, WlState};

/// Addresses and sizes of every on-flash region, derived from a config.
///
/// Layout, low to high addresses (erase-count regions exist only in
/// advanced mode):
///
/// ```text
/// [ usable area + dummy page | ec1 | ec2 | state1 | state2 | config ]
/// ```
///
/// All addresses are byte offsets in the same space the config's
/// `start_addr` lives in; `flash_size` is the usable byte count presented
/// to the client, with the dummy page already subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WlGeometry {
    pub state_size: u64,
    pub cfg_size: u64,
    pub addr_state1: u64,
    pub addr_state2: u64,
    pub addr_cfg: u64,
    /// meaningful only in advanced mode, zero otherwise
    pub addr_erase_counts1: u64,
    pub addr_erase_counts2: u64,
    pub erase_count_records_size: u64,
    pub flash_size: u64,
    pub max_pos: u32,
    pub sector_count: u64,
}

fn align_up(value: u64, unit: u64) -> u64 { (value + unit - 1) / unit * unit }

/// Bytes the config record occupies on flash: its sector-aligned size.
/// The monitor derives the probe offset of the config from this, so it
/// must stay in lockstep with [`resolve`].
pub(crate) fn config_region_size(sector_size: u64) -> u64 {
    align_up(WlConfig::BYTES as u64, sector_size)
}

/// Derive the region layout for `cfg`, checking its invariants.
///
/// The state regions land in the same place for both modes; advanced mode
/// additionally carves two erase-count regions out of the usable area just
/// below them.
pub(crate) fn resolve(cfg: &WlConfig, mode: WlMode) -> WlResult<WlGeometry> {
    let sector_size = cfg.sector_size as u64;
    let page_size = cfg.page_size as u64;
    let full_mem_size = cfg.full_mem_size as u64;
    let start_addr = cfg.start_addr as u64;

    if cfg.sector_size == 0
        || cfg.page_size < cfg.sector_size
        || cfg.page_size % cfg.sector_size != 0
        || cfg.full_mem_size % cfg.sector_size != 0
    {
        log::warn!(
            "rejecting config: sector_size=0x{:x}, page_size=0x{:x}, full_mem_size=0x{:x}",
            cfg.sector_size,
            cfg.page_size,
            cfg.full_mem_size
        );
        return Err(WlError::InvalidConfig);
    }
    // position-update slots must hold a full record, and the copy buffer is
    // also used to stage one slot at a time
    if cfg.wr_size < 16
        || cfg.sector_size % cfg.wr_size != 0
        || cfg.temp_buff_size < cfg.wr_size
        || cfg.page_size % cfg.temp_buff_size != 0
    {
        log::warn!(
            "rejecting config: wr_size=0x{:x}, temp_buff_size=0x{:x}",
            cfg.wr_size,
            cfg.temp_buff_size
        );
        return Err(WlError::InvalidConfig);
    }

    // the state record plus one position-update slot per sector, in whole
    // sectors, minimum one
    let state_payload = WlState::BYTES as u64 + (full_mem_size / sector_size) * cfg.wr_size as u64;
    let state_size = align_up(state_payload, sector_size).max(sector_size);
    let cfg_size = config_region_size(sector_size);

    let reserved = 2 * state_size + cfg_size;
    if full_mem_size < reserved + 2 * page_size {
        log::warn!("rejecting config: 0x{:x} B partition cannot fit the reserved regions", full_mem_size);
        return Err(WlError::InvalidConfig);
    }

    let addr_state2 = start_addr + full_mem_size - state_size - cfg_size;
    let addr_state1 = addr_state2 - state_size;
    let addr_cfg = start_addr + full_mem_size - cfg_size;

    // one page of the remainder is the dummy; it is not client-addressable
    let mut flash_size = ((full_mem_size - reserved) / page_size - 1) * page_size;

    let mut addr_erase_counts1 = 0;
    let mut addr_erase_counts2 = 0;
    let mut erase_count_records_size = 0;
    if mode == WlMode::Advanced {
        // two sectors minimum stay reserved for the counts themselves; the
        // remaining sectors are what the ledger has to describe
        if flash_size <= 2 * sector_size {
            return Err(WlError::InvalidConfig);
        }
        let ledger_sectors = (flash_size - 2 * sector_size) / sector_size;
        let records_bytes = ((ledger_sectors + 2) / 3) * EraseCountRecord::BYTES as u64;
        erase_count_records_size = align_up(records_bytes, sector_size);
        if flash_size <= 2 * erase_count_records_size {
            return Err(WlError::InvalidConfig);
        }
        flash_size -= 2 * erase_count_records_size;
        addr_erase_counts1 = addr_state1 - 2 * erase_count_records_size;
        addr_erase_counts2 = addr_state1 - erase_count_records_size;
    }

    if flash_size < page_size {
        return Err(WlError::InvalidConfig);
    }

    let geo = WlGeometry {
        state_size,
        cfg_size,
        addr_state1,
        addr_state2,
        addr_cfg,
        addr_erase_counts1,
        addr_erase_counts2,
        erase_count_records_size,
        flash_size,
        max_pos: (1 + flash_size / page_size) as u32,
        sector_count: flash_size / sector_size,
    };
    log::debug!(
        "geometry: flash_size=0x{:x}, state_size=0x{:x}, state1=0x{:x}, state2=0x{:x}, ec1=0x{:x}, ec2=0x{:x}, max_pos=0x{:x}",
        geo.flash_size,
        geo.state_size,
        geo.addr_state1,
        geo.addr_state2,
        geo.addr_erase_counts1,
        geo.addr_erase_counts2,
        geo.max_pos
    );
    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_1m() -> WlConfig {
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

    #[test]
    fn one_megabyte_partition_layout() {
        let geo = resolve(&cfg_1m(), WlMode::Base).unwrap();
        assert_eq!(geo.state_size, 0x2000);
        assert_eq!(geo.cfg_size, 0x1000);
        assert_eq!(geo.addr_state1, 0xFB000);
        assert_eq!(geo.addr_state2, 0xFD000);
        assert_eq!(geo.addr_cfg, 0xFF000);
        assert_eq!(geo.flash_size, 0xFA000);
        assert_eq!(geo.max_pos, 0xFB);

        // advanced mode carves one sector per erase-count copy out of the
        // usable area
        let geo = resolve(&cfg_1m(), WlMode::Advanced).unwrap();
        assert_eq!(geo.erase_count_records_size, 0x1000);
        assert_eq!(geo.addr_erase_counts1, 0xF9000);
        assert_eq!(geo.addr_erase_counts2, 0xFA000);
        assert_eq!(geo.flash_size, 0xF8000);
        assert_eq!(geo.max_pos, 0xF9);
        assert_eq!(geo.sector_count, 0xF8);
    }

    #[test]
    fn start_addr_offsets_every_region() {
        let mut cfg = cfg_1m();
        cfg.start_addr = 0x2_0000;
        let geo = resolve(&cfg, WlMode::Base).unwrap();
        assert_eq!(geo.addr_state1, 0x2_0000 + 0xFB000);
        assert_eq!(geo.addr_cfg, 0x2_0000 + 0xFF000);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut cfg = cfg_1m();
        cfg.page_size = 0x800; // smaller than a sector
        assert!(matches!(resolve(&cfg, WlMode::Base), Err(WlError::InvalidConfig)));

        let mut cfg = cfg_1m();
        cfg.wr_size = 8; // cannot hold a position-update record
        assert!(matches!(resolve(&cfg, WlMode::Base), Err(WlError::InvalidConfig)));

        let mut cfg = cfg_1m();
        cfg.temp_buff_size = 0x30; // does not divide the page size
        assert!(matches!(resolve(&cfg, WlMode::Base), Err(WlError::InvalidConfig)));

        let mut cfg = cfg_1m();
        cfg.full_mem_size = 0x5000; // no room left for data
        assert!(matches!(resolve(&cfg, WlMode::Base), Err(WlError::InvalidConfig)));
    }
}
