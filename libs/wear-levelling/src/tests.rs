use std::io::{Error, ErrorKind};

use crate::api::{FlashAccess, WlError, WlMode};
use crate::backend::{
    base_slot_set, resolve, EraseCountRecord, MemFlash, SectorEraseRecord, WlConfig, WlFlash,
    WlState,
};
use crate::monitor::{self, WlMonitor};

/// The 1 MiB / 4 KiB layout used across the test bench.
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

/// Small enough that the advanced layout ends up with max_pos = 4 and
/// three usable sectors, so full passes take only 64 erases.
fn cfg_tiny() -> WlConfig {
    WlConfig { full_mem_size: 0x9000, ..cfg_1m() }
}

fn fresh_flash(cfg: &WlConfig) -> MemFlash {
    MemFlash::new((cfg.start_addr + cfg.full_mem_size) as usize, cfg.sector_size as u64)
}

/// Hand-write a sealed config and state onto a virgin image, bypassing the
/// engine, so tests control every field (including the Feistel keys).
fn craft_partition(flash: &mut MemFlash, cfg: &WlConfig, state: &WlState) {
    let mode = if state.feistel_keys != 0 { WlMode::Advanced } else { WlMode::Base };
    // state addresses do not depend on the mode, but resolving in advanced
    // mode validates that the erase-count regions fit too
    let geo = resolve(cfg, mode).or_else(|_| resolve(cfg, WlMode::Base)).unwrap();
    let mut cfg = *cfg;
    cfg.update_crc();
    let mut state = *state;
    state.update_crc();
    let mem = flash.as_mut_slice();
    mem[geo.addr_cfg as usize..geo.addr_cfg as usize + WlConfig::BYTES].copy_from_slice(&cfg.to_bytes());
    for region in [geo.addr_state1, geo.addr_state2] {
        mem[region as usize..region as usize + WlState::BYTES].copy_from_slice(&state.to_bytes());
    }
}

fn tiny_state(device_id: u32, feistel_keys: u32) -> WlState {
    WlState {
        max_pos: 4,
        max_count: 0x10,
        block_size: 0x1000,
        version: 2,
        device_id,
        feistel_keys,
        ..Default::default()
    }
}

#[test]
fn base_rotation_commits_one_slot() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let device_id;
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
        wl.init().unwrap();
        device_id = wl.state().device_id;
        // exactly updaterate erases of one hot sector force one rotation
        for _ in 0..0x10 {
            wl.erase_sector(5).unwrap();
        }
        assert_eq!(wl.state().pos, 1);
        assert_eq!(wl.state().move_count, 0);
        assert_eq!(wl.state().access_count, 0);
    }
    let geo = resolve(&cfg, WlMode::Base).unwrap();
    for region in [geo.addr_state1, geo.addr_state2] {
        let slot0 = (region as usize) + WlState::BYTES;
        assert!(
            base_slot_set(&flash.as_slice()[slot0..slot0 + 16], device_id, 0),
            "slot 0 not committed in region at 0x{:x}",
            region
        );
        // the next slot is still erased
        assert!(!base_slot_set(&flash.as_slice()[slot0 + 16..slot0 + 32], device_id, 1));
    }
}

#[test]
fn dummy_page_is_never_a_mapping_target() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();
    let page = cfg.page_size as u64;
    // check at several dummy positions, driving rotations in between
    for _ in 0..3 {
        let dummy = wl.state().pos as u64 * page;
        for sector in 0..wl.geo.sector_count {
            let phys = wl.calc_addr(sector * cfg.sector_size as u64);
            assert!(
                !(phys >= dummy && phys < dummy + page),
                "logical sector 0x{:x} mapped into the dummy page at 0x{:x}",
                sector,
                dummy
            );
        }
        for _ in 0..0x10 {
            wl.erase_sector(1).unwrap();
        }
    }
}

#[test]
fn write_read_round_trip() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();

    let mut pattern = vec![0u8; 0x1800]; // one page plus a partial tail
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i * 7) as u8;
    }
    wl.write(0x3000, &pattern).unwrap();
    let mut readback = vec![0u8; pattern.len()];
    wl.read(0x3000, &mut readback).unwrap();
    assert_eq!(pattern, readback);
}

#[test]
fn data_survives_rotations_and_wraps() {
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
    wl.init().unwrap();

    let page = cfg.page_size as usize;
    let pattern: Vec<u8> = (0..page).map(|i| (i * 13 + 5) as u8).collect();
    wl.write(0, &pattern).unwrap();

    // two full passes of the dummy over the area, erasing another sector
    let rotations = 2 * wl.state().max_pos;
    for _ in 0..rotations * 0x10 {
        wl.erase_sector(1).unwrap();
    }
    assert!(wl.state().move_count > 0);

    let mut readback = vec![0u8; page];
    wl.read(0, &mut readback).unwrap();
    assert_eq!(pattern, readback);
}

#[test]
fn flush_forces_one_rotation_each_time() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();

    wl.flush().unwrap();
    assert_eq!((wl.state().pos, wl.state().access_count), (1, 0));
    wl.flush().unwrap();
    assert_eq!((wl.state().pos, wl.state().access_count), (2, 0));
}

#[test]
fn calls_before_init_are_rejected() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(wl.read(0, &mut buf), Err(WlError::InvalidState)));
    assert!(matches!(wl.write(0, &buf), Err(WlError::InvalidState)));
    assert!(matches!(wl.erase_sector(0), Err(WlError::InvalidState)));
    assert!(matches!(wl.erase_range(0, 0x1000), Err(WlError::InvalidState)));
    assert!(matches!(wl.flush(), Err(WlError::InvalidState)));
}

#[test]
fn corrupt_state_copy_is_rewritten_from_its_twin() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let geo = resolve(&cfg, WlMode::Advanced).unwrap();
    let device_id;
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        device_id = wl.state().device_id;
        // three rotations leave three committed slots
        for _ in 0..3 * 0x10 {
            wl.erase_sector(7).unwrap();
        }
        assert_eq!(wl.state().pos, 3);
    }

    // main copy loses a byte of its record
    flash.as_mut_slice()[geo.addr_state1 as usize + 9] ^= 0xA5;

    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();
    assert_eq!(wl.state().device_id, device_id);
    assert_eq!(wl.state().pos, 3);
    drop(wl);

    let mem = flash.as_slice();
    let rec1 = &mem[geo.addr_state1 as usize..geo.addr_state1 as usize + WlState::BYTES];
    let rec2 = &mem[geo.addr_state2 as usize..geo.addr_state2 as usize + WlState::BYTES];
    assert_eq!(rec1, rec2, "copy 1 was not rewritten from copy 2");
    // the mirrored log must carry the same three slots
    for i in 0..3u32 {
        let slot = geo.addr_state1 as usize + WlState::BYTES + i as usize * 0x10;
        let rec = SectorEraseRecord::from_bytes(&mem[slot..slot + 16]);
        assert!(rec.is_set(device_id, i));
    }
}

#[test]
fn recovery_is_a_fixed_point() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let geo = resolve(&cfg, WlMode::Advanced).unwrap();
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        for _ in 0..2 * 0x10 {
            wl.erase_sector(9).unwrap();
        }
    }
    flash.as_mut_slice()[geo.addr_state2 as usize + 17] ^= 0xFF;

    let first;
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        first = *wl.state();
    }
    let snapshot = flash.as_slice().to_vec();
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        assert_eq!(*wl.state(), first);
    }
    // the second recovery found nothing left to repair
    assert_eq!(snapshot, flash.as_slice());
}

#[test]
fn partial_log_recovers_to_the_last_committed_position() {
    // a crash after the slot writes but before any state rewrite: the log
    // prefix alone carries the position
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    let device_id = 0x5EED_1D;
    craft_partition(&mut flash, &cfg, &tiny_state(device_id, 0));
    let geo = resolve(&cfg, WlMode::Base).unwrap();

    // hand-commit slots 0 and 1 in region 1 only, as if power died before
    // the mirror write of slot 1 finished
    for (region, slots) in [(geo.addr_state1, 2u32), (geo.addr_state2, 1u32)] {
        for i in 0..slots {
            let mut buf = [0u8; 16];
            crate::backend::fill_base_slot(&mut buf, device_id, i);
            let addr = region as usize + WlState::BYTES + i as usize * 0x10;
            flash.as_mut_slice()[addr..addr + 16].copy_from_slice(&buf);
        }
    }

    let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
    wl.init().unwrap();
    // region 1 is authoritative: two committed slots mean pos = 2
    assert_eq!(wl.state().pos, 2);
    assert_eq!(wl.state().device_id, device_id);
}

#[test]
fn erase_counts_aggregate_at_the_pos_wrap() {
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    // zero keys pin the permutation to the identity on three sectors, so
    // the recorded physical sectors are predictable
    craft_partition(&mut flash, &cfg, &tiny_state(0x1234_5678, 0));
    let geo = resolve(&cfg, WlMode::Advanced).unwrap();
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        assert_eq!(wl.state().max_pos, 4);
        // one updaterate burst each of logical sectors 1, 1, 2, 1: four
        // rotations. The ledger records where each triggering sector sat
        // *physically* at its rotation, and with the dummy at positions
        // 0, 1, 2, 3 the mapping sends these to physical 2, 2, 3, 1.
        for &sector in &[1u64, 1, 2, 1] {
            for _ in 0..0x10 {
                wl.erase_sector(sector).unwrap();
            }
        }
        assert_eq!((wl.state().pos, wl.state().move_count), (0, 1));
        assert_eq!(&wl.erase_counts()[..4], &[0, 1, 2, 1]);
    }

    // both regions hold exactly one packed record with the three pairs
    let mem = flash.as_slice();
    for region in [geo.addr_erase_counts1, geo.addr_erase_counts2] {
        let raw = &mem[region as usize..region as usize + 16];
        assert!(EraseCountRecord::crc_ok(raw), "record in region 0x{:x} has a bad CRC", region);
        let rec = EraseCountRecord::from_bytes(raw);
        assert_eq!(rec.pairs, [(1, 1), (2, 2), (3, 1)]);
        assert_eq!(&mem[region as usize + 16..region as usize + 32], &[0xFF; 16]);
    }

    // a remount reloads the persisted ledger
    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();
    assert_eq!(&wl.erase_counts()[..4], &[0, 1, 2, 1]);
}

#[test]
fn partial_erase_count_record_is_zero_padded() {
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    craft_partition(&mut flash, &cfg, &tiny_state(0x1234_5678, 0));
    let geo = resolve(&cfg, WlMode::Advanced).unwrap();
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        // bursts of logical 0, 0, 1, 0 land on physical 1, 0, 1, 0: only
        // two distinct sectors, so the packed record stays one pair short
        for &sector in &[0u64, 0, 1, 0] {
            for _ in 0..0x10 {
                wl.erase_sector(sector).unwrap();
            }
        }
        assert_eq!(&wl.erase_counts()[..3], &[2, 2, 0]);
    }

    let mem = flash.as_slice();
    for region in [geo.addr_erase_counts1, geo.addr_erase_counts2] {
        let raw = &mem[region as usize..region as usize + 16];
        assert!(EraseCountRecord::crc_ok(raw));
        // the third pair is the zero filler
        assert_eq!(EraseCountRecord::from_bytes(raw).pairs, [(0, 2), (1, 2), (0, 0)]);
    }

    let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
    wl.init().unwrap();
    assert_eq!(&wl.erase_counts()[..3], &[2, 2, 0]);
}

#[test]
fn monitor_detects_advanced_mode_from_the_key_word() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut state = WlState {
        max_pos: 0xF9,
        max_count: 0x10,
        block_size: 0x1000,
        version: 2,
        device_id: 0xD00D_FEED,
        feistel_keys: 0xC15A_3700,
        ..Default::default()
    };
    state.update_crc();
    craft_partition(&mut flash, &cfg, &state);

    let status = monitor::get_status(&flash, cfg.sector_size as u64).unwrap();
    assert_eq!(status.wl_mode, "advanced");
    assert_eq!(status.state.pos, "0x0");
    assert_eq!(status.state.feistel_keys, Some([0x00, 0x37, 0x5A]));
    assert_eq!(status.state.cycle_count.as_deref(), Some("0x0"));
    let counts = status.erase_counts.expect("advanced status carries the count map");
    assert!(counts.is_empty());
}

#[test]
fn monitor_reports_a_virgin_base_partition_as_undefined() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    let mut state = WlState {
        max_pos: 0xFB,
        max_count: 0x10,
        block_size: 0x1000,
        version: 2,
        device_id: 0xBEEF,
        ..Default::default()
    };
    state.update_crc();
    craft_partition(&mut flash, &cfg, &state);

    let status = monitor::get_status(&flash, cfg.sector_size as u64).unwrap();
    assert_eq!(status.wl_mode, "undefined");
    assert_eq!(status.state.pos, "0x0");
    assert!(status.erase_counts.is_none());
    assert!(status.state.feistel_keys.is_none());
}

#[test]
fn monitor_follows_the_engines_log() {
    let cfg = cfg_1m();
    let mut flash = fresh_flash(&cfg);
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        for _ in 0..5 * 0x10 {
            wl.erase_sector(3).unwrap();
        }
        assert_eq!(wl.state().pos, 5);
    }
    let mon = WlMonitor::reconstruct(monitor::read_config(&flash, cfg.sector_size as u64).unwrap(), &flash).unwrap();
    assert_eq!(mon.mode(), WlMode::Advanced);
    assert_eq!(mon.state().pos, 5);
    // five records, none checkpointed yet: the monitor tallies them itself
    assert_eq!(mon.erase_counts().iter().map(|&c| c as u32).sum::<u32>(), 5);
}

#[test]
fn monitor_rejects_a_log_that_contradicts_the_key_tag() {
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    let device_id = 0x0BAD_CAFE;
    // base tag (zero keys)...
    craft_partition(&mut flash, &cfg, &tiny_state(device_id, 0));
    // ...but an advanced-format record in slot 0
    let geo = resolve(&cfg, WlMode::Base).unwrap();
    let rec = SectorEraseRecord::new(device_id, 0, 1);
    let slot = geo.addr_state1 as usize + WlState::BYTES;
    flash.as_mut_slice()[slot..slot + 16].copy_from_slice(&rec.to_bytes());

    assert!(matches!(
        WlMonitor::reconstruct(monitor::read_config(&flash, cfg.sector_size as u64).unwrap(), &flash),
        Err(WlError::InvalidState)
    ));
}

#[test]
fn monitor_never_writes_the_image() {
    let cfg = cfg_tiny();
    let mut flash = fresh_flash(&cfg);
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).unwrap();
        wl.init().unwrap();
        for _ in 0..70 {
            wl.erase_sector(2).unwrap();
        }
    }
    let snapshot = flash.as_slice().to_vec();
    let status = monitor::get_status(&flash, cfg.sector_size as u64).unwrap();
    assert_eq!(status.wl_mode, "advanced");
    assert_eq!(snapshot, flash.as_slice());
}

#[test]
fn monitor_probes_the_config_where_the_sector_size_puts_it() {
    // a 2 KiB-sector flash reserves a 2 KiB config block, so the probe
    // offset must follow the declared sector size rather than assume 4 KiB
    let cfg = WlConfig { sector_size: 0x800, ..cfg_1m() };
    let mut flash = fresh_flash(&cfg);
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
        wl.init().unwrap();
        for _ in 0..0x10 {
            wl.erase_sector(2).unwrap();
        }
    }
    let status = monitor::get_status(&flash, cfg.sector_size as u64).unwrap();
    assert_eq!(status.wl_mode, "base");
    assert_eq!(status.config.sector_size, "0x800");
    // a 4 KiB probe on this image looks at a different address and finds
    // no config record there
    assert!(monitor::read_config(&flash, 0x1000).is_err());
}

#[test]
fn encrypted_partitions_are_refused_and_skipped() {
    let cfg = cfg_1m();
    let mut encrypted = fresh_flash(&cfg);
    craft_partition(&mut encrypted, &cfg, &tiny_state(1, 0));
    encrypted.set_encrypted(true);
    assert!(matches!(monitor::read_config(&encrypted, cfg.sector_size as u64), Err(WlError::Encrypted)));

    let mut valid = fresh_flash(&cfg);
    let mut state = WlState {
        max_pos: 0xFB,
        max_count: 0x10,
        block_size: 0x1000,
        version: 2,
        device_id: 7,
        ..Default::default()
    };
    state.update_crc();
    craft_partition(&mut valid, &cfg, &state);

    let blank = MemFlash::new(0x4000, 0x1000);
    let candidates: [&dyn FlashAccess; 3] = [&encrypted, &blank, &valid];
    let (index, found) = monitor::find_wl_partition(&candidates, cfg.sector_size as u64).unwrap();
    assert_eq!(index, 2);
    assert_eq!(found.full_mem_size, cfg.full_mem_size);

    let nothing: [&dyn FlashAccess; 2] = [&encrypted, &blank];
    assert!(matches!(monitor::find_wl_partition(&nothing, cfg.sector_size as u64), Err(WlError::NotFound)));
}

#[test]
fn updaterate_zero_selects_the_derived_default() {
    let cfg = WlConfig { updaterate: 0, ..cfg_1m() };
    let mut flash = fresh_flash(&cfg);
    let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
    wl.init().unwrap();
    // flash_size / state_size for this layout
    assert_eq!(wl.state().max_count, 0x7D);
}

/// Flash double that fails erase_range after a countdown, then recovers.
struct FlakyFlash {
    inner: MemFlash,
    erases_until_fail: i64,
}

impl FlashAccess for FlakyFlash {
    fn read(&self, addr: u64, dst: &mut [u8]) -> crate::api::WlResult<()> { self.inner.read(addr, dst) }

    fn write(&mut self, addr: u64, src: &[u8]) -> crate::api::WlResult<()> { self.inner.write(addr, src) }

    fn erase_sector(&mut self, sector: u64) -> crate::api::WlResult<()> { self.inner.erase_sector(sector) }

    fn erase_range(&mut self, addr: u64, len: u64) -> crate::api::WlResult<()> {
        if self.erases_until_fail == 0 {
            self.erases_until_fail = -1;
            return Err(Error::new(ErrorKind::Other, "injected erase failure").into());
        }
        if self.erases_until_fail > 0 {
            self.erases_until_fail -= 1;
        }
        self.inner.erase_range(addr, len)
    }

    fn len(&self) -> u64 { self.inner.len() }
}

#[test]
fn failed_rotation_is_retried_on_the_next_erase() {
    let cfg = cfg_tiny();
    let mut flash = FlakyFlash {
        inner: MemFlash::new(cfg.full_mem_size as usize, cfg.sector_size as u64),
        // fresh init spends three erase_range calls (two state regions and
        // the config sector); the fourth is the first rotation's dummy erase
        erases_until_fail: 3,
    };
    let mut wl = WlFlash::configure(&cfg, WlMode::Base, &mut flash).unwrap();
    wl.init().unwrap();

    for _ in 0..0xF {
        wl.erase_sector(1).unwrap();
    }
    // the 16th access trips the rotation, which hits the injected failure
    assert!(matches!(wl.erase_sector(1), Err(WlError::Io(_))));
    assert_eq!(wl.state().pos, 0);
    assert_eq!(wl.state().access_count, wl.state().max_count - 1);

    // the very next erase retries the same rotation and completes it
    wl.erase_sector(1).unwrap();
    assert_eq!(wl.state().pos, 1);
    assert_eq!(wl.state().access_count, 0);
}
