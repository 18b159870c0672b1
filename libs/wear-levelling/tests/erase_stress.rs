//! Long-haul exercise of the whole stack over the in-memory flash:
//! repeated write/read/erase traffic across many rotations and remounts,
//! with the monitor cross-checking the image between rounds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wear_levelling::{monitor, MemFlash, WlConfig, WlFlash, WlMode};

fn stress_cfg() -> WlConfig {
    WlConfig {
        start_addr: 0,
        full_mem_size: 0x4_0000,
        page_size: 0x1000,
        sector_size: 0x1000,
        updaterate: 0x10,
        wr_size: 0x10,
        version: 2,
        temp_buff_size: 0x20,
        crc: 0,
    }
}

fn checksummed_page(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut page: Vec<u8> = (0..len - 4).map(|_| rng.gen()).collect();
    let sum: u32 = page.iter().map(|&b| b as u32).sum();
    page.extend_from_slice(&sum.to_le_bytes());
    page
}

fn verify_page(page: &[u8]) {
    let (payload, tail) = page.split_at(page.len() - 4);
    let sum: u32 = payload.iter().map(|&b| b as u32).sum();
    assert_eq!(tail, sum.to_le_bytes(), "payload checksum mismatch");
}

#[test]
fn erase_stress_with_remounts() {
    let cfg = stress_cfg();
    let mut flash = MemFlash::new(cfg.full_mem_size as usize, cfg.sector_size as u64);
    let page = cfg.page_size as usize;

    // a few pages of checksummed data that must survive everything below
    let keep_sectors = 4u64;
    for i in 0..keep_sectors {
        let data = checksummed_page(1000 + i, page);
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).expect("configure");
        wl.init().expect("init");
        wl.write(i * page as u64, &data).expect("write");
    }

    let mut total_rounds = 0;
    let mut device_id = None;
    for round in 0..6 {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).expect("configure");
        wl.init().expect("init");

        // the same instance must be recovered every time
        match device_id {
            None => device_id = Some(wl.state().device_id),
            Some(id) => assert_eq!(wl.state().device_id, id, "remount lost the instance"),
        }

        // scratch traffic on the sectors above the protected ones
        let scratch_first = keep_sectors;
        let scratch_count = wl.chip_size() / wl.sector_size() - keep_sectors;
        let mut rng = StdRng::seed_from_u64(round);
        for _ in 0..200 {
            let sector = scratch_first + rng.gen_range(0..scratch_count);
            let burst = rng.gen_range(1..4).min(scratch_first + scratch_count - sector);
            wl.erase_range(sector * page as u64, burst * page as u64)
                .expect("erase_range");
            total_rounds += burst;
            if rng.gen_bool(0.25) {
                let data = checksummed_page(round * 10_000 + sector, page);
                wl.write(sector * page as u64, &data).expect("scratch write");
                let mut readback = vec![0u8; page];
                wl.read(sector * page as u64, &mut readback).expect("scratch read");
                verify_page(&readback);
            }
        }

        // counters stay inside their invariant ranges at every observable
        // point
        let state = wl.state();
        assert!(state.pos < state.max_pos);
        assert!(state.move_count < state.max_pos - 1);
        assert!(state.access_count < state.max_count);

        wl.flush().expect("flush");
    }
    assert!(total_rounds > 1000);

    // the protected pages survived six mounts' worth of traffic
    {
        let mut wl = WlFlash::configure(&cfg, WlMode::Advanced, &mut flash).expect("configure");
        wl.init().expect("init");
        assert!(wl.state().move_count > 0 || wl.state().cycle_count > 0, "stress never wrapped the position");
        for i in 0..keep_sectors {
            let mut readback = vec![0u8; page];
            wl.read(i * page as u64, &mut readback).expect("read");
            verify_page(&readback);
        }
    }

    // and the monitor agrees with the image without touching it
    let snapshot = flash.as_slice().to_vec();
    let status = monitor::get_status(&flash, cfg.sector_size as u64).expect("status");
    assert_eq!(status.wl_mode, "advanced");
    let counts = status.erase_counts.expect("advanced mode persists erase counts");
    assert!(!counts.is_empty(), "wrapped runs must have checkpointed counts");
    assert_eq!(snapshot, flash.as_slice());
}
