use byteorder::{ByteOrder, LittleEndian};

use super::{crc32_le, WL_CRC_SEED};

/// Configuration record, stored in the last sector of the partition.
///
/// On flash this is 9 little-endian u32 words in declared order, CRC last.
/// The CRC covers every byte before it. The record is written once, when a
/// fresh partition is initialized, and is how the monitor recognizes a
/// wear-levelled partition in the first place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WlConfig {
    /// byte offset of the wear-levelled area within the device
    pub start_addr: u32,
    /// total bytes managed, including all reserved regions
    pub full_mem_size: u32,
    /// unit of dummy-page movement; a multiple of `sector_size`
    pub page_size: u32,
    /// erase unit of the underlying flash
    pub sector_size: u32,
    /// erases between two dummy rotations; 0 selects a derived default
    pub updaterate: u32,
    /// bytes per position-update slot
    pub wr_size: u32,
    /// layout version tag
    pub version: u32,
    /// size of the copy buffer used while moving a page
    pub temp_buff_size: u32,
    pub crc: u32,
}

impl WlConfig {
    pub(crate) const BYTES: usize = 36;
    pub(crate) const CRC_OFFSET: usize = 32;

    pub(crate) fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut buf = [0u8; Self::BYTES];
        let words = [
            self.start_addr,
            self.full_mem_size,
            self.page_size,
            self.sector_size,
            self.updaterate,
            self.wr_size,
            self.version,
            self.temp_buff_size,
            self.crc,
        ];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *w);
        }
        buf
    }

    /// Parse from raw flash bytes. `buf` must hold at least [`Self::BYTES`].
    pub(crate) fn from_bytes(buf: &[u8]) -> WlConfig {
        WlConfig {
            start_addr: LittleEndian::read_u32(&buf[0..4]),
            full_mem_size: LittleEndian::read_u32(&buf[4..8]),
            page_size: LittleEndian::read_u32(&buf[8..12]),
            sector_size: LittleEndian::read_u32(&buf[12..16]),
            updaterate: LittleEndian::read_u32(&buf[16..20]),
            wr_size: LittleEndian::read_u32(&buf[20..24]),
            version: LittleEndian::read_u32(&buf[24..28]),
            temp_buff_size: LittleEndian::read_u32(&buf[28..32]),
            crc: LittleEndian::read_u32(&buf[32..36]),
        }
    }

    pub(crate) fn compute_crc(&self) -> u32 {
        crc32_le(WL_CRC_SEED, &self.to_bytes()[..Self::CRC_OFFSET])
    }

    pub(crate) fn update_crc(&mut self) { self.crc = self.compute_crc(); }
}

/// CRC check over the raw on-flash bytes of a config record.
pub(crate) fn config_crc_ok(raw: &[u8]) -> bool {
    let stored = LittleEndian::read_u32(&raw[WlConfig::CRC_OFFSET..WlConfig::CRC_OFFSET + 4]);
    crc32_le(WL_CRC_SEED, &raw[..WlConfig::CRC_OFFSET]) == stored
}

/// Live counters of the translation layer, stored in duplicate at the head
/// of both state regions.
///
/// 64 bytes on flash: eight base fields, then `cycle_count` and
/// `feistel_keys` (which base mode leaves zero -- a non-zero key word is
/// what marks a partition as advanced), five reserved words, CRC last over
/// everything before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WlState {
    /// current dummy page position
    pub pos: u32,
    /// number of dummy positions, i.e. usable pages plus the dummy itself
    pub max_pos: u32,
    /// completed passes of the dummy over the whole area
    pub move_count: u32,
    /// erases since the last rotation
    pub access_count: u32,
    /// erases per rotation
    pub max_count: u32,
    /// page size the state was written with
    pub block_size: u32,
    pub version: u32,
    /// random tag binding position-update records to this instance
    pub device_id: u32,
    /// move_count wrap counter; never reset, approximates total wear
    pub cycle_count: u32,
    /// three 8-bit Feistel sub-keys in the low bytes; byte 3 reserved
    pub feistel_keys: u32,
    pub crc: u32,
}

impl WlState {
    pub(crate) const BYTES: usize = 64;
    pub(crate) const CRC_OFFSET: usize = 60;

    pub(crate) fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut buf = [0u8; Self::BYTES];
        let words = [
            self.pos,
            self.max_pos,
            self.move_count,
            self.access_count,
            self.max_count,
            self.block_size,
            self.version,
            self.device_id,
            self.cycle_count,
            self.feistel_keys,
        ];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *w);
        }
        // five reserved words stay zero
        LittleEndian::write_u32(&mut buf[Self::CRC_OFFSET..Self::BYTES], self.crc);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> WlState {
        WlState {
            pos: LittleEndian::read_u32(&buf[0..4]),
            max_pos: LittleEndian::read_u32(&buf[4..8]),
            move_count: LittleEndian::read_u32(&buf[8..12]),
            access_count: LittleEndian::read_u32(&buf[12..16]),
            max_count: LittleEndian::read_u32(&buf[16..20]),
            block_size: LittleEndian::read_u32(&buf[20..24]),
            version: LittleEndian::read_u32(&buf[24..28]),
            device_id: LittleEndian::read_u32(&buf[28..32]),
            cycle_count: LittleEndian::read_u32(&buf[32..36]),
            feistel_keys: LittleEndian::read_u32(&buf[36..40]),
            crc: LittleEndian::read_u32(&buf[Self::CRC_OFFSET..Self::BYTES]),
        }
    }

    pub(crate) fn compute_crc(&self) -> u32 {
        crc32_le(WL_CRC_SEED, &self.to_bytes()[..Self::CRC_OFFSET])
    }

    pub(crate) fn update_crc(&mut self) { self.crc = self.compute_crc(); }

    /// The three 8-bit sub-keys packed into the low bytes of `feistel_keys`.
    pub fn feistel_subkeys(&self) -> [u8; 3] {
        let b = self.feistel_keys.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

/// CRC check over the raw on-flash bytes of a state record.
pub(crate) fn state_crc_ok(raw: &[u8]) -> bool {
    let stored = LittleEndian::read_u32(&raw[WlState::CRC_OFFSET..WlState::CRC_OFFSET + 4]);
    crc32_le(WL_CRC_SEED, &raw[..WlState::CRC_OFFSET]) == stored
}

/// Advanced-mode position-update record, one per rotation.
///
/// A slot is considered set when the device id matches the running
/// instance, the recorded position equals the slot index, and the CRC over
/// the first three words checks out. `sector` is payload (which physical
/// sector's erase triggered this rotation), not part of the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectorEraseRecord {
    pub device_id: u32,
    pub pos: u32,
    pub sector: u32,
    pub crc: u32,
}

impl SectorEraseRecord {
    pub(crate) const BYTES: usize = 16;
    pub(crate) const CRC_OFFSET: usize = 12;

    pub(crate) fn new(device_id: u32, pos: u32, sector: u32) -> SectorEraseRecord {
        let mut rec = SectorEraseRecord { device_id, pos, sector, crc: 0 };
        rec.crc = crc32_le(WL_CRC_SEED, &rec.to_bytes()[..Self::CRC_OFFSET]);
        rec
    }

    pub(crate) fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut buf = [0u8; Self::BYTES];
        LittleEndian::write_u32(&mut buf[0..4], self.device_id);
        LittleEndian::write_u32(&mut buf[4..8], self.pos);
        LittleEndian::write_u32(&mut buf[8..12], self.sector);
        LittleEndian::write_u32(&mut buf[12..16], self.crc);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> SectorEraseRecord {
        SectorEraseRecord {
            device_id: LittleEndian::read_u32(&buf[0..4]),
            pos: LittleEndian::read_u32(&buf[4..8]),
            sector: LittleEndian::read_u32(&buf[8..12]),
            crc: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    pub(crate) fn is_set(&self, device_id: u32, slot: u32) -> bool {
        if self.device_id != device_id {
            return false;
        }
        if self.pos != slot {
            return false;
        }
        self.crc == crc32_le(WL_CRC_SEED, &self.to_bytes()[..Self::CRC_OFFSET])
    }
}

/// Base-mode position-update signature: four words, word `i` being the CRC
/// of the little-endian bytes of `device_id + n*4 + i`. Knowing only the
/// device id and the slot index, set slots are recognizable without any
/// payload.
pub(crate) const BASE_SLOT_WORDS: usize = 4;

pub(crate) fn fill_base_slot(buf: &mut [u8], device_id: u32, n: u32) {
    for i in 0..BASE_SLOT_WORDS as u32 {
        let tag = device_id.wrapping_add(n.wrapping_mul(4)).wrapping_add(i);
        let word = crc32_le(WL_CRC_SEED, &tag.to_le_bytes());
        LittleEndian::write_u32(&mut buf[i as usize * 4..i as usize * 4 + 4], word);
    }
}

pub(crate) fn base_slot_set(buf: &[u8], device_id: u32, n: u32) -> bool {
    for i in 0..BASE_SLOT_WORDS as u32 {
        let tag = device_id.wrapping_add(n.wrapping_mul(4)).wrapping_add(i);
        let expected = crc32_le(WL_CRC_SEED, &tag.to_le_bytes());
        if LittleEndian::read_u32(&buf[i as usize * 4..i as usize * 4 + 4]) != expected {
            return false;
        }
    }
    true
}

/// One packed erase-count record: three (sector, count) pairs and a CRC
/// over them. A zero count marks an unused pair; records are packed densely
/// so the first record failing CRC in both copies ends the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EraseCountRecord {
    pub pairs: [(u16, u16); 3],
    pub crc: u32,
}

impl EraseCountRecord {
    pub(crate) const BYTES: usize = 16;
    pub(crate) const CRC_OFFSET: usize = 12;

    pub(crate) fn new(pairs: [(u16, u16); 3]) -> EraseCountRecord {
        let mut rec = EraseCountRecord { pairs, crc: 0 };
        rec.crc = crc32_le(WL_CRC_SEED, &rec.to_bytes()[..Self::CRC_OFFSET]);
        rec
    }

    pub(crate) fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut buf = [0u8; Self::BYTES];
        for (i, (sector, count)) in self.pairs.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[i * 4..i * 4 + 2], *sector);
            LittleEndian::write_u16(&mut buf[i * 4 + 2..i * 4 + 4], *count);
        }
        LittleEndian::write_u32(&mut buf[12..16], self.crc);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> EraseCountRecord {
        let mut pairs = [(0u16, 0u16); 3];
        for (i, pair) in pairs.iter_mut().enumerate() {
            *pair = (
                LittleEndian::read_u16(&buf[i * 4..i * 4 + 2]),
                LittleEndian::read_u16(&buf[i * 4 + 2..i * 4 + 4]),
            );
        }
        EraseCountRecord { pairs, crc: LittleEndian::read_u32(&buf[12..16]) }
    }

    pub(crate) fn crc_ok(raw: &[u8]) -> bool {
        let stored = LittleEndian::read_u32(&raw[Self::CRC_OFFSET..Self::BYTES]);
        crc32_le(WL_CRC_SEED, &raw[..Self::CRC_OFFSET]) == stored
    }
}
