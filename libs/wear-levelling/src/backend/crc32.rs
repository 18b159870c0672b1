use crc::Hasher32;
use crc::crc32;

/// Every record CRC starts from the all-ones seed. Chaining a computed CRC
/// back in as the seed continues the same stream, which the base-mode
/// position-update signature relies on.
pub(crate) const WL_CRC_SEED: u32 = u32::MAX;

/// Little-endian (reflected) CRC-32 over `buf`, continuing from `seed`.
pub(crate) fn crc32_le(seed: u32, buf: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new_with_initial(crc32::IEEE, seed);
    digest.write(buf);
    digest.sum32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_seed_matches_the_standard_check_value() {
        assert_eq!(crc32_le(0, b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32_le(0, b"123456789"), crc32::checksum_ieee(b"123456789"));
        // the all-ones seed selects a distinct stream
        assert_ne!(crc32_le(WL_CRC_SEED, b"123456789"), crc32_le(0, b"123456789"));
    }

    #[test]
    fn chaining_continues_the_stream() {
        let whole = crc32_le(WL_CRC_SEED, b"rotate the dummy");
        let split = crc32_le(crc32_le(WL_CRC_SEED, b"rotate the"), b" dummy");
        assert_eq!(whole, split);
    }
}
