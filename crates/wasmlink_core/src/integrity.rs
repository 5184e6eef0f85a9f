//! Payload integrity checks.
//! Module payloads carry a 4-byte signature; bitmap-style resources and
//! firmware images carry a CRC16 that receivers recompute and compare.

/// Module signature: `\0asm`.
pub const MODULE_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// CRC-16/CCITT-FALSE polynomial.
pub const CRC16_POLY: u16 = 0x1021;

/// CRC-16/CCITT-FALSE initial register value.
pub const CRC16_INIT: u16 = 0xFFFF;

/// True iff `data` starts with [`MODULE_MAGIC`].
pub fn validate_magic(data: &[u8]) -> bool {
    data.len() >= MODULE_MAGIC.len() && data[..MODULE_MAGIC.len()] == MODULE_MAGIC
}

/// CRC-16/CCITT-FALSE: init 0xFFFF, poly 0x1021, MSB first, no final XOR.
///
/// Part of the wire contract: the client computes the same value over the
/// bytes it sends and the device compares.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_update(CRC16_INIT, data)
}

/// Continue a CRC over another slice. `crc16_update(CRC16_INIT, a ++ b)`
/// equals `crc16_update(crc16_update(CRC16_INIT, a), b)`.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_answers() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
        assert_eq!(crc16_ccitt(b""), 0xFFFF);
        assert_eq!(crc16_ccitt(b"A"), 0xB915);
        assert_eq!(crc16_ccitt(&[0u8; 32]), 0xF14C);
        assert_eq!(crc16_ccitt(&[0xFFu8; 32]), 0x75F8);

        let ramp: Vec<u8> = (0u8..32).collect();
        assert_eq!(crc16_ccitt(&ramp), 0x23B3);
    }

    #[test]
    fn test_crc16_incremental_matches_one_shot() {
        let data = b"segmented transfers are checked end to end";
        let (a, b) = data.split_at(17);
        assert_eq!(crc16_update(crc16_update(CRC16_INIT, a), b), crc16_ccitt(data));
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let mut data = [0x5Au8; 32];
        let before = crc16_ccitt(&data);
        data[7] ^= 0x01;
        assert_ne!(before, crc16_ccitt(&data));
    }

    #[test]
    fn test_validate_magic() {
        assert!(validate_magic(&[0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]));
        assert!(validate_magic(&MODULE_MAGIC));
        assert!(!validate_magic(&[0x00, 0x61, 0x73]));
        assert!(!validate_magic(&[]));
        assert!(!validate_magic(b"\x7fELF"));
    }
}
