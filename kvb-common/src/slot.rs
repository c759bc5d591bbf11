//! Cluster key-slot hashing (CRC16/XMODEM modulo 16384).

/// Number of hash slots in a cluster key space.
pub const SLOT_COUNT: u16 = 16384;

/// Calculates the slot owning `key`, honoring `{hash tag}` sections.
pub fn key_slot(key: &[u8]) -> u16 {
    // Check for hash tag {xxx}
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return crc16(&key[start + 1..start + 1 + end]) % SLOT_COUNT;
            }
        }
    }
    crc16(key) % SLOT_COUNT
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
