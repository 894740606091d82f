//! Hash slots.
//!
//! Keys map to one of 16384 slots via CRC16 (XMODEM variant) modulo 16384.
//! When a key contains a non-empty `{...}` section, only that section is
//! hashed, so `{user:1}:name` and `{user:1}:mail` share a slot.

pub const SLOT_COUNT: u16 = 16384;

/// CRC16/XMODEM: polynomial 0x1021, initial value 0, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The part of `key` that is hashed.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_known_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
        assert_eq!(hash_slot(b""), 0);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(hash_slot(b"{foo}.bar"), hash_slot(b"foo"));
        assert_eq!(hash_slot(b"{user:1}:name"), hash_slot(b"{user:1}:mail"));
        // Empty tag: the whole key is hashed.
        assert_eq!(hash_tag(b"{}foo"), b"{}foo");
        // Only the first `{` counts.
        assert_eq!(hash_tag(b"foo{{bar}}"), b"{bar");
        // Unterminated tag.
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
    }
}
