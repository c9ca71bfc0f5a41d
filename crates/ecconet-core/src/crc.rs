//! CRC-16 (message framing) and CRC-32/BZIP2 (bootloader image gating), spec §4.2.
//!
//! Both are exposed as a streaming `addByte`-style accumulator plus a block
//! convenience function, following DESIGN NOTES §9's "collapse into pure
//! functions over borrowed input/output buffers" guidance.

/// Streaming CRC-16, reflected, poly `0xA001`, init `0`, no final XOR.
///
/// This is the message-framing CRC from spec §4.2 — used by the transmitter to
/// suffix multi-frame messages and the receiver to validate them before any
/// decompression is attempted (spec §3 invariant).
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16(u16);

impl Crc16 {
    const POLY: u16 = 0xA001;

    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    pub fn add_byte(&mut self, byte: u8) {
        let mut crc = self.0 ^ u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ Self::POLY
            } else {
                crc >> 1
            };
        }
        self.0 = crc;
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.add_byte(b);
        }
    }

    #[must_use]
    pub fn finish(self) -> u16 {
        self.0
    }
}

/// Compute the CRC-16 of a complete buffer in one call.
#[must_use]
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.add_bytes(bytes);
    crc.finish()
}

/// Streaming CRC-32/BZIP2, poly `0x04C11DB7`, init `!0`, no input reflection,
/// output inverted. Used only by the bootloader variant to gate the
/// application image (spec §4.2; out of core scope per spec §1, kept here
/// because it is itself a C2 responsibility).
#[derive(Debug, Clone, Copy)]
pub struct Crc32Bzip2(u32);

impl Default for Crc32Bzip2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32Bzip2 {
    const POLY: u32 = 0x04C1_1DB7;

    #[must_use]
    pub fn new() -> Self {
        Self(!0)
    }

    pub fn add_byte(&mut self, byte: u8) {
        let mut crc = self.0 ^ (u32::from(byte) << 24);
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ Self::POLY
            } else {
                crc << 1
            };
        }
        self.0 = crc;
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.add_byte(b);
        }
    }

    #[must_use]
    pub fn finish(self) -> u32 {
        !self.0
    }
}

#[must_use]
pub fn crc32_bzip2(bytes: &[u8]) -> u32 {
    let mut crc = Crc32Bzip2::new();
    crc.add_bytes(bytes);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_is_zero() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn crc16_streaming_matches_block() {
        let data = b"123456789";
        let block = crc16(data);

        let mut streaming = Crc16::new();
        for &b in data {
            streaming.add_byte(b);
        }
        assert_eq!(streaming.finish(), block);
    }

    #[test]
    fn crc16_arc_check_value() {
        // CRC-16/ARC check value for the ASCII string "123456789" is 0xBB3D.
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn crc32_bzip2_check_value() {
        // CRC-32/BZIP2 check value for "123456789" is 0xFC891918.
        assert_eq!(crc32_bzip2(b"123456789"), 0xFC89_1918);
    }

    #[test]
    fn crc32_bzip2_streaming_matches_block() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 255];
        let block = crc32_bzip2(&data);

        let mut streaming = Crc32Bzip2::new();
        streaming.add_bytes(&data);
        assert_eq!(streaming.finish(), block);
    }
}
