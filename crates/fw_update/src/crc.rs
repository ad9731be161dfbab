//! CRC-16/CCITT-FALSE, the checksum both ends of a transfer agree on.
//!
//! Polynomial `0x1021`, MSB first, seed `0xFFFF`, no reflection and no
//! final XOR. The master computes it over the whole image and the device
//! folds it in one byte at a time as chunks arrive.

pub const CRC16_SEED: u16 = 0xFFFF;
const CRC16_POLY: u16 = 0x1021;

/// Erased NOR flash reads back as this byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Block size the running image is scanned in.
pub const SCAN_BLOCK_SIZE: usize = 1024;

pub fn crc16_step(seed: u16, byte: u8) -> u16 {
    let mut crc = seed ^ (u16::from(byte) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ CRC16_POLY
        } else {
            crc << 1
        };
    }
    crc
}

pub fn crc16_update(seed: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(seed, |crc, &byte| crc16_step(crc, byte))
}

pub fn crc16(bytes: &[u8]) -> u16 {
    crc16_update(CRC16_SEED, bytes)
}

/// Computes the CRC of an image whose length is not recorded anywhere.
///
/// Blocks are fed in flash order. Inside a block, the first erased byte
/// that is followed only by erased bytes up to the end of that block is
/// taken as the end of the image. This is a first-boot heuristic: an image
/// that legitimately ends in `0xFF` bytes will be measured short.
pub struct ImageScanner {
    crc: u16,
    scanned: u32,
    finished: bool,
}

impl ImageScanner {
    pub fn new() -> Self {
        Self {
            crc: CRC16_SEED,
            scanned: 0,
            finished: false,
        }
    }

    /// Feeds the next block. Returns `true` once the end of the image was
    /// found; further blocks are ignored.
    pub fn feed_block(&mut self, block: &[u8]) -> bool {
        if self.finished {
            return true;
        }
        for (idx, &byte) in block.iter().enumerate() {
            if byte == ERASED_BYTE && is_erased_tail(block, idx) {
                self.finished = true;
                return true;
            }
            self.crc = crc16_step(self.crc, byte);
            self.scanned = self.scanned.saturating_add(1);
        }
        false
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Bytes folded into the CRC so far.
    pub fn scanned(&self) -> u32 {
        self.scanned
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Default for ImageScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_erased_tail(block: &[u8], from: usize) -> bool {
    block
        .get(from..)
        .map(|tail| tail.iter().all(|&byte| byte == ERASED_BYTE))
        .unwrap_or(false)
}
