use embedded_storage::nor_flash::ReadNorFlash;
use fw_update::crc::{ImageScanner, SCAN_BLOCK_SIZE};
use fw_update::{UpdateError, UpdateErrorKind};

use crate::layout::map_flash_error;

/// Result of measuring an image whose length is not recorded.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScannedImage {
    pub crc: u16,
    pub len: u32,
}

/// Scans `len` bytes from `start` in 1 KiB blocks until the trailing
/// erased run and returns the CRC of everything before it.
pub fn scan_image_crc<F: ReadNorFlash>(
    flash: &mut F,
    start: u32,
    len: usize,
) -> Result<ScannedImage, UpdateError> {
    let mut scanner = ImageScanner::new();
    let mut block = [0u8; SCAN_BLOCK_SIZE];
    let mut offset = start;
    let mut remaining = len - len % F::READ_SIZE.max(1);

    while remaining > 0 {
        let step = remaining.min(SCAN_BLOCK_SIZE);
        let buf = block
            .get_mut(..step)
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))?;
        flash
            .read(offset, buf)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::StorageUnavailable))?;
        if scanner.feed_block(buf) {
            break;
        }
        remaining -= step;
        offset = u32::try_from(step)
            .ok()
            .and_then(|step| offset.checked_add(step))
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))?;
    }

    debug!("scanned {} bytes, crc {:#x}", scanner.scanned(), scanner.crc());
    Ok(ScannedImage {
        crc: scanner.crc(),
        len: scanner.scanned(),
    })
}
