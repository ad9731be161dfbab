//! Helpers shared by the flash backed bank and record stores.
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};
use fw_update::{UpdateError, UpdateErrorKind};

/// Largest `WRITE_SIZE` the stores can buffer a partial write unit for.
pub const MAX_WRITE_UNIT: usize = 32;

pub fn crc32_init() -> u32 {
    0xFFFF_FFFFu32
}

pub fn crc32_update(mut crc: u32, bytes: &[u8]) -> u32 {
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = if (crc & 1) == 1 { u32::MAX } else { 0 };
            crc = (crc >> 1) ^ (0xEDB8_8320u32 & mask);
        }
    }
    crc
}

pub fn crc32_bytes(bytes: &[u8]) -> u32 {
    !crc32_update(crc32_init(), bytes)
}

pub fn read_u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    let end = at.checked_add(4)?;
    let chunk: [u8; 4] = bytes.get(at..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(chunk))
}

pub fn put_u32_le(bytes: &mut [u8], at: usize, value: u32) -> Option<()> {
    let end = at.checked_add(4)?;
    bytes.get_mut(at..end)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

#[track_caller]
pub fn align_up(value: usize, align: usize, kind: UpdateErrorKind) -> Result<usize, UpdateError> {
    let mask = align.checked_sub(1).ok_or(UpdateError::new(kind))?;
    let value = value.checked_add(mask).ok_or(UpdateError::new(kind))?;
    Ok(value & !mask)
}

/// Wrapping sequence comparison: `candidate` was written after `current`.
pub fn is_seq_newer(candidate: u32, current: u32) -> bool {
    candidate != current && candidate.wrapping_sub(current) < 0x8000_0000
}

/// Turns a flash driver failure into the update error `kind` the calling
/// step reports.
#[track_caller]
pub fn map_flash_error<E: NorFlashError>(error: E, kind: UpdateErrorKind) -> UpdateError {
    match error.kind() {
        NorFlashErrorKind::NotAligned => warn!("flash access not aligned"),
        NorFlashErrorKind::OutOfBounds => warn!("flash access out of bounds"),
        _ => warn!("flash driver error"),
    }
    UpdateError::new(kind)
}
