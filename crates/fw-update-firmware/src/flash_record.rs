//! Verified image record kept in two alternating NOR flash slots.
use embedded_storage::nor_flash::NorFlash;
use fw_update::crc::ERASED_BYTE;
use fw_update::record::RECORD_MAX_ENCODED;
use fw_update::{PersistentRecord, RecordStore, UpdateError, UpdateErrorKind};

use crate::layout::{align_up, crc32_bytes, is_seq_newer, map_flash_error, put_u32_le, read_u32_le};

// Slot layout: magic, sequence, payload length, payload, slot crc32.
const SLOT_MAGIC: u32 = u32::from_le_bytes(*b"FWRC");
pub const SLOT_BYTES: usize = 32;
const PAYLOAD_AT: usize = 12;
const SLOT_CRC_AT: usize = 28;
const SLOT_COUNT: u32 = 2;

pub struct FlashRecordStore<F: NorFlash> {
    flash: F,
    region_offset: u32,
    slot_stride: u32,
    newest: Option<(u32, u32)>,
}

impl<F: NorFlash> FlashRecordStore<F> {
    /// Uses two erase units starting at `region_start`.
    pub fn new(flash: F, region_start: u32) -> Result<Self, UpdateError> {
        let unavailable = || UpdateError::new(UpdateErrorKind::StorageUnavailable);
        let start = region_start as usize;
        if start % F::ERASE_SIZE != 0 || SLOT_BYTES % F::WRITE_SIZE != 0 || SLOT_BYTES % F::READ_SIZE != 0 {
            return Err(unavailable());
        }
        let stride = align_up(SLOT_BYTES, F::ERASE_SIZE, UpdateErrorKind::StorageUnavailable)?;
        let stride = u32::try_from(stride).map_err(|_| unavailable())?;
        let end = stride
            .checked_mul(SLOT_COUNT)
            .and_then(|len| region_start.checked_add(len))
            .ok_or_else(unavailable)?;
        if end as usize > flash.capacity() {
            return Err(unavailable());
        }
        Ok(Self {
            flash,
            region_offset: region_start,
            slot_stride: stride,
            newest: None,
        })
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.region_offset + self.slot_stride * slot
    }

    /// Sequence and record of `slot` when its magic and checksum hold.
    fn read_slot(&mut self, slot: u32) -> Result<Option<(u32, PersistentRecord)>, UpdateError> {
        let mut bytes = [0u8; SLOT_BYTES];
        self.flash
            .read(self.slot_offset(slot), &mut bytes)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::PersistFailed))?;

        if read_u32_le(&bytes, 0) != Some(SLOT_MAGIC) {
            return Ok(None);
        }
        let Some(covered) = bytes.get(..SLOT_CRC_AT) else {
            return Ok(None);
        };
        if read_u32_le(&bytes, SLOT_CRC_AT) != Some(crc32_bytes(covered)) {
            warn!("record slot {} fails its checksum", slot);
            return Ok(None);
        }
        let (Some(sequence), Some(len)) = (read_u32_le(&bytes, 4), read_u32_le(&bytes, 8)) else {
            return Ok(None);
        };
        let Some(payload) = (len as usize)
            .checked_add(PAYLOAD_AT)
            .and_then(|end| bytes.get(PAYLOAD_AT..end.min(SLOT_CRC_AT)))
        else {
            return Ok(None);
        };
        match PersistentRecord::decode(payload) {
            Ok(record) => Ok(Some((sequence, record))),
            Err(_) => Ok(None),
        }
    }

    fn encode_slot(sequence: u32, record: &PersistentRecord) -> Result<[u8; SLOT_BYTES], UpdateError> {
        let persist_failed = || UpdateError::new(UpdateErrorKind::PersistFailed);
        let mut bytes = [ERASED_BYTE; SLOT_BYTES];
        let payload = bytes
            .get_mut(PAYLOAD_AT..PAYLOAD_AT + RECORD_MAX_ENCODED)
            .ok_or_else(persist_failed)?;
        let len = record.encode(payload)?.len();
        put_u32_le(&mut bytes, 0, SLOT_MAGIC).ok_or_else(persist_failed)?;
        put_u32_le(&mut bytes, 4, sequence).ok_or_else(persist_failed)?;
        put_u32_le(&mut bytes, 8, len as u32).ok_or_else(persist_failed)?;
        let slot_crc = crc32_bytes(bytes.get(..SLOT_CRC_AT).ok_or_else(persist_failed)?);
        put_u32_le(&mut bytes, SLOT_CRC_AT, slot_crc).ok_or_else(persist_failed)?;
        Ok(bytes)
    }
}

impl<F: NorFlash> RecordStore for FlashRecordStore<F> {
    fn load(&mut self) -> Result<Option<PersistentRecord>, UpdateError> {
        let mut best: Option<(u32, u32, PersistentRecord)> = None;
        for slot in 0..SLOT_COUNT {
            let Some((sequence, record)) = self.read_slot(slot)? else {
                continue;
            };
            match best {
                Some((_, current, _)) if !is_seq_newer(sequence, current) => {}
                _ => best = Some((slot, sequence, record)),
            }
        }
        self.newest = best.map(|(slot, sequence, _)| (slot, sequence));
        Ok(best.map(|(_, _, record)| record))
    }

    /// Writes the slot not holding the newest record, so a torn write
    /// leaves the previous record readable.
    fn save(&mut self, record: &PersistentRecord) -> Result<(), UpdateError> {
        if self.newest.is_none() {
            self.load()?;
        }
        let (slot, sequence) = match self.newest {
            Some((slot, sequence)) => ((slot + 1) % SLOT_COUNT, sequence.wrapping_add(1)),
            None => (0, 1),
        };
        let bytes = Self::encode_slot(sequence, record)?;
        let offset = self.slot_offset(slot);
        self.flash
            .erase(offset, offset + self.slot_stride)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::PersistFailed))?;
        self.flash
            .write(offset, &bytes)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::PersistFailed))?;
        self.newest = Some((slot, sequence));
        info!(
            "record saved in slot {}: crc {:#x}, version {}",
            slot,
            record.verified_crc,
            record.verified_version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_flash::{ERASE_SIZE, MockFlash};

    const RECORD_REGION: u32 = ERASE_SIZE as u32;

    fn record(crc: u16, version: u16) -> PersistentRecord {
        PersistentRecord {
            verified_crc: crc,
            verified_version: version,
        }
    }

    fn make_store() -> FlashRecordStore<MockFlash> {
        FlashRecordStore::new(MockFlash::new(4 * ERASE_SIZE), RECORD_REGION).unwrap()
    }

    #[test]
    fn blank_flash_has_no_record() {
        let mut store = make_store();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn newest_slot_wins_after_reopen() {
        let mut store = make_store();
        store.save(&record(0x1111, 1)).unwrap();
        store.save(&record(0x2222, 2)).unwrap();
        store.save(&record(0x3333, 3)).unwrap();

        let mut store = FlashRecordStore::new(store.release(), RECORD_REGION).unwrap();
        assert_eq!(store.load().unwrap(), Some(record(0x3333, 3)));
        assert_eq!(store.newest, Some((0, 3)));
    }

    #[test]
    fn corrupt_newest_slot_is_ignored() {
        let mut store = make_store();
        store.save(&record(0x1111, 1)).unwrap();
        store.save(&record(0x2222, 2)).unwrap();

        let mut flash = store.release();
        flash.corrupt_byte(RECORD_REGION as usize + ERASE_SIZE + PAYLOAD_AT);
        let mut store = FlashRecordStore::new(flash, RECORD_REGION).unwrap();
        assert_eq!(store.load().unwrap(), Some(record(0x1111, 1)));

        store.save(&record(0x3333, 3)).unwrap();
        assert_eq!(store.newest, Some((1, 2)));
        assert_eq!(store.load().unwrap(), Some(record(0x3333, 3)));
    }

    #[test]
    fn failed_write_reports_persist_failed() {
        let mut flash = MockFlash::new(4 * ERASE_SIZE);
        flash.fail_writes(true);
        let mut store = FlashRecordStore::new(flash, RECORD_REGION).unwrap();
        let err = store.save(&record(1, 1)).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::PersistFailed);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn region_must_fit() {
        let err = FlashRecordStore::new(MockFlash::new(2 * ERASE_SIZE), RECORD_REGION)
            .err()
            .unwrap();
        assert_eq!(err.kind(), UpdateErrorKind::StorageUnavailable);
    }
}
