use serde::{Deserialize, Serialize};

use crate::{RecordStore, UpdateError, UpdateErrorKind};

/// Upper bound of a postcard encoded [`PersistentRecord`].
pub const RECORD_MAX_ENCODED: usize = 8;

/// CRC and version of the last image that passed verification.
///
/// This is what the device reports as its running firmware after the
/// restart that follows a successful update.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PersistentRecord {
    pub verified_crc: u16,
    pub verified_version: u16,
}

impl PersistentRecord {
    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], UpdateError> {
        postcard::to_slice(self, buf).map_err(|_| UpdateError::new(UpdateErrorKind::PersistFailed))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UpdateError> {
        postcard::from_bytes(bytes).map_err(|_| UpdateError::new(UpdateErrorKind::PersistFailed))
    }
}

/// Record store held in RAM, for hosts and tests.
#[derive(Default)]
pub struct MemRecordStore {
    encoded: heapless::Vec<u8, RECORD_MAX_ENCODED>,
    saves: u32,
    fail_saves: bool,
}

impl MemRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: PersistentRecord) -> Result<Self, UpdateError> {
        let mut store = Self::new();
        store.save(&record)?;
        store.saves = 0;
        Ok(store)
    }

    /// Makes every following `save` fail with `PersistFailed`.
    pub fn fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }

    pub fn save_count(&self) -> u32 {
        self.saves
    }
}

impl RecordStore for MemRecordStore {
    fn load(&mut self) -> Result<Option<PersistentRecord>, UpdateError> {
        if self.encoded.is_empty() {
            return Ok(None);
        }
        PersistentRecord::decode(&self.encoded).map(Some)
    }

    fn save(&mut self, record: &PersistentRecord) -> Result<(), UpdateError> {
        if self.fail_saves {
            return Err(UpdateError::new(UpdateErrorKind::PersistFailed));
        }
        let mut buf = [0u8; RECORD_MAX_ENCODED];
        let used = record.encode(&mut buf)?;
        self.encoded.clear();
        self.encoded
            .extend_from_slice(used)
            .map_err(|_| UpdateError::new(UpdateErrorKind::PersistFailed))?;
        self.saves = self.saves.saturating_add(1);
        Ok(())
    }
}
