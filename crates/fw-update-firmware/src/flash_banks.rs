//! Two firmware banks on NOR flash, each headed by a small descriptor.
//!
//! A bank becomes bootable only when its header is programmed, which is the
//! last step of an update. The bootloader and [`FlashBanks::new`] both pick
//! the bank whose header is valid and carries the newest sequence number.
use embedded_storage::nor_flash::NorFlash;
use fw_update::crc::{CRC16_SEED, ERASED_BYTE, crc16_update};
use fw_update::{BankId, BankStorage, UpdateError, UpdateErrorKind};
use heapless::Vec;

use crate::layout::{
    MAX_WRITE_UNIT, align_up, crc32_bytes, is_seq_newer, map_flash_error, put_u32_le, read_u32_le,
};
use crate::running_image::scan_image_crc;

// Header layout: magic, layout version, image length, image crc16, sequence, two reserved words, header crc32.
const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"FWBK");
const HEADER_VERSION: u32 = 1;
pub const HEADER_SIZE_BYTES: usize = 32;
const HEADER_CRC_AT: usize = 28;
pub const BANK_COUNT: usize = 2;
const VERIFY_BLOCK_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BankHeader {
    pub image_len: u32,
    pub image_crc: u16,
    pub sequence: u32,
}

struct Staged {
    bank: BankId,
    image_len: u32,
    image_crc: u16,
}

pub struct FlashBanks<F: NorFlash> {
    flash: F,
    region_offset: u32,
    bank_len: usize,
    running_bank: BankId,
    running_header: Option<BankHeader>,
    boot_bank: BankId,
    newest_sequence: u32,
    staged: Option<Staged>,
}

/// Write cursor inside the bank being updated.
pub struct FlashSession {
    bank: BankId,
    image_offset: u32,
    image_len: u32,
    written: u32,
    programmed: u32,
    crc: u16,
    pending: Vec<u8, MAX_WRITE_UNIT>,
    replay: Vec<u8, MAX_WRITE_UNIT>,
}

impl FlashSession {
    pub fn bank(&self) -> BankId {
        self.bank
    }
}

impl<F: NorFlash> FlashBanks<F> {
    /// Splits `region_start..region_end` into two erase aligned banks and
    /// finds the bank the device booted from.
    pub fn new(flash: F, region_start: u32, region_end: u32) -> Result<Self, UpdateError> {
        let unavailable = || UpdateError::new(UpdateErrorKind::StorageUnavailable);
        let region_len = region_end.checked_sub(region_start).ok_or_else(unavailable)?;
        let region_len = usize::try_from(region_len).map_err(|_| unavailable())?;
        let start = region_start as usize;
        if start % F::READ_SIZE != 0 || start % F::WRITE_SIZE != 0 || start % F::ERASE_SIZE != 0 {
            error!("bank region start {:#x} is not aligned", region_start);
            return Err(unavailable());
        }
        if F::WRITE_SIZE > MAX_WRITE_UNIT
            || HEADER_SIZE_BYTES % F::WRITE_SIZE != 0
            || HEADER_SIZE_BYTES % F::READ_SIZE != 0
        {
            error!("flash write unit {} not supported", F::WRITE_SIZE);
            return Err(unavailable());
        }
        if region_end as usize > flash.capacity() {
            error!("bank region ends past flash capacity");
            return Err(unavailable());
        }
        let bank_len = region_len / BANK_COUNT;
        let bank_len = bank_len - (bank_len % F::ERASE_SIZE);
        if bank_len <= HEADER_SIZE_BYTES {
            return Err(unavailable());
        }

        let mut banks = Self {
            flash,
            region_offset: region_start,
            bank_len,
            running_bank: 0,
            running_header: None,
            boot_bank: 0,
            newest_sequence: 0,
            staged: None,
        };
        banks.load_headers();
        Ok(banks)
    }

    /// Picks the newest bank whose header and image both check out.
    /// Without one, bank 0 is assumed to hold a factory image.
    pub fn load_headers(&mut self) {
        let mut best: Option<(BankId, BankHeader)> = None;
        for bank in 0..BANK_COUNT as BankId {
            let Ok(header) = self.read_header(bank) else {
                continue;
            };
            if !self.image_matches(bank, header.image_len, header.image_crc) {
                warn!("bank {} header valid but image crc wrong", bank);
                continue;
            }
            match best {
                None => best = Some((bank, header)),
                Some((_, ref current)) => {
                    if is_seq_newer(header.sequence, current.sequence) {
                        best = Some((bank, header));
                    }
                }
            }
        }

        match best {
            Some((bank, header)) => {
                info!("booted from bank {}, sequence {}", bank, header.sequence);
                self.running_bank = bank;
                self.running_header = Some(header);
                self.newest_sequence = header.sequence;
            }
            None => {
                info!("no bank header, assuming factory image in bank 0");
                self.running_bank = 0;
                self.running_header = None;
                self.newest_sequence = 0;
            }
        }
        self.boot_bank = self.running_bank;
        self.staged = None;
    }

    /// Bank the next restart will boot.
    pub fn boot_bank(&self) -> BankId {
        self.boot_bank
    }

    pub fn image_capacity(&self) -> usize {
        self.bank_len - HEADER_SIZE_BYTES
    }

    /// Flash offset of the first image byte in `bank`.
    pub fn image_offset(&self, bank: BankId) -> Result<u32, UpdateError> {
        self.bank_offset(bank)?
            .checked_add(HEADER_SIZE_BYTES as u32)
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn bank_offset(&self, bank: BankId) -> Result<u32, UpdateError> {
        let unavailable = || UpdateError::new(UpdateErrorKind::StorageUnavailable);
        if usize::from(bank) >= BANK_COUNT {
            return Err(unavailable());
        }
        let offset = self
            .bank_len
            .checked_mul(usize::from(bank))
            .and_then(|offset| u32::try_from(offset).ok())
            .ok_or_else(unavailable)?;
        self.region_offset.checked_add(offset).ok_or_else(unavailable)
    }

    pub fn read_header(&mut self, bank: BankId) -> Result<BankHeader, UpdateError> {
        let invalid = || UpdateError::new(UpdateErrorKind::StorageUnavailable);
        let offset = self.bank_offset(bank)?;
        let mut bytes = [0u8; HEADER_SIZE_BYTES];
        self.flash
            .read(offset, &mut bytes)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::StorageUnavailable))?;

        if read_u32_le(&bytes, 0) != Some(HEADER_MAGIC) || read_u32_le(&bytes, 4) != Some(HEADER_VERSION)
        {
            return Err(invalid());
        }
        let covered = bytes.get(..HEADER_CRC_AT).ok_or_else(invalid)?;
        if read_u32_le(&bytes, HEADER_CRC_AT) != Some(crc32_bytes(covered)) {
            return Err(invalid());
        }
        let image_len = read_u32_le(&bytes, 8).ok_or_else(invalid)?;
        let image_crc = read_u32_le(&bytes, 12)
            .and_then(|crc| u16::try_from(crc).ok())
            .ok_or_else(invalid)?;
        let sequence = read_u32_le(&bytes, 16).ok_or_else(invalid)?;
        if image_len as usize > self.image_capacity() {
            return Err(invalid());
        }
        Ok(BankHeader {
            image_len,
            image_crc,
            sequence,
        })
    }

    fn encode_header(header: &BankHeader) -> Option<[u8; HEADER_SIZE_BYTES]> {
        let mut bytes = [ERASED_BYTE; HEADER_SIZE_BYTES];
        put_u32_le(&mut bytes, 0, HEADER_MAGIC)?;
        put_u32_le(&mut bytes, 4, HEADER_VERSION)?;
        put_u32_le(&mut bytes, 8, header.image_len)?;
        put_u32_le(&mut bytes, 12, u32::from(header.image_crc))?;
        put_u32_le(&mut bytes, 16, header.sequence)?;
        let header_crc = crc32_bytes(bytes.get(..HEADER_CRC_AT)?);
        put_u32_le(&mut bytes, HEADER_CRC_AT, header_crc)?;
        Some(bytes)
    }

    fn image_matches(&mut self, bank: BankId, image_len: u32, expected_crc: u16) -> bool {
        let Ok(mut offset) = self.image_offset(bank) else {
            return false;
        };
        let mut remaining = image_len as usize;
        let mut block = [0u8; VERIFY_BLOCK_BYTES];
        let mut crc = CRC16_SEED;
        while remaining > 0 {
            let step = remaining.min(VERIFY_BLOCK_BYTES);
            // The last read runs into padding or erased flash up to a read unit.
            let Some(buf) = block.get_mut(..step.next_multiple_of(F::READ_SIZE)) else {
                return false;
            };
            if self.flash.read(offset, buf).is_err() {
                return false;
            }
            let Some(image_bytes) = buf.get(..step) else {
                return false;
            };
            crc = crc16_update(crc, image_bytes);
            remaining -= step;
            offset = offset.wrapping_add(step as u32);
        }
        crc == expected_crc
    }

    fn program(&mut self, offset: u32, bytes: &[u8], kind: UpdateErrorKind) -> Result<(), UpdateError> {
        self.flash
            .write(offset, bytes)
            .map_err(|e| map_flash_error(e, kind))
    }
}

impl<F: NorFlash> BankStorage for FlashBanks<F> {
    type Session = FlashSession;

    fn running_bank(&self) -> Option<BankId> {
        Some(self.running_bank)
    }

    /// The bank that is not executing. Re-updating a bank that was already
    /// switched to but not yet booted is allowed.
    fn select_target(&mut self, size: u32) -> Result<BankId, UpdateError> {
        let target = (0..BANK_COUNT as BankId)
            .find(|&bank| bank != self.running_bank)
            .ok_or(UpdateError::new(UpdateErrorKind::NoSuitableBank))?;
        if size as usize > self.image_capacity() {
            warn!("image of {} bytes exceeds bank capacity {}", size, self.image_capacity());
            return Err(UpdateError::new(UpdateErrorKind::ImageTooLarge));
        }
        Ok(target)
    }

    fn begin_session(&mut self, bank: BankId, size: u32) -> Result<FlashSession, UpdateError> {
        if bank == self.running_bank {
            return Err(UpdateError::new(UpdateErrorKind::StorageUnavailable));
        }
        if size as usize > self.image_capacity() {
            return Err(UpdateError::new(UpdateErrorKind::ImageTooLarge));
        }
        let bank_offset = self.bank_offset(bank)?;
        let erase_len = align_up(
            HEADER_SIZE_BYTES + size as usize,
            F::ERASE_SIZE,
            UpdateErrorKind::StorageUnavailable,
        )?;
        let erase_end = u32::try_from(erase_len)
            .ok()
            .and_then(|len| bank_offset.checked_add(len))
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))?;
        self.flash
            .erase(bank_offset, erase_end)
            .map_err(|e| map_flash_error(e, UpdateErrorKind::StorageUnavailable))?;

        // The erase wiped any header, so that bank is no longer bootable.
        if self.boot_bank == bank {
            self.boot_bank = self.running_bank;
        }
        if self.staged.as_ref().is_some_and(|staged| staged.bank == bank) {
            self.staged = None;
        }
        debug!("bank {} erased up to {:#x}", bank, erase_end);

        Ok(FlashSession {
            bank,
            image_offset: self.image_offset(bank)?,
            image_len: size,
            written: 0,
            programmed: 0,
            crc: CRC16_SEED,
            pending: Vec::new(),
            replay: Vec::new(),
        })
    }

    /// Programs whole write units and keeps the remainder pending.
    ///
    /// A program failure can leave the head of `data` already in flash. The
    /// updater retries from its own received total, so the next call starts
    /// with those bytes again; they are checked against `replay` and skipped.
    fn write(&mut self, session: &mut FlashSession, data: &[u8]) -> Result<(), UpdateError> {
        let write_failed = || UpdateError::new(UpdateErrorKind::WriteFailed);
        let replayed = session.replay.len().min(data.len());
        if data.get(..replayed) != session.replay.get(..replayed) {
            warn!("retry does not repeat the {} bytes already programmed", session.replay.len());
            return Err(write_failed());
        }
        let mut rest = data.get(replayed..).ok_or_else(write_failed)?;
        if replayed < session.replay.len() {
            let left = session.replay.get(replayed..).ok_or_else(write_failed)?;
            session.replay = Vec::from_slice(left).map_err(|_| write_failed())?;
            return Ok(());
        }

        let end = u32::try_from(rest.len())
            .ok()
            .and_then(|len| session.written.checked_add(len))
            .filter(|&end| end <= session.image_len)
            .ok_or_else(write_failed)?;

        let mut absorbed: Vec<u8, MAX_WRITE_UNIT> = Vec::new();
        if !session.pending.is_empty() {
            let take = (F::WRITE_SIZE - session.pending.len()).min(rest.len());
            let (head, tail) = rest.split_at(take);
            let mut unit = session.pending.clone();
            unit.extend_from_slice(head).map_err(|_| write_failed())?;
            if unit.len() == F::WRITE_SIZE {
                let head_copy = Vec::from_slice(head).map_err(|_| write_failed())?;
                let offset = session.image_offset.wrapping_add(session.programmed);
                self.program(offset, &unit, UpdateErrorKind::WriteFailed)?;
                session.programmed = session.programmed.wrapping_add(F::WRITE_SIZE as u32);
                unit.clear();
                absorbed = head_copy;
            }
            session.pending = unit;
            session.crc = crc16_update(session.crc, head);
            session.written = session.written.wrapping_add(take as u32);
            rest = tail;
        }

        let (aligned, tail) = rest.split_at(rest.len() - rest.len() % F::WRITE_SIZE);
        if !aligned.is_empty() {
            let offset = session.image_offset.wrapping_add(session.programmed);
            if let Err(e) = self.program(offset, aligned, UpdateErrorKind::WriteFailed) {
                if session.replay.extend_from_slice(&absorbed).is_err() {
                    session.replay.clear();
                }
                return Err(e);
            }
            session.programmed = session.programmed.wrapping_add(aligned.len() as u32);
        }
        session.pending.extend_from_slice(tail).map_err(|_| write_failed())?;
        session.crc = crc16_update(session.crc, rest);
        session.written = end;
        session.replay.clear();
        Ok(())
    }

    fn commit(&mut self, mut session: FlashSession) -> Result<BankId, UpdateError> {
        let commit_failed = || UpdateError::new(UpdateErrorKind::CommitFailed);
        if session.written != session.image_len {
            return Err(commit_failed());
        }
        if !session.pending.is_empty() {
            while session.pending.len() < F::WRITE_SIZE {
                session.pending.push(ERASED_BYTE).map_err(|_| commit_failed())?;
            }
            let offset = session.image_offset.wrapping_add(session.programmed);
            self.program(offset, &session.pending, UpdateErrorKind::CommitFailed)?;
        }
        if !self.image_matches(session.bank, session.image_len, session.crc) {
            error!("bank {} read back does not match what was written", session.bank);
            return Err(commit_failed());
        }
        self.staged = Some(Staged {
            bank: session.bank,
            image_len: session.image_len,
            image_crc: session.crc,
        });
        Ok(session.bank)
    }

    fn discard(&mut self, session: FlashSession) {
        debug!("session on bank {} dropped after {} bytes", session.bank, session.written);
    }

    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), UpdateError> {
        let Some(staged) = self.staged.take_if(|staged| staged.bank == bank) else {
            return Err(UpdateError::new(UpdateErrorKind::CommitFailed));
        };
        let header = BankHeader {
            image_len: staged.image_len,
            image_crc: staged.image_crc,
            sequence: self.newest_sequence.wrapping_add(1),
        };
        let bytes = Self::encode_header(&header).ok_or(UpdateError::new(UpdateErrorKind::CommitFailed))?;
        let offset = self.bank_offset(bank)?;
        self.program(offset, &bytes, UpdateErrorKind::CommitFailed)?;
        self.boot_bank = bank;
        self.newest_sequence = header.sequence;
        info!("bank {} bootable with sequence {}", bank, header.sequence);
        Ok(())
    }

    fn running_image_crc(&mut self) -> Result<u16, UpdateError> {
        if let Some(header) = self.running_header {
            return Ok(header.image_crc);
        }
        let start = self.image_offset(self.running_bank)?;
        let capacity = self.image_capacity();
        scan_image_crc(&mut self.flash, start, capacity).map(|scanned| scanned.crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_flash::{ERASE_SIZE, MockFlash, WordReadFlash};
    use crate::restart::RestartSignal;
    use fw_update::crc::crc16;
    use fw_update::record::MemRecordStore;
    use fw_update::{ImageMetadata, UpdateConfig, Updater};

    const FLASH_BYTES: usize = 8 * ERASE_SIZE;

    fn make_banks() -> FlashBanks<MockFlash> {
        FlashBanks::new(MockFlash::new(FLASH_BYTES), 0, FLASH_BYTES as u32).unwrap()
    }

    fn image(len: usize, seed: u8) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn stage_image(banks: &mut FlashBanks<MockFlash>, data: &[u8], chunk: usize) -> BankId {
        let bank = banks.select_target(data.len() as u32).unwrap();
        let mut session = banks.begin_session(bank, data.len() as u32).unwrap();
        for piece in data.chunks(chunk) {
            banks.write(&mut session, piece).unwrap();
        }
        banks.commit(session).unwrap()
    }

    #[test]
    fn blank_flash_boots_bank_zero() {
        let mut banks = make_banks();
        assert_eq!(banks.running_bank(), Some(0));
        assert_eq!(banks.boot_bank(), 0);
        assert_eq!(banks.image_capacity(), 4 * ERASE_SIZE - HEADER_SIZE_BYTES);
        assert_eq!(banks.running_image_crc().unwrap(), 0xFFFF);
    }

    #[test]
    fn unaligned_region_is_refused() {
        let err = FlashBanks::new(MockFlash::new(FLASH_BYTES), 4, FLASH_BYTES as u32).err().unwrap();
        assert_eq!(err.kind(), UpdateErrorKind::StorageUnavailable);
        let err = FlashBanks::new(MockFlash::new(FLASH_BYTES), 0, 2 * FLASH_BYTES as u32)
            .err()
            .unwrap();
        assert_eq!(err.kind(), UpdateErrorKind::StorageUnavailable);
    }

    #[test]
    fn odd_sized_writes_land_contiguously() {
        let mut banks = make_banks();
        let data = image(301, 7);
        let bank = stage_image(&mut banks, &data, 7);
        assert_eq!(bank, 1);

        let start = banks.image_offset(1).unwrap() as usize;
        let flash = banks.release();
        assert_eq!(&flash.bytes()[start..start + data.len()], &data[..]);
        assert_eq!(flash.bytes()[start + data.len()], 0xFF);
    }

    #[test]
    fn boot_bank_does_not_flip_until_activated() {
        let mut banks = make_banks();
        let data = image(100, 1);
        let bank = stage_image(&mut banks, &data, 64);
        assert_eq!(banks.boot_bank(), 0);

        let mut flash = banks.release();
        let reopened = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        assert_eq!(reopened.running_bank(), Some(0));

        flash = reopened.release();
        let mut banks = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        let bank_again = stage_image(&mut banks, &data, 64);
        assert_eq!(bank_again, bank);
        banks.set_boot_bank(bank).unwrap();
        assert_eq!(banks.boot_bank(), 1);
        // Still executing bank 0 until the restart.
        assert_eq!(banks.running_bank(), Some(0));

        let mut reopened = FlashBanks::new(banks.release(), 0, FLASH_BYTES as u32).unwrap();
        assert_eq!(reopened.running_bank(), Some(1));
        assert_eq!(reopened.running_image_crc().unwrap(), crc16(&data));
    }

    #[test]
    fn updates_alternate_banks_across_restarts() {
        let mut banks = make_banks();
        let first = image(200, 3);
        let bank = stage_image(&mut banks, &first, 50);
        banks.set_boot_bank(bank).unwrap();

        let mut banks = FlashBanks::new(banks.release(), 0, FLASH_BYTES as u32).unwrap();
        let second = image(120, 9);
        let bank = stage_image(&mut banks, &second, 50);
        assert_eq!(bank, 0);
        banks.set_boot_bank(bank).unwrap();

        let mut banks = FlashBanks::new(banks.release(), 0, FLASH_BYTES as u32).unwrap();
        assert_eq!(banks.running_bank(), Some(0));
        assert_eq!(banks.read_header(0).unwrap().sequence, 2);
        assert_eq!(banks.read_header(1).unwrap().sequence, 1);
        assert_eq!(banks.running_image_crc().unwrap(), crc16(&second));
    }

    #[test]
    fn corrupt_newer_bank_falls_back() {
        let mut banks = make_banks();
        let first = image(200, 3);
        let bank = stage_image(&mut banks, &first, 50);
        banks.set_boot_bank(bank).unwrap();
        let mut banks = FlashBanks::new(banks.release(), 0, FLASH_BYTES as u32).unwrap();
        let second = image(120, 9);
        let bank = stage_image(&mut banks, &second, 50);
        banks.set_boot_bank(bank).unwrap();

        let image_start = banks.image_offset(0).unwrap() as usize;
        let mut flash = banks.release();
        flash.corrupt_byte(image_start + 10);

        let banks = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        assert_eq!(banks.running_bank(), Some(1));
    }

    #[test]
    fn incomplete_session_cannot_commit() {
        let mut banks = make_banks();
        let mut session = banks.begin_session(1, 64).unwrap();
        banks.write(&mut session, &[1, 2, 3]).unwrap();
        let err = banks.commit(session).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::CommitFailed);
        let err = banks.set_boot_bank(1).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::CommitFailed);
    }

    #[test]
    fn session_refuses_overrun_and_running_bank() {
        let mut banks = make_banks();
        let err = banks.begin_session(0, 16).err().unwrap();
        assert_eq!(err.kind(), UpdateErrorKind::StorageUnavailable);

        let too_big = banks.image_capacity() as u32 + 1;
        let err = banks.select_target(too_big).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::ImageTooLarge);

        let mut session = banks.begin_session(1, 4).unwrap();
        let err = banks.write(&mut session, &[0; 5]).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::WriteFailed);
        banks.write(&mut session, &[0; 4]).unwrap();
    }

    #[test]
    fn flash_failures_map_to_step_errors() {
        let mut flash = MockFlash::new(FLASH_BYTES);
        flash.fail_erases(true);
        let mut banks = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        let err = banks.begin_session(1, 16).err().unwrap();
        assert_eq!(err.kind(), UpdateErrorKind::StorageUnavailable);

        let mut flash = banks.release();
        flash.fail_erases(false);
        flash.fail_writes(true);
        let mut banks = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        let mut session = banks.begin_session(1, 16).unwrap();
        let err = banks.write(&mut session, &[0; 8]).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::WriteFailed);
    }

    #[test]
    fn word_read_flash_commits_odd_length_image() {
        let flash = WordReadFlash(MockFlash::new(FLASH_BYTES));
        let mut banks = FlashBanks::new(flash, 0, FLASH_BYTES as u32).unwrap();
        let data = image(301, 11);
        let bank = banks.select_target(301).unwrap();
        let mut session = banks.begin_session(bank, 301).unwrap();
        banks.write(&mut session, &data).unwrap();
        assert_eq!(banks.commit(session).unwrap(), 1);
        banks.set_boot_bank(1).unwrap();

        let mut reopened = FlashBanks::new(banks.release(), 0, FLASH_BYTES as u32).unwrap();
        assert_eq!(reopened.running_bank(), Some(1));
        assert_eq!(reopened.running_image_crc().unwrap(), crc16(&data));
    }

    #[test]
    fn write_resumes_after_a_failed_program() {
        let mut banks = make_banks();
        let data: std::vec::Vec<u8> = (1..=16).collect();
        let mut session = banks.begin_session(1, 16).unwrap();
        banks.write(&mut session, &data[..2]).unwrap();

        // The completed first unit lands, the aligned rest does not.
        banks.flash.fail_nth_write(2);
        let err = banks.write(&mut session, &data[2..8]).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::WriteFailed);

        let err = banks.write(&mut session, &[9; 6]).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::WriteFailed);
        banks.write(&mut session, &data[2..8]).unwrap();
        banks.write(&mut session, &data[8..]).unwrap();
        assert_eq!(banks.commit(session).unwrap(), 1);

        let start = banks.image_offset(1).unwrap() as usize;
        assert_eq!(&banks.release().bytes()[start..start + 16], &data[..]);
    }

    #[test]
    fn updater_retries_a_chunk_from_its_received_total() {
        let restart = RestartSignal::new();
        let data = image(40, 5);
        let mut up = Updater::new(make_banks(), MemRecordStore::new(), &restart, UpdateConfig::default());
        up.submit_metadata(ImageMetadata {
            image_bytes: 40,
            crc: crc16(&data),
            image_type: 0,
            bank: 1,
            version: 3,
        })
        .unwrap();
        up.prepare_storage().unwrap();
        assert_eq!(up.receive_chunk(&data[..6], 0).unwrap(), 6);

        up.storage_mut().flash.fail_nth_write(2);
        let err = up.receive_chunk(&data[6..20], 6).unwrap_err();
        assert_eq!(err.kind(), UpdateErrorKind::WriteFailed);
        assert_eq!(up.context().received_bytes(), 6);

        assert_eq!(up.receive_chunk(&data[6..20], 6).unwrap(), 20);
        assert_eq!(up.receive_chunk(&data[20..], 20).unwrap(), 40);
        up.finalize(crc16(&data)).unwrap();
        assert_eq!(up.storage().boot_bank(), 1);
        assert!(restart.is_requested());
    }
}
