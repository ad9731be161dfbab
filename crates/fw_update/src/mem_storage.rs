use crate::crc::{ERASED_BYTE, ImageScanner, SCAN_BLOCK_SIZE};
use crate::{BankId, BankStorage, UpdateError, UpdateErrorKind};

pub const MAX_MEM_BANKS: usize = 2;

/// Step at which [`MemBanks`] should pretend the medium failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemFault {
    Open,
    Write,
    Commit,
    Activate,
}

/// Banks carved out of a RAM buffer.
///
/// Bank 0 is bootable at start. A committed bank is staged until
/// [`set_boot_bank`](BankStorage::set_boot_bank) picks it.
pub struct MemBanks<'a> {
    banks: heapless::Vec<&'a mut [u8], MAX_MEM_BANKS>,
    boot_bank: BankId,
    staged: Option<BankId>,
    fault: Option<MemFault>,
    discarded: u32,
}

pub struct MemSession {
    bank: BankId,
    len: u32,
    written: u32,
}

impl MemSession {
    pub fn bank(&self) -> BankId {
        self.bank
    }

    pub fn written(&self) -> u32 {
        self.written
    }
}

impl<'a> MemBanks<'a> {
    /// Splits `memory` into two equally sized banks.
    pub fn new(memory: &'a mut [u8]) -> Self {
        let half = memory.len() / 2;
        let (first, second) = memory.split_at_mut(half);
        let mut banks = heapless::Vec::new();
        let _ = banks.push(first);
        let _ = banks.push(second);
        Self::from_banks(banks)
    }

    /// A device without a spare bank. Every update is refused.
    pub fn single(memory: &'a mut [u8]) -> Self {
        let mut banks = heapless::Vec::new();
        let _ = banks.push(memory);
        Self::from_banks(banks)
    }

    fn from_banks(banks: heapless::Vec<&'a mut [u8], MAX_MEM_BANKS>) -> Self {
        Self {
            banks,
            boot_bank: 0,
            staged: None,
            fault: None,
            discarded: 0,
        }
    }

    pub fn inject_fault(&mut self, fault: Option<MemFault>) {
        self.fault = fault;
    }

    pub fn boot_bank(&self) -> BankId {
        self.boot_bank
    }

    pub fn bank(&self, bank: BankId) -> Option<&[u8]> {
        self.banks.get(usize::from(bank)).map(|b| &**b)
    }

    /// Sessions dropped without a commit.
    pub fn discarded_sessions(&self) -> u32 {
        self.discarded
    }

    fn fails_at(&self, step: MemFault) -> bool {
        self.fault == Some(step)
    }
}

impl BankStorage for MemBanks<'_> {
    type Session = MemSession;

    fn running_bank(&self) -> Option<BankId> {
        Some(self.boot_bank)
    }

    fn select_target(&mut self, size: u32) -> Result<BankId, UpdateError> {
        let target = (0..self.banks.len())
            .filter_map(|idx| BankId::try_from(idx).ok())
            .find(|&idx| idx != self.boot_bank)
            .ok_or(UpdateError::new(UpdateErrorKind::NoSuitableBank))?;
        let capacity = self.bank(target).map(|b| b.len()).unwrap_or(0);
        let size = usize::try_from(size).map_err(|_| UpdateError::new(UpdateErrorKind::ImageTooLarge))?;
        if size > capacity {
            return Err(UpdateError::new(UpdateErrorKind::ImageTooLarge));
        }
        Ok(target)
    }

    fn begin_session(&mut self, bank: BankId, size: u32) -> Result<MemSession, UpdateError> {
        if self.fails_at(MemFault::Open) || bank == self.boot_bank {
            return Err(UpdateError::new(UpdateErrorKind::StorageUnavailable));
        }
        let memory = self
            .banks
            .get_mut(usize::from(bank))
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))?;
        memory.fill(ERASED_BYTE);
        if self.staged == Some(bank) {
            self.staged = None;
        }
        Ok(MemSession {
            bank,
            len: size,
            written: 0,
        })
    }

    fn write(&mut self, session: &mut MemSession, data: &[u8]) -> Result<(), UpdateError> {
        if self.fails_at(MemFault::Write) {
            return Err(UpdateError::new(UpdateErrorKind::WriteFailed));
        }
        let len = u32::try_from(data.len()).map_err(|_| UpdateError::new(UpdateErrorKind::WriteFailed))?;
        let end = session
            .written
            .checked_add(len)
            .filter(|&end| end <= session.len)
            .ok_or(UpdateError::new(UpdateErrorKind::WriteFailed))?;
        let start = session.written as usize;
        let target = self
            .banks
            .get_mut(usize::from(session.bank))
            .and_then(|memory| memory.get_mut(start..end as usize))
            .ok_or(UpdateError::new(UpdateErrorKind::WriteFailed))?;
        target.copy_from_slice(data);
        session.written = end;
        Ok(())
    }

    fn commit(&mut self, session: MemSession) -> Result<BankId, UpdateError> {
        if self.fails_at(MemFault::Commit) || session.written != session.len {
            self.discarded = self.discarded.saturating_add(1);
            return Err(UpdateError::new(UpdateErrorKind::CommitFailed));
        }
        self.staged = Some(session.bank);
        Ok(session.bank)
    }

    fn discard(&mut self, _session: MemSession) {
        self.discarded = self.discarded.saturating_add(1);
    }

    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), UpdateError> {
        if self.fails_at(MemFault::Activate) || self.staged != Some(bank) {
            return Err(UpdateError::new(UpdateErrorKind::CommitFailed));
        }
        self.boot_bank = bank;
        self.staged = None;
        Ok(())
    }

    fn running_image_crc(&mut self) -> Result<u16, UpdateError> {
        let memory = self
            .bank(self.boot_bank)
            .ok_or(UpdateError::new(UpdateErrorKind::StorageUnavailable))?;
        let mut scanner = ImageScanner::new();
        for block in memory.chunks(SCAN_BLOCK_SIZE) {
            if scanner.feed_block(block) {
                break;
            }
        }
        Ok(scanner.crc())
    }
}
