//! In-memory NOR flash for host tests.
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase, check_read, check_write,
};

pub const READ_SIZE: usize = 1;
pub const WRITE_SIZE: usize = 4;
pub const ERASE_SIZE: usize = 256;

pub struct MockFlash {
    storage: std::vec::Vec<u8>,
    fail_writes: bool,
    fail_erases: bool,
    writes_until_failure: Option<usize>,
}

impl MockFlash {
    pub fn new(bytes: usize) -> Self {
        Self {
            storage: std::vec![0xFF; bytes],
            fail_writes: false,
            fail_erases: false,
            writes_until_failure: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.storage
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    pub fn corrupt_byte(&mut self, offset: usize) {
        if let Some(slot) = self.storage.get_mut(offset) {
            *slot ^= 0x01;
        }
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erases = fail;
    }

    /// Fails the `nth` program call from now, once. Earlier calls land.
    pub fn fail_nth_write(&mut self, nth: usize) {
        self.writes_until_failure = Some(nth);
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.storage[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        if self.fail_erases {
            return Err(NorFlashErrorKind::Other);
        }
        self.storage[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        if self.fail_writes {
            return Err(NorFlashErrorKind::Other);
        }
        if let Some(left) = self.writes_until_failure.take() {
            if left <= 1 {
                return Err(NorFlashErrorKind::Other);
            }
            self.writes_until_failure = Some(left - 1);
        }
        let start = offset as usize;
        for (slot, &value) in self.storage[start..start + bytes.len()].iter_mut().zip(bytes) {
            // Programming a byte twice needs an erase in between.
            if *slot != 0xFF {
                return Err(NorFlashErrorKind::Other);
            }
            *slot = value;
        }
        Ok(())
    }
}

/// [`MockFlash`] behind a bus that only reads whole words.
pub struct WordReadFlash(pub MockFlash);

impl ErrorType for WordReadFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for WordReadFlash {
    const READ_SIZE: usize = 4;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        self.0.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.0.capacity()
    }
}

impl NorFlash for WordReadFlash {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.0.erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.0.write(offset, bytes)
    }
}
