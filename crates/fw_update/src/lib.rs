#![no_std]

#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing,
        clippy::string_slice,
        clippy::panicking_unwrap,
        clippy::out_of_bounds_indexing,
        clippy::panic_in_result_fn,
        clippy::unwrap_in_result,
    )
)]
#![cfg_attr(not(test), warn(clippy::missing_panics_doc))]

//! Firmware download state machine for a fieldbus slave.
//!
//! A bus master writes four objects in order: image metadata, a START
//! control command, the image bytes in contiguous chunks, and finally the
//! image CRC. The [`updater::Updater`] checks every step, streams the bytes
//! into a [`BankStorage`] write session and only marks the new bank bootable
//! once the running CRC matches both the advertised and the declared value.
//! [`objects::ObjectServer`] adapts those steps to object/sub-index writes.

#[macro_use]
mod fmt;

pub mod context;
pub mod crc;
pub mod mem_storage;
pub mod objects;
pub mod record;
pub mod updater;

use heapless::String;
use thiserror_no_std::Error;

pub use context::{ImageMetadata, Stage, UpdateContext};
pub use record::PersistentRecord;
pub use updater::{Admission, UpdateConfig, Updater};

/// Index of a storage bank. Bank numbering is owned by the storage backend.
pub type BankId = u8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateErrorKind {
    InvalidMetadata,
    InvalidStage,
    NotPrepared,
    StorageUnavailable,
    NoSuitableBank,
    ImageTooLarge,
    EmptyChunk,
    OffsetMismatch,
    Overflow,
    WriteFailed,
    SizeMismatch,
    CrcMismatch,
    CommitFailed,
    PersistFailed,
    UnsupportedCommand,
}

pub const ERROR_LOCATION_FILE_MAX: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLocation {
    pub file: String<ERROR_LOCATION_FILE_MAX>,
    pub line: u32,
    pub column: u32,
}

impl ErrorLocation {
    #[track_caller]
    pub fn capture() -> Self {
        let loc = core::panic::Location::caller();
        Self::from_parts(loc.file(), loc.line(), loc.column())
    }

    pub fn from_parts(file: &str, line: u32, column: u32) -> Self {
        let mut file_name = String::new();
        for ch in file.chars() {
            if file_name.push(ch).is_err() {
                break;
            }
        }
        Self {
            file: file_name,
            line,
            column,
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("metadata rejected")]
    InvalidMetadata { location: ErrorLocation },
    #[error("operation not allowed in the current stage")]
    InvalidStage { location: ErrorLocation },
    #[error("storage has not been prepared")]
    NotPrepared { location: ErrorLocation },
    #[error("storage could not be opened")]
    StorageUnavailable { location: ErrorLocation },
    #[error("no bank can receive the image")]
    NoSuitableBank { location: ErrorLocation },
    #[error("image does not fit in the target bank")]
    ImageTooLarge { location: ErrorLocation },
    #[error("chunk is empty")]
    EmptyChunk { location: ErrorLocation },
    #[error("chunk offset is not the next expected offset")]
    OffsetMismatch { location: ErrorLocation },
    #[error("chunk runs past the declared image size")]
    Overflow { location: ErrorLocation },
    #[error("storage write failed")]
    WriteFailed { location: ErrorLocation },
    #[error("image is incomplete")]
    SizeMismatch { location: ErrorLocation },
    #[error("image CRC does not match")]
    CrcMismatch { location: ErrorLocation },
    #[error("bank could not be activated")]
    CommitFailed { location: ErrorLocation },
    #[error("verified record could not be stored")]
    PersistFailed { location: ErrorLocation },
    #[error("unsupported control command")]
    UnsupportedCommand { location: ErrorLocation },
}

impl UpdateError {
    #[track_caller]
    pub fn new(kind: UpdateErrorKind) -> Self {
        let location = ErrorLocation::capture();
        match kind {
            UpdateErrorKind::InvalidMetadata => UpdateError::InvalidMetadata { location },
            UpdateErrorKind::InvalidStage => UpdateError::InvalidStage { location },
            UpdateErrorKind::NotPrepared => UpdateError::NotPrepared { location },
            UpdateErrorKind::StorageUnavailable => UpdateError::StorageUnavailable { location },
            UpdateErrorKind::NoSuitableBank => UpdateError::NoSuitableBank { location },
            UpdateErrorKind::ImageTooLarge => UpdateError::ImageTooLarge { location },
            UpdateErrorKind::EmptyChunk => UpdateError::EmptyChunk { location },
            UpdateErrorKind::OffsetMismatch => UpdateError::OffsetMismatch { location },
            UpdateErrorKind::Overflow => UpdateError::Overflow { location },
            UpdateErrorKind::WriteFailed => UpdateError::WriteFailed { location },
            UpdateErrorKind::SizeMismatch => UpdateError::SizeMismatch { location },
            UpdateErrorKind::CrcMismatch => UpdateError::CrcMismatch { location },
            UpdateErrorKind::CommitFailed => UpdateError::CommitFailed { location },
            UpdateErrorKind::PersistFailed => UpdateError::PersistFailed { location },
            UpdateErrorKind::UnsupportedCommand => UpdateError::UnsupportedCommand { location },
        }
    }

    pub fn kind(&self) -> UpdateErrorKind {
        match self {
            UpdateError::InvalidMetadata { .. } => UpdateErrorKind::InvalidMetadata,
            UpdateError::InvalidStage { .. } => UpdateErrorKind::InvalidStage,
            UpdateError::NotPrepared { .. } => UpdateErrorKind::NotPrepared,
            UpdateError::StorageUnavailable { .. } => UpdateErrorKind::StorageUnavailable,
            UpdateError::NoSuitableBank { .. } => UpdateErrorKind::NoSuitableBank,
            UpdateError::ImageTooLarge { .. } => UpdateErrorKind::ImageTooLarge,
            UpdateError::EmptyChunk { .. } => UpdateErrorKind::EmptyChunk,
            UpdateError::OffsetMismatch { .. } => UpdateErrorKind::OffsetMismatch,
            UpdateError::Overflow { .. } => UpdateErrorKind::Overflow,
            UpdateError::WriteFailed { .. } => UpdateErrorKind::WriteFailed,
            UpdateError::SizeMismatch { .. } => UpdateErrorKind::SizeMismatch,
            UpdateError::CrcMismatch { .. } => UpdateErrorKind::CrcMismatch,
            UpdateError::CommitFailed { .. } => UpdateErrorKind::CommitFailed,
            UpdateError::PersistFailed { .. } => UpdateErrorKind::PersistFailed,
            UpdateError::UnsupportedCommand { .. } => UpdateErrorKind::UnsupportedCommand,
        }
    }

    pub fn location(&self) -> &ErrorLocation {
        match self {
            UpdateError::InvalidMetadata { location }
            | UpdateError::InvalidStage { location }
            | UpdateError::NotPrepared { location }
            | UpdateError::StorageUnavailable { location }
            | UpdateError::NoSuitableBank { location }
            | UpdateError::ImageTooLarge { location }
            | UpdateError::EmptyChunk { location }
            | UpdateError::OffsetMismatch { location }
            | UpdateError::Overflow { location }
            | UpdateError::WriteFailed { location }
            | UpdateError::SizeMismatch { location }
            | UpdateError::CrcMismatch { location }
            | UpdateError::CommitFailed { location }
            | UpdateError::PersistFailed { location }
            | UpdateError::UnsupportedCommand { location } => location,
        }
    }
}

/// Medium that holds firmware banks.
///
/// Exactly one bank is bootable at a time. An update streams into another
/// bank through a `Session`, which the updater owns from
/// [`begin_session`](BankStorage::begin_session) until it hands it back to
/// exactly one of [`commit`](BankStorage::commit) or
/// [`discard`](BankStorage::discard).
pub trait BankStorage {
    type Session: Sized;

    /// Bank the device booted from, if the backend can tell.
    fn running_bank(&self) -> Option<BankId>;

    /// Picks the bank that will receive an image of `size` bytes.
    ///
    /// Fails with `NoSuitableBank` when no bank other than the bootable one
    /// exists and with `ImageTooLarge` when the candidate is too small.
    fn select_target(&mut self, size: u32) -> Result<BankId, UpdateError>;

    /// Erases `bank` as far as needed for `size` bytes and opens a write
    /// session at its start. Fails with `StorageUnavailable`.
    fn begin_session(&mut self, bank: BankId, size: u32) -> Result<Self::Session, UpdateError>;

    /// Appends `data` to the session. Fails with `WriteFailed`.
    fn write(&mut self, session: &mut Self::Session, data: &[u8]) -> Result<(), UpdateError>;

    /// Flushes the session. The bank is complete but not yet bootable.
    /// Fails with `CommitFailed`.
    fn commit(&mut self, session: Self::Session) -> Result<BankId, UpdateError>;

    /// Drops the session without making anything bootable.
    fn discard(&mut self, session: Self::Session);

    /// Makes a committed bank the one to boot next. Fails with
    /// `CommitFailed`.
    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), UpdateError>;

    /// CRC of the running image measured from the medium itself, used only
    /// when no verified record exists.
    fn running_image_crc(&mut self) -> Result<u16, UpdateError>;
}

/// Durable home of the last verified image CRC and version.
pub trait RecordStore {
    fn load(&mut self) -> Result<Option<PersistentRecord>, UpdateError>;
    fn save(&mut self, record: &PersistentRecord) -> Result<(), UpdateError>;
}

/// Arms a one-shot restart into the newly committed bank.
///
/// Implementations must return immediately; the restart itself happens
/// later on another context so the caller can still report success.
pub trait RestartScheduler {
    fn schedule_restart(&mut self, delay_ms: u32);
}
