//! Object dictionary entries a bus master uses to drive an update.
//!
//! The fieldbus stack delivers each remote write as a sub-index plus a
//! stream of byte segments. [`ObjectServer::write`] turns those into
//! [`Updater`] calls and reports the result with the stack's vocabulary:
//! done, more segments expected, or an [`ObjectError`].

use heapless::Vec;
use thiserror_no_std::Error;

use crate::context::ImageMetadata;
use crate::updater::Updater;
use crate::{BankStorage, RecordStore, RestartScheduler, UpdateErrorKind};

pub const DEFAULT_MAX_CHUNK: usize = 256;
pub const METADATA_RECORD_LEN: usize = 10;
pub const CONTROL_RECORD_LEN: usize = 3;
pub const STATUS_RECORD_LEN: usize = 2;
pub const CONTROL_CMD_START: u8 = 0x01;

/// Highest sub-index of every update object.
pub const HIGHEST_SUB_INDEX: u8 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ObjectIndex {
    Data = 0x1F50,
    Control = 0x1F51,
    Metadata = 0x1F57,
    Status = 0x1F5A,
    RunningCrc = 0x1F5B,
    RunningVersion = 0x1F5C,
}

impl TryFrom<u16> for ObjectIndex {
    type Error = ObjectError;

    fn try_from(index: u16) -> Result<Self, Self::Error> {
        match index {
            0x1F50 => Ok(ObjectIndex::Data),
            0x1F51 => Ok(ObjectIndex::Control),
            0x1F57 => Ok(ObjectIndex::Metadata),
            0x1F5A => Ok(ObjectIndex::Status),
            0x1F5B => Ok(ObjectIndex::RunningCrc),
            0x1F5C => Ok(ObjectIndex::RunningVersion),
            _ => Err(ObjectError::UnknownObject),
        }
    }
}

impl ObjectIndex {
    fn is_read_only(self) -> bool {
        matches!(self, ObjectIndex::RunningCrc | ObjectIndex::RunningVersion)
    }
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectError {
    #[error("sub-index does not exist")]
    SubNotExist,
    #[error("no data")]
    NoData,
    #[error("data length does not match the object")]
    DataLong,
    #[error("object is read-only")]
    ReadOnly,
    #[error("object is write-only")]
    WriteOnly,
    #[error("object does not exist")]
    UnknownObject,
    #[error("value rejected: {0:?}")]
    InvalidValue(UpdateErrorKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    Complete,
    /// More segments of the same write are expected.
    Partial,
}

/// Position inside one logical write, kept by the caller across segments.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WriteStream {
    pub sub_index: u8,
    /// Bytes of this write already delivered.
    pub data_offset: u32,
    /// Total size of the write, or 0 when the master did not announce it.
    pub data_length: u32,
}

impl WriteStream {
    pub fn new(sub_index: u8, data_length: u32) -> Self {
        Self {
            sub_index,
            data_offset: 0,
            data_length,
        }
    }
}

pub fn decode_metadata_record(bytes: &[u8]) -> Option<ImageMetadata> {
    let record: &[u8; METADATA_RECORD_LEN] = bytes.try_into().ok()?;
    let [s0, s1, s2, s3, c0, c1, image_type, bank, v0, v1] = *record;
    Some(ImageMetadata {
        image_bytes: u32::from_le_bytes([s0, s1, s2, s3]),
        crc: u16::from_le_bytes([c0, c1]),
        image_type,
        bank,
        version: u16::from_le_bytes([v0, v1]),
    })
}

pub fn encode_metadata_record(meta: &ImageMetadata) -> [u8; METADATA_RECORD_LEN] {
    let [s0, s1, s2, s3] = meta.image_bytes.to_le_bytes();
    let [c0, c1] = meta.crc.to_le_bytes();
    let [v0, v1] = meta.version.to_le_bytes();
    [s0, s1, s2, s3, c0, c1, meta.image_type, meta.bank, v0, v1]
}

/// Maps object writes and reads onto an owned [`Updater`].
pub struct ObjectServer<S, R, T, const MAX_CHUNK: usize = DEFAULT_MAX_CHUNK>
where
    S: BankStorage,
    R: RecordStore,
    T: RestartScheduler,
{
    updater: Updater<S, R, T>,
    metadata: Vec<u8, METADATA_RECORD_LEN>,
}

impl<S, R, T, const MAX_CHUNK: usize> ObjectServer<S, R, T, MAX_CHUNK>
where
    S: BankStorage,
    R: RecordStore,
    T: RestartScheduler,
{
    pub fn new(updater: Updater<S, R, T>) -> Self {
        Self {
            updater,
            metadata: Vec::new(),
        }
    }

    pub fn updater(&self) -> &Updater<S, R, T> {
        &self.updater
    }

    pub fn updater_mut(&mut self) -> &mut Updater<S, R, T> {
        &mut self.updater
    }

    pub fn into_updater(self) -> Updater<S, R, T> {
        self.updater
    }

    /// Handles one segment of a remote write to `index`.
    ///
    /// `stream.data_offset` is advanced past `data` when the segment is
    /// accepted.
    pub fn write(
        &mut self,
        index: u16,
        stream: &mut WriteStream,
        data: &[u8],
    ) -> Result<WriteOutcome, ObjectError> {
        let object = ObjectIndex::try_from(index)?;
        match stream.sub_index {
            0 if object == ObjectIndex::Data || object.is_read_only() => {
                return Err(ObjectError::ReadOnly);
            }
            0 => return Ok(WriteOutcome::Complete),
            HIGHEST_SUB_INDEX => {}
            _ => return Err(ObjectError::SubNotExist),
        }

        let outcome = match object {
            ObjectIndex::Metadata => self.write_metadata(stream, data),
            ObjectIndex::Control => self.write_control(stream, data),
            ObjectIndex::Data => self.write_data(stream, data),
            ObjectIndex::Status => self.write_status(stream, data),
            ObjectIndex::RunningCrc | ObjectIndex::RunningVersion => Err(ObjectError::ReadOnly),
        }
        .inspect_err(|e| {
            warn!("write to {:#x} sub {} rejected: {}", index, stream.sub_index, e);
        })?;

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        stream.data_offset = stream.data_offset.saturating_add(len);
        Ok(outcome)
    }

    /// Reads sub-index `sub` of `index`.
    pub fn read(&self, index: u16, sub: u8) -> Result<Vec<u8, METADATA_RECORD_LEN>, ObjectError> {
        let object = ObjectIndex::try_from(index)?;
        let mut out = Vec::new();
        match sub {
            0 => {
                out.push(HIGHEST_SUB_INDEX).map_err(|_| ObjectError::DataLong)?;
                return Ok(out);
            }
            HIGHEST_SUB_INDEX => {}
            _ => return Err(ObjectError::SubNotExist),
        }

        let running = self.updater.running_firmware();
        let filled = match object {
            ObjectIndex::Metadata => {
                let meta = self
                    .updater
                    .context()
                    .metadata()
                    .ok_or(ObjectError::NoData)?;
                out.extend_from_slice(&encode_metadata_record(&meta))
            }
            ObjectIndex::RunningCrc => out.extend_from_slice(&running.crc.to_le_bytes()),
            ObjectIndex::RunningVersion => out.extend_from_slice(&running.version.to_le_bytes()),
            ObjectIndex::Control | ObjectIndex::Status | ObjectIndex::Data => {
                return Err(ObjectError::WriteOnly);
            }
        };
        filled.map_err(|_| ObjectError::DataLong)?;
        Ok(out)
    }

    fn write_metadata(
        &mut self,
        stream: &WriteStream,
        data: &[u8],
    ) -> Result<WriteOutcome, ObjectError> {
        if data.is_empty() {
            return Err(ObjectError::NoData);
        }
        if stream.data_offset == 0 {
            self.metadata.clear();
        }
        let staged_end = usize::try_from(stream.data_offset)
            .ok()
            .and_then(|offset| offset.checked_add(data.len()));
        if !staged_end.is_some_and(|end| end <= METADATA_RECORD_LEN) {
            self.metadata.clear();
            return Err(ObjectError::DataLong);
        }
        if usize::try_from(stream.data_offset).ok() != Some(self.metadata.len()) {
            self.metadata.clear();
            return Err(ObjectError::InvalidValue(UpdateErrorKind::OffsetMismatch));
        }
        self.metadata
            .extend_from_slice(data)
            .map_err(|_| ObjectError::DataLong)?;
        if self.metadata.len() < METADATA_RECORD_LEN {
            return Ok(WriteOutcome::Partial);
        }

        let meta = decode_metadata_record(&self.metadata);
        self.metadata.clear();
        let meta = meta.ok_or(ObjectError::InvalidValue(UpdateErrorKind::InvalidMetadata))?;
        self.updater
            .submit_metadata(meta)
            .map_err(|e| ObjectError::InvalidValue(e.kind()))?;
        Ok(WriteOutcome::Complete)
    }

    fn write_control(
        &mut self,
        stream: &WriteStream,
        data: &[u8],
    ) -> Result<WriteOutcome, ObjectError> {
        if stream.data_offset != 0 || data.len() != CONTROL_RECORD_LEN {
            return Err(ObjectError::DataLong);
        }
        let command = data.first().copied().ok_or(ObjectError::NoData)?;
        if command != CONTROL_CMD_START {
            error!("unsupported control command {:#x}", command);
            return Err(ObjectError::InvalidValue(UpdateErrorKind::UnsupportedCommand));
        }
        if !self.updater.context().metadata_received() {
            error!("start received before metadata");
            return Err(ObjectError::InvalidValue(UpdateErrorKind::InvalidStage));
        }
        self.updater
            .prepare_storage()
            .map_err(|e| ObjectError::InvalidValue(e.kind()))?;
        Ok(WriteOutcome::Complete)
    }

    fn write_data(&mut self, stream: &WriteStream, data: &[u8]) -> Result<WriteOutcome, ObjectError> {
        if data.is_empty() {
            return Err(ObjectError::NoData);
        }
        if data.len() > MAX_CHUNK {
            error!("chunk too large ({} > {})", data.len(), MAX_CHUNK);
            return Err(ObjectError::DataLong);
        }
        self.updater
            .receive_segment(data, stream.data_offset)
            .map_err(|e| ObjectError::InvalidValue(e.kind()))?;

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let next_offset = stream.data_offset.saturating_add(len);
        if stream.data_length == 0 || next_offset >= stream.data_length {
            Ok(WriteOutcome::Complete)
        } else {
            Ok(WriteOutcome::Partial)
        }
    }

    fn write_status(
        &mut self,
        stream: &WriteStream,
        data: &[u8],
    ) -> Result<WriteOutcome, ObjectError> {
        let crc: [u8; STATUS_RECORD_LEN] = data.try_into().map_err(|_| ObjectError::DataLong)?;
        if stream.data_offset != 0 {
            return Err(ObjectError::DataLong);
        }
        self.updater
            .finalize(u16::from_le_bytes(crc))
            .map_err(|e| ObjectError::InvalidValue(e.kind()))?;
        Ok(WriteOutcome::Complete)
    }
}
