use crate::crc::CRC16_SEED;
use crate::{BankId, UpdateError, UpdateErrorKind};

/// Phase of a firmware download.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    MetadataReady = 1,
    Preparing = 2,
    ReceivingBlocks = 3,
    Verifying = 4,
    ReadyToBoot = 5,
}

/// Something that asks the stage machine to move.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StageEvent {
    Metadata,
    BeginPrepare,
    Prepared,
    Chunk,
    BeginVerify,
    Verified,
}

impl Stage {
    /// The only place stage transitions are decided.
    ///
    /// New metadata is accepted from every stage and restarts the transfer.
    /// Everything else moves strictly forward.
    #[track_caller]
    pub fn advance(self, event: StageEvent) -> Result<Stage, UpdateError> {
        match (self, event) {
            (_, StageEvent::Metadata) => Ok(Stage::MetadataReady),
            (Stage::MetadataReady, StageEvent::BeginPrepare) => Ok(Stage::Preparing),
            (Stage::Preparing, StageEvent::Prepared) => Ok(Stage::ReceivingBlocks),
            (Stage::ReceivingBlocks, StageEvent::Chunk) => Ok(Stage::ReceivingBlocks),
            (Stage::ReceivingBlocks, StageEvent::BeginVerify) => Ok(Stage::Verifying),
            (Stage::Verifying, StageEvent::Verified) => Ok(Stage::ReadyToBoot),
            _ => Err(UpdateError::new(UpdateErrorKind::InvalidStage)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// What the master announces before sending an image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageMetadata {
    pub image_bytes: u32,
    pub crc: u16,
    pub image_type: u8,
    pub bank: u8,
    pub version: u16,
}

/// State of the transfer in flight.
///
/// `T` is the storage backend's write session. It is present only between
/// a successful prepare and the commit or discard that ends the transfer.
pub struct UpdateContext<T> {
    pub(crate) stage: Stage,
    pub(crate) expected_size: u32,
    pub(crate) received_bytes: u32,
    pub(crate) chunk_base: u32,
    pub(crate) expected_crc: u16,
    pub(crate) expected_version: u16,
    pub(crate) running_crc: u16,
    pub(crate) target_bank: BankId,
    pub(crate) image_type: u8,
    pub(crate) metadata_received: bool,
    pub(crate) flash_prepared: bool,
    pub(crate) crc_matched: bool,
    pub(crate) session: Option<T>,
}

impl<T> UpdateContext<T> {
    pub fn new() -> Self {
        Self {
            stage: Stage::Idle,
            expected_size: 0,
            received_bytes: 0,
            chunk_base: 0,
            expected_crc: 0,
            expected_version: 0,
            running_crc: CRC16_SEED,
            target_bank: 0,
            image_type: 0,
            metadata_received: false,
            flash_prepared: false,
            crc_matched: false,
            session: None,
        }
    }

    /// Starts over for `meta` and hands back whatever session was open so
    /// the caller can discard it.
    pub(crate) fn restart_for(&mut self, meta: &ImageMetadata) -> Option<T> {
        let previous = self.session.take();
        *self = Self {
            stage: Stage::MetadataReady,
            expected_size: meta.image_bytes,
            expected_crc: meta.crc,
            expected_version: meta.version,
            target_bank: meta.bank,
            image_type: meta.image_type,
            metadata_received: true,
            ..Self::new()
        };
        previous
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    pub fn chunk_base(&self) -> u32 {
        self.chunk_base
    }

    pub fn expected_crc(&self) -> u16 {
        self.expected_crc
    }

    pub fn expected_version(&self) -> u16 {
        self.expected_version
    }

    pub fn running_crc(&self) -> u16 {
        self.running_crc
    }

    pub fn target_bank(&self) -> BankId {
        self.target_bank
    }

    pub fn image_type(&self) -> u8 {
        self.image_type
    }

    pub fn metadata_received(&self) -> bool {
        self.metadata_received
    }

    pub fn flash_prepared(&self) -> bool {
        self.flash_prepared
    }

    pub fn crc_matched(&self) -> bool {
        self.crc_matched
    }

    pub fn session_open(&self) -> bool {
        self.session.is_some()
    }

    /// The metadata this transfer was started with.
    pub fn metadata(&self) -> Option<ImageMetadata> {
        if !self.metadata_received {
            return None;
        }
        Some(ImageMetadata {
            image_bytes: self.expected_size,
            crc: self.expected_crc,
            image_type: self.image_type,
            bank: self.target_bank,
            version: self.expected_version,
        })
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            stage: self.stage,
            metadata_received: self.metadata_received,
            flash_prepared: self.flash_prepared,
            expected_size: self.expected_size,
            received_bytes: self.received_bytes,
            expected_crc: self.expected_crc,
            running_crc: self.running_crc,
            crc_matched: self.crc_matched,
            target_bank: self.target_bank,
        }
    }
}

impl<T> Default for UpdateContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the context fields a status query or a log line needs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContextSnapshot {
    pub stage: Stage,
    pub metadata_received: bool,
    pub flash_prepared: bool,
    pub expected_size: u32,
    pub received_bytes: u32,
    pub expected_crc: u16,
    pub running_crc: u16,
    pub crc_matched: bool,
    pub target_bank: BankId,
}

impl ContextSnapshot {
    pub fn log(&self) {
        info!("--- firmware update context ---");
        info!(" stage          : {}", self.stage);
        info!(" metadata ready : {}", self.metadata_received);
        info!(" flash prepared : {}", self.flash_prepared);
        info!(" expected size  : {} bytes", self.expected_size);
        info!(" received bytes : {} bytes", self.received_bytes);
        info!(" expected crc   : {:#x}", self.expected_crc);
        info!(" running crc    : {:#x}", self.running_crc);
        info!(" crc matched    : {}", self.crc_matched);
        info!(" target bank    : {}", self.target_bank);
    }
}
