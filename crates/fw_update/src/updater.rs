use crate::context::{ContextSnapshot, ImageMetadata, Stage, StageEvent, UpdateContext};
use crate::crc::crc16_update;
use crate::record::PersistentRecord;
use crate::{BankId, BankStorage, RecordStore, RestartScheduler, UpdateError, UpdateErrorKind};

pub const DEFAULT_MAX_IMAGE_BYTES: u32 = 512 * 1024;
pub const DEFAULT_RESTART_DELAY_MS: u32 = 500;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UpdateConfig {
    /// Largest image a master may announce.
    pub max_image_size: u32,
    /// Delay between a successful finalize and the restart.
    pub restart_delay_ms: u32,
    /// Version reported when no verified record exists yet.
    pub factory_version: u16,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_image_size: DEFAULT_MAX_IMAGE_BYTES,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            factory_version: 0,
        }
    }
}

/// How accepted metadata related to the transfer that was in flight.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Admission {
    Fresh,
    /// A prepared or partly received transfer was thrown away.
    Restarted {
        discarded_bytes: u32,
        previous_stage: Stage,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunningSource {
    /// Read from the verified record.
    Record,
    /// Measured from the running bank.
    Scanned,
    Unknown,
}

/// What the device reports about the firmware it is executing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunningFirmware {
    pub crc: u16,
    pub version: u16,
    pub source: RunningSource,
}

/// Drives one firmware transfer at a time through metadata, prepare,
/// chunks and finalize.
///
/// Every operation either succeeds or returns an error and leaves the
/// context as it was, apart from the documented exceptions in
/// [`finalize`](Updater::finalize).
pub struct Updater<S: BankStorage, R: RecordStore, T: RestartScheduler> {
    storage: S,
    records: R,
    restart: T,
    config: UpdateConfig,
    ctx: UpdateContext<S::Session>,
    running: RunningFirmware,
    restart_scheduled: bool,
}

impl<S: BankStorage, R: RecordStore, T: RestartScheduler> Updater<S, R, T> {
    /// Builds the updater and works out what firmware is running.
    ///
    /// A stored record wins. Without one the running bank is scanned for
    /// its CRC and the version falls back to `config.factory_version`.
    pub fn new(mut storage: S, mut records: R, restart: T, config: UpdateConfig) -> Self {
        let running = match records.load() {
            Ok(Some(record)) => {
                info!(
                    "running firmware from record: crc {:#x}, version {}",
                    record.verified_crc,
                    record.verified_version
                );
                RunningFirmware {
                    crc: record.verified_crc,
                    version: record.verified_version,
                    source: RunningSource::Record,
                }
            }
            loaded => {
                if let Err(e) = loaded {
                    warn!("verified record unreadable: {}", e.kind());
                }
                match storage.running_image_crc() {
                    Ok(crc) => {
                        info!("running firmware scanned: crc {:#x}", crc);
                        RunningFirmware {
                            crc,
                            version: config.factory_version,
                            source: RunningSource::Scanned,
                        }
                    }
                    Err(e) => {
                        warn!("running image scan failed: {}", e.kind());
                        RunningFirmware {
                            crc: 0,
                            version: config.factory_version,
                            source: RunningSource::Unknown,
                        }
                    }
                }
            }
        };

        Self {
            storage,
            records,
            restart,
            config,
            ctx: UpdateContext::new(),
            running,
            restart_scheduled: false,
        }
    }

    /// Validates an announced image and starts a new transfer for it.
    ///
    /// Accepted in every stage. Whatever transfer was in progress is
    /// dropped and its write session discarded.
    #[track_caller]
    pub fn submit_metadata(&mut self, meta: ImageMetadata) -> Result<Admission, UpdateError> {
        if meta.image_bytes == 0 || meta.image_bytes > self.config.max_image_size || meta.crc == 0 {
            warn!(
                "metadata rejected: size {} (max {}), crc {:#x}",
                meta.image_bytes,
                self.config.max_image_size,
                meta.crc
            );
            return Err(UpdateError::new(UpdateErrorKind::InvalidMetadata));
        }

        let previous_stage = self.ctx.stage;
        let discarded_bytes = self.ctx.received_bytes;
        let next = previous_stage.advance(StageEvent::Metadata)?;

        if let Some(session) = self.ctx.restart_for(&meta) {
            self.storage.discard(session);
        }
        self.ctx.stage = next;

        let admission = match previous_stage {
            Stage::Preparing | Stage::ReceivingBlocks | Stage::Verifying => {
                warn!(
                    "transfer restarted from {}, {} bytes discarded",
                    previous_stage,
                    discarded_bytes
                );
                Admission::Restarted {
                    discarded_bytes,
                    previous_stage,
                }
            }
            Stage::Idle | Stage::MetadataReady | Stage::ReadyToBoot => Admission::Fresh,
        };

        info!(
            "metadata accepted: size {}, crc {:#x}, version {}, bank {}, type {}",
            meta.image_bytes,
            meta.crc,
            meta.version,
            meta.bank,
            meta.image_type
        );
        Ok(admission)
    }

    /// Opens a write session on the bank that will receive the image.
    #[track_caller]
    pub fn prepare_storage(&mut self) -> Result<BankId, UpdateError> {
        let preparing = self.ctx.stage.advance(StageEvent::BeginPrepare).inspect_err(|_| {
            warn!("prepare refused in stage {}", self.ctx.stage);
        })?;
        let receiving = preparing.advance(StageEvent::Prepared)?;

        let size = self.ctx.expected_size;
        let bank = self.storage.select_target(size).inspect_err(|e| {
            error!("no target bank for {} bytes: {}", size, e.kind());
        })?;
        if bank != self.ctx.target_bank {
            info!("advertised bank {} ignored, writing bank {}", self.ctx.target_bank, bank);
        }

        self.ctx.stage = preparing;
        let session = match self.storage.begin_session(bank, size) {
            Ok(session) => session,
            Err(e) => {
                error!("bank {} could not be opened: {}", bank, e.kind());
                self.ctx.stage = Stage::MetadataReady;
                return Err(e);
            }
        };

        self.ctx.session = Some(session);
        self.ctx.target_bank = bank;
        self.ctx.flash_prepared = true;
        self.ctx.stage = receiving;
        info!("bank {} prepared for {} bytes", bank, size);
        Ok(bank)
    }

    /// Appends `data` at absolute image `offset`, which must equal the
    /// number of bytes received so far. Returns the new total.
    #[track_caller]
    pub fn receive_chunk(&mut self, data: &[u8], offset: u32) -> Result<u32, UpdateError> {
        let next = self.ctx.stage.advance(StageEvent::Chunk)?;
        if !self.ctx.flash_prepared {
            return Err(UpdateError::new(UpdateErrorKind::NotPrepared));
        }
        let Some(session) = self.ctx.session.as_mut() else {
            return Err(UpdateError::new(UpdateErrorKind::NotPrepared));
        };
        if data.is_empty() {
            return Err(UpdateError::new(UpdateErrorKind::EmptyChunk));
        }
        let received = self.ctx.received_bytes;
        if offset != received {
            warn!("chunk at offset {} rejected, expected {}", offset, received);
            return Err(UpdateError::new(UpdateErrorKind::OffsetMismatch));
        }
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| received.checked_add(len))
            .filter(|&end| end <= self.ctx.expected_size)
            .ok_or_else(|| {
                warn!(
                    "chunk of {} bytes at {} overruns image of {} bytes",
                    data.len(),
                    offset,
                    self.ctx.expected_size
                );
                UpdateError::new(UpdateErrorKind::Overflow)
            })?;

        self.storage.write(session, data).inspect_err(|e| {
            error!("write of {} bytes at {} failed: {}", data.len(), offset, e.kind());
        })?;

        self.ctx.running_crc = crc16_update(self.ctx.running_crc, data);
        self.ctx.received_bytes = end;
        self.ctx.stage = next;
        debug!(
            "chunk at {} accepted: {}/{} bytes, crc {:#x}",
            offset,
            end,
            self.ctx.expected_size,
            self.ctx.running_crc
        );
        Ok(end)
    }

    /// Accepts one delivery of a logical write that may arrive in pieces.
    ///
    /// `delivery_offset` counts from the start of the logical write. The
    /// first delivery (offset 0) anchors it at the current received total.
    #[track_caller]
    pub fn receive_segment(&mut self, data: &[u8], delivery_offset: u32) -> Result<u32, UpdateError> {
        self.ctx.stage.advance(StageEvent::Chunk)?;
        let base = if delivery_offset == 0 {
            self.ctx.received_bytes
        } else {
            self.ctx.chunk_base
        };
        let offset = base
            .checked_add(delivery_offset)
            .ok_or(UpdateError::new(UpdateErrorKind::Overflow))?;
        let received = self.receive_chunk(data, offset)?;
        self.ctx.chunk_base = base;
        Ok(received)
    }

    /// Checks the complete image against both CRCs and makes it bootable.
    ///
    /// On a CRC mismatch the session is discarded and the stage stays
    /// `Verifying` until new metadata arrives. On a commit failure nothing
    /// becomes bootable. A record that cannot be saved after a successful
    /// commit is only logged.
    #[track_caller]
    pub fn finalize(&mut self, declared_crc: u16) -> Result<PersistentRecord, UpdateError> {
        let verifying = self.ctx.stage.advance(StageEvent::BeginVerify).inspect_err(|_| {
            warn!("finalize refused in stage {}", self.ctx.stage);
        })?;
        let ready = verifying.advance(StageEvent::Verified)?;
        if self.ctx.session.is_none() {
            return Err(UpdateError::new(UpdateErrorKind::NotPrepared));
        }
        if self.ctx.received_bytes != self.ctx.expected_size {
            warn!(
                "finalize with {}/{} bytes",
                self.ctx.received_bytes,
                self.ctx.expected_size
            );
            return Err(UpdateError::new(UpdateErrorKind::SizeMismatch));
        }

        self.ctx.stage = verifying;
        let crc = self.ctx.running_crc;
        let Some(session) = self.ctx.session.take() else {
            return Err(UpdateError::new(UpdateErrorKind::NotPrepared));
        };
        self.ctx.flash_prepared = false;

        if crc != declared_crc || crc != self.ctx.expected_crc {
            error!(
                "crc mismatch: computed {:#x}, declared {:#x}, advertised {:#x}",
                crc,
                declared_crc,
                self.ctx.expected_crc
            );
            self.storage.discard(session);
            self.log_context();
            return Err(UpdateError::new(UpdateErrorKind::CrcMismatch));
        }

        let bank = match self.storage.commit(session) {
            Ok(bank) => bank,
            Err(e) => {
                error!("commit failed: {}", e.kind());
                self.log_context();
                return Err(e);
            }
        };
        if let Err(e) = self.storage.set_boot_bank(bank) {
            error!("bank {} could not be made bootable: {}", bank, e.kind());
            self.log_context();
            return Err(e);
        }

        self.ctx.crc_matched = true;
        self.ctx.stage = ready;
        info!("image verified: crc {:#x}, booting bank {} next", crc, bank);

        let record = PersistentRecord {
            verified_crc: crc,
            verified_version: self.ctx.expected_version,
        };
        if let Err(e) = self.records.save(&record) {
            warn!("verified record not saved: {}", e.kind());
        }

        self.schedule_restart();
        Ok(record)
    }

    fn schedule_restart(&mut self) {
        if self.restart_scheduled {
            debug!("restart already pending");
            return;
        }
        self.restart_scheduled = true;
        info!("restart in {} ms", self.config.restart_delay_ms);
        self.restart.schedule_restart(self.config.restart_delay_ms);
    }

    pub fn context(&self) -> &UpdateContext<S::Session> {
        &self.ctx
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.ctx.snapshot()
    }

    pub fn log_context(&self) {
        self.ctx.snapshot().log();
    }

    pub fn running_firmware(&self) -> RunningFirmware {
        self.running
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn restart_scheduled(&self) -> bool {
        self.restart_scheduled
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn records(&self) -> &R {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut R {
        &mut self.records
    }

    pub fn restart(&self) -> &T {
        &self.restart
    }

    /// Gives back the backends. An open session is discarded first.
    pub fn into_parts(mut self) -> (S, R, T) {
        if let Some(session) = self.ctx.session.take() {
            self.storage.discard(session);
        }
        (self.storage, self.records, self.restart)
    }
}
