use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use fw_update::context::ContextSnapshot;
use fw_update::objects::{
    DEFAULT_MAX_CHUNK, METADATA_RECORD_LEN, ObjectError, ObjectServer, WriteOutcome, WriteStream,
};
use fw_update::updater::RunningFirmware;
use fw_update::{BankStorage, RecordStore, RestartScheduler};
use heapless::Vec;

/// The object server as the fieldbus task and diagnostics share it.
pub type SharedServer<S, R, T, const MAX_CHUNK: usize = DEFAULT_MAX_CHUNK> =
    Mutex<CriticalSectionRawMutex, ObjectServer<S, R, T, MAX_CHUNK>>;

/// Applies one segment of an object write while holding the lock, so
/// writes from different callers never interleave.
pub async fn handle_write<S, R, T, const MAX_CHUNK: usize>(
    shared: &SharedServer<S, R, T, MAX_CHUNK>,
    index: u16,
    stream: &mut WriteStream,
    data: &[u8],
) -> Result<WriteOutcome, ObjectError>
where
    S: BankStorage,
    R: RecordStore,
    T: RestartScheduler,
{
    let mut guard = shared.lock().await;
    guard.write(index, stream, data)
}

pub async fn handle_read<S, R, T, const MAX_CHUNK: usize>(
    shared: &SharedServer<S, R, T, MAX_CHUNK>,
    index: u16,
    sub: u8,
) -> Result<Vec<u8, METADATA_RECORD_LEN>, ObjectError>
where
    S: BankStorage,
    R: RecordStore,
    T: RestartScheduler,
{
    shared.lock().await.read(index, sub)
}

pub async fn snapshot<S, R, T, const MAX_CHUNK: usize>(
    shared: &SharedServer<S, R, T, MAX_CHUNK>,
) -> (ContextSnapshot, RunningFirmware)
where
    S: BankStorage,
    R: RecordStore,
    T: RestartScheduler,
{
    let guard = shared.lock().await;
    (guard.updater().snapshot(), guard.updater().running_firmware())
}
