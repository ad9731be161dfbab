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
        clippy::panicking_unwrap,
        clippy::unwrap_in_result,
    )
)]

//! Board side of the firmware update: NOR flash banks and record slots,
//! the restart task and the mutex that serializes object writes.

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

pub mod flash_banks;
pub mod flash_record;
pub mod layout;
pub mod restart;
pub mod running_image;
pub mod shared;

#[cfg(test)]
mod mock_flash;

pub use flash_banks::{FlashBanks, FlashSession};
pub use flash_record::FlashRecordStore;
pub use restart::{RestartSignal, restart_task};
pub use shared::{SharedServer, handle_read, handle_write};
