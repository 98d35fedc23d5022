// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Persistent boot record.
//!
//! The whole record is one item of a `sequential-storage` map living in the
//! state sectors, so every update replaces the tags of both slots and the boot
//! pointer at once. Items are checksummed and appended; losing power while a
//! record is being written leaves the previous record in force.

use embassy_embedded_hal::adapter::BlockingAsync;
use embassy_futures::block_on;
use embedded_storage::nor_flash::{MultiwriteNorFlash, NorFlashError};
use log::{debug, warn};
use sequential_storage::cache::NoCache;
use sequential_storage::map::{self, SerializationError, Value};

use crate::error::OtaError;
use crate::flash::{BootState, ImageCheck, PartitionLayout, Slot};

const BOOT_RECORD_KEY: u16 = 0;
const RECORD_VERSION: u8 = 1;
const SLOT_RECORD_LEN: usize = 12;
const RECORD_LEN: usize = 6 + 2 * SLOT_RECORD_LEN;
const DATA_BUFFER_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRecord {
    pub state: BootState,
    /// Set by the bootloader when it starts a `PendingVerify` image
    pub attempted: bool,
    pub check: ImageCheck,
    pub image_len: u32,
    pub image_crc: u32,
}

impl SlotRecord {
    pub const fn new(state: BootState) -> Self {
        Self {
            state,
            attempted: false,
            check: ImageCheck::Disabled,
            image_len: 0,
            image_crc: 0,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.state as u8;
        out[1] = self.attempted as u8;
        out[2] = self.check as u8;
        out[3] = 0;
        out[4..8].copy_from_slice(&self.image_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.image_crc.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            state: BootState::from_u8(bytes[0])?,
            attempted: bytes[1] != 0,
            check: ImageCheck::from_u8(bytes[2])?,
            image_len: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            image_crc: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord {
    /// Number of times the record has been stored, wrapping
    pub seq: u32,
    pub boot_slot: Slot,
    pub slots: [SlotRecord; 2],
}

impl Default for BootRecord {
    /// A device that has never been updated: slot A holds the factory image.
    fn default() -> Self {
        Self {
            seq: 0,
            boot_slot: Slot::A,
            slots: [
                SlotRecord::new(BootState::Undefined),
                SlotRecord::new(BootState::Empty),
            ],
        }
    }
}

impl Value<'_> for BootRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < RECORD_LEN {
            return Err(SerializationError::BufferTooSmall);
        }

        buffer[0] = RECORD_VERSION;
        buffer[1] = self.boot_slot.index() as u8;
        buffer[2..6].copy_from_slice(&self.seq.to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let start = 6 + i * SLOT_RECORD_LEN;
            slot.encode(&mut buffer[start..start + SLOT_RECORD_LEN]);
        }
        Ok(RECORD_LEN)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        if buffer.len() < RECORD_LEN {
            return Err(SerializationError::BufferTooSmall);
        }
        if buffer[0] != RECORD_VERSION {
            return Err(SerializationError::InvalidFormat);
        }

        let slot_at = |i: usize| {
            let start = 6 + i * SLOT_RECORD_LEN;
            SlotRecord::decode(&buffer[start..start + SLOT_RECORD_LEN]).ok_or(SerializationError::InvalidFormat)
        };
        Ok(Self {
            seq: u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]),
            boot_slot: Slot::from_index(buffer[1]).ok_or(SerializationError::InvalidFormat)?,
            slots: [slot_at(0)?, slot_at(1)?],
        })
    }
}

impl BootRecord {
    pub fn slot(&self, slot: Slot) -> &SlotRecord {
        &self.slots[slot.index()]
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut SlotRecord {
        &mut self.slots[slot.index()]
    }

    /// Reads the current record, or the factory default if none was stored.
    pub fn load<F: MultiwriteNorFlash>(flash: &mut F, layout: &PartitionLayout) -> Result<Self, OtaError> {
        let mut data_buffer = [0u8; DATA_BUFFER_SIZE];
        let mut storage = BlockingAsync::new(flash);

        let stored: Option<BootRecord> = block_on(map::fetch_item(
            &mut storage,
            layout.state.clone(),
            &mut NoCache::new(),
            &mut data_buffer,
            &BOOT_RECORD_KEY,
        ))
        .map_err(storage_error)?;

        Ok(stored.unwrap_or_else(|| {
            debug!("No boot record found, using factory defaults");
            BootRecord::default()
        }))
    }

    /// Stores the record as the next version. `self` is only updated once the
    /// write went through.
    pub fn store<F: MultiwriteNorFlash>(&mut self, flash: &mut F, layout: &PartitionLayout) -> Result<(), OtaError> {
        let next = BootRecord {
            seq: self.seq.wrapping_add(1),
            ..*self
        };
        let mut data_buffer = [0u8; DATA_BUFFER_SIZE];
        let mut storage = BlockingAsync::new(flash);

        block_on(map::store_item(
            &mut storage,
            layout.state.clone(),
            &mut NoCache::new(),
            &mut data_buffer,
            &BOOT_RECORD_KEY,
            &next,
        ))
        .map_err(storage_error)?;

        debug!(
            "Boot record {} stored: boot {}, A {:?}, B {:?}",
            next.seq, next.boot_slot, next.slots[0].state, next.slots[1].state
        );
        *self = next;
        Ok(())
    }
}

fn storage_error<E: NorFlashError>(e: sequential_storage::Error<E>) -> OtaError {
    match e {
        sequential_storage::Error::Storage { value, .. } => {
            warn!("Boot record flash access failed: {:?}", value);
            OtaError::from(value.kind())
        }
        other => {
            warn!("Boot record storage failed: {:?}", other);
            OtaError::FlashWrite(-1)
        }
    }
}
