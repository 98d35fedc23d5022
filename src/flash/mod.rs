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

//! Two-slot firmware storage: slot and boot-state types, the driver contract
//! used by the update pipeline and the NOR-flash implementation of it.

mod nor_slots;
mod ram_flash;
pub(crate) mod state_record;

use core::fmt;
use core::ops::Range;

use crc::{CRC_32_ISO_HDLC, Crc};
use log::error;

use crate::error::OtaError;

pub use nor_slots::NorFlashSlots;
pub use ram_flash::RamFlash;
pub use state_record::{BootRecord, SlotRecord};

/// Checksum over slot contents for [`ImageCheck::Crc32`].
pub(crate) static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn round_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Slot> {
        match index {
            0 => Some(Slot::A),
            1 => Some(Slot::B),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Per-slot tag kept by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootState {
    /// Erased or never written; not bootable
    Empty = 0,
    /// Freshly written, waits for the first-boot self-test
    PendingVerify = 1,
    Valid = 2,
    /// Rejected by the self-test or by an explicit rollback
    Invalid = 3,
    /// Pending image that never confirmed itself
    Aborted = 4,
    /// Image of unknown provenance, e.g. the factory image
    Undefined = 5,
}

impl BootState {
    /// Whether the bootloader may fall back to a slot in this state.
    pub fn is_fallback(self) -> bool {
        matches!(self, BootState::Valid | BootState::Undefined)
    }

    pub fn from_u8(value: u8) -> Option<BootState> {
        match value {
            0 => Some(BootState::Empty),
            1 => Some(BootState::PendingVerify),
            2 => Some(BootState::Valid),
            3 => Some(BootState::Invalid),
            4 => Some(BootState::Aborted),
            5 => Some(BootState::Undefined),
            _ => None,
        }
    }
}

/// Expected image size passed to [`FlashPartitionDriver::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    Unknown,
    Bytes(u32),
}

/// The slot writer's own integrity check over the written image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageCheck {
    Disabled = 0,
    /// CRC-32 of the image, checked by the boot-slot selector
    Crc32 = 1,
}

impl ImageCheck {
    pub fn from_u8(value: u8) -> Option<ImageCheck> {
        match value {
            0 => Some(ImageCheck::Disabled),
            1 => Some(ImageCheck::Crc32),
            _ => None,
        }
    }
}

/// An open write session on the inactive slot.
///
/// Obtained from [`FlashPartitionDriver::begin`] and consumed by exactly one
/// [`FlashPartitionDriver::end`]. Once a write fails the handle stays failed and
/// can only be ended without commit.
#[derive(Debug)]
pub struct SlotHandle {
    pub slot: Slot,
    /// Offset of the next byte within the slot
    pub offset: u32,
    pub size_hint: SizeHint,
    pub failed: bool,
}

impl SlotHandle {
    pub fn new(slot: Slot, size_hint: SizeHint) -> Self {
        Self {
            slot,
            offset: 0,
            size_hint,
            failed: false,
        }
    }
}

/// Location of the boot-state sectors and of the two slots in flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub state: Range<u32>,
    pub slots: [Range<u32>; 2],
}

impl PartitionLayout {
    /// Lays out two state sectors followed by two slots of `slot_size` bytes.
    pub fn contiguous(base: u32, erase_size: u32, slot_size: u32) -> Self {
        let state = base..base + 2 * erase_size;
        let a = state.end..state.end + slot_size;
        let b = a.end..a.end + slot_size;
        Self {
            state,
            slots: [a, b],
        }
    }

    pub fn slot(&self, slot: Slot) -> Range<u32> {
        self.slots[slot.index()].clone()
    }

    pub fn slot_size(&self) -> u32 {
        self.slots[0].end - self.slots[0].start
    }

    /// Checks the layout against the flash geometry.
    pub fn validate(&self, erase_size: usize, capacity: usize) -> Result<(), OtaError> {
        let erase_size = erase_size as u32;
        let aligned = |r: &Range<u32>| r.start % erase_size == 0 && r.end % erase_size == 0;
        let in_bounds = |r: &Range<u32>| r.start < r.end && r.end as usize <= capacity;
        let overlaps = |a: &Range<u32>, b: &Range<u32>| a.start < b.end && b.start < a.end;

        let ranges = [&self.state, &self.slots[0], &self.slots[1]];
        if ranges.iter().any(|r| !aligned(r) || !in_bounds(r)) {
            error!("Partition layout is not erase aligned or exceeds the flash: {:?}", self);
            return Err(OtaError::InvalidArg);
        }
        if self.state.end - self.state.start < 2 * erase_size {
            error!("Boot state needs at least two erase sectors");
            return Err(OtaError::InvalidArg);
        }
        if self.slots[0].end - self.slots[0].start != self.slots[1].end - self.slots[1].start {
            error!("Slots must be the same size");
            return Err(OtaError::InvalidArg);
        }
        if overlaps(&self.state, &self.slots[0])
            || overlaps(&self.state, &self.slots[1])
            || overlaps(&self.slots[0], &self.slots[1])
        {
            error!("Partition ranges overlap: {:?}", self);
            return Err(OtaError::InvalidArg);
        }
        Ok(())
    }
}

/// Restarts the device. On hardware this does not return.
pub trait Reboot {
    fn reboot(&mut self);
}

impl<R: Reboot + ?Sized> Reboot for &mut R {
    fn reboot(&mut self) {
        (**self).reboot()
    }
}

/// Slot-level operations the update pipeline and the boot-state controller
/// rely on.
pub trait FlashPartitionDriver {
    /// Slot the current firmware was loaded from.
    fn running_slot(&self) -> Slot;

    fn slot_state(&self, slot: Slot) -> BootState;

    fn running_slot_state(&self) -> BootState {
        self.slot_state(self.running_slot())
    }

    /// Slot the bootloader will pick first on the next boot.
    fn boot_slot(&self) -> Slot;

    fn slot_capacity(&self) -> u32;

    /// Length of the image last committed to `slot`, if known.
    fn image_len(&self, _slot: Slot) -> Option<u32> {
        None
    }

    /// Opens the inactive slot for writing. Never selects the running slot.
    fn begin(&mut self, size_hint: SizeHint, check: ImageCheck) -> Result<SlotHandle, OtaError>;

    /// Appends `data` to the slot; either all bytes are accepted or it fails.
    fn write(&mut self, handle: &mut SlotHandle, data: &[u8]) -> Result<usize, OtaError>;

    /// Finishes the session. `commit` marks the slot `PendingVerify` and points
    /// the next boot at it, otherwise the slot is discarded.
    fn end(&mut self, handle: SlotHandle, commit: bool) -> Result<(), OtaError>;

    fn set_active(&mut self, slot: Slot) -> Result<(), OtaError>;

    /// Confirms the running image.
    fn mark_valid(&mut self) -> Result<(), OtaError>;

    /// Marks the running image invalid and reboots into the other slot.
    fn mark_invalid_and_reboot(&mut self) -> Result<(), OtaError>;
}
