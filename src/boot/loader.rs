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

//! Boot-time slot selection, the bootloader's half of the boot-state machine.

use alloc::vec;

use embedded_storage::nor_flash::{MultiwriteNorFlash, NorFlash, NorFlashError};
use log::{error, info, warn};

use crate::error::OtaError;
use crate::flash::state_record::{BootRecord, SlotRecord};
use crate::flash::{BootState, CRC32, ImageCheck, PartitionLayout, Slot, round_up};

const CHECK_CHUNK: usize = 256;

/// Picks the slot to start and records the decision.
///
/// The boot pointer is followed when it names a `Valid` or `Undefined` slot. A
/// `PendingVerify` slot is started exactly once: it is flagged as attempted
/// here and has to confirm itself before the next reset, otherwise it is
/// marked `Aborted` and the other bootable slot is used. Slots whose recorded
/// CRC does not match their contents are never started.
pub fn select_boot_slot<F: MultiwriteNorFlash>(flash: &mut F, layout: &PartitionLayout) -> Result<Slot, OtaError> {
    layout.validate(F::ERASE_SIZE, flash.capacity())?;
    let original = BootRecord::load(flash, layout)?;
    let mut record = original;

    let preferred = record.boot_slot;
    let chosen = if attempt(flash, layout, &mut record, preferred)? {
        Some(preferred)
    } else {
        let fallback = preferred.other();
        if record.slot(fallback).state.is_fallback() && attempt(flash, layout, &mut record, fallback)? {
            warn!("Falling back to slot {}", fallback);
            Some(fallback)
        } else {
            None
        }
    };

    if let Some(slot) = chosen {
        record.boot_slot = slot;
    }
    if record != original {
        record.store(flash, layout)?;
    }

    match chosen {
        Some(slot) => {
            info!("Booting slot {} ({:?})", slot, record.slot(slot).state);
            Ok(slot)
        }
        None => {
            error!("No bootable image in either slot");
            Err(OtaError::InvalidState)
        }
    }
}

fn attempt<F: NorFlash>(
    flash: &mut F,
    layout: &PartitionLayout,
    record: &mut BootRecord,
    slot: Slot,
) -> Result<bool, OtaError> {
    let entry = *record.slot(slot);
    match entry.state {
        BootState::Valid | BootState::Undefined => {
            if image_intact(flash, layout, slot, &entry)? {
                return Ok(true);
            }
            warn!("Image in slot {} is corrupt", slot);
            record.slot_mut(slot).state = BootState::Invalid;
            Ok(false)
        }
        BootState::PendingVerify if !entry.attempted => {
            if image_intact(flash, layout, slot, &entry)? {
                info!("Trying new image in slot {}", slot);
                record.slot_mut(slot).attempted = true;
                return Ok(true);
            }
            warn!("New image in slot {} is corrupt", slot);
            record.slot_mut(slot).state = BootState::Aborted;
            Ok(false)
        }
        BootState::PendingVerify => {
            warn!("Image in slot {} did not confirm itself", slot);
            record.slot_mut(slot).state = BootState::Aborted;
            Ok(false)
        }
        _ => Ok(false),
    }
}

fn image_intact<F: NorFlash>(
    flash: &mut F,
    layout: &PartitionLayout,
    slot: Slot,
    entry: &SlotRecord,
) -> Result<bool, OtaError> {
    if entry.check != ImageCheck::Crc32 {
        return Ok(true);
    }

    let range = layout.slot(slot);
    if entry.image_len > range.end - range.start {
        return Ok(false);
    }

    let mut buf = vec![0u8; round_up(CHECK_CHUNK, F::READ_SIZE)];
    let mut digest = CRC32.digest();
    let mut offset = 0u32;
    while offset < entry.image_len {
        let want = ((entry.image_len - offset) as usize).min(buf.len());
        let read_len = round_up(want, F::READ_SIZE);
        flash
            .read(range.start + offset, &mut buf[..read_len])
            .map_err(|e| OtaError::from(e.kind()))?;
        digest.update(&buf[..want]);
        offset += want as u32;
    }
    Ok(digest.finalize() == entry.image_crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashPartitionDriver, NorFlashSlots, SizeHint};
    use crate::test_support::{RebootLog, TestFlash, power_cycle, test_layout};

    fn blank_slots() -> NorFlashSlots<TestFlash, RebootLog> {
        let flash = TestFlash::new(test_layout().slots[1].end as usize);
        NorFlashSlots::mount(flash, test_layout(), Slot::A, RebootLog::default()).unwrap()
    }

    fn commit(slots: &mut NorFlashSlots<TestFlash, RebootLog>, image: &[u8], check: ImageCheck) {
        let mut handle = slots.begin(SizeHint::Unknown, check).unwrap();
        slots.write(&mut handle, image).unwrap();
        slots.end(handle, true).unwrap();
    }

    #[test]
    fn blank_device_boots_factory_slot() {
        let mut flash = TestFlash::new(test_layout().slots[1].end as usize);
        assert_eq!(select_boot_slot(&mut flash, &test_layout()), Ok(Slot::A));
        // Nothing changed, nothing written.
        assert_eq!(flash.write_calls(), 0);
    }

    #[test]
    fn pending_image_gets_exactly_one_attempt() {
        let mut slots = blank_slots();
        commit(&mut slots, b"new image", ImageCheck::Disabled);

        let slots = power_cycle(slots);
        assert_eq!(slots.running_slot(), Slot::B);
        assert!(slots.record().slot(Slot::B).attempted);

        // Reset before the image confirmed itself.
        let slots = power_cycle(slots);
        assert_eq!(slots.running_slot(), Slot::A);
        assert_eq!(slots.slot_state(Slot::B), BootState::Aborted);
        assert_eq!(slots.boot_slot(), Slot::A);
    }

    #[test]
    fn confirmed_image_keeps_booting() {
        let mut slots = blank_slots();
        commit(&mut slots, b"new image", ImageCheck::Disabled);
        let mut slots = power_cycle(slots);
        slots.mark_valid().unwrap();

        for _ in 0..3 {
            slots = power_cycle(slots);
            assert_eq!(slots.running_slot(), Slot::B);
            assert_eq!(slots.running_slot_state(), BootState::Valid);
        }
    }

    #[test]
    fn invalidated_slot_falls_back() {
        let mut slots = blank_slots();
        commit(&mut slots, b"new image", ImageCheck::Disabled);
        let mut slots = power_cycle(slots);
        slots.mark_valid().unwrap();
        slots.mark_invalid_and_reboot().unwrap();

        let slots = power_cycle(slots);
        assert_eq!(slots.running_slot(), Slot::A);
        assert_eq!(slots.slot_state(Slot::B), BootState::Invalid);
    }

    #[test]
    fn crc_mismatch_blocks_boot() {
        let mut slots = blank_slots();
        commit(&mut slots, b"checked image", ImageCheck::Crc32);
        let (mut flash, reboot) = slots.into_parts();
        let b = test_layout().slots[1].start as usize;
        flash.as_mut_bytes()[b + 3] ^= 0x40;
        let slots = NorFlashSlots::mount(flash, test_layout(), Slot::A, reboot).unwrap();

        let slots = power_cycle(slots);
        assert_eq!(slots.running_slot(), Slot::A);
        assert_eq!(slots.slot_state(Slot::B), BootState::Aborted);
    }

    #[test]
    fn intact_crc_image_boots() {
        let mut slots = blank_slots();
        let image = alloc::vec![0x5Au8; 1000];
        commit(&mut slots, &image, ImageCheck::Crc32);
        let slots = power_cycle(slots);
        assert_eq!(slots.running_slot(), Slot::B);
    }

    #[test]
    fn nothing_bootable_is_an_error() {
        let layout = test_layout();
        let mut flash = TestFlash::new(layout.slots[1].end as usize);
        let mut record = BootRecord::default();
        record.slot_mut(Slot::A).state = BootState::Invalid;
        record.store(&mut flash, &layout).unwrap();

        assert_eq!(select_boot_slot(&mut flash, &layout), Err(OtaError::InvalidState));
    }
}
